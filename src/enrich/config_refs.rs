//! Config-file references via GitHub code search.
//!
//! For each server, one code-search query per known client config filename:
//! `"<term>" filename:<config>`. The search term is the server's first
//! package identifier, falling back to the server name. Persists the total
//! hit count and up to five sample repositories, excluding the server's own
//! repo. Code search requires a `GITHUB_TOKEN` and has its own quota; the
//! fetcher honours the reset header for this service.

use anyhow::{bail, Result};
use serde::Deserialize;
use sqlx::Row;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};
use crate::models::parse_github_repo;

use super::github::github_headers;
use super::{record_failure, record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "config_refs";

/// Client config filenames that reference MCP servers; all map to tier 1 in
/// backlink scoring.
pub const CONFIG_FILENAMES: &[&str] = &[
    "claude_desktop_config.json",
    "mcp.json",
    "mcp_config.json",
    "cline_mcp_settings.json",
];

pub const MAX_SAMPLE_REPOS: usize = 5;

#[derive(Debug, Deserialize)]
struct CodeSearchResult {
    #[serde(default)]
    total_count: i64,
    #[serde(default)]
    items: Vec<CodeSearchItem>,
}

#[derive(Debug, Deserialize)]
struct CodeSearchItem {
    #[serde(default)]
    repository: CodeSearchRepo,
}

#[derive(Debug, Default, Deserialize)]
struct CodeSearchRepo {
    #[serde(default)]
    full_name: String,
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    match std::env::var("GITHUB_TOKEN") {
        Ok(token) if !token.is_empty() => {}
        _ => bail!("GITHUB_TOKEN not set; config reference enrichment requires it"),
    }

    let cutoff = ctx.cutoff_days(ctx.config.enrichment.github_refresh_days);

    let rows = sqlx::query(
        r#"
        SELECT s.name, s.repository_url,
               (SELECT sp.identifier FROM server_packages sp
                 WHERE sp.server_name = s.name AND sp.identifier != ''
                 LIMIT 1) AS package_identifier
        FROM servers s
        WHERE (? OR NOT EXISTS (
                SELECT 1 FROM enrichment_status es
                WHERE es.server_name = s.name
                  AND es.enrichment_type = ?
                  AND es.status = 'permanent_failure'))
          AND NOT EXISTS (
                SELECT 1 FROM config_references cr
                WHERE cr.server_name = s.name AND cr.enriched_at >= ?)
        ORDER BY s.name
        "#,
    )
    .bind(ctx.clean)
    .bind(ENRICHMENT_TYPE)
    .bind(&cutoff)
    .fetch_all(ctx.pool)
    .await?;

    let candidates: Vec<(String, String, Option<String>)> = rows
        .iter()
        .map(|r| {
            (
                r.get("name"),
                r.get("repository_url"),
                r.get("package_identifier"),
            )
        })
        .collect();

    let mut stats = WorkerStats::default();
    let mut tx = ctx.pool.begin().await?;
    let delay = Duration::from_millis(ctx.config.enrichment.source_delay_ms);

    'servers: for (server_name, repository_url, package_identifier) in &candidates {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let search_term = package_identifier
            .clone()
            .unwrap_or_else(|| server_name.clone());
        let own_repo = parse_github_repo(repository_url)
            .map(|(owner, repo)| format!("{owner}/{repo}").to_lowercase());

        let mut failed = false;

        for config_type in CONFIG_FILENAMES {
            if ctx.cancel.is_cancelled() {
                break 'servers;
            }

            let query = format!("\"{search_term}\" filename:{config_type}");
            let params = [("q", query), ("per_page", "10".to_string())];
            let outcome = ctx
                .fetcher
                .fetch(
                    "https://api.github.com/search/code",
                    &github_headers(),
                    &params,
                    Service::GitHubSearch,
                    ctx.cancel,
                )
                .await?;

            match outcome {
                FetchOutcome::Response(response) if response.status().is_success() => {
                    let result: CodeSearchResult = match response.json().await {
                        Ok(r) => r,
                        Err(e) => {
                            record_failure(
                                &mut tx,
                                server_name,
                                ENRICHMENT_TYPE,
                                &format!("json decode error: {e}"),
                            )
                            .await?;
                            failed = true;
                            break;
                        }
                    };

                    let samples =
                        sample_repos(&result.items, own_repo.as_deref(), MAX_SAMPLE_REPOS);
                    let samples_json = serde_json::to_string(&samples)?;

                    sqlx::query(
                        r#"
                        INSERT INTO config_references
                            (server_name, search_term, config_type, reference_count, sample_repos, enriched_at)
                        VALUES (?, ?, ?, ?, ?, ?)
                        ON CONFLICT(server_name, config_type) DO UPDATE SET
                            search_term = excluded.search_term,
                            reference_count = excluded.reference_count,
                            sample_repos = excluded.sample_repos,
                            enriched_at = excluded.enriched_at
                        "#,
                    )
                    .bind(server_name)
                    .bind(&search_term)
                    .bind(config_type)
                    .bind(result.total_count)
                    .bind(&samples_json)
                    .bind(db::now_utc())
                    .execute(&mut *tx)
                    .await?;
                }
                FetchOutcome::Response(response) => {
                    let message = format!(
                        "HTTP {} from code search for {server_name}",
                        response.status().as_u16()
                    );
                    record_failure(&mut tx, server_name, ENRICHMENT_TYPE, &message).await?;
                    failed = true;
                    break;
                }
                FetchOutcome::GaveUp => {
                    record_failure(
                        &mut tx,
                        server_name,
                        ENRICHMENT_TYPE,
                        "timeout querying code search after retries",
                    )
                    .await?;
                    failed = true;
                    break;
                }
            }

            if !sleep_cancellable(delay, ctx.cancel).await {
                break 'servers;
            }
        }

        if failed {
            stats.failed += 1;
        } else {
            record_success(&mut tx, server_name, ENRICHMENT_TYPE).await?;
            stats.succeeded += 1;
        }

        stats.processed += 1;
        if stats.processed % ctx.commit_every() == 0 {
            tx.commit().await?;
            tx = ctx.pool.begin().await?;
        }
    }

    tx.commit().await?;
    stats.print("config-refs");
    Ok(())
}

/// Collect up to `max` sample repo names, excluding the server's own repo
/// (case-insensitive) and duplicates.
fn sample_repos(items: &[CodeSearchItem], own_repo: Option<&str>, max: usize) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut samples = Vec::new();

    for item in items {
        let full_name = item.repository.full_name.trim();
        if full_name.is_empty() {
            continue;
        }
        let lower = full_name.to_lowercase();
        if own_repo == Some(lower.as_str()) {
            continue;
        }
        if seen.insert(lower) {
            samples.push(full_name.to_string());
            if samples.len() >= max {
                break;
            }
        }
    }

    samples
}
