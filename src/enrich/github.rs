//! GitHub repository signals.
//!
//! Candidates are servers whose `repository_url` points at a github.com
//! repo and whose signals are missing or older than the refresh window
//! (7 days by default). Persists stars, forks, issue/watcher counts, push
//! and creation timestamps, license, language, topics, and the
//! archived/fork flags.

use anyhow::Result;
use sqlx::Row;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};
use crate::models::{parse_github_repo, GitHubRepo};

use super::{record_failure, record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "github_signals";

/// Authorization and media-type headers for the GitHub REST API. The token
/// is optional for this worker (anonymous quota applies without one).
pub fn github_headers() -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Accept", "application/vnd.github+json".to_string()),
        ("X-GitHub-Api-Version", "2022-11-28".to_string()),
    ];
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.is_empty() {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
    }
    headers
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    let cutoff = ctx.cutoff_days(ctx.config.enrichment.github_refresh_days);

    let rows = sqlx::query(
        r#"
        SELECT s.name, s.repository_url
        FROM servers s
        LEFT JOIN github_signals g ON g.server_name = s.name
        WHERE s.repository_url LIKE '%github.com/%'
          AND (g.server_name IS NULL OR g.enriched_at < ?)
          AND (? OR NOT EXISTS (
                SELECT 1 FROM enrichment_status es
                WHERE es.server_name = s.name
                  AND es.enrichment_type = ?
                  AND es.status = 'permanent_failure'))
        ORDER BY s.name
        "#,
    )
    .bind(&cutoff)
    .bind(ctx.clean)
    .bind(ENRICHMENT_TYPE)
    .fetch_all(ctx.pool)
    .await?;

    let candidates: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r.get("name"), r.get("repository_url")))
        .collect();

    let mut stats = WorkerStats::default();
    let mut tx = ctx.pool.begin().await?;
    let delay = Duration::from_millis(ctx.config.enrichment.github_delay_ms);

    for (server_name, repository_url) in &candidates {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let Some((owner, repo)) = parse_github_repo(repository_url) else {
            record_failure(
                &mut tx,
                server_name,
                ENRICHMENT_TYPE,
                &format!("invalid URL: {repository_url}"),
            )
            .await?;
            stats.processed += 1;
            stats.failed += 1;
            continue;
        };

        let url = format!("https://api.github.com/repos/{owner}/{repo}");
        let outcome = ctx
            .fetcher
            .fetch(&url, &github_headers(), &[], Service::GitHub, ctx.cancel)
            .await?;

        match outcome {
            FetchOutcome::Response(response) if response.status().is_success() => {
                match response.json::<GitHubRepo>().await {
                    Ok(repo_data) => {
                        save_signals(&mut tx, server_name, &repo_data).await?;
                        record_success(&mut tx, server_name, ENRICHMENT_TYPE).await?;
                        stats.succeeded += 1;
                    }
                    Err(e) => {
                        record_failure(
                            &mut tx,
                            server_name,
                            ENRICHMENT_TYPE,
                            &format!("json decode error: {e}"),
                        )
                        .await?;
                        stats.failed += 1;
                    }
                }
            }
            FetchOutcome::Response(response) => {
                let message = format!("HTTP {} fetching {url}", response.status().as_u16());
                record_failure(&mut tx, server_name, ENRICHMENT_TYPE, &message).await?;
                stats.failed += 1;
            }
            FetchOutcome::GaveUp => {
                record_failure(
                    &mut tx,
                    server_name,
                    ENRICHMENT_TYPE,
                    &format!("timeout fetching {url} after retries"),
                )
                .await?;
                stats.failed += 1;
            }
        }

        stats.processed += 1;
        if stats.processed % ctx.commit_every() == 0 {
            tx.commit().await?;
            tx = ctx.pool.begin().await?;
        }

        if !sleep_cancellable(delay, ctx.cancel).await {
            break;
        }
    }

    tx.commit().await?;
    stats.print("github");
    Ok(())
}

async fn save_signals(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    server_name: &str,
    repo: &GitHubRepo,
) -> Result<()> {
    let topics_json = serde_json::to_string(&repo.topics)?;
    let license = repo
        .license
        .as_ref()
        .and_then(|l| l.spdx_id.clone())
        .unwrap_or_default();

    sqlx::query(
        r#"
        INSERT INTO github_signals
            (server_name, stars, forks, open_issues, watchers, subscribers,
             pushed_at, created_at, license, language, topics_json,
             is_archived, is_fork, default_branch, enriched_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(server_name) DO UPDATE SET
            stars = excluded.stars,
            forks = excluded.forks,
            open_issues = excluded.open_issues,
            watchers = excluded.watchers,
            subscribers = excluded.subscribers,
            pushed_at = excluded.pushed_at,
            created_at = excluded.created_at,
            license = excluded.license,
            language = excluded.language,
            topics_json = excluded.topics_json,
            is_archived = excluded.is_archived,
            is_fork = excluded.is_fork,
            default_branch = excluded.default_branch,
            enriched_at = excluded.enriched_at
        "#,
    )
    .bind(server_name)
    .bind(repo.stargazers_count)
    .bind(repo.forks_count)
    .bind(repo.open_issues_count)
    .bind(repo.watchers_count)
    .bind(repo.subscribers_count)
    .bind(repo.pushed_at.as_deref())
    .bind(repo.created_at.as_deref())
    .bind(&license)
    .bind(repo.language.as_deref().unwrap_or(""))
    .bind(&topics_json)
    .bind(repo.archived)
    .bind(repo.fork)
    .bind(repo.default_branch.as_deref().unwrap_or(""))
    .bind(db::now_utc())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
