//! Glama registry cross-listing.
//!
//! This worker makes no per-server calls: it enumerates the entire Glama
//! registry with cursor paging, then matches each remote entry to a local
//! server by exact name, by slug (the final `/`-segment of the name), or by
//! normalised repository URL. Matches persist a cross-listing row with the
//! listed license.

use anyhow::{bail, Result};
use serde::Deserialize;
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};
use crate::models::normalize_repo_url;

use super::{record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "glama_listing";

const GLAMA_BASE_URL: &str = "https://glama.ai/api/mcp/v1";

#[derive(Debug, Deserialize)]
struct GlamaPage {
    #[serde(default)]
    servers: Vec<GlamaServer>,
    #[serde(rename = "pageInfo", default)]
    page_info: GlamaPageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct GlamaPageInfo {
    #[serde(rename = "endCursor", default)]
    end_cursor: Option<String>,
    #[serde(rename = "hasNextPage", default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct GlamaServer {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    repository: Option<GlamaRepository>,
    #[serde(rename = "spdxLicense", default)]
    spdx_license: Option<GlamaLicense>,
}

#[derive(Debug, Default, Deserialize)]
struct GlamaRepository {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GlamaLicense {
    #[serde(default)]
    name: Option<String>,
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    // Local lookup keys: name, slug, normalised repo URL → server name.
    let rows = sqlx::query("SELECT name, repository_url FROM servers")
        .fetch_all(ctx.pool)
        .await?;

    let mut by_name: HashMap<String, String> = HashMap::new();
    let mut by_slug: HashMap<String, String> = HashMap::new();
    let mut by_repo: HashMap<String, String> = HashMap::new();

    for row in &rows {
        let name: String = row.get("name");
        let repo: String = row.get("repository_url");
        by_name.insert(name.to_lowercase(), name.clone());
        if let Some(slug) = name.rsplit('/').next() {
            by_slug.entry(slug.to_lowercase()).or_insert(name.clone());
        }
        if !repo.is_empty() {
            by_repo
                .entry(normalize_repo_url(&repo))
                .or_insert(name.clone());
        }
    }

    let mut stats = WorkerStats::default();
    let mut cursor: Option<String> = None;
    let delay = Duration::from_millis(ctx.config.enrichment.source_delay_ms);
    let mut tx = ctx.pool.begin().await?;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let url = format!("{GLAMA_BASE_URL}/servers");
        let mut params: Vec<(&str, String)> = vec![("first", "100".to_string())];
        if let Some(ref c) = cursor {
            params.push(("after", c.clone()));
        }

        let outcome = ctx
            .fetcher
            .fetch(&url, &[], &params, Service::Generic, ctx.cancel)
            .await?;
        let response = match outcome {
            FetchOutcome::Response(r) if r.status().is_success() => r,
            FetchOutcome::Response(r) => bail!("Glama returned HTTP {}", r.status()),
            FetchOutcome::GaveUp => break,
        };

        let page: GlamaPage = response.json().await?;

        for entry in &page.servers {
            let matched = match_entry(entry, &by_name, &by_slug, &by_repo);
            let Some(server_name) = matched else {
                continue;
            };

            let license = entry
                .spdx_license
                .as_ref()
                .and_then(|l| l.name.clone())
                .unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO cross_listings
                    (server_name, source, listing_id, slug, url, license, enriched_at)
                VALUES (?, 'glama', ?, ?, ?, ?, ?)
                ON CONFLICT(server_name, source) DO UPDATE SET
                    listing_id = excluded.listing_id,
                    slug = excluded.slug,
                    url = excluded.url,
                    license = excluded.license,
                    enriched_at = excluded.enriched_at
                "#,
            )
            .bind(&server_name)
            .bind(entry.id.as_deref().unwrap_or(""))
            .bind(entry.slug.as_deref().unwrap_or(""))
            .bind(entry.url.as_deref().unwrap_or(""))
            .bind(&license)
            .bind(db::now_utc())
            .execute(&mut *tx)
            .await?;
            record_success(&mut tx, &server_name, ENRICHMENT_TYPE).await?;

            stats.succeeded += 1;
            stats.processed += 1;
            if stats.processed % ctx.commit_every() == 0 {
                tx.commit().await?;
                tx = ctx.pool.begin().await?;
            }
        }

        if !page.page_info.has_next_page || page.page_info.end_cursor.is_none() {
            break;
        }
        cursor = page.page_info.end_cursor;

        if !sleep_cancellable(delay, ctx.cancel).await {
            break;
        }
    }

    tx.commit().await?;
    stats.print("glama");
    Ok(())
}

fn match_entry(
    entry: &GlamaServer,
    by_name: &HashMap<String, String>,
    by_slug: &HashMap<String, String>,
    by_repo: &HashMap<String, String>,
) -> Option<String> {
    if let Some(name) = &entry.name {
        if let Some(local) = by_name.get(&name.to_lowercase()) {
            return Some(local.clone());
        }
    }
    if let Some(slug) = &entry.slug {
        if let Some(local) = by_slug.get(&slug.to_lowercase()) {
            return Some(local.clone());
        }
    }
    if let Some(repo) = entry.repository.as_ref().and_then(|r| r.url.as_deref()) {
        if let Some(local) = by_repo.get(&normalize_repo_url(repo)) {
            return Some(local.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maps() -> (
        HashMap<String, String>,
        HashMap<String, String>,
        HashMap<String, String>,
    ) {
        let mut by_name = HashMap::new();
        by_name.insert(
            "io.acme/search".to_string(),
            "io.acme/search".to_string(),
        );
        let mut by_slug = HashMap::new();
        by_slug.insert("search".to_string(), "io.acme/search".to_string());
        let mut by_repo = HashMap::new();
        by_repo.insert(
            "github.com/acme/search-mcp".to_string(),
            "io.acme/search".to_string(),
        );
        (by_name, by_slug, by_repo)
    }

    #[test]
    fn test_match_by_name() {
        let (n, s, r) = maps();
        let entry = GlamaServer {
            id: None,
            name: Some("IO.Acme/Search".to_string()),
            slug: None,
            url: None,
            repository: None,
            spdx_license: None,
        };
        assert_eq!(match_entry(&entry, &n, &s, &r), Some("io.acme/search".to_string()));
    }

    #[test]
    fn test_match_by_repo_url() {
        let (n, s, r) = maps();
        let entry = GlamaServer {
            id: None,
            name: Some("unrelated".to_string()),
            slug: None,
            url: None,
            repository: Some(GlamaRepository {
                url: Some("https://github.com/Acme/search-mcp.git".to_string()),
            }),
            spdx_license: None,
        };
        assert_eq!(match_entry(&entry, &n, &s, &r), Some("io.acme/search".to_string()));
    }

    #[test]
    fn test_no_match() {
        let (n, s, r) = maps();
        let entry = GlamaServer {
            id: None,
            name: Some("nobody".to_string()),
            slug: Some("nobody".to_string()),
            url: None,
            repository: None,
            spdx_license: None,
        };
        assert_eq!(match_entry(&entry, &n, &s, &r), None);
    }
}
