//! libraries.io dependency signals.
//!
//! Candidates are npm/pypi packages whose dependency counts are missing or
//! older than the refresh window (7 days). Requires `LIBRARIES_IO_API_KEY`.
//! libraries.io enforces a strict request budget, hence the long politeness
//! delay (1.5 s).

use anyhow::{bail, Result};
use serde::Deserialize;
use sqlx::Row;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};

use super::{record_failure, record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "dependents";

#[derive(Debug, Deserialize)]
struct LibrariesIoProject {
    #[serde(default)]
    dependents_count: i64,
    #[serde(default)]
    dependent_repos_count: i64,
    #[serde(default)]
    rank: i64,
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    let api_key = match std::env::var("LIBRARIES_IO_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => bail!("LIBRARIES_IO_API_KEY not set; dependents enrichment requires it"),
    };

    let cutoff = ctx.cutoff_days(ctx.config.enrichment.dependents_refresh_days);

    let rows = sqlx::query(
        r#"
        SELECT sp.server_name, sp.registry_type, sp.identifier
        FROM server_packages sp
        LEFT JOIN dependency_signals ds
          ON ds.server_name = sp.server_name
         AND ds.package_name = sp.identifier
        WHERE sp.registry_type IN ('npm', 'pypi')
          AND sp.identifier != ''
          AND (ds.id IS NULL OR ds.enriched_at < ?)
          AND (? OR NOT EXISTS (
                SELECT 1 FROM enrichment_status es
                WHERE es.server_name = sp.server_name
                  AND es.enrichment_type = ?
                  AND es.status = 'permanent_failure'))
        GROUP BY sp.server_name, sp.identifier
        ORDER BY sp.server_name
        "#,
    )
    .bind(&cutoff)
    .bind(ctx.clean)
    .bind(ENRICHMENT_TYPE)
    .fetch_all(ctx.pool)
    .await?;

    let candidates: Vec<(String, String, String)> = rows
        .iter()
        .map(|r| {
            (
                r.get("server_name"),
                r.get("registry_type"),
                r.get("identifier"),
            )
        })
        .collect();

    let mut stats = WorkerStats::default();
    let mut tx = ctx.pool.begin().await?;
    let delay = Duration::from_millis(ctx.config.enrichment.dependents_delay_ms);

    for (server_name, registry_type, identifier) in &candidates {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let platform = match registry_type.as_str() {
            "npm" => "npm",
            "pypi" => "pypi",
            _ => continue,
        };

        let url = format!("https://libraries.io/api/{platform}/{identifier}");
        let params = [("api_key", api_key.clone())];
        let outcome = ctx
            .fetcher
            .fetch(&url, &[], &params, Service::Generic, ctx.cancel)
            .await?;

        match outcome {
            FetchOutcome::Response(response) if response.status().is_success() => {
                match response.json::<LibrariesIoProject>().await {
                    Ok(project) => {
                        sqlx::query(
                            r#"
                            INSERT INTO dependency_signals
                                (server_name, package_name, platform, dependents_count,
                                 dependent_repos_count, sourcerank, enriched_at)
                            VALUES (?, ?, ?, ?, ?, ?, ?)
                            ON CONFLICT(server_name, package_name) DO UPDATE SET
                                platform = excluded.platform,
                                dependents_count = excluded.dependents_count,
                                dependent_repos_count = excluded.dependent_repos_count,
                                sourcerank = excluded.sourcerank,
                                enriched_at = excluded.enriched_at
                            "#,
                        )
                        .bind(server_name)
                        .bind(identifier)
                        .bind(platform)
                        .bind(project.dependents_count)
                        .bind(project.dependent_repos_count)
                        .bind(project.rank)
                        .bind(db::now_utc())
                        .execute(&mut *tx)
                        .await?;
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
    stats.print("dependents");
    Ok(())
}
