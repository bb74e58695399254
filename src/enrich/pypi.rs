//! PyPI download counts.
//!
//! Unlike npm, a single pypistats call returns all three windows.

use anyhow::Result;
use serde::Deserialize;
use sqlx::Row;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};

use super::{record_failure, record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "pypi_downloads";

#[derive(Debug, Deserialize)]
struct PypiRecent {
    #[serde(default)]
    data: PypiRecentData,
}

#[derive(Debug, Default, Deserialize)]
struct PypiRecentData {
    #[serde(default)]
    last_day: i64,
    #[serde(default)]
    last_week: i64,
    #[serde(default)]
    last_month: i64,
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    let cutoff = ctx.cutoff_days(ctx.config.enrichment.downloads_refresh_days);

    let rows = sqlx::query(
        r#"
        SELECT sp.server_name, sp.identifier
        FROM server_packages sp
        LEFT JOIN package_downloads pd
          ON pd.server_name = sp.server_name
         AND pd.registry_type = 'pypi'
         AND pd.identifier = sp.identifier
        WHERE sp.registry_type = 'pypi'
          AND sp.identifier != ''
          AND (pd.id IS NULL OR pd.enriched_at < ?)
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

    let candidates: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r.get("server_name"), r.get("identifier")))
        .collect();

    let mut stats = WorkerStats::default();
    let mut tx = ctx.pool.begin().await?;
    let delay = Duration::from_millis(ctx.config.enrichment.source_delay_ms);

    for (server_name, identifier) in &candidates {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let url = format!("https://pypistats.org/api/packages/{identifier}/recent");
        let outcome = ctx
            .fetcher
            .fetch(&url, &[], &[], Service::Generic, ctx.cancel)
            .await?;

        match outcome {
            FetchOutcome::Response(response) if response.status().is_success() => {
                match response.json::<PypiRecent>().await {
                    Ok(recent) => {
                        sqlx::query(
                            r#"
                            INSERT INTO package_downloads
                                (server_name, registry_type, identifier, last_day, last_week, last_month, enriched_at)
                            VALUES (?, 'pypi', ?, ?, ?, ?, ?)
                            ON CONFLICT(server_name, registry_type, identifier) DO UPDATE SET
                                last_day = excluded.last_day,
                                last_week = excluded.last_week,
                                last_month = excluded.last_month,
                                enriched_at = excluded.enriched_at
                            "#,
                        )
                        .bind(server_name)
                        .bind(identifier)
                        .bind(recent.data.last_day)
                        .bind(recent.data.last_week)
                        .bind(recent.data.last_month)
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
    stats.print("pypi");
    Ok(())
}
