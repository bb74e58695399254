//! npm download counts.
//!
//! One point query per window against the npm downloads API. Candidates are
//! `registry_type = 'npm'` packages with counts missing or older than the
//! refresh window (1 day by default).

use anyhow::Result;
use serde::Deserialize;
use sqlx::Row;
use std::time::Duration;

use crate::db;
use crate::fetch::{sleep_cancellable, FetchOutcome, Service};

use super::{record_failure, record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "npm_downloads";

#[derive(Debug, Deserialize)]
struct NpmPoint {
    #[serde(default)]
    downloads: i64,
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    let cutoff = ctx.cutoff_days(ctx.config.enrichment.downloads_refresh_days);

    let rows = sqlx::query(
        r#"
        SELECT sp.server_name, sp.identifier
        FROM server_packages sp
        LEFT JOIN package_downloads pd
          ON pd.server_name = sp.server_name
         AND pd.registry_type = 'npm'
         AND pd.identifier = sp.identifier
        WHERE sp.registry_type = 'npm'
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

        match fetch_windows(ctx, identifier).await? {
            Ok((last_day, last_week, last_month)) => {
                sqlx::query(
                    r#"
                    INSERT INTO package_downloads
                        (server_name, registry_type, identifier, last_day, last_week, last_month, enriched_at)
                    VALUES (?, 'npm', ?, ?, ?, ?, ?)
                    ON CONFLICT(server_name, registry_type, identifier) DO UPDATE SET
                        last_day = excluded.last_day,
                        last_week = excluded.last_week,
                        last_month = excluded.last_month,
                        enriched_at = excluded.enriched_at
                    "#,
                )
                .bind(server_name)
                .bind(identifier)
                .bind(last_day)
                .bind(last_week)
                .bind(last_month)
                .bind(db::now_utc())
                .execute(&mut *tx)
                .await?;
                record_success(&mut tx, server_name, ENRICHMENT_TYPE).await?;
                stats.succeeded += 1;
            }
            Err(message) => {
                record_failure(&mut tx, server_name, ENRICHMENT_TYPE, &message).await?;
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
    stats.print("npm");
    Ok(())
}

/// Fetch the three download windows. The outer `Result` is infrastructural;
/// the inner one carries the per-package failure message for classification.
async fn fetch_windows(
    ctx: &EnrichCtx<'_>,
    identifier: &str,
) -> Result<std::result::Result<(i64, i64, i64), String>> {
    let mut counts = [0i64; 3];

    for (i, window) in ["last-day", "last-week", "last-month"].iter().enumerate() {
        let url = format!("https://api.npmjs.org/downloads/point/{window}/{identifier}");
        let outcome = ctx
            .fetcher
            .fetch(&url, &[], &[], Service::Generic, ctx.cancel)
            .await?;

        match outcome {
            FetchOutcome::Response(response) if response.status().is_success() => {
                match response.json::<NpmPoint>().await {
                    Ok(point) => counts[i] = point.downloads,
                    Err(e) => return Ok(Err(format!("json decode error: {e}"))),
                }
            }
            FetchOutcome::Response(response) => {
                return Ok(Err(format!(
                    "HTTP {} fetching {url}",
                    response.status().as_u16()
                )));
            }
            FetchOutcome::GaveUp => {
                return Ok(Err(format!("timeout fetching {url} after retries")));
            }
        }
    }

    Ok(Ok((counts[0], counts[1], counts[2])))
}
