//! Enrichment workers — one module per external signal source.
//!
//! Every worker follows the same contract:
//!
//! 1. Select candidate servers for its source (stale or never enriched).
//! 2. Skip candidates with a recorded permanent failure for this source,
//!    unless `--clean` is set.
//! 3. Fetch, classify the outcome, persist the domain row plus an
//!    [`enrichment_status`] row.
//! 4. Sleep a per-source politeness delay between requests.
//! 5. Commit every `commit_every` items so Ctrl-C keeps progress.
//!
//! Sources: GitHub repo signals, npm / PyPI / Docker Hub download counts,
//! Glama cross-listing, offline service-cost analysis, libraries.io
//! dependents, and GitHub code-search config references.

pub mod config_refs;
pub mod dependents;
pub mod docker;
pub mod github;
pub mod glama;
pub mod npm;
pub mod pypi;
pub mod services;

use anyhow::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::fetch::Fetcher;
use crate::models::classify_failure;

/// Shared context threaded through every worker.
pub struct EnrichCtx<'a> {
    pub pool: &'a SqlitePool,
    pub fetcher: &'a Fetcher,
    pub config: &'a Config,
    pub cancel: &'a CancellationToken,
    /// Retry servers with recorded permanent failures.
    pub clean: bool,
}

impl EnrichCtx<'_> {
    pub fn commit_every(&self) -> usize {
        self.config.enrichment.commit_every
    }

    /// Cutoff timestamp: rows enriched before this are stale.
    pub fn cutoff_days(&self, days: u32) -> String {
        (chrono::Utc::now() - chrono::Duration::days(days as i64))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

/// Record a successful enrichment. Success resets `retry_count`.
pub async fn record_success(
    tx: &mut Transaction<'_, Sqlite>,
    server_name: &str,
    enrichment_type: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO enrichment_status
            (server_name, enrichment_type, status, failure_reason, last_attempted_at, retry_count)
        VALUES (?, ?, 'success', NULL, ?, 0)
        ON CONFLICT(server_name, enrichment_type) DO UPDATE SET
            status = 'success',
            failure_reason = NULL,
            last_attempted_at = excluded.last_attempted_at,
            retry_count = 0
        "#,
    )
    .bind(server_name)
    .bind(enrichment_type)
    .bind(db::now_utc())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record a failed enrichment. Only the final classification of the run is
/// stored; the message is classified by substring, so callers fold any HTTP
/// status into it.
pub async fn record_failure(
    tx: &mut Transaction<'_, Sqlite>,
    server_name: &str,
    enrichment_type: &str,
    message: &str,
) -> Result<()> {
    let class = classify_failure(message);
    sqlx::query(
        r#"
        INSERT INTO enrichment_status
            (server_name, enrichment_type, status, failure_reason, last_attempted_at, retry_count)
        VALUES (?, ?, ?, ?, ?, 1)
        ON CONFLICT(server_name, enrichment_type) DO UPDATE SET
            status = excluded.status,
            failure_reason = excluded.failure_reason,
            last_attempted_at = excluded.last_attempted_at,
            retry_count = enrichment_status.retry_count + 1
        "#,
    )
    .bind(server_name)
    .bind(enrichment_type)
    .bind(class.status())
    .bind(class.reason())
    .bind(db::now_utc())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Run every worker in dependency-safe order.
pub async fn run_all(ctx: &EnrichCtx<'_>) -> Result<()> {
    github::run(ctx).await?;
    npm::run(ctx).await?;
    pypi::run(ctx).await?;
    docker::run(ctx).await?;
    glama::run(ctx).await?;
    services::run(ctx).await?;
    dependents::run(ctx).await?;
    config_refs::run(ctx).await?;
    Ok(())
}

/// Per-run counters shared by the workers' summary output.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkerStats {
    pub fn print(&self, worker: &str) {
        println!("enrich {worker}");
        println!("  processed: {}", self.processed);
        println!("  succeeded: {}", self.succeeded);
        println!("  failed: {}", self.failed);
        println!("ok");
    }
}
