//! SQLite connection management.
//!
//! One logical database holds everything: registry records, enrichment
//! signals, scores, tools, and the search index. Connections use WAL
//! journaling with a 30 second busy timeout so batch writers and the gateway
//! can share the file.
//!
//! When `SQLITE_VEC_PATH` points at a loadable sqlite-vec build it is
//! registered as an extension for deployments that want in-database vector
//! queries. Vector *search* itself does not require it — embeddings live in
//! an ordinary BLOB table scanned in Rust — so a missing extension is only a
//! warning.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    if let Ok(vec_path) = std::env::var("SQLITE_VEC_PATH") {
        if !vec_path.is_empty() {
            options = options.extension(vec_path);
        }
    }

    let pool = match SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options.clone())
        .await
    {
        Ok(pool) => pool,
        Err(e) if std::env::var("SQLITE_VEC_PATH").is_ok() => {
            // A broken extension path must not take the store down.
            eprintln!("Warning: could not open with SQLITE_VEC_PATH extension: {e}");
            let plain = SqliteConnectOptions::from_str(&format!(
                "sqlite:{}",
                config.db.path.display()
            ))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(plain)
                .await?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(pool)
}

/// Current UTC time in the canonical on-disk timestamp format.
///
/// All Wisp-written timestamps use `%Y-%m-%d %H:%M:%S` so they compare
/// lexically against SQLite's `datetime('now', ...)`.
pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_utc_format() {
        let ts = now_utc();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
    }
}
