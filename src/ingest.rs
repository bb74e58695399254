//! Upstream registry ingest.
//!
//! Pulls every server record from the MCP registry with cursor paging and
//! upserts it into the store. The registry is canonical for server identity:
//! re-ingesting replaces a server's dependent rows (packages, remotes,
//! environment variables) wholesale, while enrichment/scoring tables keyed by
//! name survive untouched.
//!
//! The paging cursor is ephemeral — an interrupted ingest restarts from the
//! beginning on the next run.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::fetch::{FetchOutcome, Fetcher, Service};
use crate::models::{RegistryEntry, RegistryPage};

pub async fn run_ingest(
    config: &Config,
    search: Option<String>,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let fetcher = Fetcher::new(
        std::time::Duration::from_secs(config.enrichment.fetch_timeout_secs),
        config.enrichment.max_retries,
        std::time::Duration::from_millis(config.enrichment.base_delay_ms),
    )?;

    let url = format!("{}/servers", config.registry.base_url);
    let mut cursor: Option<String> = None;
    let mut ingested = 0usize;

    'pages: loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut params: Vec<(&str, String)> = vec![
            ("limit", config.registry.page_limit.to_string()),
            ("version", "latest".to_string()),
        ];
        if let Some(ref c) = cursor {
            params.push(("cursor", c.clone()));
        }
        if let Some(ref s) = search {
            params.push(("search", s.clone()));
        }

        let outcome = fetcher
            .fetch(&url, &[], &params, Service::Generic, cancel)
            .await?;
        let response = match outcome {
            FetchOutcome::Response(r) => r,
            FetchOutcome::GaveUp => bail!("Registry unreachable after retries"),
        };
        if !response.status().is_success() {
            bail!("Registry returned HTTP {}", response.status());
        }

        let page: RegistryPage = response.json().await?;
        let page_empty = page.servers.is_empty();

        for entry in &page.servers {
            if entry.server.name.is_empty() {
                continue;
            }
            save_server(&pool, entry).await?;
            ingested += 1;
            if let Some(lim) = limit {
                if ingested >= lim {
                    break 'pages;
                }
            }
        }

        println!("  fetched {ingested} servers so far...");

        cursor = page.metadata.next_cursor;
        if cursor.is_none() || page_empty {
            break;
        }
    }

    println!("ingest");
    println!("  servers upserted: {ingested}");
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Upsert one registry entry: replace the server row, delete dependent rows,
/// re-insert from the entry.
pub async fn save_server(pool: &SqlitePool, entry: &RegistryEntry) -> Result<()> {
    let server = &entry.server;
    let meta = &entry.meta.official;
    let name = server.name.as_str();
    let repository_url = server
        .repository
        .as_ref()
        .and_then(|r| r.url.clone())
        .unwrap_or_default();
    let raw_json = serde_json::to_string(&serde_json::json!({
        "name": server.name,
        "version": server.version,
        "isLatest": meta.is_latest,
    }))?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO servers
            (name, description, version, repository_url, website_url,
             status, published_at, updated_at, raw_json, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            description = excluded.description,
            version = excluded.version,
            repository_url = excluded.repository_url,
            website_url = excluded.website_url,
            status = excluded.status,
            published_at = excluded.published_at,
            updated_at = excluded.updated_at,
            raw_json = excluded.raw_json,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(name)
    .bind(server.description.as_deref().unwrap_or(""))
    .bind(server.version.as_deref().unwrap_or(""))
    .bind(&repository_url)
    .bind(server.website_url.as_deref().unwrap_or(""))
    .bind(meta.status.as_deref().unwrap_or(""))
    .bind(meta.published_at.as_deref())
    .bind(meta.updated_at.as_deref())
    .bind(&raw_json)
    .bind(db::now_utc())
    .execute(&mut *tx)
    .await?;

    // Dependent rows are replaced wholesale on re-ingest.
    sqlx::query("DELETE FROM server_packages WHERE server_name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM server_remotes WHERE server_name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM environment_variables WHERE server_name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;

    for package in &server.packages {
        sqlx::query(
            r#"
            INSERT INTO server_packages
                (server_name, registry_type, identifier, version, transport_type, runtime_hint)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(package.registry_type.as_deref().unwrap_or(""))
        .bind(package.identifier.as_deref().unwrap_or(""))
        .bind(package.version.as_deref().unwrap_or(""))
        .bind(
            package
                .transport
                .as_ref()
                .and_then(|t| t.transport_type.as_deref())
                .unwrap_or(""),
        )
        .bind(package.runtime_hint.as_deref().unwrap_or(""))
        .execute(&mut *tx)
        .await?;

        for env_var in &package.environment_variables {
            if env_var.name.is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO environment_variables
                    (server_name, var_name, description, is_required, is_secret)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(name)
            .bind(&env_var.name)
            .bind(env_var.description.as_deref().unwrap_or(""))
            .bind(env_var.is_required)
            .bind(env_var.is_secret)
            .execute(&mut *tx)
            .await?;
        }
    }

    for remote in &server.remotes {
        let headers = remote.headers_map();
        let headers_json = if headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&headers)?)
        };
        sqlx::query(
            r#"
            INSERT INTO server_remotes (server_name, transport_type, url, headers_json)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(remote.transport_type.as_deref().unwrap_or(""))
        .bind(remote.url.as_deref().unwrap_or(""))
        .bind(headers_json)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

// ============ Curated seed servers ============

struct CuratedServer {
    name: &'static str,
    description: &'static str,
    repository_url: &'static str,
    registry_type: &'static str,
    identifier: &'static str,
    remote_url: &'static str,
    env_vars: &'static [(&'static str, bool, &'static str)],
}

/// Hand-picked servers worth having in the index even before they appear in
/// the upstream registry.
const CURATED_SERVERS: &[CuratedServer] = &[
    CuratedServer {
        name: "dev.e2b/mcp-server",
        description: "Code Interpreter for AI agents. Run AI-generated code in secure sandboxes.",
        repository_url: "https://github.com/e2b-dev/mcp-server",
        registry_type: "npm",
        identifier: "e2b-mcp-server",
        remote_url: "",
        env_vars: &[("E2B_API_KEY", true, "E2B API key")],
    },
    CuratedServer {
        name: "io.elevenlabs/mcp",
        description: "Text-to-speech and audio processing via the ElevenLabs API.",
        repository_url: "https://github.com/elevenlabs/elevenlabs-mcp",
        registry_type: "pypi",
        identifier: "elevenlabs-mcp",
        remote_url: "",
        env_vars: &[("ELEVENLABS_API_KEY", true, "ElevenLabs API key")],
    },
    CuratedServer {
        name: "dev.semgrep/mcp",
        description: "Static code analysis for security. Scan code for vulnerabilities using Semgrep.",
        repository_url: "https://github.com/semgrep/semgrep-mcp",
        registry_type: "pypi",
        identifier: "semgrep-mcp",
        remote_url: "",
        env_vars: &[],
    },
    CuratedServer {
        name: "com.mailgun/mcp",
        description: "Send emails and query email performance metrics via the Mailgun API.",
        repository_url: "https://github.com/mailgun/mailgun-mcp-server",
        registry_type: "npm",
        identifier: "@mailgun/mcp-server",
        remote_url: "",
        env_vars: &[("MAILGUN_API_KEY", true, "Mailgun API key")],
    },
    CuratedServer {
        name: "io.zip1/mcp",
        description: "Compress and extract files, manage archives.",
        repository_url: "",
        registry_type: "",
        identifier: "",
        remote_url: "https://zip1.io/mcp",
        env_vars: &[],
    },
    CuratedServer {
        name: "io.github.deep-research/mcp",
        description: "AI-powered iterative research assistant that generates comprehensive reports.",
        repository_url: "https://github.com/Ozamatash/deep-research-mcp",
        registry_type: "npm",
        identifier: "deep-research-mcp",
        remote_url: "",
        env_vars: &[],
    },
];

/// Insert the curated list, skipping servers that already exist.
pub async fn run_seed(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let mut added = 0usize;
    let mut skipped = 0usize;

    for server in CURATED_SERVERS {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM servers WHERE name = ?")
            .bind(server.name)
            .fetch_one(&pool)
            .await?;
        if exists {
            skipped += 1;
            continue;
        }

        sqlx::query(
            "INSERT INTO servers (name, description, repository_url, ingested_at) VALUES (?, ?, ?, ?)",
        )
        .bind(server.name)
        .bind(server.description)
        .bind(server.repository_url)
        .bind(db::now_utc())
        .execute(&pool)
        .await?;

        if !server.registry_type.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO server_packages (server_name, registry_type, identifier, transport_type)
                VALUES (?, ?, ?, 'stdio')
                "#,
            )
            .bind(server.name)
            .bind(server.registry_type)
            .bind(server.identifier)
            .execute(&pool)
            .await?;
        }

        if !server.remote_url.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO server_remotes (server_name, transport_type, url)
                VALUES (?, 'streamable-http', ?)
                "#,
            )
            .bind(server.name)
            .bind(server.remote_url)
            .execute(&pool)
            .await?;
        }

        for &(var_name, secret, description) in server.env_vars {
            sqlx::query(
                r#"
                INSERT INTO environment_variables
                    (server_name, var_name, description, is_required, is_secret)
                VALUES (?, ?, ?, 1, ?)
                "#,
            )
            .bind(server.name)
            .bind(var_name)
            .bind(description)
            .bind(secret)
            .execute(&pool)
            .await?;
        }

        added += 1;
    }

    println!("seed");
    println!("  added: {added}");
    println!("  skipped: {skipped} (already exist)");
    println!("ok");

    pool.close().await;
    Ok(())
}
