//! Tool extraction.
//!
//! Connects to every connectable server over the MCP client protocol, lists
//! its tools, resources, and prompts, and persists the definitions. Each
//! attempt records a `tool_extraction_status` row: success resets the retry
//! counter, failures are classified with the shared taxonomy, and servers
//! with a permanent failure (or a prior success) are skipped unless
//! `--clean` is passed.

use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::invoke::{open_session, resolve_connection, ConnectionInfo, InvokeError};
use crate::models::{classify_failure, json_str};

/// Filters for one extraction run.
#[derive(Debug, Default)]
pub struct ExtractOptions {
    pub remote_only: bool,
    pub local_only: bool,
    pub skip_auth: bool,
    pub clean: bool,
    pub limit: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub query: Option<String>,
}

pub async fn run_extract(
    config: &Config,
    options: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let timeout = Duration::from_secs(
        options
            .timeout_secs
            .unwrap_or(config.server.call_timeout_secs),
    );

    let candidates = connectable_servers(&pool, options).await?;
    let total = candidates.len();
    println!("extract: {total} candidate servers");

    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for (i, server_name) in candidates.iter().enumerate() {
        if ctx_cancelled(cancel) {
            break;
        }

        let info = match resolve_connection(&pool, server_name).await? {
            Some(info) => info,
            None => continue,
        };
        let method = info.method();

        println!("  [{}/{}] {server_name} ({method})", i + 1, total);

        match extract_from_server(&pool, server_name, &info, timeout).await {
            Ok((tools, resources, prompts)) => {
                record_extraction_success(&pool, server_name, method, tools, resources, prompts)
                    .await?;
                succeeded += 1;
            }
            Err(e) => {
                record_extraction_failure(&pool, server_name, method, &e.to_string()).await?;
                failed += 1;
            }
        }
    }

    println!("extract");
    println!("  succeeded: {succeeded}");
    println!("  failed: {failed}");
    println!("ok");

    pool.close().await;
    Ok(())
}

fn ctx_cancelled(cancel: &CancellationToken) -> bool {
    cancel.is_cancelled()
}

/// Servers with any connection path, after the status and CLI filters.
async fn connectable_servers(
    pool: &SqlitePool,
    options: &ExtractOptions,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT s.name,
               EXISTS (SELECT 1 FROM server_remotes sr
                        WHERE sr.server_name = s.name AND sr.url != '') AS has_remote,
               EXISTS (SELECT 1 FROM server_packages sp
                        WHERE sp.server_name = s.name
                          AND sp.transport_type = 'stdio' AND sp.identifier != '') AS has_stdio,
               EXISTS (SELECT 1 FROM server_local_sources sl
                        WHERE sl.server_name = s.name) AS has_local,
               EXISTS (SELECT 1 FROM environment_variables ev
                        WHERE ev.server_name = s.name AND ev.is_secret = 1) AS requires_auth,
               (SELECT tes.status FROM tool_extraction_status tes
                 WHERE tes.server_name = s.name) AS extraction_status
        FROM servers s
        ORDER BY s.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut names = Vec::new();
    for row in &rows {
        let name: String = row.get("name");
        let has_remote: bool = row.get("has_remote");
        let has_stdio: bool = row.get("has_stdio");
        let has_local: bool = row.get("has_local");
        let requires_auth: bool = row.get("requires_auth");
        let status: Option<String> = row.get("extraction_status");

        if !(has_remote || has_stdio || has_local) {
            continue;
        }
        if options.remote_only && !has_remote {
            continue;
        }
        if options.local_only && has_remote {
            continue;
        }
        if options.skip_auth && requires_auth {
            continue;
        }
        if !options.clean {
            if let Some(status) = status.as_deref() {
                if status == "success" || status == "permanent_failure" {
                    continue;
                }
            }
        }
        if let Some(query) = &options.query {
            if !name.to_lowercase().contains(&query.to_lowercase()) {
                continue;
            }
        }

        names.push(name);
        if let Some(limit) = options.limit {
            if names.len() >= limit {
                break;
            }
        }
    }

    Ok(names)
}

/// One bounded session: initialize, list tools/resources/prompts, persist.
/// Resources and prompts are optional surfaces; a server that does not
/// implement them still counts as a success.
async fn extract_from_server(
    pool: &SqlitePool,
    server_name: &str,
    info: &ConnectionInfo,
    timeout: Duration,
) -> Result<(i64, i64, i64), InvokeError> {
    let client = open_session(info, timeout).await?;

    let tools_result = tokio::time::timeout(timeout, client.list_tools(Default::default())).await;
    let tools = match tools_result {
        Ok(Ok(result)) => result.tools,
        Ok(Err(e)) => {
            let _ = client.cancel().await;
            return Err(InvokeError::Upstream(e.to_string()));
        }
        Err(_) => {
            let _ = client.cancel().await;
            return Err(InvokeError::Timeout("list_tools timed out".to_string()));
        }
    };

    let resources = match tokio::time::timeout(timeout, client.list_resources(Default::default())).await
    {
        Ok(Ok(result)) => result.resources,
        _ => Vec::new(),
    };
    let prompts = match tokio::time::timeout(timeout, client.list_prompts(Default::default())).await {
        Ok(Ok(result)) => result.prompts,
        _ => Vec::new(),
    };

    let _ = client.cancel().await;

    let tool_values: Vec<Value> = tools
        .iter()
        .filter_map(|t| serde_json::to_value(t).ok())
        .collect();
    let resource_values: Vec<Value> = resources
        .iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect();
    let prompt_values: Vec<Value> = prompts
        .iter()
        .filter_map(|p| serde_json::to_value(p).ok())
        .collect();

    save_definitions(pool, server_name, &tool_values, &resource_values, &prompt_values)
        .await
        .map_err(|e| InvokeError::Upstream(format!("persist definitions: {e}")))?;

    Ok((
        tool_values.len() as i64,
        resource_values.len() as i64,
        prompt_values.len() as i64,
    ))
}

/// Persist tools (with parameters), resources, and prompts for one server.
/// Works on the serialised JSON shape so protocol model changes stay
/// contained at this boundary.
pub async fn save_definitions(
    pool: &SqlitePool,
    server_name: &str,
    tools: &[Value],
    resources: &[Value],
    prompts: &[Value],
) -> Result<()> {
    let now = db::now_utc();
    let mut tx = pool.begin().await?;

    for tool in tools {
        let Some(tool_name) = json_str(tool, "name") else {
            continue;
        };
        let title = json_str(tool, "title").unwrap_or_default();
        let description = json_str(tool, "description").unwrap_or_default();
        let input_schema = tool
            .get("inputSchema")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let output_schema = tool.get("outputSchema").map(|s| s.to_string());

        sqlx::query(
            r#"
            INSERT INTO tools
                (server_name, tool_name, title, description, input_schema, output_schema, extracted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(server_name, tool_name) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                input_schema = excluded.input_schema,
                output_schema = excluded.output_schema,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(server_name)
        .bind(&tool_name)
        .bind(&title)
        .bind(&description)
        .bind(&input_schema)
        .bind(output_schema)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tool_parameters WHERE server_name = ? AND tool_name = ?")
            .bind(server_name)
            .bind(&tool_name)
            .execute(&mut *tx)
            .await?;

        let schema = tool.get("inputSchema").cloned().unwrap_or(Value::Null);
        let required: Vec<String> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
            for (param_name, param_info) in properties {
                let param_type = json_str(param_info, "type").unwrap_or_default();
                let param_desc = json_str(param_info, "description").unwrap_or_default();
                let default_value = param_info.get("default").map(|v| v.to_string());
                let enum_values = param_info.get("enum").map(|v| v.to_string());

                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO tool_parameters
                        (server_name, tool_name, param_name, param_type, description,
                         is_required, default_value, enum_values)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(server_name)
                .bind(&tool_name)
                .bind(param_name)
                .bind(&param_type)
                .bind(&param_desc)
                .bind(required.contains(param_name))
                .bind(default_value)
                .bind(enum_values)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    for resource in resources {
        let Some(uri) = json_str(resource, "uri") else {
            continue;
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO resources
                (server_name, uri, name, description, mime_type, extracted_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_name)
        .bind(&uri)
        .bind(json_str(resource, "name").unwrap_or_default())
        .bind(json_str(resource, "description").unwrap_or_default())
        .bind(json_str(resource, "mimeType").unwrap_or_default())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    for prompt in prompts {
        let Some(prompt_name) = json_str(prompt, "name") else {
            continue;
        };
        let arguments_json = prompt
            .get("arguments")
            .map(|a| a.to_string())
            .unwrap_or_else(|| "[]".to_string());
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO prompts
                (server_name, prompt_name, description, arguments_json, extracted_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_name)
        .bind(&prompt_name)
        .bind(json_str(prompt, "description").unwrap_or_default())
        .bind(&arguments_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn record_extraction_success(
    pool: &SqlitePool,
    server_name: &str,
    connection_method: &str,
    tools_count: i64,
    resources_count: i64,
    prompts_count: i64,
) -> Result<()> {
    let now = db::now_utc();
    sqlx::query(
        r#"
        INSERT INTO tool_extraction_status
            (server_name, status, failure_reason, tools_count, resources_count,
             prompts_count, connection_method, last_attempted_at, last_successful_at, retry_count)
        VALUES (?, 'success', NULL, ?, ?, ?, ?, ?, ?, 0)
        ON CONFLICT(server_name) DO UPDATE SET
            status = 'success',
            failure_reason = NULL,
            tools_count = excluded.tools_count,
            resources_count = excluded.resources_count,
            prompts_count = excluded.prompts_count,
            connection_method = excluded.connection_method,
            last_attempted_at = excluded.last_attempted_at,
            last_successful_at = excluded.last_successful_at,
            retry_count = 0
        "#,
    )
    .bind(server_name)
    .bind(tools_count)
    .bind(resources_count)
    .bind(prompts_count)
    .bind(connection_method)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_extraction_failure(
    pool: &SqlitePool,
    server_name: &str,
    connection_method: &str,
    message: &str,
) -> Result<()> {
    let class = classify_failure(message);
    sqlx::query(
        r#"
        INSERT INTO tool_extraction_status
            (server_name, status, failure_reason, tools_count, resources_count,
             prompts_count, connection_method, last_attempted_at, last_successful_at, retry_count)
        VALUES (?, ?, ?, 0, 0, 0, ?, ?, NULL, 1)
        ON CONFLICT(server_name) DO UPDATE SET
            status = excluded.status,
            failure_reason = excluded.failure_reason,
            connection_method = excluded.connection_method,
            last_attempted_at = excluded.last_attempted_at,
            retry_count = tool_extraction_status.retry_count + 1
        "#,
    )
    .bind(server_name)
    .bind(class.status())
    .bind(class.reason())
    .bind(connection_method)
    .bind(db::now_utc())
    .execute(pool)
    .await?;
    Ok(())
}

/// Print extraction status counts.
pub async fn run_extract_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let rows = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS count, SUM(tools_count) AS tools
        FROM tool_extraction_status
        GROUP BY status
        ORDER BY count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    println!("extract stats");
    for row in &rows {
        let status: String = row.get("status");
        let count: i64 = row.get("count");
        let tools: Option<i64> = row.get("tools");
        println!("  {status}: {count} servers, {} tools", tools.unwrap_or(0));
    }

    let reasons = sqlx::query(
        r#"
        SELECT failure_reason, COUNT(*) AS count
        FROM tool_extraction_status
        WHERE failure_reason IS NOT NULL
        GROUP BY failure_reason
        ORDER BY count DESC
        LIMIT 10
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !reasons.is_empty() {
        println!("  top failure reasons:");
        for row in &reasons {
            let reason: String = row.get("failure_reason");
            let count: i64 = row.get("count");
            println!("    {reason}: {count}");
        }
    }

    pool.close().await;
    Ok(())
}
