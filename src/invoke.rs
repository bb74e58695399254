//! Tool invocation over the MCP client protocol.
//!
//! Resolution order for a server's connection info, first match wins:
//!
//! 1. A remote endpoint (`streamable-http` or `sse`), headers resolved
//!    against the process environment.
//! 2. A stdio package, launched via `npx` / `uvx` / `docker run` or the
//!    package's `runtime_hint`.
//! 3. A local source (cloned repo) with its stored command, args, working
//!    directory, and env.
//!
//! Sessions are strictly call-scoped: `initialize` and `call_tool` are each
//! bounded by the timeout, and the child process or HTTP stream is torn down
//! on every exit path. A timeout is a distinct error so the gateway can map
//! it to 504 while everything else upstream becomes 500.

use rmcp::model::CallToolRequestParam;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::ServiceExt;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

type McpClient = rmcp::service::RunningService<rmcp::RoleClient, ()>;

// ============ Errors ============

/// Invocation failures, partitioned the way the gateway maps them to HTTP.
#[derive(Debug)]
pub enum InvokeError {
    /// No connection info, or the server is unknown → 404.
    NotFound(String),
    /// `initialize` or `call_tool` exceeded the timeout → 504.
    Timeout(String),
    /// Anything else upstream → 500 with the message as detail.
    Upstream(String),
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeError::NotFound(msg) => write!(f, "{msg}"),
            InvokeError::Timeout(msg) => write!(f, "{msg}"),
            InvokeError::Upstream(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for InvokeError {}

// ============ Placeholder resolution ============

/// Resolve environment placeholders in a string.
///
/// - `ENV:NAME` (whole string) → the env var's value, or the literal when
///   unset.
/// - `${NAME}` and `${input:NAME}` → substituted where the env var is set,
///   left literal otherwise.
pub fn resolve_placeholder(value: &str) -> String {
    if let Some(name) = value.strip_prefix("ENV:") {
        return std::env::var(name).unwrap_or_else(|_| value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let inner = &after[..end];
                let var_name = inner.strip_prefix("input:").unwrap_or(inner);
                match std::env::var(var_name) {
                    Ok(v) => out.push_str(&v),
                    // Unset: keep the placeholder verbatim.
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve every value in a header/env map.
pub fn resolve_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_placeholder(v)))
        .collect()
}

// ============ Connection resolution ============

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionInfo {
    Remote {
        transport_type: String,
        url: String,
        headers: BTreeMap<String, String>,
    },
    Stdio {
        registry_type: String,
        identifier: String,
        runtime_hint: Option<String>,
    },
    Local {
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
        env: BTreeMap<String, String>,
    },
}

impl ConnectionInfo {
    /// Label persisted in status rows and surfaced in listings.
    pub fn method(&self) -> &'static str {
        match self {
            ConnectionInfo::Remote { .. } => "remote",
            ConnectionInfo::Stdio { .. } => "stdio",
            ConnectionInfo::Local { .. } => "local",
        }
    }
}

/// Look up connection info for a server. Headers and env values come back
/// with placeholders resolved.
pub async fn resolve_connection(
    pool: &SqlitePool,
    server_name: &str,
) -> Result<Option<ConnectionInfo>, sqlx::Error> {
    let remote = sqlx::query(
        "SELECT transport_type, url, headers_json FROM server_remotes WHERE server_name = ? LIMIT 1",
    )
    .bind(server_name)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = remote {
        let url: String = row.get::<Option<String>, _>("url").unwrap_or_default();
        if !url.is_empty() {
            let headers_json: Option<String> = row.get("headers_json");
            let headers: BTreeMap<String, String> = headers_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default();
            return Ok(Some(ConnectionInfo::Remote {
                transport_type: row
                    .get::<Option<String>, _>("transport_type")
                    .unwrap_or_default(),
                url,
                headers: resolve_map(&headers),
            }));
        }
    }

    let package = sqlx::query(
        r#"
        SELECT registry_type, identifier, runtime_hint
        FROM server_packages
        WHERE server_name = ? AND transport_type = 'stdio'
        LIMIT 1
        "#,
    )
    .bind(server_name)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = package {
        let identifier: String = row.get::<Option<String>, _>("identifier").unwrap_or_default();
        if !identifier.is_empty() {
            let runtime_hint: Option<String> = row
                .get::<Option<String>, _>("runtime_hint")
                .filter(|h| !h.is_empty());
            return Ok(Some(ConnectionInfo::Stdio {
                registry_type: row
                    .get::<Option<String>, _>("registry_type")
                    .unwrap_or_default(),
                identifier,
                runtime_hint,
            }));
        }
    }

    let local = sqlx::query(
        "SELECT command, args_json, working_dir, env_json FROM server_local_sources WHERE server_name = ?",
    )
    .bind(server_name)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = local {
        let args: Vec<String> = row
            .get::<Option<String>, _>("args_json")
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let env: BTreeMap<String, String> = row
            .get::<Option<String>, _>("env_json")
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        return Ok(Some(ConnectionInfo::Local {
            command: row.get("command"),
            args,
            working_dir: row.get("working_dir"),
            env: resolve_map(&env),
        }));
    }

    Ok(None)
}

/// Build the launch command for a stdio package.
pub fn build_stdio_command(
    registry_type: &str,
    identifier: &str,
    runtime_hint: Option<&str>,
) -> (String, Vec<String>) {
    if let Some(hint) = runtime_hint {
        if !hint.is_empty() {
            return (hint.to_string(), vec![identifier.to_string()]);
        }
    }

    match registry_type {
        "npm" => (
            "npx".to_string(),
            vec!["-y".to_string(), "--quiet".to_string(), identifier.to_string()],
        ),
        "pypi" => (
            "uvx".to_string(),
            vec!["--quiet".to_string(), identifier.to_string()],
        ),
        "oci" => (
            "docker".to_string(),
            vec![
                "run".to_string(),
                "--rm".to_string(),
                "-i".to_string(),
                identifier.to_string(),
            ],
        ),
        _ => (
            "npx".to_string(),
            vec!["-y".to_string(), "--quiet".to_string(), identifier.to_string()],
        ),
    }
}

// ============ Session handling ============

/// Open a session over the resolved transport. The returned client has
/// completed the `initialize` handshake.
pub async fn open_session(
    info: &ConnectionInfo,
    timeout: Duration,
) -> Result<McpClient, InvokeError> {
    match info {
        ConnectionInfo::Remote {
            transport_type,
            url,
            headers,
        } => {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (name, value) in headers {
                let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| InvokeError::Upstream(format!("invalid header name: {e}")))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| InvokeError::Upstream(format!("invalid header value: {e}")))?;
                header_map.insert(name, value);
            }
            let client = reqwest::Client::builder()
                .default_headers(header_map)
                .build()
                .map_err(|e| InvokeError::Upstream(format!("build HTTP client: {e}")))?;

            if transport_type == "sse" {
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| InvokeError::Upstream(format!("create SSE transport: {e}")))?;
                serve_with_timeout(transport, timeout).await
            } else {
                let transport = StreamableHttpClientTransport::with_client(
                    client,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                serve_with_timeout(transport, timeout).await
            }
        }
        ConnectionInfo::Stdio {
            registry_type,
            identifier,
            runtime_hint,
        } => {
            let (command, args) =
                build_stdio_command(registry_type, identifier, runtime_hint.as_deref());
            let transport = TokioChildProcess::new(
                tokio::process::Command::new(&command).configure(|cmd| {
                    cmd.args(&args).stderr(std::process::Stdio::inherit());
                }),
            )
            .map_err(|e| InvokeError::Upstream(format!("spawn {command}: {e}")))?;
            serve_with_timeout(transport, timeout).await
        }
        ConnectionInfo::Local {
            command,
            args,
            working_dir,
            env,
        } => {
            let transport = TokioChildProcess::new(
                tokio::process::Command::new(command).configure(|cmd| {
                    cmd.args(args)
                        .envs(env.iter())
                        .stderr(std::process::Stdio::inherit());
                    if let Some(dir) = working_dir {
                        if !dir.is_empty() {
                            cmd.current_dir(dir);
                        }
                    }
                }),
            )
            .map_err(|e| InvokeError::Upstream(format!("spawn {command}: {e}")))?;
            serve_with_timeout(transport, timeout).await
        }
    }
}

async fn serve_with_timeout<T, E, A>(transport: T, timeout: Duration) -> Result<McpClient, InvokeError>
where
    T: rmcp::transport::IntoTransport<rmcp::RoleClient, E, A> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    A: Send + 'static,
{
    match tokio::time::timeout(timeout, ().serve(transport)).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(InvokeError::Upstream(format!("initialize failed: {e}"))),
        Err(_) => Err(InvokeError::Timeout("initialize timed out".to_string())),
    }
}

/// Resolve, connect, call one tool, tear down. The returned value is the
/// tool's result serialised as JSON.
pub async fn call_tool(
    pool: &SqlitePool,
    server_name: &str,
    tool_name: &str,
    arguments: serde_json::Map<String, Value>,
    timeout: Duration,
) -> Result<Value, InvokeError> {
    let info = resolve_connection(pool, server_name)
        .await
        .map_err(|e| InvokeError::Upstream(format!("connection lookup failed: {e}")))?
        .ok_or_else(|| {
            InvokeError::NotFound(format!(
                "Connection info for server '{server_name}' not found."
            ))
        })?;

    let client = open_session(&info, timeout).await?;

    let request = CallToolRequestParam {
        meta: None,
        name: Cow::Owned(tool_name.to_string()),
        arguments: Some(arguments),
        task: None,
    };

    let result = tokio::time::timeout(timeout, client.call_tool(request)).await;

    // Teardown happens on every exit path before the result is inspected.
    let _ = client.cancel().await;

    match result {
        Ok(Ok(tool_result)) => serde_json::to_value(&tool_result)
            .map_err(|e| InvokeError::Upstream(format!("serialize tool result: {e}"))),
        Ok(Err(e)) => Err(InvokeError::Upstream(e.to_string())),
        Err(_) => Err(InvokeError::Timeout("Tool execution timed out.".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_prefix() {
        std::env::set_var("WISP_TEST_TOKEN", "abc123");
        assert_eq!(resolve_placeholder("ENV:WISP_TEST_TOKEN"), "abc123");
        assert_eq!(
            resolve_placeholder("ENV:WISP_TEST_UNSET_VAR"),
            "ENV:WISP_TEST_UNSET_VAR"
        );
    }

    #[test]
    fn test_resolve_braced() {
        std::env::set_var("WISP_TEST_TOK", "abc");
        assert_eq!(resolve_placeholder("Bearer ${WISP_TEST_TOK}"), "Bearer abc");
        assert_eq!(
            resolve_placeholder("Bearer ${input:WISP_TEST_TOK}"),
            "Bearer abc"
        );
        std::env::remove_var("WISP_TEST_TOK_MISSING");
        assert_eq!(
            resolve_placeholder("Bearer ${WISP_TEST_TOK_MISSING}"),
            "Bearer ${WISP_TEST_TOK_MISSING}"
        );
    }

    #[test]
    fn test_resolve_is_fixed_point_when_set() {
        std::env::set_var("WISP_TEST_FP", "stable-value");
        let once = resolve_placeholder("x ${WISP_TEST_FP} y");
        let twice = resolve_placeholder(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_resolve_unterminated_brace() {
        assert_eq!(resolve_placeholder("half ${OPEN"), "half ${OPEN");
    }

    #[test]
    fn test_resolve_plain_passthrough() {
        assert_eq!(resolve_placeholder("no placeholders here"), "no placeholders here");
    }

    #[test]
    fn test_build_stdio_command_registries() {
        assert_eq!(
            build_stdio_command("npm", "my-server", None),
            (
                "npx".to_string(),
                vec!["-y".to_string(), "--quiet".to_string(), "my-server".to_string()]
            )
        );
        assert_eq!(
            build_stdio_command("pypi", "my-server", None),
            (
                "uvx".to_string(),
                vec!["--quiet".to_string(), "my-server".to_string()]
            )
        );
        assert_eq!(
            build_stdio_command("oci", "org/image", None),
            (
                "docker".to_string(),
                vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "-i".to_string(),
                    "org/image".to_string()
                ]
            )
        );
        // Unknown registries fall back to npx.
        assert_eq!(build_stdio_command("cargo", "x", None).0, "npx");
    }

    #[test]
    fn test_build_stdio_command_runtime_hint_overrides() {
        assert_eq!(
            build_stdio_command("npm", "my-server", Some("deno")),
            ("deno".to_string(), vec!["my-server".to_string()])
        );
    }

    #[test]
    fn test_resolve_map_values_only() {
        std::env::set_var("WISP_TEST_MAPVAL", "resolved");
        let mut map = BTreeMap::new();
        map.insert("Authorization".to_string(), "Bearer ${WISP_TEST_MAPVAL}".to_string());
        map.insert("X-Plain".to_string(), "as-is".to_string());
        let resolved = resolve_map(&map);
        assert_eq!(resolved["Authorization"], "Bearer resolved");
        assert_eq!(resolved["X-Plain"], "as-is");
    }
}
