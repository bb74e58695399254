//! HTTP gateway.
//!
//! Exposes discovery and invocation to agents:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check |
//! | `GET`  | `/keys` | Keys listed in the local tokens file |
//! | `GET`  | `/search?query=&page=&limit=` | Hybrid tool search |
//! | `GET`  | `/servers/{name}/tools` | Tool names for one server |
//! | `POST` | `/call` | Execute a tool and return its JSON result |
//!
//! Error bodies carry a single `detail` field. Status mapping: unknown
//! server or missing connection info → 404, tool-execution timeout → 504
//! (exclusively), anything else upstream → 500.
//!
//! The embedding model is warmed once at startup so the first search does
//! not pay the model load.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::invoke::{call_tool, InvokeError};
use crate::search::{Retriever, SearchResponse};

/// Shared state for all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    retriever: Arc<Retriever>,
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = db::connect(config).await?;
    let retriever = Arc::new(Retriever::new(config));

    println!("Pre-loading embedding model...");
    retriever.warmup().await?;
    println!("Model loaded and ready.");

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        retriever,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/keys", get(handle_keys))
        .route("/search", get(handle_search))
        // Server names contain slashes, so the whole tail is captured and
        // the trailing /tools segment is split off in the handler.
        .route("/servers/{*rest}", get(handle_server_tools))
        .route("/call", post(handle_call))
        .layer(cors)
        .with_state(state);

    println!("Gateway listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

// ============ Error response ============

/// Error body: a single human-readable `detail`, the shape the SDK parses.
#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

struct AppError {
    status: StatusCode,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        detail: detail.into(),
    }
}

fn not_found(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        detail: detail.into(),
    }
}

fn gateway_timeout(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::GATEWAY_TIMEOUT,
        detail: detail.into(),
    }
}

fn internal_error(detail: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: detail.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

// ============ GET /keys ============

#[derive(Serialize)]
struct KeysResponse {
    available_keys: Vec<String>,
}

/// Parse a tokens file: one key per line, blank lines and `#` comments
/// ignored.
pub fn parse_tokens(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

async fn handle_keys(State(state): State<AppState>) -> Json<KeysResponse> {
    let keys = std::fs::read_to_string(&state.config.server.tokens_file)
        .map(|content| parse_tokens(&content))
        .unwrap_or_default();
    Json(KeysResponse {
        available_keys: keys,
    })
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    10
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    if params.page < 1 {
        return Err(bad_request("page must be >= 1"));
    }
    if !(1..=100).contains(&params.limit) {
        return Err(bad_request("limit must be in [1, 100]"));
    }

    let response = state
        .retriever
        .retrieve(
            &state.pool,
            &state.config,
            &params.query,
            params.page,
            params.limit,
        )
        .await
        .map_err(|e| internal_error(format!("Error during retrieval: {e}")))?;

    Ok(Json(response))
}

// ============ GET /servers/{name}/tools ============

#[derive(Serialize)]
struct ServerToolsResponse {
    server: String,
    tools: Vec<String>,
}

async fn handle_server_tools(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> Result<Json<ServerToolsResponse>, AppError> {
    let Some(server_name) = rest.strip_suffix("/tools") else {
        return Err(not_found("not found"));
    };

    let known: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM servers WHERE name = ?")
        .bind(server_name)
        .fetch_one(&state.pool)
        .await
        .map_err(|e| internal_error(format!("Error retrieving tools for server: {e}")))?;
    if !known {
        return Err(not_found(format!("Server '{server_name}' not found.")));
    }

    let tools = state
        .retriever
        .tools_for_server(&state.pool, server_name)
        .await
        .map_err(|e| internal_error(format!("Error retrieving tools for server: {e}")))?;

    Ok(Json(ServerToolsResponse {
        server: server_name.to_string(),
        tools,
    }))
}

// ============ POST /call ============

#[derive(Deserialize)]
struct CallRequest {
    server_name: String,
    tool_name: String,
    #[serde(default)]
    arguments: HashMap<String, serde_json::Value>,
}

async fn handle_call(
    State(state): State<AppState>,
    Json(request): Json<CallRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let arguments: serde_json::Map<String, serde_json::Value> =
        request.arguments.into_iter().collect();
    let timeout = Duration::from_secs(state.config.server.call_timeout_secs);

    let result = call_tool(
        &state.pool,
        &request.server_name,
        &request.tool_name,
        arguments,
        timeout,
    )
    .await
    .map_err(|e| match e {
        InvokeError::NotFound(msg) => not_found(msg),
        InvokeError::Timeout(_) => gateway_timeout("Tool execution timed out."),
        InvokeError::Upstream(msg) => internal_error(msg),
    })?;

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens_skips_comments_and_blanks() {
        let content = "# comment\n\nGITHUB_TOKEN\n  LIBRARIES_IO_API_KEY  \n# trailing\n";
        assert_eq!(
            parse_tokens(content),
            vec!["GITHUB_TOKEN", "LIBRARIES_IO_API_KEY"]
        );
    }

    #[test]
    fn test_parse_tokens_empty() {
        assert!(parse_tokens("").is_empty());
        assert!(parse_tokens("# only comments\n#\n").is_empty());
    }
}
