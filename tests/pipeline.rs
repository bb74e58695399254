//! End-to-end pipeline tests against temporary databases.
//!
//! These exercise the offline path (ingest → score → rank → index) and the
//! retrieval path with handcrafted embeddings, without touching the network
//! or the embedding model.

use std::collections::BTreeMap;

use sqlx::{Row, SqlitePool};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use wisp::backlink::{self, tier_weight, METADATA_CACHE_SERVER, METADATA_CACHE_TIER};
use wisp::config::Config;
use wisp::embedding::vec_to_blob;
use wisp::enrich::{record_failure, record_success};
use wisp::extract::{record_extraction_failure, record_extraction_success, save_definitions};
use wisp::ingest::save_server;
use wisp::models::RegistryEntry;
use wisp::search::retrieve_with_vector;
use wisp::{db, index, migrate, ranking};

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db.path = tmp.path().join("wisp.sqlite");
    config.enrichment.max_retries = 0;
    config.enrichment.base_delay_ms = 1;

    let pool = db::connect(&config).await.unwrap();
    migrate::create_schema(&pool).await.unwrap();
    migrate::create_views(&pool).await.unwrap();
    (tmp, config, pool)
}

async fn insert_server(pool: &SqlitePool, name: &str, repository_url: &str) {
    sqlx::query(
        "INSERT INTO servers (name, description, repository_url, ingested_at) VALUES (?, ?, ?, ?)",
    )
    .bind(name)
    .bind(format!("{name} description"))
    .bind(repository_url)
    .bind(db::now_utc())
    .execute(pool)
    .await
    .unwrap();
}

async fn insert_tool(pool: &SqlitePool, server: &str, tool: &str, description: &str) -> i64 {
    sqlx::query(
        r#"
        INSERT INTO tools (server_name, tool_name, title, description, input_schema, extracted_at)
        VALUES (?, ?, ?, ?, '{}', ?)
        "#,
    )
    .bind(server)
    .bind(tool)
    .bind(tool)
    .bind(description)
    .bind(db::now_utc())
    .execute(pool)
    .await
    .unwrap();

    sqlx::query_scalar("SELECT id FROM tools WHERE server_name = ? AND tool_name = ?")
        .bind(server)
        .bind(tool)
        .fetch_one(pool)
        .await
        .unwrap()
}

// ============ Schema ============

#[tokio::test]
async fn test_migrations_idempotent() {
    let (_tmp, _config, pool) = setup().await;
    migrate::create_schema(&pool).await.unwrap();
    migrate::create_views(&pool).await.unwrap();
    migrate::create_schema(&pool).await.unwrap();
    migrate::create_views(&pool).await.unwrap();

    let tables: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(tables > 10);
}

// ============ Ingest ============

fn registry_entry(json: serde_json::Value) -> RegistryEntry {
    serde_json::from_value(json).unwrap()
}

#[tokio::test]
async fn test_reingest_replaces_dependents() {
    let (_tmp, _config, pool) = setup().await;

    let entry = registry_entry(serde_json::json!({
        "server": {
            "name": "io.acme/tool",
            "description": "first",
            "version": "1.0.0",
            "repository": {"url": "https://github.com/acme/tool"},
            "packages": [{
                "registryType": "npm",
                "identifier": "acme-tool",
                "transport": {"type": "stdio"},
                "environmentVariables": [
                    {"name": "ACME_KEY", "isRequired": true, "isSecret": true}
                ]
            }],
            "remotes": []
        },
        "_meta": {
            "io.modelcontextprotocol.registry/official": {
                "status": "active",
                "isLatest": true
            }
        }
    }));
    save_server(&pool, &entry).await.unwrap();

    let updated = registry_entry(serde_json::json!({
        "server": {
            "name": "io.acme/tool",
            "description": "second",
            "version": "1.1.0",
            "repository": {"url": "https://github.com/acme/tool"},
            "packages": [{
                "registryType": "pypi",
                "identifier": "acme-tool-py",
                "transport": {"type": "stdio"}
            }],
            "remotes": []
        },
        "_meta": {}
    }));
    save_server(&pool, &updated).await.unwrap();

    let server_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM servers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(server_count, 1);

    let description: String =
        sqlx::query_scalar("SELECT description FROM servers WHERE name = 'io.acme/tool'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(description, "second");

    // Old package and env var rows were replaced wholesale.
    let packages: Vec<String> =
        sqlx::query_scalar("SELECT registry_type FROM server_packages WHERE server_name = 'io.acme/tool'")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(packages, vec!["pypi"]);

    let env_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM environment_variables WHERE server_name = 'io.acme/tool'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(env_count, 0);
}

#[tokio::test]
async fn test_remote_headers_flattened_to_map() {
    let (_tmp, _config, pool) = setup().await;

    let entry = registry_entry(serde_json::json!({
        "server": {
            "name": "io.acme/remote",
            "remotes": [{
                "type": "streamable-http",
                "url": "https://acme.dev/mcp",
                "headers": [{"name": "Authorization", "value": "Bearer ${TOK}"}]
            }]
        },
        "_meta": {}
    }));
    save_server(&pool, &entry).await.unwrap();

    let headers_json: String =
        sqlx::query_scalar("SELECT headers_json FROM server_remotes WHERE server_name = 'io.acme/remote'")
            .fetch_one(&pool)
            .await
            .unwrap();
    let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json).unwrap();
    assert_eq!(headers["Authorization"], "Bearer ${TOK}");
}

// ============ Enrichment status ============

#[tokio::test]
async fn test_enrichment_status_retry_counting() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/tool", "").await;

    let mut tx = pool.begin().await.unwrap();
    record_failure(&mut tx, "io.acme/tool", "github_signals", "connection refused")
        .await
        .unwrap();
    record_failure(&mut tx, "io.acme/tool", "github_signals", "timed out")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let row = sqlx::query(
        "SELECT status, failure_reason, retry_count FROM enrichment_status WHERE server_name = 'io.acme/tool'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.get::<String, _>("status"), "transient_failure");
    assert_eq!(row.get::<String, _>("failure_reason"), "timeout");
    assert_eq!(row.get::<i64, _>("retry_count"), 2);

    // Success resets the retry counter.
    let mut tx = pool.begin().await.unwrap();
    record_success(&mut tx, "io.acme/tool", "github_signals")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let row = sqlx::query(
        "SELECT status, failure_reason, retry_count FROM enrichment_status WHERE server_name = 'io.acme/tool'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.get::<String, _>("status"), "success");
    assert!(row.get::<Option<String>, _>("failure_reason").is_none());
    assert_eq!(row.get::<i64, _>("retry_count"), 0);
}

#[tokio::test]
async fn test_auth_failure_is_permanent() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/tool", "").await;

    let mut tx = pool.begin().await.unwrap();
    record_failure(&mut tx, "io.acme/tool", "github_signals", "HTTP 403 fetching repo")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let status: String =
        sqlx::query_scalar("SELECT status FROM enrichment_status WHERE server_name = 'io.acme/tool'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "permanent_failure");
}

// ============ Extraction status ============

#[tokio::test]
async fn test_extraction_status_invariants() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/tool", "").await;

    record_extraction_failure(&pool, "io.acme/tool", "stdio", "connection refused")
        .await
        .unwrap();
    record_extraction_success(&pool, "io.acme/tool", "stdio", 3, 0, 1)
        .await
        .unwrap();

    let row = sqlx::query(
        r#"
        SELECT status, tools_count, retry_count, last_attempted_at, last_successful_at
        FROM tool_extraction_status WHERE server_name = 'io.acme/tool'
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.get::<String, _>("status"), "success");
    assert!(row.get::<i64, _>("tools_count") >= 0);
    assert_eq!(row.get::<i64, _>("retry_count"), 0);
    let attempted: String = row.get("last_attempted_at");
    let succeeded: String = row.get("last_successful_at");
    assert!(succeeded <= attempted);
}

// ============ Tool definitions ============

#[tokio::test]
async fn test_save_definitions_extracts_parameters() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/weather", "").await;

    let tools = vec![serde_json::json!({
        "name": "get_weather",
        "title": "Get Weather",
        "description": "Fetch current conditions",
        "inputSchema": {
            "type": "object",
            "properties": {
                "city": {"type": "string", "description": "City name", "enum": ["NYC", "SF"]},
                "units": {"type": "string", "description": "Unit system", "default": "metric"}
            },
            "required": ["city"]
        }
    })];
    save_definitions(&pool, "io.acme/weather", &tools, &[], &[])
        .await
        .unwrap();

    let params = sqlx::query(
        "SELECT param_name, is_required, enum_values, default_value FROM tool_parameters ORDER BY param_name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(params.len(), 2);
    assert_eq!(params[0].get::<String, _>("param_name"), "city");
    assert!(params[0].get::<bool, _>("is_required"));
    assert!(params[0]
        .get::<Option<String>, _>("enum_values")
        .unwrap()
        .contains("NYC"));
    assert!(!params[1].get::<bool, _>("is_required"));
    assert_eq!(
        params[1].get::<Option<String>, _>("default_value").unwrap(),
        "\"metric\""
    );

    // Re-saving is an upsert, not a duplicate.
    save_definitions(&pool, "io.acme/weather", &tools, &[], &[])
        .await
        .unwrap();
    let tool_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tools")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(tool_count, 1);
}

// ============ Backlink scoring ============

#[tokio::test]
async fn test_backlink_self_exclusion_and_edge_score() {
    let (_tmp, config, pool) = setup().await;
    insert_server(&pool, "x", "https://github.com/owner/x").await;

    let samples = serde_json::to_string(&vec!["owner/x", "other/repo"]).unwrap();
    sqlx::query(
        r#"
        INSERT INTO config_references
            (server_name, search_term, config_type, reference_count, sample_repos, enriched_at)
        VALUES ('x', 'x', 'mcp.json', 2, ?, ?)
        "#,
    )
    .bind(&samples)
    .bind(db::now_utc())
    .execute(&pool)
    .await
    .unwrap();

    // Pre-cache metadata for both repos so the scorer stays offline.
    let now = chrono::Utc::now().to_rfc3339();
    for repo in ["owner/x", "other/repo"] {
        sqlx::query(
            r#"
            INSERT INTO backlink_edges
                (server_name, referencer_repo, tier, tier_weight, repo_stars,
                 repo_pushed_at, is_archived, is_fork, edge_score, created_at)
            VALUES (?, ?, ?, 0.0, 1, ?, 0, 0, 0.0, ?)
            "#,
        )
        .bind(METADATA_CACHE_SERVER)
        .bind(repo)
        .bind(METADATA_CACHE_TIER)
        .bind(&now)
        .bind(db::now_utc())
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;

    let cancel = CancellationToken::new();
    backlink::run_score(&config, &cancel).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let edges = sqlx::query(
        "SELECT referencer_repo, tier, tier_weight, edge_score FROM backlink_edges WHERE server_name = 'x'",
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    // The self-reference was dropped: exactly one tier-1 edge survives.
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].get::<String, _>("referencer_repo"), "other/repo");
    assert_eq!(edges[0].get::<String, _>("tier"), "tier1_config");
    assert_eq!(
        edges[0].get::<f64, _>("tier_weight"),
        tier_weight("tier1_config").unwrap()
    );
    // 1.0 · (1 + log1p(1)) · ~1 · 1 ≈ 1.693
    let score: f64 = edges[0].get("edge_score");
    assert!((score - 1.693).abs() < 0.01, "edge_score = {score}");

    let row = sqlx::query(
        "SELECT raw_score, normalized_score, tier1_contribution, unique_repos FROM backlink_scores WHERE server_name = 'x'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.get::<i64, _>("unique_repos"), 1);
    assert!((row.get::<f64, _>("raw_score") - score).abs() < 1e-9);
    assert!((row.get::<f64, _>("tier1_contribution") - score).abs() < 1e-9);

    let normalized: f64 = row.get("normalized_score");
    assert!((0.0..=1.0).contains(&normalized));
    // Singleton cohort normalises itself to 1.
    assert!((normalized - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_backlink_dependency_contribution() {
    let (_tmp, config, pool) = setup().await;
    insert_server(&pool, "io.acme/dep", "").await;

    sqlx::query(
        r#"
        INSERT INTO dependency_signals
            (server_name, package_name, platform, dependents_count, dependent_repos_count, sourcerank, enriched_at)
        VALUES ('io.acme/dep', 'acme-dep', 'npm', 10, 50, 20, ?)
        "#,
    )
    .bind(db::now_utc())
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let cancel = CancellationToken::new();
    backlink::run_score(&config, &cancel).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let tier2: f64 = sqlx::query_scalar(
        "SELECT tier2_contribution FROM backlink_scores WHERE server_name = 'io.acme/dep'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let expected = 0.8 * 11.0f64.ln() * 1.5f64.sqrt();
    assert!((tier2 - expected).abs() < 1e-9, "tier2 = {tier2}");
}

// ============ Market ranking ============

#[tokio::test]
async fn test_rank_reputation_singleton_cohort() {
    let (_tmp, config, pool) = setup().await;
    insert_server(&pool, "acme/tool", "https://github.com/acme/tool").await;

    sqlx::query(
        r#"
        INSERT INTO github_signals
            (server_name, stars, forks, pushed_at, is_archived, is_fork, enriched_at)
        VALUES ('acme/tool', 100, 10, ?, 0, 0, ?)
        "#,
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(db::now_utc())
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let cancel = CancellationToken::new();
    backlink::run_score(&config, &cancel).await.unwrap();
    ranking::run_rank(&config, &cancel).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let row = sqlx::query(
        r#"
        SELECT total_score, usage_score, reputation_score, activity_score,
               reach_score, is_zero_auth, is_verified
        FROM market_rankings WHERE server_name = 'acme/tool'
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert!((row.get::<f64, _>("reputation_score") - 1.0).abs() < 1e-9);
    assert!((row.get::<f64, _>("activity_score") - 1.0).abs() < 1e-3);
    assert_eq!(row.get::<f64, _>("usage_score"), 0.0);
    assert_eq!(row.get::<f64, _>("reach_score"), 0.0);
    assert!(row.get::<bool, _>("is_zero_auth"));
    assert!(!row.get::<bool, _>("is_verified"));

    // 0.30·1 + 0.15·1 + 0.05 zero-auth bonus
    let total: f64 = row.get("total_score");
    assert!((total - 0.50).abs() < 1e-3, "total = {total}");
    assert!((0.0..=1.0).contains(&total));
}

#[tokio::test]
async fn test_rank_zero_signal_server_bounds() {
    let (_tmp, config, pool) = setup().await;
    insert_server(&pool, "io.acme/nothing", "").await;
    pool.close().await;

    let cancel = CancellationToken::new();
    ranking::run_rank(&config, &cancel).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let total: f64 =
        sqlx::query_scalar("SELECT total_score FROM market_rankings WHERE server_name = 'io.acme/nothing'")
            .fetch_one(&pool)
            .await
            .unwrap();

    // No backlinks, no downloads: activity floor (0.5 · 0.15) + zero-auth
    // bonus is all a server can get.
    assert!(total <= 0.15, "total = {total}");
    assert!((total - 0.125).abs() < 1e-9);
}

// ============ Search index ============

#[tokio::test]
async fn test_search_docs_idempotent() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/weather", "").await;
    insert_tool(&pool, "io.acme/weather", "get_weather", "Fetch current conditions").await;

    index::build_search_index(&pool).await.unwrap();
    let first: Vec<String> = sqlx::query_scalar("SELECT full_doc FROM tools_search ORDER BY tool_id")
        .fetch_all(&pool)
        .await
        .unwrap();

    index::build_search_index(&pool).await.unwrap();
    let second: Vec<String> = sqlx::query_scalar("SELECT full_doc FROM tools_search ORDER BY tool_id")
        .fetch_all(&pool)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert!(first[0].contains("Server: io.acme/weather"));
}

#[tokio::test]
async fn test_fts_matches_after_rebuild() {
    let (_tmp, _config, pool) = setup().await;
    insert_server(&pool, "io.acme/weather", "").await;
    insert_tool(&pool, "io.acme/weather", "get_weather", "Fetch forecast data").await;

    index::build_search_index(&pool).await.unwrap();

    let hits: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tools_fts WHERE tools_fts MATCH 'forecast'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(hits, 1);
}

// ============ Hybrid retrieval ============

async fn seed_search_corpus(pool: &SqlitePool) -> (i64, i64) {
    insert_server(pool, "io.acme/weather", "").await;
    insert_server(pool, "io.acme/mail", "").await;
    // The mail server is auth-gated.
    sqlx::query(
        r#"
        INSERT INTO environment_variables (server_name, var_name, is_required, is_secret)
        VALUES ('io.acme/mail', 'MAIL_API_KEY', 1, 1)
        "#,
    )
    .execute(pool)
    .await
    .unwrap();

    let weather_id = insert_tool(pool, "io.acme/weather", "get_weather", "Fetch forecast data").await;
    let mail_id = insert_tool(pool, "io.acme/mail", "send_mail", "Send an email message").await;

    index::build_search_index(pool).await.unwrap();

    // Handcrafted 4-dim embeddings.
    let vectors = [(weather_id, [1.0f32, 0.0, 0.0, 0.0]), (mail_id, [0.0f32, 1.0, 0.0, 0.0])];
    for (tool_id, vector) in &vectors {
        sqlx::query("INSERT INTO tool_vectors (tool_id, embedding) VALUES (?, ?)")
            .bind(tool_id)
            .bind(vec_to_blob(vector))
            .execute(pool)
            .await
            .unwrap();
    }

    (weather_id, mail_id)
}

#[tokio::test]
async fn test_retrieve_vector_only_with_floor() {
    let (_tmp, config, pool) = setup().await;
    let (weather_id, _mail_id) = seed_search_corpus(&pool).await;

    // Query text sanitises to nothing, so only the vector side runs.
    let response = retrieve_with_vector(&pool, &config, "???", &[1.0, 0.0, 0.0, 0.0], 1, 10)
        .await
        .unwrap();

    // Both tools were vector candidates, but only the aligned one clears
    // the 0.3 relevance floor (0.7 · 1.0 vs 0.7 · 0.0).
    assert_eq!(response.total_candidates, 2);
    assert_eq!(response.results.len(), 1);
    let top = &response.results[0];
    assert_eq!(top.tool_id, weather_id);
    assert!((top.relevance - 0.7).abs() < 1e-6);
    assert!(!top.requires_auth);
    assert_eq!(top.server.name, "io.acme/weather");
}

#[tokio::test]
async fn test_retrieve_floor_drops_everything() {
    let (_tmp, config, pool) = setup().await;
    seed_search_corpus(&pool).await;

    // Weakly aligned query: s ≈ 0.28 for one tool, 0 for the other; no
    // keyword hits. All relevance ≤ 0.3 → empty results, full candidate
    // count.
    let response = retrieve_with_vector(
        &pool,
        &config,
        "zzz qqq xxx",
        &[0.4, 0.0, 0.9165, 0.0],
        1,
        10,
    )
    .await
    .unwrap();

    assert_eq!(response.total_candidates, 2);
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_retrieve_keyword_boost_changes_ranking() {
    let (_tmp, config, pool) = setup().await;
    let (weather_id, mail_id) = seed_search_corpus(&pool).await;

    // Query vector half-aligned with mail, strongly with weather, but the
    // query text matches the mail tool's keywords.
    let response = retrieve_with_vector(
        &pool,
        &config,
        "send email message",
        &[0.866, 0.5, 0.0, 0.0],
        1,
        10,
    )
    .await
    .unwrap();

    assert_eq!(response.results.len(), 2);
    // weather: 0.7·0.866 ≈ 0.606; mail: 0.7·0.5 + 0.3·1.0 = 0.65.
    assert_eq!(response.results[0].tool_id, mail_id);
    assert_eq!(response.results[1].tool_id, weather_id);
    assert!(response.results[0].requires_auth);
}

#[tokio::test]
async fn test_retrieve_quality_reranks() {
    let (_tmp, config, pool) = setup().await;
    let (weather_id, mail_id) = seed_search_corpus(&pool).await;

    // Equal relevance for both tools, but mail's server carries a strong
    // market score: quality breaks the tie.
    sqlx::query(
        r#"
        INSERT INTO market_rankings (server_name, total_score, updated_at)
        VALUES ('io.acme/mail', 0.9, ?)
        "#,
    )
    .bind(db::now_utc())
    .execute(&pool)
    .await
    .unwrap();

    let response = retrieve_with_vector(
        &pool,
        &config,
        "???",
        &[0.7071, 0.7071, 0.0, 0.0],
        1,
        10,
    )
    .await
    .unwrap();

    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].tool_id, mail_id);
    assert!((response.results[0].quality - 0.9).abs() < 1e-9);
    assert!(response.results[0].score > response.results[1].score);
    assert_eq!(response.results[1].tool_id, weather_id);
    assert_eq!(response.results[1].quality, 0.0);
}

#[tokio::test]
async fn test_retrieve_paging() {
    let (_tmp, config, pool) = setup().await;
    seed_search_corpus(&pool).await;

    let page1 = retrieve_with_vector(&pool, &config, "???", &[0.7071, 0.7071, 0.0, 0.0], 1, 1)
        .await
        .unwrap();
    let page2 = retrieve_with_vector(&pool, &config, "???", &[0.7071, 0.7071, 0.0, 0.0], 2, 1)
        .await
        .unwrap();

    assert_eq!(page1.total_candidates, 2);
    assert_eq!(page1.results.len(), 1);
    assert_eq!(page2.results.len(), 1);
    assert_ne!(page1.results[0].tool_id, page2.results[0].tool_id);

    let page3 = retrieve_with_vector(&pool, &config, "???", &[0.7071, 0.7071, 0.0, 0.0], 3, 1)
        .await
        .unwrap();
    assert!(page3.results.is_empty());
    assert_eq!(page3.total_candidates, 2);
}

// ============ Views ============

#[tokio::test]
async fn test_v_tools_full_requires_auth() {
    let (_tmp, _config, pool) = setup().await;
    seed_search_corpus(&pool).await;

    let rows = sqlx::query("SELECT server_name, requires_auth FROM v_tools_full ORDER BY server_name")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<String, _>("server_name"), "io.acme/mail");
    assert!(rows[0].get::<bool, _>("requires_auth"));
    assert_eq!(rows[1].get::<String, _>("server_name"), "io.acme/weather");
    assert!(!rows[1].get::<bool, _>("requires_auth"));
}

#[tokio::test]
async fn test_v_server_summary_aggregates() {
    let (_tmp, _config, pool) = setup().await;
    seed_search_corpus(&pool).await;

    sqlx::query(
        "INSERT INTO server_packages (server_name, registry_type, identifier, transport_type) VALUES ('io.acme/mail', 'npm', 'acme-mail', 'stdio')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let row = sqlx::query(
        "SELECT package_types, auth_var_count, tool_count, market_rank FROM v_server_summary WHERE name = 'io.acme/mail'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.get::<Option<String>, _>("package_types").unwrap(), "npm");
    assert_eq!(row.get::<i64, _>("auth_var_count"), 1);
    assert_eq!(row.get::<i64, _>("tool_count"), 1);
    assert_eq!(row.get::<f64, _>("market_rank"), 0.0);
}
