//! Database schema migrations.
//!
//! Creates all tables for registry records, enrichment signals, backlink
//! scoring, market rankings, extracted tools, and the search index. Every
//! statement is `CREATE ... IF NOT EXISTS` so `wisp init` is idempotent and
//! schema additions are forward-compatible.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    create_views(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the complete schema on an open pool.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ==================== Registry tables ====================

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            description TEXT,
            version TEXT,
            repository_url TEXT,
            website_url TEXT,
            status TEXT,
            published_at TEXT,
            updated_at TEXT,
            raw_json TEXT,
            ingested_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS server_packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            registry_type TEXT,
            identifier TEXT,
            version TEXT,
            transport_type TEXT,
            runtime_hint TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS server_remotes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            transport_type TEXT,
            url TEXT,
            headers_json TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS server_local_sources (
            server_name TEXT PRIMARY KEY,
            command TEXT NOT NULL,
            args_json TEXT,
            working_dir TEXT,
            env_json TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environment_variables (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            var_name TEXT NOT NULL,
            description TEXT,
            is_required BOOLEAN DEFAULT FALSE,
            is_secret BOOLEAN DEFAULT FALSE,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ==================== Enrichment signal tables ====================

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS github_signals (
            server_name TEXT PRIMARY KEY,
            stars INTEGER DEFAULT 0,
            forks INTEGER DEFAULT 0,
            open_issues INTEGER DEFAULT 0,
            watchers INTEGER DEFAULT 0,
            subscribers INTEGER DEFAULT 0,
            pushed_at TEXT,
            created_at TEXT,
            license TEXT,
            language TEXT,
            topics_json TEXT,
            is_archived BOOLEAN DEFAULT FALSE,
            is_fork BOOLEAN DEFAULT FALSE,
            default_branch TEXT,
            enriched_at TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS package_downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            registry_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            last_day INTEGER,
            last_week INTEGER,
            last_month INTEGER,
            total_downloads INTEGER,
            enriched_at TEXT,
            UNIQUE(server_name, registry_type, identifier),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dependency_signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            package_name TEXT NOT NULL,
            platform TEXT,
            dependents_count INTEGER,
            dependent_repos_count INTEGER,
            sourcerank INTEGER,
            enriched_at TEXT,
            UNIQUE(server_name, package_name),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cross_listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            source TEXT NOT NULL,
            listing_id TEXT,
            slug TEXT,
            url TEXT,
            license TEXT,
            enriched_at TEXT,
            UNIQUE(server_name, source),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            search_term TEXT NOT NULL,
            config_type TEXT NOT NULL,
            reference_count INTEGER DEFAULT 0,
            sample_repos TEXT,
            enriched_at TEXT,
            UNIQUE(server_name, config_type),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_cost_hints (
            server_name TEXT PRIMARY KEY,
            requires_paid_service BOOLEAN DEFAULT FALSE,
            paid_services TEXT,
            free_tier_available BOOLEAN DEFAULT FALSE,
            enriched_at TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_status (
            server_name TEXT NOT NULL,
            enrichment_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('success', 'permanent_failure', 'transient_failure')),
            failure_reason TEXT,
            last_attempted_at TEXT,
            retry_count INTEGER DEFAULT 0,
            PRIMARY KEY (server_name, enrichment_type),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ==================== Extraction tables ====================

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            title TEXT,
            description TEXT,
            input_schema TEXT,
            output_schema TEXT,
            extracted_at TEXT,
            UNIQUE(server_name, tool_name),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_parameters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            param_name TEXT NOT NULL,
            param_type TEXT,
            description TEXT,
            is_required BOOLEAN DEFAULT FALSE,
            default_value TEXT,
            enum_values TEXT,
            UNIQUE(server_name, tool_name, param_name),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            uri TEXT NOT NULL,
            name TEXT,
            description TEXT,
            mime_type TEXT,
            extracted_at TEXT,
            UNIQUE(server_name, uri),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            prompt_name TEXT NOT NULL,
            description TEXT,
            arguments_json TEXT,
            extracted_at TEXT,
            UNIQUE(server_name, prompt_name),
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_extraction_status (
            server_name TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK(status IN ('success', 'permanent_failure', 'transient_failure', 'pending')),
            failure_reason TEXT,
            tools_count INTEGER DEFAULT 0,
            resources_count INTEGER DEFAULT 0,
            prompts_count INTEGER DEFAULT 0,
            connection_method TEXT,
            last_attempted_at TEXT,
            last_successful_at TEXT,
            retry_count INTEGER DEFAULT 0,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ==================== Backlink scoring tables ====================

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backlink_edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT NOT NULL,
            referencer_repo TEXT NOT NULL,
            tier TEXT NOT NULL,
            tier_weight REAL NOT NULL,
            repo_stars INTEGER,
            repo_pushed_at TEXT,
            is_archived BOOLEAN DEFAULT FALSE,
            is_fork BOOLEAN DEFAULT FALSE,
            edge_score REAL,
            created_at TEXT,
            UNIQUE(server_name, referencer_repo, tier)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backlink_scores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            server_name TEXT UNIQUE NOT NULL,
            raw_score REAL DEFAULT 0,
            normalized_score REAL DEFAULT 0,
            tier1_contribution REAL DEFAULT 0,
            tier2_contribution REAL DEFAULT 0,
            tier3_contribution REAL DEFAULT 0,
            tier4_contribution REAL DEFAULT 0,
            unique_repos INTEGER DEFAULT 0,
            computed_at TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS market_rankings (
            server_name TEXT PRIMARY KEY,
            total_score REAL DEFAULT 0,
            usage_score REAL DEFAULT 0,
            reputation_score REAL DEFAULT 0,
            activity_score REAL DEFAULT 0,
            reach_score REAL DEFAULT 0,
            is_zero_auth BOOLEAN DEFAULT FALSE,
            is_verified BOOLEAN DEFAULT FALSE,
            updated_at TEXT,
            FOREIGN KEY (server_name) REFERENCES servers(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ==================== Search index tables ====================

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tools_search (
            tool_id INTEGER PRIMARY KEY,
            tool_name TEXT,
            server_name TEXT,
            name_text TEXT,
            desc_text TEXT,
            params_text TEXT,
            full_doc TEXT,
            updated_at TEXT,
            FOREIGN KEY (tool_id) REFERENCES tools(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual tables are not idempotent natively, check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='tools_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE tools_fts USING fts5(
                name_text,
                desc_text,
                params_text,
                content='tools_search',
                content_rowid='tool_id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // No FK: tools_search is deleted and rebuilt wholesale, and vectors for
    // stable tool ids survive the rebuild.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_vectors (
            tool_id INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ==================== Indexes ====================

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_servers_status ON servers(status)",
        "CREATE INDEX IF NOT EXISTS idx_packages_server ON server_packages(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_packages_registry ON server_packages(registry_type)",
        "CREATE INDEX IF NOT EXISTS idx_remotes_server ON server_remotes(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_env_server ON environment_variables(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_env_secret ON environment_variables(is_secret)",
        "CREATE INDEX IF NOT EXISTS idx_tools_server ON tools(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_deps_server ON dependency_signals(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_config_server ON config_references(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_edges_server ON backlink_edges(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_edges_repo ON backlink_edges(referencer_repo)",
        "CREATE INDEX IF NOT EXISTS idx_edges_tier ON backlink_edges(tier)",
        "CREATE INDEX IF NOT EXISTS idx_scores_normalized ON backlink_scores(normalized_score)",
        "CREATE INDEX IF NOT EXISTS idx_rankings_score ON market_rankings(total_score)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

/// Rebuild the derived views. Dropped and recreated so view definitions can
/// evolve without a schema version bump.
pub async fn create_views(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DROP VIEW IF EXISTS v_server_summary")
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        CREATE VIEW v_server_summary AS
        SELECT
            s.name,
            s.description,
            s.version,
            s.status,
            s.repository_url,
            (SELECT GROUP_CONCAT(DISTINCT sp.registry_type)
               FROM server_packages sp WHERE sp.server_name = s.name) AS package_types,
            (SELECT COUNT(*) FROM environment_variables ev
              WHERE ev.server_name = s.name AND ev.is_secret = 1) AS auth_var_count,
            (SELECT COUNT(*) FROM tools t WHERE t.server_name = s.name) AS tool_count,
            (SELECT sr.url FROM server_remotes sr
              WHERE sr.server_name = s.name LIMIT 1) AS remote_url,
            COALESCE((SELECT mr.total_score FROM market_rankings mr
              WHERE mr.server_name = s.name), 0) AS market_rank
        FROM servers s
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP VIEW IF EXISTS v_tools_full")
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        CREATE VIEW v_tools_full AS
        SELECT
            t.id AS tool_id,
            t.server_name,
            t.tool_name,
            t.title,
            t.description,
            t.input_schema,
            t.output_schema,
            s.description AS server_description,
            EXISTS (SELECT 1 FROM environment_variables ev
              WHERE ev.server_name = t.server_name AND ev.is_secret = 1) AS requires_auth
        FROM tools t
        JOIN servers s ON s.name = t.server_name
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
