//! Configuration parsing and validation.
//!
//! Wisp is configured via a TOML file (default: `wisp.toml`). The config
//! defines the database path, upstream registry endpoint, enrichment cadence,
//! retrieval tuning, embedding settings, and the gateway bind address.
//!
//! Secrets never live in the config file: `GITHUB_TOKEN` and
//! `LIBRARIES_IO_API_KEY` are read from the process environment (populated
//! from `.env` at startup).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            registry: RegistryConfig::default(),
            enrichment: EnrichmentConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/wisp.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL of the upstream MCP registry API.
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    /// Page size for registry listing (the API caps at 100).
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            page_limit: default_page_limit(),
        }
    }
}

fn default_registry_url() -> String {
    "https://registry.modelcontextprotocol.io/v0.1".to_string()
}

fn default_page_limit() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// Re-enrich GitHub signals older than this many days.
    #[serde(default = "default_github_refresh_days")]
    pub github_refresh_days: u32,
    /// Re-enrich download counts older than this many days.
    #[serde(default = "default_downloads_refresh_days")]
    pub downloads_refresh_days: u32,
    /// Re-enrich dependency signals older than this many days.
    #[serde(default = "default_dependents_refresh_days")]
    pub dependents_refresh_days: u32,
    /// Commit a durable checkpoint every N processed servers.
    #[serde(default = "default_commit_every")]
    pub commit_every: usize,
    /// Inter-request politeness delay against the GitHub REST API.
    #[serde(default = "default_github_delay_ms")]
    pub github_delay_ms: u64,
    /// Inter-request politeness delay against libraries.io.
    #[serde(default = "default_dependents_delay_ms")]
    pub dependents_delay_ms: u64,
    /// Inter-request politeness delay for the remaining sources.
    #[serde(default = "default_source_delay_ms")]
    pub source_delay_ms: u64,
    /// Per-request timeout for enrichment HTTP calls, seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Retry budget for transient HTTP failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            github_refresh_days: default_github_refresh_days(),
            downloads_refresh_days: default_downloads_refresh_days(),
            dependents_refresh_days: default_dependents_refresh_days(),
            commit_every: default_commit_every(),
            github_delay_ms: default_github_delay_ms(),
            dependents_delay_ms: default_dependents_delay_ms(),
            source_delay_ms: default_source_delay_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_github_refresh_days() -> u32 {
    7
}
fn default_downloads_refresh_days() -> u32 {
    1
}
fn default_dependents_refresh_days() -> u32 {
    7
}
fn default_commit_every() -> usize {
    10
}
fn default_github_delay_ms() -> u64 {
    500
}
fn default_dependents_delay_ms() -> u64 {
    1500
}
fn default_source_delay_ms() -> u64 {
    250
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidate pool size per side (keyword and vector) before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Minimum combined relevance; candidates at or below are dropped.
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            relevance_floor: default_relevance_floor(),
        }
    }
}

fn default_candidate_k() -> usize {
    200
}
fn default_relevance_floor() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Embedding backend: `"local"` (fastembed) or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name for the local backend.
    #[serde(default = "default_model")]
    pub model: String,
    /// Embedding vector dimensionality.
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Batch size for the embedding backfill.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_model() -> String {
    "bge-base-en-v1.5".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    16
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Local tokens file listed by `GET /keys`.
    #[serde(default = "default_tokens_file")]
    pub tokens_file: PathBuf,
    /// Per-call timeout for tool invocations, seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tokens_file: default_tokens_file(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_tokens_file() -> PathBuf {
    PathBuf::from(".tokens")
}
fn default_call_timeout_secs() -> u64 {
    60
}

/// Load and validate a config file. A missing file yields the defaults so
/// `wisp init` works out of the box.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.candidate_k == 0 {
        anyhow::bail!("retrieval.candidate_k must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.relevance_floor) {
        anyhow::bail!("retrieval.relevance_floor must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or local.",
            other
        ),
    }

    if config.enrichment.commit_every == 0 {
        anyhow::bail!("enrichment.commit_every must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retrieval.candidate_k, 200);
        assert_eq!(config.embedding.dims, 768);
        assert_eq!(config.enrichment.commit_every, 10);
        assert_eq!(config.server.call_timeout_secs, 60);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = load_config(Path::new("/nonexistent/wisp.toml")).unwrap();
        assert_eq!(config.registry.page_limit, 100);
    }

    #[test]
    fn test_rejects_bad_floor() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[retrieval]\nrelevance_floor = 1.5\n").unwrap();
        assert!(load_config(tmp.path()).is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[embedding]\nprovider = \"openai\"\n").unwrap();
        assert!(load_config(tmp.path()).is_err());
    }
}
