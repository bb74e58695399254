//! Backlink-graph scoring.
//!
//! Aggregates observed references to each server — client config files found
//! via code search, dependent packages, curated lists — into a per-server
//! backlink score:
//!
//! 1. Union the sample repos across all config references; fetch GitHub
//!    metadata for repos not yet cached (bounded at 10 concurrent fetches)
//!    and store it as synthetic `__cache__` edges.
//! 2. Per server, walk the config references, drop self-references,
//!    deduplicate per `(repo, tier)`, and score each edge:
//!    `tier_weight · (1 + log1p(stars)) · exp(−0.5·years_since_push) · quality`.
//! 3. Add a synthetic tier-2 contribution per dependency signal.
//! 4. `raw_score` is the sum of tier contributions; normalisation maps
//!    `log1p(raw_score)` against the corpus 99th percentile into `[0, 1]`.
//!
//! The scorer assumes a quiescent snapshot: it must not run concurrently
//! with config-reference or dependents enrichment on the same database.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::enrich::github::github_headers;
use crate::fetch::{FetchOutcome, Fetcher, Service};
use crate::models::{parse_github_repo, GitHubRepo};

/// Fixed tier weights. Every persisted edge must carry the weight of its
/// tier, metadata-cache rows excepted.
pub const TIER_WEIGHTS: &[(&str, f64)] = &[
    ("tier1_config", 1.0),
    ("tier2_dependency", 0.8),
    ("tier3_deployment", 0.6),
    ("tier4_curated", 0.3),
    ("tier5_mention", 0.1),
];

/// Synthetic server name for cached referencer metadata.
pub const METADATA_CACHE_SERVER: &str = "__cache__";
pub const METADATA_CACHE_TIER: &str = "metadata_cache";

const METADATA_FETCH_CONCURRENCY: usize = 10;

pub fn tier_weight(tier: &str) -> Option<f64> {
    TIER_WEIGHTS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, w)| *w)
}

/// `ln(1 + max(0, x))`, the log-dampening used throughout scoring.
pub fn log1p(x: f64) -> f64 {
    x.max(0.0).ln_1p()
}

/// 99th-percentile divisor: `sorted[⌊0.99·n⌋]`, clamped to at least 1e-6 so
/// normalisation never divides by zero.
pub fn percentile99(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1e-6;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((0.99 * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    sorted[idx].max(1e-6)
}

/// Metadata known about a referencer repository.
#[derive(Debug, Clone, Default)]
pub struct RepoMetadata {
    pub stars: Option<i64>,
    pub pushed_at: Option<String>,
    pub is_archived: bool,
    pub is_fork: bool,
}

/// Score a single backlink edge.
pub fn edge_score(weight: f64, meta: &RepoMetadata, now: chrono::DateTime<chrono::Utc>) -> f64 {
    let star_factor = 1.0 + log1p(meta.stars.unwrap_or(0).max(0) as f64);
    let recency = recency_factor(meta.pushed_at.as_deref(), now);
    let quality = (if meta.is_archived { 0.2 } else { 1.0 }) * (if meta.is_fork { 0.5 } else { 1.0 });
    weight * star_factor * recency * quality
}

/// `exp(−0.5 · years_since_pushed_at)`; 0.5 when the push date is unknown.
pub fn recency_factor(pushed_at: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> f64 {
    let Some(pushed) = pushed_at else {
        return 0.5;
    };
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(pushed) else {
        return 0.5;
    };
    let years = (now - parsed.with_timezone(&chrono::Utc)).num_days().max(0) as f64 / 365.25;
    (-0.5 * years).exp()
}

/// Synthetic tier-2 contribution for one dependency signal.
pub fn dependency_contribution(dependents_count: i64, dependent_repos_count: i64) -> f64 {
    let weight = tier_weight("tier2_dependency").unwrap_or(0.8);
    weight
        * log1p(dependents_count.max(0) as f64)
        * (1.0 + dependent_repos_count.max(0) as f64 / 100.0).sqrt()
}

/// Normalise raw scores across the corpus: `min(1, log1p(raw)/q99)` for
/// positive raws, 0 otherwise, where q99 is the 99th percentile of the
/// positive scores in log space.
pub fn normalize_scores(raw: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let positives: Vec<f64> = raw
        .values()
        .filter(|&&v| v > 0.0)
        .map(|&v| log1p(v))
        .collect();
    let q = percentile99(&positives);

    raw.iter()
        .map(|(name, &score)| {
            let normalized = if score > 0.0 {
                (log1p(score) / q).min(1.0)
            } else {
                0.0
            };
            (name.clone(), normalized)
        })
        .collect()
}

struct PendingEdge {
    server_name: String,
    referencer_repo: String,
    tier: &'static str,
    tier_weight: f64,
    meta: RepoMetadata,
    score: f64,
}

#[derive(Default)]
struct ServerAccumulator {
    tier1: f64,
    tier2: f64,
    tier3: f64,
    tier4: f64,
    unique_repos: HashSet<String>,
}

pub async fn run_score(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let pool = db::connect(config).await?;
    let fetcher = Fetcher::new(
        std::time::Duration::from_secs(config.enrichment.fetch_timeout_secs),
        config.enrichment.max_retries,
        std::time::Duration::from_millis(config.enrichment.base_delay_ms),
    )?;

    // ---- Step 1: ensure referencer metadata is cached ----
    let referenced = collect_sample_repos(&pool).await?;
    let cached: HashSet<String> = sqlx::query("SELECT DISTINCT referencer_repo FROM backlink_edges")
        .fetch_all(&pool)
        .await?
        .iter()
        .map(|r| r.get::<String, _>("referencer_repo").to_lowercase())
        .collect();

    let missing: Vec<String> = referenced
        .iter()
        .filter(|repo| !cached.contains(&repo.to_lowercase()))
        .cloned()
        .collect();

    if !missing.is_empty() {
        println!("  fetching metadata for {} referencer repos...", missing.len());
        let fetched = fetch_repo_metadata(&fetcher, &missing, cancel).await;
        for (repo, meta) in &fetched {
            cache_metadata(&pool, repo, meta).await?;
            patch_null_stars(&pool, repo, meta).await?;
        }
    }

    let metadata = load_repo_metadata(&pool).await?;

    // ---- Steps 2–4: per-server accumulation ----
    let now = chrono::Utc::now();
    let servers = sqlx::query("SELECT name, repository_url FROM servers")
        .fetch_all(&pool)
        .await?;

    let mut accumulators: BTreeMap<String, ServerAccumulator> = BTreeMap::new();
    let mut pending_edges: Vec<PendingEdge> = Vec::new();

    for row in &servers {
        let name: String = row.get("name");
        let repo_url: String = row.get("repository_url");
        let own_repo = parse_github_repo(&repo_url)
            .map(|(owner, repo)| format!("{owner}/{repo}").to_lowercase());

        let acc = accumulators.entry(name.clone()).or_default();
        let mut seen: HashSet<(String, &str)> = HashSet::new();

        let refs = sqlx::query(
            "SELECT config_type, sample_repos FROM config_references WHERE server_name = ?",
        )
        .bind(&name)
        .fetch_all(&pool)
        .await?;

        for r in &refs {
            let samples_json: Option<String> = r.get("sample_repos");
            let samples: Vec<String> = samples_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default();

            for repo in &samples {
                let lower = repo.to_lowercase();
                if own_repo.as_deref() == Some(lower.as_str()) {
                    continue;
                }
                if !seen.insert((lower.clone(), "tier1_config")) {
                    continue;
                }

                let meta = metadata.get(&lower).cloned().unwrap_or_default();
                let weight = tier_weight("tier1_config").unwrap_or(1.0);
                let score = edge_score(weight, &meta, now);

                acc.tier1 += score;
                acc.unique_repos.insert(lower);
                pending_edges.push(PendingEdge {
                    server_name: name.clone(),
                    referencer_repo: repo.clone(),
                    tier: "tier1_config",
                    tier_weight: weight,
                    meta,
                    score,
                });
            }
        }

        let deps = sqlx::query(
            "SELECT dependents_count, dependent_repos_count FROM dependency_signals WHERE server_name = ?",
        )
        .bind(&name)
        .fetch_all(&pool)
        .await?;

        for d in &deps {
            let dependents: Option<i64> = d.get("dependents_count");
            let dependent_repos: Option<i64> = d.get("dependent_repos_count");
            acc.tier2 +=
                dependency_contribution(dependents.unwrap_or(0), dependent_repos.unwrap_or(0));
        }
    }

    // ---- Step 5: normalise across the corpus ----
    let raw: BTreeMap<String, f64> = accumulators
        .iter()
        .map(|(name, acc)| (name.clone(), acc.tier1 + acc.tier2 + acc.tier3 + acc.tier4))
        .collect();
    let normalized = normalize_scores(&raw);

    // ---- Step 6: persist ----
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM backlink_edges WHERE server_name != ?")
        .bind(METADATA_CACHE_SERVER)
        .execute(&mut *tx)
        .await?;

    for edge in &pending_edges {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO backlink_edges
                (server_name, referencer_repo, tier, tier_weight, repo_stars,
                 repo_pushed_at, is_archived, is_fork, edge_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.server_name)
        .bind(&edge.referencer_repo)
        .bind(edge.tier)
        .bind(edge.tier_weight)
        .bind(edge.meta.stars)
        .bind(edge.meta.pushed_at.as_deref())
        .bind(edge.meta.is_archived)
        .bind(edge.meta.is_fork)
        .bind(edge.score)
        .bind(db::now_utc())
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DELETE FROM backlink_scores")
        .execute(&mut *tx)
        .await?;

    let mut scored = 0usize;
    for (name, acc) in &accumulators {
        let raw_score = acc.tier1 + acc.tier2 + acc.tier3 + acc.tier4;
        sqlx::query(
            r#"
            INSERT INTO backlink_scores
                (server_name, raw_score, normalized_score, tier1_contribution,
                 tier2_contribution, tier3_contribution, tier4_contribution,
                 unique_repos, computed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(raw_score)
        .bind(normalized.get(name).copied().unwrap_or(0.0))
        .bind(acc.tier1)
        .bind(acc.tier2)
        .bind(acc.tier3)
        .bind(acc.tier4)
        .bind(acc.unique_repos.len() as i64)
        .bind(db::now_utc())
        .execute(&mut *tx)
        .await?;
        scored += 1;
    }

    tx.commit().await?;

    println!("score backlinks");
    println!("  edges written: {}", pending_edges.len());
    println!("  servers scored: {scored}");
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Union of sample repos across all config references.
async fn collect_sample_repos(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT sample_repos FROM config_references")
        .fetch_all(pool)
        .await?;

    let mut seen = HashSet::new();
    let mut repos = Vec::new();
    for row in &rows {
        let json: Option<String> = row.get("sample_repos");
        let samples: Vec<String> = json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        for repo in samples {
            if seen.insert(repo.to_lowercase()) {
                repos.push(repo);
            }
        }
    }
    Ok(repos)
}

/// Fetch GitHub metadata for a set of `owner/repo` names, at most 10 at a
/// time. Unreachable repos simply produce no metadata.
async fn fetch_repo_metadata(
    fetcher: &Fetcher,
    repos: &[String],
    cancel: &CancellationToken,
) -> Vec<(String, RepoMetadata)> {
    let semaphore = Arc::new(Semaphore::new(METADATA_FETCH_CONCURRENCY));
    let mut set: JoinSet<Option<(String, RepoMetadata)>> = JoinSet::new();

    for repo in repos {
        let repo = repo.clone();
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        let semaphore = Arc::clone(&semaphore);

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            if cancel.is_cancelled() {
                return None;
            }
            let url = format!("https://api.github.com/repos/{repo}");
            let outcome = fetcher
                .fetch(&url, &github_headers(), &[], Service::GitHub, &cancel)
                .await
                .ok()?;
            match outcome {
                FetchOutcome::Response(response) if response.status().is_success() => {
                    let data: GitHubRepo = response.json().await.ok()?;
                    Some((
                        repo,
                        RepoMetadata {
                            stars: Some(data.stargazers_count),
                            pushed_at: data.pushed_at,
                            is_archived: data.archived,
                            is_fork: data.fork,
                        },
                    ))
                }
                _ => None,
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        if let Ok(Some(pair)) = joined {
            results.push(pair);
        }
    }
    results
}

async fn cache_metadata(pool: &SqlitePool, repo: &str, meta: &RepoMetadata) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO backlink_edges
            (server_name, referencer_repo, tier, tier_weight, repo_stars,
             repo_pushed_at, is_archived, is_fork, edge_score, created_at)
        VALUES (?, ?, ?, 0.0, ?, ?, ?, ?, 0.0, ?)
        "#,
    )
    .bind(METADATA_CACHE_SERVER)
    .bind(repo)
    .bind(METADATA_CACHE_TIER)
    .bind(meta.stars)
    .bind(meta.pushed_at.as_deref())
    .bind(meta.is_archived)
    .bind(meta.is_fork)
    .bind(db::now_utc())
    .execute(pool)
    .await?;
    Ok(())
}

/// Backfill metadata onto edges persisted before the repo was ever fetched.
async fn patch_null_stars(pool: &SqlitePool, repo: &str, meta: &RepoMetadata) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE backlink_edges
        SET repo_stars = ?, repo_pushed_at = ?, is_archived = ?, is_fork = ?
        WHERE referencer_repo = ? COLLATE NOCASE AND repo_stars IS NULL
        "#,
    )
    .bind(meta.stars)
    .bind(meta.pushed_at.as_deref())
    .bind(meta.is_archived)
    .bind(meta.is_fork)
    .bind(repo)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load the metadata cache keyed by lowercased `owner/repo`, preferring a
/// row with non-NULL stars when a repo appears more than once.
async fn load_repo_metadata(pool: &SqlitePool) -> Result<HashMap<String, RepoMetadata>> {
    let rows = sqlx::query(
        r#"
        SELECT referencer_repo, repo_stars, repo_pushed_at, is_archived, is_fork
        FROM backlink_edges
        ORDER BY (repo_stars IS NULL)
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut map: HashMap<String, RepoMetadata> = HashMap::new();
    for row in &rows {
        let repo: String = row.get("referencer_repo");
        let key = repo.to_lowercase();
        // First row wins; ordering put non-NULL stars first.
        map.entry(key).or_insert_with(|| RepoMetadata {
            stars: row.get("repo_stars"),
            pushed_at: row.get("repo_pushed_at"),
            is_archived: row.get("is_archived"),
            is_fork: row.get("is_fork"),
        });
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_weights_fixed() {
        assert_eq!(tier_weight("tier1_config"), Some(1.0));
        assert_eq!(tier_weight("tier2_dependency"), Some(0.8));
        assert_eq!(tier_weight("tier3_deployment"), Some(0.6));
        assert_eq!(tier_weight("tier4_curated"), Some(0.3));
        assert_eq!(tier_weight("tier5_mention"), Some(0.1));
        assert_eq!(tier_weight("metadata_cache"), None);
    }

    #[test]
    fn test_edge_score_fresh_one_star() {
        // tier1, 1 star, pushed now, neither archived nor fork:
        // 1.0 · (1 + ln 2) · 1 · 1 ≈ 1.693
        let now = chrono::Utc::now();
        let meta = RepoMetadata {
            stars: Some(1),
            pushed_at: Some(now.to_rfc3339()),
            is_archived: false,
            is_fork: false,
        };
        let score = edge_score(1.0, &meta, now);
        assert!((score - (1.0 + 2.0f64.ln())).abs() < 1e-3, "score = {score}");
    }

    #[test]
    fn test_edge_score_quality_penalties() {
        let now = chrono::Utc::now();
        let base = RepoMetadata {
            stars: Some(0),
            pushed_at: Some(now.to_rfc3339()),
            is_archived: false,
            is_fork: false,
        };
        let clean = edge_score(1.0, &base, now);

        let archived = RepoMetadata {
            is_archived: true,
            ..base.clone()
        };
        assert!((edge_score(1.0, &archived, now) - clean * 0.2).abs() < 1e-9);

        let fork = RepoMetadata {
            is_fork: true,
            ..base.clone()
        };
        assert!((edge_score(1.0, &fork, now) - clean * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_edge_score_unknown_push_date() {
        let now = chrono::Utc::now();
        let meta = RepoMetadata {
            stars: Some(0),
            pushed_at: None,
            is_archived: false,
            is_fork: false,
        };
        // recency defaults to 0.5
        assert!((edge_score(1.0, &meta, now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_edge_score_decays_with_age() {
        let now = chrono::Utc::now();
        let year_ago = (now - chrono::Duration::days(365)).to_rfc3339();
        let meta = RepoMetadata {
            stars: Some(0),
            pushed_at: Some(year_ago),
            is_archived: false,
            is_fork: false,
        };
        let score = edge_score(1.0, &meta, now);
        assert!((score - (-0.5f64).exp()).abs() < 1e-2, "score = {score}");
    }

    #[test]
    fn test_dependency_contribution() {
        // 0.8 · log1p(10) · sqrt(1 + 50/100)
        let expected = 0.8 * 11.0f64.ln() * 1.5f64.sqrt();
        assert!((dependency_contribution(10, 50) - expected).abs() < 1e-9);
        assert_eq!(dependency_contribution(0, 0), 0.0);
    }

    #[test]
    fn test_percentile99_singleton() {
        assert_eq!(percentile99(&[3.0]), 3.0);
        assert_eq!(percentile99(&[]), 1e-6);
        assert_eq!(percentile99(&[0.0]), 1e-6);
    }

    #[test]
    fn test_normalize_bounds_and_zero() {
        let mut raw = BTreeMap::new();
        raw.insert("a".to_string(), 10.0);
        raw.insert("b".to_string(), 100.0);
        raw.insert("c".to_string(), 0.0);
        let norm = normalize_scores(&raw);
        for v in norm.values() {
            assert!((0.0..=1.0).contains(v));
        }
        assert_eq!(norm["c"], 0.0);
        assert_eq!(norm["b"], 1.0);
    }

    #[test]
    fn test_normalize_monotone() {
        let mut raw = BTreeMap::new();
        raw.insert("low".to_string(), 5.0);
        raw.insert("mid".to_string(), 50.0);
        raw.insert("high".to_string(), 500.0);
        let norm = normalize_scores(&raw);
        assert!(norm["low"] <= norm["mid"]);
        assert!(norm["mid"] <= norm["high"]);
    }
}
