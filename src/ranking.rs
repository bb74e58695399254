//! Marketplace ranking.
//!
//! Combines four pillars into one bounded score per server:
//!
//! - **Usage** — backlink raw score, log-dampened.
//! - **Reputation** — GitHub stars and forks, log10-dampened.
//! - **Activity** — recency of the last push, already in `[0, 1]`.
//! - **Reach** — total weekly downloads across the server's packages.
//!
//! Each pillar normalises against the corpus 99th percentile, then
//! `total = 0.45·U + 0.30·R + 0.15·A + 0.10·C`, plus `+0.05` when the
//! server needs no secrets and `+0.10` when the repo owner is a trusted
//! org, clamped to `[0, 1]`. Missing signals are zeros, never errors.

use anyhow::Result;
use sqlx::Row;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::backlink::{log1p, percentile99, recency_factor};
use crate::config::Config;
use crate::db;
use crate::models::parse_github_repo;

/// Publishers whose servers get the verified bonus.
pub const TRUSTED_ORGS: &[&str] = &[
    "modelcontextprotocol",
    "anthropics",
    "github",
    "microsoft",
    "awslabs",
    "cloudflare",
    "stripe",
    "elevenlabs",
    "e2b-dev",
    "supabase",
];

/// Pillar weights: usage, reputation, activity, reach.
pub const PILLAR_WEIGHTS: (f64, f64, f64, f64) = (0.45, 0.30, 0.15, 0.10);
pub const ZERO_AUTH_BONUS: f64 = 0.05;
pub const VERIFIED_BONUS: f64 = 0.10;

pub fn is_trusted_org(repository_url: &str) -> bool {
    parse_github_repo(repository_url)
        .map(|(owner, _)| TRUSTED_ORGS.contains(&owner.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Raw per-server signals entering the ranker.
#[derive(Debug, Clone, Default)]
pub struct RankInputs {
    pub backlink_raw: f64,
    pub stars: i64,
    pub forks: i64,
    pub pushed_at: Option<String>,
    pub weekly_downloads: i64,
    pub secret_var_count: i64,
    pub repository_url: String,
}

/// Computed pillar scores for one server.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub total: f64,
    pub usage: f64,
    pub reputation: f64,
    pub activity: f64,
    pub reach: f64,
    pub is_zero_auth: bool,
    pub is_verified: bool,
}

/// Rank a full cohort. Normalisation divisors come from the cohort itself,
/// so a singleton corpus normalises its own top signal to 1.0.
pub fn rank_cohort(
    inputs: &BTreeMap<String, RankInputs>,
    now: chrono::DateTime<chrono::Utc>,
) -> BTreeMap<String, Ranking> {
    let usage_raw: Vec<f64> = inputs.values().map(|i| log1p(i.backlink_raw)).collect();
    let rep_raw: Vec<f64> = inputs
        .values()
        .map(|i| reputation_signal(i.stars, i.forks))
        .collect();
    let reach_raw: Vec<f64> = inputs
        .values()
        .map(|i| reach_signal(i.weekly_downloads))
        .collect();

    let usage_q = percentile99(&usage_raw);
    let rep_q = percentile99(&rep_raw);
    let reach_q = percentile99(&reach_raw);

    let (wu, wr, wa, wc) = PILLAR_WEIGHTS;

    inputs
        .iter()
        .map(|(name, input)| {
            let usage = (log1p(input.backlink_raw) / usage_q).min(1.0);
            let reputation = (reputation_signal(input.stars, input.forks) / rep_q).min(1.0);
            let activity = recency_factor(input.pushed_at.as_deref(), now);
            let reach = (reach_signal(input.weekly_downloads) / reach_q).min(1.0);

            let is_zero_auth = input.secret_var_count == 0;
            let is_verified = is_trusted_org(&input.repository_url);

            let mut total = wu * usage + wr * reputation + wa * activity + wc * reach;
            if is_zero_auth {
                total += ZERO_AUTH_BONUS;
            }
            if is_verified {
                total += VERIFIED_BONUS;
            }

            (
                name.clone(),
                Ranking {
                    total: total.clamp(0.0, 1.0),
                    usage,
                    reputation,
                    activity,
                    reach,
                    is_zero_auth,
                    is_verified,
                },
            )
        })
        .collect()
}

fn reputation_signal(stars: i64, forks: i64) -> f64 {
    (1.0 + stars.max(0) as f64).log10() + (1.0 + forks.max(0) as f64).log10()
}

fn reach_signal(weekly_downloads: i64) -> f64 {
    (1.0 + weekly_downloads.max(0) as f64).log10()
}

pub async fn run_rank(config: &Config, _cancel: &CancellationToken) -> Result<()> {
    let pool = db::connect(config).await?;

    let rows = sqlx::query(
        r#"
        SELECT
            s.name,
            s.repository_url,
            COALESCE(bs.raw_score, 0) AS backlink_raw,
            COALESCE(g.stars, 0) AS stars,
            COALESCE(g.forks, 0) AS forks,
            g.pushed_at,
            COALESCE((SELECT SUM(COALESCE(pd.last_week, 0)) FROM package_downloads pd
                       WHERE pd.server_name = s.name), 0) AS weekly_downloads,
            (SELECT COUNT(*) FROM environment_variables ev
              WHERE ev.server_name = s.name AND ev.is_secret = 1) AS secret_var_count
        FROM servers s
        LEFT JOIN backlink_scores bs ON bs.server_name = s.name
        LEFT JOIN github_signals g ON g.server_name = s.name
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut inputs: BTreeMap<String, RankInputs> = BTreeMap::new();
    for row in &rows {
        let name: String = row.get("name");
        inputs.insert(
            name,
            RankInputs {
                backlink_raw: row.get("backlink_raw"),
                stars: row.get("stars"),
                forks: row.get("forks"),
                pushed_at: row.get("pushed_at"),
                weekly_downloads: row.get("weekly_downloads"),
                secret_var_count: row.get("secret_var_count"),
                repository_url: row.get("repository_url"),
            },
        );
    }

    let rankings = rank_cohort(&inputs, chrono::Utc::now());

    let mut tx = pool.begin().await?;
    for (name, ranking) in &rankings {
        sqlx::query(
            r#"
            INSERT INTO market_rankings
                (server_name, total_score, usage_score, reputation_score,
                 activity_score, reach_score, is_zero_auth, is_verified, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(server_name) DO UPDATE SET
                total_score = excluded.total_score,
                usage_score = excluded.usage_score,
                reputation_score = excluded.reputation_score,
                activity_score = excluded.activity_score,
                reach_score = excluded.reach_score,
                is_zero_auth = excluded.is_zero_auth,
                is_verified = excluded.is_verified,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(ranking.total)
        .bind(ranking.usage)
        .bind(ranking.reputation)
        .bind(ranking.activity)
        .bind(ranking.reach)
        .bind(ranking.is_zero_auth)
        .bind(ranking.is_verified)
        .bind(db::now_utc())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    println!("rank");
    println!("  servers ranked: {}", rankings.len());
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn singleton(input: RankInputs) -> BTreeMap<String, RankInputs> {
        let mut map = BTreeMap::new();
        map.insert("acme/tool".to_string(), input);
        map
    }

    #[test]
    fn test_singleton_reputation_cohort() {
        // stars=100, forks=10, pushed now, no usage/reach, no secrets:
        // R and A normalise to 1.0, so total = 0.30 + 0.15 + 0.05 = 0.50.
        let now = chrono::Utc::now();
        let inputs = singleton(RankInputs {
            stars: 100,
            forks: 10,
            pushed_at: Some(now.to_rfc3339()),
            repository_url: "https://github.com/acme/tool".to_string(),
            ..Default::default()
        });
        let rankings = rank_cohort(&inputs, now);
        let r = &rankings["acme/tool"];

        assert!((r.reputation - 1.0).abs() < 1e-9);
        assert!((r.activity - 1.0).abs() < 1e-3);
        assert_eq!(r.usage, 0.0);
        assert_eq!(r.reach, 0.0);
        assert!(r.is_zero_auth);
        assert!(!r.is_verified);
        assert!((r.total - 0.50).abs() < 1e-3, "total = {}", r.total);
    }

    #[test]
    fn test_zero_signal_server_bounds() {
        // No signals at all: only the bonuses can contribute.
        let inputs = singleton(RankInputs {
            repository_url: String::new(),
            ..Default::default()
        });
        let rankings = rank_cohort(&inputs, chrono::Utc::now());
        let r = &rankings["acme/tool"];
        // activity defaults to 0.5 when pushed_at is unknown
        let expected = 0.15 * 0.5 + ZERO_AUTH_BONUS;
        assert!((r.total - expected).abs() < 1e-9);
        assert!(r.total <= 0.15);
    }

    #[test]
    fn test_verified_requires_trusted_org() {
        assert!(is_trusted_org("https://github.com/anthropics/mcp-server"));
        assert!(is_trusted_org("https://github.com/Cloudflare/workers-mcp"));
        assert!(!is_trusted_org("https://github.com/random-user/mcp-server"));
        assert!(!is_trusted_org("not a url"));
    }

    #[test]
    fn test_total_clamped_to_unit() {
        let now = chrono::Utc::now();
        let inputs = singleton(RankInputs {
            backlink_raw: 1e9,
            stars: 1_000_000,
            forks: 100_000,
            pushed_at: Some(now.to_rfc3339()),
            weekly_downloads: 10_000_000,
            secret_var_count: 0,
            repository_url: "https://github.com/anthropics/everything".to_string(),
        });
        let rankings = rank_cohort(&inputs, now);
        let r = &rankings["acme/tool"];
        assert!(r.is_verified);
        assert!(r.total <= 1.0);
        assert!(r.total >= 0.0);
    }

    #[test]
    fn test_secret_vars_disable_zero_auth_bonus() {
        let now = chrono::Utc::now();
        let mut with_secret = RankInputs::default();
        with_secret.secret_var_count = 2;
        let rankings = rank_cohort(&singleton(with_secret), now);
        assert!(!rankings["acme/tool"].is_zero_auth);
    }
}
