//! Service-cost analysis (offline).
//!
//! Auth-gated servers usually front a paid API. This worker intersects the
//! names of each server's secret environment variables with a curated
//! keyword table and records whether the server depends on a paid service
//! and whether every matched service offers a free tier.

use anyhow::Result;
use sqlx::Row;
use std::collections::BTreeSet;

use crate::db;

use super::{record_success, EnrichCtx, WorkerStats};

pub const ENRICHMENT_TYPE: &str = "service_costs";

/// Keyword fragment (matched against secret env-var names, lowercased) →
/// (display name, has free tier, pricing note).
pub const KNOWN_PAID_SERVICES: &[(&str, (&str, bool, &str))] = &[
    ("openai", ("OpenAI", false, "usage-based API pricing")),
    ("anthropic", ("Anthropic", false, "usage-based API pricing")),
    ("elevenlabs", ("ElevenLabs", true, "free tier with monthly character cap")),
    ("stripe", ("Stripe", true, "per-transaction fees, no platform fee")),
    ("twilio", ("Twilio", false, "pay-as-you-go messaging")),
    ("sendgrid", ("SendGrid", true, "free tier 100 emails/day")),
    ("mailgun", ("Mailgun", true, "free trial tier")),
    ("aws", ("Amazon Web Services", true, "free tier for 12 months")),
    ("azure", ("Microsoft Azure", true, "free tier with credits")),
    ("gcp", ("Google Cloud", true, "free tier with credits")),
    ("google_cloud", ("Google Cloud", true, "free tier with credits")),
    ("e2b", ("E2B", true, "free sandbox hours per month")),
    ("pinecone", ("Pinecone", true, "free starter index")),
    ("supabase", ("Supabase", true, "free tier projects")),
    ("notion", ("Notion", true, "free personal plan")),
    ("airtable", ("Airtable", true, "free plan with record limits")),
    ("brave", ("Brave Search", true, "free query quota")),
    ("serp", ("SerpAPI", false, "metered search queries")),
    ("tavily", ("Tavily", true, "free monthly search quota")),
    ("replicate", ("Replicate", false, "per-second model pricing")),
    ("perplexity", ("Perplexity", false, "usage-based API pricing")),
    ("minimax", ("MiniMax", false, "usage-based API pricing")),
    ("kling", ("Kling AI", false, "credit-based video generation")),
];

/// Match the secret env-var names of one server against the curated table.
/// Returns `(display names, all matched have a free tier)`.
pub fn match_paid_services(secret_vars: &[String]) -> (Vec<&'static str>, bool) {
    let mut matched: BTreeSet<&'static str> = BTreeSet::new();
    let mut all_free = true;

    for var in secret_vars {
        let lower = var.to_lowercase();
        for &(fragment, (display, has_free_tier, _note)) in KNOWN_PAID_SERVICES {
            if lower.contains(fragment) && matched.insert(display) && !has_free_tier {
                all_free = false;
            }
        }
    }

    let services: Vec<&'static str> = matched.into_iter().collect();
    let free = !services.is_empty() && all_free;
    (services, free)
}

pub async fn run(ctx: &EnrichCtx<'_>) -> Result<()> {
    let rows = sqlx::query("SELECT name FROM servers ORDER BY name")
        .fetch_all(ctx.pool)
        .await?;
    let servers: Vec<String> = rows.iter().map(|r| r.get("name")).collect();

    let mut stats = WorkerStats::default();
    let mut tx = ctx.pool.begin().await?;

    for server_name in &servers {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let var_rows = sqlx::query(
            "SELECT var_name FROM environment_variables WHERE server_name = ? AND is_secret = 1",
        )
        .bind(server_name)
        .fetch_all(&mut *tx)
        .await?;
        let secret_vars: Vec<String> = var_rows.iter().map(|r| r.get("var_name")).collect();

        let (services, free_tier) = match_paid_services(&secret_vars);
        let paid_json = serde_json::to_string(&services)?;

        sqlx::query(
            r#"
            INSERT INTO service_cost_hints
                (server_name, requires_paid_service, paid_services, free_tier_available, enriched_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(server_name) DO UPDATE SET
                requires_paid_service = excluded.requires_paid_service,
                paid_services = excluded.paid_services,
                free_tier_available = excluded.free_tier_available,
                enriched_at = excluded.enriched_at
            "#,
        )
        .bind(server_name)
        .bind(!services.is_empty())
        .bind(&paid_json)
        .bind(free_tier)
        .bind(db::now_utc())
        .execute(&mut *tx)
        .await?;
        record_success(&mut tx, server_name, ENRICHMENT_TYPE).await?;

        stats.processed += 1;
        stats.succeeded += 1;
        if stats.processed % ctx.commit_every() == 0 {
            tx.commit().await?;
            tx = ctx.pool.begin().await?;
        }
    }

    tx.commit().await?;
    stats.print("services");
    Ok(())
}
