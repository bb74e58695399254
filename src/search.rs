//! Hybrid tool retrieval.
//!
//! Two candidate sets are fetched per query — FTS5 keyword hits scored with
//! weighted BM25, and dense-vector hits scored by cosine similarity over the
//! stored embedding BLOBs — then fused in Rust:
//!
//! ```text
//! relevance = 0.7 · s_score + 0.3 · log1p(k_raw) / log1p(k_max)
//! score     = 0.8 · relevance + 0.2 · market_quality
//! ```
//!
//! Candidates with `relevance ≤ 0.3` are dropped. Both candidate sets are
//! trimmed to the top 200 *before* the floor, so a tool outside both top-200
//! sets stays invisible even if it would clear the floor — the paging total
//! reports the unfiltered union size.
//!
//! Surviving tools are hydrated through `v_tools_full` and re-sorted by
//! final score after hydration.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backlink::log1p;
use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, EmbeddingEngine};

/// Fusion weights: semantic, keyword, then relevance vs. quality.
pub const SEMANTIC_WEIGHT: f64 = 0.7;
pub const KEYWORD_WEIGHT: f64 = 0.3;
pub const RELEVANCE_WEIGHT: f64 = 0.8;
pub const QUALITY_WEIGHT: f64 = 0.2;

/// A scored candidate before hydration.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub tool_id: i64,
    pub relevance: f64,
    pub quality: f64,
    pub score: f64,
}

/// One fully hydrated search result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_id: i64,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub requires_auth: bool,
    pub server: ServerInfo,
    pub relevance: f64,
    pub quality: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub description: Option<String>,
}

/// The `/search` response shape.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub page: u32,
    pub limit: u32,
    pub total_candidates: usize,
    pub results: Vec<ToolResult>,
}

/// Replace every character outside `[A-Za-z0-9]` and whitespace with a
/// space. FTS5 MATCH treats most punctuation as syntax; stripping it keeps
/// arbitrary user queries safe.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Fuse the two candidate sets into per-tool relevance. Missing sides score
/// zero; the keyword side normalises `log1p(k_raw)` against the batch max.
pub fn fuse_candidates(
    vector_hits: &[(i64, f64)],
    keyword_hits: &[(i64, f64)],
) -> Vec<(i64, f64)> {
    let k_max = keyword_hits
        .iter()
        .map(|&(_, k)| k)
        .fold(f64::NEG_INFINITY, f64::max);
    let k_denom = if k_max > 0.0 { log1p(k_max) } else { 0.0 };

    let vec_map: HashMap<i64, f64> = vector_hits.iter().copied().collect();
    let kw_map: HashMap<i64, f64> = keyword_hits.iter().copied().collect();

    let mut ids: Vec<i64> = vec_map.keys().chain(kw_map.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .map(|tool_id| {
            let s = vec_map.get(&tool_id).copied().unwrap_or(0.0);
            let k = kw_map.get(&tool_id).copied().unwrap_or(0.0);
            let keyword_part = if k_denom > 0.0 {
                log1p(k) / k_denom
            } else {
                0.0
            };
            let relevance = SEMANTIC_WEIGHT * s + KEYWORD_WEIGHT * keyword_part;
            (tool_id, relevance)
        })
        .collect()
}

/// Execute the hybrid search. Returns the floored, score-ordered hits plus
/// the unfiltered candidate-union size.
pub async fn hybrid_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    query_vec: &[f32],
) -> Result<(Vec<SearchHit>, usize)> {
    let candidate_k = config.retrieval.candidate_k;

    // Vector candidates: brute-force cosine over the stored blobs.
    let mut vector_hits: Vec<(i64, f64)> = Vec::new();
    if !query_vec.is_empty() {
        let rows = sqlx::query("SELECT tool_id, embedding FROM tool_vectors")
            .fetch_all(pool)
            .await?;
        vector_hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vec, &vec) as f64;
                (row.get::<i64, _>("tool_id"), similarity)
            })
            .collect();
        vector_hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        vector_hits.truncate(candidate_k);
    }

    // Keyword candidates. A query that sanitises to nothing searches
    // vectors only.
    let fts_query = sanitize_fts_query(query);
    let mut keyword_hits: Vec<(i64, f64)> = Vec::new();
    if !fts_query.is_empty() {
        let (w_name, w_desc, w_params) = crate::index::SEGMENT_WEIGHTS;
        let sql = format!(
            r#"
            SELECT rowid AS tool_id, -bm25(tools_fts, {w_name}, {w_desc}, {w_params}) AS k_raw
            FROM tools_fts
            WHERE tools_fts MATCH ?
            ORDER BY k_raw DESC
            LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&fts_query)
            .bind(candidate_k as i64)
            .fetch_all(pool)
            .await?;
        keyword_hits = rows
            .iter()
            .map(|row| (row.get::<i64, _>("tool_id"), row.get::<f64, _>("k_raw")))
            .collect();
    }

    let fused = fuse_candidates(&vector_hits, &keyword_hits);
    let total_candidates = fused.len();

    if fused.is_empty() {
        return Ok((Vec::new(), 0));
    }

    // Market quality per candidate server.
    let ids: Vec<i64> = fused.iter().map(|&(id, _)| id).collect();
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        r#"
        SELECT ts.tool_id, COALESCE(mr.total_score, 0) AS quality
        FROM tools_search ts
        LEFT JOIN market_rankings mr ON mr.server_name = ts.server_name
        WHERE ts.tool_id IN ({placeholders})
        "#
    );
    let mut query_builder = sqlx::query(&sql);
    for id in &ids {
        query_builder = query_builder.bind(id);
    }
    let quality_rows = query_builder.fetch_all(pool).await?;
    let quality_map: HashMap<i64, f64> = quality_rows
        .iter()
        .map(|row| (row.get("tool_id"), row.get("quality")))
        .collect();

    let floor = config.retrieval.relevance_floor;
    let mut hits: Vec<SearchHit> = fused
        .into_iter()
        .filter(|&(_, relevance)| relevance > floor)
        .map(|(tool_id, relevance)| {
            let quality = quality_map.get(&tool_id).copied().unwrap_or(0.0);
            SearchHit {
                tool_id,
                relevance,
                quality,
                score: RELEVANCE_WEIGHT * relevance + QUALITY_WEIGHT * quality,
            }
        })
        .collect();

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    Ok((hits, total_candidates))
}

// ============ Retriever ============

/// High-level retrieval: embeds the query, runs the hybrid search, pages,
/// and hydrates. Owns the shared embedding engine.
pub struct Retriever {
    engine: Arc<EmbeddingEngine>,
}

impl Retriever {
    pub fn new(config: &Config) -> Self {
        Self {
            engine: EmbeddingEngine::new(&config.embedding),
        }
    }

    /// Pre-load the embedding model.
    pub async fn warmup(&self) -> Result<()> {
        self.engine.warmup().await
    }

    pub async fn retrieve(
        &self,
        pool: &SqlitePool,
        config: &Config,
        query: &str,
        page: u32,
        limit: u32,
    ) -> Result<SearchResponse> {
        let query_vec = self.engine.encode_one(query).await?;
        retrieve_with_vector(pool, config, query, &query_vec, page, limit).await
    }

    /// All tool names for one server.
    pub async fn tools_for_server(
        &self,
        pool: &SqlitePool,
        server_name: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT tool_name FROM v_tools_full WHERE server_name = ? ORDER BY tool_name",
        )
        .bind(server_name)
        .fetch_all(pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("tool_name")).collect())
    }
}

/// Search with a precomputed query vector. Split out from
/// [`Retriever::retrieve`] so tests can drive it without a model.
pub async fn retrieve_with_vector(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    query_vec: &[f32],
    page: u32,
    limit: u32,
) -> Result<SearchResponse> {
    let (hits, total_candidates) = hybrid_search(pool, config, query, query_vec).await?;

    let page = page.max(1);
    let start = ((page - 1) * limit) as usize;
    let paged: Vec<&SearchHit> = hits.iter().skip(start).take(limit as usize).collect();

    let results = hydrate(pool, &paged).await?;

    Ok(SearchResponse {
        query: query.to_string(),
        page,
        limit,
        total_candidates,
        results,
    })
}

/// Hydrate a page of hits through `v_tools_full` and re-sort by score (the
/// IN-clause fetch loses ordering).
async fn hydrate(pool: &SqlitePool, hits: &[&SearchHit]) -> Result<Vec<ToolResult>> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let hit_map: HashMap<i64, &SearchHit> = hits.iter().map(|h| (h.tool_id, *h)).collect();
    let placeholders = vec!["?"; hits.len()].join(",");
    let sql = format!(
        r#"
        SELECT tool_id, tool_name, title, description, input_schema,
               requires_auth, server_name, server_description
        FROM v_tools_full
        WHERE tool_id IN ({placeholders})
        "#
    );
    let mut query_builder = sqlx::query(&sql);
    for hit in hits {
        query_builder = query_builder.bind(hit.tool_id);
    }
    let rows = query_builder.fetch_all(pool).await?;

    let mut results: Vec<ToolResult> = Vec::with_capacity(rows.len());
    for row in &rows {
        let tool_id: i64 = row.get("tool_id");
        let Some(hit) = hit_map.get(&tool_id) else {
            continue;
        };

        let input_schema: Option<String> = row.get("input_schema");
        let input_schema = input_schema
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());

        results.push(ToolResult {
            tool_id,
            name: row.get("tool_name"),
            title: row.get("title"),
            description: row.get("description"),
            input_schema,
            requires_auth: row.get("requires_auth"),
            server: ServerInfo {
                name: row.get("server_name"),
                description: row.get("server_description"),
            },
            relevance: hit.relevance,
            quality: hit.quality,
            score: hit.score,
        });
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(results)
}

/// CLI entry point — runs a search and prints ranked results.
pub async fn run_search(
    config: &Config,
    query: &str,
    page: u32,
    limit: u32,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let retriever = Retriever::new(config);
    retriever.warmup().await?;

    let response = retriever.retrieve(&pool, config, query, page, limit).await?;

    if response.results.is_empty() {
        println!("No results ({} candidates).", response.total_candidates);
        pool.close().await;
        return Ok(());
    }

    for (i, result) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            (response.page as usize - 1) * limit as usize + i + 1,
            result.score,
            result.name,
            result.server.name
        );
        println!(
            "    relevance: {:.3}  quality: {:.3}{}",
            result.relevance,
            result.quality,
            if result.requires_auth { "  [auth]" } else { "" }
        );
        if let Some(desc) = &result.description {
            println!("    {}", desc.replace('\n', " ").trim());
        }
        println!();
    }
    println!(
        "page {} of {} candidates",
        response.page, response.total_candidates
    );

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_syntax() {
        assert_eq!(sanitize_fts_query("weather \"NYC\" AND-OR*"), "weather  NYC  AND OR");
        assert_eq!(sanitize_fts_query("!!!"), "");
        assert_eq!(sanitize_fts_query("plain words"), "plain words");
    }

    #[test]
    fn test_fuse_semantic_only() {
        let fused = fuse_candidates(&[(1, 0.8)], &[]);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].1 - 0.56).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_keyword_tops_semantic() {
        // A: s=0.8, no keyword → 0.56.
        // B: s=0.4, k=k_max → 0.28 + 0.3 = 0.58. B outranks A.
        let vector_hits = vec![(1, 0.8), (2, 0.4)];
        let keyword_hits = vec![(2, 5.0)];
        let fused = fuse_candidates(&vector_hits, &keyword_hits);

        let a = fused.iter().find(|&&(id, _)| id == 1).unwrap().1;
        let b = fused.iter().find(|&&(id, _)| id == 2).unwrap().1;
        assert!((a - 0.56).abs() < 1e-9);
        assert!((b - 0.58).abs() < 1e-9);
        assert!(b > a);
    }

    #[test]
    fn test_fuse_zero_kmax_guard() {
        // All keyword scores non-positive: the keyword side contributes 0
        // instead of dividing by zero.
        let fused = fuse_candidates(&[(1, 0.5)], &[(1, 0.0), (2, -1.0)]);
        let one = fused.iter().find(|&&(id, _)| id == 1).unwrap().1;
        let two = fused.iter().find(|&&(id, _)| id == 2).unwrap().1;
        assert!((one - 0.35).abs() < 1e-9);
        assert_eq!(two, 0.0);
    }

    #[test]
    fn test_fuse_union_counts_both_sides() {
        let fused = fuse_candidates(&[(1, 0.9), (2, 0.5)], &[(2, 3.0), (3, 1.0)]);
        assert_eq!(fused.len(), 3);
    }
}
