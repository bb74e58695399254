//! Search index builder.
//!
//! Two indexes are built together:
//!
//! - **SearchDocs** — one flattened row per tool with three weighted text
//!   segments (name 5.0, description 3.0, parameters 1.0) plus a
//!   human-readable `full_doc` used for embedding. Rebuilt from scratch.
//! - **Embeddings** — dense vectors for every SearchDoc without one,
//!   encoded in batches of 16 and committed per batch, so an interrupted
//!   run resumes from the missing set.
//!
//! The server name is not part of `name_text`; it appears only in the
//! description context and in `full_doc`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::embedding::{vec_to_blob, EmbeddingEngine};

/// BM25 segment weights for (name_text, desc_text, params_text).
pub const SEGMENT_WEIGHTS: (f64, f64, f64) = (5.0, 3.0, 1.0);

/// One tool's flattened search document.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDoc {
    pub tool_id: i64,
    pub tool_name: String,
    pub server_name: String,
    pub name_text: String,
    pub desc_text: String,
    pub params_text: String,
    pub full_doc: String,
}

/// Build the three text segments and the embedding document for one tool.
pub fn build_doc(
    tool_id: i64,
    tool_name: &str,
    server_name: &str,
    title: &str,
    description: &str,
    server_description: &str,
    params: &[(String, String, Option<String>)],
) -> SearchDoc {
    let param_parts: Vec<String> = params
        .iter()
        .map(|(name, desc, enums)| match enums {
            Some(e) => format!("{name}: {desc} (enums: {e})"),
            None => format!("{name}: {desc}"),
        })
        .collect();
    let params_text = param_parts.join(" | ");

    let name_text = format!("{tool_name} {title}");
    let desc_text = format!("{description} {server_description}");

    let full_doc = format!(
        "Tool: {tool_name}\nServer: {server_name}\nTitle: {title}\nDescription: {description}\nServer Description: {server_description}\nParameters: {params_text}"
    );

    SearchDoc {
        tool_id,
        tool_name: tool_name.to_string(),
        server_name: server_name.to_string(),
        name_text,
        desc_text,
        params_text,
        full_doc,
    }
}

/// Rebuild `tools_search` and the FTS index from the tools table.
pub async fn build_search_index(pool: &SqlitePool) -> Result<usize> {
    let tools = sqlx::query(
        r#"
        SELECT
            t.id AS tool_id,
            t.tool_name,
            t.title,
            t.description,
            t.server_name,
            s.description AS server_description
        FROM tools t
        JOIN servers s ON t.server_name = s.name
        ORDER BY t.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM tools_search")
        .execute(&mut *tx)
        .await?;

    for tool in &tools {
        let tool_id: i64 = tool.get("tool_id");
        let tool_name: String = tool.get("tool_name");
        let server_name: String = tool.get("server_name");
        let title: Option<String> = tool.get("title");
        let description: Option<String> = tool.get("description");
        let server_description: Option<String> = tool.get("server_description");

        let param_rows = sqlx::query(
            r#"
            SELECT param_name, description, enum_values
            FROM tool_parameters
            WHERE tool_name = ? AND server_name = ?
            ORDER BY param_name
            "#,
        )
        .bind(&tool_name)
        .bind(&server_name)
        .fetch_all(&mut *tx)
        .await?;

        let params: Vec<(String, String, Option<String>)> = param_rows
            .iter()
            .map(|p| {
                (
                    p.get("param_name"),
                    p.get::<Option<String>, _>("description").unwrap_or_default(),
                    p.get("enum_values"),
                )
            })
            .collect();

        let doc = build_doc(
            tool_id,
            &tool_name,
            &server_name,
            title.as_deref().unwrap_or(""),
            description.as_deref().unwrap_or(""),
            server_description.as_deref().unwrap_or(""),
            &params,
        );

        sqlx::query(
            r#"
            INSERT INTO tools_search
                (tool_id, tool_name, server_name, name_text, desc_text, params_text, full_doc, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.tool_id)
        .bind(&doc.tool_name)
        .bind(&doc.server_name)
        .bind(&doc.name_text)
        .bind(&doc.desc_text)
        .bind(&doc.params_text)
        .bind(&doc.full_doc)
        .bind(db::now_utc())
        .execute(&mut *tx)
        .await?;
    }

    // Resynchronise the external-content FTS table in one operation.
    sqlx::query("INSERT INTO tools_fts(tools_fts) VALUES('rebuild')")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(tools.len())
}

/// Encode embeddings for every SearchDoc without a vector row. Commits per
/// batch; a restart resumes from whatever is still missing.
pub async fn build_embeddings(
    pool: &SqlitePool,
    engine: &Arc<EmbeddingEngine>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<(usize, usize)> {
    let rows = sqlx::query(
        r#"
        SELECT ts.tool_id, ts.full_doc
        FROM tools_search ts
        LEFT JOIN tool_vectors tv ON tv.tool_id = ts.tool_id
        WHERE tv.tool_id IS NULL
        ORDER BY ts.tool_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let pending: Vec<(i64, String)> = rows
        .iter()
        .map(|r| (r.get("tool_id"), r.get("full_doc")))
        .collect();

    if pending.is_empty() {
        return Ok((0, 0));
    }

    let mut embedded = 0usize;
    let mut failed = 0usize;

    for batch in pending.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            break;
        }

        let texts: Vec<String> = batch.iter().map(|(_, doc)| doc.clone()).collect();
        match engine.encode(texts).await {
            Ok(vectors) => {
                let mut tx = pool.begin().await?;
                for ((tool_id, _), vector) in batch.iter().zip(vectors.iter()) {
                    sqlx::query(
                        "INSERT OR REPLACE INTO tool_vectors (tool_id, embedding) VALUES (?, ?)",
                    )
                    .bind(tool_id)
                    .bind(vec_to_blob(vector))
                    .execute(&mut *tx)
                    .await?;
                    embedded += 1;
                }
                tx.commit().await?;
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {e}");
                failed += batch.len();
            }
        }
    }

    Ok((embedded, failed))
}

/// CLI entry point for `wisp index build`.
pub async fn run_index_build(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let count = build_search_index(&pool).await?;
    println!("index build");
    println!("  search docs: {count}");
    println!("ok");
    pool.close().await;
    Ok(())
}

/// CLI entry point for `wisp index embed`.
pub async fn run_index_embed(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let pool = db::connect(config).await?;
    let engine = EmbeddingEngine::new(&config.embedding);
    engine.warmup().await?;

    let (embedded, failed) =
        build_embeddings(&pool, &engine, config.embedding.batch_size, cancel).await?;

    println!("index embed");
    println!("  embedded: {embedded}");
    println!("  failed: {failed}");
    println!("ok");
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_doc_segments() {
        let params = vec![
            (
                "city".to_string(),
                "City to look up".to_string(),
                Some("[\"NYC\",\"SF\"]".to_string()),
            ),
            ("units".to_string(), "Unit system".to_string(), None),
        ];
        let doc = build_doc(
            7,
            "get_weather",
            "io.acme/weather",
            "Get Weather",
            "Fetch current conditions",
            "Weather data provider",
            &params,
        );

        assert_eq!(doc.name_text, "get_weather Get Weather");
        assert_eq!(doc.desc_text, "Fetch current conditions Weather data provider");
        assert_eq!(
            doc.params_text,
            "city: City to look up (enums: [\"NYC\",\"SF\"]) | units: Unit system"
        );
        // The server name lives in full_doc, not in the name segment.
        assert!(!doc.name_text.contains("io.acme/weather"));
        assert!(doc.full_doc.contains("Server: io.acme/weather"));
        assert!(doc.full_doc.starts_with("Tool: get_weather\n"));
    }

    #[test]
    fn test_build_doc_deterministic() {
        let params = vec![("a".to_string(), "first".to_string(), None)];
        let one = build_doc(1, "t", "s", "T", "d", "sd", &params);
        let two = build_doc(1, "t", "s", "T", "d", "sd", &params);
        assert_eq!(one, two);
        assert_eq!(one.full_doc, two.full_doc);
    }

    #[test]
    fn test_build_doc_empty_params() {
        let doc = build_doc(1, "t", "s", "", "", "", &[]);
        assert_eq!(doc.params_text, "");
        assert!(doc.full_doc.ends_with("Parameters: "));
    }
}
