//! Embedding engine and vector utilities.
//!
//! [`EmbeddingEngine`] wraps the local fastembed model behind the
//! `local-embeddings-fastembed` feature (default). The model is loaded once
//! — the gateway warms it at startup — and shared read-only behind `Arc`;
//! inference runs on the blocking pool so batch encoding never stalls the
//! event loop.
//!
//! Vector utilities:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for SQLite
//!   BLOB storage
//! - [`blob_to_vec`] — decode a SQLite BLOB back into a `Vec<f32>`
//! - [`cosine_similarity`] — similarity between two embedding vectors

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::config::EmbeddingConfig;

#[cfg(feature = "local-embeddings-fastembed")]
use std::sync::Mutex;

/// Shared slot holding the loaded model.
#[cfg(feature = "local-embeddings-fastembed")]
type ModelSlot = Arc<Mutex<Option<fastembed::TextEmbedding>>>;

pub struct EmbeddingEngine {
    config: EmbeddingConfig,
    #[cfg(feature = "local-embeddings-fastembed")]
    model: ModelSlot,
}

impl EmbeddingEngine {
    pub fn new(config: &EmbeddingConfig) -> Arc<Self> {
        Arc::new(Self {
            config: config.clone(),
            #[cfg(feature = "local-embeddings-fastembed")]
            model: Arc::new(Mutex::new(None)),
        })
    }

    pub fn dims(&self) -> usize {
        self.config.dims
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    /// Pre-load the model into memory. Called once at gateway startup so the
    /// first query does not pay the model load.
    pub async fn warmup(&self) -> Result<()> {
        if !self.config.is_enabled() {
            return Ok(());
        }

        #[cfg(feature = "local-embeddings-fastembed")]
        {
            let slot = Arc::clone(&self.model);
            let model_name = self.config.model.clone();
            tokio::task::spawn_blocking(move || load_into(&slot, &model_name)).await??;
            return Ok(());
        }

        #[cfg(not(feature = "local-embeddings-fastembed"))]
        bail!("Embedding provider 'local' requires the local-embeddings-fastembed feature")
    }

    /// Encode a batch of texts. Returns one vector per input, in order.
    pub async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if !self.config.is_enabled() {
            bail!("Embedding provider is disabled");
        }

        #[cfg(feature = "local-embeddings-fastembed")]
        {
            let slot = Arc::clone(&self.model);
            let model_name = self.config.model.clone();
            let batch_size = self.config.batch_size;
            return tokio::task::spawn_blocking(move || {
                load_into(&slot, &model_name)?;
                let mut guard = slot
                    .lock()
                    .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;
                let model = guard
                    .as_mut()
                    .ok_or_else(|| anyhow::anyhow!("embedding model not loaded"))?;
                model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
            })
            .await?;
        }

        #[cfg(not(feature = "local-embeddings-fastembed"))]
        {
            let _ = texts;
            bail!("Embedding provider 'local' requires the local-embeddings-fastembed feature")
        }
    }

    /// Encode a single query text.
    pub async fn encode_one(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.encode(vec![text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding result"))
    }
}

/// Load the model into the slot if it is not already there.
#[cfg(feature = "local-embeddings-fastembed")]
fn load_into(slot: &Mutex<Option<fastembed::TextEmbedding>>, model_name: &str) -> Result<()> {
    let mut guard = slot
        .lock()
        .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;
    if guard.is_some() {
        return Ok(());
    }

    let fastembed_model = model_by_name(model_name)?;
    let model = fastembed::TextEmbedding::try_new(
        fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
    *guard = Some(model);
    Ok(())
}

#[cfg(feature = "local-embeddings-fastembed")]
fn model_by_name(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel;
    let model = match name.to_lowercase().as_str() {
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
        "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        other => bail!(
            "Unknown local embedding model: '{}'. Known: bge-base-en-v1.5, bge-small-en-v1.5, bge-large-en-v1.5, all-minilm-l6-v2, nomic-embed-text-v1.5",
            other
        ),
    };
    Ok(model)
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_disabled_engine_errors() {
        let config = EmbeddingConfig {
            provider: "disabled".to_string(),
            ..Default::default()
        };
        let engine = EmbeddingEngine::new(&config);
        assert!(engine.encode_one("hello").await.is_err());
        assert!(engine.warmup().await.is_ok());
    }
}
