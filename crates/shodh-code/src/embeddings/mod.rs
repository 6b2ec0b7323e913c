pub mod hashed;
pub mod onnx;

use anyhow::Result;
use std::sync::Arc;

use crate::config::EmbeddingSettings;

/// Unified embedding model trait. A fixed model produces deterministic
/// dense vectors for a given text; the model identity is configuration,
/// not per-request.
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query (with the model-appropriate prefix, if any).
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a document/passage.
    fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed documents for ingestion. Implementations embed in small
    /// internal batches to bound memory.
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_document(t)).collect()
    }

    /// Embedding vector dimension.
    fn dimension(&self) -> usize;
}

/// Build the configured embedding model: the ONNX model when one is found
/// under `model_dir`, otherwise the deterministic hashing model.
pub fn load_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn EmbeddingModel>> {
    if let Some(model_dir) = &settings.model_dir {
        if let Some(config) = onnx::OnnxConfig::auto_detect(model_dir, &settings.model_name) {
            let model = onnx::OnnxEmbedder::new(config, settings.batch_size)?;
            tracing::info!(
                model = %settings.model_name,
                dimension = model.dimension(),
                "loaded ONNX embedding model"
            );
            return Ok(Arc::new(model));
        }
        tracing::warn!(
            model_dir = %model_dir.display(),
            "no ONNX model found, falling back to hashing embedder"
        );
    }
    Ok(Arc::new(hashed::HashedEmbedder::new(settings.dimension)))
}
