use anyhow::{anyhow, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use super::EmbeddingModel;

#[derive(Clone)]
pub struct OnnxConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dimension: usize,
    pub max_length: usize,
}

impl OnnxConfig {
    /// Look for `<model_dir>/<model_name>/` containing an ONNX graph and a
    /// `tokenizer.json`. Quantised/optimised graph variants are preferred.
    pub fn auto_detect(model_dir: &Path, model_name: &str) -> Option<Self> {
        let base = model_dir.join(model_name);
        let tokenizer_path = base.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return None;
        }

        let model_path = ["model_qint8.onnx", "model_O4.onnx", "model.onnx"]
            .iter()
            .map(|f| base.join(f))
            .find(|p| p.exists())?;

        // MiniLM-class models are 384-dimensional; larger variants carry a
        // dims marker file next to the graph.
        let dimension = std::fs::read_to_string(base.join("dimension"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(384);

        Some(Self {
            model_path,
            tokenizer_path,
            dimension,
            max_length: 512,
        })
    }
}

/// Sentence-embedding model served through ONNX Runtime: tokenize, run the
/// transformer, mean-pool over the attention mask, L2-normalise.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    config: OnnxConfig,
    batch_size: usize,
    query_cache: RwLock<lru::LruCache<String, Vec<f32>>>,
}

impl OnnxEmbedder {
    pub fn new(config: OnnxConfig, batch_size: usize) -> Result<Self> {
        ort::init().with_name("shodh_code_embeddings").commit();

        let model_bytes = std::fs::read(&config.model_path)
            .map_err(|e| anyhow!("failed to read model {}: {e}", config.model_path.display()))?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let session = Session::builder()
            .map_err(|e| anyhow!("session builder: {e:?}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("optimization level: {e:?}"))?
            .with_intra_threads(num_threads)
            .map_err(|e| anyhow!("intra threads: {e:?}"))?
            .with_inter_threads(1)
            .map_err(|e| anyhow!("inter threads: {e:?}"))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("failed to load model: {e:?}"))?;

        let tokenizer = Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            config,
            batch_size: batch_size.max(1),
            query_cache: RwLock::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(1000).expect("nonzero cache size"),
            )),
        })
    }

    fn token_ids(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.len() > self.config.max_length {
            ids.truncate(self.config.max_length);
        }
        Ok(ids)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let mut all_token_ids = Vec::with_capacity(batch.len());
            let mut padded_len = 0;
            for text in batch {
                let ids = self.token_ids(text)?;
                padded_len = padded_len.max(ids.len());
                all_token_ids.push(ids);
            }
            let padded_len = padded_len.max(1);
            let batch_size = all_token_ids.len();

            let mut input_ids_flat = Vec::with_capacity(batch_size * padded_len);
            let mut attention_mask_flat = Vec::with_capacity(batch_size * padded_len);
            for ids in &all_token_ids {
                for &id in ids {
                    input_ids_flat.push(id);
                    attention_mask_flat.push(1i64);
                }
                for _ in ids.len()..padded_len {
                    input_ids_flat.push(0i64);
                    attention_mask_flat.push(0i64);
                }
            }
            let token_type_ids_flat = vec![0i64; batch_size * padded_len];

            let shape = vec![batch_size, padded_len];
            let input_ids = Value::from_array((shape.clone(), input_ids_flat))
                .map_err(|e| anyhow!("input_ids tensor: {e:?}"))?;
            let attention_mask = Value::from_array((shape.clone(), attention_mask_flat.clone()))
                .map_err(|e| anyhow!("attention_mask tensor: {e:?}"))?;
            let token_type_ids = Value::from_array((shape, token_type_ids_flat))
                .map_err(|e| anyhow!("token_type_ids tensor: {e:?}"))?;

            let inputs = ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ];

            let mut session = self.session.lock();
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow!("inference failed: {e:?}"))?;

            let (out_shape, data) = outputs["last_hidden_state"]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow!("failed to extract last_hidden_state: {e:?}"))?;

            let seq_len = out_shape[1] as usize;
            let hidden_dim = out_shape[2] as usize;

            for sample_idx in 0..batch_size {
                let mask_offset = sample_idx * padded_len;
                let sample_offset = sample_idx * seq_len * hidden_dim;
                let mut pooled = vec![0.0f32; hidden_dim];
                let mut mask_sum = 0.0f32;

                for pos in 0..seq_len {
                    let mask_val = if mask_offset + pos < attention_mask_flat.len() {
                        attention_mask_flat[mask_offset + pos] as f32
                    } else {
                        0.0
                    };
                    if mask_val > 0.0 {
                        mask_sum += mask_val;
                        let offset = sample_offset + pos * hidden_dim;
                        for dim in 0..hidden_dim {
                            pooled[dim] += data[offset + dim] * mask_val;
                        }
                    }
                }

                if mask_sum > 0.0 {
                    for value in &mut pooled {
                        *value /= mask_sum;
                    }
                }

                all_embeddings.push(normalize(pooled));
            }
        }

        Ok(all_embeddings)
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.write().get(text) {
            return Ok(cached.clone());
        }
        let embedding = self
            .embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty embedding batch"))?;
        self.query_cache
            .write()
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty embedding batch"))
    }

    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
