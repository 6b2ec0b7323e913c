use anyhow::Result;
use sha2::{Digest, Sha256};

use super::EmbeddingModel;

/// Deterministic feature-hashing embedder.
///
/// Tokenises on non-alphanumeric boundaries, hashes each token and its
/// 4-character prefix into buckets, and L2-normalises the counts. The
/// prefix feature gives morphological variants ("authenticate",
/// "authentication") overlapping buckets, which is enough signal for a
/// functional offline engine and for hermetic tests. Used whenever no ONNX
/// model is configured.
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            vector[self.bucket(&token)] += 1.0;

            if token.len() > 4 {
                let prefix: String = token.chars().take(4).collect();
                vector[self.bucket(&format!("pfx:{prefix}"))] += 0.5;
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut value = 0usize;
        for byte in &digest[..8] {
            value = (value << 8) | *byte as usize;
        }
        value % self.dimension
    }
}

impl EmbeddingModel for HashedEmbedder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn embeddings_are_deterministic_and_normalised() {
        let model = HashedEmbedder::new(256);
        let a = model.embed_document("JWT authentication flow").unwrap();
        let b = model.embed_document("JWT authentication flow").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_terms_share_signal() {
        let model = HashedEmbedder::new(256);
        let query = model.embed_query("JWT authentication").unwrap();
        let auth = model
            .embed_document("def authenticate(token): check the JWT signature")
            .unwrap();
        let unrelated = model
            .embed_document("CSS grid layout with flexbox fallback")
            .unwrap();
        assert!(cosine(&query, &auth) > cosine(&query, &unrelated));
    }
}
