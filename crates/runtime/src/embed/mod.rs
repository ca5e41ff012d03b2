//! Embedding services.
//!
//! Embedders are consumed as opaque functions `text -> vector`. Text queries
//! and passages use the 384-dimension text embedder with `"query: "` /
//! `"passage: "` prefixes; code uses the 768-dimension code embedder. The
//! deterministic sparse encoding lives in `crate::index::sparse` since it
//! runs in-process.

pub mod http;
pub mod mock;

pub use http::HttpEmbedder;
pub use mock::MockEmbedder;

use async_trait::async_trait;
use std::sync::Arc;

use crate::types::EmbedError;

/// Prefix conventions for asymmetric text embedding models.
pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";

/// Dense embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;
}

/// Optional late-interaction embedder producing one vector per token.
#[async_trait]
pub trait TokenEmbedder: Send + Sync {
    async fn embed_tokens(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn token_dimension(&self) -> usize;
}

/// Normalize a vector to unit length in place. Zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Element-wise mean of several vectors, then L2-normalized.
pub fn mean_pooled(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut out = vec![0.0f32; first.len()];
    for vector in vectors {
        for (acc, value) in out.iter_mut().zip(vector) {
            *acc += value;
        }
    }
    let n = vectors.len() as f32;
    for value in out.iter_mut() {
        *value /= n;
    }
    l2_normalize(&mut out);
    out
}

/// Shared handles to the embedding services a deployment runs with.
#[derive(Clone)]
pub struct EmbedderSet {
    pub text: Arc<dyn Embedder>,
    pub code: Arc<dyn Embedder>,
    pub colbert: Option<Arc<dyn TokenEmbedder>>,
}

impl EmbedderSet {
    /// Deterministic mock set for tests and unconfigured deployments.
    pub fn mock(text_dimension: usize, code_dimension: usize) -> Self {
        Self {
            text: Arc::new(MockEmbedder::new(text_dimension)),
            code: Arc::new(MockEmbedder::new(code_dimension)),
            colbert: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn mean_pooling_averages_then_normalizes() {
        let pooled = mean_pooled(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
        let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
