//! Deterministic mock embedder.
//!
//! Hashes whitespace-delimited tokens into dimension buckets and normalizes,
//! so identical text yields identical vectors and texts that share tokens
//! have positive cosine similarity. Good enough to exercise retrieval,
//! fusion, and deduplication logic without a model server.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{l2_normalize, Embedder, TokenEmbedder};
use crate::types::EmbedError;

pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let index = u64::from_be_bytes(digest[..8].try_into().unwrap()) as usize % self.dimension;
        // Sign is also hash-derived and stable per token.
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let cleaned: String = token
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if cleaned.is_empty() {
                continue;
            }
            let (index, sign) = self.bucket(&cleaned);
            vector[index] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl TokenEmbedder for MockEmbedder {
    async fn embed_tokens(&self, text: &str) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(text
            .split_whitespace()
            .take(64)
            .map(|token| self.vector_for(token))
            .collect())
    }

    fn token_dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn identical_text_embeds_identically() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("OAuth2 implementation notes").await.unwrap();
        let b = embedder.embed("OAuth2 implementation notes").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shared_tokens_raise_similarity() {
        let embedder = MockEmbedder::new(256);
        let a = embedder.embed("OAuth2 implementation guide").await.unwrap();
        let b = embedder.embed("OAuth2 implementation details").await.unwrap();
        let c = embedder.embed("gardening tips for spring").await.unwrap();
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let embedder = MockEmbedder::new(64);
        let v = embedder.embed("hello world").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
