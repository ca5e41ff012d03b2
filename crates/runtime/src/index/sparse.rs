//! Deterministic sparse text encoding.
//!
//! Tokens hash into a fixed vocabulary space; term frequencies pass through
//! BM25-style saturation so repeated terms stop growing the weight. The
//! output indices are strictly ascending, which the vector store requires.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::storage::SparseVector;

const VOCABULARY_BITS: u32 = 30;
const K1: f32 = 1.2;

#[derive(Debug, Clone, Default)]
pub struct SparseEncoder;

impl SparseEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, text: &str) -> SparseVector {
        let mut frequencies: BTreeMap<u32, f32> = BTreeMap::new();
        for token in tokenize(text) {
            *frequencies.entry(hash_token(&token)).or_insert(0.0) += 1.0;
        }
        let mut indices = Vec::with_capacity(frequencies.len());
        let mut values = Vec::with_capacity(frequencies.len());
        for (index, tf) in frequencies {
            indices.push(index);
            values.push(saturate(tf));
        }
        SparseVector { indices, values }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
}

fn hash_token(token: &str) -> u32 {
    let digest = Sha256::digest(token.as_bytes());
    let raw = u32::from_be_bytes(digest[..4].try_into().unwrap());
    raw & ((1 << VOCABULARY_BITS) - 1)
}

/// BM25-style term-frequency saturation: `tf (k1 + 1) / (tf + k1)`.
fn saturate(tf: f32) -> f32 {
    tf * (K1 + 1.0) / (tf + K1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let encoder = SparseEncoder::new();
        let a = encoder.encode("implement OAuth2 token refresh");
        let b = encoder.encode("implement OAuth2 token refresh");
        assert_eq!(a, b);
        assert!(!a.indices.is_empty());
    }

    #[test]
    fn indices_are_strictly_ascending() {
        let encoder = SparseEncoder::new();
        let sparse = encoder.encode("the quick brown fox jumps over the lazy dog");
        for window in sparse.indices.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn repeated_terms_saturate() {
        let encoder = SparseEncoder::new();
        let once = encoder.encode("token");
        let many = encoder.encode("token token token token token token");
        assert_eq!(once.indices, many.indices);
        let ratio = many.values[0] / once.values[0];
        // Six occurrences weigh more than one but far less than 6x.
        assert!(ratio > 1.0 && ratio < 2.0);
    }

    #[test]
    fn shared_terms_produce_overlap() {
        let encoder = SparseEncoder::new();
        let a = encoder.encode("OAuth2 implementation");
        let b = encoder.encode("OAuth2 flows");
        assert!(a.dot(&b) > 0.0);
    }

    #[test]
    fn single_characters_are_dropped() {
        let encoder = SparseEncoder::new();
        let sparse = encoder.encode("a b c");
        assert!(sparse.indices.is_empty());
    }
}
