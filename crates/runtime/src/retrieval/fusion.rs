//! Reciprocal Rank Fusion.
//!
//! `score(d) = Σ_lists 1 / (k + rank_list(d))` with 1-based ranks. Scores
//! depend only on ranks, so removing a document absent from every list
//! leaves the other scores unchanged. No similarity threshold applies to
//! fused scores.

use std::collections::HashMap;
use uuid::Uuid;

use crate::storage::ScoredHit;

pub const DEFAULT_RRF_K: u32 = 60;

/// A fused hit with its combined score.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub hit: ScoredHit,
    pub rrf_score: f32,
}

/// Fuse ranked lists. Ties in fused score break by id for determinism.
pub fn rrf_fuse(lists: &[Vec<ScoredHit>], k: u32) -> Vec<FusedHit> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    let mut payloads: HashMap<Uuid, ScoredHit> = HashMap::new();

    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (k as f32 + (rank + 1) as f32);
            *scores.entry(hit.id).or_insert(0.0) += contribution;
            payloads.entry(hit.id).or_insert_with(|| hit.clone());
        }
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, rrf_score)| FusedHit {
            hit: payloads.remove(&id).expect("payload recorded with score"),
            rrf_score,
        })
        .collect();
    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hit.id.cmp(&b.hit.id))
    });
    fused
}
