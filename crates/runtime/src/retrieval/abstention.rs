//! Answer abstention.
//!
//! The Layer-1 detector inspects top-k scores only. Further layers
//! (grounding, hedging) would implement the same trait; only Layer 1 ships.

use super::types::{AbstentionReason, AbstentionVerdict};

/// Abstention capability over a ranked score list (descending).
pub trait AbstentionDetector: Send + Sync {
    fn evaluate(&self, scores: &[f32]) -> AbstentionVerdict;
}

/// Score thresholds for the Layer-1 detector.
#[derive(Debug, Clone, Copy)]
pub struct ScoreThresholds {
    pub min_retrieval_score: f32,
    pub gap_detection_threshold: f32,
    pub min_score_gap: f32,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            min_retrieval_score: 0.3,
            gap_detection_threshold: 0.5,
            min_score_gap: 0.1,
        }
    }
}

/// Layer-1: abstain on no results, a weak top score, or an undifferentiated
/// head when the top score is already mediocre.
pub struct ScoreBasedDetector {
    thresholds: ScoreThresholds,
}

impl ScoreBasedDetector {
    pub fn new(thresholds: ScoreThresholds) -> Self {
        Self { thresholds }
    }
}

impl Default for ScoreBasedDetector {
    fn default() -> Self {
        Self::new(ScoreThresholds::default())
    }
}

impl AbstentionDetector for ScoreBasedDetector {
    fn evaluate(&self, scores: &[f32]) -> AbstentionVerdict {
        let Some(&top) = scores.first() else {
            return AbstentionVerdict {
                should_abstain: true,
                reason: Some(AbstentionReason::NoResults),
                confidence: 1.0,
                details: "retrieval returned no results".into(),
            };
        };

        if top < self.thresholds.min_retrieval_score {
            return AbstentionVerdict {
                should_abstain: true,
                reason: Some(AbstentionReason::LowRetrievalScore),
                confidence: 0.8,
                details: format!(
                    "top score {top:.3} below minimum {:.3}",
                    self.thresholds.min_retrieval_score
                ),
            };
        }

        // Gap detection only applies below the confidence threshold; a
        // strong top hit answers regardless of the runner-up.
        if top < self.thresholds.gap_detection_threshold {
            if let Some(&second) = scores.get(1) {
                let gap = top - second;
                if gap < self.thresholds.min_score_gap {
                    return AbstentionVerdict {
                        should_abstain: true,
                        reason: Some(AbstentionReason::NoScoreGap),
                        confidence: 0.7,
                        details: format!(
                            "top score {top:.3} with gap {gap:.3} below {:.3}",
                            self.thresholds.min_score_gap
                        ),
                    };
                }
            }
        }

        AbstentionVerdict::answer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ScoreBasedDetector {
        ScoreBasedDetector::default()
    }

    #[test]
    fn empty_input_abstains_with_full_confidence() {
        let verdict = detector().evaluate(&[]);
        assert!(verdict.should_abstain);
        assert_eq!(verdict.reason, Some(AbstentionReason::NoResults));
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn weak_top_score_abstains() {
        let verdict = detector().evaluate(&[0.2, 0.1]);
        assert!(verdict.should_abstain);
        assert_eq!(verdict.reason, Some(AbstentionReason::LowRetrievalScore));
    }

    #[test]
    fn flat_mediocre_head_abstains_with_no_score_gap() {
        let verdict = detector().evaluate(&[0.42, 0.41, 0.40]);
        assert!(verdict.should_abstain);
        assert_eq!(verdict.reason, Some(AbstentionReason::NoScoreGap));
        assert_eq!(verdict.confidence, 0.7);
    }

    #[test]
    fn gap_detection_skipped_above_threshold() {
        // Same tiny gap, but the top score clears the detection threshold.
        let verdict = detector().evaluate(&[0.55, 0.54]);
        assert!(!verdict.should_abstain);
    }

    #[test]
    fn clear_winner_answers() {
        let verdict = detector().evaluate(&[0.45, 0.2]);
        assert!(!verdict.should_abstain);
    }
}
