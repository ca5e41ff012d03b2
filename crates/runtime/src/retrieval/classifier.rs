//! Rule-based query classification.
//!
//! Picks a retrieval strategy and a dense/sparse blend weight from surface
//! features: length, quoted literals, version markers, identifier-shaped
//! entities, and question words. No model involved.

use regex::Regex;
use std::sync::OnceLock;

use super::types::RetrievalStrategy;

/// Alpha is the dense weight in a hybrid blend (`1.0` = all dense).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub strategy: RetrievalStrategy,
    pub alpha: f32,
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bv?\d+\.\d+(\.\d+)?\b").expect("static regex"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CamelCase, snake_case, SCREAMING_SNAKE, and dotted.paths.
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z][a-z0-9]+[A-Z]\w*|[a-z0-9]+_[a-z0-9_]+|[A-Z]{2,}_[A-Z_]+|\w+\.\w+\.\w+)\b")
            .expect("static regex")
    })
}

const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "explain", "describe",
];

#[derive(Debug, Default)]
struct Features {
    words: usize,
    has_quoted_literal: bool,
    has_version: bool,
    has_identifier: bool,
    is_question: bool,
}

fn extract(query: &str) -> Features {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();
    let first_word = lower.split_whitespace().next().unwrap_or("");
    Features {
        words: trimmed.split_whitespace().count(),
        has_quoted_literal: trimmed.matches('"').count() >= 2
            || trimmed.matches('`').count() >= 2,
        has_version: version_re().is_match(trimmed),
        has_identifier: identifier_re().is_match(trimmed),
        is_question: QUESTION_WORDS.contains(&first_word) || trimmed.ends_with('?'),
    }
}

/// Classify a query into `(strategy, alpha)`.
pub fn classify(query: &str) -> Classification {
    let features = extract(query);

    // Exact-match signals dominate: quoted literals and short identifier
    // or version lookups want lexical retrieval.
    if features.has_quoted_literal && !features.is_question {
        return Classification {
            strategy: RetrievalStrategy::Sparse,
            alpha: 0.0,
        };
    }
    if (features.has_version || features.has_identifier) && features.words <= 4 {
        return Classification {
            strategy: RetrievalStrategy::Sparse,
            alpha: 0.0,
        };
    }

    // Pure natural-language questions with no exact-match signals lean
    // dense.
    if features.is_question && !features.has_identifier && !features.has_version {
        return Classification {
            strategy: RetrievalStrategy::Dense,
            alpha: 1.0,
        };
    }

    // Mixed signals blend. Entity plus version prefers sparse.
    let alpha = if features.has_identifier && features.has_version {
        0.4
    } else if features.has_identifier || features.has_version || features.has_quoted_literal {
        0.5
    } else {
        0.6
    };
    Classification {
        strategy: RetrievalStrategy::Hybrid,
        alpha,
    }
}
