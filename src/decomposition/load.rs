use serde::{Deserialize, Serialize};

use crate::config::LoadWeights;

const RELATIVE_PRONOUNS: &[&str] = &["that", "which", "who", "whom", "whose", "where"];
const COORDINATORS: &[&str] = &["and", "or", "but", "while", "whereas"];
const COMPARATIVES: &[&str] = &[
    "compare", "compared", "comparison", "versus", "vs", "than", "more", "less", "most",
    "least", "better", "worse", "best", "worst", "higher", "lower", "larger", "smaller",
    "largest", "smallest", "biggest", "greater", "greatest", "difference", "differ",
];
const AMBIGUITY_MARKERS: &[&str] = &[
    "it", "they", "them", "something", "somehow", "stuff", "things", "maybe", "perhaps",
    "approximately", "roughly", "etc", "whatever", "various",
];

/// Feature counts and the resulting cognitive-load score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBreakdown {
    pub words: usize,
    pub clause_markers: usize,
    pub comparatives: usize,
    pub ambiguity_markers: usize,
    /// Clamped to `[0, 1]`
    pub score: f64,
}

/// Deterministic cognitive-load estimator.
#[derive(Debug, Clone)]
pub struct CognitiveLoadScorer {
    weights: LoadWeights,
}

impl CognitiveLoadScorer {
    pub fn new(weights: LoadWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, text: &str) -> LoadBreakdown {
        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();

        let punctuation = text.chars().filter(|c| matches!(c, ',' | ';' | ':')).count();

        // The leading word is an interrogative, not a clause marker.
        let clause_markers = punctuation
            + words
                .iter()
                .skip(1)
                .filter(|w| {
                    w.as_str() == "of"
                        || RELATIVE_PRONOUNS.contains(&w.as_str())
                        || COORDINATORS.contains(&w.as_str())
                })
                .count();
        let comparatives = words
            .iter()
            .filter(|w| COMPARATIVES.contains(&w.as_str()))
            .count();
        let ambiguity_markers = words
            .iter()
            .filter(|w| AMBIGUITY_MARKERS.contains(&w.as_str()))
            .count();

        let w = &self.weights;
        let f_len = (words.len() as f64 / w.length_norm_words).min(1.0);
        let f_clause = (clause_markers as f64 / w.clause_norm).min(1.0);
        let f_cmp = (comparatives as f64 / 2.0).min(1.0);
        let f_amb = (ambiguity_markers as f64 / 2.0).min(1.0);

        let raw = w.length * f_len + w.clauses * f_clause + w.comparative * f_cmp + w.ambiguity * f_amb;

        LoadBreakdown {
            words: words.len(),
            clause_markers,
            comparatives,
            ambiguity_markers,
            score: round6(raw.clamp(0.0, 1.0)),
        }
    }
}

/// Round to six decimals so serialized artifacts stay byte-stable.
pub(crate) fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> CognitiveLoadScorer {
        CognitiveLoadScorer::new(LoadWeights::default())
    }

    #[test]
    fn test_multi_hop_query_exceeds_default_threshold() {
        let b = scorer().score(
            "What is the population of the capital of the country that hosted the 2024 Olympics?",
        );
        assert_eq!(b.words, 15);
        assert_eq!(b.clause_markers, 3);
        assert!((b.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_simple_query_is_low_load() {
        let b = scorer().score("What is the capital of France?");
        assert!(b.score <= 0.7);
        assert_eq!(b.clause_markers, 1);
    }

    #[test]
    fn test_score_is_clamped_and_stable() {
        let text = "Compare, contrast and rank the best, worst, larger and smaller of them, \
                    maybe roughly, versus it and whatever else, etc";
        let a = scorer().score(text);
        let b = scorer().score(text);
        assert_eq!(a, b);
        assert!(a.score <= 1.0);
    }

    #[test]
    fn test_empty_text() {
        let b = scorer().score("   ");
        assert_eq!(b.words, 0);
        assert_eq!(b.score, 0.0);
    }
}
