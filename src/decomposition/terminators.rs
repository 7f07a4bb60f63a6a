use std::sync::Arc;

use regex::Regex;

use super::plan::Terminator;
use crate::config::DecompositionConfig;
use crate::error::{EngineError, EngineResult};
use crate::memory::{cosine_similarity, Embedder, MemorySnapshot};

/// Built-in mutually exclusive term pairs.
pub const DEFAULT_CONTRADICTION_PAIRS: &[(&str, &str)] = &[
    ("married", "bachelor"),
    ("square", "circle"),
    ("alive", "dead"),
    ("living", "dead"),
    ("even", "odd"),
    ("empty", "full"),
    ("finite", "infinite"),
    ("possible", "impossible"),
    ("visible", "invisible"),
    ("true", "false"),
];

/// Tokens that turn a pair into a choice or comparison instead of a joint premise.
const PAIR_BREAKERS: &[&str] = &[
    "or", "nor", "versus", "vs", "between", "whether", "from", "than", "difference", "compare",
];

/// Maximum token distance between the two terms of a contradictory pair.
const PAIR_WINDOW: usize = 4;

/// Retrieval probe for the LOW_SUPPORT check.
#[cfg_attr(test, mockall::automock)]
pub trait SupportProbe: Send + Sync {
    /// Best relevance of any evidence for `text`, or `None` when there is no
    /// evidence base to consult.
    fn max_relevance(&self, text: &str) -> Option<f64>;
}

/// Probe over a memory snapshot using the store's embedder.
pub struct SnapshotProbe {
    snapshot: Arc<MemorySnapshot>,
    embedder: Arc<dyn Embedder>,
}

impl SnapshotProbe {
    pub fn new(snapshot: Arc<MemorySnapshot>, embedder: Arc<dyn Embedder>) -> Self {
        Self { snapshot, embedder }
    }
}

impl SupportProbe for SnapshotProbe {
    fn max_relevance(&self, text: &str) -> Option<f64> {
        if self.snapshot.is_empty() {
            return None;
        }
        let query = self.embedder.embed(text);
        self.snapshot
            .items
            .iter()
            .map(|item| cosine_similarity(&query, &item.embedding))
            .max_by(|a, b| a.total_cmp(b))
    }
}

/// A triggered terminator and the rule that fired.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub terminator: Terminator,
    pub rule: String,
}

/// Ordered terminator checks: UNANSWERABLE, then CONTRADICTION, then LOW_SUPPORT.
pub struct TerminatorRules {
    unanswerable: Vec<(&'static str, Regex)>,
    extra: Vec<Regex>,
    pairs: Vec<(String, String)>,
    min_support: f64,
}

impl TerminatorRules {
    pub fn new(config: &DecompositionConfig) -> EngineResult<Self> {
        let unanswerable = vec![
            (
                "synesthetic",
                Regex::new(
                    r"(?i)\b(?:taste|smell|colou?r|sound|texture|flavou?r)\s+of\s+(?:the\s+)?(?:number\s+\w+|\d+|monday|tuesday|wednesday|thursday|friday|saturday|sunday|silence|justice|time|love|an?\s+idea|mathematics|math|the\s+alphabet)\b",
                )?,
            ),
            (
                "synesthetic",
                Regex::new(
                    r"(?i)\bwhat\s+does\s+(?:the\s+)?(?:number\s+\w+|\d+|silence|justice|time|love|an?\s+idea)\s+(?:taste|smell|sound|feel)\s+like\b",
                )?,
            ),
            (
                "introspective",
                Regex::new(
                    r"(?i)\b(?:what|which|who)\b[^?]*\bam\s+i\s+(?:thinking|feeling|imagining|dreaming|picturing)\b",
                )?,
            ),
            (
                "introspective",
                Regex::new(r"(?i)\b(?:read\s+my\s+mind|what\s+(?:did|will)\s+i\s+(?:dream|think))\b")?,
            ),
            (
                "fictitious_precision",
                Regex::new(
                    r"(?i)\b(?:exact|precise)\s+(?:number|count)\s+of\s+(?:grains\s+of\s+sand|stars|atoms|hairs|raindrops|snowflakes|leaves|thoughts)\b",
                )?,
            ),
            (
                "fictitious_precision",
                Regex::new(
                    r"(?i)\b(?:exactly|precisely)\s+how\s+many\s+(?:grains\s+of\s+sand|stars|atoms|hairs|raindrops|snowflakes|leaves|thoughts)\b",
                )?,
            ),
            (
                "fictitious_precision",
                Regex::new(
                    r"(?i)\bhow\s+many\s+(?:grains\s+of\s+sand|raindrops|snowflakes|hairs|atoms)\b[^?]*\b(?:exactly|precisely)\b",
                )?,
            ),
        ];

        let extra = config
            .extra_unanswerable_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    EngineError::config(format!("invalid unanswerable pattern '{}': {}", p, e))
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let pairs = config
            .contradiction_pairs
            .iter()
            .map(|(a, b)| (a.to_lowercase(), b.to_lowercase()))
            .collect();

        Ok(Self {
            unanswerable,
            extra,
            pairs,
            min_support: config.min_support,
        })
    }

    /// Run the checks in order; first match wins.
    ///
    /// The LOW_SUPPORT probe runs only when `probe` is given and reports an
    /// evidence base.
    pub fn check(&self, text: &str, probe: Option<&dyn SupportProbe>) -> Option<Verdict> {
        if let Some(rule) = self.unanswerable_rule(text) {
            return Some(Verdict {
                terminator: Terminator::Unanswerable,
                rule,
            });
        }
        if let Some(rule) = self.contradiction_rule(text) {
            return Some(Verdict {
                terminator: Terminator::Contradiction,
                rule,
            });
        }
        let relevance = probe?.max_relevance(text)?;
        (relevance < self.min_support).then(|| Verdict {
            terminator: Terminator::LowSupport,
            rule: format!(
                "max relevance {:.4} below floor {:.4}",
                relevance, self.min_support
            ),
        })
    }

    /// The UNANSWERABLE and CONTRADICTION checks only.
    pub fn screen(&self, text: &str) -> Option<Verdict> {
        self.check(text, None)
    }

    fn unanswerable_rule(&self, text: &str) -> Option<String> {
        if let Some((name, _)) = self.unanswerable.iter().find(|(_, re)| re.is_match(text)) {
            return Some(name.to_string());
        }
        self.extra
            .iter()
            .find(|re| re.is_match(text))
            .map(|re| format!("pattern:{}", re.as_str()))
    }

    fn contradiction_rule(&self, text: &str) -> Option<String> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        // "X and not X" / "X and non-X"
        for i in 0..tokens.len() {
            let is_negated_repeat = tokens.get(i + 1).map(String::as_str) == Some("and")
                && matches!(tokens.get(i + 2).map(String::as_str), Some("not") | Some("non"))
                && tokens.get(i + 3) == Some(&tokens[i]);
            if is_negated_repeat && !self.pair_is_broken(&tokens, i, i + 3) {
                return Some(format!("self_negation:{}", tokens[i]));
            }
        }

        for (a, b) in &self.pairs {
            for (i, tok) in tokens.iter().enumerate() {
                if tok != a && tok != b {
                    continue;
                }
                let other = if tok == a { b } else { a };
                let end = (i + PAIR_WINDOW).min(tokens.len().saturating_sub(1));
                if let Some(j) = (i + 1..=end).find(|j| &tokens[*j] == other) {
                    if !self.pair_is_broken(&tokens, i, j) {
                        return Some(format!("exclusive_pair:{}/{}", a, b));
                    }
                }
            }
        }
        None
    }

    fn pair_is_broken(&self, tokens: &[String], i: usize, j: usize) -> bool {
        tokens[i.saturating_sub(2)..=j]
            .iter()
            .any(|t| PAIR_BREAKERS.contains(&t.as_str()))
    }
}
