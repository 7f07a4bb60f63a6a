use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::roles::RoleProfile;
use crate::config::{ImportanceWeights, RecencyDecay};
use crate::memory::{tokenize, MemoryItem};

/// Decay factor in `[0, 1]` for an item of the given age; non-increasing in age.
pub fn recency_decay(decay: &RecencyDecay, age_hours: f64) -> f64 {
    let age = age_hours.max(0.0);
    match decay {
        RecencyDecay::Exponential { half_life_hours } => 0.5f64.powf(age / half_life_hours),
        RecencyDecay::Linear { horizon_hours } => (1.0 - age / horizon_hours).max(0.0),
        RecencyDecay::None => 1.0,
    }
}

/// 1.0 when the item is tagged for the role, otherwise the fraction of role
/// keywords present in the item's content.
pub fn role_keyword_match(item: &MemoryItem, item_terms: &BTreeSet<String>, profile: &RoleProfile) -> f64 {
    if item.role_tags.contains(profile.role.as_str()) {
        return 1.0;
    }
    if profile.keywords.is_empty() {
        return 0.0;
    }
    let hits = profile
        .keywords
        .iter()
        .filter(|k| item_terms.contains(k.as_str()))
        .count();
    hits as f64 / profile.keywords.len() as f64
}

/// Fraction of distinct query terms that also occur in the item.
pub fn task_stage_relevance(item_terms: &BTreeSet<String>, query_terms: &BTreeSet<String>) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let hits = query_terms.intersection(item_terms).count();
    hits as f64 / query_terms.len() as f64
}

/// Per-factor breakdown of an importance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceScore {
    pub role_keyword: f64,
    pub task_stage: f64,
    pub recency: f64,
    pub total: f64,
}

/// `w1*role_keyword_match + w2*task_stage_relevance + w3*recency_decay(age)`
#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    weights: ImportanceWeights,
    decay: RecencyDecay,
}

impl ImportanceScorer {
    pub fn new(weights: ImportanceWeights, decay: RecencyDecay) -> Self {
        Self { weights, decay }
    }

    pub fn score(
        &self,
        item: &MemoryItem,
        profile: &RoleProfile,
        query_terms: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> ImportanceScore {
        let item_terms: BTreeSet<String> = tokenize(&item.content).into_iter().collect();
        let role_keyword = role_keyword_match(item, &item_terms, profile);
        let task_stage = task_stage_relevance(&item_terms, query_terms);
        let age_hours = (now - item.created_at).num_seconds() as f64 / 3600.0;
        let recency = recency_decay(&self.decay, age_hours);

        let w = &self.weights;
        ImportanceScore {
            role_keyword,
            task_stage,
            recency,
            total: w.role_keyword * role_keyword + w.task_stage * task_stage + w.recency * recency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Role;
    use chrono::Duration;

    fn item(content: &str, tags: &[&str], created_at: DateTime<Utc>) -> MemoryItem {
        MemoryItem {
            id: "m".to_string(),
            content: content.to_string(),
            role_tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at,
            embedding: vec![],
            token_count: 1,
        }
    }

    fn profile() -> RoleProfile {
        RoleProfile {
            role: Role::Retriever,
            budget_tokens: 100,
            keywords: vec!["fact".to_string(), "source".to_string()],
        }
    }

    #[test]
    fn test_recency_decay_is_monotonic() {
        let exp = RecencyDecay::Exponential {
            half_life_hours: 168.0,
        };
        assert_eq!(recency_decay(&exp, 0.0), 1.0);
        assert!((recency_decay(&exp, 168.0) - 0.5).abs() < 1e-12);
        assert_eq!(recency_decay(&exp, -5.0), 1.0);

        let lin = RecencyDecay::Linear { horizon_hours: 10.0 };
        let mut prev = f64::INFINITY;
        for age in [0.0, 1.0, 5.0, 10.0, 50.0] {
            let v = recency_decay(&lin, age);
            assert!(v <= prev);
            prev = v;
        }
        assert_eq!(recency_decay(&lin, 50.0), 0.0);
        assert_eq!(recency_decay(&RecencyDecay::None, 1e9), 1.0);
    }

    #[test]
    fn test_role_tag_beats_keywords() {
        let now = Utc::now();
        let tagged = item("nothing relevant", &["retriever"], now);
        let terms = tokenize(&tagged.content).into_iter().collect();
        assert_eq!(role_keyword_match(&tagged, &terms, &profile()), 1.0);

        let half = item("one fact here", &[], now);
        let terms = tokenize(&half.content).into_iter().collect();
        assert_eq!(role_keyword_match(&half, &terms, &profile()), 0.5);
    }

    #[test]
    fn test_weighted_total() {
        let now = Utc::now();
        let scorer = ImportanceScorer::new(ImportanceWeights::default(), RecencyDecay::None);
        let query: BTreeSet<String> = ["paris", "population"].iter().map(|s| s.to_string()).collect();
        let s = scorer.score(
            &item("paris population source", &[], now - Duration::hours(3)),
            &profile(),
            &query,
            now,
        );
        assert_eq!(s.task_stage, 1.0);
        assert_eq!(s.role_keyword, 0.5);
        assert!((s.total - (0.4 * 0.5 + 0.4 * 1.0 + 0.2 * 1.0)).abs() < 1e-12);
    }
}
