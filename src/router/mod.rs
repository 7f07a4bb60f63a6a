//! Role-conditioned context routing (RCR).
//!
//! Semantic filter, importance scoring, then greedy budget packing. Routing is
//! a pure function of role, budget, snapshot, query context and configuration.

mod roles;
mod scoring;

pub use roles::{Role, RoleProfile, RoleTable};
pub use scoring::{
    recency_decay, role_keyword_match, task_stage_relevance, ImportanceScore, ImportanceScorer,
};

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{EngineConfig, RouterConfig};
use crate::decomposition::load::round6;
use crate::error::EngineResult;
use crate::memory::{cosine_similarity, tokenize, Embedder, MemoryItem, MemorySnapshot};

/// The text a role is routing for, pre-embedded.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub text: String,
    pub embedding: Vec<f32>,
    /// Reference instant for recency
    pub now: DateTime<Utc>,
    terms: BTreeSet<String>,
}

impl QueryContext {
    pub fn new(text: impl Into<String>, embedder: &dyn Embedder, now: DateTime<Utc>) -> Self {
        let text = text.into();
        Self {
            embedding: embedder.embed(&text),
            terms: tokenize(&text).into_iter().collect(),
            text,
            now,
        }
    }

    pub fn terms(&self) -> &BTreeSet<String> {
        &self.terms
    }
}

/// Selection metrics for one routing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetrics {
    /// Items in the snapshot
    pub candidates: usize,
    /// Items at or above `min_sim`
    pub passed_filter: usize,
    /// Survivors after the `topk` cut
    pub considered: usize,
    pub full_context_tokens: usize,
    /// `(1 - selected / full) * 100`; 0 when the snapshot is empty
    pub token_savings_percentage: f64,
    pub selection_latency_us: u64,
    pub total_importance: f64,
}

/// Context selected for one role invocation. Created fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleBudgetAllocation {
    pub role: Role,
    pub budget_tokens: usize,
    pub selected_item_ids: Vec<String>,
    pub total_selected_tokens: usize,
    /// Considered items that did not fit the remaining budget
    pub skipped_item_ids: Vec<String>,
    pub snapshot_version: u64,
    pub metrics: RoutingMetrics,
}

/// The context router.
#[derive(Debug, Clone)]
pub struct ContextRouter {
    config: RouterConfig,
    roles: RoleTable,
    scorer: ImportanceScorer,
}

struct Scored<'a> {
    item: &'a MemoryItem,
    score: f64,
}

impl ContextRouter {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        config.router.validate()?;
        Ok(Self {
            config: config.router.clone(),
            roles: RoleTable::from_config(&config.roles),
            scorer: ImportanceScorer::new(config.router.weights.clone(), config.router.recency.clone()),
        })
    }

    /// Configured budget for a role.
    pub fn budget_for(&self, role: Role) -> usize {
        self.roles.get(role).budget_tokens
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    /// Select context for `role` within `budget_tokens`.
    pub fn route(
        &self,
        role: Role,
        budget_tokens: usize,
        snapshot: &MemorySnapshot,
        query: &QueryContext,
    ) -> RoleBudgetAllocation {
        let started = Instant::now();
        let profile = self.roles.get(role);

        // Stage 1: semantic filter, then top-k by similarity (ties by id).
        let mut filtered: Vec<(&MemoryItem, f64)> = snapshot
            .items
            .iter()
            .map(|item| (item, cosine_similarity(&query.embedding, &item.embedding)))
            .filter(|(_, sim)| *sim >= self.config.min_sim)
            .collect();
        let passed_filter = filtered.len();
        filtered.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        filtered.truncate(self.config.topk);

        // Stage 2: importance scoring.
        let mut scored: Vec<Scored> = filtered
            .iter()
            .map(|(item, _)| Scored {
                item,
                score: self.scorer.score(item, profile, query.terms(), query.now).total,
            })
            .collect();
        scored.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.item.id.cmp(&b.item.id),
            other => other,
        });

        // Stage 3: greedy packing; items that do not fit are skipped, not fatal.
        let mut selected_item_ids = Vec::new();
        let mut skipped_item_ids = Vec::new();
        let mut total_selected_tokens = 0usize;
        let mut total_importance = 0.0;
        for candidate in &scored {
            if total_selected_tokens + candidate.item.token_count <= budget_tokens {
                total_selected_tokens += candidate.item.token_count;
                total_importance += candidate.score;
                selected_item_ids.push(candidate.item.id.clone());
            } else {
                debug!(
                    role = %role,
                    item_id = %candidate.item.id,
                    item_tokens = candidate.item.token_count,
                    remaining = budget_tokens - total_selected_tokens,
                    "Item exceeds remaining budget, skipping"
                );
                skipped_item_ids.push(candidate.item.id.clone());
            }
        }

        let full_context_tokens = snapshot.total_tokens;
        let token_savings_percentage = if full_context_tokens == 0 {
            0.0
        } else {
            round6((1.0 - total_selected_tokens as f64 / full_context_tokens as f64) * 100.0)
        };

        let allocation = RoleBudgetAllocation {
            role,
            budget_tokens,
            selected_item_ids,
            total_selected_tokens,
            skipped_item_ids,
            snapshot_version: snapshot.version,
            metrics: RoutingMetrics {
                candidates: snapshot.len(),
                passed_filter,
                considered: scored.len(),
                full_context_tokens,
                token_savings_percentage,
                selection_latency_us: started.elapsed().as_micros() as u64,
                total_importance: round6(total_importance),
            },
        };

        debug!(
            role = %role,
            selected = allocation.selected_item_ids.len(),
            tokens = total_selected_tokens,
            budget = budget_tokens,
            savings_pct = token_savings_percentage,
            "Context routed"
        );
        allocation
    }
}

/// Aggregate routing metrics for one role across a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMetricsSummary {
    pub role: Role,
    pub calls: usize,
    pub total_budget_tokens: usize,
    pub total_selected_tokens: usize,
    pub mean_token_savings_percentage: f64,
    pub max_selection_latency_us: u64,
    pub skipped_items: usize,
}

/// Summarize allocations per role, in pipeline order; roles never routed are omitted.
pub fn summarize_allocations(allocations: &[RoleBudgetAllocation]) -> Vec<RoleMetricsSummary> {
    Role::ALL
        .iter()
        .filter_map(|role| {
            let of_role: Vec<&RoleBudgetAllocation> =
                allocations.iter().filter(|a| a.role == *role).collect();
            if of_role.is_empty() {
                return None;
            }
            let calls = of_role.len();
            Some(RoleMetricsSummary {
                role: *role,
                calls,
                total_budget_tokens: of_role.iter().map(|a| a.budget_tokens).sum(),
                total_selected_tokens: of_role.iter().map(|a| a.total_selected_tokens).sum(),
                mean_token_savings_percentage: round6(
                    of_role
                        .iter()
                        .map(|a| a.metrics.token_savings_percentage)
                        .sum::<f64>()
                        / calls as f64,
                ),
                max_selection_latency_us: of_role
                    .iter()
                    .map(|a| a.metrics.selection_latency_us)
                    .max()
                    .unwrap_or(0),
                skipped_items: of_role.iter().map(|a| a.skipped_item_ids.len()).sum(),
            })
        })
        .collect()
}
