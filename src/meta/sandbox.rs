//! Sandbox A/B testing and the adoption decision rule.
//!
//! Both arms run against their own cloned configuration; the live engine's
//! configuration is never touched here.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::analyzer::answer_variance;
use super::config::MetaConfig;
use super::types::{ABResult, Decision, EvalMetrics, ImprovementProposal, TargetMetric};
use crate::config::EngineConfig;
use crate::error::{MetaError, MetaResult};
use crate::orchestrator::{Controller, EngineContext, Query};
use crate::trace::NullTraceSink;

/// Measures one configuration.
#[async_trait]
pub trait SandboxEvaluator: Send + Sync {
    async fn evaluate(&self, config: Arc<EngineConfig>) -> MetaResult<EvalMetrics>;

    /// Number of benchmark cases behind each evaluation.
    fn case_count(&self) -> usize;
}

/// One benchmark query; a JSONL line of the benchmark file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkCase {
    pub query: String,
    /// Substrings the answer must contain, case-insensitively
    #[serde(default)]
    pub expected: Vec<String>,
}

impl BenchmarkCase {
    /// Whether `answer` satisfies the case. Any answer passes a case
    /// without expectations; a missing answer never passes.
    pub fn matches(&self, answer: Option<&str>) -> bool {
        let Some(answer) = answer else {
            return false;
        };
        let answer = answer.to_lowercase();
        self.expected
            .iter()
            .all(|e| answer.contains(&e.to_lowercase()))
    }
}

/// Replays benchmark cases through a real controller.
pub struct ReplayEvaluator {
    base: EngineContext,
    cases: Vec<BenchmarkCase>,
    repeats: usize,
    reference_time: DateTime<Utc>,
}

impl ReplayEvaluator {
    /// `base` supplies memory, invoker and gate; its trace sink and artifact
    /// writer are replaced so sandbox runs leave no records behind.
    pub fn new(base: &EngineContext, cases: Vec<BenchmarkCase>, repeats: usize) -> Self {
        let mut base = base.clone().with_trace_sink(Arc::new(NullTraceSink));
        base.artifacts = None;
        Self {
            base,
            cases,
            repeats: repeats.max(1),
            reference_time: Utc::now(),
        }
    }

    /// Pin the recency reference instant for every replayed query.
    pub fn with_reference_time(mut self, at: DateTime<Utc>) -> Self {
        self.reference_time = at;
        self
    }
}

#[async_trait]
impl SandboxEvaluator for ReplayEvaluator {
    async fn evaluate(&self, config: Arc<EngineConfig>) -> MetaResult<EvalMetrics> {
        let controller = Controller::new(Arc::new(self.base.with_config(config))).map_err(|e| {
            MetaError::Sandbox {
                message: e.to_string(),
            }
        })?;

        let mut correct = 0usize;
        let mut runs = 0usize;
        let mut latency_total = 0.0;
        let mut token_total = 0.0;
        let mut variances = Vec::with_capacity(self.cases.len());

        for case in &self.cases {
            let mut answers = Vec::with_capacity(self.repeats);
            for _ in 0..self.repeats {
                let query = Query::new(case.query.clone()).with_reference_time(self.reference_time);
                let outcome = controller
                    .execute(query, CancellationToken::new())
                    .await
                    .map_err(|e| MetaError::Sandbox {
                        message: e.to_string(),
                    })?;
                runs += 1;
                if case.matches(outcome.answer.as_deref()) {
                    correct += 1;
                }
                latency_total += outcome.elapsed_ms as f64;
                token_total += outcome.selected_tokens() as f64;
                answers.push(outcome.answer.unwrap_or_default());
            }
            variances.push(answer_variance(&answers));
        }

        if runs == 0 {
            return Ok(EvalMetrics::default());
        }
        Ok(EvalMetrics {
            accuracy: correct as f64 / runs as f64,
            mean_latency_ms: latency_total / runs as f64,
            mean_tokens: token_total / runs as f64,
            answer_variance: variances.iter().sum::<f64>() / variances.len() as f64,
            samples: runs,
        })
    }

    fn case_count(&self) -> usize {
        self.cases.len()
    }
}

/// Run control (`baseline`) and treatment (`baseline` + delta) arms.
pub async fn sandbox_test(
    proposal: &ImprovementProposal,
    baseline: &EngineConfig,
    evaluator: &dyn SandboxEvaluator,
) -> MetaResult<ABResult> {
    let treatment_config = proposal.config_delta.apply(baseline)?;
    let control = evaluator.evaluate(Arc::new(baseline.clone())).await?;
    let treatment = evaluator.evaluate(Arc::new(treatment_config)).await?;
    let result = ABResult::new(proposal.id.clone(), control, treatment);
    info!(
        proposal_id = %proposal.id,
        accuracy_delta = result.accuracy_delta,
        improvements = ?result.improvements,
        "Sandbox test complete"
    );
    Ok(result)
}

/// Adopt only if accuracy drops by no more than the tolerance and at least
/// one target metric improves by the minimum relative delta.
pub fn decide(result: &ABResult, config: &MetaConfig) -> Decision {
    let accuracy_ok = result.accuracy_delta >= -config.accuracy_tolerance;
    let improved = TargetMetric::ALL.iter().any(|m| {
        result
            .improvements
            .get(m)
            .is_some_and(|gain| *gain >= config.min_improvement)
    });
    if accuracy_ok && improved {
        Decision::Adopted
    } else {
        Decision::RolledBack
    }
}
