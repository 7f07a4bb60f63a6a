//! Turns bottleneck reports into bounded configuration proposals.

use chrono::Utc;
use tracing::{debug, info};

use super::allowlist::{Direction, ParameterAllowlist};
use super::types::{
    BottleneckKind, BottleneckReport, ConfigDelta, ImprovementProposal, ProposalId,
    ProposalStatus, TestPlan,
};
use crate::config::EngineConfig;
use crate::error::{MetaError, MetaResult};

/// Candidate adjustments for a finding, tried in order.
fn candidates(kind: &BottleneckKind) -> Vec<(String, Direction, String)> {
    match kind {
        BottleneckKind::SlowRole { role } => vec![
            (
                "router.topk".to_string(),
                Direction::Decrease,
                format!("Routing fewer candidates shortens {} prompts and its latency", role),
            ),
            (
                format!("budget.{}", role),
                Direction::Decrease,
                format!("A smaller {} budget shortens its prompts and latency", role),
            ),
        ],
        BottleneckKind::TokenHeavy { role } => vec![
            (
                format!("budget.{}", role),
                Direction::Decrease,
                format!("{} fills its budget; a smaller budget cuts token usage", role),
            ),
            (
                "router.min_sim".to_string(),
                Direction::Increase,
                "A stricter similarity cut-off drops marginal context".to_string(),
            ),
        ],
        BottleneckKind::AnswerVariance => vec![(
            "sampling.temperature".to_string(),
            Direction::Decrease,
            "Lower temperature makes repeated answers converge".to_string(),
        )],
        BottleneckKind::BreakerTrips => vec![
            (
                "controller.max_retries".to_string(),
                Direction::Decrease,
                "Fewer retries keep slow queries under the wall-clock ceiling".to_string(),
            ),
            (
                "controller.role_timeout_ms".to_string(),
                Direction::Decrease,
                "Shorter attempt timeouts keep queries under the wall-clock ceiling".to_string(),
            ),
        ],
    }
}

/// Proposal generator.
#[derive(Debug, Clone)]
pub struct Proposer {
    allowlist: ParameterAllowlist,
    benchmark_cases: usize,
    repeats: usize,
}

impl Proposer {
    pub fn new(allowlist: ParameterAllowlist, benchmark_cases: usize, repeats: usize) -> Self {
        Self {
            allowlist,
            benchmark_cases,
            repeats,
        }
    }

    pub fn allowlist(&self) -> &ParameterAllowlist {
        &self.allowlist
    }

    /// Propose one bounded step for `report` against `current`.
    ///
    /// Fails with `Rejected` when every candidate parameter already sits at
    /// its bound.
    pub fn propose(
        &self,
        report: &BottleneckReport,
        current: &EngineConfig,
    ) -> MetaResult<ImprovementProposal> {
        for (key, direction, hypothesis) in candidates(&report.kind) {
            let Some(bounds) = self.allowlist.get(&key) else {
                continue;
            };
            let Some(from) = current.get_param(&key) else {
                continue;
            };
            let Some(to) = bounds.step_from(&from, direction) else {
                debug!(key = %key, value = %from, "Parameter at bound, trying next candidate");
                continue;
            };

            let delta = ConfigDelta::single(&key, from.clone(), to.clone());
            if let Err(e) = self.allowlist.validate_delta(&delta) {
                debug!(key = %key, error = %e, "Candidate outside allowlist");
                continue;
            }
            if delta.apply(current).is_err() {
                continue;
            }

            let proposal = ImprovementProposal {
                id: ProposalId::new(),
                hypothesis,
                report: report.clone(),
                risk_level: bounds.risk(&from, &to),
                config_delta: delta,
                test_plan: TestPlan {
                    target_metric: report.metric,
                    benchmark_cases: self.benchmark_cases,
                    repeats: self.repeats,
                },
                status: ProposalStatus::Proposed,
                created_at: Utc::now(),
            };
            info!(
                proposal_id = %proposal.id,
                key = %key,
                from = %from,
                to = %to,
                risk = ?proposal.risk_level,
                "Improvement proposed"
            );
            return Ok(proposal);
        }

        Err(MetaError::Rejected {
            reason: format!("no adjustable parameter left for {:?}", report.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::types::{ParamValue, Severity, TargetMetric};
    use crate::router::Role;

    fn report(kind: BottleneckKind, metric: TargetMetric) -> BottleneckReport {
        BottleneckReport {
            kind,
            severity: Severity::High,
            metric,
            observed: 1.0,
            threshold: 0.5,
            sample_count: 5,
            evidence: vec![],
            dominant_reason: None,
        }
    }

    fn proposer() -> Proposer {
        Proposer::new(ParameterAllowlist::default_engine(), 4, 5)
    }

    #[test]
    fn test_token_heavy_lowers_budget() {
        let p = proposer()
            .propose(
                &report(BottleneckKind::TokenHeavy { role: Role::Retriever }, TargetMetric::TokenUsage),
                &EngineConfig::default(),
            )
            .unwrap();
        let change = &p.config_delta.changes[0];
        assert_eq!(change.key, "budget.retriever");
        assert_eq!(change.from, ParamValue::Integer(1024));
        assert_eq!(change.to, ParamValue::Integer(768));
        assert_eq!(p.status, ProposalStatus::Proposed);
        assert_eq!(p.test_plan.repeats, 5);
    }

    #[test]
    fn test_variance_at_zero_temperature_is_rejected() {
        let err = proposer()
            .propose(
                &report(BottleneckKind::AnswerVariance, TargetMetric::Variance),
                &EngineConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, MetaError::Rejected { .. }));
    }

    #[test]
    fn test_falls_through_to_next_candidate() {
        let mut config = EngineConfig::default();
        config.controller.max_retries = 0;
        let p = proposer()
            .propose(
                &report(BottleneckKind::BreakerTrips, TargetMetric::Latency),
                &config,
            )
            .unwrap();
        assert_eq!(p.config_delta.changes[0].key, "controller.role_timeout_ms");
    }
}
