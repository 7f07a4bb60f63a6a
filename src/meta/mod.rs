//! Meta-learning loop.
//!
//! Offline cycle over recorded traces: analyze, propose one bounded
//! configuration change, A/B test it in a sandbox, then adopt or roll back.
//! Adoption only ever publishes a new configuration version.

mod allowlist;
mod analyzer;
mod circuit_breaker;
mod config;
mod proposer;
mod registry;
mod sandbox;
mod types;

pub use allowlist::{AllowlistError, Direction, ParamBounds, ParameterAllowlist};
pub use analyzer::{analyze_traces, answer_variance, levenshtein, normalized_edit_distance};
pub use circuit_breaker::{CircuitState, LoopBreaker, LoopBreakerState};
pub use config::MetaConfig;
pub use proposer::Proposer;
pub use registry::{ConfigRegistry, ConfigVersion, MonitorOutcome};
pub use sandbox::{decide, sandbox_test, BenchmarkCase, ReplayEvaluator, SandboxEvaluator};
pub use types::{
    ABResult, BottleneckKind, BottleneckReport, ConfigDelta, Decision, EvalMetrics,
    ImprovementProposal, ParamChange, ParamValue, ProposalId, ProposalStatus, RiskLevel,
    Severity, TargetMetric, TestPlan,
};

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MetaError, MetaResult};
use crate::trace::TraceRecord;

/// Everything one cycle did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub reports: Vec<BottleneckReport>,
    pub proposal: Option<ImprovementProposal>,
    pub ab_result: Option<ABResult>,
    pub decision: Option<Decision>,
    /// Active configuration version when the cycle ended
    pub config_version: u64,
    /// Findings that produced no proposal, with the reason
    pub skipped: Vec<String>,
}

/// The meta-learning loop.
pub struct MetaLearningLoop {
    config: MetaConfig,
    proposer: Proposer,
    registry: Arc<ConfigRegistry>,
    evaluator: Arc<dyn SandboxEvaluator>,
    breaker: Mutex<LoopBreaker>,
}

impl MetaLearningLoop {
    pub fn new(
        config: MetaConfig,
        allowlist: ParameterAllowlist,
        registry: Arc<ConfigRegistry>,
        evaluator: Arc<dyn SandboxEvaluator>,
    ) -> Self {
        let proposer = Proposer::new(allowlist, evaluator.case_count(), config.sandbox_repeats);
        Self {
            breaker: Mutex::new(LoopBreaker::new(&config)),
            config,
            proposer,
            registry,
            evaluator,
        }
    }

    /// Resume from a breaker state saved by an earlier run.
    pub fn with_breaker_state(self, saved: LoopBreakerState) -> Self {
        Self {
            breaker: Mutex::new(LoopBreaker::from_state(&self.config, saved)),
            ..self
        }
    }

    pub fn breaker_snapshot(&self) -> LoopBreakerState {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn analyze(&self, traces: &[TraceRecord]) -> Vec<BottleneckReport> {
        analyze_traces(traces, &self.config)
    }

    /// Propose against the active configuration.
    pub fn propose(&self, report: &BottleneckReport) -> MetaResult<ImprovementProposal> {
        self.proposer.propose(report, &self.registry.current())
    }

    /// A/B test against the active configuration.
    pub async fn sandbox_test(&self, proposal: &ImprovementProposal) -> MetaResult<ABResult> {
        sandbox_test(proposal, &self.registry.current(), self.evaluator.as_ref()).await
    }

    pub fn decide(&self, result: &ABResult) -> Decision {
        decide(result, &self.config)
    }

    /// One full cycle. At most one proposal is tested per cycle: the one for
    /// the most severe finding that can still be adjusted.
    pub async fn run_cycle(&self, traces: &[TraceRecord]) -> MetaResult<CycleReport> {
        let started_at = Utc::now();
        {
            let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
            if !breaker.can_execute(started_at) {
                return Err(MetaError::CircuitOpen {
                    consecutive_failures: breaker.consecutive_failures(),
                });
            }
        }

        let reports = self.analyze(traces);
        let mut skipped = Vec::new();
        let mut cycle = CycleReport {
            cycle_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            reports: Vec::new(),
            proposal: None,
            ab_result: None,
            decision: None,
            config_version: self.registry.current_version(),
            skipped: Vec::new(),
        };
        info!(
            cycle_id = %cycle.cycle_id,
            findings = reports.len(),
            "Meta-learning cycle started"
        );

        let baseline = self.registry.current();
        let mut proposal = None;
        for report in &reports {
            match self.proposer.propose(report, &baseline) {
                Ok(p) => {
                    proposal = Some(p);
                    break;
                }
                Err(MetaError::Rejected { reason }) => skipped.push(reason),
                Err(e) => return Err(e),
            }
        }
        cycle.reports = reports;
        cycle.skipped = skipped;
        let Some(mut proposal) = proposal else {
            return Ok(cycle);
        };

        proposal.transition(ProposalStatus::Testing)?;
        let ab = match sandbox_test(&proposal, &baseline, self.evaluator.as_ref()).await {
            Ok(ab) => ab,
            Err(e) => {
                warn!(proposal_id = %proposal.id, error = %e, "Sandbox test failed");
                self.record_failure();
                return Err(e);
            }
        };

        let decision = self.decide(&ab);
        match decision {
            Decision::Adopted => {
                let config = proposal.config_delta.apply(&baseline)?;
                let version = self
                    .registry
                    .adopt(proposal.id.clone(), config, ab.treatment.clone())?;
                proposal.transition(ProposalStatus::Adopted)?;
                self.breaker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_success();
                info!(proposal_id = %proposal.id, version = version.version, "Proposal adopted");
            }
            Decision::RolledBack => {
                proposal.transition(ProposalStatus::RolledBack)?;
                self.record_failure();
                info!(proposal_id = %proposal.id, "Proposal rolled back");
            }
        }

        cycle.config_version = self.registry.current_version();
        cycle.decision = Some(decision);
        cycle.ab_result = Some(ab);
        cycle.proposal = Some(proposal);
        Ok(cycle)
    }

    /// Monitoring check of the active version; a rollback counts against
    /// the loop breaker.
    pub fn monitor(&self, live: &EvalMetrics) -> MetaResult<MonitorOutcome> {
        let outcome = self.registry.monitor(live, &self.config)?;
        if matches!(outcome, MonitorOutcome::RolledBack { .. }) {
            self.record_failure();
        }
        Ok(outcome)
    }

    /// Measure the active configuration with the loop's evaluator and run
    /// the monitoring check on the result.
    pub async fn monitor_active(&self) -> MetaResult<MonitorOutcome> {
        let live = self.evaluator.evaluate(self.registry.current()).await?;
        info!(
            version = self.registry.current_version(),
            accuracy = live.accuracy,
            mean_latency_ms = live.mean_latency_ms,
            mean_tokens = live.mean_tokens,
            "Active configuration measured"
        );
        self.monitor(&live)
    }

    fn record_failure(&self) {
        self.breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_failure(Utc::now());
    }
}

impl std::fmt::Debug for MetaLearningLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaLearningLoop")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
