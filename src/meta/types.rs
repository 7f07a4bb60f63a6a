//! Core types of the meta-learning loop.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{MetaError, MetaResult};
use crate::router::Role;
use crate::trace::ReasonCode;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier of an improvement proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalId(pub String);

impl ProposalId {
    pub fn new() -> Self {
        Self(format!("prop_{}", uuid::Uuid::new_v4()))
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status enums
// ============================================================================

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Proposed,
    Testing,
    Adopted,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "PROPOSED",
            ProposalStatus::Testing => "TESTING",
            ProposalStatus::Adopted => "ADOPTED",
            ProposalStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Allowed forward transitions.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Proposed, Testing)
                | (Testing, Adopted)
                | (Testing, RolledBack)
                | (Adopted, RolledBack)
        )
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PROPOSED" => Ok(ProposalStatus::Proposed),
            "TESTING" => Ok(ProposalStatus::Testing),
            "ADOPTED" => Ok(ProposalStatus::Adopted),
            "ROLLED_BACK" => Ok(ProposalStatus::RolledBack),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

/// How risky a configuration change is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// From the size of a change relative to its allowed range.
    pub fn from_fraction(fraction: f64) -> Self {
        match fraction {
            f if f > 0.25 => RiskLevel::High,
            f if f > 0.10 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Severity of a detected bottleneck.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info = 0,
    Warning = 1,
    High = 2,
    Critical = 3,
}

impl Severity {
    /// From how far an observation exceeds its threshold (`observed / threshold`).
    pub fn from_ratio(ratio: f64) -> Self {
        match ratio {
            r if r >= 2.0 => Severity::Critical,
            r if r >= 1.5 => Severity::High,
            r if r >= 1.0 => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// Metric a change is expected to move.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Latency,
    TokenUsage,
    Variance,
}

impl TargetMetric {
    pub const ALL: [TargetMetric; 3] = [
        TargetMetric::Latency,
        TargetMetric::TokenUsage,
        TargetMetric::Variance,
    ];
}

// ============================================================================
// Parameters and deltas
// ============================================================================

/// Value of a tunable engine parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            ParamValue::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Integer(_) => "integer",
            ParamValue::Float(_) => "float",
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{:.4}", v),
        }
    }
}

/// One parameter change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamChange {
    pub key: String,
    pub from: ParamValue,
    pub to: ParamValue,
}

/// A set of parameter changes applied to a configuration copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigDelta {
    pub changes: Vec<ParamChange>,
}

impl ConfigDelta {
    pub fn single(key: impl Into<String>, from: ParamValue, to: ParamValue) -> Self {
        Self {
            changes: vec![ParamChange {
                key: key.into(),
                from,
                to,
            }],
        }
    }

    /// Apply to a clone of `base`; the original is never touched.
    ///
    /// Fails if a key is unknown, a type does not fit, or the result does
    /// not validate.
    pub fn apply(&self, base: &EngineConfig) -> MetaResult<EngineConfig> {
        let mut config = base.clone();
        for change in &self.changes {
            config.set_param(&change.key, &change.to)?;
        }
        config.validate().map_err(|e| MetaError::Rejected {
            reason: e.to_string(),
        })?;
        Ok(config)
    }
}

// ============================================================================
// Analysis, proposals, evaluation
// ============================================================================

/// What kind of bottleneck the traces show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BottleneckKind {
    /// A role's mean invocation latency is over threshold
    SlowRole { role: Role },
    /// A role keeps filling its budget
    TokenHeavy { role: Role },
    /// Repeated runs of one query give divergent answers
    AnswerVariance,
    /// Too many runs end on the circuit breaker
    BreakerTrips,
}

/// One finding of trace analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BottleneckReport {
    #[serde(flatten)]
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub metric: TargetMetric,
    pub observed: f64,
    pub threshold: f64,
    pub sample_count: usize,
    /// Run ids the finding is based on
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_reason: Option<ReasonCode>,
}

/// How a proposal will be tested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPlan {
    pub target_metric: TargetMetric,
    pub benchmark_cases: usize,
    pub repeats: usize,
}

/// A hypothesis plus the configuration delta that tests it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImprovementProposal {
    pub id: ProposalId,
    pub hypothesis: String,
    pub report: BottleneckReport,
    pub config_delta: ConfigDelta,
    pub risk_level: RiskLevel,
    pub test_plan: TestPlan,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

impl ImprovementProposal {
    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ProposalStatus) -> MetaResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(MetaError::InvalidTransition {
                proposal_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Metrics of one configuration over a benchmark.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvalMetrics {
    /// Fraction of runs whose answer matched, in `[0, 1]`
    pub accuracy: f64,
    pub mean_latency_ms: f64,
    pub mean_tokens: f64,
    /// Mean normalized edit distance between repeated answers
    pub answer_variance: f64,
    pub samples: usize,
}

impl EvalMetrics {
    pub fn metric(&self, metric: TargetMetric) -> f64 {
        match metric {
            TargetMetric::Latency => self.mean_latency_ms,
            TargetMetric::TokenUsage => self.mean_tokens,
            TargetMetric::Variance => self.answer_variance,
        }
    }
}

/// Outcome of a sandbox A/B comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ABResult {
    pub proposal_id: ProposalId,
    pub control: EvalMetrics,
    pub treatment: EvalMetrics,
    /// `treatment.accuracy - control.accuracy`
    pub accuracy_delta: f64,
    /// Relative reduction per metric; positive is better
    pub improvements: BTreeMap<TargetMetric, f64>,
}

impl ABResult {
    pub fn new(proposal_id: ProposalId, control: EvalMetrics, treatment: EvalMetrics) -> Self {
        let improvements = TargetMetric::ALL
            .iter()
            .map(|m| (*m, relative_reduction(control.metric(*m), treatment.metric(*m))))
            .collect();
        Self {
            proposal_id,
            accuracy_delta: treatment.accuracy - control.accuracy,
            control,
            treatment,
            improvements,
        }
    }
}

fn relative_reduction(control: f64, treatment: f64) -> f64 {
    if control > 0.0 {
        (control - treatment) / control
    } else {
        0.0
    }
}

/// Verdict of the decision rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Adopted,
    RolledBack,
}
