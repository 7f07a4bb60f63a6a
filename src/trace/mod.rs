//! Append-only execution trace.

mod artifacts;

pub use artifacts::{read_envelope, ArtifactKind, ArtifactWriter, Envelope, RunArtifacts};

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::decomposition::NodeId;
use crate::error::ArtifactResult;
use crate::orchestrator::SecurityGate;
use crate::router::{Role, RoleBudgetAllocation};

/// Lifecycle of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Routing,
    Executing,
    Completed,
    Terminated,
    Failed,
}

impl NodeState {
    pub fn is_final(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Terminated | NodeState::Failed)
    }
}

/// Why a node or query did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Unanswerable,
    Contradiction,
    LowSupport,
    DependencyUnavailable,
    ExternalCallFailure,
    CircuitBreakerTrip,
    Cancelled,
    BudgetItemSkipped,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Unanswerable => "UNANSWERABLE",
            ReasonCode::Contradiction => "CONTRADICTION",
            ReasonCode::LowSupport => "LOW_SUPPORT",
            ReasonCode::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            ReasonCode::ExternalCallFailure => "EXTERNAL_CALL_FAILURE",
            ReasonCode::CircuitBreakerTrip => "CIRCUIT_BREAKER_TRIP",
            ReasonCode::Cancelled => "CANCELLED",
            ReasonCode::BudgetItemSkipped => "BUDGET_ITEM_SKIPPED",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    QueryStarted,
    PlanAccepted,
    NodeState,
    RoleRouted,
    RoleCompleted,
    RoleRetry,
    RoleFailed,
    BudgetItemSkipped,
    BreakerTripped,
    QueryCancelled,
    QueryFinished,
}

/// Sanitized output of one role invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOutput {
    pub text: String,
    pub confidence: f64,
}

/// One line of the execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub step_id: u64,
    pub run_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: TraceEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<RoleBudgetAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_output: Option<TraceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Destination for trace records. Records arrive in step order.
pub trait TraceSink: Send + Sync {
    fn append(&self, record: &TraceRecord) -> ArtifactResult<()>;
}

/// In-memory trace; the copy returned with a query outcome.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    records: Mutex<Vec<TraceRecord>>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for ExecutionTrace {
    fn append(&self, record: &TraceRecord) -> ArtifactResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn append(&self, _record: &TraceRecord) -> ArtifactResult<()> {
        Ok(())
    }
}

/// Newline-delimited JSON file sink.
pub struct NdjsonTraceSink {
    writer: Mutex<BufWriter<File>>,
}

impl NdjsonTraceSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> ArtifactResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl TraceSink for NdjsonTraceSink {
    fn append(&self, record: &TraceRecord) -> ArtifactResult<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Read an NDJSON trace file; blank lines are ignored.
pub fn read_ndjson(path: &Path) -> ArtifactResult<Vec<TraceRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Builds, sanitizes and fans out the records of one query run.
pub struct TraceRecorder {
    run_id: String,
    correlation_id: String,
    /// Next step id; held while fanning out so ids and sink order agree
    next_step: Mutex<u64>,
    sinks: Vec<Arc<dyn TraceSink>>,
    gate: Arc<dyn SecurityGate>,
}

impl TraceRecorder {
    pub fn new(
        run_id: impl Into<String>,
        correlation_id: impl Into<String>,
        sinks: Vec<Arc<dyn TraceSink>>,
        gate: Arc<dyn SecurityGate>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            correlation_id: correlation_id.into(),
            next_step: Mutex::new(1),
            sinks,
            gate,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Append one record; `fill` sets the optional fields.
    ///
    /// Output text and details pass through the security gate first. A sink
    /// failure is logged and does not stop the run.
    pub fn emit(&self, event: TraceEvent, fill: impl FnOnce(&mut TraceRecord)) {
        let mut record = TraceRecord {
            step_id: 0,
            run_id: self.run_id.clone(),
            correlation_id: self.correlation_id.clone(),
            timestamp: Utc::now(),
            event,
            node: None,
            role: None,
            state: None,
            allocation: None,
            role_output: None,
            duration_ms: None,
            reason: None,
            detail: None,
        };
        fill(&mut record);

        if let Some(output) = record.role_output.as_mut() {
            output.text = self.gate.sanitize(&output.text);
        }
        if let Some(detail) = record.detail.as_mut() {
            *detail = self.gate.sanitize(detail);
        }

        let mut next = self.next_step.lock().unwrap_or_else(PoisonError::into_inner);
        record.step_id = *next;
        *next += 1;
        for sink in &self.sinks {
            if let Err(e) = sink.append(&record) {
                warn!(
                    run_id = %self.run_id,
                    step_id = record.step_id,
                    error = %e,
                    "Failed to append trace record"
                );
            }
        }
    }
}
