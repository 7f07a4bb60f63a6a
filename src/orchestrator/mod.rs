//! Orchestration controller.
//!
//! Runs every node of an execution plan through the fixed role pipeline,
//! wave by wave. Nodes of one wave have no edges between them and run as
//! separate tasks against the same read-only memory snapshot.

mod breaker;
mod gate;
mod invoker;

pub use breaker::{BreakerTrip, QueryBreaker};
pub use gate::{PassthroughGate, PatternGate, SecurityGate};
pub use invoker::{
    invoke_with_retry, ContextSnippet, EchoInvoker, HttpInvoker, InvocationFailure, InvokeRequest,
    InvokeResponse, Message, MessageRole, PromptContext, ReasoningInvoker, RetryPolicy, RoleOutput,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::decomposition::{
    Decomposer, Decomposition, DecompositionArtifacts, ExecutionPlan, NodeId, SnapshotProbe,
    SubQuestionNode, Terminator,
};
use crate::error::{EngineError, EngineResult};
use crate::memory::{MemorySnapshot, MemoryStore};
use crate::router::{
    summarize_allocations, ContextRouter, QueryContext, Role, RoleBudgetAllocation,
    RoleMetricsSummary,
};
use crate::trace::{
    ArtifactKind, ArtifactWriter, ExecutionTrace, NodeState, NullTraceSink, ReasonCode,
    TraceEvent, TraceOutput, TraceRecord, TraceRecorder, TraceSink,
};

/// Everything the pipeline needs, passed explicitly instead of held globally.
#[derive(Clone)]
pub struct EngineContext {
    pub memory: Arc<MemoryStore>,
    pub config: Arc<EngineConfig>,
    /// Extra sink for every record, in addition to the per-run copy
    pub trace: Arc<dyn TraceSink>,
    pub invoker: Arc<dyn ReasoningInvoker>,
    pub gate: Arc<dyn SecurityGate>,
    pub artifacts: Option<ArtifactWriter>,
}

impl EngineContext {
    pub fn new(
        memory: Arc<MemoryStore>,
        config: Arc<EngineConfig>,
        invoker: Arc<dyn ReasoningInvoker>,
        gate: Arc<dyn SecurityGate>,
    ) -> Self {
        Self {
            memory,
            config,
            trace: Arc::new(NullTraceSink),
            invoker,
            gate,
            artifacts: None,
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn with_artifacts(mut self, writer: ArtifactWriter) -> Self {
        self.artifacts = Some(writer);
        self
    }

    /// Same collaborators, different configuration.
    pub fn with_config(&self, config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("memory", &self.memory)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

/// A query submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub run_id: String,
    pub correlation_id: String,
    /// Instant recency is measured against
    pub reference_time: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            run_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            reference_time: Utc::now(),
        }
    }

    pub fn with_ids(mut self, run_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_reference_time(mut self, at: DateTime<Utc>) -> Self {
        self.reference_time = at;
        self
    }
}

/// Overall status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    /// The final node completed
    Completed,
    /// The final node failed after retries
    Partial,
    /// Stopped by a terminator, the breaker or cancellation
    Terminated,
}

/// Final state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    /// Question with dependency answers substituted
    pub question: String,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Role invocation attempts, retries included
    pub attempts: u32,
}

impl NodeReport {
    fn pending(node: &SubQuestionNode) -> Self {
        Self {
            id: node.id,
            question: node.text.clone(),
            state: NodeState::Pending,
            reason: None,
            answer: None,
            confidence: None,
            attempts: 0,
        }
    }

    fn terminated(node: &SubQuestionNode, reason: ReasonCode) -> Self {
        Self {
            state: NodeState::Terminated,
            reason: Some(reason),
            ..Self::pending(node)
        }
    }
}

/// What a caller gets back; failures are reported here rather than raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub run_id: String,
    pub correlation_id: String,
    pub status: QueryStatus,
    /// Present only when the final node completed
    pub answer: Option<String>,
    pub confidence: f64,
    pub reason: Option<ReasonCode>,
    pub plan: ExecutionPlan,
    pub artifacts: DecompositionArtifacts,
    /// In plan order
    pub nodes: Vec<NodeReport>,
    /// In plan order, then role order
    pub allocations: Vec<RoleBudgetAllocation>,
    pub router_metrics: Vec<RoleMetricsSummary>,
    pub steps_used: u32,
    pub elapsed_ms: u64,
    pub trace: Vec<TraceRecord>,
}

impl QueryOutcome {
    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Tokens selected across every role allocation.
    pub fn selected_tokens(&self) -> usize {
        self.allocations.iter().map(|a| a.total_selected_tokens).sum()
    }
}

#[derive(Serialize)]
struct RouterMetricsArtifact<'a> {
    per_role: &'a [RoleMetricsSummary],
    allocations: &'a [RoleBudgetAllocation],
}

/// The orchestration controller.
pub struct Controller {
    ctx: Arc<EngineContext>,
    decomposer: Decomposer,
    router: Arc<ContextRouter>,
    policy: RetryPolicy,
}

impl Controller {
    /// Build a controller; an invalid configuration is rejected here.
    pub fn new(ctx: Arc<EngineContext>) -> EngineResult<Self> {
        ctx.config.validate()?;
        Ok(Self {
            decomposer: Decomposer::new(&ctx.config.decomposition)?,
            router: Arc::new(ContextRouter::new(&ctx.config)?),
            policy: RetryPolicy::from_config(&ctx.config.controller),
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Preflight plan against the current memory snapshot.
    pub async fn plan(&self, text: &str) -> EngineResult<Decomposition> {
        let snapshot = self.ctx.memory.snapshot().await;
        self.plan_with(text, snapshot)
    }

    fn plan_with(&self, text: &str, snapshot: Arc<MemorySnapshot>) -> EngineResult<Decomposition> {
        let probe = SnapshotProbe::new(snapshot, Arc::clone(self.ctx.memory.embedder()));
        self.decomposer.decompose(text, Some(&probe))
    }

    /// Execute a query to completion, termination or cancellation.
    ///
    /// Only configuration and artifact I/O problems are returned as errors;
    /// every other outcome is a [`QueryOutcome`] with a reason code.
    pub async fn execute(&self, query: Query, cancel: CancellationToken) -> EngineResult<QueryOutcome> {
        let snapshot = self.ctx.memory.snapshot().await;
        let config = &self.ctx.config;

        let run = match &self.ctx.artifacts {
            Some(writer) => Some(writer.begin_run(&query.run_id, &query.correlation_id)?),
            None => None,
        };

        let local_trace = Arc::new(ExecutionTrace::new());
        let mut sinks: Vec<Arc<dyn TraceSink>> = vec![
            Arc::clone(&local_trace) as Arc<dyn TraceSink>,
            Arc::clone(&self.ctx.trace),
        ];
        if let Some(run) = &run {
            sinks.push(Arc::new(run.trace_sink()?));
        }
        let recorder = Arc::new(TraceRecorder::new(
            query.run_id.clone(),
            query.correlation_id.clone(),
            sinks,
            Arc::clone(&self.ctx.gate),
        ));

        info!(
            run_id = %query.run_id,
            correlation_id = %query.correlation_id,
            snapshot_version = snapshot.version,
            "Query started"
        );
        recorder.emit(TraceEvent::QueryStarted, |r| r.detail = Some(query.text.clone()));

        let decomposition = self.plan_with(&query.text, Arc::clone(&snapshot))?;
        let plan = decomposition.plan.clone();
        recorder.emit(TraceEvent::PlanAccepted, |r| {
            r.detail = Some(format!("{} nodes, {} edges", plan.len(), decomposition.artifacts.plan_graph.edges.len()));
        });
        if let Some(run) = &run {
            run.write(ArtifactKind::PreflightPlan, &decomposition)?;
            run.write(ArtifactKind::MemoryPre, snapshot.as_ref())?;
        }

        let mut reports: BTreeMap<NodeId, NodeReport> = BTreeMap::new();
        for node in plan.nodes() {
            recorder.emit(TraceEvent::NodeState, |r| {
                r.node = Some(node.id);
                r.state = Some(NodeState::Pending);
            });
            reports.insert(node.id, NodeReport::pending(node));
        }

        let breaker = Arc::new(QueryBreaker::new(&config.controller));
        let mut answers: BTreeMap<NodeId, Arc<str>> = BTreeMap::new();
        let mut allocations: BTreeMap<NodeId, Vec<RoleBudgetAllocation>> = BTreeMap::new();

        for wave in plan.waves() {
            // Answers so far; read-only for the whole wave.
            let resolved = Arc::new(answers.clone());
            let mut tasks = JoinSet::new();

            for id in wave {
                let Some(node) = plan.get(id) else {
                    continue;
                };
                if let Some(reason) = self.preempt(node, &reports, &breaker, &cancel) {
                    debug!(run_id = %query.run_id, node_id = %id, reason = %reason, "Node not started");
                    recorder.emit(TraceEvent::NodeState, |r| {
                        r.node = Some(id);
                        r.state = Some(NodeState::Terminated);
                        r.reason = Some(reason);
                        if node.terminator.is_terminal() {
                            r.detail = Some(node.terminator.to_string());
                        }
                    });
                    reports.insert(id, NodeReport::terminated(node, reason));
                    continue;
                }

                let task = NodeTask {
                    node: node.clone(),
                    resolved: Arc::clone(&resolved),
                    snapshot: Arc::clone(&snapshot),
                    ctx: Arc::clone(&self.ctx),
                    router: Arc::clone(&self.router),
                    policy: self.policy.clone(),
                    breaker: Arc::clone(&breaker),
                    recorder: Arc::clone(&recorder),
                    cancel: cancel.clone(),
                    reference_time: query.reference_time,
                };
                tasks.spawn(task.run());
            }

            while let Some(joined) = tasks.join_next().await {
                let result = joined.map_err(|e| EngineError::Internal {
                    message: format!("node task failed: {}", e),
                })?;
                if let Some(answer) = &result.report.answer {
                    answers.insert(result.report.id, Arc::from(answer.as_str()));
                }
                allocations.insert(result.report.id, result.allocations);
                reports.insert(result.report.id, result.report);
            }
        }

        let nodes: Vec<NodeReport> = plan
            .nodes()
            .iter()
            .filter_map(|n| reports.remove(&n.id))
            .collect();
        let allocations: Vec<RoleBudgetAllocation> = plan
            .nodes()
            .iter()
            .filter_map(|n| allocations.remove(&n.id))
            .flatten()
            .collect();
        let router_metrics = summarize_allocations(&allocations);

        let final_report = plan.final_node().and_then(|f| nodes.iter().find(|n| n.id == f.id));
        let (mut status, mut reason) = match final_report.map(|r| (r.state, r.reason)) {
            Some((NodeState::Completed, _)) => (QueryStatus::Completed, None),
            Some((NodeState::Failed, _)) => (QueryStatus::Partial, Some(ReasonCode::ExternalCallFailure)),
            Some((_, reason)) => (QueryStatus::Terminated, reason),
            None => (QueryStatus::Terminated, None),
        };
        if status != QueryStatus::Completed {
            if cancel.is_cancelled() {
                status = QueryStatus::Terminated;
                reason = Some(ReasonCode::Cancelled);
                recorder.emit(TraceEvent::QueryCancelled, |r| r.reason = Some(ReasonCode::Cancelled));
            } else if breaker.check().is_some() {
                status = QueryStatus::Terminated;
                reason = Some(ReasonCode::CircuitBreakerTrip);
            }
        }

        let answer = match final_report {
            Some(r) if r.state == NodeState::Completed => r.answer.clone(),
            _ => None,
        };
        let confidence = final_report.and_then(|r| r.confidence).unwrap_or(0.0);
        let elapsed_ms = breaker.elapsed().as_millis() as u64;

        recorder.emit(TraceEvent::QueryFinished, |r| {
            r.reason = reason;
            r.duration_ms = Some(elapsed_ms);
            r.detail = Some(format!("{:?}", status));
        });

        if let Some(run) = &run {
            run.write(
                ArtifactKind::RouterMetrics,
                &RouterMetricsArtifact {
                    per_role: &router_metrics,
                    allocations: &allocations,
                },
            )?;
            let post = self.ctx.memory.snapshot().await;
            run.write(ArtifactKind::MemoryPost, post.as_ref())?;
        }

        info!(
            run_id = %query.run_id,
            correlation_id = %query.correlation_id,
            status = ?status,
            reason = ?reason,
            steps = breaker.steps_used(),
            latency_ms = elapsed_ms,
            "Query finished"
        );

        Ok(QueryOutcome {
            run_id: query.run_id,
            correlation_id: query.correlation_id,
            status,
            answer,
            confidence,
            reason,
            plan,
            artifacts: decomposition.artifacts,
            nodes,
            allocations,
            router_metrics,
            steps_used: breaker.steps_used(),
            elapsed_ms,
            trace: local_trace.records(),
        })
    }

    /// Reason a node must not start, if any.
    fn preempt(
        &self,
        node: &SubQuestionNode,
        reports: &BTreeMap<NodeId, NodeReport>,
        breaker: &QueryBreaker,
        cancel: &CancellationToken,
    ) -> Option<ReasonCode> {
        if let Some(reason) = terminator_reason(node.terminator) {
            return Some(reason);
        }
        let unavailable = node.depends_on.iter().any(|dep| {
            reports
                .get(dep)
                .map_or(true, |r| r.state != NodeState::Completed)
        });
        if unavailable {
            return Some(ReasonCode::DependencyUnavailable);
        }
        if cancel.is_cancelled() {
            return Some(ReasonCode::Cancelled);
        }
        if breaker.check().is_some() {
            return Some(ReasonCode::CircuitBreakerTrip);
        }
        None
    }
}

fn terminator_reason(terminator: Terminator) -> Option<ReasonCode> {
    match terminator {
        Terminator::None => None,
        Terminator::Unanswerable => Some(ReasonCode::Unanswerable),
        Terminator::Contradiction => Some(ReasonCode::Contradiction),
        Terminator::LowSupport => Some(ReasonCode::LowSupport),
    }
}

/// Replace `[qN]` placeholders with the answers of completed dependencies.
pub fn resolve_placeholders(
    node: &SubQuestionNode,
    answers: &BTreeMap<NodeId, Arc<str>>,
) -> String {
    node.depends_on.iter().fold(node.text.clone(), |text, dep| {
        match answers.get(dep) {
            Some(answer) => text.replace(&dep.placeholder(), answer),
            None => text,
        }
    })
}

struct NodeResult {
    report: NodeReport,
    allocations: Vec<RoleBudgetAllocation>,
}

/// One node's walk through the role pipeline.
struct NodeTask {
    node: SubQuestionNode,
    resolved: Arc<BTreeMap<NodeId, Arc<str>>>,
    snapshot: Arc<MemorySnapshot>,
    ctx: Arc<EngineContext>,
    router: Arc<ContextRouter>,
    policy: RetryPolicy,
    breaker: Arc<QueryBreaker>,
    recorder: Arc<TraceRecorder>,
    cancel: CancellationToken,
    reference_time: DateTime<Utc>,
}

impl NodeTask {
    fn transition(&self, state: NodeState, role: Option<Role>, reason: Option<ReasonCode>) {
        self.recorder.emit(TraceEvent::NodeState, |r| {
            r.node = Some(self.node.id);
            r.role = role;
            r.state = Some(state);
            r.reason = reason;
        });
    }

    async fn run(self) -> NodeResult {
        let id = self.node.id;
        let question = resolve_placeholders(&self.node, &self.resolved);
        let query_ctx = QueryContext::new(
            question.clone(),
            self.ctx.memory.embedder().as_ref(),
            self.reference_time,
        );
        let sampling = &self.ctx.config.sampling;
        let mut prompt = PromptContext {
            node: id,
            question: question.clone(),
            context: Vec::new(),
            prior_outputs: BTreeMap::new(),
            temperature: sampling.temperature,
            seed: sampling.seed,
        };

        let mut report = NodeReport {
            question,
            ..NodeReport::pending(&self.node)
        };
        let mut allocations = Vec::with_capacity(Role::ALL.len());
        let mut last: Option<RoleOutput> = None;

        for role in Role::ALL {
            self.transition(NodeState::Routing, Some(role), None);
            let budget = self.router.budget_for(role);
            let allocation = self.router.route(role, budget, &self.snapshot, &query_ctx);
            for skipped in &allocation.skipped_item_ids {
                self.recorder.emit(TraceEvent::BudgetItemSkipped, |r| {
                    r.node = Some(id);
                    r.role = Some(role);
                    r.reason = Some(ReasonCode::BudgetItemSkipped);
                    r.detail = Some(skipped.clone());
                });
            }
            self.recorder.emit(TraceEvent::RoleRouted, |r| {
                r.node = Some(id);
                r.role = Some(role);
                r.allocation = Some(allocation.clone());
            });
            prompt.context = allocation
                .selected_item_ids
                .iter()
                .filter_map(|item_id| self.snapshot.get(item_id))
                .map(|item| ContextSnippet {
                    id: item.id.clone(),
                    content: item.content.clone(),
                })
                .collect();
            allocations.push(allocation);

            self.transition(NodeState::Executing, Some(role), None);
            let started = Instant::now();
            let result = invoke_with_retry(
                self.ctx.invoker.as_ref(),
                role,
                &prompt,
                &self.policy,
                &self.breaker,
                &self.cancel,
                |retry, error, delay| {
                    self.recorder.emit(TraceEvent::RoleRetry, |r| {
                        r.node = Some(id);
                        r.role = Some(role);
                        r.reason = Some(ReasonCode::ExternalCallFailure);
                        r.duration_ms = Some(delay.as_millis() as u64);
                        r.detail = Some(format!("retry {}: {}", retry, error));
                    });
                },
            )
            .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok((output, attempts)) => {
                    report.attempts += attempts;
                    self.recorder.emit(TraceEvent::RoleCompleted, |r| {
                        r.node = Some(id);
                        r.role = Some(role);
                        r.duration_ms = Some(duration_ms);
                        r.role_output = Some(TraceOutput {
                            text: output.text.clone(),
                            confidence: output.confidence,
                        });
                    });
                    prompt.prior_outputs.insert(role, output.text.clone());
                    last = Some(output);
                }
                Err(InvocationFailure::Exhausted { error, attempts }) => {
                    report.attempts += attempts;
                    warn!(node_id = %id, role = %role, error = %error, "Node failed");
                    self.recorder.emit(TraceEvent::RoleFailed, |r| {
                        r.node = Some(id);
                        r.role = Some(role);
                        r.duration_ms = Some(duration_ms);
                        r.reason = Some(ReasonCode::ExternalCallFailure);
                        r.detail = Some(error.to_string());
                    });
                    self.transition(NodeState::Failed, Some(role), Some(ReasonCode::ExternalCallFailure));
                    report.state = NodeState::Failed;
                    report.reason = Some(ReasonCode::ExternalCallFailure);
                    return NodeResult { report, allocations };
                }
                Err(InvocationFailure::Cancelled) => {
                    self.transition(NodeState::Terminated, Some(role), Some(ReasonCode::Cancelled));
                    report.state = NodeState::Terminated;
                    report.reason = Some(ReasonCode::Cancelled);
                    return NodeResult { report, allocations };
                }
                Err(InvocationFailure::Breaker(trip)) => {
                    self.recorder.emit(TraceEvent::BreakerTripped, |r| {
                        r.node = Some(id);
                        r.role = Some(role);
                        r.reason = Some(ReasonCode::CircuitBreakerTrip);
                        r.detail = Some(trip.to_string());
                    });
                    self.transition(
                        NodeState::Terminated,
                        Some(role),
                        Some(ReasonCode::CircuitBreakerTrip),
                    );
                    report.state = NodeState::Terminated;
                    report.reason = Some(ReasonCode::CircuitBreakerTrip);
                    return NodeResult { report, allocations };
                }
            }
        }

        self.transition(NodeState::Completed, None, None);
        report.state = NodeState::Completed;
        if let Some(output) = last {
            report.answer = Some(output.text);
            report.confidence = Some(output.confidence);
        }
        NodeResult { report, allocations }
    }
}
