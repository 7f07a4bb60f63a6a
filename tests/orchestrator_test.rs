//! Integration tests for the orchestration controller
//!
//! Runs whole queries through decomposition, routing and the role pipeline
//! with offline and scripted invokers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use lag_rcr_engine::config::EngineConfig;
use lag_rcr_engine::decomposition::NodeId;
use lag_rcr_engine::error::{InvokeError, InvokeResult};
use lag_rcr_engine::memory::{HashingEmbedder, MemoryStore, NewMemoryItem};
use lag_rcr_engine::orchestrator::{
    Controller, EchoInvoker, EngineContext, PassthroughGate, PatternGate, PromptContext, Query,
    QueryStatus, ReasoningInvoker, RoleOutput,
};
use lag_rcr_engine::router::Role;
use lag_rcr_engine::trace::{
    read_envelope, read_ndjson, ArtifactKind, ArtifactWriter, NodeState, ReasonCode, TraceEvent,
};

const OLYMPICS: &str =
    "What is the population of the capital of the country that hosted the 2024 Olympics?";
const CARTESIAN: &str = "Compare the GDP and population of France and Germany in 2010 and 2020";

fn reference_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap()
}

async fn memory() -> Arc<MemoryStore> {
    let store = MemoryStore::new(Arc::new(HashingEmbedder::default()));
    let at = reference_time() - chrono::Duration::days(3);
    store
        .ingest(vec![
            NewMemoryItem::new("France hosted the 2024 Olympics in Paris.")
                .with_id("m1")
                .with_created_at(at),
            NewMemoryItem::new("Paris is the capital of France.")
                .with_id("m2")
                .with_created_at(at),
            NewMemoryItem::new("The population of Paris is about 2.1 million people.")
                .with_id("m3")
                .with_created_at(at),
            NewMemoryItem::new("The GDP and population of France and Germany in 2010 and 2020.")
                .with_id("m4")
                .with_created_at(at),
        ])
        .await
        .unwrap();
    Arc::new(store)
}

fn fast_retries(mut config: EngineConfig) -> EngineConfig {
    config.controller.max_retries = 1;
    config.controller.retry_delay_ms = 1;
    config.controller.max_retry_delay_ms = 2;
    config
}

fn controller(
    memory: Arc<MemoryStore>,
    config: EngineConfig,
    invoker: Arc<dyn ReasoningInvoker>,
) -> Controller {
    let ctx = EngineContext::new(memory, Arc::new(config), invoker, Arc::new(PassthroughGate));
    Controller::new(Arc::new(ctx)).unwrap()
}

fn query(text: &str) -> Query {
    Query::new(text).with_reference_time(reference_time())
}

/// Fails every call for one node.
struct FailingNode {
    node: NodeId,
}

#[async_trait]
impl ReasoningInvoker for FailingNode {
    async fn invoke(&self, role: Role, prompt: &PromptContext) -> InvokeResult<RoleOutput> {
        if prompt.node == self.node {
            return Err(InvokeError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        EchoInvoker.invoke(role, prompt).await
    }
}

/// Sleeps before answering.
struct SlowInvoker {
    delay: Duration,
    calls: AtomicU32,
}

impl SlowInvoker {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ReasoningInvoker for SlowInvoker {
    async fn invoke(&self, role: Role, prompt: &PromptContext) -> InvokeResult<RoleOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        EchoInvoker.invoke(role, prompt).await
    }
}

/// Answers with text containing personal data.
struct LeakyInvoker;

#[async_trait]
impl ReasoningInvoker for LeakyInvoker {
    async fn invoke(&self, _role: Role, _prompt: &PromptContext) -> InvokeResult<RoleOutput> {
        Ok(RoleOutput {
            text: "Ask alice@example.com for the figures".to_string(),
            confidence: 0.7,
        })
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_multi_hop_query_completes() {
        let c = controller(memory().await, EngineConfig::default(), Arc::new(EchoInvoker));
        let outcome = c.execute(query(OLYMPICS), CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, QueryStatus::Completed);
        assert_eq!(outcome.reason, None);
        assert_eq!(outcome.nodes.len(), 3);
        assert!(outcome.nodes.iter().all(|n| n.state == NodeState::Completed));
        assert!(outcome.answer.as_deref().is_some_and(|a| !a.is_empty()));
        assert!(outcome.confidence > 0.0);

        // Six roles per node, each with its own allocation.
        assert_eq!(outcome.allocations.len(), 18);
        assert_eq!(outcome.steps_used, 18);
        for allocation in &outcome.allocations {
            assert!(allocation.total_selected_tokens <= allocation.budget_tokens);
        }

        // Dependency answers are substituted before routing.
        let second = outcome.node(NodeId(2)).unwrap();
        assert!(!second.question.contains("[q1]"));
    }

    #[tokio::test]
    async fn test_roles_run_in_fixed_order() {
        let c = controller(memory().await, EngineConfig::default(), Arc::new(EchoInvoker));
        let outcome = c
            .execute(query("What is the capital of France?"), CancellationToken::new())
            .await
            .unwrap();

        let roles: Vec<Role> = outcome
            .trace
            .iter()
            .filter(|r| r.event == TraceEvent::RoleCompleted)
            .filter_map(|r| r.role)
            .collect();
        assert_eq!(roles, Role::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_trace_is_append_only_and_tagged() {
        let c = controller(memory().await, EngineConfig::default(), Arc::new(EchoInvoker));
        let q = query(OLYMPICS).with_ids("run-1", "corr-1");
        let outcome = c.execute(q, CancellationToken::new()).await.unwrap();

        let trace = &outcome.trace;
        assert_eq!(trace.first().unwrap().event, TraceEvent::QueryStarted);
        assert_eq!(trace.last().unwrap().event, TraceEvent::QueryFinished);
        for (idx, record) in trace.iter().enumerate() {
            assert_eq!(record.step_id, idx as u64 + 1);
            assert_eq!(record.run_id, "run-1");
            assert_eq!(record.correlation_id, "corr-1");
        }
        let routed = trace.iter().filter(|r| r.event == TraceEvent::RoleRouted).count();
        assert_eq!(routed, 18);
    }

    #[tokio::test]
    async fn test_unanswerable_query_has_no_answer() {
        let invoker = Arc::new(SlowInvoker::new(Duration::ZERO));
        let c = controller(memory().await, EngineConfig::default(), invoker.clone());
        let outcome = c
            .execute(query("What is the taste of the number seven?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::Terminated);
        assert_eq!(outcome.reason, Some(ReasonCode::Unanswerable));
        assert_eq!(outcome.answer, None);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_five_runs_are_stable() {
        let store = memory().await;
        let mut plans = Vec::new();
        let mut selections = Vec::new();
        let mut answers = Vec::new();
        for _ in 0..5 {
            let c = controller(store.clone(), EngineConfig::default(), Arc::new(EchoInvoker));
            let outcome = c.execute(query(OLYMPICS), CancellationToken::new()).await.unwrap();
            plans.push(serde_json::to_string(&outcome.artifacts.plan_graph).unwrap());
            selections.push(
                outcome
                    .allocations
                    .iter()
                    .map(|a| a.selected_item_ids.clone())
                    .collect::<Vec<_>>(),
            );
            answers.push(outcome.answer);
        }
        assert!(plans.windows(2).all(|w| w[0] == w[1]));
        assert!(selections.windows(2).all(|w| w[0] == w[1]));
        assert!(answers.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_up_front() {
        let mut config = EngineConfig::default();
        config.controller.max_steps = 0;
        let ctx = EngineContext::new(
            memory().await,
            Arc::new(config),
            Arc::new(EchoInvoker),
            Arc::new(PassthroughGate),
        );
        let err = Controller::new(Arc::new(ctx)).err().expect("must be rejected");
        assert!(err.is_configuration());
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_failed_node_does_not_abort_siblings() {
        let c = controller(
            memory().await,
            fast_retries(EngineConfig::default()),
            Arc::new(FailingNode { node: NodeId(1) }),
        );
        let outcome = c.execute(query(CARTESIAN), CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.nodes.len(), 9);
        let first = outcome.node(NodeId(1)).unwrap();
        assert_eq!(first.state, NodeState::Failed);
        assert_eq!(first.reason, Some(ReasonCode::ExternalCallFailure));
        assert_eq!(first.attempts, 2);

        for id in 2..=8 {
            assert_eq!(outcome.node(NodeId(id)).unwrap().state, NodeState::Completed);
        }
        let aggregate = outcome.node(NodeId(9)).unwrap();
        assert_eq!(aggregate.state, NodeState::Terminated);
        assert_eq!(aggregate.reason, Some(ReasonCode::DependencyUnavailable));
        assert_eq!(outcome.status, QueryStatus::Terminated);

        assert!(outcome.trace.iter().any(|r| r.event == TraceEvent::RoleRetry));
        assert!(outcome.trace.iter().any(|r| r.event == TraceEvent::RoleFailed));
    }

    #[tokio::test]
    async fn test_final_node_failure_is_partial() {
        let c = controller(
            memory().await,
            fast_retries(EngineConfig::default()),
            Arc::new(FailingNode { node: NodeId(1) }),
        );
        let outcome = c
            .execute(query("What is the capital of France?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::Partial);
        assert_eq!(outcome.reason, Some(ReasonCode::ExternalCallFailure));
        assert_eq!(outcome.answer, None);
    }

    #[tokio::test]
    async fn test_role_timeout_counts_as_failure() {
        let mut config = EngineConfig::default();
        config.controller.role_timeout_ms = 20;
        config.controller.max_retries = 0;
        let c = controller(
            memory().await,
            config,
            Arc::new(SlowInvoker::new(Duration::from_secs(5))),
        );
        let outcome = c
            .execute(query("What is the capital of France?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::Partial);
        let failed = outcome
            .trace
            .iter()
            .find(|r| r.event == TraceEvent::RoleFailed)
            .unwrap();
        assert!(failed.detail.as_deref().unwrap().contains("timeout"));
    }
}

#[cfg(test)]
mod breaker_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_step_ceiling_terminates_with_partial_result() {
        let mut config = EngineConfig::default();
        config.controller.max_steps = 4;
        let c = controller(memory().await, config, Arc::new(EchoInvoker));
        let outcome = c.execute(query(OLYMPICS), CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, QueryStatus::Terminated);
        assert_eq!(outcome.reason, Some(ReasonCode::CircuitBreakerTrip));
        assert_eq!(outcome.steps_used, 4);
        assert_eq!(outcome.answer, None);

        let first = outcome.node(NodeId(1)).unwrap();
        assert_eq!(first.reason, Some(ReasonCode::CircuitBreakerTrip));
        assert!(outcome.trace.iter().any(|r| r.event == TraceEvent::BreakerTripped));
        // Roles completed before the trip stay in the trace.
        let completed = outcome
            .trace
            .iter()
            .filter(|r| r.event == TraceEvent::RoleCompleted)
            .count();
        assert_eq!(completed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_ceiling_bounds_blocking_call() {
        let mut config = EngineConfig::default();
        config.controller.max_wall_ms = 100;
        let c = controller(
            memory().await,
            config,
            Arc::new(SlowInvoker::new(Duration::from_secs(60))),
        );
        let outcome = c
            .execute(query("What is the capital of France?"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::Terminated);
        assert_eq!(outcome.reason, Some(ReasonCode::CircuitBreakerTrip));
        assert!(outcome.elapsed_ms < 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_siblings_run_concurrently() {
        let c = controller(
            memory().await,
            EngineConfig::default(),
            Arc::new(SlowInvoker::new(Duration::from_millis(100))),
        );
        let outcome = c.execute(query(CARTESIAN), CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.status, QueryStatus::Completed);
        // Two waves of six 100ms roles; sequential execution would take 5.4s.
        assert!(outcome.elapsed_ms < 2_000, "took {}ms", outcome.elapsed_ms);
    }
}

#[cfg(test)]
mod cancellation_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_cancellation_interrupts_in_flight_call() {
        let c = controller(
            memory().await,
            EngineConfig::default(),
            Arc::new(SlowInvoker::new(Duration::from_secs(30))),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = c.execute(query(CARTESIAN), cancel).await.unwrap();

        assert_eq!(outcome.status, QueryStatus::Terminated);
        assert_eq!(outcome.reason, Some(ReasonCode::Cancelled));
        assert!(outcome.trace.iter().any(|r| r.event == TraceEvent::QueryCancelled));
        for id in 1..=8 {
            assert_eq!(outcome.node(NodeId(id)).unwrap().reason, Some(ReasonCode::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let invoker = Arc::new(SlowInvoker::new(Duration::ZERO));
        let c = controller(memory().await, EngineConfig::default(), invoker.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = c.execute(query(OLYMPICS), cancel).await.unwrap();

        assert_eq!(outcome.reason, Some(ReasonCode::Cancelled));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
        assert!(!outcome.trace.is_empty());
    }
}

#[cfg(test)]
mod artifact_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_run_writes_all_artifacts_with_ids() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(PatternGate::new().unwrap());
        let ctx = EngineContext::new(
            memory().await,
            Arc::new(EngineConfig::default()),
            Arc::new(EchoInvoker),
            gate.clone(),
        )
        .with_artifacts(ArtifactWriter::new(dir.path(), gate));
        let c = Controller::new(Arc::new(ctx)).unwrap();

        let outcome = c
            .execute(query(OLYMPICS).with_ids("run-art", "corr-art"), CancellationToken::new())
            .await
            .unwrap();

        let run_dir = dir.path().join("run-art");
        for kind in [
            ArtifactKind::PreflightPlan,
            ArtifactKind::RouterMetrics,
            ArtifactKind::MemoryPre,
            ArtifactKind::MemoryPost,
        ] {
            let envelope = read_envelope(&run_dir.join(kind.file_name())).unwrap();
            assert_eq!(envelope.run_id, "run-art");
            assert_eq!(envelope.correlation_id, "corr-art");
            assert_eq!(envelope.kind, kind);
        }

        let records = read_ndjson(&run_dir.join(ArtifactKind::ExecutionTrace.file_name())).unwrap();
        assert_eq!(records.len(), outcome.trace.len());
        let steps: Vec<u64> = records.iter().map(|r| r.step_id).collect();
        let expected: Vec<u64> = outcome.trace.iter().map(|r| r.step_id).collect();
        assert_eq!(steps, expected);
        assert!(records.iter().all(|r| r.run_id == "run-art"));

        let plan = read_envelope(&run_dir.join("preflight_plan.json")).unwrap();
        assert_eq!(plan.payload["plan"]["nodes"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_persisted_outputs_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(PatternGate::new().unwrap());
        let store = memory().await;
        store
            .ingest(vec![NewMemoryItem::new("Contact bob@example.org about France")
                .with_id("m5")
                .with_created_at(reference_time())])
            .await
            .unwrap();
        let ctx = EngineContext::new(
            store,
            Arc::new(EngineConfig::default()),
            Arc::new(LeakyInvoker),
            gate.clone(),
        )
        .with_artifacts(ArtifactWriter::new(dir.path(), gate));
        let c = Controller::new(Arc::new(ctx)).unwrap();

        c.execute(query("What is the capital of France?").with_ids("run-pii", "c"), CancellationToken::new())
            .await
            .unwrap();

        let run_dir = dir.path().join("run-pii");
        let trace = std::fs::read_to_string(run_dir.join("execution_trace.ndjson")).unwrap();
        assert!(!trace.contains("alice@example.com"));
        assert!(trace.contains("[REDACTED_EMAIL]"));

        let memory_pre = std::fs::read_to_string(run_dir.join("memory_pre.json")).unwrap();
        assert!(!memory_pre.contains("bob@example.org"));
    }
}
