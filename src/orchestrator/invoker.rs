use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::{BreakerTrip, QueryBreaker};
use crate::config::{ControllerConfig, InvokerConfig};
use crate::decomposition::NodeId;
use crate::error::{InvokeError, InvokeResult};
use crate::router::Role;

/// A context item handed to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub id: String,
    pub content: String,
}

/// Everything a role sees for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub node: NodeId,
    /// Question text with dependency placeholders already resolved
    pub question: String,
    pub context: Vec<ContextSnippet>,
    /// Outputs of earlier roles for the same node, in pipeline order
    pub prior_outputs: BTreeMap<Role, String>,
    pub temperature: f64,
    pub seed: u64,
}

impl PromptContext {
    /// Deterministic prompt body for a role.
    pub fn render(&self, role: Role) -> String {
        let mut out = format!("{}\n\nQuestion: {}\n", role.instruction(), self.question);
        if !self.context.is_empty() {
            out.push_str("\nContext:\n");
            for snippet in &self.context {
                out.push_str(&format!("- [{}] {}\n", snippet.id, snippet.content));
            }
        }
        for (prior, text) in &self.prior_outputs {
            out.push_str(&format!("\n{}:\n{}\n", prior, text));
        }
        out
    }
}

/// Result of a role invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleOutput {
    pub text: String,
    /// In `[0, 1]`
    pub confidence: f64,
}

/// The external reasoning collaborator. One call is one attempt; retries,
/// timeouts and cancellation are applied by the caller.
#[async_trait]
pub trait ReasoningInvoker: Send + Sync {
    async fn invoke(&self, role: Role, prompt: &PromptContext) -> InvokeResult<RoleOutput>;
}

// ============================================================================
// HTTP invoker
// ============================================================================

/// Chat message sent to the reasoning endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

/// Request body for `POST {base_url}/v1/invoke`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub role: Role,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub seed: u64,
}

/// Response body of the reasoning endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Provider-neutral JSON-over-HTTP invoker.
#[derive(Clone)]
pub struct HttpInvoker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpInvoker {
    pub fn new(config: &InvokerConfig) -> InvokeResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| InvokeError::InvalidResponse {
                message: "INVOKER_BASE_URL is not set".to_string(),
            })?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(InvokeError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ReasoningInvoker for HttpInvoker {
    async fn invoke(&self, role: Role, prompt: &PromptContext) -> InvokeResult<RoleOutput> {
        let url = format!("{}/v1/invoke", self.base_url);
        let request = InvokeRequest {
            role,
            messages: vec![
                Message {
                    role: MessageRole::System,
                    content: role.instruction().to_string(),
                },
                Message {
                    role: MessageRole::User,
                    content: prompt.render(role),
                },
            ],
            temperature: prompt.temperature,
            seed: prompt.seed,
        };

        debug!(role = %role, node_id = %prompt.node, "Calling reasoning endpoint");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                InvokeError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: InvokeResponse =
            response
                .json()
                .await
                .map_err(|e| InvokeError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        Ok(RoleOutput {
            text: body.text,
            confidence: body.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

impl std::fmt::Debug for HttpInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpInvoker")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Offline invoker
// ============================================================================

/// Deterministic offline invoker.
///
/// The solver answers with the highest-ranked context snippet (or the
/// question when there is none); the rewriter repeats the solver; the other
/// roles acknowledge the question.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoInvoker;

#[async_trait]
impl ReasoningInvoker for EchoInvoker {
    async fn invoke(&self, role: Role, prompt: &PromptContext) -> InvokeResult<RoleOutput> {
        let grounded = !prompt.context.is_empty();
        let text = match role {
            Role::Solver => prompt
                .context
                .first()
                .map(|s| s.content.clone())
                .unwrap_or_else(|| prompt.question.clone()),
            Role::Rewriter => prompt
                .prior_outputs
                .get(&Role::Solver)
                .cloned()
                .unwrap_or_else(|| prompt.question.clone()),
            other => format!("{}: {}", other, prompt.question),
        };
        Ok(RoleOutput {
            text,
            confidence: if grounded { 0.9 } else { 0.5 },
        })
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Attempt timeout and bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            attempt_timeout: Duration::from_millis(config.role_timeout_ms),
        }
    }

    /// `base * 2^(retry-1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Why a wrapped invocation produced no output.
#[derive(Debug)]
pub enum InvocationFailure {
    /// Every attempt failed
    Exhausted { error: InvokeError, attempts: u32 },
    Cancelled,
    Breaker(BreakerTrip),
}

/// Invoke with per-attempt timeout, bounded backoff, breaker steps and
/// cancellation.
///
/// Each attempt reserves a breaker step and is bounded by the smaller of the
/// role timeout and the breaker's remaining wall-clock time. `on_retry` is
/// called before each backoff sleep.
pub async fn invoke_with_retry<F>(
    invoker: &dyn ReasoningInvoker,
    role: Role,
    prompt: &PromptContext,
    policy: &RetryPolicy,
    breaker: &QueryBreaker,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> Result<(RoleOutput, u32), InvocationFailure>
where
    F: FnMut(u32, &InvokeError, Duration),
{
    let mut attempts = 0u32;
    loop {
        breaker.acquire_step().map_err(InvocationFailure::Breaker)?;
        attempts += 1;

        let limit = policy.attempt_timeout.min(breaker.remaining());
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvocationFailure::Cancelled),
            r = tokio::time::timeout(limit, invoker.invoke(role, prompt)) => r,
        };

        let error = match result {
            Ok(Ok(output)) => {
                info!(
                    role = %role,
                    node_id = %prompt.node,
                    attempts,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Role invocation succeeded"
                );
                return Ok((output, attempts));
            }
            Ok(Err(e)) => e,
            Err(_) => {
                if let Some(trip) = breaker.check() {
                    return Err(InvocationFailure::Breaker(trip));
                }
                InvokeError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                }
            }
        };

        error!(
            role = %role,
            node_id = %prompt.node,
            error = %error,
            attempt = attempts,
            latency_ms = start.elapsed().as_millis() as u64,
            "Role invocation failed"
        );

        if attempts > policy.max_retries {
            return Err(InvocationFailure::Exhausted {
                error: InvokeError::Unavailable {
                    role: role.to_string(),
                    message: error.to_string(),
                    attempts,
                },
                attempts,
            });
        }

        let delay = policy.delay_for(attempts);
        warn!(
            role = %role,
            node_id = %prompt.node,
            retry = attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying role invocation"
        );
        on_retry(attempts, &error, delay);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InvocationFailure::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
