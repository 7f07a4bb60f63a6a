//! Loop-level circuit breaker.
//!
//! Stops the meta-learning loop from proposing after repeated rollbacks:
//!
//! - **Closed**: cycles run normally
//! - **Open**: cycles are refused until the recovery timeout passes
//! - **Half-Open**: cycles run again; enough adoptions close the breaker,
//!   one rollback reopens it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::MetaConfig;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted breaker counters, restored on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Breaker over cycle outcomes: adoption is a success, rollback a failure.
#[derive(Debug, Clone)]
pub struct LoopBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<DateTime<Utc>>,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: chrono::Duration,
}

impl LoopBreaker {
    pub fn new(config: &MetaConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            recovery_timeout: chrono::Duration::seconds(config.recovery_timeout_secs as i64),
        }
    }

    /// Breaker restored from a saved state; thresholds come from `config`.
    pub fn from_state(config: &MetaConfig, saved: LoopBreakerState) -> Self {
        Self {
            state: saved.state,
            consecutive_failures: saved.consecutive_failures,
            consecutive_successes: saved.consecutive_successes,
            last_failure: saved.last_failure,
            ..Self::new(config)
        }
    }

    pub fn snapshot(&self) -> LoopBreakerState {
        LoopBreakerState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure: self.last_failure,
        }
    }

    /// Whether a cycle may run at `now`.
    pub fn can_execute(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .is_some_and(|at| now - at >= self.recovery_timeout);
                if recovered {
                    self.transition_to(CircuitState::HalfOpen);
                }
                recovered
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.state == CircuitState::HalfOpen
            && self.consecutive_successes >= self.success_threshold
        {
            self.transition_to(CircuitState::Closed);
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.transition_to(CircuitState::Open)
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            _ => {}
        }
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        tracing::info!(
            from = %self.state,
            to = %new_state,
            consecutive_failures = self.consecutive_failures,
            consecutive_successes = self.consecutive_successes,
            "Meta-learning breaker state transition"
        );
        self.state = new_state;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> LoopBreaker {
        LoopBreaker::new(&MetaConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout_secs: 60,
            ..MetaConfig::default()
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let mut b = breaker();
        let now = Utc::now();
        b.record_failure(now);
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure(now);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute(now));
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let mut b = breaker();
        let now = Utc::now();
        b.record_failure(now);
        b.record_failure(now);
        assert!(b.can_execute(now + chrono::Duration::seconds(61)));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut b = breaker();
        let now = Utc::now();
        b.record_failure(now);
        b.record_failure(now);
        let later = now + chrono::Duration::seconds(61);
        assert!(b.can_execute(later));
        b.record_failure(later);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_restored_breaker_stays_open() {
        let mut b = breaker();
        let now = Utc::now();
        b.record_failure(now);
        b.record_failure(now);

        let json = serde_json::to_string(&b.snapshot()).unwrap();
        let saved: LoopBreakerState = serde_json::from_str(&json).unwrap();
        let mut restored = LoopBreaker::from_state(
            &MetaConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout_secs: 60,
                ..MetaConfig::default()
            },
            saved,
        );

        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.consecutive_failures(), 2);
        assert!(!restored.can_execute(now + chrono::Duration::seconds(30)));
        assert!(restored.can_execute(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut b = breaker();
        let now = Utc::now();
        b.record_failure(now);
        b.record_success();
        b.record_failure(now);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
