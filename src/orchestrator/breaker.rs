use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::config::ControllerConfig;

/// Which ceiling a query exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakerTrip {
    WallClock { elapsed_ms: u64, limit_ms: u64 },
    StepCount { limit: u32 },
}

impl std::fmt::Display for BreakerTrip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerTrip::WallClock {
                elapsed_ms,
                limit_ms,
            } => write!(f, "wall clock {}ms exceeded limit {}ms", elapsed_ms, limit_ms),
            BreakerTrip::StepCount { limit } => write!(f, "step limit {} exceeded", limit),
        }
    }
}

/// Per-query ceiling on wall-clock time and role-invocation steps.
///
/// Shared by all node tasks of one query. Once tripped it stays tripped and
/// reports the first trip.
#[derive(Debug)]
pub struct QueryBreaker {
    started: Instant,
    max_wall: Duration,
    max_steps: u32,
    steps: AtomicU32,
    tripped: OnceLock<BreakerTrip>,
}

impl QueryBreaker {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            started: Instant::now(),
            max_wall: Duration::from_millis(config.max_wall_ms),
            max_steps: config.max_steps,
            steps: AtomicU32::new(0),
            tripped: OnceLock::new(),
        }
    }

    fn trip(&self, trip: BreakerTrip) -> BreakerTrip {
        let first = self.tripped.get_or_init(|| {
            warn!(trip = %trip, "Query circuit breaker tripped");
            trip
        });
        first.clone()
    }

    /// Trip state, checking the wall clock.
    pub fn check(&self) -> Option<BreakerTrip> {
        if let Some(trip) = self.tripped.get() {
            return Some(trip.clone());
        }
        let elapsed = self.started.elapsed();
        if elapsed >= self.max_wall {
            return Some(self.trip(BreakerTrip::WallClock {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: self.max_wall.as_millis() as u64,
            }));
        }
        None
    }

    /// Reserve one role-invocation step.
    pub fn acquire_step(&self) -> Result<u32, BreakerTrip> {
        if let Some(trip) = self.check() {
            return Err(trip);
        }
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if step > self.max_steps {
            return Err(self.trip(BreakerTrip::StepCount {
                limit: self.max_steps,
            }));
        }
        Ok(step)
    }

    /// Wall-clock time left before the breaker trips.
    pub fn remaining(&self) -> Duration {
        self.max_wall.saturating_sub(self.started.elapsed())
    }

    pub fn steps_used(&self) -> u32 {
        self.steps.load(Ordering::SeqCst).min(self.max_steps)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_wall_ms: u64, max_steps: u32) -> ControllerConfig {
        ControllerConfig {
            max_wall_ms,
            max_steps,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_step_limit_trips_and_sticks() {
        let breaker = QueryBreaker::new(&config(60_000, 2));
        assert_eq!(breaker.acquire_step(), Ok(1));
        assert_eq!(breaker.acquire_step(), Ok(2));
        assert_eq!(
            breaker.acquire_step(),
            Err(BreakerTrip::StepCount { limit: 2 })
        );
        assert_eq!(breaker.check(), Some(BreakerTrip::StepCount { limit: 2 }));
        assert_eq!(breaker.steps_used(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_trips() {
        let breaker = QueryBreaker::new(&config(100, 50));
        assert!(breaker.check().is_none());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            breaker.acquire_step(),
            Err(BreakerTrip::WallClock { limit_ms: 100, .. })
        ));
        assert_eq!(breaker.remaining(), Duration::ZERO);
    }
}
