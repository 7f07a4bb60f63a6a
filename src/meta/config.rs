//! Configuration of the meta-learning loop.

use crate::config::set_from_env;
use crate::error::{EngineError, EngineResult};

/// Thresholds and limits of the meta-learning loop.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaConfig {
    /// Largest accepted accuracy drop of a treatment (absolute)
    pub accuracy_tolerance: f64,
    /// Smallest relative improvement that counts
    pub min_improvement: f64,

    /// Traces needed before a finding is reported
    pub min_samples: usize,
    /// Mean role latency above which a role counts as slow
    pub latency_threshold_ms: f64,
    /// Mean `selected / budget` above which a role counts as token heavy
    pub token_utilization_threshold: f64,
    /// Mean normalized edit distance between repeated answers
    pub variance_threshold: f64,
    /// Fraction of runs ending on the breaker
    pub breaker_trip_rate: f64,

    /// Relative latency growth after adoption that forces a rollback
    pub latency_regression: f64,
    /// Relative token growth after adoption that forces a rollback
    pub token_regression: f64,

    /// Consecutive rollbacks that open the loop breaker
    pub failure_threshold: u32,
    /// Consecutive adoptions needed to close it from half-open
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,

    /// Repeats of each benchmark case per arm
    pub sandbox_repeats: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            accuracy_tolerance: 0.02,
            min_improvement: 0.05,
            min_samples: 3,
            latency_threshold_ms: 5000.0,
            token_utilization_threshold: 0.9,
            variance_threshold: 0.014,
            breaker_trip_rate: 0.1,
            latency_regression: 0.2,
            token_regression: 0.2,
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_secs: 3600,
            sandbox_repeats: 5,
        }
    }
}

impl MetaConfig {
    /// Load from `META_*` variables on top of the defaults.
    pub fn from_env() -> EngineResult<Self> {
        let mut c = Self::default();
        set_from_env(&mut c.accuracy_tolerance, "META_ACCURACY_TOLERANCE")?;
        set_from_env(&mut c.min_improvement, "META_MIN_IMPROVEMENT")?;
        set_from_env(&mut c.min_samples, "META_MIN_SAMPLES")?;
        set_from_env(&mut c.latency_threshold_ms, "META_LATENCY_THRESHOLD_MS")?;
        set_from_env(&mut c.token_utilization_threshold, "META_TOKEN_UTILIZATION_THRESHOLD")?;
        set_from_env(&mut c.variance_threshold, "META_VARIANCE_THRESHOLD")?;
        set_from_env(&mut c.breaker_trip_rate, "META_BREAKER_TRIP_RATE")?;
        set_from_env(&mut c.latency_regression, "META_LATENCY_REGRESSION")?;
        set_from_env(&mut c.token_regression, "META_TOKEN_REGRESSION")?;
        set_from_env(&mut c.failure_threshold, "META_FAILURE_THRESHOLD")?;
        set_from_env(&mut c.success_threshold, "META_SUCCESS_THRESHOLD")?;
        set_from_env(&mut c.recovery_timeout_secs, "META_RECOVERY_TIMEOUT_SECS")?;
        set_from_env(&mut c.sandbox_repeats, "META_SANDBOX_REPEATS")?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fractions = [
            ("META_ACCURACY_TOLERANCE", self.accuracy_tolerance),
            ("META_MIN_IMPROVEMENT", self.min_improvement),
            ("META_TOKEN_UTILIZATION_THRESHOLD", self.token_utilization_threshold),
            ("META_VARIANCE_THRESHOLD", self.variance_threshold),
            ("META_BREAKER_TRIP_RATE", self.breaker_trip_rate),
        ];
        for (key, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::config(format!(
                    "{} must be in [0, 1] (got {})",
                    key, value
                )));
            }
        }
        if self.sandbox_repeats == 0 {
            return Err(EngineError::config("META_SANDBOX_REPEATS must be at least 1"));
        }
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(EngineError::config(
                "META_FAILURE_THRESHOLD and META_SUCCESS_THRESHOLD must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MetaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_tolerance() {
        let config = MetaConfig {
            accuracy_tolerance: 1.5,
            ..MetaConfig::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
    }
}
