//! Parameter allowlist for the meta-learning loop.
//!
//! Only parameters listed here may be changed by a proposal, each within
//! fixed bounds and by at most one step per proposal.

use std::collections::BTreeMap;

use super::types::{ConfigDelta, ParamChange, ParamValue, RiskLevel};
use crate::router::Role;

/// Error types for allowlist validation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AllowlistError {
    #[error("Parameter not in allowlist: {0}")]
    ParamNotAllowed(String),

    #[error("Value {value} out of bounds [{min}, {max}] for {key}")]
    OutOfBounds {
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Change {change} exceeds max step {max_step} for {key}")]
    StepTooLarge {
        key: String,
        change: f64,
        max_step: f64,
    },

    #[error("Type mismatch for {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Direction of a proposed adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

/// Bounds for a single adjustable parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBounds {
    pub min: ParamValue,
    pub max: ParamValue,
    /// Maximum change per proposal
    pub step: ParamValue,
    pub description: String,
}

impl ParamBounds {
    pub fn integer(min: i64, max: i64, step: i64, description: &str) -> Self {
        Self {
            min: ParamValue::Integer(min),
            max: ParamValue::Integer(max),
            step: ParamValue::Integer(step),
            description: description.to_string(),
        }
    }

    pub fn float(min: f64, max: f64, step: f64, description: &str) -> Self {
        Self {
            min: ParamValue::Float(min),
            max: ParamValue::Float(max),
            step: ParamValue::Float(step),
            description: description.to_string(),
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self.min, ParamValue::Integer(_))
    }

    fn range(&self) -> (f64, f64, f64) {
        (
            self.min.as_float().unwrap_or(0.0),
            self.max.as_float().unwrap_or(0.0),
            self.step.as_float().unwrap_or(0.0),
        )
    }

    fn check_type(&self, key: &str, value: &ParamValue) -> Result<f64, AllowlistError> {
        match (self.is_integer(), value) {
            (true, ParamValue::Integer(v)) => Ok(*v as f64),
            (false, ParamValue::Float(v)) => Ok(*v),
            _ => Err(AllowlistError::TypeMismatch {
                key: key.to_string(),
                expected: self.min.type_name(),
                actual: value.type_name(),
            }),
        }
    }

    /// Validate that a value is within bounds.
    pub fn validate_value(&self, key: &str, value: &ParamValue) -> Result<(), AllowlistError> {
        let v = self.check_type(key, value)?;
        let (min, max, _) = self.range();
        if v < min || v > max {
            return Err(AllowlistError::OutOfBounds {
                key: key.to_string(),
                value: v,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Validate that a change is within the step limit.
    pub fn validate_step(
        &self,
        key: &str,
        old_value: &ParamValue,
        new_value: &ParamValue,
    ) -> Result<(), AllowlistError> {
        let old = self.check_type(key, old_value)?;
        let new = self.check_type(key, new_value)?;
        let (_, _, max_step) = self.range();
        let change = (new - old).abs();
        // Float steps tolerate rounding noise.
        if change > max_step + 1e-9 {
            return Err(AllowlistError::StepTooLarge {
                key: key.to_string(),
                change,
                max_step,
            });
        }
        Ok(())
    }

    /// One step from `current` in `direction`, clamped to the bounds.
    /// `None` when already at the bound.
    pub fn step_from(&self, current: &ParamValue, direction: Direction) -> Option<ParamValue> {
        let (min, max, step) = self.range();
        let cur = current.as_float()?;
        let next = match direction {
            Direction::Increase => (cur + step).min(max),
            Direction::Decrease => (cur - step).max(min),
        };
        if (next - cur).abs() < 1e-9 {
            return None;
        }
        Some(if self.is_integer() {
            ParamValue::Integer(next.round() as i64)
        } else {
            ParamValue::Float((next * 1e6).round() / 1e6)
        })
    }

    /// Risk of moving between two values, by share of the allowed range.
    pub fn risk(&self, from: &ParamValue, to: &ParamValue) -> RiskLevel {
        let (min, max, _) = self.range();
        let span = max - min;
        match (from.as_float(), to.as_float()) {
            (Some(a), Some(b)) if span > 0.0 => RiskLevel::from_fraction((b - a).abs() / span),
            _ => RiskLevel::High,
        }
    }
}

/// The set of parameters a proposal may touch.
#[derive(Debug, Clone)]
pub struct ParameterAllowlist {
    params: BTreeMap<String, ParamBounds>,
}

impl Default for ParameterAllowlist {
    fn default() -> Self {
        Self::default_engine()
    }
}

impl ParameterAllowlist {
    pub fn empty() -> Self {
        Self {
            params: BTreeMap::new(),
        }
    }

    /// Bounds for the engine's tunables.
    pub fn default_engine() -> Self {
        let mut list = Self::empty();
        list.insert("router.topk", ParamBounds::integer(4, 32, 4, "Semantic filter survivors"));
        list.insert("router.min_sim", ParamBounds::float(0.1, 0.8, 0.05, "Semantic filter cut-off"));
        for key in [
            "router.weights.role_keyword",
            "router.weights.task_stage",
            "router.weights.recency",
        ] {
            list.insert(key, ParamBounds::float(0.0, 1.0, 0.1, "Importance weight"));
        }
        list.insert(
            "decomposition.load_threshold",
            ParamBounds::float(0.3, 0.95, 0.05, "Load above which queries are decomposed"),
        );
        list.insert("decomposition.max_depth", ParamBounds::integer(1, 8, 1, "Plan depth limit"));
        list.insert(
            "decomposition.min_support",
            ParamBounds::float(0.0, 0.5, 0.05, "LOW_SUPPORT relevance floor"),
        );
        list.insert(
            "controller.role_timeout_ms",
            ParamBounds::integer(1_000, 120_000, 10_000, "Per-attempt timeout"),
        );
        list.insert("controller.max_retries", ParamBounds::integer(0, 5, 1, "Retries per role call"));
        list.insert("sampling.temperature", ParamBounds::float(0.0, 1.0, 0.2, "Sampling temperature"));
        for role in Role::ALL {
            list.insert(
                &format!("budget.{}", role),
                ParamBounds::integer(128, 8192, 256, "Role token budget"),
            );
        }
        list
    }

    pub fn insert(&mut self, key: &str, bounds: ParamBounds) {
        self.params.insert(key.to_string(), bounds);
    }

    pub fn get(&self, key: &str) -> Option<&ParamBounds> {
        self.params.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn validate_change(&self, change: &ParamChange) -> Result<(), AllowlistError> {
        let bounds = self
            .get(&change.key)
            .ok_or_else(|| AllowlistError::ParamNotAllowed(change.key.clone()))?;
        bounds.validate_value(&change.key, &change.to)?;
        bounds.validate_step(&change.key, &change.from, &change.to)
    }

    pub fn validate_delta(&self, delta: &ConfigDelta) -> Result<(), AllowlistError> {
        delta.changes.iter().try_for_each(|c| self.validate_change(c))
    }
}
