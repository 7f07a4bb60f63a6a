//! Versioned engine configuration with atomic adoption and rollback.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::MetaConfig;
use super::types::{EvalMetrics, ProposalId};
use crate::config::EngineConfig;
use crate::error::{MetaError, MetaResult};

/// One immutable configuration version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub version: u64,
    pub config: Arc<EngineConfig>,
    /// Version this one was derived from
    pub parent: Option<u64>,
    /// Proposal that produced it
    pub proposal_id: Option<ProposalId>,
    /// Treatment metrics recorded at adoption; the monitoring baseline
    pub adopted_metrics: Option<EvalMetrics>,
    pub created_at: DateTime<Utc>,
}

/// Result of one monitoring check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MonitorOutcome {
    Healthy { version: u64 },
    /// Nothing adopted to watch
    Idle { version: u64 },
    RolledBack {
        from: u64,
        to: u64,
        proposal_id: Option<ProposalId>,
        reason: String,
    },
}

#[derive(Debug)]
struct RegistryState {
    versions: Vec<ConfigVersion>,
    active: u64,
}

impl RegistryState {
    fn get(&self, version: u64) -> Option<&ConfigVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Holds every configuration version and which one is live.
///
/// Readers get an `Arc` of the active configuration; switching versions
/// swaps the pointer under a write lock, so a reader sees either the old or
/// the new configuration in full.
#[derive(Debug)]
pub struct ConfigRegistry {
    state: RwLock<RegistryState>,
}

impl ConfigRegistry {
    /// Registry whose version 1 is `initial`.
    pub fn new(initial: EngineConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                versions: vec![ConfigVersion {
                    version: 1,
                    config: Arc::new(initial),
                    parent: None,
                    proposal_id: None,
                    adopted_metrics: None,
                    created_at: Utc::now(),
                }],
                active: 1,
            }),
        }
    }

    /// Rebuild from persisted versions.
    pub fn from_versions(versions: Vec<ConfigVersion>, active: u64) -> MetaResult<Self> {
        if !versions.iter().any(|v| v.version == active) {
            return Err(MetaError::VersionNotFound { version: active });
        }
        Ok(Self {
            state: RwLock::new(RegistryState { versions, active }),
        })
    }

    pub fn current(&self) -> Arc<EngineConfig> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .get(state.active)
            .map(|v| Arc::clone(&v.config))
            .unwrap_or_default()
    }

    pub fn current_version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    pub fn active(&self) -> Option<ConfigVersion> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.get(state.active).cloned()
    }

    /// All versions, oldest first.
    pub fn history(&self) -> Vec<ConfigVersion> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .versions
            .clone()
    }

    /// Publish `config` as a new active version derived from the current one.
    pub fn adopt(
        &self,
        proposal_id: ProposalId,
        config: EngineConfig,
        metrics: EvalMetrics,
    ) -> MetaResult<ConfigVersion> {
        let record = self.push(config, Some(proposal_id), Some(metrics))?;
        info!(
            version = record.version,
            parent = ?record.parent,
            proposal_id = ?record.proposal_id,
            "Configuration adopted"
        );
        Ok(record)
    }

    /// Publish an operator-supplied configuration. It carries no adoption
    /// metrics, so monitoring leaves it alone.
    pub fn publish(&self, config: EngineConfig) -> MetaResult<ConfigVersion> {
        let record = self.push(config, None, None)?;
        info!(
            version = record.version,
            parent = ?record.parent,
            "Configuration published"
        );
        Ok(record)
    }

    fn push(
        &self,
        config: EngineConfig,
        proposal_id: Option<ProposalId>,
        metrics: Option<EvalMetrics>,
    ) -> MetaResult<ConfigVersion> {
        config.validate().map_err(|e| MetaError::Rejected {
            reason: e.to_string(),
        })?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let version = state.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let record = ConfigVersion {
            version,
            config: Arc::new(config),
            parent: Some(state.active),
            proposal_id,
            adopted_metrics: metrics,
            created_at: Utc::now(),
        };
        state.versions.push(record.clone());
        state.active = version;
        Ok(record)
    }

    /// Make `version` active again; its configuration is restored exactly.
    pub fn rollback_to(&self, version: u64) -> MetaResult<Arc<EngineConfig>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let config = state
            .get(version)
            .map(|v| Arc::clone(&v.config))
            .ok_or(MetaError::VersionNotFound { version })?;
        warn!(from = state.active, to = version, "Configuration rolled back");
        state.active = version;
        Ok(config)
    }

    /// Compare live metrics with the active version's adoption metrics and
    /// revert to its parent on a breach, in the same call.
    pub fn monitor(&self, live: &EvalMetrics, config: &MetaConfig) -> MetaResult<MonitorOutcome> {
        let Some(active) = self.active() else {
            return Err(MetaError::VersionNotFound {
                version: self.current_version(),
            });
        };
        let (Some(baseline), Some(parent)) = (&active.adopted_metrics, active.parent) else {
            return Ok(MonitorOutcome::Idle {
                version: active.version,
            });
        };

        let Some(reason) = breach(baseline, live, config) else {
            return Ok(MonitorOutcome::Healthy {
                version: active.version,
            });
        };

        self.rollback_to(parent)?;
        Ok(MonitorOutcome::RolledBack {
            from: active.version,
            to: parent,
            proposal_id: active.proposal_id,
            reason,
        })
    }
}

/// Description of the first threshold `live` breaches, if any.
fn breach(baseline: &EvalMetrics, live: &EvalMetrics, config: &MetaConfig) -> Option<String> {
    if live.accuracy < baseline.accuracy - config.accuracy_tolerance {
        return Some(format!(
            "accuracy {:.4} fell below adopted {:.4} minus tolerance {}",
            live.accuracy, baseline.accuracy, config.accuracy_tolerance
        ));
    }
    if baseline.mean_latency_ms > 0.0
        && live.mean_latency_ms > baseline.mean_latency_ms * (1.0 + config.latency_regression)
    {
        return Some(format!(
            "latency {:.1}ms regressed past {:.1}ms",
            live.mean_latency_ms, baseline.mean_latency_ms
        ));
    }
    if baseline.mean_tokens > 0.0
        && live.mean_tokens > baseline.mean_tokens * (1.0 + config.token_regression)
    {
        return Some(format!(
            "token usage {:.1} regressed past {:.1}",
            live.mean_tokens, baseline.mean_tokens
        ));
    }
    None
}
