//! Storage layer.
//!
//! SQLite persistence for memory items, improvement proposals and engine
//! configuration versions.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::memory::MemoryItem;
use crate::config::EngineConfig;
use crate::meta::{ABResult, ConfigVersion, ImprovementProposal, LoopBreakerState};

/// A persisted proposal and the A/B result it was decided on, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal: ImprovementProposal,
    pub ab_result: Option<ABResult>,
}

/// Persisted configuration history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredConfigHistory {
    /// Oldest first
    pub versions: Vec<ConfigVersion>,
    pub active: Option<u64>,
}

/// Storage trait for engine persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    // Memory

    /// Upsert items and record the snapshot version they belong to.
    async fn save_memory_items(&self, items: &[MemoryItem], version: u64) -> StorageResult<()>;
    /// All items ordered by id, with the last recorded snapshot version.
    async fn load_memory_items(&self) -> StorageResult<(u64, Vec<MemoryItem>)>;
    /// Delete items by id; returns how many existed.
    async fn delete_memory_items(&self, ids: &[String]) -> StorageResult<u64>;

    // Proposals

    /// Insert or update a proposal.
    async fn save_proposal(
        &self,
        proposal: &ImprovementProposal,
        ab_result: Option<&ABResult>,
    ) -> StorageResult<()>;
    async fn get_proposal(&self, id: &str) -> StorageResult<Option<ProposalRecord>>;
    /// Most recent first.
    async fn list_proposals(&self, limit: u32) -> StorageResult<Vec<ProposalRecord>>;

    // Configuration versions

    async fn save_config_version(&self, version: &ConfigVersion) -> StorageResult<()>;
    async fn set_active_version(&self, version: u64) -> StorageResult<()>;
    async fn load_config_history(&self) -> StorageResult<StoredConfigHistory>;
    /// Engine configuration the environment supplied on the last start.
    async fn save_seed_config(&self, config: &EngineConfig) -> StorageResult<()>;
    async fn load_seed_config(&self) -> StorageResult<Option<EngineConfig>>;

    // Meta-learning loop

    async fn save_breaker_state(&self, state: &LoopBreakerState) -> StorageResult<()>;
    async fn load_breaker_state(&self) -> StorageResult<Option<LoopBreakerState>>;
}
