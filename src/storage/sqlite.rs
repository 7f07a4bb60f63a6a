use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ProposalRecord, Storage, StoredConfigHistory};
use crate::config::{DatabaseConfig, EngineConfig};
use crate::error::{StorageError, StorageResult};
use crate::memory::MemoryItem;
use crate::meta::{ABResult, ConfigVersion, ImprovementProposal, LoopBreakerState, ProposalId};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MEMORY_VERSION_KEY: &str = "memory_version";
const ACTIVE_CONFIG_KEY: &str = "active_config_version";
const SEED_CONFIG_KEY: &str = "seed_engine_config";
const BREAKER_KEY: &str = "meta_loop_breaker";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database; a single connection so every query sees the same schema.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn get_state(&self, key: &str) -> StorageResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM store_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_state(&self, key: &str, value: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO store_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn parse_time(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid timestamp '{}': {}", raw, e),
        })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_memory_items(&self, items: &[MemoryItem], version: u64) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO memory_items (id, content, role_tags, created_at, embedding, token_count)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    role_tags = excluded.role_tags,
                    created_at = excluded.created_at,
                    embedding = excluded.embedding,
                    token_count = excluded.token_count
                "#,
            )
            .bind(&item.id)
            .bind(&item.content)
            .bind(to_json(&item.role_tags)?)
            .bind(item.created_at.to_rfc3339())
            .bind(to_json(&item.embedding)?)
            .bind(item.token_count as i64)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO store_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(MEMORY_VERSION_KEY)
        .bind(version.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(items = items.len(), version, "Memory items saved");
        Ok(())
    }

    async fn load_memory_items(&self) -> StorageResult<(u64, Vec<MemoryItem>)> {
        let rows: Vec<MemoryItemRow> = sqlx::query_as(
            r#"
            SELECT id, content, role_tags, created_at, embedding, token_count
            FROM memory_items
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(MemoryItem::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        let version = match self.get_state(MEMORY_VERSION_KEY).await? {
            Some(v) => v.parse().map_err(|_| StorageError::Serialization {
                message: format!("Invalid memory version '{}'", v),
            })?,
            None => 0,
        };
        Ok((version, items))
    }

    async fn delete_memory_items(&self, ids: &[String]) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM memory_items WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn save_proposal(
        &self,
        proposal: &ImprovementProposal,
        ab_result: Option<&ABResult>,
    ) -> StorageResult<()> {
        let ab_json = ab_result.map(to_json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO proposals (id, status, risk_level, hypothesis, body, ab_result, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                ab_result = COALESCE(excluded.ab_result, proposals.ab_result),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&proposal.id.0)
        .bind(proposal.status.as_str())
        .bind(proposal.risk_level.as_str())
        .bind(&proposal.hypothesis)
        .bind(to_json(proposal)?)
        .bind(&ab_json)
        .bind(proposal.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(proposal_id = %proposal.id, status = %proposal.status, "Proposal saved");
        Ok(())
    }

    async fn get_proposal(&self, id: &str) -> StorageResult<Option<ProposalRecord>> {
        let row: Option<ProposalRow> =
            sqlx::query_as("SELECT body, ab_result FROM proposals WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(ProposalRecord::try_from).transpose()
    }

    async fn list_proposals(&self, limit: u32) -> StorageResult<Vec<ProposalRecord>> {
        let rows: Vec<ProposalRow> = sqlx::query_as(
            r#"
            SELECT body, ab_result FROM proposals
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProposalRecord::try_from).collect()
    }

    async fn save_config_version(&self, version: &ConfigVersion) -> StorageResult<()> {
        let metrics = version.adopted_metrics.as_ref().map(to_json).transpose()?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO config_versions
                (version, parent, proposal_id, config, adopted_metrics, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.version as i64)
        .bind(version.parent.map(|p| p as i64))
        .bind(version.proposal_id.as_ref().map(|p| p.0.clone()))
        .bind(to_json(version.config.as_ref())?)
        .bind(&metrics)
        .bind(version.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_active_version(&self, version: u64) -> StorageResult<()> {
        self.set_state(ACTIVE_CONFIG_KEY, &version.to_string()).await
    }

    async fn load_config_history(&self) -> StorageResult<StoredConfigHistory> {
        let rows: Vec<ConfigVersionRow> = sqlx::query_as(
            r#"
            SELECT version, parent, proposal_id, config, adopted_metrics, created_at
            FROM config_versions
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let versions = rows
            .into_iter()
            .map(ConfigVersion::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        let active = self
            .get_state(ACTIVE_CONFIG_KEY)
            .await?
            .and_then(|v| v.parse().ok());
        Ok(StoredConfigHistory { versions, active })
    }

    async fn save_seed_config(&self, config: &EngineConfig) -> StorageResult<()> {
        self.set_state(SEED_CONFIG_KEY, &to_json(config)?).await
    }

    async fn load_seed_config(&self) -> StorageResult<Option<EngineConfig>> {
        self.get_state(SEED_CONFIG_KEY)
            .await?
            .map(|raw| from_json(&raw))
            .transpose()
    }

    async fn save_breaker_state(&self, state: &LoopBreakerState) -> StorageResult<()> {
        self.set_state(BREAKER_KEY, &to_json(state)?).await?;
        debug!(state = %state.state, "Meta-learning breaker state saved");
        Ok(())
    }

    async fn load_breaker_state(&self) -> StorageResult<Option<LoopBreakerState>> {
        self.get_state(BREAKER_KEY)
            .await?
            .map(|raw| from_json(&raw))
            .transpose()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct MemoryItemRow {
    id: String,
    content: String,
    role_tags: String,
    created_at: String,
    embedding: String,
    token_count: i64,
}

impl TryFrom<MemoryItemRow> for MemoryItem {
    type Error = StorageError;

    fn try_from(row: MemoryItemRow) -> StorageResult<Self> {
        Ok(Self {
            role_tags: from_json(&row.role_tags)?,
            created_at: parse_time(&row.created_at)?,
            embedding: from_json(&row.embedding)?,
            token_count: row.token_count.max(0) as usize,
            id: row.id,
            content: row.content,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProposalRow {
    body: String,
    ab_result: Option<String>,
}

impl TryFrom<ProposalRow> for ProposalRecord {
    type Error = StorageError;

    fn try_from(row: ProposalRow) -> StorageResult<Self> {
        Ok(Self {
            proposal: from_json(&row.body)?,
            ab_result: row.ab_result.as_deref().map(from_json).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigVersionRow {
    version: i64,
    parent: Option<i64>,
    proposal_id: Option<String>,
    config: String,
    adopted_metrics: Option<String>,
    created_at: String,
}

impl TryFrom<ConfigVersionRow> for ConfigVersion {
    type Error = StorageError;

    fn try_from(row: ConfigVersionRow) -> StorageResult<Self> {
        Ok(Self {
            version: row.version as u64,
            parent: row.parent.map(|p| p as u64),
            proposal_id: row.proposal_id.map(ProposalId),
            config: Arc::new(from_json(&row.config)?),
            adopted_metrics: row.adopted_metrics.as_deref().map(from_json).transpose()?,
            created_at: parse_time(&row.created_at)?,
        })
    }
}
