use thiserror::Error;

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("External call failed: {0}")]
    External(#[from] InvokeError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Meta-learning error: {0}")]
    Meta(#[from] MetaError),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config {
            message: message.into(),
        }
    }

    /// Whether this error is a caller mistake that must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Config { .. })
    }
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Failures of the external reasoning collaborator
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Reasoning unavailable for {role}: {message} (attempts: {attempts})")]
    Unavailable {
        role: String,
        message: String,
        attempts: u32,
    },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors writing persisted artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Meta-learning loop errors
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("Invalid proposal transition for {proposal_id}: {from} -> {to}")]
    InvalidTransition {
        proposal_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown configuration parameter: {key}")]
    UnknownParameter { key: String },

    #[error("Type mismatch for {key}: expected {expected}")]
    TypeMismatch { key: String, expected: String },

    #[error("Change rejected: {reason}")]
    Rejected { reason: String },

    #[error("Configuration version not found: {version}")]
    VersionNotFound { version: u64 },

    #[error("Meta-learning circuit open after {consecutive_failures} consecutive rollbacks")]
    CircuitOpen { consecutive_failures: u32 },

    #[error("Sandbox evaluation failed: {message}")]
    Sandbox { message: String },
}

/// Result type alias for engine errors
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for external reasoning calls
pub type InvokeResult<T> = Result<T, InvokeError>;

/// Result type alias for artifact writes
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Result type alias for meta-learning operations
pub type MetaResult<T> = Result<T, MetaError>;
