//! # LAG/RCR Orchestration Engine
//!
//! Answers complex natural-language queries by splitting them into a
//! dependency-ordered plan of sub-questions (LAG) and solving each one with a
//! fixed sequence of reasoning roles, every role receiving its own
//! token-budgeted slice of memory (RCR). An offline meta-learning loop tunes
//! the engine configuration from recorded execution traces.
//!
//! ## Architecture
//!
//! ```text
//! Query → Decomposer → ExecutionPlan ─┐
//!                                     ▼
//!              Controller ── waves of nodes ── roles ── ContextRouter → Invoker
//!                  │                                         ▲
//!                  ▼                                         │
//!            TraceRecorder → artifacts            MemoryStore snapshot
//!                  │
//!                  ▼
//!          MetaLearningLoop → ConfigRegistry (versioned EngineConfig)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lag_rcr_engine::config::EngineConfig;
//! use lag_rcr_engine::memory::{HashingEmbedder, MemoryStore, DEFAULT_EMBEDDING_DIMS};
//! use lag_rcr_engine::orchestrator::{Controller, EchoInvoker, EngineContext, PassthroughGate, Query};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let memory = Arc::new(MemoryStore::new(Arc::new(HashingEmbedder::new(DEFAULT_EMBEDDING_DIMS))));
//!     let ctx = EngineContext::new(
//!         memory,
//!         Arc::new(EngineConfig::default()),
//!         Arc::new(EchoInvoker),
//!         Arc::new(PassthroughGate),
//!     );
//!     let controller = Controller::new(Arc::new(ctx))?;
//!     let outcome = controller
//!         .execute(Query::new("Who won the 2024 Olympics?"), CancellationToken::new())
//!         .await?;
//!     println!("{:?}", outcome.answer);
//!     Ok(())
//! }
//! ```

/// Command-line interface.
pub mod cli;
/// Process and engine configuration.
pub mod config;
/// Query decomposition into an execution plan.
pub mod decomposition;
/// Error types and result aliases.
pub mod error;
/// Versioned memory store, embeddings and token estimation.
pub mod memory;
/// Meta-learning loop over execution traces.
pub mod meta;
/// Query execution: controller, invokers, breakers and the security gate.
pub mod orchestrator;
/// Role-conditioned context routing.
pub mod router;
/// SQLite persistence.
pub mod storage;
/// Execution trace and persisted artifacts.
pub mod trace;

pub use config::{Config, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use orchestrator::{Controller, EngineContext, Query, QueryOutcome, QueryStatus};
