//! Core orchestration logic.
//!
//! This module contains:
//! - Stage: The contract every unit of work implements
//! - SignatureStore: Durable record of the last applied signature per stage
//! - StageRegistry: Identity-to-factory resolution
//! - Orchestrator: Dependency walk and invalidation state machine
//! - RunLock: Caller-side single-writer lock

pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod resolver;
pub mod signature_store;
pub mod stage;

// Re-export commonly used types
pub use error::{EngineError, StoreError};
pub use lock::RunLock;
pub use orchestrator::{settle_order, Orchestrator};
pub use resolver::{StageRegistry, StageResolver};
pub use signature_store::{SignatureStore, SqliteSignatureStore, StoreTransaction};
pub use stage::Stage;
