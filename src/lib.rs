//! stagehand - Signature-based incremental stage runner
//!
//! Runs a directed graph of named stages, executing a stage only when the
//! signature of its would-be output differs from the one recorded after its
//! last successful run.
//!
//! # Architecture
//!
//! - Every stage computes a signature from the external world it depends on
//! - The last successfully applied signature per stage is kept in SQLite
//! - Dependencies are settled before the stage that needs them
//! - Stale stages are invalidated (old output removed), executed, then recorded
//! - Completed stages stay recorded when a later stage fails, so a re-run
//!   resumes where the failure happened
//!
//! # Modules
//!
//! - `core`: Orchestration logic (Stage, SignatureStore, Orchestrator)
//! - `domain`: Data structures (StageId, Signature, RunReport)
//! - `stages`: Stage file loading and built-in stage kinds
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Bring a stage and its dependencies up to date
//! stagehand run report
//!
//! # Re-run a stage even if nothing changed
//! stagehand run report --force
//!
//! # Show recorded signatures
//! stagehand status
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;

// Re-export main types at crate root for convenience
pub use config::ResolvedConfig;
pub use self::core::{
    EngineError, Orchestrator, SignatureStore, SqliteSignatureStore, Stage, StageRegistry,
    StageResolver,
};
pub use domain::{RunReport, Signature, StageId, StageReport, StageState};
pub use stages::{StageDefinition, StageFile};
