//! Domain types for the stage runner.
//!
//! This module contains the core data structures:
//! - StageId: Opaque stage identity
//! - Signature: Comparable fingerprint of a stage's expected output
//! - Report: Per-stage state machine and run outcomes

pub mod identity;
pub mod report;
pub mod signature;

// Re-export commonly used types
pub use identity::StageId;
pub use report::{RunReport, StageReport, StageState};
pub use signature::{Signature, StageRecord};
