//! Stage state machine and run reports.
//!
//! Each stage settled during a run walks:
//!
//! ```text
//! Start -> DepsResolved -> SignatureComputed -> Skipped
//!                                            -> InvalidatedPendingExecute -> Executed -> Recorded
//!                                            -> Executed -> Recorded
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::StageId;
use super::signature::Signature;

/// State of a single stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Stage resolved, nothing evaluated yet
    Start,

    /// All dependencies settled
    DepsResolved,

    /// Current signature known
    SignatureComputed,

    /// Recorded signature matched; no work done
    Skipped,

    /// Previous output torn down, execution required
    InvalidatedPendingExecute,

    /// execute() returned successfully
    Executed,

    /// New signature committed to the store
    Recorded,
}

impl StageState {
    /// Check whether the state ends a stage invocation
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Recorded)
    }

    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;

        matches!(
            (self, next),
            (Start, DepsResolved)
                | (DepsResolved, SignatureComputed)
                | (SignatureComputed, Skipped)
                | (SignatureComputed, InvalidatedPendingExecute)
                | (SignatureComputed, Executed)
                | (InvalidatedPendingExecute, Executed)
                | (Executed, Recorded)
        )
    }
}

/// Outcome of settling one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageId,

    /// Terminal state reached (Skipped or Recorded)
    pub state: StageState,

    /// Whether invalidate() was called
    pub invalidated: bool,

    /// Signature recorded before this run, if any
    pub previous: Option<Signature>,

    /// Signature computed during this run
    pub signature: Signature,

    /// Time spent settling the stage in milliseconds
    pub duration_ms: u64,
}

impl StageReport {
    pub fn executed(&self) -> bool {
        self.state == StageState::Recorded
    }
}

/// Summary of one orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique identifier for this run (log correlation only)
    pub run_id: Uuid,

    /// Stage the run was requested for
    pub root: StageId,

    /// Whether the root was forced
    pub force: bool,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Settled stages, in settle order
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Stages whose execute() ran during this run
    pub fn executed(&self) -> Vec<&StageId> {
        self.stages
            .iter()
            .filter(|s| s.executed())
            .map(|s| &s.stage)
            .collect()
    }

    /// Stages skipped because their signature was unchanged
    pub fn skipped(&self) -> Vec<&StageId> {
        self.stages
            .iter()
            .filter(|s| s.state == StageState::Skipped)
            .map(|s| &s.stage)
            .collect()
    }

    /// Get the report for a stage by ID
    pub fn get(&self, stage: &StageId) -> Option<&StageReport> {
        self.stages.iter().find(|s| &s.stage == stage)
    }
}
