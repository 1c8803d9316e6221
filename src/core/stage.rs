//! The stage contract.
//!
//! Splitting `signature`, `execute` and `invalidate` lets the orchestrator
//! apply one invalidation policy to every kind of stage.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Signature, StageId};

/// A named unit of work with a computable signature
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stages that must be settled before this one's signature is computed.
    ///
    /// Static and side-effect free. May be empty.
    fn dependencies(&self) -> Vec<StageId>;

    /// Compute the signature of the output this stage would currently produce.
    ///
    /// Must be deterministic for a fixed external world and must not mutate it.
    async fn signature(&self) -> Result<Signature>;

    /// Produce or refresh the stage's artifact
    async fn execute(&self) -> Result<()>;

    /// Tear down output that would conflict with a fresh `execute()`.
    ///
    /// `previous` is `None` when the stage has never completed.
    async fn invalidate(
        &self,
        previous: Option<&Signature>,
        current: &Signature,
        force: bool,
    ) -> Result<()> {
        let _ = (previous, current, force);
        Ok(())
    }
}
