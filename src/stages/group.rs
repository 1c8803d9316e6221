//! Aggregate stage: a named target over other stages.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::core::Stage;
use crate::domain::{Signature, StageId};

/// Stage that only exists to pull in its dependencies
#[derive(Debug, Clone)]
pub struct GroupStage {
    dependencies: Vec<StageId>,
}

impl GroupStage {
    pub fn new(dependencies: Vec<StageId>) -> Self {
        Self { dependencies }
    }
}

#[async_trait]
impl Stage for GroupStage {
    fn dependencies(&self) -> Vec<StageId> {
        self.dependencies.clone()
    }

    async fn signature(&self) -> Result<Signature> {
        Ok(Signature::from_value(json!({
            "kind": "group",
            "members": self.dependencies,
        })))
    }

    async fn execute(&self) -> Result<()> {
        Ok(())
    }
}
