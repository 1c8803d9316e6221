//! Mapping from stage identities to constructed stages.
//!
//! Stages are late-bound through an explicit registry built at startup:
//! each identity maps to a factory taking the shared configuration.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::domain::StageId;

use super::error::EngineError;
use super::stage::Stage;

/// Resolves stage identities into stage instances
pub trait StageResolver<C> {
    /// Construct the stage named `stage`; must fail rather than substitute
    fn resolve(&self, stage: &StageId, config: &C) -> Result<Box<dyn Stage>, EngineError>;
}

type StageFactory<C> = Box<dyn Fn(&StageId, &C) -> Result<Box<dyn Stage>> + Send + Sync>;

/// Registry of stage factories keyed by identity
pub struct StageRegistry<C> {
    factories: BTreeMap<StageId, StageFactory<C>>,
}

impl<C> Default for StageRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StageRegistry<C> {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory, replacing any previous one for the same identity
    pub fn register<F>(&mut self, stage: impl Into<StageId>, factory: F)
    where
        F: Fn(&StageId, &C) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(stage.into(), Box::new(factory));
    }

    pub fn contains(&self, stage: &StageId) -> bool {
        self.factories.contains_key(stage)
    }

    /// Registered identities, sorted
    pub fn ids(&self) -> impl Iterator<Item = &StageId> {
        self.factories.keys()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<C> StageResolver<C> for StageRegistry<C> {
    fn resolve(&self, stage: &StageId, config: &C) -> Result<Box<dyn Stage>, EngineError> {
        let factory = self
            .factories
            .get(stage)
            .ok_or_else(|| EngineError::Resolution {
                stage: stage.clone(),
                reason: "no stage registered under this identity".to_string(),
            })?;

        factory(stage, config).map_err(|e| EngineError::Resolution {
            stage: stage.clone(),
            reason: format!("{:#}", e),
        })
    }
}
