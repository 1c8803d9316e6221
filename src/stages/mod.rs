//! Stage definitions and built-in stage kinds.
//!
//! Stages are declared in a YAML stage file. Each definition becomes a
//! factory in a `StageRegistry`, so the orchestrator resolves stages by
//! name without knowing their kind.

pub mod command;
pub mod group;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ResolvedConfig;
use crate::core::{Stage, StageRegistry};
use crate::domain::StageId;

pub use command::CommandStage;
pub use group::GroupStage;

/// A complete stage file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFile {
    /// Ordered list of stage definitions
    pub stages: Vec<StageDefinition>,
}

impl StageFile {
    /// Load a stage file from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stage file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid stage file: {}", path.display()))
    }

    /// Parse a stage file from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse stage YAML")
    }

    /// Validate the stage definitions
    ///
    /// Cycles are not rejected here; the orchestrator reports them with
    /// the offending path.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("Stage file must define at least one stage");
        }

        let mut names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }
            if !names.insert(&stage.name) {
                anyhow::bail!("Stage '{}' is defined more than once", stage.name);
            }
        }

        for stage in &self.stages {
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    anyhow::bail!("Stage '{}' depends on itself", stage.name);
                }
                if !names.contains(dep) {
                    anyhow::bail!(
                        "Stage '{}' depends on non-existent stage '{}'",
                        stage.name,
                        dep
                    );
                }
            }

            match stage.kind {
                StageKind::Command if stage.command.as_deref().map_or(true, str::is_empty) => {
                    anyhow::bail!("Command stage '{}' has no command", stage.name);
                }
                StageKind::Group if stage.command.is_some() => {
                    anyhow::bail!("Group stage '{}' cannot have a command", stage.name);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Get a stage definition by name
    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Build a registry with one factory per definition
    pub fn registry(&self) -> StageRegistry<ResolvedConfig> {
        let mut registry = StageRegistry::new();

        for definition in &self.stages {
            let definition = definition.clone();
            registry.register(definition.name.clone(), move |_, config: &ResolvedConfig| {
                definition.build(config)
            });
        }

        registry
    }
}

/// A single stage in a stage file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage name (unique within the file)
    pub name: String,

    /// Kind of stage
    #[serde(default)]
    pub kind: StageKind,

    /// Shell command (command stages only)
    pub command: Option<String>,

    /// Stages that must be up to date first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Glob patterns of files whose contents feed the signature
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Paths produced by the command; removed on invalidation
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Extra environment for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form parameters folded into the signature
    #[serde(default)]
    pub params: serde_json::Value,

    /// Working directory relative to the project root
    pub workdir: Option<String>,

    /// Override command timeout (uses runner.timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,
}

impl StageDefinition {
    /// Dependencies as stage identities
    pub fn dependencies(&self) -> Vec<StageId> {
        self.depends_on.iter().map(|d| StageId::from(d.as_str())).collect()
    }

    /// Effective working directory
    pub fn workdir(&self, config: &ResolvedConfig) -> PathBuf {
        match &self.workdir {
            Some(dir) => config.project_root.join(dir),
            None => config.project_root.clone(),
        }
    }

    /// Construct the stage this definition describes
    pub fn build(&self, config: &ResolvedConfig) -> Result<Box<dyn Stage>> {
        match self.kind {
            StageKind::Command => Ok(Box::new(CommandStage::from_definition(self, config)?)),
            StageKind::Group => Ok(Box::new(GroupStage::new(self.dependencies()))),
        }
    }
}

/// Supported stage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Runs a shell command
    #[default]
    Command,

    /// Aggregates dependencies; does no work itself
    Group,
}
