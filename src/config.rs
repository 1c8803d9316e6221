//! Configuration for stagehand paths and the command runner.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGEHAND_HOME, STAGEHAND_STAGES)
//! 2. Config file (.stagehand/config.yaml)
//! 3. Defaults (<project>/.stagehand, <project>/stages.yaml)
//!
//! Config file discovery:
//! - Searches the start directory and its parents for .stagehand/config.yaml
//! - The directory containing .stagehand/ is the project root
//! - `paths.home` is relative to .stagehand/, `paths.stages` to the project root

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Directory holding the config file and, by default, engine state
pub const STATE_DIR: &str = ".stagehand";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .stagehand/)
    pub home: Option<String>,
    /// Stage definition file (relative to the project root)
    pub stages: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub shell: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Environment overrides, captured once so resolution stays testable
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub stages: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("STAGEHAND_HOME").ok().map(|v| expand_home(&v)),
            stages: std::env::var("STAGEHAND_STAGES").ok().map(|v| expand_home(&v)),
        }
    }
}

/// Resolved configuration with absolute paths
///
/// This is the shared configuration handed to every stage factory.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Directory stage commands and globs are relative to
    pub project_root: PathBuf,
    /// Engine state directory (signature database, lock file)
    pub home: PathBuf,
    /// Stage definition file
    pub stages_file: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Shell used to run command stages
    pub shell: String,
    /// Default per-stage command timeout
    pub timeout_seconds: Option<u64>,
}

impl ResolvedConfig {
    /// Load configuration starting from the current directory
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Self::load_from(&cwd, &EnvOverrides::from_env())
    }

    /// Load configuration starting from `start`
    pub fn load_from(start: &Path, overrides: &EnvOverrides) -> Result<Self> {
        match find_config_file(start) {
            Some(path) => {
                let file = load_config_file(&path)?;
                Ok(Self::resolve(start, Some((path, file)), overrides))
            }
            None => Ok(Self::resolve(start, None, overrides)),
        }
    }

    fn resolve(
        start: &Path,
        config: Option<(PathBuf, ConfigFile)>,
        overrides: &EnvOverrides,
    ) -> Self {
        let Some((config_path, file)) = config else {
            let project_root = start.to_path_buf();
            return Self {
                home: overrides
                    .home
                    .clone()
                    .unwrap_or_else(|| project_root.join(STATE_DIR)),
                stages_file: overrides
                    .stages
                    .clone()
                    .unwrap_or_else(|| project_root.join("stages.yaml")),
                project_root,
                config_file: None,
                shell: default_shell(),
                timeout_seconds: None,
            };
        };

        // .stagehand/ and the project root above it
        let state_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let project_root = state_dir.parent().unwrap_or(Path::new(".")).to_path_buf();

        let home = if let Some(ref home) = overrides.home {
            home.clone()
        } else if let Some(ref home) = file.paths.home {
            resolve_path(&state_dir, home)
        } else {
            state_dir.clone()
        };

        let stages_file = if let Some(ref stages) = overrides.stages {
            stages.clone()
        } else if let Some(ref stages) = file.paths.stages {
            resolve_path(&project_root, stages)
        } else {
            project_root.join("stages.yaml")
        };

        let shell = file
            .runner
            .as_ref()
            .and_then(|r| r.shell.clone())
            .unwrap_or_else(default_shell);
        let timeout_seconds = file.runner.as_ref().and_then(|r| r.timeout_seconds);

        Self {
            project_root,
            home,
            stages_file,
            config_file: Some(config_path),
            shell,
            timeout_seconds,
        }
    }

    /// Path to the signature database ($HOME/signatures.db)
    pub fn database_path(&self) -> PathBuf {
        self.home.join("signatures.db")
    }

    /// Path to the run lock ($HOME/run.lock)
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("run.lock")
    }
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(STATE_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = expand_home(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(&path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path))
    }
}

/// Expand a leading `~/` to the user's home directory
fn expand_home(path_str: &str) -> PathBuf {
    match path_str.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path_str),
        },
        None => PathBuf::from(path_str),
    }
}
