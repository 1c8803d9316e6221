//! Shell command stage.
//!
//! The signature covers the command line, environment, parameters,
//! declared outputs and the SHA256 of every file matched by the input
//! globs. Invalidation removes the declared outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::core::Stage;
use crate::domain::{Signature, StageId};

use super::StageDefinition;

/// Maximum stderr characters kept in an error message
const STDERR_TAIL: usize = 2000;

/// Stage that runs a shell command
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    command: String,
    shell: String,
    workdir: PathBuf,
    dependencies: Vec<StageId>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    env: BTreeMap<String, String>,
    params: serde_json::Value,
    timeout: Option<Duration>,
}

/// Shape hashed into a command stage signature
#[derive(Serialize)]
struct CommandSignature<'a> {
    kind: &'static str,
    command: &'a str,
    env: &'a BTreeMap<String, String>,
    params: &'a serde_json::Value,
    outputs: &'a [String],
    inputs: BTreeMap<String, String>,
}

impl CommandStage {
    /// Build from a stage file definition
    pub fn from_definition(definition: &StageDefinition, config: &ResolvedConfig) -> Result<Self> {
        let command = definition
            .command
            .clone()
            .with_context(|| format!("Command stage '{}' has no command", definition.name))?;

        let timeout = definition
            .timeout_seconds
            .or(config.timeout_seconds)
            .map(Duration::from_secs);

        Ok(Self {
            name: definition.name.clone(),
            command,
            shell: config.shell.clone(),
            workdir: definition.workdir(config),
            dependencies: definition.dependencies(),
            inputs: definition.inputs.clone(),
            outputs: definition.outputs.clone(),
            env: definition.env.clone(),
            params: definition.params.clone(),
            timeout,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Hash every regular file matched by the input globs
    ///
    /// Keys are paths relative to the working directory, so moving the
    /// project does not change the signature.
    async fn hash_inputs(&self) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();

        for pattern in &self.inputs {
            // The workdir is literal; only the declared pattern may glob
            let base = glob::Pattern::escape(&self.workdir.to_string_lossy());
            let full = Path::new(&base).join(pattern);
            let paths: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
                .with_context(|| format!("Invalid input pattern '{}'", pattern))?
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to read input matching '{}'", pattern))?;

            for path in paths {
                let metadata = match fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    // Dangling symlink
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to inspect input: {}", path.display()))
                    }
                };
                if !metadata.is_file() {
                    continue;
                }

                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read input: {}", path.display()))?;
                let key = path
                    .strip_prefix(&self.workdir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                hashes.insert(key, hash_bytes(&bytes));
            }
        }

        Ok(hashes)
    }

    fn missing_outputs(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|o| !self.workdir.join(o).exists())
            .map(String::as_str)
            .collect()
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn dependencies(&self) -> Vec<StageId> {
        self.dependencies.clone()
    }

    async fn signature(&self) -> Result<Signature> {
        let inputs = self.hash_inputs().await?;
        debug!(stage = %self.name, inputs = inputs.len(), "Hashed stage inputs");

        Signature::new(CommandSignature {
            kind: "command",
            command: &self.command,
            env: &self.env,
            params: &self.params,
            outputs: &self.outputs,
            inputs,
        })
        .context("Failed to serialize command signature")
    }

    async fn execute(&self) -> Result<()> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for stage '{}'", self.shell, self.name))?;

        let output = match self.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .with_context(|| format!("Stage '{}' timed out after {:?}", self.name, limit))?,
            None => child.wait_with_output().await,
        }
        .with_context(|| format!("Failed to wait for command of stage '{}'", self.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail_start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_TAIL - 1)
                .map_or(0, |(i, _)| i);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Command failed with exit code {}: {}",
                exit_code,
                &stderr[tail_start..]
            );
        }

        let missing = self.missing_outputs();
        if !missing.is_empty() {
            anyhow::bail!(
                "Command succeeded but did not produce: {}",
                missing.join(", ")
            );
        }

        Ok(())
    }

    async fn invalidate(
        &self,
        _previous: Option<&Signature>,
        _current: &Signature,
        _force: bool,
    ) -> Result<()> {
        for output in &self.outputs {
            let path = self.workdir.join(output);
            let metadata = match fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to inspect {}", path.display()))
                }
            };

            let removed = if metadata.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            removed.with_context(|| format!("Failed to remove stale output: {}", path.display()))?;

            info!(stage = %self.name, path = %path.display(), "Removed stale output");
        }

        Ok(())
    }
}

/// Hex-encoded SHA256 of file contents
fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
