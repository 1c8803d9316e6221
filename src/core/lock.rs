//! Advisory lock held by callers around a run.
//!
//! The orchestrator assumes a single writer per signature store. Callers
//! take this lock before running so two processes never interleave their
//! staleness checks and commits.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

/// Exclusive lock on a lock file, released on drop
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock without blocking
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            if contended {
                anyhow::bail!(
                    "Another run holds the lock at {}; wait for it to finish",
                    path.display()
                );
            }
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
