//! Error taxonomy for the engine and the signature store.

use thiserror::Error;

use crate::domain::StageId;

/// Errors raised by a signature store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timestamp in record for '{stage}': {value}")]
    InvalidTimestamp { stage: String, value: String },
}

/// Errors that abort an orchestration run
///
/// Nothing is caught inside the engine: every variant surfaces to the
/// caller of `Orchestrator::run`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot resolve stage '{stage}': {reason}")]
    Resolution { stage: StageId, reason: String },

    #[error("Stage '{stage}' failed to compute its signature")]
    Signature {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' failed to invalidate its previous output")]
    Invalidation {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' failed to execute")]
    Execution {
        stage: StageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Dependency cycle: {}", format_path(.path))]
    Cycle { path: Vec<StageId> },

    #[error("Signature store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The stage the error is attributed to, if any
    pub fn stage(&self) -> Option<&StageId> {
        match self {
            Self::Resolution { stage, .. }
            | Self::Signature { stage, .. }
            | Self::Invalidation { stage, .. }
            | Self::Execution { stage, .. } => Some(stage),
            Self::Cycle { path } => path.first(),
            Self::Store(_) => None,
        }
    }
}

fn format_path(path: &[StageId]) -> String {
    path.iter()
        .map(StageId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = EngineError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
        assert_eq!(err.stage(), Some(&StageId::from("a")));
    }

    #[test]
    fn test_execution_error_keeps_source() {
        let err = EngineError::Execution {
            stage: "load".into(),
            source: anyhow::anyhow!("exit code 2"),
        };
        assert_eq!(err.to_string(), "Stage 'load' failed to execute");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "exit code 2");
    }
}
