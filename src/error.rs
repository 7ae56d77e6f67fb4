//! Error taxonomy for the pipeline.
//!
//! Configuration problems fail before a run starts, bounds errors go straight
//! back to the caller, data integrity problems end a run, and transient worker
//! failures are counted and only escalate past a discard threshold.

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("pipeline identifier mismatch: expected '{expected}', computed '{computed}'")]
    PpidMismatch { expected: String, computed: String },

    #[error("index {index} out of range for length {len}")]
    Bounds { index: i64, len: usize },

    #[error("data integrity error in {stage}{}: {message}", fmt_chunk(*chunk))]
    DataIntegrity {
        stage: String,
        chunk: Option<usize>,
        message: String,
    },

    #[error("{stage} worker {worker} failed on chunk {chunk}: {message}")]
    TransientWorker {
        stage: String,
        chunk: usize,
        worker: usize,
        message: String,
    },

    #[error("run was cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IPC encoding error: {0}")]
    Ipc(#[from] bincode::Error),
}

fn fmt_chunk(chunk: Option<usize>) -> String {
    match chunk {
        Some(c) => format!(" (chunk {c})"),
        None => String::new(),
    }
}

/// Coarse classification used by the runner and in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Bounds,
    DataIntegrity,
    TransientWorker,
    Cancelled,
    Io,
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn integrity(stage: impl Into<String>, chunk: Option<usize>, message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            stage: stage.into(),
            chunk,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::PpidMismatch { .. } => ErrorKind::Configuration,
            Self::Bounds { .. } => ErrorKind::Bounds,
            Self::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            Self::TransientWorker { .. } => ErrorKind::TransientWorker,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) | Self::Io(_) | Self::Serialization(_) | Self::Ipc(_) => ErrorKind::Io,
        }
    }

    /// Whether the error ends a running job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientWorker { .. } | Self::Cancelled)
    }

    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::DataIntegrity { stage, .. } | Self::TransientWorker { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<usize> {
        match self {
            Self::DataIntegrity { chunk, .. } => *chunk,
            Self::TransientWorker { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

/// Serializable record of a fatal error, kept by the runner for offline
/// reproduction.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub stage: Option<String>,
    pub chunk: Option<usize>,
    pub message: String,
    /// Context lines added while the error travelled up (innermost last).
    pub context: Vec<String>,
}

impl ErrorDetail {
    pub fn from_error(err: &PipelineError, context: Vec<String>) -> Self {
        Self {
            kind: err.kind(),
            stage: err.stage().map(str::to_string),
            chunk: err.chunk(),
            message: err.to_string(),
            context,
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        for line in &self.context {
            write!(f, "\n  while {line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_fatality() {
        assert_eq!(PipelineError::config("x").kind(), ErrorKind::Configuration);
        assert!(PipelineError::Bounds { index: -1, len: 3 }.is_fatal());
        let transient = PipelineError::TransientWorker {
            stage: "segmentation".into(),
            chunk: 4,
            worker: 1,
            message: "boom".into(),
        };
        assert!(!transient.is_fatal());
        assert_eq!(transient.chunk(), Some(4));
        assert!(!PipelineError::Cancelled.is_fatal());
    }

    #[test]
    fn test_integrity_display_mentions_chunk() {
        let err = PipelineError::integrity("collector", Some(7), "never arrived");
        let msg = err.to_string();
        assert!(msg.contains("collector"));
        assert!(msg.contains("chunk 7"));
        assert!(msg.contains("never arrived"));
    }

    #[test]
    fn test_error_detail_keeps_context() {
        let err = PipelineError::integrity("writer", None, "chunk count mismatch");
        let detail = ErrorDetail::from_error(&err, vec!["writing chunk 3".into()]);
        assert_eq!(detail.kind, ErrorKind::DataIntegrity);
        assert_eq!(detail.stage.as_deref(), Some("writer"));
        assert!(detail.to_string().contains("while writing chunk 3"));
    }
}
