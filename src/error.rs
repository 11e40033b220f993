use std::path::PathBuf;

use thiserror::Error;

use crate::project::TabId;

/// Which history stack an operation wanted to pop from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Undo,
    Redo,
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackKind::Undo => write!(f, "undo"),
            StackKind::Redo => write!(f, "redo"),
        }
    }
}

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// API misuse. A programming error on the caller side.
    InvalidState,
    /// Nothing to undo/redo. Surfaced as a disabled action.
    EmptyStack,
    /// Save, backup or batch I/O. Logged, notified, retried on the next trigger.
    IoFailure,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("nothing to {0}")]
    EmptyStack(StackKind),

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image codec failure on {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("session file is malformed: {0}")]
    Session(#[from] serde_json::Error),

    #[error("no tab with id {0}")]
    UnknownTab(TabId),

    #[error("tab {0} has no file path")]
    NoPath(TabId),
}

impl EngineError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        EngineError::Codec {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidState(_) | EngineError::UnknownTab(_) => ErrorKind::InvalidState,
            EngineError::EmptyStack(_) => ErrorKind::EmptyStack,
            EngineError::Io { .. }
            | EngineError::Codec { .. }
            | EngineError::Session(_)
            | EngineError::NoPath(_) => ErrorKind::IoFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
