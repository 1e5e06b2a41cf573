//! Error types for the chunk harness

use crate::config::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Harness errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Bad partition or configuration parameters
    ///
    /// **Triggered by:** `num_workers == 0`, a zero chunk cap, a zero timeout
    /// **Raised:** synchronously, before any work starts
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },

    /// A work function returned an error or panicked
    #[error("Worker failure on chunk {index}: {message}")]
    WorkerFailure {
        /// Chunk index
        index: usize,
        /// Rendered error or panic message
        message: String,
    },

    /// A chunk exceeded the per-chunk deadline
    #[error("Chunk {index} timed out after {timeout:?}")]
    TimedOut {
        /// Chunk index
        index: usize,
        /// The configured deadline
        timeout: Duration,
    },

    /// A process-local primitive was handed to the process backend
    ///
    /// **Triggered by:** sharing a `LocalMutex`/`LocalCounter`/`RacyCounter` with
    /// `Backend::Multiprocess` under `SharingPolicy::Reject`
    /// **Prevention:** use `SharedCounter` or `SharedMutex`
    #[error("Primitive '{primitive}' cannot be shared under the {backend} backend")]
    BackendIncompatible {
        /// Name of the offending primitive
        primitive: String,
        /// Backend that was selected
        backend: Backend,
    },

    /// A worker thread or process could not be spawned
    #[error("Worker pool exhausted: {message}")]
    PoolExhausted {
        /// OS or pool builder error
        message: String,
    },

    /// The run was cancelled through its cancellation token
    #[error("Run cancelled")]
    Cancelled,

    /// One or more chunks failed in collect-all mode
    #[error("{} chunk(s) failed: {}", .failures.len(), AggregateDisplay(.failures))]
    Aggregate {
        /// Failures in chunk index order
        failures: Vec<ChunkFailure>,
    },
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Raised before or instead of a result set; no chunk outcome attached
    Fatal,
    /// Attached to a single chunk's slot
    PerChunk,
}

impl Error {
    /// Create an invalid-argument error with a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a pool-exhausted error with a message
    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Error::PoolExhausted {
            message: msg.into(),
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::WorkerFailure { .. } | Error::TimedOut { .. } => ErrorSeverity::PerChunk,
            _ => ErrorSeverity::Fatal,
        }
    }

    /// Chunk index for per-chunk errors
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Error::WorkerFailure { index, .. } | Error::TimedOut { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Why a single chunk has no value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The work function returned an error or panicked
    WorkerFailure(String),
    /// The per-chunk deadline expired
    TimedOut(Duration),
    /// The chunk never ran, or was stopped, because the run was cancelled
    Cancelled,
}

/// A failed slot in a result set: `(index, kind)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    /// Chunk index
    pub index: usize,
    /// What went wrong
    pub kind: FailureKind,
}

impl ChunkFailure {
    pub(crate) fn new(index: usize, kind: FailureKind) -> Self {
        Self { index, kind }
    }

    /// Convert into the matching top-level error
    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::WorkerFailure(message) => Error::WorkerFailure {
                index: self.index,
                message,
            },
            FailureKind::TimedOut(timeout) => Error::TimedOut {
                index: self.index,
                timeout,
            },
            FailureKind::Cancelled => Error::Cancelled,
        }
    }
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::WorkerFailure(msg) => write!(f, "[{}] worker failure: {}", self.index, msg),
            FailureKind::TimedOut(t) => write!(f, "[{}] timed out after {:?}", self.index, t),
            FailureKind::Cancelled => write!(f, "[{}] cancelled", self.index),
        }
    }
}

struct AggregateDisplay<'a>(&'a [ChunkFailure]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, Error>;
