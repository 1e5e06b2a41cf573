//! Harness configuration
//!
//! [`HarnessConfig`] is a plain struct with defaults, so callers can use
//! struct-update syntax or the fluent [`HarnessConfigBuilder`]. It also
//! deserializes from JSON with durations given in milliseconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Concurrency substrate used to run chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Threads sharing one address space
    #[default]
    Threaded,
    /// Forked child processes, one per chunk, each with its own address space
    ///
    /// Work outputs cross back through a pipe in bincode, so they must be
    /// serializable. Floats, `u128` and non-string map keys arrive unchanged.
    /// Types whose `Deserialize` needs a self-describing format
    /// (`serde_json::Value`, `#[serde(untagged)]` or `#[serde(flatten)]`) fail
    /// to decode and the slot becomes a `WorkerFailure` naming the cause.
    ///
    /// Anything the work function captures is copied into the child; writes to
    /// it are never seen by the parent. The child inherits only the forking
    /// thread, so it must not use the parent's thread pools, and any lock
    /// another parent thread held at the fork stays held in the child. The
    /// child silences the panic hook so a panic does not touch stderr's lock.
    Multiprocess,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Threaded => f.write_str("threaded"),
            Backend::Multiprocess => f.write_str("multiprocess"),
        }
    }
}

/// What a chunk failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Record the failure in its slot and keep going
    #[default]
    CollectAll,
    /// Cancel outstanding chunks and return the first failure
    FailFast,
}

/// What to do when a process-local primitive meets the process backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    /// Fail with `BackendIncompatible` before any work starts
    #[default]
    Reject,
    /// Log a warning and run anyway; updates stay inside each child
    Warn,
}

/// Configuration for a harness run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Maximum concurrent execution units (default: num_cpus)
    pub num_workers: usize,
    /// Thread or process execution
    pub backend: Backend,
    /// Collect every failure or stop at the first
    pub on_error: ErrorMode,
    /// Deadline for a single chunk (default: none)
    #[serde(with = "duration_ms")]
    pub per_chunk_timeout: Option<Duration>,
    /// Upper bound on chunk length used by `Harness::partition`
    pub max_chunk_size: Option<u64>,
    /// Handling of process-local primitives under `Multiprocess`
    pub sharing: SharingPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            backend: Backend::Threaded,
            on_error: ErrorMode::CollectAll,
            per_chunk_timeout: None,
            max_chunk_size: None,
            sharing: SharingPolicy::Reject,
        }
    }
}

impl HarnessConfig {
    /// Start a builder from the defaults
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::invalid(format!("invalid harness config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the numeric fields
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::invalid("num_workers must be at least 1"));
        }
        if self.max_chunk_size == Some(0) {
            return Err(Error::invalid("max_chunk_size must be at least 1"));
        }
        if self.per_chunk_timeout == Some(Duration::ZERO) {
            return Err(Error::invalid("per_chunk_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Fluent builder for [`HarnessConfig`]
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn on_error(mut self, mode: ErrorMode) -> Self {
        self.config.on_error = mode;
        self
    }

    pub fn fail_fast(self) -> Self {
        self.on_error(ErrorMode::FailFast)
    }

    pub fn per_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_chunk_timeout = Some(timeout);
        self
    }

    pub fn max_chunk_size(mut self, size: u64) -> Self {
        self.config.max_chunk_size = Some(size);
        self
    }

    pub fn sharing(mut self, policy: SharingPolicy) -> Self {
        self.config.sharing = policy;
        self
    }

    /// Validate and return the config
    pub fn build(self) -> Result<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Rounds up, so a sub-millisecond timeout never becomes zero
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .map(|d| d.as_nanos().div_ceil(1_000_000).min(u64::MAX as u128) as u64)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
