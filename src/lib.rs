//! # chunkpool - Partitioned work over threads or processes
//!
//! Splits a workload into deterministic, contiguous chunks and maps a work
//! function over them on a bounded pool of either threads (one shared address
//! space) or forked processes (one address space per chunk), returning results
//! in chunk order whatever order the workers finish in.
//!
//! ## Quick Start
//!
//! ```rust
//! use chunkpool::{workloads, Backend, Harness, HarnessConfig};
//!
//! # fn main() -> chunkpool::Result<()> {
//! let config = HarnessConfig {
//!     num_workers: 4,
//!     backend: Backend::Threaded,
//!     ..Default::default()
//! };
//!
//! // Count primes below 10_000, one chunk per worker
//! let counts = Harness::new(config).map_range(10_000, workloads::count_primes)?;
//! assert_eq!(counts.iter().sum::<u64>(), 1229);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! partition(total, n) → [Chunk] → Harness::run(chunks, work) → ResultSet (index order)
//! ```
//!
//! - [`partition`] / [`partition_capped`] - chunk descriptors covering `[0, total)`
//! - [`Harness`] - validates config and shared state, owns the pool for one run
//! - [`Backend`] - `Threaded` or `Multiprocess`, a pure strategy switch
//! - [`coordination`] - mutexes and counters, process-local or cross-process
//!
//! ## Backends and shared state
//!
//! Threads see the caller's memory, so unsynchronized writes race. Processes
//! get a copy of it, so writes vanish: a plain counter incremented by every
//! child still reads its initial value in the parent. Declare shared
//! primitives with [`Harness::share`]; a process-local one under
//! `Multiprocess` is rejected before any work starts.
//!
//! ## Error handling
//!
//! All fallible operations return [`Result<T>`] with the crate [`Error`].
//! Work functions return `anyhow::Result<T>`; their failures are recorded per
//! chunk as [`FailureKind::WorkerFailure`].
//!
//! ## Logging
//!
//! The crate emits `tracing` events (run start and finish, chunk dispatch,
//! timeouts, cancellation) and installs no subscriber.

pub mod config;
pub mod coordination;
pub mod error;
pub mod harness;
pub mod partition;
pub mod workloads;

pub use config::{Backend, ErrorMode, HarnessConfig, HarnessConfigBuilder, SharingPolicy};
pub use coordination::{Coordinated, LocalCounter, LocalMutex, RacyCounter, SharingScope};
#[cfg(unix)]
pub use coordination::{SharedCounter, SharedMutex};
pub use error::{ChunkFailure, Error, ErrorSeverity, FailureKind, Result};
pub use harness::{
    CancellationToken, ChunkOutcome, ChunkResult, Harness, ResultSet, WorkerContext,
};
pub use partition::{partition, partition_capped, Chunk};
