//! Chunk execution harness
//!
//! Runs one work function over an ordered chunk list on a bounded pool of
//! threads or processes and hands back one result slot per chunk, in chunk
//! index order regardless of completion order.
//!
//! ```text
//! partition(total, n) ──► [Chunk 0, Chunk 1, ...] ──► Harness::run(chunks, work)
//!                                                          │
//!                                   ┌──────────────────────┼──────────────────────┐
//!                                   ▼                      ▼                      ▼
//!                              worker 0               worker 1      ...      worker n-1
//!                        (thread, or thread        (runs work(chunk, ctx) per chunk)
//!                         supervising a child)
//!                                   │                      │                      │
//!                                   └────────► results keyed by index ◄───────────┘
//!                                                          │
//!                                                          ▼
//!                                                 ResultSet (index order)
//! ```
//!
//! # Work functions
//!
//! A work function is any `Fn(&Chunk, &WorkerContext) -> anyhow::Result<T>`.
//! The same function runs unmodified under either backend, which is why the
//! output must be `Serialize + DeserializeOwned` even for threads: under
//! `Backend::Multiprocess` it crosses back from the child in bincode.
//!
//! Under `Backend::Multiprocess` the work function and everything it captures
//! are copied into a forked child. Reads see the state as of the fork; writes
//! stay in the child. Use the cross-process primitives in
//! [`coordination`](crate::coordination) for anything that must aggregate, and
//! do not rely on threads or thread pools of the parent from inside the child.
//!
//! # Errors
//!
//! * `InvalidArgument` / `BackendIncompatible`: raised before any work starts
//! * `WorkerFailure` / `TimedOut`: per chunk; stored in the slot under
//!   `ErrorMode::CollectAll`, returned directly under `ErrorMode::FailFast`
//! * `PoolExhausted`: a worker thread or child process could not be spawned;
//!   the run is halted
//! * `Cancelled`: the caller's [`CancellationToken`] fired

mod pool;
#[cfg(unix)]
mod process;
mod thread;

use crate::config::{Backend, ErrorMode, HarnessConfig, SharingPolicy};
use crate::coordination::{Coordinated, SharingScope};
use crate::error::{ChunkFailure, Error, FailureKind, Result};
use crate::partition::{partition, partition_capped, Chunk};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use pool::WorkerPool;

/// Outcome of a single chunk as stored in a slot
pub type ChunkOutcome<T> = std::result::Result<T, FailureKind>;

// =============================================================================
// Cancellation
// =============================================================================

/// Shared flag used to stop a run from outside
///
/// Clones refer to the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-invocation information handed to the work function
///
/// Long-running thread work should poll [`is_cancelled`](Self::is_cancelled):
/// threads cannot be killed, so a timed-out or cancelled invocation only stops
/// early if it checks.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    index: usize,
    backend: Backend,
    caller: CancellationToken,
    halt: CancellationToken,
    chunk: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(
        index: usize,
        backend: Backend,
        caller: CancellationToken,
        halt: CancellationToken,
    ) -> Self {
        Self {
            index,
            backend,
            caller,
            halt,
            chunk: CancellationToken::new(),
        }
    }

    /// Index of the chunk being processed
    pub fn index(&self) -> usize {
        self.index
    }

    /// Backend the invocation runs under
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// True once the run was cancelled, halted by fail-fast, or this chunk timed out
    pub fn is_cancelled(&self) -> bool {
        self.chunk.is_cancelled() || self.is_halted()
    }

    /// Run-level cancellation only
    pub(crate) fn is_halted(&self) -> bool {
        self.halt.is_cancelled() || self.caller.is_cancelled()
    }

    pub(crate) fn cancel_chunk(&self) {
        self.chunk.cancel();
    }
}

// =============================================================================
// Result Set
// =============================================================================

/// One slot of a [`ResultSet`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult<T> {
    /// Chunk index
    pub index: usize,
    /// Value or failure
    pub outcome: ChunkOutcome<T>,
}

/// Results of a run, one slot per chunk, ordered by chunk index
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet<T> {
    slots: Vec<ChunkResult<T>>,
}

impl<T> ResultSet<T> {
    pub(crate) fn from_slots(slots: Vec<ChunkResult<T>>) -> Self {
        debug_assert!(slots.iter().enumerate().all(|(i, s)| s.index == i));
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkResult<T>> {
        self.slots.iter()
    }

    /// Slot for chunk `index`
    pub fn get(&self, index: usize) -> Option<&ChunkResult<T>> {
        self.slots.get(index)
    }

    /// True if every chunk produced a value
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.outcome.is_ok())
    }

    /// Successful values with their indices
    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .filter_map(|s| s.outcome.as_ref().ok().map(|v| (s.index, v)))
    }

    /// Failed slots as `(index, kind)` pairs
    pub fn failures(&self) -> Vec<ChunkFailure> {
        self.slots
            .iter()
            .filter_map(|s| match &s.outcome {
                Ok(_) => None,
                Err(kind) => Some(ChunkFailure {
                    index: s.index,
                    kind: kind.clone(),
                }),
            })
            .collect()
    }

    /// All values in index order, or an aggregate error naming every failed chunk
    pub fn into_values(self) -> Result<Vec<T>> {
        let failures = self.failures();
        if !failures.is_empty() {
            return Err(Error::Aggregate { failures });
        }
        Ok(self
            .slots
            .into_iter()
            .filter_map(|s| s.outcome.ok())
            .collect())
    }
}

impl<T> IntoIterator for ResultSet<T> {
    type Item = ChunkResult<T>;
    type IntoIter = std::vec::IntoIter<ChunkResult<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter()
    }
}

// =============================================================================
// Harness
// =============================================================================

#[derive(Debug, Clone)]
struct SharedDecl {
    name: String,
    scope: SharingScope,
}

/// Partition-aware parallel executor over threads or processes
///
/// # Example
/// ```
/// use chunkpool::{Backend, Harness, HarnessConfig};
///
/// let config = HarnessConfig { num_workers: 4, backend: Backend::Threaded, ..Default::default() };
/// let sums = Harness::new(config)
///     .map_range(1000, |chunk, _ctx| Ok(chunk.range().sum::<u64>()))
///     .unwrap();
/// assert_eq!(sums.iter().sum::<u64>(), (0..1000).sum::<u64>());
/// ```
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
    shared: Vec<SharedDecl>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            shared: Vec::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Declare a primitive the work function uses
    ///
    /// Checked against the backend at the start of every run: a process-local
    /// primitive with `Backend::Multiprocess` fails the run with
    /// `BackendIncompatible` (or only warns under `SharingPolicy::Warn`).
    pub fn share<C: Coordinated + ?Sized>(mut self, primitive: &C) -> Self {
        self.shared.push(SharedDecl {
            name: primitive.name().to_string(),
            scope: primitive.scope(),
        });
        self
    }

    /// Partition `[0, total)` for this harness's worker count and chunk cap
    pub fn partition(&self, total: u64) -> Result<Vec<Chunk>> {
        match self.config.max_chunk_size {
            Some(cap) => partition_capped(total, self.config.num_workers, cap),
            None => partition(total, self.config.num_workers),
        }
    }

    /// Run `work` once per chunk
    ///
    /// # Returns
    /// * `Ok(ResultSet)` - one slot per chunk in index order; under
    ///   `CollectAll` failed chunks hold their `FailureKind`
    /// * `Err(Error)` - configuration errors, the first failure under
    ///   `FailFast`, `PoolExhausted`, or `Cancelled`
    ///
    /// Every worker thread and child process has been joined or reaped by the
    /// time this returns, on every path.
    pub fn run<T, F>(&self, chunks: &[Chunk], work: F) -> Result<ResultSet<T>>
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
        T: Serialize + DeserializeOwned + Send,
    {
        self.run_with_cancel(chunks, work, &CancellationToken::new())
    }

    /// [`run`](Self::run) with a caller-held cancellation token
    ///
    /// Cancelling stops dispatch of chunks that have not started, kills
    /// in-flight child processes, flags in-flight thread invocations, waits for
    /// every worker, then returns `Error::Cancelled`.
    pub fn run_with_cancel<T, F>(
        &self,
        chunks: &[Chunk],
        work: F,
        cancel: &CancellationToken,
    ) -> Result<ResultSet<T>>
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
        T: Serialize + DeserializeOwned + Send,
    {
        self.config.validate()?;
        self.check_backend()?;
        self.check_chunks(chunks)?;
        self.check_sharing()?;

        if chunks.is_empty() {
            return Ok(ResultSet::from_slots(Vec::new()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(
            backend = %self.config.backend,
            chunks = chunks.len(),
            workers = self.config.num_workers,
            "starting run"
        );
        let pool = WorkerPool::new(&self.config, cancel.clone(), chunks.len());
        let result = pool.run(chunks, &work);
        debug!(ok = result.is_ok(), "run finished");
        result
    }

    /// Partition `[0, total)`, run `work`, and return the values in order
    ///
    /// Any failed chunk turns into `Error::Aggregate` (or the single first
    /// error under `FailFast`).
    pub fn map_range<T, F>(&self, total: u64, work: F) -> Result<Vec<T>>
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
        T: Serialize + DeserializeOwned + Send,
    {
        let chunks = self.partition(total)?;
        self.run(&chunks, work)?.into_values()
    }

    /// The process backend needs `fork`
    fn check_backend(&self) -> Result<()> {
        if cfg!(not(unix)) && self.config.backend == Backend::Multiprocess {
            return Err(Error::BackendIncompatible {
                primitive: "fork".to_string(),
                backend: Backend::Multiprocess,
            });
        }
        Ok(())
    }

    fn check_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.index != position {
                return Err(Error::invalid(format!(
                    "chunk at position {} has index {}; chunks must be indexed 0..n in order",
                    position, chunk.index
                )));
            }
        }
        Ok(())
    }

    fn check_sharing(&self) -> Result<()> {
        let backend = self.config.backend;
        for decl in self.shared.iter().filter(|d| !d.scope.supports(backend)) {
            match self.config.sharing {
                SharingPolicy::Reject => {
                    return Err(Error::BackendIncompatible {
                        primitive: decl.name.clone(),
                        backend,
                    });
                }
                SharingPolicy::Warn => {
                    warn!(
                        primitive = %decl.name,
                        %backend,
                        "process-local primitive shared with child processes; updates will not reach the parent"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Whether a failure should stop the run under the configured mode
pub(crate) fn halts_run(mode: ErrorMode, kind: &FailureKind) -> bool {
    mode == ErrorMode::FailFast && !matches!(kind, FailureKind::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{LocalCounter, RacyCounter};

    fn config(backend: Backend) -> HarnessConfig {
        HarnessConfig {
            num_workers: 2,
            backend,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_chunk_list() {
        let results = Harness::new(config(Backend::Threaded))
            .run(&[], |_, _| Ok(1u32))
            .unwrap();
        assert!(results.is_empty());
        assert!(results.into_values().unwrap().is_empty());
    }

    #[test]
    fn test_misindexed_chunks_rejected() {
        let chunks = vec![Chunk::new(1, 0, 5)];
        let err = Harness::new(config(Backend::Threaded))
            .run(&chunks, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_local_primitive_rejected_for_processes() {
        let counter = LocalCounter::new("hits", 0);
        let err = Harness::new(config(Backend::Multiprocess))
            .share(&counter)
            .run(&[Chunk::new(0, 0, 1)], |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(
            err,
            Error::BackendIncompatible {
                primitive: "hits".into(),
                backend: Backend::Multiprocess
            }
        );
    }

    #[test]
    fn test_backend_support_checked_before_work() {
        let calls = LocalCounter::new("calls", 0);
        let result = Harness::new(config(Backend::Multiprocess))
            .run(&[Chunk::new(0, 0, 1)], |_, _| {
                calls.fetch_add(1);
                Ok(())
            });
        if cfg!(unix) {
            assert!(result.is_ok());
        } else {
            assert_eq!(
                result.unwrap_err(),
                Error::BackendIncompatible {
                    primitive: "fork".into(),
                    backend: Backend::Multiprocess
                }
            );
            assert_eq!(calls.load(), 0);
        }
    }

    #[test]
    fn test_local_primitive_allowed_for_threads() {
        let counter = RacyCounter::new("racy", 0);
        let harness = Harness::new(config(Backend::Threaded)).share(&counter);
        assert!(harness.check_sharing().is_ok());
    }

    #[test]
    fn test_pre_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let err = Harness::new(config(Backend::Threaded))
            .run_with_cancel(&[Chunk::new(0, 0, 1)], |_, _| Ok(()), &token)
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
    }

    #[test]
    fn test_harness_partition_uses_cap() {
        let harness = Harness::new(HarnessConfig {
            num_workers: 2,
            max_chunk_size: Some(10),
            ..Default::default()
        });
        assert_eq!(harness.partition(45).unwrap().len(), 5);
    }

    #[test]
    fn test_result_set_accessors() {
        let set = ResultSet::from_slots(vec![
            ChunkResult {
                index: 0,
                outcome: Ok(10),
            },
            ChunkResult {
                index: 1,
                outcome: Err(FailureKind::WorkerFailure("bad".into())),
            },
        ]);
        assert_eq!(set.len(), 2);
        assert!(!set.is_complete());
        assert_eq!(set.successes().collect::<Vec<_>>(), vec![(0, &10)]);
        assert_eq!(set.failures().len(), 1);
        assert!(matches!(set.into_values(), Err(Error::Aggregate { .. })));
    }
}
