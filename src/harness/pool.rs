//! Bounded worker pool
//!
//! Built per run with `rayon::ThreadPoolBuilder::build_scoped`, so the pool's
//! threads are joined before `run` returns. Chunks are submitted FIFO; each
//! task runs its chunk through the backend's executor and stores the outcome
//! in the slot for its chunk index. Under `Backend::Multiprocess` each pool thread
//! supervises one child process at a time, so `num_workers` also bounds the
//! number of live children.

use super::{halts_run, thread, CancellationToken, ChunkOutcome, ChunkResult, ResultSet, WorkerContext};
use crate::config::{Backend, ErrorMode, HarnessConfig};
use crate::error::{ChunkFailure, Error, FailureKind, Result};
use crate::partition::Chunk;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct WorkerPool<T> {
    num_workers: usize,
    backend: Backend,
    mode: ErrorMode,
    timeout: Option<Duration>,
    caller: CancellationToken,
    halt: CancellationToken,
    results: Mutex<Vec<Option<ChunkOutcome<T>>>>,
    first_failure: Mutex<Option<ChunkFailure>>,
    fatal: Mutex<Option<Error>>,
}

impl<T> WorkerPool<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub(crate) fn new(config: &HarnessConfig, caller: CancellationToken, count: usize) -> Self {
        Self {
            num_workers: config.num_workers,
            backend: config.backend,
            mode: config.on_error,
            timeout: config.per_chunk_timeout,
            caller,
            halt: CancellationToken::new(),
            results: Mutex::new((0..count).map(|_| None).collect()),
            first_failure: Mutex::new(None),
            fatal: Mutex::new(None),
        }
    }

    /// Submit every chunk, wait for all workers, and assemble the result set
    pub(crate) fn run<F>(self, chunks: &[Chunk], work: &F) -> Result<ResultSet<T>>
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
    {
        let threads = self.num_workers.min(chunks.len()).max(1);
        debug!(threads, "building worker pool");
        let this = &self;

        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("chunk-worker-{}", i))
            .build_scoped(
                |thread| thread.run(),
                |pool| {
                    pool.scope_fifo(|scope| {
                        for chunk in chunks {
                            scope.spawn_fifo(move |_| this.submit(chunk, work));
                        }
                    })
                },
            )
            .map_err(|e| Error::pool_exhausted(format!("failed to build worker pool: {}", e)))?;

        self.finish()
    }

    /// Stop dispatching; in-flight workers observe it through their context
    pub(crate) fn cancel(&self) {
        self.halt.cancel();
    }

    fn is_halted(&self) -> bool {
        self.halt.is_cancelled() || self.caller.is_cancelled()
    }

    fn submit<F>(&self, chunk: &Chunk, work: &F)
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
    {
        if self.is_halted() {
            self.store(chunk.index, Err(FailureKind::Cancelled));
            return;
        }

        let ctx = WorkerContext::new(
            chunk.index,
            self.backend,
            self.caller.clone(),
            self.halt.clone(),
        );
        debug!(index = chunk.index, offset = chunk.offset, len = chunk.len, "dispatching chunk");

        let outcome = match self.execute(chunk, work, &ctx) {
            Ok(outcome) => outcome,
            Err(fatal) => {
                warn!(index = chunk.index, error = %fatal, "halting run");
                self.fatal.lock().get_or_insert(fatal);
                self.cancel();
                Err(FailureKind::Cancelled)
            }
        };

        if let Err(kind) = &outcome {
            if halts_run(self.mode, kind) {
                let mut first = self.first_failure.lock();
                if first.is_none() {
                    warn!(index = chunk.index, "chunk failed, cancelling outstanding chunks");
                    *first = Some(ChunkFailure::new(chunk.index, kind.clone()));
                    self.cancel();
                }
            }
        }
        self.store(chunk.index, outcome);
    }

    fn store(&self, index: usize, outcome: ChunkOutcome<T>) {
        let mut results = self.results.lock();
        debug_assert!(results[index].is_none(), "chunk {} stored twice", index);
        results[index] = Some(outcome);
    }

    fn execute<F>(&self, chunk: &Chunk, work: &F, ctx: &WorkerContext) -> Result<ChunkOutcome<T>>
    where
        F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
    {
        match self.backend {
            Backend::Threaded => thread::execute(chunk, work, ctx, self.timeout),
            #[cfg(unix)]
            Backend::Multiprocess => super::process::execute(chunk, work, ctx, self.timeout),
            // Rejected by `Harness::check_backend` before the pool is built
            #[cfg(not(unix))]
            Backend::Multiprocess => Err(Error::BackendIncompatible {
                primitive: "fork".to_string(),
                backend: Backend::Multiprocess,
            }),
        }
    }

    fn finish(self) -> Result<ResultSet<T>> {
        if let Some(fatal) = self.fatal.into_inner() {
            return Err(fatal);
        }
        if let Some(first) = self.first_failure.into_inner() {
            return Err(first.into_error());
        }
        if self.caller.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let slots = self
            .results
            .into_inner()
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| ChunkResult {
                index,
                outcome: outcome.unwrap_or(Err(FailureKind::Cancelled)),
            })
            .collect();
        Ok(ResultSet::from_slots(slots))
    }
}
