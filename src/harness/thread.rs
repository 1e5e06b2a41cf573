//! In-process chunk execution
//!
//! Without a timeout the work function runs directly on the pool thread. With
//! one it runs on a scoped helper thread while the pool thread waits on a
//! channel; on expiry the slot becomes `TimedOut`, the invocation's context is
//! flagged, and the late result is dropped. The helper is still joined before
//! the pool thread moves on.

use super::{ChunkOutcome, WorkerContext};
use crate::error::{Error, FailureKind, Result};
use crate::partition::Chunk;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::warn;

pub(crate) fn execute<T, F>(
    chunk: &Chunk,
    work: &F,
    ctx: &WorkerContext,
    timeout: Option<Duration>,
) -> Result<ChunkOutcome<T>>
where
    F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T> + Sync,
    T: Send,
{
    let Some(limit) = timeout else {
        return Ok(invoke(chunk, work, ctx));
    };

    let (tx, rx) = mpsc::sync_channel(1);
    thread::scope(|s| {
        let _helper = thread::Builder::new()
            .name(format!("chunk-{}", chunk.index))
            .spawn_scoped(s, move || {
                // The receiver is gone if the chunk already timed out.
                let _ = tx.send(invoke(chunk, work, ctx));
            })
            .map_err(|e| {
                Error::pool_exhausted(format!("failed to spawn thread for chunk {}: {}", chunk.index, e))
            })?;

        match rx.recv_timeout(limit) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => {
                warn!(index = chunk.index, ?limit, "chunk timed out");
                ctx.cancel_chunk();
                Ok(Err(FailureKind::TimedOut(limit)))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(Err(FailureKind::WorkerFailure(
                "worker thread exited without a result".to_string(),
            ))),
        }
    })
}

/// Run the work function, turning errors and panics into a failure kind
pub(crate) fn invoke<T, F>(chunk: &Chunk, work: &F, ctx: &WorkerContext) -> ChunkOutcome<T>
where
    F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| work(chunk, ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FailureKind::WorkerFailure(format!("{:#}", err))),
        Err(payload) => Err(FailureKind::WorkerFailure(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
