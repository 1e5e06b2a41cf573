//! Forked-child chunk execution
//!
//! Each chunk runs in a child created with `fork`. The child invokes the work
//! function, writes one frame to a pipe, and leaves with `_exit` so no parent
//! destructors or atexit handlers run in it. A frame is an 8-byte little-endian
//! length followed by the bincode encoding of `Result<T, String>`. Bincode
//! keeps non-finite floats, `u128` and non-string map keys intact, so a value
//! comes back exactly as the work function returned it.
//!
//! The parent never waits on EOF: sibling children forked concurrently inherit
//! each other's pipe ends, so completion is detected by a complete frame or by
//! the child having exited. The parent polls the pipe in short slices so it can
//! enforce the chunk deadline and run cancellation, killing with `SIGKILL` and
//! reaping with `waitpid` so no zombie outlives the run.

use super::thread::invoke;
use super::{ChunkOutcome, WorkerContext};
use crate::error::{Error, FailureKind, Result};
use crate::partition::Chunk;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::panic;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest single wait before re-checking deadline, cancellation and exit
const POLL_SLICE: Duration = Duration::from_millis(10);

const LEN_PREFIX: usize = 8;

fn frame_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

pub(crate) fn execute<T, F>(
    chunk: &Chunk,
    work: &F,
    ctx: &WorkerContext,
    timeout: Option<Duration>,
) -> Result<ChunkOutcome<T>>
where
    F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T>,
    T: Serialize + DeserializeOwned,
{
    let (read_end, write_end) = pipe()
        .map_err(|e| Error::pool_exhausted(format!("pipe for chunk {}: {}", chunk.index, e)))?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::pool_exhausted(format!(
            "fork for chunk {}: {}",
            chunk.index,
            io::Error::last_os_error()
        )));
    }
    if pid == 0 {
        drop(read_end);
        run_child(chunk, work, ctx, write_end);
    }

    drop(write_end);
    debug!(index = chunk.index, pid, "forked chunk worker");
    let mut child = Child {
        pid,
        pipe: File::from(read_end),
        frame: Vec::new(),
        reaped: false,
    };
    Ok(child.supervise(chunk.index, ctx, timeout))
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

// =============================================================================
// Child Side
// =============================================================================

fn run_child<T, F>(chunk: &Chunk, work: &F, ctx: &WorkerContext, write_end: OwnedFd) -> !
where
    F: Fn(&Chunk, &WorkerContext) -> anyhow::Result<T>,
    T: Serialize,
{
    // The default hook locks stderr, which another parent thread may have
    // held at the moment of the fork.
    panic::set_hook(Box::new(|_| {}));

    let outcome: std::result::Result<T, String> = match invoke(chunk, work, ctx) {
        Ok(value) => Ok(value),
        Err(FailureKind::WorkerFailure(msg)) => Err(msg),
        Err(other) => Err(format!("{:?}", other)),
    };
    let payload = bincode::serde::encode_to_vec(&outcome, frame_config()).or_else(|e| {
        bincode::serde::encode_to_vec(
            std::result::Result::<(), String>::Err(format!(
                "failed to serialize chunk result: {}",
                e
            )),
            frame_config(),
        )
    });

    let mut pipe = File::from(write_end);
    let code = match payload {
        Ok(bytes) => {
            let written = pipe
                .write_all(&(bytes.len() as u64).to_le_bytes())
                .and_then(|_| pipe.write_all(&bytes));
            if written.is_ok() {
                0
            } else {
                2
            }
        }
        Err(_) => 3,
    };
    unsafe { libc::_exit(code) }
}

// =============================================================================
// Parent Side
// =============================================================================

struct Child {
    pid: libc::pid_t,
    pipe: File,
    frame: Vec<u8>,
    reaped: bool,
}

impl Child {
    fn supervise<T: DeserializeOwned>(
        &mut self,
        index: usize,
        ctx: &WorkerContext,
        timeout: Option<Duration>,
    ) -> ChunkOutcome<T> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if ctx.is_halted() {
                debug!(index, pid = self.pid, "killing cancelled chunk worker");
                self.kill();
                return Err(FailureKind::Cancelled);
            }

            let mut slice = POLL_SLICE;
            if let (Some(deadline), Some(limit)) = (deadline, timeout) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(index, pid = self.pid, ?limit, "chunk timed out, killing worker");
                    ctx.cancel_chunk();
                    self.kill();
                    return Err(FailureKind::TimedOut(limit));
                }
                slice = slice.min(remaining);
            }

            match self.read_available(slice) {
                Ok(()) => {}
                Err(e) => {
                    self.kill();
                    return Err(FailureKind::WorkerFailure(format!(
                        "reading from chunk worker: {}",
                        e
                    )));
                }
            }

            if self.frame_complete() {
                let status = self.wait(0);
                debug!(index, pid = self.pid, status, "chunk worker finished");
                return self.decode();
            }

            if let Some(status) = self.try_wait() {
                // Exited: whatever it wrote is already in the pipe.
                if let Err(e) = self.read_available(Duration::ZERO) {
                    return Err(FailureKind::WorkerFailure(format!(
                        "reading from chunk worker: {}",
                        e
                    )));
                }
                if self.frame_complete() {
                    return self.decode();
                }
                return Err(FailureKind::WorkerFailure(format!(
                    "chunk worker {} without a result",
                    describe_status(status)
                )));
            }
        }
    }

    /// Wait up to `wait` for data, then read everything currently buffered
    fn read_available(&mut self, wait: Duration) -> io::Result<()> {
        let mut timeout_ms = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut buf = [0u8; 8192];
        loop {
            let mut fd = libc::pollfd {
                fd: self.pipe.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut fd, 1, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 || fd.revents & (libc::POLLIN | libc::POLLHUP) == 0 {
                return Ok(());
            }
            match self.pipe.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.frame.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            if self.frame_complete() {
                return Ok(());
            }
            // Drain without blocking once data has started flowing.
            timeout_ms = 0;
        }
    }

    fn frame_complete(&self) -> bool {
        self.frame.len() >= LEN_PREFIX
            && self.frame.len() - LEN_PREFIX >= self.declared_len()
    }

    fn declared_len(&self) -> usize {
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.frame[..LEN_PREFIX]);
        u64::from_le_bytes(prefix) as usize
    }

    fn decode<T: DeserializeOwned>(&self) -> ChunkOutcome<T> {
        let body = &self.frame[LEN_PREFIX..LEN_PREFIX + self.declared_len()];
        match bincode::serde::decode_from_slice::<std::result::Result<T, String>, _>(
            body,
            frame_config(),
        ) {
            Ok((Ok(value), _)) => Ok(value),
            Ok((Err(msg), _)) => Err(FailureKind::WorkerFailure(msg)),
            Err(e) => Err(FailureKind::WorkerFailure(format!(
                "undecodable result from chunk worker: {}",
                e
            ))),
        }
    }

    fn try_wait(&mut self) -> Option<libc::c_int> {
        let mut status = 0;
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if rc == self.pid {
            self.reaped = true;
            Some(status)
        } else {
            None
        }
    }

    fn wait(&mut self, flags: libc::c_int) -> libc::c_int {
        let mut status = 0;
        loop {
            let rc = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if rc >= 0 || io::Error::last_os_error().kind() != ErrorKind::Interrupted {
                break;
            }
        }
        self.reaped = true;
        status
    }

    fn kill(&mut self) {
        if self.reaped {
            return;
        }
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        self.wait(0);
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        self.kill();
    }
}

fn describe_status(status: libc::c_int) -> String {
    if libc::WIFEXITED(status) {
        format!("exited with code {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("ended with status {}", status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::harness::CancellationToken;
    use anyhow::bail;

    fn ctx(index: usize) -> WorkerContext {
        WorkerContext::new(
            index,
            Backend::Multiprocess,
            CancellationToken::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_child_result_round_trips() {
        let chunk = Chunk::new(0, 10, 5);
        let out = execute(
            &chunk,
            &|c: &Chunk, _: &WorkerContext| Ok(c.range().collect::<Vec<u64>>()),
            &ctx(0),
            None,
        )
        .unwrap();
        assert_eq!(out, Ok(vec![10, 11, 12, 13, 14]));
    }

    #[test]
    fn test_child_error_is_worker_failure() {
        let chunk = Chunk::new(2, 0, 1);
        let out: ChunkOutcome<u8> = execute(
            &chunk,
            &|c: &Chunk, _: &WorkerContext| bail!("chunk {} refused", c.index),
            &ctx(2),
            None,
        )
        .unwrap();
        assert_eq!(out, Err(FailureKind::WorkerFailure("chunk 2 refused".into())));
    }

    #[test]
    fn test_non_finite_floats_and_wide_keys_survive() {
        use std::collections::BTreeMap;

        let chunk = Chunk::new(0, 0, 1);
        let out = execute(
            &chunk,
            &|_: &Chunk, _: &WorkerContext| {
                let mut wide = BTreeMap::new();
                wide.insert((1u32, 2u32), u128::MAX);
                Ok((f64::NAN, f64::NEG_INFINITY, wide))
            },
            &ctx(0),
            None,
        )
        .unwrap()
        .unwrap();
        assert!(out.0.is_nan());
        assert_eq!(out.1, f64::NEG_INFINITY);
        assert_eq!(out.2.get(&(1, 2)), Some(&u128::MAX));
    }

    #[test]
    fn test_child_panic_is_worker_failure() {
        let chunk = Chunk::new(0, 0, 1);
        let out: ChunkOutcome<u8> = execute(
            &chunk,
            &|_: &Chunk, _: &WorkerContext| panic!("child gave up"),
            &ctx(0),
            None,
        )
        .unwrap();
        assert_eq!(
            out,
            Err(FailureKind::WorkerFailure("panicked: child gave up".into()))
        );
    }

    #[test]
    fn test_large_result_exceeds_pipe_buffer() {
        let chunk = Chunk::new(0, 0, 200_000);
        let out = execute(
            &chunk,
            &|c: &Chunk, _: &WorkerContext| Ok(vec![7u8; c.len as usize]),
            &ctx(0),
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(out.len(), 200_000);
    }

    #[test]
    fn test_child_killed_on_timeout() {
        let chunk = Chunk::new(0, 0, 1);
        let started = Instant::now();
        let out: ChunkOutcome<u8> = execute(
            &chunk,
            &|_: &Chunk, _: &WorkerContext| {
                std::thread::sleep(Duration::from_secs(30));
                Ok(1)
            },
            &ctx(0),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        assert_eq!(out, Err(FailureKind::TimedOut(Duration::from_millis(50))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_child_exit_without_frame() {
        let chunk = Chunk::new(0, 0, 1);
        let out: ChunkOutcome<u8> = execute(
            &chunk,
            &|_: &Chunk, _: &WorkerContext| unsafe { libc::_exit(9) },
            &ctx(0),
            None,
        )
        .unwrap();
        assert_eq!(
            out,
            Err(FailureKind::WorkerFailure(
                "chunk worker exited with code 9 without a result".into()
            ))
        );
    }

    #[test]
    fn test_status_description() {
        assert_eq!(describe_status(0), "exited with code 0");
    }
}
