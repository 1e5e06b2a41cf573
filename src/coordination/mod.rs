//! Coordination primitives for state shared between chunk workers
//!
//! Two families, distinguished by [`SharingScope`]:
//!
//! - **Process-local** ([`LocalMutex`], [`LocalCounter`], [`RacyCounter`]): live in
//!   the caller's heap. Correct under `Backend::Threaded`; under
//!   `Backend::Multiprocess` every child mutates its own copy and the parent
//!   never sees the change.
//! - **Cross-process** ([`SharedCounter`], [`SharedMutex`]): live in an anonymous
//!   shared mapping created before the workers fork, so every backend observes
//!   the same memory.
//!
//! A work function that uses one of these should be declared to the harness with
//! `Harness::share`, which checks the scope against the backend before any work
//! starts.
//!
//! ## Example
//!
//! ```
//! use chunkpool::{partition, Harness, HarnessConfig, LocalCounter};
//!
//! let counter = LocalCounter::new("hits", 0);
//! let config = HarnessConfig { num_workers: 4, ..Default::default() };
//! let harness = Harness::new(config).share(&counter);
//!
//! let chunks = partition(100, 4).unwrap();
//! harness
//!     .run(&chunks, |chunk, _ctx| {
//!         counter.fetch_add(chunk.len as i64);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(counter.load(), 100);
//! ```

mod local;
#[cfg(unix)]
mod shared;

pub use local::{LocalCounter, LocalMutex, RacyCounter};
#[cfg(unix)]
pub use shared::{SharedCounter, SharedMutex, SharedMutexGuard};

use crate::config::Backend;

/// Which address spaces a primitive is visible from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingScope {
    /// Only the process that created it
    ProcessLocal,
    /// The creating process and every child forked after creation
    CrossProcess,
}

impl SharingScope {
    /// Whether a primitive with this scope coordinates workers of `backend`
    pub fn supports(self, backend: Backend) -> bool {
        match (self, backend) {
            (SharingScope::CrossProcess, _) => true,
            (SharingScope::ProcessLocal, Backend::Threaded) => true,
            (SharingScope::ProcessLocal, Backend::Multiprocess) => false,
        }
    }
}

/// A primitive that can be declared to the harness
pub trait Coordinated {
    /// Name used in errors and logs
    fn name(&self) -> &str;

    /// Visibility of the primitive's memory
    fn scope(&self) -> SharingScope;
}
