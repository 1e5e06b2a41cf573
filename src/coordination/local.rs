//! Process-local primitives
//!
//! Cheap to clone (every clone refers to the same cell) and valid only inside
//! the creating process.

use super::{Coordinated, SharingScope};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

// =============================================================================
// Mutex
// =============================================================================

/// Mutex-guarded value shared between threads
///
/// `acquire` returns a guard; dropping the guard releases the lock.
#[derive(Debug, Default)]
pub struct LocalMutex<T> {
    name: String,
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for LocalMutex<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> LocalMutex<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Block until the lock is held
    pub fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Run `f` with the lock held
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}

impl<T: Clone> LocalMutex<T> {
    /// Copy of the current value
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }
}

impl<T> Coordinated for LocalMutex<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SharingScope {
        SharingScope::ProcessLocal
    }
}

// =============================================================================
// Atomic Counter
// =============================================================================

/// Atomic integer shared between threads
#[derive(Debug, Clone, Default)]
pub struct LocalCounter {
    name: String,
    inner: Arc<AtomicI64>,
}

impl LocalCounter {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(AtomicI64::new(value)),
        }
    }

    /// Atomically add `delta`, returning the previous value
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.inner.fetch_add(delta, Ordering::SeqCst)
    }

    pub fn load(&self) -> i64 {
        self.inner.load(Ordering::SeqCst)
    }
}

impl Coordinated for LocalCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SharingScope {
        SharingScope::ProcessLocal
    }
}

// =============================================================================
// Unsynchronized Counter
// =============================================================================

/// Counter whose increment is a separate load and store
///
/// Concurrent increments interleave between the two steps and overwrite each
/// other, so the final value can land below the number of increments. Each step
/// is an atomic access, which keeps the race observable without undefined
/// behaviour. Use [`LocalCounter`] or a mutex when the total matters.
#[derive(Debug, Clone, Default)]
pub struct RacyCounter {
    name: String,
    inner: Arc<AtomicI64>,
}

impl RacyCounter {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(AtomicI64::new(value)),
        }
    }

    /// Read-modify-write without synchronization
    pub fn increment(&self) {
        let current = self.inner.load(Ordering::Relaxed);
        // Widens the window between read and write so the lost update shows
        // up on a single core too.
        thread::yield_now();
        self.inner.store(current + 1, Ordering::Relaxed);
    }

    pub fn load(&self) -> i64 {
        self.inner.load(Ordering::SeqCst)
    }
}

impl Coordinated for RacyCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SharingScope {
        SharingScope::ProcessLocal
    }
}
