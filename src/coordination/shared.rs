//! Cross-process primitives backed by an anonymous shared mapping
//!
//! The mapping is created with `MAP_SHARED | MAP_ANONYMOUS`, so a child forked
//! after creation addresses the same physical pages as its parent. Primitives
//! must therefore be created before the harness runs.

use super::{Coordinated, SharingScope};
use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// One `T` placed in memory shared with forked children
struct SharedRegion<T> {
    ptr: NonNull<T>,
}

// The region is only ever accessed through `T`'s own synchronization.
unsafe impl<T: Sync> Send for SharedRegion<T> {}
unsafe impl<T: Sync> Sync for SharedRegion<T> {}

impl<T> SharedRegion<T> {
    fn new(value: T) -> io::Result<Self> {
        let size = mem::size_of::<T>().max(1);
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(raw.cast::<T>()).ok_or_else(io::Error::last_os_error)?;
        // mmap returns page-aligned memory, which satisfies any T alignment.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr })
    }

    /// Initialize `T` in place after mapping
    fn with_init(init: impl FnOnce(*mut T) -> io::Result<()>, fallback: T) -> io::Result<Self> {
        let region = Self::new(fallback)?;
        init(region.ptr.as_ptr())?;
        Ok(region)
    }

    fn get(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            libc::munmap(self.ptr.as_ptr().cast(), mem::size_of::<T>().max(1));
        }
    }
}

// =============================================================================
// Shared Counter
// =============================================================================

/// Atomic integer visible to the parent and every forked child
#[derive(Clone)]
pub struct SharedCounter {
    name: String,
    region: Arc<SharedRegion<AtomicI64>>,
}

impl SharedCounter {
    /// Map a new counter
    ///
    /// Fails if the OS refuses the mapping.
    pub fn new(name: impl Into<String>, value: i64) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            region: Arc::new(SharedRegion::new(AtomicI64::new(value))?),
        })
    }

    /// Atomically add `delta`, returning the previous value
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.region.get().fetch_add(delta, Ordering::SeqCst)
    }

    pub fn load(&self) -> i64 {
        self.region.get().load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SharedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounter")
            .field("name", &self.name)
            .field("value", &self.load())
            .finish()
    }
}

impl Coordinated for SharedCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SharingScope {
        SharingScope::CrossProcess
    }
}

// =============================================================================
// Shared Mutex
// =============================================================================

struct MutexSlot<T> {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    initialized: bool,
    value: UnsafeCell<T>,
}

// Access to `value` is serialized by the process-shared pthread mutex.
unsafe impl<T: Copy + Send> Sync for MutexSlot<T> {}

impl<T> Drop for MutexSlot<T> {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                libc::pthread_mutex_destroy(self.mutex.get());
            }
        }
    }
}

/// Process-shared pthread mutex guarding a `Copy` value
///
/// `T` must be plain data: it is copied bit for bit into shared memory and
/// read from other processes, so it must not own heap allocations.
///
/// On Linux the mutex is robust. If a child is killed while holding it (for
/// example by a per-chunk timeout), the next `acquire` takes it over and the
/// guard reports [`owner_died`](SharedMutexGuard::owner_died); the value is
/// whatever the dead holder left behind. Other platforms leave such a lock
/// held, so keep critical sections short there.
#[derive(Clone)]
pub struct SharedMutex<T: Copy + Send> {
    name: String,
    region: Arc<SharedRegion<MutexSlot<T>>>,
}

impl<T: Copy + Send> SharedMutex<T> {
    /// Map and initialize a new mutex holding `value`
    pub fn new(name: impl Into<String>, value: T) -> io::Result<Self> {
        let slot = MutexSlot {
            mutex: UnsafeCell::new(unsafe { mem::zeroed() }),
            initialized: false,
            value: UnsafeCell::new(value),
        };
        let region = SharedRegion::with_init(|ptr| unsafe { init_mutex(ptr) }, slot)?;
        Ok(Self {
            name: name.into(),
            region: Arc::new(region),
        })
    }

    /// Block until the lock is held; the guard releases it on drop
    ///
    /// # Errors
    /// Any failure of `pthread_mutex_lock` other than a dead owner, which is
    /// recovered instead.
    pub fn acquire(&self) -> io::Result<SharedMutexGuard<'_, T>> {
        let slot = self.region.get();
        let code = unsafe { libc::pthread_mutex_lock(slot.mutex.get()) };
        match code {
            0 => Ok(SharedMutexGuard {
                slot,
                owner_died: false,
            }),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                warn!(mutex = %self.name, "previous holder died with the lock held, recovering");
                let consistent = unsafe { libc::pthread_mutex_consistent(slot.mutex.get()) };
                if consistent != 0 {
                    unsafe {
                        libc::pthread_mutex_unlock(slot.mutex.get());
                    }
                    return Err(io::Error::from_raw_os_error(consistent));
                }
                Ok(SharedMutexGuard {
                    slot,
                    owner_died: true,
                })
            }
            code => Err(io::Error::from_raw_os_error(code)),
        }
    }

    /// Run `f` with the lock held
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> io::Result<R> {
        let mut guard = self.acquire()?;
        Ok(f(&mut guard))
    }

    /// Copy of the current value
    pub fn get(&self) -> io::Result<T> {
        Ok(*self.acquire()?)
    }
}

unsafe fn init_mutex<T>(slot: *mut MutexSlot<T>) -> io::Result<()> {
    let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
    check(libc::pthread_mutexattr_init(&mut attr))?;
    let configured = check(libc::pthread_mutexattr_setpshared(
        &mut attr,
        libc::PTHREAD_PROCESS_SHARED,
    ));
    #[cfg(target_os = "linux")]
    let configured = configured.and_then(|_| {
        check(libc::pthread_mutexattr_setrobust(
            &mut attr,
            libc::PTHREAD_MUTEX_ROBUST,
        ))
    });
    let initialized =
        configured.and_then(|_| check(libc::pthread_mutex_init((*slot).mutex.get(), &attr)));
    libc::pthread_mutexattr_destroy(&mut attr);
    initialized?;
    (*slot).initialized = true;
    Ok(())
}

impl<T: Copy + Send> Coordinated for SharedMutex<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> SharingScope {
        SharingScope::CrossProcess
    }
}

/// Held lock on a [`SharedMutex`]
pub struct SharedMutexGuard<'a, T: Copy + Send> {
    slot: &'a MutexSlot<T>,
    owner_died: bool,
}

impl<T: Copy + Send> SharedMutexGuard<'_, T> {
    /// True if this lock was taken over from a holder that died holding it
    pub fn owner_died(&self) -> bool {
        self.owner_died
    }
}

impl<T: Copy + Send> Deref for SharedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.slot.value.get() }
    }
}

impl<T: Copy + Send> DerefMut for SharedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.slot.value.get() }
    }
}

impl<T: Copy + Send> Drop for SharedMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.slot.mutex.get());
        }
    }
}

fn check(code: libc::c_int) -> io::Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(code))
    }
}
