//! Process-shared memory primitives
//!
//! A [`ShmRegion`] is an anonymous `MAP_SHARED` mapping created before
//! workers fork, so parent and children address the same physical pages at
//! the same virtual address. Synchronization across the boundary uses
//! process-shared POSIX semaphores and mutexes placed inside the mapping.

use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use crate::error::{ Result, SlipstreamError };

/// Anonymous shared memory mapping
pub(crate) struct ShmRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping lives until Drop and all concurrent access goes
// through the process-shared primitives or slots owned by a single writer.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    pub fn new(len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(
                SlipstreamError::system(
                    format!("mmap of {len} shared bytes failed: {}", io::Error::last_os_error())
                )
            );
        }
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, len);
        }
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the range is in bounds and not written
    /// concurrently.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// Borrow `len` bytes at `offset` mutably.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the range is in bounds and exclusively
    /// owned for the duration of the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Initialize a process-shared semaphore in place.
///
/// # Safety
///
/// `sem` must point into a shared mapping with room for a `sem_t`.
pub(crate) unsafe fn sem_init_shared(sem: *mut libc::sem_t, value: u32) -> Result<()> {
    if libc::sem_init(sem, 1, value) != 0 {
        return Err(
            SlipstreamError::system(format!("sem_init failed: {}", io::Error::last_os_error()))
        );
    }
    Ok(())
}

/// Wait on a semaphore, optionally bounded by `timeout`.
///
/// Returns `false` when the timeout elapsed before the semaphore could be
/// decremented. `EINTR` is retried.
///
/// # Safety
///
/// `sem` must point at a semaphore initialized with [`sem_init_shared`].
pub(crate) unsafe fn sem_wait_timeout(
    sem: *mut libc::sem_t,
    timeout: Option<Duration>,
) -> Result<bool> {
    match timeout {
        None => loop {
            if libc::sem_wait(sem) == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(SlipstreamError::system(format!("sem_wait failed: {err}")));
            }
        },
        Some(timeout) => {
            let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            if libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) != 0 {
                return Err(
                    SlipstreamError::system(
                        format!("clock_gettime failed: {}", io::Error::last_os_error())
                    )
                );
            }
            let nanos = now.tv_nsec as i128 + timeout.subsec_nanos() as i128;
            let deadline = libc::timespec {
                tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t
                    + (nanos / 1_000_000_000) as libc::time_t,
                tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
            };
            loop {
                if libc::sem_timedwait(sem, &deadline) == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => {}
                    _ => {
                        return Err(SlipstreamError::system(format!("sem_timedwait failed: {err}")));
                    }
                }
            }
        }
    }
}

/// Post a semaphore.
///
/// # Safety
///
/// `sem` must point at a semaphore initialized with [`sem_init_shared`].
pub(crate) unsafe fn sem_post(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_post(sem) != 0 {
        return Err(
            SlipstreamError::system(format!("sem_post failed: {}", io::Error::last_os_error()))
        );
    }
    Ok(())
}

/// Initialize a process-shared mutex in place.
///
/// # Safety
///
/// `mutex` must point into a shared mapping with room for a
/// `pthread_mutex_t`.
pub(crate) unsafe fn mutex_init_shared(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
    if libc::pthread_mutexattr_init(&mut attr) != 0 {
        return Err(SlipstreamError::system("pthread_mutexattr_init failed"));
    }
    if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(SlipstreamError::system("pthread_mutexattr_setpshared failed"));
    }
    let rc = libc::pthread_mutex_init(mutex, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if rc != 0 {
        return Err(SlipstreamError::system("pthread_mutex_init failed"));
    }
    Ok(())
}

/// Run `f` with the mutex held.
///
/// # Safety
///
/// `mutex` must point at a mutex initialized with [`mutex_init_shared`].
pub(crate) unsafe fn with_mutex<T>(
    mutex: *mut libc::pthread_mutex_t,
    f: impl FnOnce() -> T,
) -> Result<T> {
    if libc::pthread_mutex_lock(mutex) != 0 {
        return Err(SlipstreamError::system("pthread_mutex_lock failed"));
    }
    let out = f();
    if libc::pthread_mutex_unlock(mutex) != 0 {
        return Err(SlipstreamError::system("pthread_mutex_unlock failed"));
    }
    Ok(out)
}
