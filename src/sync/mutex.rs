/*
 * memshield - heap integrity and stack protection for Cortex-M targets
 *
 * SPDX-License-Identifier: MIT
 */

//! RTOS-mutex abstraction.
//!
//! The library does not know which RTOS it runs under. Each subsystem owns a
//! [`SubsystemLock`]; the embedder may install a [`MutexPort`] binding it to
//! the RTOS's recursive mutex. Without a port (bare-metal, no scheduler) the
//! lock degrades to an atomic re-entry flag: a second entry - necessarily
//! from an interrupt - is refused with [`SyncError::Contended`] instead of
//! blocking.
//!
//! Acquisition hands out a [`LockGuard`]; release happens on drop, so no
//! return path can leak the lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::report::{self, AssertionKind};

/// Failures of the exclusion layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncError {
    #[error("mutex creation failed")]
    CreationFailed,
    #[error("mutex deletion failed")]
    DeletionFailed,
    #[error("no mutex available")]
    IsNull,
    #[error("mutex acquire failed")]
    AcquireFailed,
    #[error("mutex release failed")]
    ReleaseFailed,
    #[error("overlapping entry without an OS mutex")]
    Contended,
}

/// Binding to the RTOS mutex primitive.
///
/// Implementations are expected to wrap a *recursive* mutex so that nested
/// acquisition from the same task cannot deadlock. `acquire` may suspend the
/// calling task for up to `wait_ticks` scheduler ticks.
pub trait MutexPort: Sync {
    fn acquire(&self, wait_ticks: u32) -> Result<(), SyncError>;
    fn release(&self) -> Result<(), SyncError>;
}

/// The lock guarding one subsystem's ambient state.
pub struct SubsystemLock {
    // Written once before the scheduler starts, read afterwards.
    port: UnsafeCell<Option<&'static dyn MutexPort>>,
    busy: AtomicBool,
}

// The port cell is only mutated during single-threaded startup.
unsafe impl Sync for SubsystemLock {}

impl SubsystemLock {
    pub const fn new() -> Self {
        Self {
            port: UnsafeCell::new(None),
            busy: AtomicBool::new(false),
        }
    }

    /// Binds this lock to an RTOS mutex.
    ///
    /// Must be called before the scheduler starts; installing a port while
    /// the lock is in use is a race on the port slot.
    pub fn install_port(&self, port: &'static dyn MutexPort) {
        unsafe {
            *self.port.get() = Some(port);
        }
    }

    fn port(&self) -> Option<&'static dyn MutexPort> {
        unsafe { *self.port.get() }
    }

    /// Acquires the lock, suspending for up to `wait_ticks` when an RTOS
    /// port is installed.
    ///
    /// Mutex failures are reported to the assertion sink here;
    /// [`SyncError::Contended`] (the portless re-entry case) is left for the
    /// caller to classify, since the right kind depends on the entry point.
    pub fn acquire(&self, wait_ticks: u32) -> Result<LockGuard<'_>, SyncError> {
        match self.port() {
            Some(port) => match port.acquire(wait_ticks) {
                Ok(()) => Ok(LockGuard { lock: self, ported: true }),
                Err(SyncError::IsNull) => {
                    report::assert_failed(AssertionKind::MutexIsNull, "no mutex available");
                    Err(SyncError::IsNull)
                }
                Err(error) => {
                    report::assert_failed(
                        AssertionKind::MutexAcquireFailed,
                        "could not acquire mutex",
                    );
                    Err(error)
                }
            },
            None => {
                if self
                    .busy
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    Ok(LockGuard { lock: self, ported: false })
                } else {
                    Err(SyncError::Contended)
                }
            }
        }
    }
}

impl Default for SubsystemLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope of held exclusion; releases on drop on every exit path.
pub struct LockGuard<'a> {
    lock: &'a SubsystemLock,
    ported: bool,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.ported {
            // The guard cannot propagate the failure, so report it directly.
            if let Some(port) = self.lock.port() {
                if port.release().is_err() {
                    report::assert_failed(
                        AssertionKind::MutexReleaseFailed,
                        "could not release mutex",
                    );
                }
            }
        } else {
            self.lock.busy.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portless_lock_detects_overlap() {
        let lock = SubsystemLock::new();
        let guard = match lock.acquire(0) {
            Ok(guard) => guard,
            Err(error) => panic!("first acquire failed: {error}"),
        };
        match lock.acquire(0) {
            Ok(_) => panic!("overlapping acquire must be refused"),
            Err(error) => assert_eq!(error, SyncError::Contended),
        }
        drop(guard);
        assert!(lock.acquire(0).is_ok());
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SubsystemLock::new();
        for _ in 0..3 {
            let _guard = lock.acquire(0).unwrap();
        }
    }

    struct CountingPort {
        acquired: AtomicBool,
    }

    impl MutexPort for CountingPort {
        fn acquire(&self, _wait_ticks: u32) -> Result<(), SyncError> {
            self.acquired.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<(), SyncError> {
            self.acquired.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn installed_port_is_used() {
        static PORT: CountingPort = CountingPort { acquired: AtomicBool::new(false) };
        let lock = SubsystemLock::new();
        lock.install_port(&PORT);

        let guard = lock.acquire(10).unwrap();
        assert!(PORT.acquired.load(Ordering::SeqCst));
        drop(guard);
        assert!(!PORT.acquired.load(Ordering::SeqCst));
    }
}
