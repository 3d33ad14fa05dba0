//! Process-wide session guard.
//!
//! At most one backup or restore session runs per process. The state and
//! its mutual-exclusion live in one value behind one mutex; the stop flag
//! is a separate atomic so per-file cancellation checks stay cheap.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use timevault_core::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Cancelling,
}

#[derive(Debug)]
pub struct SessionGuard {
    state: Mutex<DriverState>,
    should_stop: AtomicBool,
    last_session_second: AtomicI64,
}

impl SessionGuard {
    pub fn new() -> Self {
        SessionGuard {
            state: Mutex::new(DriverState::Idle),
            should_stop: AtomicBool::new(false),
            last_session_second: AtomicI64::new(i64::MIN),
        }
    }

    /// Claim the singleton slot. Fails immediately with `Busy` when a
    /// session is already active.
    pub fn try_begin(&self) -> VaultResult<SessionPermit<'_>> {
        let mut state = self.state.lock().expect("session guard poisoned");
        if *state != DriverState::Idle {
            return Err(VaultError::Busy);
        }
        *state = DriverState::Running;
        self.should_stop.store(false, Ordering::SeqCst);
        Ok(SessionPermit { guard: self })
    }

    /// Cooperative cancellation: observed by the packer's per-file loop
    /// and the restorer's per-member loop at the next boundary.
    pub fn request_stop(&self) {
        let mut state = self.state.lock().expect("session guard poisoned");
        if *state == DriverState::Running {
            *state = DriverState::Cancelling;
            self.should_stop.store(true, Ordering::SeqCst);
        }
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock().expect("session guard poisoned")
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    /// Returns `Cancelled` when a stop was requested; called at file and
    /// member boundaries.
    pub fn checkpoint(&self) -> VaultResult<()> {
        if self.should_stop() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Whether `second` collides with the previous session in this
    /// process; records it otherwise. Sessions must start on distinct
    /// whole seconds so their timestamps stay totally ordered at
    /// one-second granularity.
    pub fn claim_session_second(&self, second: i64) -> bool {
        let last = self.last_session_second.load(Ordering::SeqCst);
        if second <= last {
            return false;
        }
        self.last_session_second
            .compare_exchange(last, second, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the lifetime of a session; dropping it returns the guard to
/// idle.
pub struct SessionPermit<'a> {
    guard: &'a SessionGuard,
}

impl Drop for SessionPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.guard.state.lock().expect("session guard poisoned");
        *state = DriverState::Idle;
        self.guard.should_stop.store(false, Ordering::SeqCst);
    }
}
