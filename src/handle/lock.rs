//! Re-entrant critical section (§4.5 "Locking"). `HandleLock` tracks the
//! owning thread and a depth counter so that the same thread may acquire
//! it repeatedly without deadlocking, mirroring the "acquisition
//! side-effects run only at depth 1→; release side-effects only at depth
//! →0" rule.

use crate::core::Result;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct State {
    owner: Option<ThreadId>,
    depth: u32,
}

pub struct HandleLock {
    state: Mutex<State>,
    cv: Condvar,
}

impl HandleLock {
    pub fn new() -> Self {
        HandleLock {
            state: Mutex::new(State { owner: None, depth: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until the lock is available or already held by this
    /// thread, then enters one level deeper.
    pub fn acquire(&self) -> Result<LockGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;
        loop {
            match state.owner {
                Some(owner) if owner == me => break,
                None => {
                    state.owner = Some(me);
                    break;
                }
                Some(_) => {
                    state = self.cv.wait(state)?;
                }
            }
        }
        state.depth += 1;
        let outermost = state.depth == 1;
        drop(state);
        Ok(LockGuard {
            lock: self,
            outermost,
        })
    }

    fn is_innermost_pending_release(&self) -> bool {
        matches!(self.state.lock(), Ok(state) if state.depth == 1)
    }
}

impl Default for HandleLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`HandleLock::acquire`]. `outermost` is true
/// when this acquisition brought the depth from 0 to 1 — the point at
/// which acquisition side-effects (e.g. opening a remote connection)
/// should run. [`LockGuard::is_last_release`] tells the caller, just
/// before drop, whether this guard's release will bring the depth back
/// to 0 — the point at which release side-effects (changes-stamp write,
/// draining queued stream deletes) should run.
pub struct LockGuard<'a> {
    lock: &'a HandleLock,
    pub outermost: bool,
}

impl LockGuard<'_> {
    pub fn is_last_release(&self) -> bool {
        self.lock.is_innermost_pending_release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.lock.state.lock() {
            state.depth -= 1;
            if state.depth == 0 {
                state.owner = None;
                self.lock.cv.notify_one();
            }
        }
    }
}
