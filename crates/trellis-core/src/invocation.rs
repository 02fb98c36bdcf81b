//! Completion signalling for blocking queued slot calls.
//!
//! A `BlockingQueued` emission packs a [`CompletionHandle`] into the posted
//! [`MetaCall`](crate::MetaCall) and parks on the matching
//! [`CompletionWaiter`]. The receiving thread completes the handle after the
//! slot has run. If the call is discarded instead (the receiver was destroyed,
//! or its queue was cleared), dropping the handle releases the waiter, so a
//! blocked emitter can never outlive its target.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How a blocking call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Still queued.
    Pending,
    /// The slot ran.
    Executed,
    /// The call was dropped without running.
    Discarded,
}

struct CompletionState {
    status: Mutex<Completion>,
    condvar: Condvar,
}

impl CompletionState {
    fn finish(&self, outcome: Completion) {
        let mut status = self.status.lock();
        if *status == Completion::Pending {
            *status = outcome;
            self.condvar.notify_all();
        }
    }
}

/// Receiver-side half: completed after the slot runs, or on drop.
pub struct CompletionHandle {
    inner: Arc<CompletionState>,
}

impl CompletionHandle {
    /// Mark the call as executed and wake the waiter.
    pub(crate) fn complete(self) {
        self.inner.finish(Completion::Executed);
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.inner.finish(Completion::Discarded);
    }
}

/// Emitter-side half.
pub struct CompletionWaiter {
    inner: Arc<CompletionState>,
}

impl CompletionWaiter {
    /// Block until the call has run or been discarded.
    pub fn wait(self) -> Completion {
        let mut status = self.inner.status.lock();
        while *status == Completion::Pending {
            self.inner.condvar.wait(&mut status);
        }
        *status
    }

    /// Block for at most `timeout`. Returns [`Completion::Pending`] when the
    /// timeout elapsed first.
    pub fn wait_timeout(self, timeout: Duration) -> Completion {
        let mut status = self.inner.status.lock();
        if *status == Completion::Pending {
            let _ = self
                .inner
                .condvar
                .wait_while_for(&mut status, |s| *s == Completion::Pending, timeout);
        }
        *status
    }
}

/// Create a linked handle/waiter pair.
pub fn completion_pair() -> (CompletionHandle, CompletionWaiter) {
    let state = Arc::new(CompletionState {
        status: Mutex::new(Completion::Pending),
        condvar: Condvar::new(),
    });

    (
        CompletionHandle {
            inner: state.clone(),
        },
        CompletionWaiter { inner: state },
    )
}
