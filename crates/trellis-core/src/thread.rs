//! Thread affinity.
//!
//! Every object points at the [`ThreadData`] record of the thread it lives
//! in, through a reference-counted [`ThreadHandle`]. A record owns that
//! thread's posted-event queue, the condition variable its event loop sleeps
//! on, and (while an event loop runs) the thread's timers. Records are created
//! lazily the first time a thread needs one and live as long as their longest
//! holder, which may outlive the OS thread itself.
//!
//! A record may also be *unbound*: it belongs to no thread. Objects moved to
//! no thread end up there until a thread adopts them with
//! [`ObjectSystem::move_to_thread`](crate::ObjectSystem::move_to_thread).
//!
//! # Lock order
//!
//! A queue lock may be taken while holding nothing, or while holding one
//! other queue lock with a smaller [`ThreadHandle::id`]. The object arena lock
//! may be taken while holding queue locks, never the other way round. The
//! timer lock may be taken while holding a queue lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::queue::EventQueue;
use crate::timer::{DueTimer, TimerId, TimerInfo, TimerManager};
use crate::object::ObjectId;
use crate::system::WeakSystem;

static NEXT_THREAD_DATA_ID: AtomicU64 = AtomicU64::new(1);

/// Flag to enable/disable the cross-thread access warnings globally.
static THREAD_CHECKS_ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle::bound_to_current();
}

/// Enable or disable warnings for object access from a foreign thread.
///
/// Enabled by default in debug builds. The checks never change behaviour;
/// they only log at `warn` level. Moving objects between threads and starting
/// timers validate the calling thread regardless of this flag.
pub fn set_thread_checks_enabled(enabled: bool) {
    THREAD_CHECKS_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Whether cross-thread access warnings are enabled.
#[inline]
pub fn are_thread_checks_enabled() -> bool {
    THREAD_CHECKS_ENABLED.load(Ordering::Relaxed)
}

/// Per-thread state shared by every object living in that thread.
pub struct ThreadData {
    id: u64,
    thread: Option<ThreadId>,
    name: Option<String>,
    pub(crate) queue: Mutex<EventQueue>,
    wake: Condvar,
    /// `Some` while at least one event loop runs on this thread.
    timers: Mutex<Option<TimerManager>>,
    loop_depth: AtomicUsize,
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("name", &self.name)
            .field("loop_depth", &self.loop_depth.load(Ordering::Relaxed))
            .finish()
    }
}

/// Shared handle to a [`ThreadData`] record.
///
/// Handles compare equal when they point at the same record.
#[derive(Clone)]
pub struct ThreadHandle(Arc<ThreadData>);

impl ThreadHandle {
    fn with_thread(thread: Option<ThreadId>, name: Option<String>) -> Self {
        Self(Arc::new(ThreadData {
            id: NEXT_THREAD_DATA_ID.fetch_add(1, Ordering::Relaxed),
            thread,
            name,
            queue: Mutex::new(EventQueue::default()),
            wake: Condvar::new(),
            timers: Mutex::new(None),
            loop_depth: AtomicUsize::new(0),
        }))
    }

    fn bound_to_current() -> Self {
        let current = std::thread::current();
        let handle = Self::with_thread(Some(current.id()), current.name().map(str::to_owned));
        tracing::trace!(target: "trellis_core::thread", id = handle.id(), thread = ?current.id(), "adopted thread");
        handle
    }

    /// The record of the calling thread, created on first use.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    /// A fresh record that belongs to no thread.
    pub fn unbound() -> Self {
        Self::with_thread(None, None)
    }

    /// Numeric identity, also used to order queue locks.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The OS thread, `None` for an unbound record.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.0.thread
    }

    /// Name of the OS thread at adoption time.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Whether the record belongs to a thread.
    pub fn is_bound(&self) -> bool {
        self.0.thread.is_some()
    }

    /// Whether the calling thread is this record's thread.
    pub fn is_current(&self) -> bool {
        self.0.thread == Some(std::thread::current().id())
    }

    /// Whether an event loop currently runs on this thread.
    pub fn has_event_loop(&self) -> bool {
        self.0.loop_depth.load(Ordering::Acquire) > 0
    }

    /// Number of posted events waiting in this thread's queue.
    pub fn pending_events(&self) -> usize {
        self.0.queue.lock().pending()
    }

    /// Number of timers registered on this thread.
    pub fn timer_count(&self) -> usize {
        self.0.timers.lock().as_ref().map_or(0, TimerManager::len)
    }

    pub(crate) fn data(&self) -> &ThreadData {
        &self.0
    }

    /// Wake a loop sleeping on this thread's queue.
    pub(crate) fn wake(&self) {
        let _queue = self.0.queue.lock();
        self.0.wake.notify_all();
    }

    /// Notify with the queue lock already held.
    pub(crate) fn notify_locked(&self) {
        self.0.wake.notify_all();
    }

    /// Sleep until woken or `timeout` elapses, unless `ready` says not to.
    pub(crate) fn wait(&self, timeout: Option<Duration>, ready: impl Fn(&EventQueue) -> bool) {
        let mut queue = self.0.queue.lock();
        if ready(&queue) {
            return;
        }
        match timeout {
            Some(timeout) => {
                let _ = self.0.wake.wait_for(&mut queue, timeout);
            }
            None => self.0.wake.wait(&mut queue),
        }
    }

    /// Lock two distinct queues in ascending id order.
    ///
    /// Returns the guards in argument order.
    pub(crate) fn lock_queues<'a>(
        first: &'a ThreadHandle,
        second: &'a ThreadHandle,
    ) -> (MutexGuard<'a, EventQueue>, MutexGuard<'a, EventQueue>) {
        debug_assert!(first != second, "locking a queue twice");
        if first.id() < second.id() {
            let a = first.0.queue.lock();
            let b = second.0.queue.lock();
            (a, b)
        } else {
            let b = second.0.queue.lock();
            let a = first.0.queue.lock();
            (a, b)
        }
    }

    // =========================================================================
    // Event loop and timer hooks
    // =========================================================================

    pub(crate) fn enter_loop(&self) {
        let mut timers = self.0.timers.lock();
        if timers.is_none() {
            *timers = Some(TimerManager::default());
        }
        self.0.loop_depth.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(target: "trellis_core::thread", id = self.id(), "event loop installed");
    }

    pub(crate) fn exit_loop(&self) {
        let mut timers = self.0.timers.lock();
        if self.0.loop_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            let dropped = timers.take().map_or(0, |t| t.len());
            tracing::debug!(target: "trellis_core::thread", id = self.id(), dropped_timers = dropped, "event loop removed");
        }
    }

    /// Register a timer; `false` when no event loop runs on this thread.
    pub(crate) fn register_timer(
        &self,
        id: TimerId,
        system: WeakSystem,
        object: ObjectId,
        interval: Duration,
    ) -> bool {
        match self.0.timers.lock().as_mut() {
            Some(timers) => {
                timers.register(id, system, object, interval);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unregister_timer(&self, id: TimerId, system: &WeakSystem, object: ObjectId) -> bool {
        self.0
            .timers
            .lock()
            .as_mut()
            .is_some_and(|timers| timers.unregister(id, system, object))
    }

    pub(crate) fn unregister_object_timers(&self, system: &WeakSystem, object: ObjectId) -> Vec<TimerInfo> {
        self.0
            .timers
            .lock()
            .as_mut()
            .map(|timers| timers.unregister_object(system, object))
            .unwrap_or_default()
    }

    pub(crate) fn is_timer_registered(&self, id: TimerId) -> bool {
        self.0
            .timers
            .lock()
            .as_ref()
            .is_some_and(|timers| timers.is_registered(id))
    }

    pub(crate) fn take_due_timers(&self, now: Instant) -> Vec<DueTimer> {
        self.0
            .timers
            .lock()
            .as_mut()
            .map(|timers| timers.take_due(now))
            .unwrap_or_default()
    }

    pub(crate) fn time_until_next_timer(&self, now: Instant) -> Option<Duration> {
        self.0
            .timers
            .lock()
            .as_mut()
            .and_then(|timers| timers.time_until_next(now))
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadHandle").field(&self.0).finish()
    }
}

/// Whether a child living in `child` may be parented under an object living
/// in `parent`.
///
/// Objects must share their record; an unbound parent is not special here
/// because construction already made the child adopt the parent's record.
pub fn check_parent_thread(parent: &ThreadHandle, child: &ThreadHandle) -> bool {
    parent == child
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn current_is_stable_per_thread() {
        let a = ThreadHandle::current();
        let b = ThreadHandle::current();
        assert_eq!(a, b);
        assert!(a.is_bound());
        assert!(a.is_current());

        let other = thread::spawn(ThreadHandle::current).join().unwrap();
        assert_ne!(a, other);
        assert!(!other.is_current());
        // The record survives its thread.
        assert!(other.is_bound());
    }

    #[test]
    fn unbound_records_are_distinct() {
        let a = ThreadHandle::unbound();
        let b = ThreadHandle::unbound();
        assert_ne!(a, b);
        assert!(!a.is_bound());
        assert!(!a.is_current());
        assert!(a.id() != b.id());
    }

    #[test]
    fn lock_queues_returns_guards_in_argument_order() {
        let low = ThreadHandle::unbound();
        let high = ThreadHandle::unbound();
        assert!(low.id() < high.id());

        let (a, b) = ThreadHandle::lock_queues(&high, &low);
        assert_eq!(a.pending(), 0);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn timers_require_a_loop() {
        let handle = ThreadHandle::unbound();
        let system = crate::ObjectSystem::new();
        let object = system.create_plain(None);
        let weak = system.downgrade();

        assert!(!handle.register_timer(TimerId::next(), weak.clone(), object, Duration::from_millis(1)));
        handle.enter_loop();
        assert!(handle.has_event_loop());
        let id = TimerId::next();
        assert!(handle.register_timer(id, weak.clone(), object, Duration::from_millis(1)));
        assert!(handle.is_timer_registered(id));
        handle.exit_loop();
        assert!(!handle.has_event_loop());
        assert_eq!(handle.timer_count(), 0);
    }

    #[test]
    fn parent_thread_check() {
        let here = ThreadHandle::current();
        let elsewhere = ThreadHandle::unbound();
        assert!(check_parent_thread(&here, &here.clone()));
        assert!(!check_parent_thread(&elsewhere, &here));
    }
}
