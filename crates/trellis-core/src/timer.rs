//! Per-thread timer registry.
//!
//! Each thread running an [`EventLoop`](crate::EventLoop) owns one
//! [`TimerManager`]. Objects start timers through
//! [`ObjectSystem::start_timer`](crate::ObjectSystem::start_timer); the loop
//! asks the manager for due timers and delivers [`Event::Timer`](crate::Event)
//! to their owners. All timers repeat until killed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use crate::object::ObjectId;
use crate::system::WeakSystem;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Zero-interval timers are rescheduled at least this far ahead.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A timer handle. Never zero, unique across threads, so a timer keeps its
/// id when its object moves to another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(NonZeroU64);

impl TimerId {
    pub(crate) fn next() -> Self {
        let raw = NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// The raw handle value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// A timer detached from its thread, kept for re-registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerInfo {
    pub id: TimerId,
    pub interval: Duration,
}

/// A timer that came due, with the object it belongs to.
pub(crate) struct DueTimer {
    pub id: TimerId,
    pub object: ObjectId,
    pub system: WeakSystem,
}

struct TimerData {
    object: ObjectId,
    system: WeakSystem,
    interval: Duration,
    next_fire: Instant,
}

/// An entry in the timer queue (min-heap by fire time).
#[derive(Debug, Clone, Copy)]
struct TimerQueueEntry {
    id: TimerId,
    fire_time: Instant,
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.id == other.id
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and the earliest fire time must
        // surface first. Ties go to the older timer.
        other
            .fire_time
            .cmp(&self.fire_time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Timers registered on one thread.
#[derive(Default)]
pub(crate) struct TimerManager {
    timers: HashMap<TimerId, TimerData>,
    /// Stale entries (killed or rescheduled timers) are skipped lazily.
    queue: BinaryHeap<TimerQueueEntry>,
}

impl TimerManager {
    pub fn register(&mut self, id: TimerId, system: WeakSystem, object: ObjectId, interval: Duration) {
        let next_fire = Instant::now() + interval;
        self.timers.insert(
            id,
            TimerData {
                object,
                system,
                interval,
                next_fire,
            },
        );
        self.queue.push(TimerQueueEntry {
            id,
            fire_time: next_fire,
        });
        tracing::trace!(target: "trellis_core::timer", ?id, ?object, ?interval, "timer registered");
    }

    /// Remove one timer, if it belongs to `object`.
    pub fn unregister(&mut self, id: TimerId, system: &WeakSystem, object: ObjectId) -> bool {
        let owned = self
            .timers
            .get(&id)
            .is_some_and(|t| t.object == object && t.system.ptr_eq(system));
        if owned {
            self.timers.remove(&id);
            tracing::trace!(target: "trellis_core::timer", ?id, "timer unregistered");
        }
        owned
    }

    /// Remove every timer of `object`, returning them for re-registration.
    pub fn unregister_object(&mut self, system: &WeakSystem, object: ObjectId) -> Vec<TimerInfo> {
        let mut removed: Vec<TimerInfo> = self
            .timers
            .iter()
            .filter(|(_, t)| t.object == object && t.system.ptr_eq(system))
            .map(|(id, t)| TimerInfo {
                id: *id,
                interval: t.interval,
            })
            .collect();
        removed.sort_by_key(|info| info.id);
        for info in &removed {
            self.timers.remove(&info.id);
        }
        removed
    }

    pub fn is_registered(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Time until the next timer is due, `None` without timers.
    pub fn time_until_next(&mut self, now: Instant) -> Option<Duration> {
        self.discard_stale();
        self.queue
            .peek()
            .map(|entry| entry.fire_time.saturating_duration_since(now))
    }

    /// Collect timers due at `now` and schedule their next shot.
    #[tracing::instrument(skip(self), target = "trellis_core::timer", level = "trace")]
    pub fn take_due(&mut self, now: Instant) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.peek().copied() {
            if entry.fire_time > now {
                break;
            }
            self.queue.pop();

            let Some(timer) = self.timers.get_mut(&entry.id) else {
                continue;
            };
            if timer.next_fire != entry.fire_time {
                continue;
            }

            due.push(DueTimer {
                id: entry.id,
                object: timer.object,
                system: timer.system.clone(),
            });

            // A loop that fell behind skips the missed shots instead of
            // firing them back to back.
            let next = timer.next_fire + timer.interval;
            timer.next_fire = if next > now {
                next
            } else {
                now + timer.interval.max(MIN_INTERVAL)
            };
            self.queue.push(TimerQueueEntry {
                id: entry.id,
                fire_time: timer.next_fire,
            });
        }
        due
    }

    fn discard_stale(&mut self) {
        while let Some(entry) = self.queue.peek() {
            let live = self
                .timers
                .get(&entry.id)
                .is_some_and(|t| t.next_fire == entry.fire_time);
            if live {
                break;
            }
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ObjectSystem;

    fn owner() -> (ObjectSystem, ObjectId) {
        let system = ObjectSystem::new();
        let object = system.create_plain(None);
        (system, object)
    }

    #[test]
    fn ids_are_unique_and_non_zero() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
        assert!(a.get() > 0);
    }

    #[test]
    fn due_timers_fire_in_order_and_repeat() {
        let (system, object) = owner();
        let weak = system.downgrade();
        let mut manager = TimerManager::default();
        let slow = TimerId::next();
        let fast = TimerId::next();
        manager.register(slow, weak.clone(), object, Duration::from_millis(20));
        manager.register(fast, weak, object, Duration::from_millis(10));

        let start = Instant::now();
        assert!(manager.take_due(start).is_empty());

        let due = manager.take_due(start + Duration::from_millis(25));
        let ids: Vec<TimerId> = due.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![fast, slow]);
        assert_eq!(manager.len(), 2);
        assert!(manager.time_until_next(start + Duration::from_millis(25)).is_some());
    }

    #[test]
    fn unregister_requires_owner() {
        let (system, object) = owner();
        let other = system.create_plain(None);
        let weak = system.downgrade();
        let mut manager = TimerManager::default();
        let id = TimerId::next();
        manager.register(id, weak.clone(), object, Duration::from_millis(5));

        assert!(!manager.unregister(id, &weak, other));
        assert!(manager.unregister(id, &weak, object));
        assert!(!manager.unregister(id, &weak, object));
        assert_eq!(manager.time_until_next(Instant::now()), None);
    }

    #[test]
    fn unregister_object_returns_its_timers() {
        let (system, object) = owner();
        let weak = system.downgrade();
        let mut manager = TimerManager::default();
        let first = TimerId::next();
        let second = TimerId::next();
        manager.register(first, weak.clone(), object, Duration::from_millis(5));
        manager.register(second, weak.clone(), object, Duration::from_millis(7));

        let parked = manager.unregister_object(&weak, object);
        assert_eq!(parked.len(), 2);
        assert_eq!(parked[0].id, first);
        assert_eq!(parked[1].interval, Duration::from_millis(7));
        assert!(!manager.is_registered(first));
    }
}
