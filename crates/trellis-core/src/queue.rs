//! Per-thread posted event queue.
//!
//! Entries are kept in one vector ordered by descending priority, FIFO within
//! a priority. Delivery and removal never shift entries while a delivery pass
//! may be walking the vector: they void the entry in place instead, and the
//! outermost pass compacts the vector when it ends.

use std::collections::HashSet;

use crate::event::{Event, EventKind, EventPriority};
use crate::object::ObjectId;
use crate::system::WeakSystem;
use crate::thread::ThreadHandle;

/// Result of [`EventQueue::add`].
///
/// Events handed back are dropped by the caller after the queue lock is
/// released, so a discarded blocking call releases its emitter there.
pub(crate) enum Admission {
    /// Queued. `voided` holds the target's events a deferred delete replaced.
    Queued { voided: Vec<PostedEvent> },
    /// Merged into the deferred delete already queued.
    Compressed(PostedEvent),
    /// The target is scheduled for deletion.
    Refused(PostedEvent),
}

/// An event waiting for delivery.
pub(crate) struct PostedEvent {
    pub target: ObjectId,
    pub system: WeakSystem,
    pub event: Event,
    pub priority: EventPriority,
}

impl PostedEvent {
    fn addressed_to(&self, system: &WeakSystem, target: ObjectId) -> bool {
        self.target == target && self.system.ptr_eq(system)
    }
}

struct QueueEntry {
    priority: EventPriority,
    /// `None` once delivered or removed.
    posted: Option<PostedEvent>,
}

/// The posted events of one thread.
#[derive(Default)]
pub(crate) struct EventQueue {
    entries: Vec<QueueEntry>,
    /// Entries before this index have all been delivered.
    start_offset: usize,
    /// New entries are never inserted before this index.
    insertion_offset: usize,
    /// Depth of nested delivery passes.
    recursion: usize,
    pending: usize,
}

impl EventQueue {
    /// Number of events not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Queue an event.
    ///
    /// While a [`Event::DeferredDelete`] waits for a target, nothing else is
    /// queued for it: a second delete is merged into the first and any other
    /// event is refused. Queuing the delete voids the target's earlier
    /// events.
    pub fn add(&mut self, posted: PostedEvent) -> Admission {
        let kind = posted.event.kind();
        let delete_pending = self.live().any(|queued| {
            queued.addressed_to(&posted.system, posted.target) && queued.event.kind() == EventKind::DeferredDelete
        });
        if delete_pending {
            if kind == EventKind::DeferredDelete {
                tracing::trace!(target: "trellis_core::event", target_id = ?posted.target, "compressed deferred delete");
                return Admission::Compressed(posted);
            }
            tracing::debug!(target: "trellis_core::event", target_id = ?posted.target, ?kind, "event refused: target is scheduled for deletion");
            return Admission::Refused(posted);
        }

        let voided = if kind == EventKind::DeferredDelete {
            let system = posted.system.clone();
            self.remove_for(&system, posted.target, None)
        } else {
            Vec::new()
        };
        if !voided.is_empty() {
            tracing::trace!(target: "trellis_core::event", target_id = ?posted.target, voided = voided.len(), "deferred delete voided queued events");
        }
        self.append(posted);
        Admission::Queued { voided }
    }

    /// Queue an event already admitted by another queue, keeping priority
    /// order.
    pub fn append(&mut self, posted: PostedEvent) {
        let priority = posted.priority;
        let entry = QueueEntry {
            priority,
            posted: Some(posted),
        };
        let begin = self.insertion_offset.max(self.start_offset);
        let at_end = self
            .entries
            .last()
            .is_none_or(|last| last.priority >= priority)
            || begin >= self.entries.len();
        if at_end {
            self.entries.push(entry);
        } else {
            let at = begin + self.entries[begin..].partition_point(|e| e.priority >= priority);
            self.entries.insert(at, entry);
        }
        self.pending += 1;
    }

    /// Void every event for `target`, optionally only those of one kind.
    ///
    /// The removed events are returned so the caller drops them after
    /// releasing the queue lock.
    pub fn remove_for(
        &mut self,
        system: &WeakSystem,
        target: ObjectId,
        kind: Option<EventKind>,
    ) -> Vec<PostedEvent> {
        let mut removed = Vec::new();
        for entry in &mut self.entries[self.start_offset..] {
            let matches = entry.posted.as_ref().is_some_and(|posted| {
                posted.addressed_to(system, target) && kind.is_none_or(|k| posted.event.kind() == k)
            });
            if matches {
                removed.extend(entry.posted.take());
            }
        }
        self.pending -= removed.len();
        self.compact_if_idle();
        removed
    }

    /// Take every event addressed to one of `targets`, in queue order.
    pub fn take_for(&mut self, system: &WeakSystem, targets: &HashSet<ObjectId>) -> Vec<PostedEvent> {
        let mut taken = Vec::new();
        for entry in &mut self.entries[self.start_offset..] {
            let matches = entry
                .posted
                .as_ref()
                .is_some_and(|posted| posted.system.ptr_eq(system) && targets.contains(&posted.target));
            if matches {
                taken.extend(entry.posted.take());
            }
        }
        self.pending -= taken.len();
        self.compact_if_idle();
        taken
    }

    /// Drop everything. Used when the last system using the queue goes away.
    pub fn clear_system(&mut self, system: &WeakSystem) -> Vec<PostedEvent> {
        let mut removed = Vec::new();
        for entry in &mut self.entries[self.start_offset..] {
            if entry.posted.as_ref().is_some_and(|posted| posted.system.ptr_eq(system)) {
                removed.extend(entry.posted.take());
            }
        }
        self.pending -= removed.len();
        self.compact_if_idle();
        removed
    }

    fn live(&self) -> impl Iterator<Item = &PostedEvent> {
        self.entries[self.start_offset..]
            .iter()
            .filter_map(|entry| entry.posted.as_ref())
    }

    fn compact_if_idle(&mut self) {
        if self.recursion == 0 {
            self.entries.retain(|entry| entry.posted.is_some());
            self.start_offset = 0;
            self.insertion_offset = 0;
        }
    }
}

/// Filter for a delivery pass.
pub(crate) struct DeliveryFilter<'a> {
    pub system: &'a WeakSystem,
    pub target: ObjectId,
}

/// Deliver the events queued on `thread` when the pass starts.
///
/// Events posted while the pass runs wait for the next pass. The queue lock
/// is released around every delivery. Returns the number of events
/// delivered.
#[tracing::instrument(skip_all, target = "trellis_core::event", level = "trace")]
pub(crate) fn send_posted_events(thread: &ThreadHandle, filter: Option<DeliveryFilter<'_>>) -> usize {
    let mut queue = thread.data().queue.lock();
    queue.recursion += 1;
    let saved_insertion = queue.insertion_offset;
    queue.insertion_offset = queue.entries.len();
    let limit = queue.entries.len();

    let mut delivered = 0;
    let mut index = queue.start_offset;
    loop {
        // A nested unfiltered pass may have moved the shared cursor forward.
        if filter.is_none() {
            index = index.max(queue.start_offset);
        }
        if index >= limit.min(queue.entries.len()) {
            break;
        }
        let i = index;
        index += 1;

        let wanted = match (&filter, &queue.entries[i].posted) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(f), Some(posted)) => posted.addressed_to(f.system, f.target),
        };
        if filter.is_none() && queue.start_offset == i {
            queue.start_offset = index;
        }
        if !wanted {
            continue;
        }
        let Some(mut posted) = queue.entries[i].posted.take() else {
            continue;
        };
        queue.pending -= 1;

        parking_lot::MutexGuard::unlocked(&mut queue, || {
            if let Some(system) = posted.system.upgrade() {
                tracing::trace!(target: "trellis_core::event", target_id = ?posted.target, kind = ?posted.event.kind(), "delivering posted event");
                system.send_event(posted.target, &mut posted.event);
            }
            drop(posted);
        });
        delivered += 1;
    }

    queue.insertion_offset = saved_insertion;
    queue.recursion -= 1;
    queue.compact_if_idle();
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ObjectSystem;
    use crate::value::Value;

    fn posted(system: &ObjectSystem, target: ObjectId, kind: u32, priority: EventPriority) -> PostedEvent {
        PostedEvent {
            target,
            system: system.downgrade(),
            event: Event::user(kind, Value::Invalid),
            priority,
        }
    }

    fn kinds(queue: &EventQueue) -> Vec<u32> {
        queue
            .live()
            .map(|p| match &p.event {
                Event::User(u) => u.kind,
                _ => 0,
            })
            .collect()
    }

    #[test]
    fn priority_then_fifo() {
        let system = ObjectSystem::new();
        let target = system.create_plain(None);
        let mut queue = EventQueue::default();
        queue.add(posted(&system, target, 1, EventPriority::Normal));
        queue.add(posted(&system, target, 2, EventPriority::Low));
        queue.add(posted(&system, target, 3, EventPriority::High));
        queue.add(posted(&system, target, 4, EventPriority::Normal));
        queue.add(posted(&system, target, 5, EventPriority::High));

        assert_eq!(kinds(&queue), vec![3, 5, 1, 4, 2]);
        assert_eq!(queue.pending(), 5);
    }

    fn delete(system: &ObjectSystem, target: ObjectId) -> PostedEvent {
        PostedEvent {
            target,
            system: system.downgrade(),
            event: Event::DeferredDelete,
            priority: EventPriority::Normal,
        }
    }

    #[test]
    fn deferred_delete_is_compressed() {
        let system = ObjectSystem::new();
        let a = system.create_plain(None);
        let b = system.create_plain(None);
        let mut queue = EventQueue::default();
        assert!(matches!(queue.add(delete(&system, a)), Admission::Queued { .. }));
        assert!(matches!(queue.add(delete(&system, a)), Admission::Compressed(_)));
        assert!(matches!(queue.add(delete(&system, b)), Admission::Queued { .. }));
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn deferred_delete_voids_the_target() {
        let system = ObjectSystem::new();
        let a = system.create_plain(None);
        let b = system.create_plain(None);
        let mut queue = EventQueue::default();
        queue.add(posted(&system, a, 1, EventPriority::Normal));
        queue.add(posted(&system, b, 2, EventPriority::Normal));

        let Admission::Queued { voided } = queue.add(delete(&system, a)) else {
            panic!("deferred delete was not queued");
        };
        assert_eq!(voided.len(), 1);
        assert!(matches!(
            queue.add(posted(&system, a, 3, EventPriority::High)),
            Admission::Refused(_)
        ));
        queue.add(posted(&system, b, 4, EventPriority::Normal));

        // 0 stands for the deferred delete.
        assert_eq!(kinds(&queue), vec![2, 0, 4]);
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn remove_for_filters_by_target_and_kind() {
        let system = ObjectSystem::new();
        let a = system.create_plain(None);
        let b = system.create_plain(None);
        let weak = system.downgrade();
        let mut queue = EventQueue::default();
        queue.add(posted(&system, a, 1, EventPriority::Normal));
        queue.add(posted(&system, b, 2, EventPriority::Normal));
        queue.add(PostedEvent {
            target: a,
            system: weak.clone(),
            event: Event::ThreadChange,
            priority: EventPriority::Normal,
        });

        let removed = queue.remove_for(&weak, a, Some(EventKind::ThreadChange));
        assert_eq!(removed.len(), 1);
        assert_eq!(kinds(&queue), vec![1, 2]);

        let removed = queue.remove_for(&weak, a, None);
        assert_eq!(removed.len(), 1);
        assert_eq!(kinds(&queue), vec![2]);
    }

    #[test]
    fn take_for_preserves_order() {
        let system = ObjectSystem::new();
        let a = system.create_plain(None);
        let b = system.create_plain(None);
        let weak = system.downgrade();
        let mut queue = EventQueue::default();
        for kind in 1..=4 {
            let target = if kind % 2 == 0 { b } else { a };
            queue.add(posted(&system, target, kind, EventPriority::Normal));
        }

        let targets: HashSet<ObjectId> = [a].into_iter().collect();
        let taken: Vec<u32> = queue
            .take_for(&weak, &targets)
            .into_iter()
            .map(|p| match p.event {
                Event::User(u) => u.kind,
                _ => 0,
            })
            .collect();
        assert_eq!(taken, vec![1, 3]);
        assert_eq!(queue.pending(), 2);
    }
}
