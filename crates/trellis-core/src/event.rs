//! Event payloads delivered to objects.

use std::fmt;

use crate::connection::SlotTarget;
use crate::invocation::CompletionHandle;
use crate::meta::MethodHandle;
use crate::object::ObjectId;
use crate::timer::{TimerId, TimerInfo};
use crate::value::Value;

/// Priority of a posted event.
///
/// Higher priority events are delivered first; events of equal priority are
/// delivered in the order they were posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum EventPriority {
    /// Background work.
    Low = 0,
    /// Most events.
    #[default]
    Normal = 1,
    /// Latency-sensitive events.
    High = 2,
    /// Shutdown and similar.
    Critical = 3,
}

/// A child was added to or removed from the receiving object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildEvent {
    /// The child was appended to the receiver's children.
    Added(ObjectId),
    /// The child left the receiver's children.
    Removed(ObjectId),
}

impl ChildEvent {
    /// The child concerned.
    pub fn child(self) -> ObjectId {
        match self {
            ChildEvent::Added(id) | ChildEvent::Removed(id) => id,
        }
    }
}

/// An application-defined event.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    /// Application-defined kind.
    pub kind: u32,
    /// Payload.
    pub payload: Value,
}

/// A slot invocation waiting to run on the receiver's thread.
///
/// Carries a snapshot of the signal arguments. Dropping an undelivered call
/// releases an emitter blocked on it.
pub struct MetaCall {
    pub(crate) slot: SlotTarget,
    pub(crate) args: Vec<Value>,
    pub(crate) sender: Option<ObjectId>,
    pub(crate) signal: Option<MethodHandle>,
    pub(crate) completion: Option<CompletionHandle>,
}

impl MetaCall {
    /// The object that emitted the signal.
    pub fn sender(&self) -> Option<ObjectId> {
        self.sender
    }

    /// The signal that produced this call.
    pub fn signal(&self) -> Option<MethodHandle> {
        self.signal
    }

    /// The argument snapshot.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Whether an emitter is blocked until this call runs.
    pub fn is_blocking(&self) -> bool {
        self.completion.is_some()
    }
}

impl fmt::Debug for MetaCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCall")
            .field("slot", &self.slot)
            .field("args", &self.args)
            .field("sender", &self.sender)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

/// Timers parked by a thread change, re-registered on arrival.
#[derive(Debug)]
pub struct TimerReregistration {
    pub(crate) timers: Vec<TimerInfo>,
}

/// An event delivered to an object.
#[derive(Debug)]
pub enum Event {
    /// A timer started with `start_timer` fired.
    Timer(TimerId),
    /// Tree change notification.
    Child(ChildEvent),
    /// Destroy the receiver.
    DeferredDelete,
    /// Run a queued slot.
    MetaCall(MetaCall),
    /// Sent to an object and its descendants right before they move to
    /// another thread.
    ThreadChange,
    /// Internal: restore timers after a thread change.
    TimerReregistration(TimerReregistration),
    /// A dynamic property was added, changed or removed.
    DynamicPropertyChange(String),
    /// Application-defined event.
    User(UserEvent),
}

/// Payload-free discriminant of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::Timer`].
    Timer,
    /// [`Event::Child`] with [`ChildEvent::Added`].
    ChildAdded,
    /// [`Event::Child`] with [`ChildEvent::Removed`].
    ChildRemoved,
    /// [`Event::DeferredDelete`].
    DeferredDelete,
    /// [`Event::MetaCall`].
    MetaCall,
    /// [`Event::ThreadChange`].
    ThreadChange,
    /// [`Event::TimerReregistration`].
    TimerReregistration,
    /// [`Event::DynamicPropertyChange`].
    DynamicPropertyChange,
    /// [`Event::User`].
    User,
}

impl Event {
    /// Build a user event.
    pub fn user(kind: u32, payload: impl Into<Value>) -> Self {
        Event::User(UserEvent {
            kind,
            payload: payload.into(),
        })
    }

    /// The event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Timer(_) => EventKind::Timer,
            Event::Child(ChildEvent::Added(_)) => EventKind::ChildAdded,
            Event::Child(ChildEvent::Removed(_)) => EventKind::ChildRemoved,
            Event::DeferredDelete => EventKind::DeferredDelete,
            Event::MetaCall(_) => EventKind::MetaCall,
            Event::ThreadChange => EventKind::ThreadChange,
            Event::TimerReregistration(_) => EventKind::TimerReregistration,
            Event::DynamicPropertyChange(_) => EventKind::DynamicPropertyChange,
            Event::User(_) => EventKind::User,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_low_to_critical() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
        assert_eq!(EventPriority::default(), EventPriority::Normal);
    }

    #[test]
    fn kinds_follow_payload() {
        let child = ObjectId::from_raw((1 << 32) | 1);
        assert_eq!(Event::Child(ChildEvent::Added(child)).kind(), EventKind::ChildAdded);
        assert_eq!(Event::Child(ChildEvent::Removed(child)).kind(), EventKind::ChildRemoved);
        assert_eq!(Event::user(7, 1i32).kind(), EventKind::User);
        assert_eq!(Event::DeferredDelete.kind(), EventKind::DeferredDelete);
    }

    #[test]
    fn user_event_carries_payload() {
        let Event::User(user) = Event::user(3, "hello") else {
            panic!("expected a user event");
        };
        assert_eq!(user.kind, 3);
        assert_eq!(user.payload.as_str(), Some("hello"));
    }
}
