//! Signal/slot dispatch.
//!
//! Signals and slots are declared once per class as typed constants and
//! registered in the class [`MetaObject`](crate::MetaObject). Connections live
//! in the system's connection registry; this module resolves a firing signal
//! against it and invokes every matching slot according to its
//! [`ConnectionType`].
//!
//! # Key Types
//!
//! - [`Signal<A>`] - Typed name of a signal with argument tuple `A`
//! - [`Slot<A>`] - Typed name of a slot
//! - [`SlotContext`] - What a running slot knows: receiver, sender, signal
//!
//! # Dispatch
//!
//! - **Direct**: the slot runs immediately in the emitting thread
//! - **Queued**: the arguments are snapshotted and posted to the receiver's
//!   thread as an [`Event::MetaCall`]
//! - **Auto**: Direct when the emitting thread is the receiver's thread,
//!   Queued otherwise
//! - **BlockingQueued**: Queued, then the emitter waits for the slot to run
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::sync::LazyLock;
//! use trellis_core::{ConnectionType, MetaObject, Object, ObjectSystem, Signal, Slot};
//!
//! const MOVED: Signal<(i64,)> = Signal::new("moved");
//! const FOLLOW: Slot<(i64,)> = Slot::new("follow");
//!
//! #[derive(Default)]
//! struct Marker {
//!     position: AtomicI64,
//! }
//!
//! static MARKER_META: LazyLock<MetaObject> = LazyLock::new(|| {
//!     MetaObject::builder("Marker")
//!         .signal(&MOVED)
//!         .slot(&FOLLOW, |this: &Marker, (p,)| this.position.store(p, Ordering::SeqCst))
//!         .build()
//! });
//!
//! impl Object for Marker {
//!     fn meta_object(&self) -> &'static MetaObject {
//!         &MARKER_META
//!     }
//! }
//!
//! let system = ObjectSystem::new();
//! let leader = system.create(Marker::default(), None);
//! let follower = system.create(Marker::default(), None);
//! system
//!     .connect(leader, &MOVED, follower, &FOLLOW, ConnectionType::Auto)
//!     .unwrap();
//!
//! system.emit(leader, &MOVED, (42,));
//! let follower = system.handler::<Marker>(follower).unwrap();
//! assert_eq!(follower.position.load(Ordering::SeqCst), 42);
//! ```

use std::fmt;
use std::marker::PhantomData;

use crate::connection::{Connection, ConnectionType, SlotTarget};
use crate::event::{Event, MetaCall};
use crate::invocation::{Completion, completion_pair};
use crate::meta::{MethodHandle, MethodKind};
use crate::object::{Object, ObjectId};
use crate::system::ObjectSystem;
use crate::thread::ThreadHandle;
use crate::value::{Arguments, Value};

/// Typed name of a signal whose arguments are the tuple `A`.
pub struct Signal<A> {
    name: &'static str,
    _args: PhantomData<fn(A)>,
}

impl<A> Signal<A> {
    /// Declare a signal name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _args: PhantomData,
        }
    }

    /// The signal's name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Signal<A> {}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.name)
    }
}

/// Typed name of a slot whose parameters are the tuple `A`.
pub struct Slot<A> {
    name: &'static str,
    _args: PhantomData<fn(A)>,
}

impl<A> Slot<A> {
    /// Declare a slot name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _args: PhantomData,
        }
    }

    /// The slot's name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<A> Clone for Slot<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Slot<A> {}

impl<A> fmt::Debug for Slot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.name)
    }
}

/// The environment of a running slot.
pub struct SlotContext<'a> {
    system: &'a ObjectSystem,
    receiver: ObjectId,
    object: &'a dyn Object,
    sender: Option<ObjectId>,
    signal: Option<MethodHandle>,
}

impl<'a> SlotContext<'a> {
    pub(crate) fn new(
        system: &'a ObjectSystem,
        receiver: ObjectId,
        object: &'a dyn Object,
        sender: Option<ObjectId>,
        signal: Option<MethodHandle>,
    ) -> Self {
        Self {
            system,
            receiver,
            object,
            sender,
            signal,
        }
    }

    /// The system the receiver lives in.
    pub fn system(&self) -> &'a ObjectSystem {
        self.system
    }

    /// The object the slot runs on.
    pub fn receiver(&self) -> ObjectId {
        self.receiver
    }

    /// The object that emitted the signal. `None` when the slot was invoked
    /// directly rather than through a connection. The sender may already be
    /// destroyed when a queued call runs.
    pub fn sender(&self) -> Option<ObjectId> {
        self.sender
    }

    /// The signal that triggered this call.
    pub fn signal(&self) -> Option<MethodHandle> {
        self.signal
    }

    /// The receiver's behaviour, downcast to its concrete type.
    pub fn receiver_as<T: Object>(&self) -> Option<&'a T> {
        self.object.as_any().downcast_ref::<T>()
    }
}

/// Emit `signal` from `sender` with typed arguments.
pub(crate) fn emit_typed<A: Arguments>(system: &ObjectSystem, sender: ObjectId, signal: &Signal<A>, args: A) {
    let Some(meta) = system.meta_object(sender) else {
        return;
    };
    let Some(handle) = meta.method(signal.name()).filter(|h| h.kind() == MethodKind::Signal) else {
        tracing::warn!(
            target: "trellis_core::signal",
            signal = signal.name(),
            class = meta.class_name(),
            "emitting a signal the class does not declare"
        );
        return;
    };
    emit(system, sender, handle, args.into_values());
}

/// Invoke every connection of (`sender`, `signal`).
#[tracing::instrument(skip(system, args), target = "trellis_core::signal", level = "trace")]
pub(crate) fn emit(system: &ObjectSystem, sender: ObjectId, signal: MethodHandle, args: Vec<Value>) {
    if system.signals_blocked(sender) {
        tracing::trace!(target: "trellis_core::signal", "signals blocked, skipping emit");
        return;
    }

    let connections = system.connection_snapshot(sender, signal);
    if connections.is_empty() {
        return;
    }
    tracing::trace!(target: "trellis_core::signal", connection_count = connections.len(), "emitting signal");

    let current = ThreadHandle::current();
    for (id, connection) in connections {
        // An earlier slot may have disconnected this one.
        if !system.has_connection(id) {
            continue;
        }
        let Ok(receiver_thread) = system.thread(connection.receiver) else {
            continue;
        };

        let kind = match connection.kind {
            ConnectionType::Auto if receiver_thread == current => ConnectionType::Direct,
            ConnectionType::Auto => ConnectionType::Queued,
            other => other,
        };

        match kind {
            ConnectionType::Direct | ConnectionType::Auto => {
                invoke(system, &connection, &args);
                if !system.contains(sender) {
                    tracing::trace!(target: "trellis_core::signal", ?sender, "sender destroyed by a slot, emission stopped");
                    return;
                }
            }
            ConnectionType::Queued => {
                queue(system, &connection, &args, None);
            }
            ConnectionType::BlockingQueued => {
                if receiver_thread == current {
                    tracing::warn!(
                        target: "trellis_core::signal",
                        signal = %signal.signature(),
                        slot = %connection.slot.describe(),
                        receiver = ?connection.receiver,
                        "deadlock detected: blocking queued connection to an object in the emitting thread"
                    );
                }
                let (handle, waiter) = completion_pair();
                queue(system, &connection, &args, Some(handle));
                let outcome = waiter.wait();
                if outcome == Completion::Discarded {
                    tracing::debug!(target: "trellis_core::signal", receiver = ?connection.receiver, "blocking call discarded before it ran");
                }
            }
        }
    }
}

fn queue(
    system: &ObjectSystem,
    connection: &Connection,
    args: &[Value],
    completion: Option<crate::invocation::CompletionHandle>,
) {
    let call = MetaCall {
        slot: connection.slot.clone(),
        args: args.to_vec(),
        sender: Some(connection.sender),
        signal: Some(connection.signal),
        completion,
    };
    // A failed post drops the call, which releases a blocked emitter.
    system.post_event(connection.receiver, Event::MetaCall(call));
}

fn invoke(system: &ObjectSystem, connection: &Connection, args: &[Value]) {
    invoke_slot(
        system,
        connection.receiver,
        &connection.slot,
        Some(connection.sender),
        Some(connection.signal),
        args,
    );
}

/// Run `slot` on `receiver` with no lock held.
pub(crate) fn invoke_slot(
    system: &ObjectSystem,
    receiver: ObjectId,
    slot: &SlotTarget,
    sender: Option<ObjectId>,
    signal: Option<MethodHandle>,
    args: &[Value],
) -> bool {
    let Some(object) = system.handler_dyn(receiver) else {
        return false;
    };
    let cx = SlotContext::new(system, receiver, object.as_ref(), sender, signal);
    match slot {
        SlotTarget::Closure { invoker, .. } => invoker(&cx, args),
        SlotTarget::Method(handle) => match handle.kind() {
            // Signal-to-signal connection: forward the emission.
            MethodKind::Signal => {
                let forwarded = args[..handle.parameters().len().min(args.len())].to_vec();
                emit(system, receiver, *handle, forwarded);
            }
            MethodKind::Slot => match handle.meta_method().invoker() {
                Some(invoker) => invoker(&cx, args),
                None => {
                    tracing::warn!(target: "trellis_core::signal", slot = %handle.signature(), "slot has no body");
                    return false;
                }
            },
        },
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const PINGED: Signal<(i32,)> = Signal::new("pinged");
    const PONG: Slot<(i32,)> = Slot::new("pong");

    #[test]
    fn handles_are_const_and_copy() {
        let signal = PINGED;
        let copy = signal;
        assert_eq!(signal.name(), "pinged");
        assert_eq!(copy.name(), "pinged");
        assert_eq!(format!("{PONG:?}"), "Slot(pong)");
    }

    #[test]
    fn context_downcasts_receiver() {
        let system = ObjectSystem::new();
        let id = system.create_plain(None);
        let object = crate::object::PlainObject;
        let cx = SlotContext::new(&system, id, &object, None, None);
        assert!(cx.receiver_as::<crate::object::PlainObject>().is_some());
        assert!(cx.sender().is_none());
        assert_eq!(cx.receiver(), id);
    }
}
