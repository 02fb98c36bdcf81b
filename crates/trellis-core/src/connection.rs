//! Connection registry.
//!
//! One table per [`ObjectSystem`](crate::ObjectSystem) records every
//! signal/slot connection. Connections are stored in a [`SlotMap`] and indexed
//! by sender and by receiver, so tearing an object down removes its
//! connections without scanning the whole table.
//!
//! # Key Types
//!
//! - [`ConnectionId`] - Handle returned by every connect call
//! - [`ConnectionType`] - How a slot is invoked (Direct, Queued, etc.)
//! - [`ConnectionGuard`] - RAII guard that disconnects when dropped

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use slotmap::{SlotMap, new_key_type};

use crate::error::{SignalError, SignalResult};
use crate::meta::{Invoker, MethodHandle};
use crate::object::ObjectId;
use crate::system::{ObjectSystem, WeakSystem};

new_key_type! {
    /// A unique identifier for a signal-slot connection.
    ///
    /// The id stays valid until the connection is disconnected or one of its
    /// endpoints is destroyed.
    pub struct ConnectionId;
}

static NEXT_CLOSURE_ID: AtomicU64 = AtomicU64::new(1);

/// Specifies how a connected slot is invoked when the signal is emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Invoke the slot immediately in the emitting thread.
    Direct,

    /// Post the invocation to the receiver's thread.
    ///
    /// The slot runs when that thread's event loop delivers posted events,
    /// with a snapshot of the arguments taken at emission time.
    Queued,

    /// Direct when the emitting thread is the receiver's thread at emission
    /// time, Queued otherwise.
    #[default]
    Auto,

    /// Like Queued, but the emitting thread blocks until the slot has run.
    ///
    /// # Warning
    ///
    /// Emitting from the receiver's own thread deadlocks: the emitter waits
    /// for an event only its own thread could deliver. The dispatcher logs
    /// the situation and blocks anyway.
    BlockingQueued,
}

/// What a connection invokes.
#[derive(Clone)]
pub(crate) enum SlotTarget {
    /// A declared slot, or a signal to re-emit.
    Method(MethodHandle),
    /// An anonymous closure.
    Closure { id: u64, invoker: Invoker },
}

impl SlotTarget {
    pub fn closure(invoker: Invoker) -> Self {
        SlotTarget::Closure {
            id: NEXT_CLOSURE_ID.fetch_add(1, Ordering::Relaxed),
            invoker,
        }
    }

    /// Same slot. Closures are only ever equal to themselves.
    pub fn same(&self, other: &SlotTarget) -> bool {
        match (self, other) {
            (SlotTarget::Method(a), SlotTarget::Method(b)) => a == b,
            (SlotTarget::Closure { id: a, .. }, SlotTarget::Closure { id: b, .. }) => a == b,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SlotTarget::Method(handle) => handle.signature(),
            SlotTarget::Closure { id, .. } => format!("<closure #{id}>"),
        }
    }
}

impl fmt::Debug for SlotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// One registered connection.
#[derive(Clone, Debug)]
pub(crate) struct Connection {
    pub sender: ObjectId,
    pub signal: MethodHandle,
    pub receiver: ObjectId,
    pub slot: SlotTarget,
    pub kind: ConnectionType,
}

impl Connection {
    fn same_endpoints(&self, other: &Connection) -> bool {
        self.sender == other.sender
            && self.signal == other.signal
            && self.receiver == other.receiver
            && self.slot.same(&other.slot)
    }
}

/// All connections of one object system.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: SlotMap<ConnectionId, Connection>,
    by_sender: HashMap<ObjectId, Vec<ConnectionId>>,
    by_receiver: HashMap<ObjectId, Vec<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Add a connection. A `unique` request duplicating an existing one is
    /// rejected.
    pub fn insert(&mut self, connection: Connection, unique: bool) -> SignalResult<ConnectionId> {
        if unique {
            let duplicate = self
                .sender_ids(connection.sender)
                .iter()
                .filter_map(|id| self.connections.get(*id))
                .any(|existing| existing.same_endpoints(&connection));
            if duplicate {
                return Err(SignalError::DuplicateConnection {
                    signal: connection.signal.signature(),
                    slot: connection.slot.describe(),
                });
            }
        }

        let sender = connection.sender;
        let receiver = connection.receiver;
        let id = self.connections.insert(connection);
        self.by_sender.entry(sender).or_default().push(id);
        self.by_receiver.entry(receiver).or_default().push(id);
        Ok(id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        unindex(&mut self.by_sender, connection.sender, id);
        unindex(&mut self.by_receiver, connection.receiver, id);
        Some(connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Remove the connections of `sender` matching every given filter.
    pub fn disconnect_matching(
        &mut self,
        sender: ObjectId,
        signal: Option<MethodHandle>,
        receiver: Option<ObjectId>,
        slot: Option<&SlotTarget>,
    ) -> Vec<Connection> {
        let doomed: Vec<ConnectionId> = self
            .sender_ids(sender)
            .iter()
            .copied()
            .filter(|id| {
                self.connections.get(*id).is_some_and(|c| {
                    signal.is_none_or(|s| c.signal == s)
                        && receiver.is_none_or(|r| c.receiver == r)
                        && slot.is_none_or(|s| c.slot.same(s))
                })
            })
            .collect();
        doomed.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Snapshot of the connections of (`sender`, `signal`) in insertion order.
    pub fn matching(&self, sender: ObjectId, signal: MethodHandle) -> Vec<(ConnectionId, Connection)> {
        self.sender_ids(sender)
            .iter()
            .filter_map(|id| {
                self.connections
                    .get(*id)
                    .filter(|c| c.signal == signal)
                    .map(|c| (*id, c.clone()))
            })
            .collect()
    }

    /// Number of connections on (`sender`, `signal`).
    pub fn receivers(&self, sender: ObjectId, signal: MethodHandle) -> usize {
        self.sender_ids(sender)
            .iter()
            .filter(|id| self.connections.get(**id).is_some_and(|c| c.signal == signal))
            .count()
    }

    /// Drop every connection where `id` is sender or receiver.
    pub fn remove_object(&mut self, id: ObjectId) -> Vec<Connection> {
        let mut ids = self.by_sender.remove(&id).unwrap_or_default();
        ids.extend(self.by_receiver.remove(&id).unwrap_or_default());
        ids.into_iter().filter_map(|cid| self.remove(cid)).collect()
    }

    /// Connections where `id` is sender or receiver. A self-connection counts
    /// once.
    pub fn connection_count(&self, id: ObjectId) -> usize {
        let as_sender = self.sender_ids(id).len();
        let as_receiver = self
            .by_receiver
            .get(&id)
            .map_or(0, |ids| {
                ids.iter()
                    .filter(|cid| self.connections.get(**cid).is_some_and(|c| c.sender != id))
                    .count()
            });
        as_sender + as_receiver
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    fn sender_ids(&self, sender: ObjectId) -> &[ConnectionId] {
        self.by_sender.get(&sender).map_or(&[], Vec::as_slice)
    }
}

fn unindex(index: &mut HashMap<ObjectId, Vec<ConnectionId>>, key: ObjectId, id: ConnectionId) {
    if let Some(ids) = index.get_mut(&key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}

/// RAII guard that disconnects when dropped.
///
/// The guard holds the system weakly, so it never keeps objects alive.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use trellis_core::{ConnectionType, ObjectSystem, OBJECT_NAME_CHANGED};
///
/// let system = ObjectSystem::new();
/// let object = system.create_plain(None);
/// let hits = Arc::new(AtomicUsize::new(0));
/// {
///     let hits = hits.clone();
///     let id = system
///         .connect_fn(object, &OBJECT_NAME_CHANGED, object, ConnectionType::Direct, move |_, _| {
///             hits.fetch_add(1, Ordering::SeqCst);
///         })
///         .unwrap();
///     let _guard = system.connection_guard(id);
///     system.set_object_name(object, "first");
/// }
/// system.set_object_name(object, "second");
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
pub struct ConnectionGuard {
    system: WeakSystem,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub(crate) fn new(system: &ObjectSystem, id: ConnectionId) -> Self {
        Self {
            system: system.downgrade(),
            id,
        }
    }

    /// The guarded connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Give up the guard without disconnecting.
    pub fn release(self) -> ConnectionId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(system) = self.system.upgrade() {
            system.disconnect_connection(self.id);
        }
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").field("id", &self.id).finish()
    }
}
