//! The object system facade.
//!
//! [`ObjectSystem`] owns an arena of objects and the table of their
//! connections, and implements every operation on objects: construction and
//! teardown, parenting, names and properties, thread affinity, timers, event
//! delivery and signal emission.
//!
//! A system is a cheap, cloneable handle. Most programs use the process-wide
//! [`ObjectSystem::global`]; tests usually create isolated systems with
//! [`ObjectSystem::new`].
//!
//! # Locking
//!
//! The arena and the connection table each sit behind their own lock, and
//! every thread's posted-event queue behind another. No lock is held while
//! user code (event handlers, slots, property accessors) runs, so handlers
//! may call back into the system freely.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::connection::{Connection, ConnectionGuard, ConnectionId, ConnectionRegistry, ConnectionType, SlotTarget};
use crate::error::{ObjectError, ObjectResult, PropertyError, PropertyResult, SignalError, SignalResult};
use crate::event::{ChildEvent, Event, EventKind, EventPriority, TimerReregistration};
use crate::meta::{DESTROYED, Invoker, MetaObject, MethodHandle, MethodKind, OBJECT_NAME_CHANGED};
use crate::object::{EventContext, Lifecycle, Object, ObjectData, ObjectId, ObjectRegistry, PlainObject};
use crate::queue::{self, Admission, DeliveryFilter, PostedEvent};
use crate::signal::{self, Signal, Slot, SlotContext};
use crate::thread::{ThreadHandle, are_thread_checks_enabled, check_parent_thread};
use crate::timer::{TimerId, TimerInfo};
use crate::value::{Arguments, Value, arguments_compatible};

static GLOBAL: OnceLock<ObjectSystem> = OnceLock::new();

struct SystemShared {
    me: Weak<SystemShared>,
    objects: RwLock<ObjectRegistry>,
    connections: Mutex<ConnectionRegistry>,
}

impl Drop for SystemShared {
    fn drop(&mut self) {
        // Objects still alive are discarded without teardown. Their queued
        // events and timers would never resolve again, so drop them now.
        let weak = WeakSystem(self.me.clone());
        let objects = self.objects.get_mut();
        let mut threads: Vec<ThreadHandle> = Vec::new();
        for (id, data) in objects.iter() {
            if data.pending_timer {
                data.thread.unregister_object_timers(&weak, id);
            }
            if !threads.contains(&data.thread) {
                threads.push(data.thread.clone());
            }
        }
        for thread in threads {
            let discarded = thread.data().queue.lock().clear_system(&weak);
            drop(discarded);
        }
        if objects.len() > 0 {
            tracing::debug!(target: "trellis_core::object", remaining = objects.len(), "object system dropped with live objects");
        }
    }
}

/// Weak reference to a system, held by queued events and timers.
#[derive(Clone)]
pub(crate) struct WeakSystem(Weak<SystemShared>);

impl WeakSystem {
    pub fn upgrade(&self) -> Option<ObjectSystem> {
        self.0.upgrade().map(|shared| ObjectSystem { shared })
    }

    pub fn ptr_eq(&self, other: &WeakSystem) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

/// An arena of objects with their connections.
///
/// Dropping the last handle discards the remaining objects without running
/// their teardown; call [`ObjectSystem::shutdown`] first for an orderly
/// destruction.
#[derive(Clone)]
pub struct ObjectSystem {
    shared: Arc<SystemShared>,
}

impl Default for ObjectSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSystem")
            .field("objects", &self.objects().len())
            .field("connections", &self.shared.connections.lock().len())
            .finish()
    }
}

impl ObjectSystem {
    /// Create an isolated system.
    pub fn new() -> Self {
        Self {
            shared: Arc::new_cyclic(|me| SystemShared {
                me: me.clone(),
                objects: RwLock::new(ObjectRegistry::default()),
                connections: Mutex::new(ConnectionRegistry::default()),
            }),
        }
    }

    /// The process-wide system, created on first use.
    pub fn global() -> &'static ObjectSystem {
        GLOBAL.get_or_init(|| {
            tracing::debug!(target: "trellis_core::object", "global object system created");
            ObjectSystem::new()
        })
    }

    pub(crate) fn downgrade(&self) -> WeakSystem {
        WeakSystem(Arc::downgrade(&self.shared))
    }

    /// Whether both handles refer to the same system.
    pub fn ptr_eq(&self, other: &ObjectSystem) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn objects(&self) -> RwLockReadGuard<'_, ObjectRegistry> {
        self.shared.objects.read()
    }

    fn objects_mut(&self) -> RwLockWriteGuard<'_, ObjectRegistry> {
        self.shared.objects.write()
    }

    fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&ObjectData) -> R) -> Option<R> {
        self.objects().get(id).map(f)
    }

    fn invalid(&self, id: ObjectId, operation: &'static str) -> ObjectError {
        tracing::warn!(target: "trellis_core::object", ?id, operation, "object does not exist");
        ObjectError::InvalidObjectId(id)
    }

    fn warn_if_foreign(&self, id: ObjectId, thread: &ThreadHandle, operation: &'static str) {
        if are_thread_checks_enabled() && thread.is_bound() && !thread.is_current() {
            tracing::warn!(
                target: "trellis_core::thread",
                ?id,
                operation,
                object_thread = ?thread.thread_id(),
                current_thread = ?std::thread::current().id(),
                "object used from a thread it does not live in"
            );
        }
    }

    // =========================================================================
    // Construction and teardown
    // =========================================================================

    /// Add an object to the system, optionally under `parent`.
    ///
    /// The object lives in the calling thread, unless the parent has no
    /// thread, in which case it shares the parent's affinity record. When the
    /// parent lives in another thread, or no longer exists, the object is
    /// created without a parent and a warning is logged.
    pub fn create<T: Object>(&self, object: T, parent: Option<ObjectId>) -> ObjectId {
        let thread = parent
            .and_then(|p| self.with_object(p, |data| data.thread.clone()))
            .filter(|thread| !thread.is_bound())
            .unwrap_or_else(ThreadHandle::current);
        let class = object.meta_object().class_name();

        let id = self.objects_mut().insert(ObjectData::new(object, thread));
        tracing::debug!(target: "trellis_core::object", ?id, class, "object created");

        if parent.is_some() {
            // Failure leaves the object parentless; set_parent already warned.
            let _ = self.set_parent(id, parent);
        }
        if let Some(data) = self.objects_mut().get_mut(id) {
            data.lifecycle = Lifecycle::Live;
        }
        id
    }

    /// Add an object without behaviour of its own.
    pub fn create_plain(&self, parent: Option<ObjectId>) -> ObjectId {
        self.create(PlainObject, parent)
    }

    /// Whether `id` refers to an object of this system.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects().contains(id)
    }

    /// Number of objects in the system.
    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    /// Objects without a parent.
    pub fn roots(&self) -> Vec<ObjectId> {
        self.objects().roots()
    }

    /// The lifecycle state, `None` once the object is gone.
    pub fn lifecycle(&self, id: ObjectId) -> Option<Lifecycle> {
        self.with_object(id, |data| data.lifecycle)
    }

    /// Destroy an object and its whole subtree.
    ///
    /// In order: `destroyed` is emitted (with signals unblocked), every
    /// connection of the object is removed, children are destroyed, the
    /// object leaves its parent, its timers are killed and its queued events
    /// discarded. Returns `false` when the object does not exist or its
    /// destruction is already under way.
    #[tracing::instrument(skip(self), target = "trellis_core::object", level = "trace")]
    pub fn destroy(&self, id: ObjectId) -> bool {
        let thread = {
            let mut objects = self.objects_mut();
            let Some(data) = objects.get_mut(id) else {
                return false;
            };
            if data.lifecycle == Lifecycle::Destroying {
                return false;
            }
            data.lifecycle = Lifecycle::Destroying;
            data.signals_blocked = false;
            data.thread.clone()
        };
        self.warn_if_foreign(id, &thread, "destroy");

        let emitted = panic::catch_unwind(AssertUnwindSafe(|| self.emit(id, &DESTROYED, (id,))));
        if let Err(payload) = emitted {
            tracing::error!(
                target: "trellis_core::object",
                ?id,
                panic = panic_message(payload.as_ref()),
                "slot connected to destroyed panicked; continuing teardown"
            );
        }

        if let Some(data) = self.objects_mut().get_mut(id) {
            data.was_deleted = true;
        }

        let connections = self.shared.connections.lock().remove_object(id);
        drop(connections);

        self.delete_children(id);

        let notify = detach_from_parent(&mut self.objects_mut(), id);
        if let Some(parent) = notify {
            self.send_event(parent, &mut Event::Child(ChildEvent::Removed(id)));
        }

        let (thread, pending_timer) = match self.with_object(id, |data| (data.thread.clone(), data.pending_timer)) {
            Some(state) => state,
            None => (thread, false),
        };
        if pending_timer {
            thread.unregister_object_timers(&self.downgrade(), id);
        }

        self.remove_posted_events(id, None);

        let record = self.objects_mut().remove(id);
        drop(record);
        tracing::debug!(target: "trellis_core::object", ?id, "object destroyed");
        true
    }

    fn delete_children(&self, id: ObjectId) {
        match self.objects_mut().get_mut(id) {
            Some(data) => data.deleting_children = true,
            None => return,
        }

        let mut index = 0;
        loop {
            let child = {
                let mut objects = self.objects_mut();
                let Some(data) = objects.get_mut(id) else {
                    break;
                };
                if index >= data.children.len() {
                    break;
                }
                let child = data.children[index].take();
                data.current_child_being_deleted = child;
                child
            };
            index += 1;
            if let Some(child) = child {
                self.destroy(child);
            }
        }

        if let Some(data) = self.objects_mut().get_mut(id) {
            data.children.clear();
            data.current_child_being_deleted = None;
            data.deleting_children = false;
        }
    }

    /// Schedule the object for destruction by its thread's event loop.
    ///
    /// Posting twice before delivery has the effect of posting once.
    pub fn delete_later(&self, id: ObjectId) -> bool {
        self.post_event(id, Event::DeferredDelete)
    }

    /// Destroy every object, roots first.
    pub fn shutdown(&self) {
        loop {
            let roots = self.roots();
            if roots.is_empty() {
                break;
            }
            let destroyed = roots.into_iter().filter(|root| self.destroy(*root)).count();
            if destroyed == 0 {
                break;
            }
        }
        tracing::debug!(target: "trellis_core::object", remaining = self.object_count(), "object system shut down");
    }

    // =========================================================================
    // Behaviour access
    // =========================================================================

    /// The object's behaviour as its concrete type.
    pub fn handler<T: Object>(&self, id: ObjectId) -> Option<Arc<T>> {
        let any = self.with_object(id, |data| data.any.clone())?;
        any.downcast::<T>().ok()
    }

    pub(crate) fn handler_dyn(&self, id: ObjectId) -> Option<Arc<dyn Object>> {
        self.with_object(id, |data| data.handler.clone())
    }

    /// The object's class metadata.
    pub fn meta_object(&self, id: ObjectId) -> Option<&'static MetaObject> {
        self.with_object(id, |data| data.meta)
    }

    /// The object's class name.
    pub fn class_name(&self, id: ObjectId) -> Option<&'static str> {
        self.meta_object(id).map(MetaObject::class_name)
    }

    /// Whether the object's class is, or derives from, `class_name`.
    pub fn inherits(&self, id: ObjectId, class_name: &str) -> bool {
        self.meta_object(id).is_some_and(|meta| meta.inherits_name(class_name))
    }

    // =========================================================================
    // Tree
    // =========================================================================

    /// The object's parent.
    pub fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.with_object(id, |data| data.parent).flatten()
    }

    /// The object's children, in insertion order.
    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        self.with_object(id, |data| data.live_children().collect())
            .unwrap_or_default()
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor_of(&self, ancestor: ObjectId, id: ObjectId) -> bool {
        self.objects().is_ancestor_or_self(ancestor, id)
    }

    /// First descendant of `root` named `name`, depth first.
    pub fn find_child(&self, root: ObjectId, name: &str) -> Option<ObjectId> {
        self.objects()
            .find_descendants(root, name, true)
            .into_iter()
            .next()
    }

    /// Every descendant of `root` named `name`, depth first.
    pub fn find_children(&self, root: ObjectId, name: &str) -> Vec<ObjectId> {
        self.objects().find_descendants(root, name, false)
    }

    /// Choose whether the object's parent is told when it joins or leaves.
    pub fn set_send_child_events(&self, id: ObjectId, enabled: bool) -> ObjectResult<()> {
        match self.objects_mut().get_mut(id) {
            Some(data) => {
                data.send_child_events = enabled;
                Ok(())
            }
            None => Err(self.invalid(id, "set_send_child_events")),
        }
    }

    /// Choose whether the object receives [`ChildEvent`]s for its children.
    pub fn set_receive_child_events(&self, id: ObjectId, enabled: bool) -> ObjectResult<()> {
        match self.objects_mut().get_mut(id) {
            Some(data) => {
                data.receive_child_events = enabled;
                Ok(())
            }
            None => Err(self.invalid(id, "set_receive_child_events")),
        }
    }

    /// Send [`ChildEvent::Removed`] to the parent now, while the object is
    /// still intact. The eventual detach then stays silent.
    ///
    /// Returns whether the parent was notified.
    pub fn announce_removal(&self, id: ObjectId) -> bool {
        let parent = {
            let mut objects = self.objects_mut();
            let Some(parent) = objects.get(id).and_then(|data| data.parent) else {
                return false;
            };
            if !objects.get(parent).is_some_and(|data| data.receive_child_events) {
                return false;
            }
            if let Some(data) = objects.get_mut(id) {
                data.sent_child_removed = true;
            }
            parent
        };
        self.send_event(parent, &mut Event::Child(ChildEvent::Removed(id)));
        true
    }

    /// Move `child` under `parent`, or make it a root with `None`.
    ///
    /// The old parent gets [`ChildEvent::Removed`] and the new one
    /// [`ChildEvent::Added`] (unless the child is a window). When the new
    /// parent lives in another thread the child is left without a parent.
    #[tracing::instrument(skip(self), target = "trellis_core::object", level = "trace")]
    pub fn set_parent(&self, child: ObjectId, parent: Option<ObjectId>) -> ObjectResult<()> {
        let (old_parent, result, handler) = {
            let mut objects = self.objects_mut();
            let Some(data) = objects.get(child) else {
                drop(objects);
                return Err(self.invalid(child, "set_parent"));
            };
            if data.parent == parent {
                return Ok(());
            }
            let child_thread = data.thread.clone();
            let handler = data.handler.clone();
            self.warn_if_foreign(child, &child_thread, "set_parent");

            let parent_thread = match parent {
                Some(p) => match objects.get(p) {
                    Some(parent_data) => Some(parent_data.thread.clone()),
                    None => {
                        drop(objects);
                        return Err(self.invalid(p, "set_parent"));
                    }
                },
                None => None,
            };
            if let Some(p) = parent {
                if objects.is_ancestor_or_self(child, p) {
                    tracing::warn!(target: "trellis_core::object", ?child, parent = ?p, "cannot parent an object under itself or a descendant");
                    return Err(ObjectError::CircularParentage { child, parent: p });
                }
            }

            let old_parent = detach_from_parent(&mut objects, child);

            let result = match (parent, parent_thread) {
                (Some(p), Some(parent_thread)) if !check_parent_thread(&parent_thread, &child_thread) => {
                    tracing::warn!(
                        target: "trellis_core::thread",
                        ?child,
                        parent = ?p,
                        "cannot set parent: new parent lives in a different thread"
                    );
                    Err(ObjectError::ThreadMismatch { child, parent: p })
                }
                (Some(p), _) => {
                    let mut listening = false;
                    if let Some(parent_data) = objects.get_mut(p) {
                        parent_data.children.push(Some(child));
                        listening = parent_data.receive_child_events;
                    }
                    let mut sending = false;
                    if let Some(data) = objects.get_mut(child) {
                        data.parent = Some(p);
                        data.sent_child_removed = false;
                        sending = data.send_child_events;
                    }
                    Ok(Some((p, sending && listening)))
                }
                (None, _) => Ok(None),
            };
            (old_parent, result, handler)
        };

        if let Some(old) = old_parent {
            self.send_event(old, &mut Event::Child(ChildEvent::Removed(child)));
        }
        match result {
            Ok(Some((new_parent, announce))) => {
                tracing::trace!(target: "trellis_core::object", ?child, parent = ?new_parent, "parent set");
                if announce && !handler.is_window_type() {
                    self.send_event(new_parent, &mut Event::Child(ChildEvent::Added(child)));
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Names and properties
    // =========================================================================

    /// The object's name; empty when never set.
    pub fn object_name(&self, id: ObjectId) -> Option<String> {
        self.with_object(id, |data| data.name.clone())
    }

    /// Rename the object, emitting `object_name_changed` on change.
    ///
    /// Returns whether the name changed.
    pub fn set_object_name(&self, id: ObjectId, name: impl Into<String>) -> bool {
        let name = name.into();
        {
            let mut objects = self.objects_mut();
            let Some(data) = objects.get_mut(id) else {
                return false;
            };
            if data.name == name {
                return false;
            }
            data.name.clone_from(&name);
        }
        self.emit(id, &OBJECT_NAME_CHANGED, (name,));
        true
    }

    /// Read a property: the static one if the class declares it, else the
    /// dynamic one, else [`Value::Invalid`].
    pub fn property(&self, id: ObjectId, name: &str) -> Value {
        let Some((handler, meta, dynamic)) = self.with_object(id, |data| {
            (
                data.handler.clone(),
                data.meta,
                data.dynamic_property(name).cloned(),
            )
        }) else {
            return Value::Invalid;
        };
        match meta.property(name) {
            Some(property) => property.read(handler.as_ref()),
            None => dynamic.unwrap_or_default(),
        }
    }

    /// Write a property.
    ///
    /// Static properties go through their setter. Any other name is a dynamic
    /// property: set to [`Value::Invalid`] to remove it. A dynamic change
    /// posts [`Event::DynamicPropertyChange`] to the object.
    #[tracing::instrument(skip(self, value), target = "trellis_core::object", level = "trace")]
    pub fn set_property(&self, id: ObjectId, name: &str, value: Value) -> PropertyResult<()> {
        let Some((handler, meta, thread)) =
            self.with_object(id, |data| (data.handler.clone(), data.meta, data.thread.clone()))
        else {
            return Err(self.invalid(id, "set_property").into());
        };
        self.warn_if_foreign(id, &thread, "set_property");

        if let Some(property) = meta.property(name) {
            return property.write(handler.as_ref(), &value).inspect_err(|err| {
                tracing::warn!(target: "trellis_core::object", ?id, property = name, %err, "cannot write property");
            });
        }

        {
            let mut objects = self.objects_mut();
            let data = objects
                .get_mut(id)
                .ok_or(PropertyError::Object(ObjectError::InvalidObjectId(id)))?;
            let position = data.dynamic_properties.iter().position(|(key, _)| key == name);
            match (position, value.is_valid()) {
                (None, false) => return Err(PropertyError::NotFound(name.to_owned())),
                (Some(index), false) => {
                    data.dynamic_properties.remove(index);
                }
                (Some(index), true) => {
                    if data.dynamic_properties[index].1 == value {
                        return Ok(());
                    }
                    data.dynamic_properties[index].1 = value;
                }
                (None, true) => data.dynamic_properties.push((name.to_owned(), value)),
            }
        }
        self.post_event(id, Event::DynamicPropertyChange(name.to_owned()));
        Ok(())
    }

    /// Names of the dynamic properties, in insertion order.
    pub fn dynamic_property_names(&self, id: ObjectId) -> Vec<String> {
        self.with_object(id, |data| {
            data.dynamic_properties
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    // =========================================================================
    // Signals and connections
    // =========================================================================

    /// Block or unblock emission from the object. Returns the previous flag.
    pub fn block_signals(&self, id: ObjectId, block: bool) -> ObjectResult<bool> {
        let mut objects = self.objects_mut();
        match objects.get_mut(id) {
            Some(data) => Ok(std::mem::replace(&mut data.signals_blocked, block)),
            None => {
                drop(objects);
                Err(self.invalid(id, "block_signals"))
            }
        }
    }

    /// Whether emission from the object is blocked.
    pub fn signals_blocked(&self, id: ObjectId) -> bool {
        self.with_object(id, |data| data.signals_blocked).unwrap_or(false)
    }

    /// Connect a signal to a slot through their typed handles.
    pub fn connect<A: Arguments, B: Arguments>(
        &self,
        sender: ObjectId,
        signal: &Signal<A>,
        receiver: ObjectId,
        slot: &Slot<B>,
        kind: ConnectionType,
    ) -> SignalResult<ConnectionId> {
        self.connect_by_name_with(sender, signal.name(), receiver, slot.name(), kind, false)
    }

    /// Like [`connect`](Self::connect), but fails with
    /// [`SignalError::DuplicateConnection`] if the same connection exists.
    pub fn connect_unique<A: Arguments, B: Arguments>(
        &self,
        sender: ObjectId,
        signal: &Signal<A>,
        receiver: ObjectId,
        slot: &Slot<B>,
        kind: ConnectionType,
    ) -> SignalResult<ConnectionId> {
        self.connect_by_name_with(sender, signal.name(), receiver, slot.name(), kind, true)
    }

    /// Connect by method names, resolved on the sender's and receiver's
    /// classes. The slot may also name a signal of the receiver, which is
    /// then re-emitted.
    pub fn connect_by_name(
        &self,
        sender: ObjectId,
        signal: &str,
        receiver: ObjectId,
        slot: &str,
        kind: ConnectionType,
    ) -> SignalResult<ConnectionId> {
        self.connect_by_name_with(sender, signal, receiver, slot, kind, false)
    }

    fn connect_by_name_with(
        &self,
        sender: ObjectId,
        signal: &str,
        receiver: ObjectId,
        slot: &str,
        kind: ConnectionType,
        unique: bool,
    ) -> SignalResult<ConnectionId> {
        let sender_meta = self
            .meta_object(sender)
            .ok_or_else(|| self.invalid(sender, "connect"))?;
        let receiver_meta = self
            .meta_object(receiver)
            .ok_or_else(|| self.invalid(receiver, "connect"))?;
        let signal_handle = resolve(sender_meta, signal, sender, receiver, signal, slot)?;
        let slot_handle = resolve(receiver_meta, slot, sender, receiver, signal, slot)?;
        self.connect_methods(sender, signal_handle, receiver, slot_handle, kind, unique)
    }

    /// Connect pre-resolved method handles.
    ///
    /// Handles are compared by identity, so the same pair can be connected
    /// and disconnected repeatedly without any name lookup.
    #[tracing::instrument(skip(self), target = "trellis_core::signal", level = "trace")]
    pub fn connect_methods(
        &self,
        sender: ObjectId,
        signal: MethodHandle,
        receiver: ObjectId,
        slot: MethodHandle,
        kind: ConnectionType,
        unique: bool,
    ) -> SignalResult<ConnectionId> {
        let result = self.validate_connection(sender, signal, receiver, slot).and_then(|()| {
            let connection = Connection {
                sender,
                signal,
                receiver,
                slot: SlotTarget::Method(slot),
                kind,
            };
            self.register_connection(connection, unique)
        });
        match &result {
            Ok(id) => {
                tracing::trace!(target: "trellis_core::signal", ?id, "connected");
            }
            Err(err) => {
                tracing::warn!(
                    target: "trellis_core::signal",
                    ?sender,
                    ?receiver,
                    signal = %signal.signature(),
                    slot = %slot.signature(),
                    %err,
                    "connect failed"
                );
            }
        }
        result
    }

    fn validate_connection(
        &self,
        sender: ObjectId,
        signal: MethodHandle,
        receiver: ObjectId,
        slot: MethodHandle,
    ) -> SignalResult<()> {
        let sender_meta = self
            .meta_object(sender)
            .ok_or(ObjectError::InvalidObjectId(sender))?;
        let receiver_meta = self
            .meta_object(receiver)
            .ok_or(ObjectError::InvalidObjectId(receiver))?;
        if signal.kind() != MethodKind::Signal {
            return Err(SignalError::NotASignal(signal.signature()));
        }
        if !sender_meta.inherits(signal.enclosing_class()) {
            return Err(SignalError::ForeignMethod {
                class: sender_meta.class_name(),
                method: signal.signature(),
            });
        }
        if !receiver_meta.inherits(slot.enclosing_class()) {
            return Err(SignalError::ForeignMethod {
                class: receiver_meta.class_name(),
                method: slot.signature(),
            });
        }
        if slot.is_cloned() {
            return Err(SignalError::ClonedSlot(slot.signature()));
        }
        if !arguments_compatible(signal.parameters(), slot.parameters()) {
            return Err(SignalError::IncompatibleArguments {
                signal: signal.signature(),
                slot: slot.signature(),
            });
        }
        Ok(())
    }

    /// Connect a signal to a closure run in the context of `receiver`.
    ///
    /// `receiver` decides the thread the closure runs in for queued
    /// dispatch, and the connection dies with it.
    pub fn connect_fn<A, F>(
        &self,
        sender: ObjectId,
        signal: &Signal<A>,
        receiver: ObjectId,
        kind: ConnectionType,
        body: F,
    ) -> SignalResult<ConnectionId>
    where
        A: Arguments,
        F: Fn(&SlotContext<'_>, A) + Send + Sync + 'static,
    {
        let sender_meta = self
            .meta_object(sender)
            .ok_or_else(|| self.invalid(sender, "connect_fn"))?;
        if !self.contains(receiver) {
            return Err(self.invalid(receiver, "connect_fn").into());
        }
        let handle = sender_meta
            .method(signal.name())
            .ok_or_else(|| SignalError::UnknownMethod {
                class: sender_meta.class_name(),
                name: signal.name().to_owned(),
            })
            .and_then(|handle| {
                if handle.kind() == MethodKind::Signal {
                    Ok(handle)
                } else {
                    Err(SignalError::NotASignal(handle.signature()))
                }
            })
            .inspect_err(|err| {
                tracing::warn!(target: "trellis_core::signal", ?sender, ?receiver, signal = signal.name(), %err, "connect failed");
            })?;

        let name = signal.name();
        let invoker: Invoker = Arc::new(move |cx: &SlotContext<'_>, values: &[Value]| match A::from_values(values) {
            Some(args) => body(cx, args),
            None => {
                tracing::warn!(target: "trellis_core::signal", signal = name, "closure arguments could not be decoded");
            }
        });
        let connection = Connection {
            sender,
            signal: handle,
            receiver,
            slot: SlotTarget::closure(invoker),
            kind,
        };
        self.register_connection(connection, false).inspect_err(|err| {
            tracing::warn!(target: "trellis_core::signal", ?sender, ?receiver, signal = name, %err, "connect failed");
        })
    }

    /// Insert a validated connection.
    ///
    /// Both endpoints are checked again under the registry lock, so a
    /// connection never outlives the purge `destroy` runs on its endpoints.
    fn register_connection(&self, connection: Connection, unique: bool) -> SignalResult<ConnectionId> {
        let mut connections = self.shared.connections.lock();
        {
            let objects = self.objects();
            for id in [connection.sender, connection.receiver] {
                match objects.get(id) {
                    None => return Err(ObjectError::InvalidObjectId(id).into()),
                    Some(data) if data.was_deleted || data.lifecycle == Lifecycle::Destroying => {
                        return Err(ObjectError::BeingDestroyed(id).into());
                    }
                    Some(_) => {}
                }
            }
        }
        connections.insert(connection, unique)
    }

    /// Remove connections of `sender`.
    ///
    /// `None` acts as a wildcard: no signal means every signal, no receiver
    /// every receiver, no slot every slot of the receiver. A slot without a
    /// receiver is rejected. Returns whether anything was disconnected.
    pub fn disconnect(
        &self,
        sender: ObjectId,
        signal: Option<MethodHandle>,
        receiver: Option<ObjectId>,
        slot: Option<MethodHandle>,
    ) -> bool {
        if slot.is_some() && receiver.is_none() {
            tracing::warn!(target: "trellis_core::signal", ?sender, "disconnect: a slot requires a receiver");
            return false;
        }
        let slot = slot.map(SlotTarget::Method);
        let removed = self
            .shared
            .connections
            .lock()
            .disconnect_matching(sender, signal, receiver, slot.as_ref());
        let any = !removed.is_empty();
        tracing::trace!(target: "trellis_core::signal", ?sender, removed = removed.len(), "disconnected");
        drop(removed);
        any
    }

    /// Disconnect by names. Unknown names disconnect nothing.
    pub fn disconnect_by_name(
        &self,
        sender: ObjectId,
        signal: Option<&str>,
        receiver: Option<ObjectId>,
        slot: Option<&str>,
    ) -> bool {
        let Some(sender_meta) = self.meta_object(sender) else {
            return false;
        };
        let signal = match signal {
            Some(name) => match sender_meta.method(name) {
                Some(handle) => Some(handle),
                None => return false,
            },
            None => None,
        };
        let slot = match (slot, receiver) {
            (Some(name), Some(receiver)) => match self.meta_object(receiver).and_then(|meta| meta.method(name)) {
                Some(handle) => Some(handle),
                None => return false,
            },
            (Some(_), None) => {
                tracing::warn!(target: "trellis_core::signal", ?sender, "disconnect: a slot requires a receiver");
                return false;
            }
            (None, _) => None,
        };
        self.disconnect(sender, signal, receiver, slot)
    }

    /// Remove one connection.
    pub fn disconnect_connection(&self, id: ConnectionId) -> bool {
        let removed = self.shared.connections.lock().remove(id);
        removed.is_some()
    }

    /// Guard disconnecting `id` when dropped.
    pub fn connection_guard(&self, id: ConnectionId) -> ConnectionGuard {
        ConnectionGuard::new(self, id)
    }

    /// Number of connections on (`sender`, `signal`).
    pub fn receivers<A>(&self, sender: ObjectId, signal: &Signal<A>) -> usize {
        self.signal_handle(sender, signal.name())
            .map_or(0, |handle| self.shared.connections.lock().receivers(sender, handle))
    }

    /// Whether anything is connected to (`sender`, `signal`).
    pub fn is_signal_connected<A>(&self, sender: ObjectId, signal: &Signal<A>) -> bool {
        self.receivers(sender, signal) > 0
    }

    /// Connections where the object is sender or receiver.
    pub fn connection_count(&self, id: ObjectId) -> usize {
        self.shared.connections.lock().connection_count(id)
    }

    fn signal_handle(&self, sender: ObjectId, name: &str) -> Option<MethodHandle> {
        self.meta_object(sender)?
            .method(name)
            .filter(|handle| handle.kind() == MethodKind::Signal)
    }

    pub(crate) fn connection_snapshot(&self, sender: ObjectId, signal: MethodHandle) -> Vec<(ConnectionId, Connection)> {
        self.shared.connections.lock().matching(sender, signal)
    }

    pub(crate) fn has_connection(&self, id: ConnectionId) -> bool {
        self.shared.connections.lock().contains(id)
    }

    /// Emit a signal.
    pub fn emit<A: Arguments>(&self, sender: ObjectId, signal: &Signal<A>, args: A) {
        signal::emit_typed(self, sender, signal, args);
    }

    /// Emit a signal through its resolved handle with dynamic arguments.
    pub fn emit_method(&self, sender: ObjectId, signal: MethodHandle, args: Vec<Value>) {
        if signal.kind() != MethodKind::Signal {
            tracing::warn!(target: "trellis_core::signal", method = %signal.signature(), "emit_method: not a signal");
            return;
        }
        signal::emit(self, sender, signal, args);
    }

    /// Invoke a slot of `receiver` directly, outside any connection.
    pub fn invoke_method(&self, receiver: ObjectId, slot: MethodHandle, args: &[Value]) -> bool {
        signal::invoke_slot(self, receiver, &SlotTarget::Method(slot), None, None, args)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Deliver an event synchronously.
    ///
    /// Event filters installed on the target run first, most recent first;
    /// a filter returning `true` consumes the event. Then the target's
    /// [`Object::event`] hook runs. Returns whether the event was consumed.
    pub fn send_event(&self, target: ObjectId, event: &mut Event) -> bool {
        let Some((handler, filters, thread)) = self.with_object(target, |data| {
            (data.handler.clone(), data.event_filters.clone(), data.thread.clone())
        }) else {
            return false;
        };
        self.warn_if_foreign(target, &thread, "send_event");

        for filter in filters {
            let Some(filter_handler) = self.handler_dyn(filter) else {
                continue;
            };
            let cx = EventContext::new(self, filter, filter_handler.as_ref());
            if filter_handler.event_filter(&cx, target, event) {
                tracing::trace!(target: "trellis_core::event", ?target, ?filter, kind = ?event.kind(), "event filtered");
                return true;
            }
            if !self.contains(target) {
                return false;
            }
        }

        let cx = EventContext::new(self, target, handler.as_ref());
        handler.event(&cx, event)
    }

    /// Queue an event for the target's thread at normal priority.
    ///
    /// Returns `false` when the target does not exist or is being destroyed.
    /// Once a [`delete_later`](Self::delete_later) is queued for the target,
    /// earlier events for it are discarded and later ones are refused.
    pub fn post_event(&self, target: ObjectId, event: Event) -> bool {
        self.post_event_with_priority(target, event, EventPriority::Normal)
    }

    /// Queue an event for the target's thread.
    pub fn post_event_with_priority(&self, target: ObjectId, event: Event, priority: EventPriority) -> bool {
        loop {
            let Some((thread, deleted)) = self.with_object(target, |data| (data.thread.clone(), data.was_deleted)) else {
                tracing::warn!(target: "trellis_core::event", ?target, kind = ?event.kind(), "cannot post event: object does not exist");
                return false;
            };
            if deleted {
                return false;
            }

            let mut queue = thread.data().queue.lock();
            // The object may have changed threads before the lock was taken.
            let still_there = self.with_object(target, |data| data.thread == thread);
            match still_there {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    drop(queue);
                    return false;
                }
            }

            let kind = event.kind();
            let admission = queue.add(PostedEvent {
                target,
                system: self.downgrade(),
                event,
                priority,
            });
            let queued = match admission {
                Admission::Queued { voided } => {
                    tracing::trace!(target: "trellis_core::event", ?target, ?kind, ?priority, "event posted");
                    thread.notify_locked();
                    drop(queue);
                    drop(voided);
                    true
                }
                Admission::Compressed(duplicate) => {
                    drop(queue);
                    drop(duplicate);
                    true
                }
                Admission::Refused(refused) => {
                    drop(queue);
                    drop(refused);
                    false
                }
            };
            return queued;
        }
    }

    /// Discard queued events for `target`, optionally only one kind.
    ///
    /// Discarded blocking calls release their emitter. Returns the number of
    /// events removed.
    pub fn remove_posted_events(&self, target: ObjectId, kind: Option<EventKind>) -> usize {
        loop {
            let Some(thread) = self.with_object(target, |data| data.thread.clone()) else {
                return 0;
            };
            let mut queue = thread.data().queue.lock();
            if self.with_object(target, |data| data.thread == thread) == Some(false) {
                continue;
            }
            let removed = queue.remove_for(&self.downgrade(), target, kind);
            drop(queue);
            let count = removed.len();
            drop(removed);
            return count;
        }
    }

    /// Deliver the calling thread's posted events, or only those for
    /// `target`.
    ///
    /// Events posted while this runs wait for the next call. Returns the
    /// number of events delivered.
    pub fn send_posted_events(&self, target: Option<ObjectId>) -> usize {
        let current = ThreadHandle::current();
        match target {
            None => queue::send_posted_events(&current, None),
            Some(target) => {
                let Some(thread) = self.with_object(target, |data| data.thread.clone()) else {
                    return 0;
                };
                if thread != current {
                    tracing::warn!(target: "trellis_core::event", ?target, "cannot send posted events for an object in another thread");
                    return 0;
                }
                let weak = self.downgrade();
                queue::send_posted_events(&current, Some(DeliveryFilter { system: &weak, target }))
            }
        }
    }

    /// Route `event` through `filter` before it reaches `target`.
    ///
    /// Both objects must live in the same thread. Installing a filter again
    /// moves it to the front.
    pub fn install_event_filter(&self, target: ObjectId, filter: ObjectId) -> ObjectResult<()> {
        let mut objects = self.objects_mut();
        let Some(filter_thread) = objects.get(filter).map(|data| data.thread.clone()) else {
            drop(objects);
            return Err(self.invalid(filter, "install_event_filter"));
        };
        let Some(data) = objects.get_mut(target) else {
            drop(objects);
            return Err(self.invalid(target, "install_event_filter"));
        };
        if data.thread != filter_thread {
            tracing::warn!(target: "trellis_core::event", ?target, ?filter, "cannot filter events for objects in a different thread");
            return Err(ObjectError::FilterThreadMismatch { target, filter });
        }
        data.event_filters.retain(|existing| *existing != filter);
        data.event_filters.insert(0, filter);
        Ok(())
    }

    /// Stop filtering `target`'s events through `filter`.
    pub fn remove_event_filter(&self, target: ObjectId, filter: ObjectId) -> bool {
        let mut objects = self.objects_mut();
        let Some(data) = objects.get_mut(target) else {
            return false;
        };
        let before = data.event_filters.len();
        data.event_filters.retain(|existing| *existing != filter);
        data.event_filters.len() != before
    }

    /// Default event routing behind [`EventContext::dispatch`].
    pub(crate) fn default_event(&self, cx: &EventContext<'_>, event: &mut Event) -> bool {
        let id = cx.id();
        let object = cx.object();
        match event {
            Event::Timer(timer) => {
                object.timer_event(cx, *timer);
                true
            }
            Event::Child(child) => {
                object.child_event(cx, *child);
                true
            }
            Event::DeferredDelete => {
                self.destroy(id);
                true
            }
            Event::MetaCall(call) => {
                let completion = call.completion.take();
                signal::invoke_slot(self, id, &call.slot, call.sender, call.signal, &call.args);
                if let Some(completion) = completion {
                    completion.complete();
                }
                true
            }
            Event::ThreadChange => {
                let timers = self.park_timers(id);
                if !timers.is_empty() {
                    self.post_event(id, Event::TimerReregistration(TimerReregistration { timers }));
                }
                true
            }
            Event::TimerReregistration(reregistration) => {
                let timers = std::mem::take(&mut reregistration.timers);
                self.restore_timers(id, timers);
                true
            }
            Event::User(_) => {
                object.custom_event(cx, event);
                true
            }
            Event::DynamicPropertyChange(_) => false,
        }
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// The affinity record of the object's thread.
    pub fn thread(&self, id: ObjectId) -> ObjectResult<ThreadHandle> {
        self.with_object(id, |data| data.thread.clone())
            .ok_or(ObjectError::InvalidObjectId(id))
    }

    /// Move a parentless object and its subtree to another thread.
    ///
    /// Must be called from the object's thread; an object without a thread
    /// may be pulled by the target thread itself. The subtree first receives
    /// [`Event::ThreadChange`], then its queued events move to the target
    /// queue in order. `None` leaves the subtree without a thread.
    #[tracing::instrument(skip(self, target), target = "trellis_core::thread", level = "trace")]
    pub fn move_to_thread(&self, id: ObjectId, target: Option<&ThreadHandle>) -> ObjectResult<()> {
        let Some((source, parent, handler)) =
            self.with_object(id, |data| (data.thread.clone(), data.parent, data.handler.clone()))
        else {
            return Err(self.invalid(id, "move_to_thread"));
        };

        match target {
            Some(target) if *target == source => return Ok(()),
            None if !source.is_bound() => return Ok(()),
            _ => {}
        }
        if parent.is_some() {
            tracing::warn!(target: "trellis_core::thread", ?id, "cannot move objects with a parent");
            return Err(ObjectError::MoveParented(id));
        }
        if handler.is_window_type() {
            tracing::warn!(target: "trellis_core::thread", ?id, "window objects cannot be moved to another thread");
            return Err(ObjectError::MoveWindow(id));
        }
        let calling = ThreadHandle::current();
        let pulled_by_target = !source.is_bound() && target.is_some_and(|t| *t == calling);
        if !pulled_by_target && source != calling {
            tracing::warn!(
                target: "trellis_core::thread",
                ?id,
                object_thread = ?source.thread_id(),
                current_thread = ?std::thread::current().id(),
                "current thread is not the object's thread; cannot move to target thread"
            );
            return Err(ObjectError::WrongThread(id));
        }

        let target = target.cloned().unwrap_or_else(ThreadHandle::unbound);

        let announced = self.objects().preorder(id);
        for object in announced {
            self.send_event(object, &mut Event::ThreadChange);
        }

        // Handlers may have changed the subtree.
        let subtree = self.objects().preorder(id);
        let members: HashSet<ObjectId> = subtree.iter().copied().collect();
        let weak = self.downgrade();
        let moved = {
            let (mut from, mut to) = ThreadHandle::lock_queues(&source, &target);
            let events = from.take_for(&weak, &members);
            let moved = events.len();
            for event in events {
                to.append(event);
            }
            {
                let mut objects = self.objects_mut();
                for member in &subtree {
                    if let Some(data) = objects.get_mut(*member) {
                        data.thread = target.clone();
                    }
                }
            }
            if moved > 0 {
                target.notify_locked();
            }
            moved
        };

        tracing::debug!(
            target: "trellis_core::thread",
            ?id,
            objects = subtree.len(),
            events = moved,
            to = ?target.thread_id(),
            "moved to thread"
        );
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Start a repeating timer delivering [`Event::Timer`] every `interval`.
    ///
    /// Must be called from the object's thread, and that thread must run an
    /// [`EventLoop`](crate::EventLoop). Returns `None` otherwise.
    pub fn start_timer(&self, id: ObjectId, interval: Duration) -> Option<TimerId> {
        let Some(thread) = self.with_object(id, |data| data.thread.clone()) else {
            self.invalid(id, "start_timer");
            return None;
        };
        if !thread.is_current() {
            tracing::warn!(target: "trellis_core::timer", ?id, "timers cannot be started from another thread");
            return None;
        }
        if !thread.has_event_loop() {
            tracing::warn!(target: "trellis_core::timer", ?id, "timers can only be used with threads running an event loop");
            return None;
        }
        let timer = TimerId::next();
        if !thread.register_timer(timer, self.downgrade(), id, interval) {
            return None;
        }
        if let Some(data) = self.objects_mut().get_mut(id) {
            data.pending_timer = true;
        }
        Some(timer)
    }

    /// Stop a timer. Killing an unknown timer is a no-op returning `false`.
    pub fn kill_timer(&self, id: ObjectId, timer: TimerId) -> bool {
        let Some(thread) = self.with_object(id, |data| data.thread.clone()) else {
            return false;
        };
        if !thread.is_current() {
            tracing::warn!(target: "trellis_core::timer", ?id, ?timer, "timers cannot be stopped from another thread");
            return false;
        }
        thread.unregister_timer(timer, &self.downgrade(), id)
    }

    fn park_timers(&self, id: ObjectId) -> Vec<TimerInfo> {
        let Some((thread, pending)) = self.with_object(id, |data| (data.thread.clone(), data.pending_timer)) else {
            return Vec::new();
        };
        if !pending {
            return Vec::new();
        }
        let timers = thread.unregister_object_timers(&self.downgrade(), id);
        if let Some(data) = self.objects_mut().get_mut(id) {
            data.pending_timer = false;
        }
        tracing::trace!(target: "trellis_core::timer", ?id, count = timers.len(), "timers parked for thread change");
        timers
    }

    fn restore_timers(&self, id: ObjectId, timers: Vec<TimerInfo>) {
        let Some(thread) = self.with_object(id, |data| data.thread.clone()) else {
            return;
        };
        let weak = self.downgrade();
        let mut restored = 0;
        for info in &timers {
            if thread.register_timer(info.id, weak.clone(), id, info.interval) {
                restored += 1;
            }
        }
        if restored < timers.len() {
            tracing::warn!(target: "trellis_core::timer", ?id, lost = timers.len() - restored, "timers dropped: target thread runs no event loop");
        }
        if restored > 0 {
            if let Some(data) = self.objects_mut().get_mut(id) {
                data.pending_timer = true;
            }
        }
    }
}

/// Unlink `child` from its parent.
///
/// Returns the parent to notify with [`ChildEvent::Removed`], if any.
fn detach_from_parent(objects: &mut ObjectRegistry, child: ObjectId) -> Option<ObjectId> {
    let (parent, was_deleted, announce) = objects
        .get(child)
        .and_then(|data| Some((data.parent?, data.was_deleted, data.send_child_events && !data.sent_child_removed)))?;
    if let Some(data) = objects.get_mut(child) {
        data.parent = None;
    }
    let parent_data = objects.get_mut(parent)?;

    if parent_data.deleting_children && was_deleted && parent_data.current_child_being_deleted == Some(child) {
        // The parent's teardown already cleared the slot.
        return None;
    }
    let index = parent_data.children.iter().position(|slot| *slot == Some(child))?;
    if parent_data.deleting_children {
        parent_data.children[index] = None;
        None
    } else {
        parent_data.children.remove(index);
        let listening = parent_data.receive_child_events && parent_data.lifecycle != Lifecycle::Destroying;
        (announce && listening).then_some(parent)
    }
}

fn resolve(
    meta: &'static MetaObject,
    name: &str,
    sender: ObjectId,
    receiver: ObjectId,
    signal: &str,
    slot: &str,
) -> SignalResult<MethodHandle> {
    meta.method(name).ok_or_else(|| {
        tracing::warn!(
            target: "trellis_core::signal",
            ?sender,
            ?receiver,
            signal,
            slot,
            class = meta.class_name(),
            missing = name,
            "connect failed: no such method"
        );
        SignalError::UnknownMethod {
            class: meta.class_name(),
            name: name.to_owned(),
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
