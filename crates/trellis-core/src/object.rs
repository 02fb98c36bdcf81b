//! Object model for Trellis.
//!
//! Every object lives in the arena of an [`ObjectSystem`](crate::ObjectSystem)
//! and is addressed by an [`ObjectId`]. The arena record holds the tree links,
//! the thread affinity, the name, dynamic properties and lifecycle flags; the
//! object's behaviour is a user type implementing [`Object`].
//!
//! # Key Types
//!
//! - [`Object`] - Behaviour hooks: event handling, timers, child notifications
//! - [`ObjectId`] - Versioned handle; never resolves to a later object
//! - [`EventContext`] - What a hook knows about the object it runs for
//! - [`PlainObject`] - An object with no behaviour of its own
//!
//! # Related Modules
//!
//! - [`crate::meta`] - Class metadata returned by [`Object::meta_object`]
//! - [`crate::system`] - The operations on objects

use std::any::Any;
use std::sync::Arc;

use slotmap::{SlotMap, new_key_type};

use crate::event::{ChildEvent, Event};
use crate::meta::MetaObject;
use crate::system::ObjectSystem;
use crate::thread::ThreadHandle;
use crate::timer::TimerId;
use crate::value::Value;

new_key_type! {
    /// A unique identifier for an object.
    ///
    /// Ids are versioned: once the object is destroyed its id stays invalid
    /// forever, even if the arena slot is reused. Holding an `ObjectId` is
    /// therefore a weak observation, never ownership.
    pub struct ObjectId;
}

impl ObjectId {
    /// Convert the id to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Rebuild an id from [`ObjectId::as_raw`] output.
    ///
    /// Does not check that the object exists.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// Upcast helper so `&dyn Object` can be downcast to its concrete type.
pub trait AsAny: Any {
    /// `self` as `Any`.
    fn as_any(&self) -> &(dyn Any + 'static);
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &(dyn Any + 'static) {
        self
    }
}

/// Behaviour of an object.
///
/// All hooks take `&self`; objects keep mutable state behind atomics or
/// locks, because hooks may run re-entrantly (a slot emitting a signal
/// connected back to the same object) and the arena never hands out `&mut`.
///
/// Hooks are called without any internal lock held, so they may freely call
/// back into the [`ObjectSystem`].
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use trellis_core::{ChildEvent, EventContext, Object, ObjectSystem};
///
/// #[derive(Default)]
/// struct Panel {
///     children_added: AtomicUsize,
/// }
///
/// impl Object for Panel {
///     fn child_event(&self, _cx: &EventContext<'_>, event: ChildEvent) {
///         if let ChildEvent::Added(_) = event {
///             self.children_added.fetch_add(1, Ordering::SeqCst);
///         }
///     }
/// }
///
/// let system = ObjectSystem::new();
/// let panel = system.create(Panel::default(), None);
/// system.create_plain(Some(panel));
/// let handler = system.handler::<Panel>(panel).unwrap();
/// assert_eq!(handler.children_added.load(Ordering::SeqCst), 1);
/// ```
pub trait Object: AsAny + Send + Sync {
    /// Class metadata: declared signals, slots and properties.
    fn meta_object(&self) -> &'static MetaObject {
        MetaObject::base()
    }

    /// Entry point for every event delivered to this object.
    ///
    /// Returns whether the event was consumed. Overrides should fall back to
    /// [`EventContext::dispatch`] for events they do not handle, otherwise
    /// timers, child notifications, queued slot calls and deferred deletion
    /// stop working for this object.
    fn event(&self, cx: &EventContext<'_>, event: &mut Event) -> bool {
        cx.dispatch(event)
    }

    /// Inspect an event addressed to `watched` before it gets there.
    ///
    /// Called only while this object is installed as an event filter on
    /// `watched`. Returning `true` consumes the event.
    fn event_filter(&self, _cx: &EventContext<'_>, _watched: ObjectId, _event: &mut Event) -> bool {
        false
    }

    /// A timer started on this object fired.
    fn timer_event(&self, _cx: &EventContext<'_>, _timer: TimerId) {}

    /// A child was added or removed.
    fn child_event(&self, _cx: &EventContext<'_>, _event: ChildEvent) {}

    /// A user event arrived.
    fn custom_event(&self, _cx: &EventContext<'_>, _event: &mut Event) {}

    /// Window objects are bound to their platform thread: they cannot move
    /// threads and do not announce themselves to a parent with
    /// [`ChildEvent::Added`].
    fn is_window_type(&self) -> bool {
        false
    }
}

/// An object without behaviour of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainObject;

impl Object for PlainObject {}

/// Where an object is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Thread affinity and parent are being established.
    Constructing,
    /// Normal operation.
    Live,
    /// Destruction has started; `destroyed` has been or is being emitted.
    Destroying,
}

/// The object a hook runs for, and the system it lives in.
pub struct EventContext<'a> {
    system: &'a ObjectSystem,
    id: ObjectId,
    object: &'a dyn Object,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(system: &'a ObjectSystem, id: ObjectId, object: &'a dyn Object) -> Self {
        Self { system, id, object }
    }

    /// The system owning the object.
    pub fn system(&self) -> &'a ObjectSystem {
        self.system
    }

    /// The object's id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The object's behaviour.
    pub fn object(&self) -> &'a dyn Object {
        self.object
    }

    /// Default routing of an event to the specialised hooks.
    ///
    /// - `Timer` goes to [`Object::timer_event`]
    /// - `Child` goes to [`Object::child_event`]
    /// - `DeferredDelete` destroys the object
    /// - `MetaCall` runs the queued slot
    /// - `ThreadChange` parks the object's timers for re-registration
    /// - `User` goes to [`Object::custom_event`]
    ///
    /// Anything else is left unconsumed.
    pub fn dispatch(&self, event: &mut Event) -> bool {
        self.system.default_event(self, event)
    }
}

/// Arena record of one object.
pub(crate) struct ObjectData {
    pub handler: Arc<dyn Object>,
    pub any: Arc<dyn Any + Send + Sync>,
    pub meta: &'static MetaObject,
    pub name: String,
    pub parent: Option<ObjectId>,
    /// Owned children. A slot is `None` while its child is being destroyed
    /// by [`ObjectSystem::destroy`].
    pub children: Vec<Option<ObjectId>>,
    pub current_child_being_deleted: Option<ObjectId>,
    pub deleting_children: bool,
    pub thread: ThreadHandle,
    pub dynamic_properties: Vec<(String, Value)>,
    /// Most recently installed first.
    pub event_filters: Vec<ObjectId>,
    pub lifecycle: Lifecycle,
    pub signals_blocked: bool,
    pub was_deleted: bool,
    pub pending_timer: bool,
    /// Whether the parent hears about this object joining or leaving.
    pub send_child_events: bool,
    pub receive_child_events: bool,
    /// `ChildRemoved` already went out ahead of the actual detach.
    pub sent_child_removed: bool,
}

impl ObjectData {
    pub fn new<T: Object>(object: T, thread: ThreadHandle) -> Self {
        let meta = object.meta_object();
        let concrete = Arc::new(object);
        Self {
            handler: concrete.clone(),
            any: concrete,
            meta,
            name: String::new(),
            parent: None,
            children: Vec::new(),
            current_child_being_deleted: None,
            deleting_children: false,
            thread,
            dynamic_properties: Vec::new(),
            event_filters: Vec::new(),
            lifecycle: Lifecycle::Constructing,
            signals_blocked: false,
            was_deleted: false,
            pending_timer: false,
            send_child_events: true,
            receive_child_events: true,
            sent_child_removed: false,
        }
    }

    pub fn live_children(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn dynamic_property(&self, name: &str) -> Option<&Value> {
        self.dynamic_properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Arena of object records. Pure data: never calls user code.
#[derive(Default)]
pub(crate) struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectData>,
}

impl ObjectRegistry {
    pub fn insert(&mut self, data: ObjectData) -> ObjectId {
        let id = self.objects.insert(data);
        tracing::trace!(target: "trellis_core::object", ?id, "registered object");
        id
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<ObjectData> {
        self.objects.remove(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectData> {
        self.objects.get(id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectData> {
        self.objects.get_mut(id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectData)> {
        self.objects.iter()
    }

    pub fn roots(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: ObjectId, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == ancestor {
                return true;
            }
            current = self.objects.get(current_id).and_then(|d| d.parent);
        }
        false
    }

    /// Pre-order traversal: the object, then each child's subtree in order.
    pub fn preorder(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(data) = self.objects.get(current) else {
                continue;
            };
            result.push(current);
            let children: Vec<ObjectId> = data.live_children().collect();
            stack.extend(children.into_iter().rev());
        }
        result
    }

    /// Depth-first search below `root` for objects named `name`.
    pub fn find_descendants(&self, root: ObjectId, name: &str, first_only: bool) -> Vec<ObjectId> {
        let mut found = Vec::new();
        for id in self.preorder(root).into_iter().skip(1) {
            if self.objects.get(id).is_some_and(|d| d.name == name) {
                found.push(id);
                if first_only {
                    break;
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ObjectData {
        ObjectData::new(PlainObject, ThreadHandle::current())
    }

    fn link(registry: &mut ObjectRegistry, child: ObjectId, parent: ObjectId) {
        registry.get_mut(child).unwrap().parent = Some(parent);
        registry.get_mut(parent).unwrap().children.push(Some(child));
    }

    #[test]
    fn raw_round_trip() {
        let mut registry = ObjectRegistry::default();
        let id = registry.insert(record());
        assert_eq!(ObjectId::from_raw(id.as_raw()), id);
    }

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut registry = ObjectRegistry::default();
        let first = registry.insert(record());
        registry.remove(first);
        let second = registry.insert(record());
        assert_ne!(first, second);
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }

    #[test]
    fn preorder_skips_vacated_slots() {
        let mut registry = ObjectRegistry::default();
        let root = registry.insert(record());
        let a = registry.insert(record());
        let b = registry.insert(record());
        let a1 = registry.insert(record());
        link(&mut registry, a, root);
        link(&mut registry, b, root);
        link(&mut registry, a1, a);
        assert_eq!(registry.preorder(root), vec![root, a, a1, b]);

        registry.get_mut(root).unwrap().children[0] = None;
        assert_eq!(registry.preorder(root), vec![root, b]);
    }

    #[test]
    fn ancestry_and_name_search() {
        let mut registry = ObjectRegistry::default();
        let root = registry.insert(record());
        let mid = registry.insert(record());
        let leaf = registry.insert(record());
        link(&mut registry, mid, root);
        link(&mut registry, leaf, mid);
        registry.get_mut(leaf).unwrap().name = "leaf".into();

        assert!(registry.is_ancestor_or_self(root, leaf));
        assert!(registry.is_ancestor_or_self(leaf, leaf));
        assert!(!registry.is_ancestor_or_self(leaf, root));
        assert_eq!(registry.find_descendants(root, "leaf", true), vec![leaf]);
        assert!(registry.find_descendants(leaf, "leaf", false).is_empty());
        assert_eq!(registry.roots(), vec![root]);
    }
}
