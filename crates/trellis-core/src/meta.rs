//! Explicit class metadata.
//!
//! Classes describe their signals, slots and properties once, through
//! [`MetaObjectBuilder`], into a `'static` [`MetaObject`]. Connections refer to
//! methods through [`MethodHandle`]s resolved from that table, so a handle can
//! be stored and reused without ever looking the name up again.
//!
//! # Example
//!
//! ```
//! use std::sync::LazyLock;
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use trellis_core::{MetaObject, Object, Signal, Slot};
//!
//! pub const VALUE_CHANGED: Signal<(i64,)> = Signal::new("value_changed");
//! pub const SET_VALUE: Slot<(i64,)> = Slot::new("set_value");
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: AtomicI64,
//! }
//!
//! static COUNTER_META: LazyLock<MetaObject> = LazyLock::new(|| {
//!     MetaObject::builder("Counter")
//!         .signal(&VALUE_CHANGED)
//!         .slot(&SET_VALUE, |this: &Counter, (v,)| {
//!             this.value.store(v, Ordering::SeqCst);
//!         })
//!         .property("value", |this: &Counter| this.value.load(Ordering::SeqCst))
//!         .build()
//! });
//!
//! impl Object for Counter {
//!     fn meta_object(&self) -> &'static MetaObject {
//!         &COUNTER_META
//!     }
//! }
//!
//! assert!(COUNTER_META.method("set_value").is_some());
//! assert!(COUNTER_META.method("destroyed").is_some());
//! ```

use std::fmt;
use std::ptr;
use std::sync::{Arc, LazyLock};

use crate::error::PropertyError;
use crate::object::{Object, ObjectId};
use crate::signal::{Signal, Slot, SlotContext};
use crate::value::{Arguments, Value, ValueType, Variant, signature};

/// Type-erased slot body.
pub(crate) type Invoker = Arc<dyn Fn(&SlotContext<'_>, &[Value]) + Send + Sync>;

type Getter = Box<dyn Fn(&dyn Object) -> Option<Value> + Send + Sync>;
type Setter = Box<dyn Fn(&dyn Object, &Value) -> Result<(), PropertyError> + Send + Sync>;

/// Emitted at the start of destruction with the dying object's id.
pub const DESTROYED: Signal<(ObjectId,)> = Signal::new("destroyed");

/// Emitted after `set_object_name` changed the name.
pub const OBJECT_NAME_CHANGED: Signal<(String,)> = Signal::new("object_name_changed");

/// Schedules the receiver for deferred deletion.
pub const DELETE_LATER: Slot<()> = Slot::new("delete_later");

static BASE_META: LazyLock<MetaObject> = LazyLock::new(|| MetaObject {
    class_name: "Object",
    super_class: None,
    methods: vec![
        MethodMeta::signal(DESTROYED.name(), <(ObjectId,)>::types()),
        MethodMeta::signal(OBJECT_NAME_CHANGED.name(), <(String,)>::types()),
        MethodMeta {
            name: DELETE_LATER.name().to_owned(),
            kind: MethodKind::Slot,
            parameters: Vec::new(),
            cloned: false,
            invoker: Some(Arc::new(|cx: &SlotContext<'_>, _: &[Value]| {
                cx.system().delete_later(cx.receiver());
            })),
        },
    ],
    properties: Vec::new(),
});

/// What a method is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Can be emitted and connected from.
    Signal,
    /// Can be connected to.
    Slot,
}

/// Description of one signal or slot.
pub struct MethodMeta {
    name: String,
    kind: MethodKind,
    parameters: Vec<ValueType>,
    cloned: bool,
    invoker: Option<Invoker>,
}

impl MethodMeta {
    fn signal(name: &str, parameters: Vec<ValueType>) -> Self {
        Self {
            name: name.to_owned(),
            kind: MethodKind::Signal,
            parameters,
            cloned: false,
            invoker: None,
        }
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a signal or a slot.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Parameter types, in order.
    pub fn parameters(&self) -> &[ValueType] {
        &self.parameters
    }

    /// Whether this entry is a synthetic overload describing a call with
    /// trailing default arguments left out.
    pub fn is_cloned(&self) -> bool {
        self.cloned
    }

    /// Human-readable signature.
    pub fn signature(&self) -> String {
        signature(&self.name, &self.parameters)
    }

    pub(crate) fn invoker(&self) -> Option<&Invoker> {
        self.invoker.as_ref()
    }
}

impl fmt::Debug for MethodMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMeta")
            .field("signature", &self.signature())
            .field("kind", &self.kind)
            .field("cloned", &self.cloned)
            .finish()
    }
}

/// Description of a statically declared property.
pub struct MetaProperty {
    name: String,
    value_type: ValueType,
    getter: Getter,
    setter: Option<Setter>,
}

impl MetaProperty {
    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Whether the property can be written.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    pub(crate) fn read(&self, object: &dyn Object) -> Value {
        (self.getter)(object).unwrap_or_default()
    }

    pub(crate) fn write(&self, object: &dyn Object, value: &Value) -> Result<(), PropertyError> {
        match &self.setter {
            Some(setter) => setter(object, value),
            None => Err(PropertyError::ReadOnly(self.name.clone())),
        }
    }
}

impl fmt::Debug for MetaProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaProperty")
            .field("name", &self.name)
            .field("type", &self.value_type)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Class metadata: name, superclass and declared members.
pub struct MetaObject {
    class_name: &'static str,
    super_class: Option<&'static MetaObject>,
    methods: Vec<MethodMeta>,
    properties: Vec<MetaProperty>,
}

impl MetaObject {
    /// Metadata of the root class every object derives from.
    ///
    /// Declares the `destroyed` and `object_name_changed` signals and the
    /// `delete_later` slot.
    pub fn base() -> &'static MetaObject {
        &BASE_META
    }

    /// Start describing a class that derives from [`MetaObject::base`].
    pub fn builder(class_name: &'static str) -> MetaObjectBuilder {
        MetaObjectBuilder {
            meta: MetaObject {
                class_name,
                super_class: Some(Self::base()),
                methods: Vec::new(),
                properties: Vec::new(),
            },
        }
    }

    /// Class name.
    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    /// Direct superclass, `None` only for the base class.
    pub fn super_class(&self) -> Option<&'static MetaObject> {
        self.super_class
    }

    /// Whether this class is `other` or derives from it.
    pub fn inherits(&self, other: &MetaObject) -> bool {
        self.ancestry().any(|meta| ptr::eq(meta, other))
    }

    /// Whether this class or a superclass is called `class_name`.
    pub fn inherits_name(&self, class_name: &str) -> bool {
        self.ancestry().any(|meta| meta.class_name == class_name)
    }

    /// Look up a method by name, searching superclasses last.
    ///
    /// Cloned overloads are never returned by name; iterate
    /// [`MetaObject::methods`] to reach them.
    pub fn method(&'static self, name: &str) -> Option<MethodHandle> {
        let mut current = Some(self);
        while let Some(meta) = current {
            if let Some(index) = meta
                .methods
                .iter()
                .position(|m| m.name == name && !m.cloned)
            {
                return Some(MethodHandle { meta, index });
            }
            current = meta.super_class;
        }
        None
    }

    /// Handles for the methods declared directly on this class.
    pub fn methods(&'static self) -> impl Iterator<Item = MethodHandle> {
        (0..self.methods.len()).map(move |index| MethodHandle { meta: self, index })
    }

    /// Look up a static property by name, searching superclasses last.
    pub fn property(&self, name: &str) -> Option<&MetaProperty> {
        self.ancestry()
            .find_map(|meta| meta.properties.iter().find(|p| p.name == name))
    }

    /// Names of all static properties, superclass properties first.
    pub fn property_names(&self) -> Vec<&str> {
        let mut chain: Vec<&MetaObject> = self.ancestry().collect();
        chain.reverse();
        chain
            .into_iter()
            .flat_map(|meta| meta.properties.iter().map(|p| p.name.as_str()))
            .collect()
    }

    fn ancestry(&self) -> impl Iterator<Item = &MetaObject> {
        std::iter::successors(Some(self), |meta| meta.super_class.map(|s| s as &MetaObject))
    }
}

impl fmt::Debug for MetaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaObject")
            .field("class_name", &self.class_name)
            .field("super_class", &self.super_class.map(|s| s.class_name))
            .field("methods", &self.methods)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Fluent builder for [`MetaObject`].
pub struct MetaObjectBuilder {
    meta: MetaObject,
}

impl MetaObjectBuilder {
    /// Derive from `super_class` instead of the base class.
    pub fn inherits(mut self, super_class: &'static MetaObject) -> Self {
        self.meta.super_class = Some(super_class);
        self
    }

    /// Declare a signal.
    pub fn signal<A: Arguments>(mut self, signal: &Signal<A>) -> Self {
        self.meta
            .methods
            .push(MethodMeta::signal(signal.name(), A::types()));
        self
    }

    /// Declare a slot implemented by a method of `T`.
    pub fn slot<T, A, F>(self, slot: &Slot<A>, body: F) -> Self
    where
        T: Object,
        A: Arguments,
        F: Fn(&T, A) + Send + Sync + 'static,
    {
        self.slot_with_context(slot, move |this: &T, _cx: &SlotContext<'_>, args: A| {
            body(this, args)
        })
    }

    /// Declare a slot whose body also receives the invocation context
    /// (sender, receiver id and the owning [`ObjectSystem`](crate::ObjectSystem)).
    pub fn slot_with_context<T, A, F>(mut self, slot: &Slot<A>, body: F) -> Self
    where
        T: Object,
        A: Arguments,
        F: Fn(&T, &SlotContext<'_>, A) + Send + Sync + 'static,
    {
        let name = slot.name();
        self.meta.methods.push(MethodMeta {
            name: name.to_owned(),
            kind: MethodKind::Slot,
            parameters: A::types(),
            cloned: false,
            invoker: Some(typed_invoker::<T, A, F>(name, body)),
        });
        self
    }

    /// Declare a slot whose last `defaults` parameters have default values.
    ///
    /// Besides the full slot, one cloned overload is recorded per elided
    /// parameter. Cloned overloads describe the class but cannot be
    /// connected to.
    pub fn slot_with_defaults<T, A, F>(mut self, slot: &Slot<A>, defaults: usize, body: F) -> Self
    where
        T: Object,
        A: Arguments,
        F: Fn(&T, A) + Send + Sync + 'static,
    {
        let params = A::types();
        let name = slot.name();
        self = self.slot(slot, body);
        for dropped in 1..=defaults.min(params.len()) {
            self.meta.methods.push(MethodMeta {
                name: name.to_owned(),
                kind: MethodKind::Slot,
                parameters: params[..params.len() - dropped].to_vec(),
                cloned: true,
                invoker: None,
            });
        }
        self
    }

    /// Declare a read-only property.
    pub fn property<T, V, G>(mut self, name: &str, getter: G) -> Self
    where
        T: Object,
        V: Variant,
        G: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.meta.properties.push(MetaProperty {
            name: name.to_owned(),
            value_type: V::value_type(),
            getter: typed_getter::<T, V, G>(getter),
            setter: None,
        });
        self
    }

    /// Declare a read-write property.
    pub fn property_rw<T, V, G, S>(mut self, name: &str, getter: G, setter: S) -> Self
    where
        T: Object,
        V: Variant,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&T, V) + Send + Sync + 'static,
    {
        let prop_name = name.to_owned();
        let write: Setter = Box::new(move |object: &dyn Object, value: &Value| {
            let Some(this) = object.as_any().downcast_ref::<T>() else {
                return Err(PropertyError::TypeMismatch {
                    name: prop_name.clone(),
                    expected: V::value_type(),
                    found: value.value_type(),
                });
            };
            match V::from_value(value) {
                Some(v) => {
                    setter(this, v);
                    Ok(())
                }
                None => Err(PropertyError::TypeMismatch {
                    name: prop_name.clone(),
                    expected: V::value_type(),
                    found: value.value_type(),
                }),
            }
        });
        self.meta.properties.push(MetaProperty {
            name: name.to_owned(),
            value_type: V::value_type(),
            getter: typed_getter::<T, V, G>(getter),
            setter: Some(write),
        });
        self
    }

    /// Finish the description.
    pub fn build(self) -> MetaObject {
        self.meta
    }
}

fn typed_getter<T, V, G>(getter: G) -> Getter
where
    T: Object,
    V: Variant,
    G: Fn(&T) -> V + Send + Sync + 'static,
{
    Box::new(move |object: &dyn Object| {
        object
            .as_any()
            .downcast_ref::<T>()
            .map(|this| getter(this).into_value())
    })
}

fn typed_invoker<T, A, F>(name: &'static str, body: F) -> Invoker
where
    T: Object,
    A: Arguments,
    F: Fn(&T, &SlotContext<'_>, A) + Send + Sync + 'static,
{
    Arc::new(move |cx: &SlotContext<'_>, values: &[Value]| {
        let Some(this) = cx.receiver_as::<T>() else {
            tracing::warn!(
                target: "trellis_core::signal",
                slot = name,
                receiver = ?cx.receiver(),
                "slot invoked on an object of the wrong class"
            );
            return;
        };
        let Some(args) = A::from_values(values) else {
            tracing::warn!(
                target: "trellis_core::signal",
                slot = name,
                provided = values.len(),
                "slot arguments could not be decoded"
            );
            return;
        };
        body(this, cx, args);
    })
}

/// A resolved reference to one method of a class.
///
/// Two handles are equal when they name the same entry of the same
/// [`MetaObject`].
#[derive(Clone, Copy)]
pub struct MethodHandle {
    meta: &'static MetaObject,
    index: usize,
}

impl MethodHandle {
    /// The method's description.
    pub fn meta_method(&self) -> &'static MethodMeta {
        &self.meta.methods[self.index]
    }

    /// The class declaring the method.
    pub fn enclosing_class(&self) -> &'static MetaObject {
        self.meta
    }

    /// Method name.
    pub fn name(&self) -> &'static str {
        self.meta_method().name()
    }

    /// Signal or slot.
    pub fn kind(&self) -> MethodKind {
        self.meta_method().kind()
    }

    /// Parameter types.
    pub fn parameters(&self) -> &'static [ValueType] {
        self.meta_method().parameters()
    }

    /// Whether this is a cloned overload.
    pub fn is_cloned(&self) -> bool {
        self.meta_method().is_cloned()
    }

    /// Human-readable signature, qualified with the class name.
    pub fn signature(&self) -> String {
        format!("{}::{}", self.meta.class_name, self.meta_method().signature())
    }
}

impl PartialEq for MethodHandle {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.meta, other.meta) && self.index == other.index
    }
}

impl Eq for MethodHandle {}

impl std::hash::Hash for MethodHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        ptr::hash(self.meta, state);
        self.index.hash(state);
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandle({})", self.signature())
    }
}
