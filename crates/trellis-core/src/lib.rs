//! Core object model for Trellis.
//!
//! This crate provides the foundation every Trellis component builds on:
//!
//! - **Object Tree**: Parent/child ownership with deterministic teardown
//! - **Thread Affinity**: Every object belongs to one thread and can be moved
//! - **Signals and Slots**: Declared per class, connected by handle or name,
//!   dispatched Direct, Queued, BlockingQueued or Auto
//! - **Posted Events**: A priority-ordered queue per thread with compression
//!   and removal
//! - **Event Loops**: Per-thread loops driving timers and posted events
//! - **Properties**: Declared properties plus per-object dynamic properties
//!
//! All operations go through an [`ObjectSystem`], which owns the objects and
//! their connections. Objects are referred to by [`ObjectId`]s, which never
//! keep an object alive and never resolve to a different object after
//! destruction.
//!
//! # Example
//!
//! ```
//! use std::sync::LazyLock;
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use trellis_core::{ConnectionType, MetaObject, Object, ObjectSystem, Signal, Slot, SlotContext};
//!
//! const VALUE_CHANGED: Signal<(i64,)> = Signal::new("value_changed");
//! const SET_VALUE: Slot<(i64,)> = Slot::new("set_value");
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: AtomicI64,
//! }
//!
//! static COUNTER_META: LazyLock<MetaObject> = LazyLock::new(|| {
//!     MetaObject::builder("Counter")
//!         .signal(&VALUE_CHANGED)
//!         .slot_with_context(&SET_VALUE, |this: &Counter, cx: &SlotContext<'_>, (v,)| {
//!             if this.value.swap(v, Ordering::SeqCst) != v {
//!                 cx.system().emit(cx.receiver(), &VALUE_CHANGED, (v,));
//!             }
//!         })
//!         .build()
//! });
//!
//! impl Object for Counter {
//!     fn meta_object(&self) -> &'static MetaObject {
//!         &COUNTER_META
//!     }
//! }
//!
//! let system = ObjectSystem::new();
//! let a = system.create(Counter::default(), None);
//! let b = system.create(Counter::default(), Some(a));
//! system.connect(a, &VALUE_CHANGED, b, &SET_VALUE, ConnectionType::Auto).unwrap();
//! system.connect(b, &VALUE_CHANGED, a, &SET_VALUE, ConnectionType::Auto).unwrap();
//!
//! system.invoke_method(a, COUNTER_META.method("set_value").unwrap(), &[12_i64.into()]);
//! assert_eq!(system.handler::<Counter>(b).unwrap().value.load(Ordering::SeqCst), 12);
//!
//! // Destroying the parent destroys the child and drops both connections.
//! system.destroy(a);
//! assert!(!system.contains(b));
//! ```
//!
//! # Threads
//!
//! ```
//! use trellis_core::{EventLoopThread, ObjectSystem, ThreadHandle};
//!
//! let system = ObjectSystem::new();
//! let worker = EventLoopThread::builder().name("worker").spawn().unwrap();
//! let object = system.create_plain(None);
//! assert_eq!(system.thread(object).unwrap(), ThreadHandle::current());
//!
//! system.move_to_thread(object, Some(worker.thread())).unwrap();
//! assert!(!system.thread(object).unwrap().is_current());
//! ```

pub mod connection;
mod error;
mod event;
pub mod event_loop;
pub mod invocation;
pub mod logging;
pub mod meta;
pub mod object;
mod queue;
pub mod signal;
pub mod system;
mod thread;
mod timer;
mod value;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionType};
pub use error::{
    CoreError, ObjectError, ObjectResult, PropertyError, PropertyResult, Result, SignalError,
    SignalResult,
};
pub use event::{ChildEvent, Event, EventKind, EventPriority, MetaCall, TimerReregistration, UserEvent};
pub use event_loop::{EventLoop, EventLoopConfig, EventLoopHandle, EventLoopThread, EventLoopThreadBuilder};
pub use invocation::{Completion, CompletionWaiter};
pub use logging::{ObjectTreeDebug, TreeFormatOptions, TreeStyle};
pub use meta::{
    DELETE_LATER, DESTROYED, MetaObject, MetaObjectBuilder, MetaProperty, MethodHandle, MethodKind,
    MethodMeta, OBJECT_NAME_CHANGED,
};
pub use object::{AsAny, EventContext, Lifecycle, Object, ObjectId, PlainObject};
pub use signal::{Signal, Slot, SlotContext};
pub use system::ObjectSystem;
pub use thread::{ThreadHandle, are_thread_checks_enabled, check_parent_thread, set_thread_checks_enabled};
pub use timer::TimerId;
pub use value::{Arguments, Value, ValueType, Variant, arguments_compatible, signature};

static_assertions::assert_impl_all!(ObjectSystem: Send, Sync, Clone);
static_assertions::assert_impl_all!(ObjectId: Send, Sync, Copy);
static_assertions::assert_impl_all!(ThreadHandle: Send, Sync, Clone);
static_assertions::assert_impl_all!(Value: Send, Sync, Clone);
static_assertions::assert_impl_all!(Event: Send);
static_assertions::assert_impl_all!(EventLoopHandle: Send, Sync);
static_assertions::assert_impl_all!(ConnectionGuard: Send, Sync);
static_assertions::assert_not_impl_any!(EventLoop: Send, Sync);
