//! Error types for Trellis.
//!
//! Every usage error in the object core is non-fatal: the failing operation
//! logs a warning, leaves state untouched and returns one of these errors.

use crate::object::ObjectId;
use crate::value::ValueType;

/// Result alias used by operations that can fail for more than one reason.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result alias for object tree and thread affinity operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Result alias for connection operations.
pub type SignalResult<T> = std::result::Result<T, SignalError>;

/// Result alias for property access.
pub type PropertyResult<T> = std::result::Result<T, PropertyError>;

/// Errors raised by object tree and thread affinity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// The id does not refer to a live object.
    #[error("object {0:?} does not exist or has been destroyed")]
    InvalidObjectId(ObjectId),

    /// The object is in the middle of its destruction.
    #[error("object {0:?} is being destroyed")]
    BeingDestroyed(ObjectId),

    /// The new parent is the object itself or one of its descendants.
    #[error("cannot parent {child:?} under {parent:?}: that would create a cycle")]
    CircularParentage {
        /// Object being reparented.
        child: ObjectId,
        /// Requested parent.
        parent: ObjectId,
    },

    /// Parent and child live in different threads.
    #[error("cannot parent {child:?} under {parent:?}: parent lives in a different thread")]
    ThreadMismatch {
        /// Object being reparented.
        child: ObjectId,
        /// Requested parent.
        parent: ObjectId,
    },

    /// Only parentless objects can change threads.
    #[error("cannot move object {0:?} to another thread: it has a parent")]
    MoveParented(ObjectId),

    /// Window objects are bound to the platform thread.
    #[error("cannot move window object {0:?} to another thread")]
    MoveWindow(ObjectId),

    /// The operation must be performed from the object's own thread.
    #[error("object {0:?} can only be accessed from the thread it lives in")]
    WrongThread(ObjectId),

    /// Installing a filter that lives in a different thread than its target.
    #[error("cannot filter events for {target:?}: filter {filter:?} lives in a different thread")]
    FilterThreadMismatch {
        /// Object whose events are filtered.
        target: ObjectId,
        /// Filter object.
        filter: ObjectId,
    },
}

/// Errors raised while connecting or disconnecting signals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// No method with this name exists on the object's class.
    #[error("no method '{name}' on class {class}")]
    UnknownMethod {
        /// Class that was searched.
        class: &'static str,
        /// Requested method name.
        name: String,
    },

    /// The sender side of a connection must be a signal.
    #[error("'{0}' is not a signal")]
    NotASignal(String),

    /// The method belongs to a class the object does not derive from.
    #[error("method '{method}' does not belong to class {class}")]
    ForeignMethod {
        /// Class of the object.
        class: &'static str,
        /// Offending method.
        method: String,
    },

    /// Cloned overloads exist only to describe default arguments.
    #[error("cannot connect to cloned overload '{0}'")]
    ClonedSlot(String),

    /// The slot expects arguments the signal does not provide.
    #[error("incompatible arguments: {signal} -> {slot}")]
    IncompatibleArguments {
        /// Signal signature.
        signal: String,
        /// Slot signature.
        slot: String,
    },

    /// A unique connection with the same endpoints already exists.
    #[error("connection {signal} -> {slot} already exists")]
    DuplicateConnection {
        /// Signal name.
        signal: String,
        /// Slot name.
        slot: String,
    },

    /// One of the endpoints is invalid.
    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// Errors raised by property access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    /// The static property has no setter.
    #[error("property '{0}' is read-only")]
    ReadOnly(String),

    /// The value cannot be converted to the property's type.
    #[error("property '{name}' expects {expected:?}, got {found:?}")]
    TypeMismatch {
        /// Property name.
        name: String,
        /// Declared type.
        expected: ValueType,
        /// Type of the rejected value.
        found: ValueType,
    },

    /// Removing a dynamic property that was never set.
    #[error("no dynamic property named '{0}'")]
    NotFound(String),

    /// The object is invalid.
    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// Umbrella error for callers that do not care which subsystem failed.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Object tree or affinity error.
    #[error("object error: {0}")]
    Object(#[from] ObjectError),

    /// Connection error.
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    /// Property error.
    #[error("property error: {0}")]
    Property(#[from] PropertyError),

    /// The operating system refused to start an event loop thread.
    #[error("failed to spawn event loop thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The event loop thread exited before reporting in.
    #[error("event loop thread '{0}' terminated during startup")]
    LoopStartup(String),
}
