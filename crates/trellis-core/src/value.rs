//! Dynamically typed values.
//!
//! [`Value`] carries property values and the argument snapshot of queued
//! slot invocations. [`Variant`] bridges Rust types to and from `Value`, and
//! [`Arguments`] does the same for signal and slot parameter tuples.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::object::ObjectId;

/// Type tag of a [`Value`].
///
/// Argument compatibility between signals and slots is decided on these
/// tags, so every integer width maps to `Int` or `UInt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// The invalid (empty) value.
    Invalid,
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// Floating point number.
    Float,
    /// UTF-8 string.
    String,
    /// Byte buffer.
    Bytes,
    /// Heterogeneous list.
    List,
    /// Object reference.
    Object,
    /// Application-defined payload.
    Custom,
    /// Accepts any value. Only meaningful as a slot parameter type.
    Any,
}

impl ValueType {
    /// Whether a slot parameter of type `self` can receive a signal
    /// argument of type `provided`.
    pub fn accepts(self, provided: ValueType) -> bool {
        self == ValueType::Any || self == provided
    }
}

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    /// The empty sentinel. Setting a dynamic property to `Invalid` removes it.
    #[default]
    Invalid,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Byte buffer.
    Bytes(Vec<u8>),
    /// Heterogeneous list.
    List(Vec<Value>),
    /// Object reference. The id is a weak observer.
    Object(ObjectId),
    /// Application-defined payload shared by reference.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap an arbitrary payload.
    pub fn custom<T: Any + Send + Sync>(payload: T) -> Self {
        Value::Custom(Arc::new(payload))
    }

    /// Whether this is anything other than [`Value::Invalid`].
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    /// The type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Invalid => ValueType::Invalid,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::UInt(_) => ValueType::UInt,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::List(_) => ValueType::List,
            Value::Object(_) => ValueType::Object,
            Value::Custom(_) => ValueType::Custom,
        }
    }

    /// Convert to a concrete type, if the value holds something compatible.
    pub fn get<T: Variant>(&self) -> Option<T> {
        T::from_value(self)
    }

    /// Borrow the string payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow a custom payload of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Custom(payload) => payload.downcast_ref(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => f.write_str("Invalid"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::UInt(v) => write!(f, "UInt({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes(len={})", v.len()),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Object(id) => write!(f, "Object({id:?})"),
            Value::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Invalid, Value::Invalid) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A Rust type that can travel inside a [`Value`].
pub trait Variant: Sized + Send + 'static {
    /// Type tag used for connect-time compatibility checks.
    fn value_type() -> ValueType;

    /// Wrap `self`.
    fn into_value(self) -> Value;

    /// Unwrap, returning `None` when the value holds another type.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_signed {
    ($($ty:ty),*) => {$(
        impl Variant for $ty {
            fn value_type() -> ValueType { ValueType::Int }
            fn into_value(self) -> Value { Value::Int(i64::from(self)) }
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::Int(v) => <$ty>::try_from(*v).ok(),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self { v.into_value() }
        }
    )*};
}

macro_rules! impl_unsigned {
    ($($ty:ty),*) => {$(
        impl Variant for $ty {
            fn value_type() -> ValueType { ValueType::UInt }
            fn into_value(self) -> Value { Value::UInt(u64::from(self)) }
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::UInt(v) => <$ty>::try_from(*v).ok(),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self { v.into_value() }
        }
    )*};
}

impl_signed!(i8, i16, i32, i64);
impl_unsigned!(u8, u16, u32, u64);

impl Variant for bool {
    fn value_type() -> ValueType {
        ValueType::Bool
    }
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl Variant for f64 {
    fn value_type() -> ValueType {
        ValueType::Float
    }
    fn into_value(self) -> Value {
        Value::Float(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl Variant for String {
    fn value_type() -> ValueType {
        ValueType::String
    }
    fn into_value(self) -> Value {
        Value::String(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl Variant for Vec<u8> {
    fn value_type() -> ValueType {
        ValueType::Bytes
    }
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl Variant for ObjectId {
    fn value_type() -> ValueType {
        ValueType::Object
    }
    fn into_value(self) -> Value {
        Value::Object(self)
    }
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}

impl Variant for Value {
    fn value_type() -> ValueType {
        ValueType::Any
    }
    fn into_value(self) -> Value {
        self
    }
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// A parameter tuple of a signal or slot.
///
/// Implemented for tuples of up to six [`Variant`] types. Decoding reads a
/// prefix of the provided values, which lets a slot take fewer parameters
/// than the signal it is connected to.
pub trait Arguments: Sized + Send + 'static {
    /// Parameter type tags, in order.
    fn types() -> Vec<ValueType>;

    /// Snapshot the arguments.
    fn into_values(self) -> Vec<Value>;

    /// Decode from the leading values of `values`.
    fn from_values(values: &[Value]) -> Option<Self>;
}

impl Arguments for () {
    fn types() -> Vec<ValueType> {
        Vec::new()
    }
    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }
    fn from_values(_values: &[Value]) -> Option<Self> {
        Some(())
    }
}

macro_rules! impl_arguments {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Variant),+> Arguments for ($($name,)+) {
            fn types() -> Vec<ValueType> {
                vec![$($name::value_type()),+]
            }

            fn into_values(self) -> Vec<Value> {
                vec![$(self.$idx.into_value()),+]
            }

            fn from_values(values: &[Value]) -> Option<Self> {
                Some(($($name::from_value(values.get($idx)?)?,)+))
            }
        }
    };
}

impl_arguments!(A: 0);
impl_arguments!(A: 0, B: 1);
impl_arguments!(A: 0, B: 1, C: 2);
impl_arguments!(A: 0, B: 1, C: 2, D: 3);
impl_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

/// Whether a slot with `slot` parameters can be driven by a signal with
/// `signal` parameters: the slot's list must be a prefix of the signal's.
pub fn arguments_compatible(signal: &[ValueType], slot: &[ValueType]) -> bool {
    slot.len() <= signal.len()
        && slot
            .iter()
            .zip(signal)
            .all(|(wanted, provided)| wanted.accepts(*provided))
}

/// Render a parameter list for diagnostics, e.g. `value_changed(Int, String)`.
pub fn signature(name: &str, params: &[ValueType]) -> String {
    let params: Vec<String> = params.iter().map(|p| format!("{p:?}")).collect();
    format!("{name}({})", params.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_narrow_on_read() {
        let v = Value::from(300i32);
        assert_eq!(v.value_type(), ValueType::Int);
        assert_eq!(v.get::<i64>(), Some(300));
        assert_eq!(v.get::<i8>(), None);
        assert_eq!(v.get::<u32>(), None);
    }

    #[test]
    fn tuple_decoding_reads_prefix() {
        let values = (7i32, String::from("seven"), true).into_values();
        let (n,) = <(i32,)>::from_values(&values).unwrap();
        assert_eq!(n, 7);
        let pair = <(i32, String)>::from_values(&values).unwrap();
        assert_eq!(pair.1, "seven");
        assert!(<(i32, bool)>::from_values(&values).is_none());
    }

    #[test]
    fn compatibility_requires_prefix() {
        let signal = <(i32, String)>::types();
        assert!(arguments_compatible(&signal, &[]));
        assert!(arguments_compatible(&signal, &[ValueType::Int]));
        assert!(arguments_compatible(&signal, &[ValueType::Int, ValueType::Any]));
        assert!(!arguments_compatible(&signal, &[ValueType::String]));
        assert!(!arguments_compatible(
            &signal,
            &[ValueType::Int, ValueType::String, ValueType::Bool]
        ));
    }

    #[test]
    fn custom_values_compare_by_identity() {
        let a = Value::custom(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Value::custom(vec![1, 2, 3]));
        assert_eq!(a.downcast_ref::<Vec<i32>>(), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn signature_formatting() {
        assert_eq!(signature("moved", &<(i32, i32)>::types()), "moved(Int, Int)");
        assert_eq!(signature("clicked", &[]), "clicked()");
    }
}
