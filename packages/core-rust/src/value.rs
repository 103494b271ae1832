use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

// ---------------------------------------------------------------------------
// TypeKey
// ---------------------------------------------------------------------------

/// Runtime type of a [`Value`], used as the lookup key for type conversion.
///
/// Concrete keys mirror the `Value` variants. `Number` and `Any` are abstract
/// keys that only appear as converter sources or conversion targets; they
/// form the lineage walked when no exact converter is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKey {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
    Map,
    /// An application type carried by [`Value::Opaque`], keyed by type name.
    Opaque(&'static str),
    /// Abstract parent of `Int` and `Float`.
    Number,
    /// Abstract root of every key.
    Any,
}

impl TypeKey {
    /// Returns the supertypes of this key, nearest first, ending with `Any`.
    #[must_use]
    pub fn lineage(self) -> &'static [TypeKey] {
        match self {
            TypeKey::Int | TypeKey::Float => &[TypeKey::Number, TypeKey::Any],
            TypeKey::Any => &[],
            _ => &[TypeKey::Any],
        }
    }

    /// Whether a value of this type can be used where `target` is expected
    /// without conversion.
    #[must_use]
    pub fn is_assignable_to(self, target: TypeKey) -> bool {
        self == target || self.lineage().contains(&target)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKey::Null => f.write_str("null"),
            TypeKey::Bool => f.write_str("bool"),
            TypeKey::Int => f.write_str("int"),
            TypeKey::Float => f.write_str("float"),
            TypeKey::Text => f.write_str("text"),
            TypeKey::Bytes => f.write_str("bytes"),
            TypeKey::List => f.write_str("list"),
            TypeKey::Map => f.write_str("map"),
            TypeKey::Opaque(name) => write!(f, "opaque<{name}>"),
            TypeKey::Number => f.write_str("number"),
            TypeKey::Any => f.write_str("any"),
        }
    }
}

// ---------------------------------------------------------------------------
// Opaque
// ---------------------------------------------------------------------------

/// Shared handle to an application value the engine does not interpret.
///
/// Cloning shares the underlying allocation, so opaque payloads are
/// reference-shared across split and multicast branches.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wraps `value`, recording its type name for conversion lookups.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            inner: Arc::new(value),
        }
    }

    /// The Rust type name of the wrapped value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the wrapped value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Returns a shared handle to the wrapped value if it is a `T`.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Payload carried in message bodies, headers, and exchange properties.
///
/// `Bytes` and `Opaque` are reference-counted and shared on clone; all other
/// variants deep-copy, which gives split and multicast branches isolation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<Value>),
    /// Ordered map; `BTreeMap` keeps iteration and JSON output deterministic.
    Map(BTreeMap<String, Value>),
    Opaque(Opaque),
}

impl Value {
    /// Wraps an application value as an opaque payload.
    pub fn opaque<T: std::any::Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Opaque::new(value))
    }

    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        match self {
            Value::Null => TypeKey::Null,
            Value::Bool(_) => TypeKey::Bool,
            Value::Int(_) => TypeKey::Int,
            Value::Float(_) => TypeKey::Float,
            Value::Text(_) => TypeKey::Text,
            Value::Bytes(_) => TypeKey::Bytes,
            Value::List(_) => TypeKey::List,
            Value::Map(_) => TypeKey::Map,
            Value::Opaque(o) => TypeKey::Opaque(o.type_name()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Converts this value into a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error for `Bytes`, `Opaque`, and non-finite floats, which
    /// have no JSON representation.
    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| format!("float {f} is not representable in JSON"))?,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(_) => return Err("binary payloads have no JSON form".to_string()),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Opaque(o) => {
                return Err(format!("opaque {} has no JSON form", o.type_name()));
            }
        })
    }

    /// Builds a value from a JSON document.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(_) | Value::Map(_) => match self.to_json() {
                Ok(json) => write!(f, "{json}"),
                Err(_) => f.write_str("<unprintable>"),
            },
            Value::Opaque(o) => write!(f, "<{}>", o.type_name()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// BodyType
// ---------------------------------------------------------------------------

/// A Rust type that a [`Value`] can be converted into on demand.
///
/// `KEY` is the conversion target; `from_value` extracts the Rust value once
/// the registry has produced a value of that type.
pub trait BodyType: Sized {
    const KEY: TypeKey;

    fn from_value(value: Value) -> Option<Self>;
}

impl BodyType for String {
    const KEY: TypeKey = TypeKey::Text;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl BodyType for i64 {
    const KEY: TypeKey = TypeKey::Int;

    fn from_value(value: Value) -> Option<Self> {
        value.as_i64()
    }
}

impl BodyType for f64 {
    const KEY: TypeKey = TypeKey::Float;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(f),
            _ => None,
        }
    }
}

impl BodyType for bool {
    const KEY: TypeKey = TypeKey::Bool;

    fn from_value(value: Value) -> Option<Self> {
        value.as_bool()
    }
}

impl BodyType for Bytes {
    const KEY: TypeKey = TypeKey::Bytes;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl BodyType for Vec<Value> {
    const KEY: TypeKey = TypeKey::List;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl BodyType for BTreeMap<String, Value> {
    const KEY: TypeKey = TypeKey::Map;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl BodyType for Value {
    const KEY: TypeKey = TypeKey::Any;

    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}
