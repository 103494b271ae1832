//! Priority-ordered type conversion between payload representations.
//!
//! The registry is populated during startup and sealed once the owning
//! context starts. Lookups walk the source type's lineage (exact type first,
//! then `Number`, then `Any`) and cache the resolved candidate list per
//! `(source, target)` pair, including negative results.

use std::fmt;
use std::iter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::value::{BodyType, TypeKey, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by [`TypeConverterRegistry::convert`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    /// No converter is registered and the value is not already of the target type.
    #[error("no type conversion available from {from} to {to}")]
    NoConversionAvailable { from: TypeKey, to: TypeKey },
    /// A converter accepted the value but could not convert it.
    #[error("failed to convert {from} to {to}: {reason}")]
    Failed {
        from: TypeKey,
        to: TypeKey,
        reason: String,
    },
}

/// Errors from mutating the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("type converter registry is sealed; converters must be registered before the context starts")]
    Sealed,
}

// ---------------------------------------------------------------------------
// Converter entries
// ---------------------------------------------------------------------------

/// A conversion function.
///
/// Returns `Ok(Some(v))` when converted (`v` may be `Null`), `Ok(None)` to
/// decline so the next candidate is tried, or `Err` when the value is
/// accepted but malformed.
pub type ConverterFn = Arc<dyn Fn(&Value) -> Result<Option<Value>, ConvertError> + Send + Sync>;

#[derive(Clone)]
struct ConverterEntry {
    priority: i32,
    seq: u64,
    converter: ConverterFn,
}

type Candidates = Arc<[ConverterEntry]>;

// ---------------------------------------------------------------------------
// TypeConverterRegistry
// ---------------------------------------------------------------------------

/// Process-wide registry of type converters.
///
/// Read-mostly after startup: `register` takes effect until [`seal`] is
/// called, after which the registry is read-only.
///
/// [`seal`]: TypeConverterRegistry::seal
pub struct TypeConverterRegistry {
    converters: DashMap<(TypeKey, TypeKey), Vec<ConverterEntry>>,
    cache: DashMap<(TypeKey, TypeKey), Option<Candidates>>,
    sealed: AtomicBool,
    next_seq: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl fmt::Debug for TypeConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConverterRegistry")
            .field("pairs", &self.converters.len())
            .field("cached", &self.cache.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl TypeConverterRegistry {
    /// Creates an empty, unsealed registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            converters: DashMap::new(),
            cache: DashMap::new(),
            sealed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Creates a registry pre-populated with the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        register_defaults(&registry);
        registry
    }

    /// Registers a converter from `source` to `target`.
    ///
    /// Higher `priority` wins among converters registered for the same pair;
    /// equal priorities keep registration order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] once the registry has been sealed.
    pub fn register<F>(
        &self,
        source: TypeKey,
        target: TypeKey,
        priority: i32,
        converter: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Value) -> Result<Option<Value>, ConvertError> + Send + Sync + 'static,
    {
        if self.is_sealed() {
            return Err(RegistryError::Sealed);
        }
        let entry = ConverterEntry {
            priority,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            converter: Arc::new(converter),
        };
        let mut list = self.converters.entry((source, target)).or_default();
        list.push(entry);
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        drop(list);
        self.cache.clear();
        Ok(())
    }

    /// Makes the registry read-only. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Whether a conversion path exists from `source` to `target`.
    #[must_use]
    pub fn has_converter(&self, source: TypeKey, target: TypeKey) -> bool {
        source.is_assignable_to(target) || self.resolve(source, target).is_some()
    }

    /// Converts `value` to `target`.
    ///
    /// `Null` converts to `Null` for every target, so callers can tell a
    /// missing body (`Ok(Value::Null)`) from an unconvertible one (`Err`).
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::NoConversionAvailable`] when no converter
    /// accepts the value, or [`ConvertError::Failed`] when one accepts it but
    /// cannot convert it.
    pub fn convert(&self, value: &Value, target: TypeKey) -> Result<Value, ConvertError> {
        let from = value.type_key();
        if from == TypeKey::Null {
            return Ok(Value::Null);
        }
        if from.is_assignable_to(target) {
            return Ok(value.clone());
        }
        if let Some(candidates) = self.resolve(from, target) {
            for entry in candidates.iter() {
                if let Some(converted) = (entry.converter)(value)? {
                    return Ok(converted);
                }
            }
        }
        Err(ConvertError::NoConversionAvailable { from, to: target })
    }

    /// Converts `value` into the Rust type `T`.
    ///
    /// Returns `Ok(None)` for a null value.
    ///
    /// # Errors
    ///
    /// Same as [`convert`](Self::convert); additionally `Failed` when a
    /// converter produced a value of the wrong type.
    pub fn convert_to<T: BodyType>(&self, value: &Value) -> Result<Option<T>, ConvertError> {
        let converted = self.convert(value, T::KEY)?;
        if converted.is_null() {
            return Ok(None);
        }
        let produced = converted.type_key();
        T::from_value(converted)
            .map(Some)
            .ok_or_else(|| ConvertError::Failed {
                from: value.type_key(),
                to: T::KEY,
                reason: format!("converter produced {produced}"),
            })
    }

    /// Number of lookups answered from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Number of lookups that had to walk the lineage.
    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    fn resolve(&self, source: TypeKey, target: TypeKey) -> Option<Candidates> {
        if let Some(cached) = self.cache.get(&(source, target)) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached.clone();
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Only the nearest lineage level with converters is consulted.
        let resolved: Option<Candidates> = iter::once(source)
            .chain(source.lineage().iter().copied())
            .filter_map(|key| self.converters.get(&(key, target)).map(|l| l.clone()))
            .find(|level| !level.is_empty())
            .map(Into::into);
        self.cache.insert((source, target), resolved.clone());
        resolved
    }
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in converters
// ---------------------------------------------------------------------------

fn failed(from: TypeKey, to: TypeKey, reason: impl fmt::Display) -> ConvertError {
    ConvertError::Failed {
        from,
        to,
        reason: reason.to_string(),
    }
}

fn json_text(value: &Value, to: TypeKey) -> Result<String, ConvertError> {
    let json = value
        .to_json()
        .map_err(|reason| failed(value.type_key(), to, reason))?;
    serde_json::to_string(&json).map_err(|e| failed(value.type_key(), to, e))
}

fn parse_json(text: &str, from: TypeKey, to: TypeKey) -> Result<Option<Value>, ConvertError> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| failed(from, to, e))?;
    let value = Value::from_json(json);
    if value.type_key() == to {
        Ok(Some(value))
    } else {
        Err(failed(from, to, format!("JSON document is {}", value.type_key())))
    }
}

/// Registers the built-in converters. Registration cannot fail on a fresh
/// registry, so errors are ignored.
#[allow(clippy::too_many_lines)]
fn register_defaults(registry: &TypeConverterRegistry) {
    use TypeKey as K;

    let _ = registry.register(K::Text, K::Int, 0, |v| match v {
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(|i| Some(Value::Int(i)))
            .map_err(|e| failed(K::Text, K::Int, e)),
        _ => Ok(None),
    });

    let _ = registry.register(K::Text, K::Float, 0, |v| match v {
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| failed(K::Text, K::Float, e))
            .and_then(|f| {
                if f.is_finite() {
                    Ok(Some(Value::Float(f)))
                } else {
                    Err(failed(K::Text, K::Float, format!("`{}` is not a finite number", s.trim())))
                }
            }),
        _ => Ok(None),
    });

    let _ = registry.register(K::Text, K::Bool, 0, |v| match v {
        Value::Text(s) if s.trim().eq_ignore_ascii_case("true") => Ok(Some(Value::Bool(true))),
        Value::Text(s) if s.trim().eq_ignore_ascii_case("false") => Ok(Some(Value::Bool(false))),
        Value::Text(s) => Err(failed(K::Text, K::Bool, format!("`{s}` is not a boolean"))),
        _ => Ok(None),
    });

    let _ = registry.register(K::Number, K::Text, 0, |v| match v {
        Value::Int(i) => Ok(Some(Value::Text(i.to_string()))),
        Value::Float(f) => Ok(Some(Value::Text(f.to_string()))),
        _ => Ok(None),
    });

    let _ = registry.register(K::Bool, K::Text, 0, |v| {
        Ok(v.as_bool().map(|b| Value::Text(b.to_string())))
    });

    #[allow(clippy::cast_precision_loss)]
    let _ = registry.register(K::Int, K::Float, 0, |v| {
        Ok(v.as_i64().map(|i| Value::Float(i as f64)))
    });

    #[allow(clippy::cast_possible_truncation)]
    let _ = registry.register(K::Float, K::Int, 0, |v| match v {
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.0e18 => {
            Ok(Some(Value::Int(*f as i64)))
        }
        Value::Float(f) => Err(failed(K::Float, K::Int, format!("{f} is not integral"))),
        _ => Ok(None),
    });

    let _ = registry.register(K::Bytes, K::Text, 0, |v| match v {
        Value::Bytes(b) => std::str::from_utf8(b)
            .map(|s| Some(Value::Text(s.to_string())))
            .map_err(|e| failed(K::Bytes, K::Text, e)),
        _ => Ok(None),
    });

    let _ = registry.register(K::Text, K::Bytes, 0, |v| {
        Ok(v.as_str()
            .map(|s| Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))))
    });

    for source in [K::List, K::Map] {
        let _ = registry.register(source, K::Text, 0, |v| {
            json_text(v, K::Text).map(|s| Some(Value::Text(s)))
        });
        let _ = registry.register(source, K::Bytes, 0, |v| {
            json_text(v, K::Bytes).map(|s| Some(Value::Bytes(Bytes::from(s))))
        });
    }

    for target in [K::List, K::Map] {
        let _ = registry.register(K::Text, target, 0, move |v| match v {
            Value::Text(s) => parse_json(s, K::Text, target),
            _ => Ok(None),
        });
        let _ = registry.register(K::Bytes, target, 0, move |v| match v {
            Value::Bytes(b) => {
                let text =
                    std::str::from_utf8(b).map_err(|e| failed(K::Bytes, target, e))?;
                parse_json(text, K::Bytes, target)
            }
            _ => Ok(None),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn already_assignable_value_is_returned_unchanged() {
        let registry = TypeConverterRegistry::new();
        let v = Value::from("hello");
        assert_eq!(registry.convert(&v, TypeKey::Text).unwrap(), v);
        assert_eq!(registry.convert(&Value::Int(4), TypeKey::Number).unwrap(), Value::Int(4));
        assert_eq!(registry.convert(&v, TypeKey::Any).unwrap(), v);
    }

    #[test]
    fn null_converts_to_null_not_to_an_error() {
        let registry = TypeConverterRegistry::new();
        assert_eq!(registry.convert(&Value::Null, TypeKey::Int).unwrap(), Value::Null);
        assert_eq!(registry.convert_to::<String>(&Value::Null).unwrap(), None);
    }

    #[test]
    fn missing_converter_is_a_typed_error() {
        let registry = TypeConverterRegistry::new();
        let err = registry.convert(&Value::from("1"), TypeKey::Int).unwrap_err();
        assert_eq!(
            err,
            ConvertError::NoConversionAvailable {
                from: TypeKey::Text,
                to: TypeKey::Int
            }
        );
    }

    #[test]
    fn defaults_convert_between_text_and_numbers() {
        let registry = TypeConverterRegistry::with_defaults();
        assert_eq!(registry.convert_to::<i64>(&Value::from(" 42 ")).unwrap(), Some(42));
        assert_eq!(
            registry.convert_to::<String>(&Value::Float(1.5)).unwrap(),
            Some("1.5".to_string())
        );
        assert_eq!(registry.convert_to::<f64>(&Value::Int(3)).unwrap(), Some(3.0));
        assert_eq!(registry.convert_to::<i64>(&Value::Float(3.0)).unwrap(), Some(3));
        assert!(matches!(
            registry.convert_to::<i64>(&Value::Float(3.5)),
            Err(ConvertError::Failed { .. })
        ));
        assert!(matches!(
            registry.convert_to::<i64>(&Value::from("abc")),
            Err(ConvertError::Failed { .. })
        ));
    }

    #[test]
    fn defaults_convert_bytes_and_json() {
        let registry = TypeConverterRegistry::with_defaults();
        let bytes = Value::from(b"hi".to_vec());
        assert_eq!(registry.convert_to::<String>(&bytes).unwrap(), Some("hi".to_string()));

        let map = registry
            .convert_to::<BTreeMap<String, Value>>(&Value::from(r#"{"a":1}"#))
            .unwrap()
            .unwrap();
        assert_eq!(map.get("a"), Some(&Value::Int(1)));

        let list = Value::List(vec![Value::Int(1), Value::from("x")]);
        assert_eq!(
            registry.convert_to::<String>(&list).unwrap(),
            Some(r#"[1,"x"]"#.to_string())
        );

        let err = registry
            .convert_to::<Vec<Value>>(&Value::from(r#"{"a":1}"#))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Failed { .. }));
    }

    #[test]
    fn exact_match_beats_supertype() {
        let registry = TypeConverterRegistry::new();
        registry
            .register(TypeKey::Any, TypeKey::Text, 100, |_| Ok(Some(Value::from("any"))))
            .unwrap();
        registry
            .register(TypeKey::Number, TypeKey::Text, 50, |_| Ok(Some(Value::from("number"))))
            .unwrap();
        registry
            .register(TypeKey::Int, TypeKey::Text, 0, |_| Ok(Some(Value::from("int"))))
            .unwrap();

        assert_eq!(registry.convert(&Value::Int(1), TypeKey::Text).unwrap(), Value::from("int"));
        assert_eq!(
            registry.convert(&Value::Float(1.0), TypeKey::Text).unwrap(),
            Value::from("number")
        );
        assert_eq!(registry.convert(&Value::Bool(true), TypeKey::Text).unwrap(), Value::from("any"));
    }

    #[test]
    fn higher_priority_wins_and_declines_fall_through() {
        let registry = TypeConverterRegistry::new();
        registry
            .register(TypeKey::Text, TypeKey::Int, 1, |_| Ok(Some(Value::Int(1))))
            .unwrap();
        registry
            .register(TypeKey::Text, TypeKey::Int, 10, |v| {
                Ok((v.as_str() == Some("ten")).then_some(Value::Int(10)))
            })
            .unwrap();

        assert_eq!(registry.convert(&Value::from("ten"), TypeKey::Int).unwrap(), Value::Int(10));
        // The high-priority converter declines; the next candidate answers.
        assert_eq!(registry.convert(&Value::from("other"), TypeKey::Int).unwrap(), Value::Int(1));
    }

    #[test]
    fn declines_at_the_nearest_level_do_not_reach_supertypes() {
        let registry = TypeConverterRegistry::new();
        registry
            .register(TypeKey::Number, TypeKey::Text, 0, |_| Ok(Some(Value::from("number"))))
            .unwrap();
        registry
            .register(TypeKey::Int, TypeKey::Text, 0, |_| Ok(None))
            .unwrap();

        assert_eq!(
            registry.convert(&Value::Int(7), TypeKey::Text).unwrap_err(),
            ConvertError::NoConversionAvailable {
                from: TypeKey::Int,
                to: TypeKey::Text
            }
        );
        // Float has no converter of its own, so Number is its nearest level.
        assert_eq!(
            registry.convert(&Value::Float(7.0), TypeKey::Text).unwrap(),
            Value::from("number")
        );
    }

    #[test]
    fn non_finite_text_is_not_a_float() {
        let registry = TypeConverterRegistry::with_defaults();
        for text in ["nan", "NaN", "inf", "-infinity"] {
            let first = registry.convert(&Value::from(text), TypeKey::Float);
            assert!(matches!(first, Err(ConvertError::Failed { .. })), "{text}: {first:?}");
            assert_eq!(first, registry.convert(&Value::from(text), TypeKey::Float));
        }
        assert_eq!(
            registry.convert(&Value::from(" 2.5 "), TypeKey::Float).unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn converter_may_return_null_distinct_from_no_conversion() {
        let registry = TypeConverterRegistry::new();
        registry
            .register(TypeKey::Text, TypeKey::Int, 0, |_| Ok(Some(Value::Null)))
            .unwrap();
        assert_eq!(registry.convert(&Value::from("x"), TypeKey::Int).unwrap(), Value::Null);
        assert_eq!(registry.convert_to::<i64>(&Value::from("x")).unwrap(), None);
    }

    #[test]
    fn lookups_are_cached_including_misses() {
        let registry = TypeConverterRegistry::with_defaults();
        let _ = registry.convert(&Value::from("1"), TypeKey::Int);
        let _ = registry.convert(&Value::from("2"), TypeKey::Int);
        let _ = registry.convert(&Value::Bool(true), TypeKey::List);
        let _ = registry.convert(&Value::Bool(false), TypeKey::List);
        assert_eq!(registry.cache_misses(), 2);
        assert_eq!(registry.cache_hits(), 2);
        assert!(!registry.has_converter(TypeKey::Bool, TypeKey::List));
    }

    #[test]
    fn registration_after_seal_is_rejected() {
        let registry = TypeConverterRegistry::new();
        registry.seal();
        let err = registry
            .register(TypeKey::Text, TypeKey::Int, 0, |_| Ok(None))
            .unwrap_err();
        assert_eq!(err, RegistryError::Sealed);
    }

    #[test]
    fn registration_invalidates_negative_cache() {
        let registry = TypeConverterRegistry::new();
        assert!(registry.convert(&Value::Bool(true), TypeKey::Int).is_err());
        registry
            .register(TypeKey::Bool, TypeKey::Int, 0, |v| {
                Ok(v.as_bool().map(|b| Value::Int(i64::from(b))))
            })
            .unwrap();
        assert_eq!(registry.convert(&Value::Bool(true), TypeKey::Int).unwrap(), Value::Int(1));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            any::<bool>().prop_map(Value::Bool),
            "[a-z0-9 ]{0,12}".prop_map(Value::Text),
            (-1.0e6f64..1.0e6).prop_map(Value::Float),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::from),
        ]
    }

    fn arb_target() -> impl Strategy<Value = TypeKey> {
        prop_oneof![
            Just(TypeKey::Int),
            Just(TypeKey::Float),
            Just(TypeKey::Bool),
            Just(TypeKey::Text),
            Just(TypeKey::Bytes),
            Just(TypeKey::List),
            Just(TypeKey::Map),
        ]
    }

    proptest! {
        #[test]
        fn conversion_is_deterministic(value in arb_value(), target in arb_target()) {
            let registry = TypeConverterRegistry::with_defaults();
            let first = registry.convert(&value, target);
            let second = registry.convert(&value, target);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn conversion_is_idempotent(value in arb_value(), target in arb_target()) {
            let registry = TypeConverterRegistry::with_defaults();
            if let Ok(converted) = registry.convert(&value, target) {
                let again = registry.convert(&converted, target).unwrap();
                prop_assert_eq!(again, converted);
            }
        }
    }
}
