use std::collections::BTreeMap;

use bytes::Bytes;

use crate::convert::{ConvertError, TypeConverterRegistry};
use crate::pattern::wildcard_match;
use crate::value::{BodyType, Value};

/// A message travelling through a route: headers, a body, and optional
/// named binary attachments.
///
/// Cloning deep-copies headers and structured bodies; binary payloads are
/// shared, which is safe because `Bytes` is immutable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    headers: BTreeMap<String, Value>,
    body: Value,
    attachments: BTreeMap<String, Bytes>,
}

impl Message {
    /// Creates a message with the given body and no headers.
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Builder-style header setter.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(key, value);
        self
    }

    // -- headers --------------------------------------------------------------

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    #[must_use]
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Reads a header converted to `T`. Missing and null headers yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConvertError`] if the header cannot be converted.
    pub fn header_as<T: BodyType>(
        &self,
        key: &str,
        converters: &TypeConverterRegistry,
    ) -> Result<Option<T>, ConvertError> {
        match self.headers.get(key) {
            Some(value) => converters.convert_to::<T>(value),
            None => Ok(None),
        }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) -> Option<Value> {
        self.headers.remove(key)
    }

    /// Removes every header whose name matches `pattern` (`*` wildcards).
    /// Returns the number of headers removed.
    pub fn remove_headers(&mut self, pattern: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|key, _| !wildcard_match(pattern, key));
        before - self.headers.len()
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, Value> {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.headers
    }

    // -- body -----------------------------------------------------------------

    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Takes the body, leaving `Null` in its place.
    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    /// Reads the body converted to `T`.
    ///
    /// Returns `Ok(None)` when the body is null, so "no body" is
    /// distinguishable from "unconvertible body".
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::NoConversionAvailable`] when no converter
    /// applies, or [`ConvertError::Failed`] when conversion was attempted and
    /// failed.
    pub fn body_as<T: BodyType>(
        &self,
        converters: &TypeConverterRegistry,
    ) -> Result<Option<T>, ConvertError> {
        converters.convert_to::<T>(&self.body)
    }

    // -- attachments ----------------------------------------------------------

    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Bytes> {
        self.attachments.get(name)
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.attachments.insert(name.into(), data.into());
    }

    #[must_use]
    pub fn attachments(&self) -> &BTreeMap<String, Bytes> {
        &self.attachments
    }

    /// Copies headers and attachments from `other`, keeping this body.
    pub fn copy_headers_from(&mut self, other: &Message) {
        self.headers = other.headers.clone();
        self.attachments = other.attachments.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_round_trips_without_conversion() {
        let converters = TypeConverterRegistry::new();
        let mut msg = Message::default();
        msg.set_body("payload");
        assert_eq!(
            msg.body_as::<String>(&converters).unwrap(),
            Some("payload".to_string())
        );

        msg.set_body(17i64);
        assert_eq!(msg.body_as::<i64>(&converters).unwrap(), Some(17));
    }

    #[test]
    fn body_as_distinguishes_missing_from_unconvertible() {
        let converters = TypeConverterRegistry::with_defaults();
        let msg = Message::default();
        assert_eq!(msg.body_as::<i64>(&converters).unwrap(), None);

        let msg = Message::new(Value::List(vec![]));
        assert!(matches!(
            msg.body_as::<i64>(&converters),
            Err(ConvertError::NoConversionAvailable { .. })
        ));
    }

    #[test]
    fn remove_headers_honours_wildcards() {
        let mut msg = Message::new("x")
            .with_header("headerToRemove", 1)
            .with_header("headerToRemoveToo", 2)
            .with_header("headerToKeep", 3);

        assert_eq!(msg.remove_headers("headerToRemove*"), 2);
        assert!(msg.has_header("headerToKeep"));
        assert_eq!(msg.headers().len(), 1);
    }

    #[test]
    fn header_as_converts_on_read() {
        let converters = TypeConverterRegistry::with_defaults();
        let msg = Message::new(Value::Null).with_header("count", "12");
        assert_eq!(msg.header_as::<i64>("count", &converters).unwrap(), Some(12));
        assert_eq!(msg.header_as::<i64>("missing", &converters).unwrap(), None);
    }

    #[test]
    fn clone_isolates_structured_bodies_and_shares_bytes() {
        let original = Message::new(Value::List(vec![Value::Int(1)]))
            .with_header("k", "v");
        let mut copy = original.clone();
        copy.set_header("k", "changed");
        if let Value::List(items) = &original.body {
            assert_eq!(items.len(), 1);
        }
        assert_eq!(original.header("k"), Some(&Value::from("v")));

        let mut binary = Message::new(Bytes::from_static(b"abc"));
        binary.add_attachment("doc", Bytes::from_static(b"pdf"));
        let shared = binary.clone();
        assert_eq!(shared.attachment("doc").map(|b| b.as_ref()), Some(&b"pdf"[..]));
        assert_eq!(shared.body(), binary.body());
    }
}
