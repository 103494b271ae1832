//! Marshalling between structured values and wire bytes.

use std::fmt;

use bytes::Bytes;

use crate::convert::TypeConverterRegistry;
use crate::value::Value;

/// Errors from marshalling or unmarshalling a body.
#[derive(Debug, thiserror::Error)]
pub enum DataFormatError {
    #[error("{format} cannot marshal this body: {reason}")]
    Unrepresentable { format: DataFormat, reason: String },
    #[error("{format} body is not binary or text")]
    NotBinary { format: DataFormat },
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode MessagePack payload: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("malformed MessagePack payload: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// A wire format for structured bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    MsgPack,
}

impl DataFormat {
    /// Encodes a structured value into bytes.
    ///
    /// # Errors
    ///
    /// Fails for values with no JSON data model (binary payloads, opaque
    /// objects, non-finite floats).
    pub fn marshal(self, value: &Value) -> Result<Bytes, DataFormatError> {
        let doc = value
            .to_json()
            .map_err(|reason| DataFormatError::Unrepresentable { format: self, reason })?;
        let encoded = match self {
            DataFormat::Json => serde_json::to_vec(&doc)?,
            DataFormat::MsgPack => rmp_serde::to_vec(&doc)?,
        };
        Ok(Bytes::from(encoded))
    }

    /// Decodes bytes (or text, for JSON) into a structured value.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not binary or text, or is malformed.
    pub fn unmarshal(
        self,
        value: &Value,
        converters: &TypeConverterRegistry,
    ) -> Result<Value, DataFormatError> {
        let raw = converters
            .convert_to::<Bytes>(value)
            .ok()
            .flatten()
            .ok_or(DataFormatError::NotBinary { format: self })?;
        let doc: serde_json::Value = match self {
            DataFormat::Json => serde_json::from_slice(&raw)?,
            DataFormat::MsgPack => rmp_serde::from_slice(&raw)?,
        };
        Ok(Value::from_json(doc))
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataFormat::Json => "json",
            DataFormat::MsgPack => "msgpack",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn order() -> Value {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Int(7));
        map.insert("items".to_string(), Value::from(vec![Value::from("bolt")]));
        Value::Map(map)
    }

    #[test]
    fn json_marshal_produces_utf8_document() {
        let bytes = DataFormat::Json.marshal(&order()).unwrap();
        assert_eq!(&bytes[..], br#"{"id":7,"items":["bolt"]}"#);
    }

    #[test]
    fn msgpack_is_decodable_back_to_the_same_shape() {
        let converters = TypeConverterRegistry::with_defaults();
        let bytes = DataFormat::MsgPack.marshal(&order()).unwrap();
        let decoded = DataFormat::MsgPack
            .unmarshal(&Value::Bytes(bytes), &converters)
            .unwrap();
        assert_eq!(decoded, order());
    }

    #[test]
    fn json_unmarshal_accepts_text_bodies() {
        let converters = TypeConverterRegistry::with_defaults();
        let decoded = DataFormat::Json
            .unmarshal(&Value::from("[1,2]"), &converters)
            .unwrap();
        assert_eq!(decoded, Value::from(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn binary_values_cannot_be_marshalled() {
        let err = DataFormat::Json
            .marshal(&Value::Bytes(Bytes::from_static(b"\x00")))
            .unwrap_err();
        assert!(matches!(err, DataFormatError::Unrepresentable { .. }));
    }

    #[test]
    fn malformed_json_is_reported() {
        let converters = TypeConverterRegistry::with_defaults();
        let err = DataFormat::Json
            .unmarshal(&Value::from("{oops"), &converters)
            .unwrap_err();
        assert!(matches!(err, DataFormatError::Json(_)));
    }
}
