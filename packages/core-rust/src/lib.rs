//! Switchyard core: message model, type converters, endpoint URIs, and expressions.

pub mod convert;
pub mod dataformat;
pub mod exchange;
pub mod expression;
pub mod message;
pub mod pattern;
pub mod uri;
pub mod value;

pub use convert::{ConvertError, ConverterFn, RegistryError, TypeConverterRegistry};
pub use dataformat::{DataFormat, DataFormatError};
pub use exchange::{keys, Exchange, ExchangeFailure, ExchangePattern};
pub use expression::{Expression, ExpressionError, Predicate, Template};
pub use message::Message;
pub use uri::{EndpointUri, UriError};
pub use value::{BodyType, Opaque, TypeKey, Value};

