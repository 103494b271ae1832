//! Property sources and `{{key}}` placeholder resolution.
//!
//! Endpoint URIs may contain placeholders such as `timer:tick?period={{tick.period}}`
//! or `{{key:default}}`; they are resolved against the context's
//! [`PropertiesSource`] before the URI is parsed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::EngineError;

/// A read-only key/value configuration source.
pub trait PropertiesSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory properties.
#[derive(Debug, Default)]
pub struct MapProperties {
    values: RwLock<HashMap<String, String>>,
}

impl MapProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }
}

impl PropertiesSource for MapProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Reads properties from environment variables.
///
/// `tick.period` is looked up as `TICK_PERIOD`, prefixed with `PREFIX_` when a
/// prefix is configured.
#[derive(Debug, Default, Clone)]
pub struct EnvProperties {
    prefix: Option<String>,
}

impl EnvProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn env_key(&self, key: &str) -> String {
        let base: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        match &self.prefix {
            Some(prefix) => format!("{}_{base}", prefix.to_ascii_uppercase()),
            None => base,
        }
    }
}

impl PropertiesSource for EnvProperties {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.env_key(key)).ok()
    }
}

/// Layers several sources; the first source that knows a key wins.
#[derive(Default, Clone)]
pub struct CompositeProperties {
    sources: Vec<Arc<dyn PropertiesSource>>,
}

impl CompositeProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn PropertiesSource>) -> Self {
        self.sources.push(source);
        self
    }
}

impl PropertiesSource for CompositeProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|source| source.get(key))
    }
}

/// Replaces every `{{key}}` / `{{key:default}}` in `input`.
///
/// # Errors
///
/// Returns [`EngineError::MissingProperty`] for a key with no value and no
/// default.
pub fn resolve_placeholders(
    input: &str,
    source: &dyn PropertiesSource,
) -> Result<String, EngineError> {
    if !input.contains("{{") {
        return Ok(input.to_string());
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated: keep literally.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let token = &after[..end];
        let (key, default) = match token.split_once(':') {
            Some((key, default)) => (key.trim(), Some(default)),
            None => (token.trim(), None),
        };
        match source.get(key).or_else(|| default.map(str::to_string)) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(EngineError::MissingProperty {
                    key: key.to_string(),
                })
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_keys_and_defaults() {
        let props = MapProperties::new().with("tick.period", "250");
        assert_eq!(
            resolve_placeholders("timer:tick?period={{tick.period}}&delay={{tick.delay:0}}", &props)
                .unwrap(),
            "timer:tick?period=250&delay=0"
        );
    }

    #[test]
    fn missing_key_without_default_fails() {
        let props = MapProperties::new();
        let err = resolve_placeholders("seda:{{queue}}", &props).unwrap_err();
        assert!(matches!(err, EngineError::MissingProperty { key } if key == "queue"));
    }

    #[test]
    fn composite_prefers_earlier_sources() {
        let first: Arc<dyn PropertiesSource> = Arc::new(MapProperties::new().with("a", "1"));
        let second: Arc<dyn PropertiesSource> =
            Arc::new(MapProperties::new().with("a", "2").with("b", "3"));
        let props = CompositeProperties::new()
            .with_source(first)
            .with_source(second);
        assert_eq!(props.get("a").as_deref(), Some("1"));
        assert_eq!(props.get("b").as_deref(), Some("3"));
        assert_eq!(props.get("c"), None);
    }

    #[test]
    fn env_keys_are_upper_snake_case() {
        let env = EnvProperties::with_prefix("app");
        assert_eq!(env.env_key("tick.period"), "APP_TICK_PERIOD");
    }
}
