//! Endpoint URI grammar: `scheme:context-path[?key1=value1&key2=value2]`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Errors from parsing an endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("endpoint uri is empty")]
    Empty,
    #[error("endpoint uri `{uri}` has no scheme")]
    MissingScheme { uri: String },
    #[error("endpoint uri `{uri}` has an invalid scheme")]
    InvalidScheme { uri: String },
    #[error("endpoint uri `{uri}` has a malformed parameter `{param}`")]
    InvalidParameter { uri: String, param: String },
    #[error("endpoint uri `{uri}` repeats parameter `{param}`")]
    DuplicateParameter { uri: String, param: String },
}

/// A parsed endpoint URI.
///
/// The scheme selects the component; the context path is interpreted by that
/// component (a channel name, a directory, a host and path). Query values are
/// percent-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl EndpointUri {
    /// Parses `raw`.
    ///
    /// `scheme://path` is accepted as well as `scheme:path`; the leading `//`
    /// is not part of the context path.
    ///
    /// # Errors
    ///
    /// Returns a [`UriError`] for an empty URI, a missing or invalid scheme,
    /// or a malformed or repeated query parameter.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UriError::Empty);
        }
        let Some((scheme, rest)) = raw.split_once(':') else {
            return Err(UriError::MissingScheme {
                uri: raw.to_string(),
            });
        };
        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.'));
        if !valid_scheme {
            return Err(UriError::InvalidScheme {
                uri: raw.to_string(),
            });
        }

        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut params = BTreeMap::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                return Err(UriError::InvalidParameter {
                    uri: raw.to_string(),
                    param: pair.to_string(),
                });
            }
            let decoded = urlencoding::decode(value).map_err(|_| UriError::InvalidParameter {
                uri: raw.to_string(),
                param: key.to_string(),
            })?;
            if params
                .insert(key.to_string(), decoded.into_owned())
                .is_some()
            {
                return Err(UriError::DuplicateParameter {
                    uri: raw.to_string(),
                    param: key.to_string(),
                });
            }
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            path: path.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The scheme-specific context path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Canonical form used to intern endpoints: lowercase scheme, parameters
    /// sorted by key and percent-encoded.
    #[must_use]
    pub fn normalized(&self) -> String {
        let mut out = format!("{}:{}", self.scheme, self.path);
        for (i, (key, value)) in self.params.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(key);
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        }
        out
    }
}

impl FromStr for EndpointUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}
