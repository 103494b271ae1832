//! Name matching shared by header removal and route filtering.

use regex::Regex;

/// Matches `text` against `pattern`.
///
/// `*` matches any run of characters; a pattern without wildcards must match
/// exactly.
#[must_use]
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$")).is_ok_and(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_patterns() {
        assert!(wildcard_match("route-a", "route-a"));
        assert!(!wildcard_match("route-a", "route-ab"));
        assert!(wildcard_match("route-*", "route-ab"));
        assert!(wildcard_match("*-debug", "orders-debug"));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(!wildcard_match("a*c", "abbb"));
        assert!(wildcard_match("a.b*", "a.bc"));
        assert!(!wildcard_match("a.b*", "axbc"));
    }
}
