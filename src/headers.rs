//! Ordered header list.
//!
//! Header names are matched case-insensitively, duplicates are preserved,
//! and user-supplied order is the order bytes go on the wire.

use crate::error::ErrorKind;

/// An ordered list of `(name, value)` header pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// An empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` pairs, preserving order and duplicates.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    /// Append a header.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name` (case-insensitive), if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` (case-insensitive), in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any header named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether the (comma-separated) value of `name` contains `token`,
    /// compared case-insensitively. Used for `Connection: close` and
    /// `Transfer-Encoding: chunked` checks.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Iterate the pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Remove every header named `name` (case-insensitive).
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

/// Reject header names and values that would corrupt the wire format.
///
/// A value containing CR or LF would let callers smuggle extra header
/// lines; a name containing separators would corrupt the field line.
pub(crate) fn validate_header(name: &str, value: &str) -> Result<(), ErrorKind> {
    let bad_name =
        name.is_empty() || name.bytes().any(|b| b == b'\r' || b == b'\n' || b == b':' || b == b' ');
    let bad_value = value.bytes().any(|b| b == b'\r' || b == b'\n');
    if bad_name || bad_value {
        return Err(ErrorKind::InvalidRequestHeader(format!("{name}: {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("content-length"), None);
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let h = Headers::from_pairs([("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]);
        let all: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(all, ["a=1", "b=2"]);
        assert_eq!(h.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn token_scan_splits_commas() {
        let h = Headers::from_pairs([("Connection", "keep-alive, Close")]);
        assert!(h.has_token("connection", "close"));
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "upgrade"));
    }

    #[test]
    fn crlf_in_value_rejected() {
        assert!(validate_header("X-Ok", "fine").is_ok());
        assert!(validate_header("X-Bad", "a\r\nInjected: yes").is_err());
        assert!(validate_header("X-Bad", "a\nb").is_err());
        assert!(validate_header("Bad Name", "v").is_err());
        assert!(validate_header("", "v").is_err());
    }
}
