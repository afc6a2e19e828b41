//! HTTP header map with case-insensitive name lookup.
//!
//! Field names are case-insensitive per RFC 9110 §5.1. Entries keep their
//! insertion order, which is also their order on the wire.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// [`insert`](Self::insert) appends; [`set`](Self::set) replaces every entry
/// of that name and appends the new one at the end. The server relies on the
/// latter to place `Date` and `Server` after everything a stage wrote.
///
/// # Examples
///
/// ```
/// use capsela::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Set-Cookie", "a=1");
/// headers.insert("Set-Cookie", "b=2");
/// headers.set("Server", "stage");
/// headers.set("server", "Capsela");
///
/// assert_eq!(headers.get_all("set-cookie").count(), 2);
/// assert_eq!(headers.get("SERVER"), Some("Capsela"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Removes every entry named `name` and appends `name: value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries named `name`. Returns `true` if any were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("If-Modified-Since", "Wed, 01 Jan 2020 00:00:00 GMT");
        assert!(h.get("if-modified-since").is_some());
        assert!(h.contains("IF-MODIFIED-SINCE"));
    }

    #[test]
    fn set_replaces_and_moves_to_end() {
        let mut h = Headers::new();
        h.insert("Date", "yesterday");
        h.insert("Content-Type", "text/plain");
        h.set("date", "today");

        let names: Vec<_> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Content-Type", "date"]);
        assert_eq!(h.get("Date"), Some("today"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn remove_all_values() {
        let mut h = Headers::new();
        h.insert("X-Stage", "a");
        h.insert("x-stage", "b");
        assert!(h.remove("X-STAGE"));
        assert!(h.is_empty());
        assert!(!h.remove("x-stage"));
    }

    #[test]
    fn display_is_wire_format() {
        let mut h = Headers::new();
        h.insert("A", "1");
        h.insert("B", "2");
        assert_eq!(h.to_string(), "A: 1\r\nB: 2\r\n");
    }
}
