//! Per-request state that stages attach to a [`Request`](crate::Request).
//!
//! - [`Extensions`]: a type-keyed map; each stage stores its contribution
//!   under its own type (a session, dispatch info, a cookie path, ...), so two
//!   stages cannot clobber each other by picking the same string key.
//! - [`Parameters`]: string parameters from the query string and from stages
//!   that decode path segments.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// Type-erased request extensions map.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// String parameters of a request.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a URL query string (`key=value&key2=value2`).
    ///
    /// `+` is decoded as a space; a key without `=` maps to an empty value.
    pub fn from_query(query: &str) -> Self {
        let map = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (key.replace('+', " "), value.replace('+', " "))
            })
            .collect();
        Self { map }
    }

    /// Sets `key`, returning its previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.map.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Visits(u32);

    #[derive(Debug, PartialEq)]
    struct Theme(&'static str);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(Visits(1)).is_none());
        ext.insert(Theme("dark"));

        assert_eq!(ext.get::<Visits>(), Some(&Visits(1)));
        assert_eq!(ext.get::<Theme>(), Some(&Theme("dark")));
        assert_eq!(ext.len(), 2);

        ext.get_mut::<Visits>().unwrap().0 += 1;
        assert_eq!(ext.insert(Visits(10)), Some(Visits(2)));
        assert_eq!(ext.remove::<Visits>(), Some(Visits(10)));
        assert!(!ext.contains::<Visits>());
    }

    #[test]
    fn query_parsing() {
        let params = Parameters::from_query("a=1&b=two+words&flag&&c=");
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("b"), Some("two words"));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("c"), Some(""));
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn insert_overwrites() {
        let mut params = Parameters::new();
        params.insert("id", "1");
        assert_eq!(params.insert("id", "2"), Some("1".to_owned()));
        assert_eq!(params.get("id"), Some("2"));
    }
}
