//! String-keyed run results.
//!
//! Values are arbitrary JSON values; inserting an existing key overwrites it
//! (last writer wins). Keys iterate in sorted order so two identical runs
//! print identical result maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultMap(BTreeMap<String, Value>);

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the one it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Merge another map into this one; keys from `other` win.
    pub fn merge(&mut self, other: ResultMap) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

/// View of a [`ResultMap`] that prefixes every key with a component's
/// hierarchical name.
#[derive(Debug)]
pub struct ResultScope<'a> {
    prefix: &'a str,
    map: &'a mut ResultMap,
}

impl<'a> ResultScope<'a> {
    pub fn new(prefix: &'a str, map: &'a mut ResultMap) -> Self {
        Self { prefix, map }
    }

    pub fn prefix(&self) -> &str {
        self.prefix
    }

    /// Insert `<prefix>.<key>`.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) {
        self.map.insert(format!("{}.{}", self.prefix, key), value);
    }

    /// Read back any key, scoped or not.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let mut map = ResultMap::new();
        assert!(map.insert("simTime", 1.0).is_none());
        let old = map.insert("simTime", 2.0);
        assert_eq!(old, Some(Value::from(1.0)));
        assert_eq!(map.get_f64("simTime"), Some(2.0));
    }

    #[test]
    fn merge_overwrites() {
        let mut a = ResultMap::new();
        a.insert("x", 1u64);
        a.insert("y", "keep");
        let mut b = ResultMap::new();
        b.insert("x", 2u64);
        a.merge(b);
        assert_eq!(a.get_u64("x"), Some(2));
        assert_eq!(a.get_str("y"), Some("keep"));
    }

    #[test]
    fn scope_prefixes_keys() {
        let mut map = ResultMap::new();
        {
            let mut scope = ResultScope::new("sim.shop.m1", &mut map);
            scope.put("utilization", 0.75);
            assert_eq!(scope.prefix(), "sim.shop.m1");
        }
        assert_eq!(map.get_f64("sim.shop.m1.utilization"), Some(0.75));
    }

    #[test]
    fn keys_are_sorted() {
        let mut map = ResultMap::new();
        map.insert("b", 1u64);
        map.insert("a", 2u64);
        assert_eq!(map.keys().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn serializes_as_plain_object() {
        let mut map = ResultMap::new();
        map.insert("numServed", 6u64);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"numServed":6}"#);
        let back: ResultMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
