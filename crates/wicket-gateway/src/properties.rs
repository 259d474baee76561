//! Per-connection property store

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

/// String-keyed, arbitrarily-typed values attached to a connection.
///
/// Reads share the lock, writes take it exclusively; values are handed out
/// as `Arc`s so no lock is held while a caller uses one.
#[derive(Default)]
pub struct Properties {
    values: RwLock<HashMap<String, Value>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value under `key`
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.write().insert(key.into(), Arc::new(value));
    }

    /// Value under `key`, if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.values.write().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl std::fmt::Debug for Properties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Properties")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let props = Properties::new();
        props.set("user", "alice".to_string());
        props.set("level", 3u32);

        assert_eq!(props.get::<String>("user").as_deref().map(String::as_str), Some("alice"));
        assert_eq!(props.get::<u32>("level").as_deref(), Some(&3));
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_get_missing_or_wrong_type() {
        let props = Properties::new();
        props.set("level", 3u32);

        assert!(props.get::<u32>("missing").is_none());
        assert!(props.get::<String>("level").is_none());
        assert!(props.contains("level"));
    }

    #[test]
    fn test_set_overwrites() {
        let props = Properties::new();
        props.set("room", "lobby".to_string());
        props.set("room", 42i64);

        assert!(props.get::<String>("room").is_none());
        assert_eq!(props.get::<i64>("room").as_deref(), Some(&42));
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_remove() {
        let props = Properties::new();
        props.set("token", vec![1u8, 2, 3]);

        assert!(props.remove("token"));
        assert!(!props.remove("token"));
        assert!(props.is_empty());
    }
}
