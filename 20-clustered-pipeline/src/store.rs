//! Storage collaborator behind the logic handler.
//!
//! Committed writes reach storage only through [`Storage::upsert`], applied in
//! log order by the cluster stage, so every node converges on the same map.

use std::collections::BTreeMap;

use parking_lot::Mutex;

pub trait Storage: Send + Sync {
    /// Stores `value` under `key` and returns the value it replaced.
    fn upsert(&self, key: String, value: String) -> Option<String>;

    fn query(&self, key: &str) -> Option<String>;
}

/// Key-value map kept in memory.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every pair, in key order.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.lock().clone()
    }
}

impl Storage for MemoryStorage {
    fn upsert(&self, key: String, value: String) -> Option<String> {
        self.data.lock().insert(key, value)
    }

    fn query(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_returns_previous_value() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.upsert("a".into(), "1".into()), None);
        assert_eq!(storage.upsert("a".into(), "2".into()), Some("1".into()));
        assert_eq!(storage.query("a").as_deref(), Some("2"));
        assert_eq!(storage.query("b"), None);
        assert_eq!(storage.snapshot().len(), 1);
    }
}
