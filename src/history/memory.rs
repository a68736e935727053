use super::{StoreError, TableBackend};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// In-process table. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTable {
    records: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl TableBackend for MemoryTable {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<Value>>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, history: Vec<Value>) -> Result<(), StoreError> {
        self.records.write().insert(key.to_string(), history);
        Ok(())
    }

    async fn append(&self, key: &str, entries: Vec<Value>) -> Result<(), StoreError> {
        self.records
            .write()
            .entry(key.to_string())
            .or_default()
            .extend(entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().remove(key);
        Ok(())
    }
}
