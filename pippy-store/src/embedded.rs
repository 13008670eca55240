//! Embedded single-process store backend
//!
//! Keys and JSON values live in one redb table. Prefix scans walk the
//! key-ordered table; JSON-path sorts and grouped counts load the matching
//! values into memory and evaluate client-side.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::json_path;
use crate::{Result, Store, StoreError};

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

pub struct EmbeddedStore {
    db: Database,
}

impl EmbeddedStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("store.redb"))?;
        let store = Self { db };
        store.ensure_table()?;
        Ok(store)
    }

    /// Fully in-memory store, used when no directory is configured.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        let store = Self { db };
        store.ensure_table()?;
        Ok(store)
    }

    // Read transactions fail on a table that was never created.
    fn ensure_table(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(KV_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let mut entries = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            entries.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(entries)
    }

    fn sorted_n(
        &self,
        prefix: &str,
        json_path: &str,
        descending: bool,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        let mut sorted = Vec::new();
        for (key, raw) in self.scan(prefix)? {
            let value: Value = serde_json::from_str(&raw)?;
            if let Some(resolved) = json_path::lookup(&value, json_path)? {
                sorted.push((json_path::sort_key(resolved), key, value));
            }
        }

        sorted.sort_by(|a, b| if descending { b.0.cmp(&a.0) } else { a.0.cmp(&b.0) });

        let take = if limit > 0 { limit as usize } else { sorted.len() };
        Ok(sorted
            .into_iter()
            .take(take)
            .map(|(_, key, value)| (key, value))
            .collect())
    }
}

#[async_trait]
impl Store for EmbeddedStore {
    async fn save_value(&self, key: &str, value: Value) -> Result<()> {
        let raw = value.to_string();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.insert(key, raw.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn load_value(&self, key: &str) -> Result<Value> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        match table.get(key)? {
            Some(value) => Ok(serde_json::from_str(value.value())?),
            None => Err(StoreError::KeyNotFound),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys = self.load_keys(prefix).await?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    async fn load_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.scan(prefix)?.into_iter().map(|(key, _)| key).collect())
    }

    async fn load_values(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        self.scan(prefix)?
            .into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    async fn count(&self, prefix: &str) -> Result<u64> {
        Ok(self.scan(prefix)?.len() as u64)
    }

    async fn count_json_path(&self, prefix: &str, json_path: &str) -> Result<Vec<(Value, i64)>> {
        let mut counts: BTreeMap<String, (Value, i64)> = BTreeMap::new();
        for (_, raw) in self.scan(prefix)? {
            let value: Value = serde_json::from_str(&raw)?;
            if let Some(resolved) = json_path::lookup(&value, json_path)? {
                let entry = counts
                    .entry(json_path::sort_key(resolved))
                    .or_insert_with(|| (resolved.clone(), 0));
                entry.1 += 1;
            }
        }
        Ok(counts.into_values().collect())
    }

    async fn sorted_asc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        self.sorted_n(prefix, json_path, false, limit)
    }

    async fn sorted_desc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>> {
        self.sorted_n(prefix, json_path, true, limit)
    }
}
