//! Durable key/value store for pippy
//!
//! Two backends implement the same [`Store`] contract: an embedded
//! single-process store (redb) under `<home>/.pippy/db/pippy`, and a
//! relational store backed by a `(key, value jsonb)` Postgres table. Callers
//! select the backend through the environment: a non-empty `DATABASE_URL`
//! enables the relational backend, otherwise the embedded one is used.
//!
//! Stores are opened per operation and dropped on return; a process-wide
//! default handle can be installed to short-circuit that (tests do this to
//! share one in-memory store across operations).

pub mod embedded;
mod error;
mod json_path;
pub mod postgres;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub use embedded::EmbeddedStore;
pub use error::{Result, StoreError};
pub use postgres::PgStore;

pub const PUBLIC_SCHEMA: &str = "public";
pub const TABLE_NAME: &str = "pippy";

/// Key/value persistence contract shared by both backends.
///
/// Values are JSON objects. `json_path` arguments use the dotted `$.field`
/// form (`$.created`, `$.state`, `$.Time`); the relational backend pushes
/// them into server-side `jsonb_path_query` calls, the embedded backend
/// evaluates them client-side.
#[async_trait]
pub trait Store: Send + Sync {
    /// Save a JSON value under `key`, replacing any previous value.
    async fn save_value(&self, key: &str, value: Value) -> Result<()>;

    /// Load the JSON value stored under `key`.
    ///
    /// Returns [`StoreError::KeyNotFound`] when the key is absent, which
    /// callers distinguish from I/O failures.
    async fn load_value(&self, key: &str) -> Result<Value>;

    /// Delete `key`; deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// All keys starting with `prefix`.
    async fn load_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// All `(key, value)` pairs with keys starting with `prefix`.
    async fn load_values(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Number of keys starting with `prefix`.
    async fn count(&self, prefix: &str) -> Result<u64>;

    /// Grouped count of the value found at `json_path` across the prefix.
    async fn count_json_path(&self, prefix: &str, json_path: &str) -> Result<Vec<(Value, i64)>>;

    /// `(key, value)` pairs ordered ascending by the value at `json_path`,
    /// limited to `limit` entries (zero or negative returns all). Entries
    /// without the path are skipped.
    async fn sorted_asc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>>;

    /// Same as [`Store::sorted_asc_n`], descending.
    async fn sorted_desc_n(
        &self,
        prefix: &str,
        json_path: &str,
        limit: i64,
    ) -> Result<Vec<(String, Value)>>;
}

/// Serialize `value` and save it under `key`.
pub async fn save_json<T: Serialize + Sync>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    store.save_value(key, serde_json::to_value(value)?).await
}

/// Load the value under `key` and deserialize it.
pub async fn load_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<T> {
    let value = store.load_value(key).await?;
    Ok(serde_json::from_value(value)?)
}

struct Overrides {
    home_dir: RwLock<Option<PathBuf>>,
    default_store: RwLock<Option<Arc<dyn Store>>>,
}

fn overrides() -> &'static Overrides {
    static OVERRIDES: OnceLock<Overrides> = OnceLock::new();
    OVERRIDES.get_or_init(|| Overrides {
        home_dir: RwLock::new(None),
        default_store: RwLock::new(None),
    })
}

/// Override the home directory used for the embedded backend (tests point
/// this at a temp directory). `None` restores the real home directory.
pub fn set_home_dir(dir: Option<PathBuf>) {
    *overrides().home_dir.write().expect("home dir lock poisoned") = dir;
}

/// Resolve the home directory, honoring the override.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(dir) = overrides()
        .home_dir
        .read()
        .expect("home dir lock poisoned")
        .clone()
    {
        return Ok(dir);
    }
    dirs::home_dir().ok_or(StoreError::NoHomeDir)
}

/// Install a process-wide store handle returned by every subsequent
/// [`get`] call, bypassing backend selection. `None` removes it.
pub fn set_default_store(store: Option<Arc<dyn Store>>) {
    *overrides()
        .default_store
        .write()
        .expect("default store lock poisoned") = store;
}

fn default_store() -> Option<Arc<dyn Store>> {
    overrides()
        .default_store
        .read()
        .expect("default store lock poisoned")
        .clone()
}

/// Open a store handle for one operation.
pub async fn get() -> Result<Arc<dyn Store>> {
    if let Some(store) = default_store() {
        return Ok(store);
    }

    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            let store = PgStore::connect(&url, PUBLIC_SCHEMA, TABLE_NAME).await?;
            return Ok(Arc::new(store));
        }
    }

    let dir = home_dir()?.join(".pippy").join("db").join("pippy");
    Ok(Arc::new(EmbeddedStore::open(&dir)?))
}
