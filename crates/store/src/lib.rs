//! Embedded key-value persistence for toolscope.
//!
//! The proxy persists saved toolsets and user preferences through a small
//! keyspace contract: blobs addressed by `(kind, id)`, where `kind` is a
//! namespace (`toolsets`, `preferences`). Atomicity is per key; there are no
//! cross-key transactions.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Namespace for persisted toolset configurations.
pub const KIND_TOOLSETS: &str = "toolsets";
/// Namespace for user preferences (e.g. the last-equipped pointer).
pub const KIND_PREFERENCES: &str = "preferences";

#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying database could not be opened or accessed.
    #[error("Storage error: {0}")]
    Backend(#[from] sled::Error),

    /// A stored blob could not be decoded.
    #[error("Corrupt record '{kind}/{id}': {source}")]
    Corrupt {
        kind: String,
        id: String,
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the on-disk store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<sled::Db>,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened; callers treat this
    /// as fatal at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open a throwaway store in a temporary location. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary database cannot be created.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Store `value` as a JSON blob under `(kind, id)`, replacing any
    /// previous value.
    pub fn put<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let tree = self.db.open_tree(kind)?;
        let blob = serde_json::to_vec(value)?;
        tree.insert(id.as_bytes(), blob)?;
        tree.flush()?;
        Ok(())
    }

    /// Fetch and decode the blob under `(kind, id)`.
    pub fn get<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        let tree = self.db.open_tree(kind)?;
        let Some(blob) = tree.get(id.as_bytes())? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&blob).map_err(|source| StoreError::Corrupt {
            kind: kind.to_string(),
            id: id.to_string(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Decode every blob in `kind`, in key order.
    ///
    /// Records that fail to decode are skipped with a warning rather than
    /// failing the whole listing; a single corrupt entry must not take the
    /// catalog down.
    pub fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let tree = self.db.open_tree(kind)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, blob) = entry?;
            match serde_json::from_slice(&blob) {
                Ok(value) => out.push(value),
                Err(e) => {
                    tracing::warn!(
                        kind = %kind,
                        id = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping corrupt store record"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Remove the blob under `(kind, id)`. Returns whether a value existed.
    pub fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        let tree = self.db.open_tree(kind)?;
        let existed = tree.remove(id.as_bytes())?.is_some();
        tree.flush()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    fn record(name: &str, count: u32) -> Record {
        Record {
            name: name.to_string(),
            count,
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let store = Store::open_temporary().expect("open temp store");
        store
            .put(KIND_TOOLSETS, "dev", &record("dev", 3))
            .expect("put");

        let loaded: Option<Record> = store.get(KIND_TOOLSETS, "dev").expect("get");
        assert_eq!(loaded, Some(record("dev", 3)));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = Store::open_temporary().expect("open temp store");
        let loaded: Option<Record> = store.get(KIND_TOOLSETS, "nope").expect("get");
        assert_eq!(loaded, None);
    }

    #[test]
    fn put_replaces_existing_value() {
        let store = Store::open_temporary().expect("open temp store");
        store
            .put(KIND_TOOLSETS, "dev", &record("dev", 1))
            .expect("put");
        store
            .put(KIND_TOOLSETS, "dev", &record("dev", 2))
            .expect("put again");

        let loaded: Option<Record> = store.get(KIND_TOOLSETS, "dev").expect("get");
        assert_eq!(loaded, Some(record("dev", 2)));
    }

    #[test]
    fn list_returns_all_records_in_key_order() {
        let store = Store::open_temporary().expect("open temp store");
        store
            .put(KIND_TOOLSETS, "b", &record("b", 2))
            .expect("put b");
        store
            .put(KIND_TOOLSETS, "a", &record("a", 1))
            .expect("put a");

        let all: Vec<Record> = store.list(KIND_TOOLSETS).expect("list");
        assert_eq!(all, vec![record("a", 1), record("b", 2)]);
    }

    #[test]
    fn kinds_are_isolated() {
        let store = Store::open_temporary().expect("open temp store");
        store
            .put(KIND_TOOLSETS, "dev", &record("dev", 1))
            .expect("put");

        let prefs: Vec<Record> = store.list(KIND_PREFERENCES).expect("list");
        assert!(prefs.is_empty());
    }

    #[test]
    fn delete_reports_existence() {
        let store = Store::open_temporary().expect("open temp store");
        store
            .put(KIND_TOOLSETS, "dev", &record("dev", 1))
            .expect("put");

        assert!(store.delete(KIND_TOOLSETS, "dev").expect("delete"));
        assert!(!store.delete(KIND_TOOLSETS, "dev").expect("delete again"));
        let loaded: Option<Record> = store.get(KIND_TOOLSETS, "dev").expect("get");
        assert_eq!(loaded, None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = Store::open(dir.path().join("db")).expect("open");
            store
                .put(KIND_PREFERENCES, "last-equipped", &record("dev", 1))
                .expect("put");
        }
        let store = Store::open(dir.path().join("db")).expect("reopen");
        let loaded: Option<Record> = store.get(KIND_PREFERENCES, "last-equipped").expect("get");
        assert_eq!(loaded, Some(record("dev", 1)));
    }
}
