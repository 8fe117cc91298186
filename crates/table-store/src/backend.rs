//! Key-value table port and its implementations.
//!
//! A [`TableBackend`] stores one string value per partition key. Keys handed
//! to it are already escaped (see [`crate::key`]).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use triggers::StorageError;

/// Tree name used inside the sled database.
pub const TRIGGER_TABLE: &str = "ServiceBusTriggerStore";

/// A single-column table keyed by partition key.
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Inserts or replaces the value under `key`. Must be durable on return.
    async fn upsert(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key` unconditionally. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Returns every `(key, value)` row as stored.
    ///
    /// Rows are returned as raw bytes so that one undecodable row cannot
    /// fail the whole scan.
    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

fn transport(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transport {
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// sled
// ---------------------------------------------------------------------------

/// [`TableBackend`] over a sled tree. Every write is flushed before returning.
#[derive(Clone)]
pub struct SledTable {
    tree: sled::Tree,
}

impl SledTable {
    /// Opens (or creates) the trigger table in the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(transport)?;
        Self::from_db(&db)
    }

    /// Opens the trigger table inside an already open database.
    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(TRIGGER_TABLE).map_err(transport)?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl TableBackend for SledTable {
    async fn upsert(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.tree
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(transport)?;
        self.tree.flush_async().await.map_err(transport)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key.as_bytes()).map_err(transport)?;
        self.tree.flush_async().await.map_err(transport)?;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.tree
            .iter()
            .map(|row| {
                let (k, v) = row.map_err(transport)?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Non-durable [`TableBackend`] for tests and local runs.
///
/// Writes can be made to fail with [`InMemoryTable::fail_writes`] to exercise
/// storage-failure paths. Clones share the same rows, which lets a test
/// "restart" a registry over the same table.
#[derive(Clone, Default)]
pub struct InMemoryTable {
    rows: std::sync::Arc<Mutex<BTreeMap<String, String>>>,
    failing: std::sync::Arc<AtomicBool>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `upsert` and `delete` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Raw stored value for `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Inserts a raw row, bypassing encoding.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // Row maps stay consistent even if a holder panicked.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Transport {
                message: "table unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TableBackend for InMemoryTable {
    async fn upsert(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.lock().remove(key);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone().into_bytes(), v.clone().into_bytes()))
            .collect())
    }
}
