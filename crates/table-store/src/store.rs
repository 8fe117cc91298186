//! [`TriggerStore`] over a [`TableBackend`].

use async_trait::async_trait;
use tracing::{debug, warn};
use triggers::{
    StorageError, StoredTriggers, SubscriptionRecord, TriggerStore, UnreadableRow, WorkflowId,
};

use crate::backend::TableBackend;
use crate::key::{decode_key, encode_key};

/// Persists trigger records as JSON, one row per escaped workflow id.
pub struct TableTriggerStore<B> {
    backend: B,
}

impl<B: TableBackend> TableTriggerStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the underlying table.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

/// Decodes one stored row. The key is authoritative for the workflow id.
fn read_row(key: &[u8], value: &[u8]) -> Result<(WorkflowId, SubscriptionRecord), StorageError> {
    let key = std::str::from_utf8(key).map_err(|e| StorageError::InvalidKey {
        key: String::from_utf8_lossy(key).into_owned(),
        message: e.to_string(),
    })?;
    let workflow_id = decode_key(key)?;
    let value = std::str::from_utf8(value).map_err(|e| StorageError::Serialization {
        message: format!("row '{key}' is not UTF-8: {e}"),
    })?;
    let mut record: SubscriptionRecord =
        serde_json::from_str(value).map_err(|e| StorageError::Serialization {
            message: format!("row '{key}': {e}"),
        })?;
    if record.workflow_id != workflow_id {
        warn!(
            key = %key,
            workflow_id = %workflow_id,
            stored_workflow_id = %record.workflow_id,
            "stored record disagrees with its key; using the key"
        );
        record.workflow_id = workflow_id.clone();
    }
    Ok((workflow_id, record))
}

#[async_trait]
impl<B: TableBackend> TriggerStore for TableTriggerStore<B> {
    async fn put(
        &self,
        workflow_id: &WorkflowId,
        record: &SubscriptionRecord,
    ) -> Result<(), StorageError> {
        let key = encode_key(workflow_id);
        let value = serde_json::to_string(record).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;
        self.backend.upsert(&key, &value).await?;
        debug!(workflow_id = %workflow_id, key = %key, "trigger record persisted");
        Ok(())
    }

    async fn delete(&self, workflow_id: &WorkflowId) -> Result<(), StorageError> {
        let key = encode_key(workflow_id);
        self.backend.delete(&key).await?;
        debug!(workflow_id = %workflow_id, key = %key, "trigger record deleted");
        Ok(())
    }

    async fn list_all(&self) -> Result<StoredTriggers, StorageError> {
        let rows = self.backend.scan().await?;
        let mut stored = StoredTriggers::default();
        for (key, value) in rows {
            match read_row(&key, &value) {
                Ok(row) => stored.records.push(row),
                Err(error) => {
                    let key = String::from_utf8_lossy(&key).into_owned();
                    warn!(key = %key, error = %error, "skipping unreadable trigger row");
                    stored.unreadable.push(UnreadableRow { key, error });
                }
            }
        }
        Ok(stored)
    }
}
