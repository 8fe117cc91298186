//! Port traits implemented by the infrastructure crates.
//!
//! The relay engine depends only on these traits. `table-store` implements
//! [`TriggerStore`], `servicebus` implements the broker traits, and `callback`
//! implements [`CallbackClient`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{BrokerError, DeliveryError, StorageError};
use crate::{
    BrokerTarget, CallbackPayload, CallbackUrl, ReceivedMessage, StoredTriggers, SubscriptionRecord,
    WorkflowId,
};

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Durable table of trigger records keyed by workflow id.
///
/// Implementations are responsible for mapping workflow ids onto whatever key
/// grammar the backing store accepts, and for mapping them back on read.
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Inserts or replaces the record stored under `workflow_id`.
    async fn put(
        &self,
        workflow_id: &WorkflowId,
        record: &SubscriptionRecord,
    ) -> Result<(), StorageError>;

    /// Removes the record stored under `workflow_id`. Removing an absent key
    /// succeeds.
    async fn delete(&self, workflow_id: &WorkflowId) -> Result<(), StorageError>;

    /// Returns every stored record with its decoded key.
    ///
    /// Rows that cannot be decoded are reported in
    /// [`StoredTriggers::unreadable`]; only a failure of the scan itself is
    /// an `Err`.
    async fn list_all(&self) -> Result<StoredTriggers, StorageError>;
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Creates broker connections from connection strings.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, connection_string: &str)
        -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// One open connection to a broker namespace. Owned by exactly one listener.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a peek-lock receiver on a queue or topic subscription.
    async fn open_receiver(
        &self,
        target: &BrokerTarget,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError>;

    /// Closes the connection. Receivers opened from it stop working.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Peek-lock receiver with explicit settlement.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Waits for the next message and locks it.
    ///
    /// Returns `Ok(None)` when no message arrived within the receiver's wait
    /// window. Dropping the future before it resolves is allowed; a message
    /// locked by an abandoned call is redelivered when its lock expires.
    async fn receive(&self) -> Result<Option<ReceivedMessage>, BrokerError>;

    /// Marks a message as processed; the broker removes it.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Releases a message's lock so the broker redelivers it.
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Closes the receiver. Later calls fail with [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// Delivers one relayed message to a trigger's callback URL.
#[async_trait]
pub trait CallbackClient: Send + Sync {
    /// POSTs `payload` as JSON.
    ///
    /// Success means the request completed without a transport error; the
    /// response status is not inspected.
    async fn post(&self, url: &CallbackUrl, payload: &CallbackPayload)
        -> Result<(), DeliveryError>;
}
