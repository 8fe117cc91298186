//! Domain types and port definitions for the Service Bus relay.
//!
//! A *trigger* is a caller's registered interest in messages arriving on a
//! broker queue or topic subscription, relayed to an HTTP callback. This crate
//! holds every concept the relay engine and its adapters share: identifiers,
//! the persisted trigger record, broker messages, the error taxonomy, request
//! validation, and the port traits the infrastructure crates implement.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`WorkflowId`, `ListenerId`) |
//! | [`types`] | Trigger record, broker target, listener status |
//! | [`message`] | Brokered messages and the callback envelope |
//! | [`errors`] | Error taxonomy and retry policy |
//! | [`request`] | Registration request wire model and validation |
//! | [`ports`] | Traits for the durable store, broker, and callback transport |

pub mod errors;
pub mod identifiers;
pub mod message;
pub mod ports;
pub mod request;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{
    BrokerError, DeliveryError, RelayError, RetryPolicy, StorageError, ValidationError,
    ValidationErrors,
};
pub use identifiers::{ListenerId, WorkflowId};
pub use message::{BrokeredMessage, CallbackPayload, LockToken, MessageProperties, ReceivedMessage};
pub use ports::{BrokerConnection, BrokerConnector, CallbackClient, MessageReceiver, TriggerStore};
pub use request::{SubscriptionRequest, TriggerConfig, TriggerOwner, UnsubscribeRequest};
pub use types::{
    BrokerTarget, CallbackUrl, ConnectionString, ListenerState, ListenerStatus,
    RegisteredTrigger, StoredTriggers, SubscriptionRecord, UnreadableRow,
};
