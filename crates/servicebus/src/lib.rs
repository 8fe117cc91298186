//! Broker adapters for the relay.
//!
//! ## Architectural Layer
//!
//! **Infrastructure adapter.** Implements the broker ports from `triggers`
//! ([`BrokerConnector`](triggers::BrokerConnector),
//! [`BrokerConnection`](triggers::BrokerConnection) and
//! [`MessageReceiver`](triggers::MessageReceiver)).
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`connection_string`] | `Endpoint=...;SharedAccessKeyName=...` parsing |
//! | [`sas`] | Shared Access Signature token signing and caching |
//! | [`rest`] | Peek-lock receive and settlement over the Service Bus REST API |
//! | [`memory`] | Shared in-process broker for tests and local runs |

pub mod connection_string;
pub mod memory;
pub mod rest;
pub mod sas;

pub use connection_string::ServiceBusConnectionString;
pub use memory::InMemoryBroker;
pub use rest::{ServiceBusConnector, ServiceBusSettings};
pub use sas::SasTokenProvider;
