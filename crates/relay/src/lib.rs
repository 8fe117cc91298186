//! Trigger registry and message relay engine.
//!
//! Owns the registry of triggers, one [`Listener`] per trigger, and the
//! [`RegistrationService`] the HTTP layer calls.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between the domain
//! types in [`triggers`] and the infrastructure ports (durable store, broker,
//! callback). It performs no I/O of its own.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | `ListenerConfig` |
//! | [`listener`] | Receive loop, bounded delivery, drain and stop |
//! | [`registry`] | `TriggerRegistry`: register, unregister, recover, lookup, teardown |
//! | [`service`] | `RegistrationService`: scope check, validation, delegation |

pub mod config;
pub mod listener;
pub mod registry;
pub mod service;

pub use config::ListenerConfig;
pub use listener::{ExitReason, Listener, ListenerExit, ListenerHandle};
pub use registry::{RecoveryReport, TriggerRegistry};
pub use service::{RegistrationService, ScopePolicy};
