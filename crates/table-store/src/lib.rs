//! Durable trigger table.
//!
//! Implements the [`triggers::TriggerStore`] port on top of a single-column
//! key-value table. Workflow ids are escaped into the table's partition-key
//! grammar on write and unescaped on read ([`key`]); records are stored as
//! JSON. Two tables are provided:
//!
//! - [`SledTable`]: embedded sled database; the production backend.
//! - [`InMemoryTable`]: non-durable, with fault injection, for tests.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Key grammar and serialisation format live here. The
//! relay engine sees only [`triggers::TriggerStore`].

pub mod backend;
pub mod key;
pub mod store;

pub use backend::{InMemoryTable, SledTable, TableBackend, TRIGGER_TABLE};
pub use key::{decode_key, encode_key};
pub use store::TableTriggerStore;
