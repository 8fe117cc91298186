//! Newtype domain identifiers.
//!
//! Every concept with an identity is a distinct newtype wrapping a primitive, so
//! a [`WorkflowId`] can never be confused with a queue name or a
//! [`ListenerId`] even though the first two are both strings underneath.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (caller supplied)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a trigger by its owning workflow.
    ///
    /// Supplied by the caller and globally unique across the registry. Usually
    /// an ARM resource path such as
    /// `/subscriptions/<scope>/resourceGroups/<rg>/providers/Microsoft.Logic/workflows/<name>`,
    /// so it routinely contains characters the durable store cannot use in keys.
    WorkflowId
}

impl WorkflowId {
    /// Returns the tenant scope segment of the identifier, if present.
    ///
    /// The scope is the third `/`-separated segment, i.e. `<scope>` in
    /// `/subscriptions/<scope>/...`.
    pub fn scope_segment(&self) -> Option<&str> {
        self.0.split('/').nth(2).filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one listener instance.
///
/// A new id is generated every time a listener is started, so a stale exit
/// notification from a replaced listener can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Generates a new random listener identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
