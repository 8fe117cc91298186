//! Shared value types for the relay domain.
//!
//! Unlike the identifiers in [`crate::identifiers`], these types carry values
//! with invariants (callback URLs are absolute HTTP(S) URLs, a broker target is
//! exactly one of queue or topic/subscription) and flow between the registry,
//! the listeners, and the durable store.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ListenerId, StorageError, WorkflowId};

// ---------------------------------------------------------------------------
// Callback URL
// ---------------------------------------------------------------------------

/// Absolute `http`/`https` URL that receives relayed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackUrl(Url);

impl CallbackUrl {
    /// Parses a callback URL, returning `None` unless it is an absolute
    /// `http` or `https` URL with a host.
    pub fn parse(value: &str) -> Option<Self> {
        let url = Url::parse(value).ok()?;
        let supported = matches!(url.scheme(), "http" | "https");
        if supported && url.has_host() {
            Some(Self(url))
        } else {
            None
        }
    }

    /// Returns the URL as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the parsed [`Url`].
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl std::fmt::Display for CallbackUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Connection string
// ---------------------------------------------------------------------------

/// Broker connection string.
///
/// Contains a shared access key, so `Debug` and `Display` never print the
/// value. Use [`ConnectionString::expose`] at the transport boundary only.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionString(String);

impl ConnectionString {
    /// Wraps a connection string, returning `None` if it is blank.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        if v.trim().is_empty() {
            None
        } else {
            Some(Self(v))
        }
    }

    /// Returns the raw connection string.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionString(<redacted>)")
    }
}

impl std::fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

// ---------------------------------------------------------------------------
// Broker target
// ---------------------------------------------------------------------------

/// Where a trigger reads messages from.
///
/// Exactly one variant is populated. The request validator is the only place
/// that decides which one; storage round-trips whatever it is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BrokerTarget {
    /// A named queue.
    Queue {
        /// Queue name (may be a hierarchical path).
        name: String,
    },
    /// A named subscription on a topic.
    #[serde(rename_all = "camelCase")]
    TopicSubscription {
        /// Topic name.
        topic: String,
        /// Subscription name on that topic.
        subscription_name: String,
    },
}

impl BrokerTarget {
    /// Entity path relative to the namespace root, e.g. `orders` or
    /// `events/subscriptions/audit`.
    pub fn entity_path(&self) -> String {
        match self {
            Self::Queue { name } => name.clone(),
            Self::TopicSubscription {
                topic,
                subscription_name,
            } => format!("{topic}/subscriptions/{subscription_name}"),
        }
    }
}

impl std::fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue { name } => write!(f, "queue={name}"),
            Self::TopicSubscription {
                topic,
                subscription_name,
            } => write!(f, "topic={topic}, subscription={subscription_name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription record
// ---------------------------------------------------------------------------

/// One registered trigger, exactly as it is persisted.
///
/// The runtime listener handle is deliberately not part of this type; the
/// registry keeps it beside the record and exposes it through
/// [`RegisteredTrigger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    /// Unique key of the trigger.
    pub workflow_id: WorkflowId,
    /// Informational name used in logs.
    pub display_name: String,
    /// Where relayed messages are POSTed.
    pub callback_url: CallbackUrl,
    /// Queue or topic/subscription to read from.
    pub broker_target: BrokerTarget,
    /// Trigger-specific connection string; the process default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_credential: Option<ConnectionString>,
}

impl SubscriptionRecord {
    /// Returns the record's own connection string, or `default` when it has none.
    pub fn resolve_credential<'a>(
        &'a self,
        default: Option<&'a ConnectionString>,
    ) -> Option<&'a ConnectionString> {
        self.connection_credential.as_ref().or(default)
    }
}

// ---------------------------------------------------------------------------
// Stored table contents
// ---------------------------------------------------------------------------

/// A durable row that could not be read back as a [`SubscriptionRecord`].
#[derive(Debug)]
pub struct UnreadableRow {
    /// Raw stored key, lossily decoded when it is not UTF-8.
    pub key: String,
    pub error: StorageError,
}

/// Everything read from the durable table in one scan.
///
/// A bad row never hides the good ones; it is listed in `unreadable`.
#[derive(Debug, Default)]
pub struct StoredTriggers {
    pub records: Vec<(WorkflowId, SubscriptionRecord)>,
    pub unreadable: Vec<UnreadableRow>,
}

// ---------------------------------------------------------------------------
// Listener status
// ---------------------------------------------------------------------------

/// Lifecycle state of a listener.
///
/// Transitions only move forward:
/// `Created → Starting → Running → Stopping → Stopped`, with
/// `Starting → Stopped` on a failed start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a listener, as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub listener_id: ListenerId,
    pub state: ListenerState,
    pub target: BrokerTarget,
}

/// A registry entry snapshot: the persisted record plus its listener, if one
/// is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTrigger {
    pub record: SubscriptionRecord,
    pub listener: Option<ListenerStatus>,
}

impl RegisteredTrigger {
    /// Returns `true` if a listener is attached and currently running.
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|l| l.state == ListenerState::Running)
    }
}
