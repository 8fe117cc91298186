//! Listener tuning shared by every listener a registry starts.

use std::time::Duration;

use triggers::ConnectionString;

/// Explicit configuration for listeners; there is no global state.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Simultaneous in-flight deliveries per listener.
    pub max_concurrent_deliveries: usize,
    /// How long a stopping listener waits for in-flight deliveries before
    /// abandoning the rest.
    pub drain_timeout: Duration,
    /// Pause after a transient receive failure.
    pub receive_retry_delay: Duration,
    /// Extra time the registry waits beyond `drain_timeout` for the receiver
    /// and connection to close before force-removing a listener.
    pub stop_grace: Duration,
    /// Connection string for triggers that do not carry their own.
    pub default_connection_string: Option<ConnectionString>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 10,
            drain_timeout: Duration::from_secs(30),
            receive_retry_delay: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            default_connection_string: None,
        }
    }
}

impl ListenerConfig {
    /// Upper bound the registry waits for one listener to stop.
    pub fn stop_timeout(&self) -> Duration {
        self.drain_timeout.saturating_add(self.stop_grace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_timeout_adds_grace_to_drain() {
        let config = ListenerConfig {
            drain_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            ..ListenerConfig::default()
        };
        assert_eq!(config.stop_timeout(), Duration::from_secs(32));
    }

    #[test]
    fn stop_timeout_saturates_on_huge_drain() {
        let config = ListenerConfig {
            drain_timeout: Duration::MAX,
            ..ListenerConfig::default()
        };
        assert_eq!(config.stop_timeout(), Duration::MAX);
    }
}
