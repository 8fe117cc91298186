//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use relay::{ListenerConfig, ScopePolicy};
use servicebus::ServiceBusSettings;
use triggers::ConnectionString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Relays Service Bus messages to registered HTTP callbacks.
#[derive(Parser)]
#[command(name = "sbrelay", version, about, long_about = None)]
pub struct Config {
    /// Address of the registration API
    #[arg(long, env = "SBRELAY_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Directory of the durable trigger store
    #[arg(long, env = "SBRELAY_STORE_PATH", default_value = "./sbrelay-store")]
    pub store_path: PathBuf,

    /// Connection string for triggers that do not supply their own
    #[arg(long, env = "SBRELAY_DEFAULT_CONNECTION_STRING", hide_env_values = true)]
    pub default_connection_string: Option<String>,

    /// Service Bus operation timeout when the connection string sets none
    #[arg(long, env = "SBRELAY_OPERATION_TIMEOUT_MINUTES", default_value_t = 60)]
    pub operation_timeout_minutes: u64,

    /// Long-poll wait of one receive call
    #[arg(long, env = "SBRELAY_RECEIVE_WAIT_SECS", default_value_t = 30)]
    pub receive_wait_secs: u64,

    /// In-flight deliveries per trigger
    #[arg(long, env = "SBRELAY_MAX_CONCURRENT_DELIVERIES", default_value_t = 10)]
    pub max_concurrent_deliveries: usize,

    /// How long a stopping listener waits for in-flight deliveries
    #[arg(long, env = "SBRELAY_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Extra wait beyond the drain timeout before a listener that will not
    /// close is force-removed
    #[arg(long, env = "SBRELAY_STOP_GRACE_SECS", default_value_t = 5)]
    pub stop_grace_secs: u64,

    /// Timeout of one callback POST
    #[arg(long, env = "SBRELAY_CALLBACK_TIMEOUT_SECS", default_value_t = 100)]
    pub callback_timeout_secs: u64,

    /// Only accept workflow ids from the configured scope
    #[arg(long, env = "SBRELAY_LIMIT_TO_SCOPE")]
    pub limit_to_scope: bool,

    /// Scope identifier accepted when --limit-to-scope is set
    #[arg(long, env = "SBRELAY_SCOPE_ID")]
    pub scope_id: Option<String>,

    /// Log output format
    #[arg(long, env = "SBRELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint; enables trace export when set
    #[arg(long, env = "SBRELAY_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "SBRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            max_concurrent_deliveries: self.max_concurrent_deliveries.max(1),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            default_connection_string: self
                .default_connection_string
                .as_deref()
                .and_then(ConnectionString::new),
            ..ListenerConfig::default()
        }
    }

    pub fn servicebus_settings(&self) -> ServiceBusSettings {
        ServiceBusSettings {
            default_operation_timeout: Duration::from_secs(
                self.operation_timeout_minutes.saturating_mul(60),
            ),
            receive_wait: Duration::from_secs(self.receive_wait_secs.max(1)),
            ..ServiceBusSettings::default()
        }
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn scope_policy(&self) -> Result<ScopePolicy> {
        if !self.limit_to_scope {
            return Ok(ScopePolicy::Unrestricted);
        }
        match self.scope_id.as_deref().map(str::trim) {
            Some(scope) if !scope.is_empty() => Ok(ScopePolicy::LimitTo(scope.to_owned())),
            _ => bail!("--limit-to-scope requires --scope-id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["sbrelay"]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.log_format, LogFormat::Text);

        let listener = config.listener_config();
        assert_eq!(listener.max_concurrent_deliveries, 10);
        assert_eq!(listener.drain_timeout, Duration::from_secs(30));
        assert_eq!(
            config.servicebus_settings().default_operation_timeout,
            Duration::from_secs(3600)
        );
        assert_eq!(config.scope_policy().unwrap(), ScopePolicy::Unrestricted);
    }

    #[test]
    fn scope_check_needs_a_scope_id() {
        let config = Config::try_parse_from(["sbrelay", "--limit-to-scope"]).unwrap();
        assert!(config.scope_policy().is_err());

        let config =
            Config::try_parse_from(["sbrelay", "--limit-to-scope", "--scope-id", "sub-1"]).unwrap();
        assert_eq!(
            config.scope_policy().unwrap(),
            ScopePolicy::LimitTo("sub-1".into())
        );
    }

    #[test]
    fn huge_timeouts_saturate() {
        let max = u64::MAX.to_string();
        let config = Config::try_parse_from([
            "sbrelay",
            "--operation-timeout-minutes",
            max.as_str(),
            "--drain-timeout-secs",
            max.as_str(),
            "--stop-grace-secs",
            max.as_str(),
        ])
        .unwrap();

        assert_eq!(
            config.servicebus_settings().default_operation_timeout,
            Duration::from_secs(u64::MAX)
        );
        assert_eq!(config.listener_config().stop_timeout(), Duration::MAX);
    }

    #[test]
    fn blank_default_connection_string_is_ignored() {
        let config =
            Config::try_parse_from(["sbrelay", "--default-connection-string", " "]).unwrap();
        assert!(config.listener_config().default_connection_string.is_none());
    }
}
