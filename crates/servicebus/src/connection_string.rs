//! Service Bus connection-string parsing.
//!
//! Grammar: `;`-separated `Key=Value` pairs, keys case-insensitive:
//!
//! ```text
//! Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>[;OperationTimeout=[d.]hh:mm:ss]
//! ```

use std::time::Duration;

use triggers::BrokerError;
use url::Url;

/// Parsed connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceBusConnectionString {
    /// HTTP(S) base address of the namespace, always ending in `/`.
    pub endpoint: Url,
    pub key_name: String,
    pub key: String,
    /// `OperationTimeout=`, when present.
    pub operation_timeout: Option<Duration>,
}

impl std::fmt::Debug for ServiceBusConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBusConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

fn config_error(message: impl Into<String>) -> BrokerError {
    BrokerError::Configuration {
        message: message.into(),
    }
}

impl ServiceBusConnectionString {
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut operation_timeout = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| config_error(format!("malformed segment without '=': '{}'", segment_name(part))))?;
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(parse_endpoint(value.trim())?),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_owned()),
                "sharedaccesskey" => key = Some(value.trim().to_owned()),
                "operationtimeout" => operation_timeout = Some(parse_timespan(value.trim())?),
                // EntityPath, TransportType and friends do not affect the REST transport.
                _ => {}
            }
        }

        Ok(Self {
            endpoint: endpoint.ok_or_else(|| config_error("connection string has no Endpoint"))?,
            key_name: key_name
                .filter(|k| !k.is_empty())
                .ok_or_else(|| config_error("connection string has no SharedAccessKeyName"))?,
            key: key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| config_error("connection string has no SharedAccessKey"))?,
            operation_timeout,
        })
    }
}

// Never echo a segment's value: it may be the key.
fn segment_name(part: &str) -> &str {
    part.get(..part.len().min(24)).unwrap_or("")
}

/// `sb://host/` is addressed as `https://host/`; `http(s)://` is used verbatim.
fn parse_endpoint(value: &str) -> Result<Url, BrokerError> {
    let parsed =
        Url::parse(value).map_err(|e| config_error(format!("invalid Endpoint '{value}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| config_error(format!("Endpoint '{value}' has no host")))?;

    let base = match parsed.scheme() {
        "sb" => match parsed.port() {
            Some(port) => format!("https://{host}:{port}/"),
            None => format!("https://{host}/"),
        },
        "http" | "https" => {
            let mut s = parsed.as_str().to_owned();
            if !s.ends_with('/') {
                s.push('/');
            }
            s
        }
        other => return Err(config_error(format!("unsupported Endpoint scheme '{other}'"))),
    };
    Url::parse(&base).map_err(|e| config_error(format!("invalid Endpoint '{value}': {e}")))
}

/// Parses a .NET `TimeSpan` literal: `[d.]hh:mm:ss[.fraction]`.
pub fn parse_timespan(value: &str) -> Result<Duration, BrokerError> {
    let bad = || config_error(format!("invalid OperationTimeout '{value}'"));

    let parts: Vec<&str> = value.split(':').collect();
    let [hours_part, minutes, seconds] = parts.as_slice() else {
        return Err(bad());
    };

    let (days, hours) = match hours_part.split_once('.') {
        Some((d, h)) => (d.parse::<u64>().map_err(|_| bad())?, h),
        None => (0, *hours_part),
    };
    let hours: u64 = hours.parse().map_err(|_| bad())?;
    let minutes: u64 = minutes.parse().map_err(|_| bad())?;
    let seconds: f64 = seconds.parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 || !(0.0..60.0).contains(&seconds) {
        return Err(bad());
    }

    let whole = days
        .checked_mul(86_400)
        .and_then(|d| d.checked_add(hours * 3_600 + minutes * 60))
        .ok_or_else(bad)?;
    Ok(Duration::from_secs(whole).saturating_add(Duration::from_secs_f64(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CS: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=abc+def/ghi=";

    #[test]
    fn parses_standard_connection_string() {
        let cs = ServiceBusConnectionString::parse(CS).unwrap();
        assert_eq!(cs.endpoint.as_str(), "https://contoso.servicebus.windows.net/");
        assert_eq!(cs.key_name, "RootManageSharedAccessKey");
        assert_eq!(cs.key, "abc+def/ghi=");
        assert_eq!(cs.operation_timeout, None);
    }

    #[test]
    fn keys_are_case_insensitive_and_timeout_is_read() {
        let cs = ServiceBusConnectionString::parse(
            "endpoint=http://127.0.0.1:5672;sharedaccesskeyname=k;sharedaccesskey=v;OperationTimeout=01:00:00;",
        )
        .unwrap();
        assert_eq!(cs.endpoint.as_str(), "http://127.0.0.1:5672/");
        assert_eq!(cs.operation_timeout, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn missing_parts_are_configuration_errors() {
        for raw in [
            "SharedAccessKeyName=k;SharedAccessKey=v",
            "Endpoint=sb://ns/;SharedAccessKey=v",
            "Endpoint=sb://ns/;SharedAccessKeyName=k",
            "Endpoint=sb://ns/;SharedAccessKeyName=k;SharedAccessKey=",
            "Endpoint=ftp://ns/;SharedAccessKeyName=k;SharedAccessKey=v",
            "garbage",
        ] {
            assert!(
                matches!(
                    ServiceBusConnectionString::parse(raw),
                    Err(BrokerError::Configuration { .. })
                ),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn debug_hides_key() {
        let cs = ServiceBusConnectionString::parse(CS).unwrap();
        assert!(!format!("{cs:?}").contains("abc+def"));
    }

    #[test]
    fn timespans() {
        assert_eq!(parse_timespan("00:01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_timespan("1.02:00:00").unwrap(),
            Duration::from_secs(86_400 + 7_200)
        );
        assert_eq!(
            parse_timespan("00:00:01.5").unwrap(),
            Duration::from_millis(1500)
        );
        assert!(parse_timespan("60").is_err());
        assert!(parse_timespan("00:61:00").is_err());
        assert!(parse_timespan("999999999999999.00:00:00").is_err());
    }
}
