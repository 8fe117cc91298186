//! Shared Access Signature tokens.
//!
//! A token authorises requests against a resource URI until its expiry:
//!
//! ```text
//! SharedAccessSignature sr=<enc(uri)>&sig=<enc(base64(hmac_sha256(key, enc(uri) + "\n" + expiry)))>&se=<expiry>&skn=<key name>
//! ```
//!
//! Tokens are scoped to the namespace root so one token covers every entity
//! a connection touches.

use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use triggers::BrokerError;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Tokens are renewed this long before they expire.
const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(300);

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Builds a token for `resource` that expires at `expiry` (Unix seconds).
pub fn sign(resource: &str, key_name: &str, key: &str, expiry: i64) -> Result<String, BrokerError> {
    let encoded_resource = encode(&resource.to_lowercase());
    let string_to_sign = format!("{encoded_resource}\n{expiry}");

    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| {
        BrokerError::Configuration {
            message: format!("unusable shared access key: {e}"),
        }
    })?;
    mac.update(string_to_sign.as_bytes());
    let signature =
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}&skn={}",
        encode(&signature),
        encode(key_name),
    ))
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

/// Issues and caches tokens for one namespace.
pub struct SasTokenProvider {
    resource: String,
    key_name: String,
    key: String,
    ttl: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl SasTokenProvider {
    pub fn new(
        resource: impl Into<String>,
        key_name: impl Into<String>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            resource: resource.into(),
            key_name: key_name.into(),
            key: key.into(),
            ttl: ttl.max(RENEW_BEFORE_EXPIRY * 2),
            cached: Mutex::new(None),
        }
    }

    /// Returns a token valid for at least the renewal margin.
    pub fn token(&self) -> Result<String, BrokerError> {
        let now = chrono::Utc::now().timestamp();
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(token) = cached.as_ref() {
            if token.expires_at - now > RENEW_BEFORE_EXPIRY.as_secs() as i64 {
                return Ok(token.value.clone());
            }
        }

        let expires_at = now + self.ttl.as_secs() as i64;
        let value = sign(&self.resource, &self.key_name, &self.key, expires_at)?;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }
}
