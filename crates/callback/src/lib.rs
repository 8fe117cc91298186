//! HTTP callback client adapter.
//!
//! Implements [`triggers::CallbackClient`] over `reqwest`: each relayed message
//! is POSTed to the trigger's callback URL as a JSON
//! [`CallbackPayload`](triggers::CallbackPayload).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport, timeouts and serialisation live here. The
//! relay sees only the [`triggers::CallbackClient`] trait.
//!
//! ## Delivery outcome
//!
//! A delivery fails only when the request cannot be sent or no response
//! arrives (connection refused, DNS failure, timeout). Any HTTP response,
//! including a 4xx or 5xx, counts as delivered and the message is completed.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use triggers::{CallbackClient, CallbackPayload, CallbackUrl, DeliveryError};

/// Default per-request timeout, matching the default of common HTTP stacks.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(100);

/// [`CallbackClient`] backed by a shared `reqwest` connection pool.
#[derive(Clone)]
pub struct HttpCallbackClient {
    http: reqwest::Client,
}

impl HttpCallbackClient {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Callback {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl CallbackClient for HttpCallbackClient {
    async fn post(
        &self,
        url: &CallbackUrl,
        payload: &CallbackPayload,
    ) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(url.as_url().clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() || e.is_body() {
                    DeliveryError::Serialization {
                        message: e.to_string(),
                    }
                } else {
                    DeliveryError::Callback {
                        message: e.to_string(),
                    }
                }
            })?;

        debug!(
            callback = %url,
            status = response.status().as_u16(),
            message_id = payload.properties.message_id.as_deref().unwrap_or("<none>"),
            "callback responded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triggers::{BrokeredMessage, LockToken, ReceivedMessage};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> CallbackPayload {
        CallbackPayload::from_received(&ReceivedMessage {
            lock_token: LockToken::new("lock-1"),
            message: BrokeredMessage::new("m-1", br#"{"id":1}"#.to_vec()),
        })
    }

    fn client() -> HttpCallbackClient {
        HttpCallbackClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "MessageId": "m-1",
                "LockToken": "lock-1",
                "ContentData": "{\"id\":1}",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = CallbackUrl::parse(&format!("{}/cb", server.uri())).unwrap();
        client().post(&url, &payload()).await.unwrap();
    }

    #[tokio::test]
    async fn error_status_still_counts_as_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let url = CallbackUrl::parse(&format!("{}/cb", server.uri())).unwrap();
        assert!(client().post(&url, &payload()).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_callback_is_a_delivery_error() {
        // Bind then drop a listener so the port is known to be closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = CallbackUrl::parse(&format!("http://127.0.0.1:{port}/cb")).unwrap();
        assert!(matches!(
            client().post(&url, &payload()).await,
            Err(DeliveryError::Callback { .. })
        ));
    }

    #[tokio::test]
    async fn slow_callback_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = HttpCallbackClient::new(Duration::from_millis(200)).unwrap();
        let url = CallbackUrl::parse(&format!("{}/cb", server.uri())).unwrap();
        assert!(matches!(
            client.post(&url, &payload()).await,
            Err(DeliveryError::Callback { .. })
        ));
    }
}
