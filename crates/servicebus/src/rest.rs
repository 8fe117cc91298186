//! Service Bus over its REST API.
//!
//! | Operation | Request | Success |
//! |-----------|---------|---------|
//! | receive (peek-lock) | `POST {entity}/messages/head?timeout=<secs>` | `201` message, `204` none |
//! | complete | `DELETE <lock uri>` | `200` |
//! | abandon | `PUT <lock uri>` | `200` |
//!
//! The lock URI comes from the `Location` header of the receive response and
//! is carried as the message's [`LockToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use triggers::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerTarget, BrokeredMessage, LockToken,
    MessageProperties, MessageReceiver, ReceivedMessage,
};
use url::Url;

use crate::connection_string::ServiceBusConnectionString;
use crate::sas::SasTokenProvider;

/// Extra time allowed on top of the long-poll wait before a receive request
/// is considered hung.
const RECEIVE_GRACE: Duration = Duration::from_secs(10);

/// Transport settings shared by every connection a connector creates.
#[derive(Debug, Clone)]
pub struct ServiceBusSettings {
    /// Per-request timeout for settlement calls, used when the connection
    /// string has no `OperationTimeout=`.
    pub default_operation_timeout: Duration,
    /// How long one receive call waits for a message.
    pub receive_wait: Duration,
    /// Lifetime of issued SAS tokens.
    pub token_ttl: Duration,
}

impl Default for ServiceBusSettings {
    fn default() -> Self {
        Self {
            default_operation_timeout: Duration::from_secs(60 * 60),
            receive_wait: Duration::from_secs(30),
            token_ttl: Duration::from_secs(60 * 60),
        }
    }
}

fn transient(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Transient {
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// [`BrokerConnector`] for Azure Service Bus namespaces.
pub struct ServiceBusConnector {
    http: reqwest::Client,
    settings: ServiceBusSettings,
}

impl ServiceBusConnector {
    pub fn new(settings: ServiceBusSettings) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, settings })
    }
}

#[async_trait]
impl BrokerConnector for ServiceBusConnector {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let parsed = ServiceBusConnectionString::parse(connection_string)?;
        let operation_timeout = parsed
            .operation_timeout
            .unwrap_or(self.settings.default_operation_timeout);
        let sas = SasTokenProvider::new(
            parsed.endpoint.as_str(),
            parsed.key_name.clone(),
            parsed.key.clone(),
            self.settings.token_ttl,
        );
        // Fail fast on an unusable key rather than on the first receive.
        sas.token()?;

        info!(
            endpoint = %parsed.endpoint,
            operation_timeout_secs = operation_timeout.as_secs(),
            "service bus connection created"
        );

        Ok(Box::new(ServiceBusConnection {
            namespace: Arc::new(Namespace {
                http: self.http.clone(),
                endpoint: parsed.endpoint,
                sas,
                operation_timeout,
                receive_wait: self.settings.receive_wait,
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct Namespace {
    http: reqwest::Client,
    endpoint: Url,
    sas: SasTokenProvider,
    operation_timeout: Duration,
    receive_wait: Duration,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One namespace connection. The REST transport is stateless, so closing only
/// invalidates the receivers opened from it.
pub struct ServiceBusConnection {
    namespace: Arc<Namespace>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for ServiceBusConnection {
    async fn open_receiver(
        &self,
        target: &BrokerTarget,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let names_present = match target {
            BrokerTarget::Queue { name } => !name.is_empty(),
            BrokerTarget::TopicSubscription {
                topic,
                subscription_name,
            } => !topic.is_empty() && !subscription_name.is_empty(),
        };
        if !names_present {
            return Err(BrokerError::Configuration {
                message: format!("incomplete broker target: {target}"),
            });
        }

        let entity = target.entity_path();
        let receive_url = self
            .namespace
            .endpoint
            .join(&format!("{entity}/messages/head"))
            .map_err(|e| BrokerError::Configuration {
                message: format!("invalid entity path '{entity}': {e}"),
            })?;

        debug!(entity = %entity, "service bus receiver opened");
        Ok(Arc::new(ServiceBusReceiver {
            namespace: Arc::clone(&self.namespace),
            entity,
            receive_url,
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// System properties delivered in the `BrokerProperties` response header.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    message_id: Option<String>,
    correlation_id: Option<String>,
    session_id: Option<String>,
    label: Option<String>,
    reply_to: Option<String>,
    to: Option<String>,
    #[serde(default)]
    delivery_count: u32,
    sequence_number: Option<i64>,
    enqueued_time_utc: Option<String>,
    locked_until_utc: Option<String>,
    lock_token: Option<String>,
    time_to_live: Option<f64>,
}

/// Peek-lock receiver for one queue or topic subscription.
pub struct ServiceBusReceiver {
    namespace: Arc<Namespace>,
    entity: String,
    receive_url: Url,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ServiceBusReceiver {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn status_error(&self, status: StatusCode, operation: &str) -> BrokerError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerError::Unauthorized {
                message: format!("{operation} on '{}' returned {status}", self.entity),
            },
            StatusCode::NOT_FOUND | StatusCode::GONE if operation == "receive" => {
                BrokerError::EntityNotFound {
                    entity: self.entity.clone(),
                }
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => BrokerError::LockLost {
                message: format!("{operation} on '{}' returned {status}", self.entity),
            },
            _ => transient(format!("{operation} on '{}' returned {status}", self.entity)),
        }
    }

    fn lock_url(&self, location: Option<&str>, props: &BrokerProperties) -> Option<String> {
        if let Some(location) = location {
            return Some(location.to_owned());
        }
        let (id, token) = (props.message_id.as_ref()?, props.lock_token.as_ref()?);
        self.namespace
            .endpoint
            .join(&format!("{}/messages/{id}/{token}", self.entity))
            .ok()
            .map(String::from)
    }

    async fn settle(
        &self,
        method: reqwest::Method,
        message: &ReceivedMessage,
        operation: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let token = self.namespace.sas.token()?;
        let response = self
            .namespace
            .http
            .request(method, message.lock_token.as_str())
            .header(AUTHORIZATION, token)
            .header(CONTENT_LENGTH, 0)
            .timeout(self.namespace.operation_timeout)
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.status_error(status, operation))
        }
    }
}

#[async_trait]
impl MessageReceiver for ServiceBusReceiver {
    async fn receive(&self) -> Result<Option<ReceivedMessage>, BrokerError> {
        self.ensure_open()?;
        let wait = self.namespace.receive_wait.max(Duration::from_secs(1));
        let mut url = self.receive_url.clone();
        url.query_pairs_mut()
            .append_pair("timeout", &wait.as_secs().to_string());

        let token = self.namespace.sas.token()?;
        let response = self
            .namespace
            .http
            .post(url)
            .header(AUTHORIZATION, token)
            .header(CONTENT_LENGTH, 0)
            .timeout(wait.saturating_add(RECEIVE_GRACE))
            .send()
            .await
            .map_err(transient)?;

        let status = response.status();
        match status {
            StatusCode::NO_CONTENT => return Ok(None),
            StatusCode::CREATED | StatusCode::OK => {}
            _ => return Err(self.status_error(status, "receive")),
        }

        let headers = response.headers().clone();
        let props: BrokerProperties = headers
            .get("BrokerProperties")
            .and_then(|v| v.to_str().ok())
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| transient(format!("malformed BrokerProperties header: {e}")))?
            .unwrap_or_default();
        let location = headers.get(LOCATION).and_then(|v| v.to_str().ok());
        let lock_url = self.lock_url(location, &props).ok_or_else(|| {
            transient("received message without a lock location; it will be redelivered")
        })?;
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(transient)?;

        Ok(Some(ReceivedMessage {
            lock_token: LockToken::new(lock_url),
            message: BrokeredMessage {
                properties: MessageProperties {
                    message_id: props.message_id,
                    correlation_id: props.correlation_id,
                    session_id: props.session_id,
                    label: props.label,
                    content_type,
                    reply_to: props.reply_to,
                    to: props.to,
                    delivery_count: props.delivery_count,
                    sequence_number: props.sequence_number,
                    enqueued_time_utc: props.enqueued_time_utc,
                    locked_until_utc: props.locked_until_utc,
                    time_to_live: props.time_to_live,
                    properties: Default::default(),
                },
                body: body.to_vec(),
            },
        }))
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.settle(reqwest::Method::DELETE, message, "complete").await
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.settle(reqwest::Method::PUT, message, "abandon").await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(entity = %self.entity, "service bus receiver closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connect(server: &MockServer) -> Box<dyn BrokerConnection> {
        let connector = ServiceBusConnector::new(ServiceBusSettings {
            receive_wait: Duration::from_secs(1),
            ..ServiceBusSettings::default()
        })
        .unwrap();
        let cs = format!(
            "Endpoint={}/;SharedAccessKeyName=Root;SharedAccessKey=c2VjcmV0",
            server.uri()
        );
        connector.connect(&cs).await.unwrap()
    }

    fn orders() -> BrokerTarget {
        BrokerTarget::Queue {
            name: "orders".into(),
        }
    }

    #[tokio::test]
    async fn receive_then_complete_uses_lock_location() {
        let server = MockServer::start().await;
        let lock = format!("{}/orders/messages/m-1/lock-1", server.uri());
        Mock::given(method("POST"))
            .and(path("/orders/messages/head"))
            .and(query_param("timeout", "1"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header(
                        "BrokerProperties",
                        r#"{"MessageId":"m-1","DeliveryCount":1,"SequenceNumber":7,"LockToken":"lock-1"}"#,
                    )
                    .insert_header("Location", lock.as_str())
                    .set_body_string(r#"{"id":1}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orders/messages/m-1/lock-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let connection = connect(&server).await;
        let receiver = connection.open_receiver(&orders()).await.unwrap();
        let received = receiver.receive().await.unwrap().expect("a message");

        assert_eq!(received.lock_token.as_str(), lock);
        assert_eq!(received.message.properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(received.message.properties.sequence_number, Some(7));
        assert_eq!(received.message.body, br#"{"id":1}"#.to_vec());

        receiver.complete(&received).await.unwrap();
    }

    #[tokio::test]
    async fn empty_entity_yields_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/t/subscriptions/s/messages/head"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let connection = connect(&server).await;
        let receiver = connection
            .open_receiver(&BrokerTarget::TopicSubscription {
                topic: "t".into(),
                subscription_name: "s".into(),
            })
            .await
            .unwrap();
        assert!(receiver.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandon_puts_lock_and_maps_missing_lock() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/orders/messages/m-1/lock-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/orders/messages/m-2/lock-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let connection = connect(&server).await;
        let receiver = connection.open_receiver(&orders()).await.unwrap();
        let message = |id: &str, lock: &str| ReceivedMessage {
            lock_token: LockToken::new(format!("{}/orders/messages/{id}/{lock}", server.uri())),
            message: BrokeredMessage::new(id, Vec::new()),
        };

        receiver.abandon(&message("m-1", "lock-1")).await.unwrap();
        assert!(matches!(
            receiver.abandon(&message("m-2", "lock-2")).await,
            Err(BrokerError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn receive_status_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/missing/messages/head"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/busy/messages/head"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/secret/messages/head"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let connection = connect(&server).await;
        let receive = |name: &'static str| {
            let connection = &connection;
            async move {
                let target = BrokerTarget::Queue { name: name.into() };
                connection.open_receiver(&target).await.unwrap().receive().await
            }
        };

        let missing = receive("missing").await.unwrap_err();
        assert!(matches!(missing, BrokerError::EntityNotFound { .. }));
        assert!(missing.is_fatal());

        let busy = receive("busy").await.unwrap_err();
        assert!(matches!(busy, BrokerError::Transient { .. }));

        assert!(matches!(
            receive("secret").await.unwrap_err(),
            BrokerError::Unauthorized { .. }
        ));
    }

    #[tokio::test]
    async fn closed_handles_refuse_work() {
        let server = MockServer::start().await;
        let connection = connect(&server).await;
        let receiver = connection.open_receiver(&orders()).await.unwrap();
        let message = ReceivedMessage {
            lock_token: LockToken::new(format!("{}/orders/messages/m/l", server.uri())),
            message: BrokeredMessage::new("m", Vec::new()),
        };

        receiver.close().await.unwrap();
        assert!(matches!(receiver.receive().await, Err(BrokerError::Closed)));
        assert!(matches!(
            receiver.complete(&message).await,
            Err(BrokerError::Closed)
        ));

        let other = connection.open_receiver(&orders()).await.unwrap();
        connection.close().await.unwrap();
        assert!(matches!(other.abandon(&message).await, Err(BrokerError::Closed)));
        assert!(matches!(
            connection.open_receiver(&orders()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn malformed_connection_string_fails_connect() {
        let connector = ServiceBusConnector::new(ServiceBusSettings::default()).unwrap();
        assert!(matches!(
            connector.connect("Endpoint=sb://ns/").await,
            Err(BrokerError::Configuration { .. })
        ));
    }
}
