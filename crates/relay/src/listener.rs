//! Per-trigger listener: receive loop, bounded delivery pool, drain on stop.
//!
//! A listener is bound to one [`SubscriptionRecord`] for its whole life.
//! [`Listener::start`] connects and opens the receiver before returning, so
//! start failures reach the caller synchronously; the receive loop then runs
//! as its own task until it is stopped through the [`ListenerHandle`] or hits
//! a fatal broker error.
//!
//! Each received message is delivered by an independent task holding one
//! semaphore permit. Every message is settled exactly once: completed after a
//! successful POST, abandoned otherwise. A message still in flight when the
//! drain timeout expires is abandoned by the shutdown path, and the late
//! delivery task then skips settlement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};
use triggers::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerTarget, CallbackClient,
    CallbackPayload, DeliveryError, ListenerId, ListenerState, ListenerStatus, MessageReceiver,
    ReceivedMessage, SubscriptionRecord, WorkflowId,
};

use crate::config::ListenerConfig;

// ---------------------------------------------------------------------------
// Exit notification
// ---------------------------------------------------------------------------

/// Why a listener's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The registry asked it to stop.
    Requested,
    /// The broker reported an unrecoverable error.
    ConnectionLost { error: String },
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::ConnectionLost { error } => write!(f, "connection lost: {error}"),
        }
    }
}

/// Sent to the registry once a listener reaches `Stopped`.
#[derive(Debug, Clone)]
pub struct ListenerExit {
    pub workflow_id: WorkflowId,
    pub listener_id: ListenerId,
    pub reason: ExitReason,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Registry-side handle to a running listener.
pub struct ListenerHandle {
    id: ListenerId,
    target: BrokerTarget,
    state: watch::Receiver<ListenerState>,
    stop_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            listener_id: self.id,
            state: self.state(),
            target: self.target.clone(),
        }
    }

    /// Requests a stop and waits for the drain and close to finish.
    ///
    /// Callers bound this with [`ListenerConfig::stop_timeout`]. Calling it
    /// again after the listener has stopped returns immediately.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(listener_id = %self.id, error = %e, "listener task panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

type InFlight = Arc<Mutex<HashMap<u64, ReceivedMessage>>>;

fn lock_in_flight(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashMap<u64, ReceivedMessage>> {
    in_flight.lock().unwrap_or_else(|p| p.into_inner())
}

/// Resolves once a stop is requested or the handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// The running side of a listener.
pub struct Listener {
    id: ListenerId,
    record: Arc<SubscriptionRecord>,
    connection: Box<dyn BrokerConnection>,
    receiver: Arc<dyn MessageReceiver>,
    callback: Arc<dyn CallbackClient>,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
    exits: mpsc::UnboundedSender<ListenerExit>,
}

impl Listener {
    /// Connects, opens the receiver and spawns the receive loop.
    ///
    /// On failure the listener goes straight to `Stopped` and nothing is left
    /// running.
    pub async fn start(
        record: &SubscriptionRecord,
        connector: &dyn BrokerConnector,
        callback: Arc<dyn CallbackClient>,
        config: &ListenerConfig,
        exits: mpsc::UnboundedSender<ListenerExit>,
    ) -> Result<Arc<ListenerHandle>, BrokerError> {
        let id = ListenerId::new_random();
        let span = tracing::info_span!(
            "listener",
            trigger = %record.display_name,
            workflow_id = %record.workflow_id,
            listener_id = %id,
            target = %record.broker_target,
        );
        let (state, state_rx) = watch::channel(ListenerState::Created);

        state.send_replace(ListenerState::Starting);
        let opened = Self::open(record, connector, config)
            .instrument(span.clone())
            .await;
        let (connection, receiver) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                state.send_replace(ListenerState::Stopped);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = Self {
            id,
            record: Arc::new(record.clone()),
            connection,
            receiver,
            callback,
            config: config.clone(),
            state,
            exits,
        };
        listener.state.send_replace(ListenerState::Running);
        info!(parent: &span, "listener running");

        let task = tokio::spawn(listener.run(stop_rx).instrument(span));
        Ok(Arc::new(ListenerHandle {
            id,
            target: record.broker_target.clone(),
            state: state_rx,
            stop_tx,
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }

    async fn open(
        record: &SubscriptionRecord,
        connector: &dyn BrokerConnector,
        config: &ListenerConfig,
    ) -> Result<(Box<dyn BrokerConnection>, Arc<dyn MessageReceiver>), BrokerError> {
        let credential = record
            .resolve_credential(config.default_connection_string.as_ref())
            .ok_or_else(|| BrokerError::Configuration {
                message: "no connection string for trigger and no default configured".into(),
            })?;

        let connection = connector.connect(credential.expose()).await.map_err(|e| {
            warn!(error = %e, "broker connection failed");
            e
        })?;
        match connection.open_receiver(&record.broker_target).await {
            Ok(receiver) => Ok((connection, receiver)),
            Err(e) => {
                warn!(error = %e, "opening receiver failed");
                if let Err(close) = connection.close().await {
                    debug!(error = %close, "closing connection after failed start");
                }
                Err(e)
            }
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let in_flight: InFlight = Arc::default();
        let delivery = Arc::new(Delivery {
            record: Arc::clone(&self.record),
            receiver: Arc::clone(&self.receiver),
            callback: Arc::clone(&self.callback),
            in_flight: Arc::clone(&in_flight),
        });
        let mut deliveries = JoinSet::new();
        let mut next_key = 0u64;

        let reason = loop {
            while deliveries.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = stop_requested(&mut stop) => break ExitReason::Requested,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break ExitReason::Requested,
                },
            };

            let received = tokio::select! {
                _ = stop_requested(&mut stop) => break ExitReason::Requested,
                received = self.receiver.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    let key = next_key;
                    next_key += 1;
                    lock_in_flight(&in_flight).insert(key, message.clone());
                    let delivery = Arc::clone(&delivery);
                    let span = tracing::debug_span!(
                        "delivery",
                        message_id = %message.message.id_for_log(),
                        delivery_count = message.message.properties.delivery_count,
                    );
                    deliveries.spawn(
                        async move {
                            let _permit = permit;
                            delivery.deliver(key, message).await;
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "receive failed permanently; listener exiting");
                    break ExitReason::ConnectionLost {
                        error: e.to_string(),
                    };
                }
                Err(e) => {
                    warn!(error = %e, "receive failed; retrying");
                    tokio::select! {
                        _ = stop_requested(&mut stop) => break ExitReason::Requested,
                        _ = tokio::time::sleep(self.config.receive_retry_delay) => {}
                    }
                }
            }
        };

        self.shutdown(deliveries, in_flight, reason).await;
    }

    async fn shutdown(self, mut deliveries: JoinSet<()>, in_flight: InFlight, reason: ExitReason) {
        self.state.send_replace(ListenerState::Stopping);
        info!(reason = %reason, in_flight = deliveries.len(), "listener stopping");

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while deliveries.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            let stragglers: Vec<ReceivedMessage> =
                lock_in_flight(&in_flight).drain().map(|(_, m)| m).collect();
            warn!(
                count = stragglers.len(),
                drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "drain timeout elapsed; abandoning in-flight messages"
            );
            for message in &stragglers {
                if let Err(e) = self.receiver.abandon(message).await {
                    warn!(
                        message_id = %message.message.id_for_log(),
                        error = %e,
                        "abandoning in-flight message failed"
                    );
                }
            }
            deliveries.detach_all();
        }

        if let Err(e) = self.receiver.close().await {
            warn!(error = %e, "closing receiver failed");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "closing broker connection failed");
        }

        self.state.send_replace(ListenerState::Stopped);
        info!(reason = %reason, "listener stopped");
        let _ = self.exits.send(ListenerExit {
            workflow_id: self.record.workflow_id.clone(),
            listener_id: self.id,
            reason,
        });
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

struct Delivery {
    record: Arc<SubscriptionRecord>,
    receiver: Arc<dyn MessageReceiver>,
    callback: Arc<dyn CallbackClient>,
    in_flight: InFlight,
}

impl Delivery {
    async fn deliver(&self, key: u64, received: ReceivedMessage) {
        let payload = CallbackPayload::from_received(&received);
        let posted = self.callback.post(&self.record.callback_url, &payload).await;

        if lock_in_flight(&self.in_flight).remove(&key).is_none() {
            debug!("message was already abandoned by shutdown; skipping settlement");
            return;
        }

        let failure = match posted {
            Ok(()) => match self.receiver.complete(&received).await {
                Ok(()) => {
                    debug!("message delivered and completed");
                    return;
                }
                Err(e) => DeliveryError::Settlement(e),
            },
            Err(e) => e,
        };

        warn!(
            trigger = %self.record.display_name,
            workflow_id = %self.record.workflow_id,
            error = %failure,
            "delivery failed; abandoning message"
        );
        if let Err(e) = self.receiver.abandon(&received).await {
            warn!(
                trigger = %self.record.display_name,
                workflow_id = %self.record.workflow_id,
                error = %e,
                "abandoning message failed; it is redelivered when its lock expires"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use servicebus::InMemoryBroker;
    use triggers::{BrokeredMessage, CallbackUrl, ConnectionString};

    /// Records every POST; optionally fails or stalls.
    #[derive(Default)]
    struct RecordingCallback {
        posts: Mutex<Vec<CallbackPayload>>,
        fail: bool,
        delay: Option<Duration>,
        active: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl CallbackClient for RecordingCallback {
        async fn post(
            &self,
            _url: &CallbackUrl,
            payload: &CallbackPayload,
        ) -> Result<(), DeliveryError> {
            use std::sync::atomic::Ordering;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.posts.lock().unwrap().push(payload.clone());
            if self.fail {
                Err(DeliveryError::Callback {
                    message: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn record(queue: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            workflow_id: WorkflowId::new("W1").unwrap(),
            display_name: "orders-app".into(),
            callback_url: CallbackUrl::parse("http://x/cb").unwrap(),
            broker_target: BrokerTarget::Queue { name: queue.into() },
            connection_credential: ConnectionString::new("Endpoint=sb://memory/"),
        }
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            drain_timeout: Duration::from_millis(200),
            receive_retry_delay: Duration::from_millis(10),
            ..ListenerConfig::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn missing_credential_fails_start() {
        let broker = InMemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut rec = record("orders");
        rec.connection_credential = None;

        let err = Listener::start(
            &rec,
            &broker,
            Arc::new(RecordingCallback::default()),
            &config(),
            tx,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, BrokerError::Configuration { .. }));
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let broker = InMemoryBroker::new();
        for i in 0..8 {
            broker.send_to_queue("orders", BrokeredMessage::new(format!("m-{i}"), Vec::new()));
        }
        let callback = Arc::new(RecordingCallback {
            delay: Some(Duration::from_millis(50)),
            ..RecordingCallback::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let cfg = ListenerConfig {
            max_concurrent_deliveries: 2,
            ..config()
        };

        let handle = Listener::start(&record("orders"), &broker, callback.clone(), &cfg, tx)
            .await
            .unwrap();
        eventually(|| (0..8).all(|i| broker.completed_count(&format!("m-{i}")) == 1)).await;
        handle.stop().await;

        assert!(callback.peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn drain_timeout_abandons_stragglers_once() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", BrokeredMessage::new("slow", Vec::new()));
        let callback = Arc::new(RecordingCallback {
            delay: Some(Duration::from_secs(2)),
            ..RecordingCallback::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = Listener::start(&record("orders"), &broker, callback.clone(), &config(), tx)
            .await
            .unwrap();
        eventually(|| callback.active.load(std::sync::atomic::Ordering::SeqCst) == 1).await;
        handle.stop().await;

        assert_eq!(handle.state(), ListenerState::Stopped);
        assert_eq!(broker.abandoned_count("slow"), 1);
        assert_eq!(broker.completed_count("slow"), 0);
        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.reason, ExitReason::Requested);
        assert_eq!(exit.listener_id, handle.id());
    }

    #[tokio::test]
    async fn fatal_receive_error_exits_and_notifies() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Listener::start(
            &record("orders"),
            &broker,
            Arc::new(RecordingCallback::default()),
            &config(),
            tx,
        )
        .await
        .unwrap();
        let target = BrokerTarget::Queue {
            name: "orders".into(),
        };
        assert_eq!(broker.open_receivers(&target), 1);

        broker.mark_missing(&target);
        let exit = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(exit.reason, ExitReason::ConnectionLost { .. }));
        assert_eq!(handle.state(), ListenerState::Stopped);
        assert_eq!(broker.open_receivers(&target), 0);
        handle.stop().await;
    }
}
