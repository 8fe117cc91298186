//! In-process broker with peek-lock semantics.
//!
//! Used by tests and local runs in place of a real namespace. Every clone of
//! an [`InMemoryBroker`] shares the same entities, so a test can keep one
//! handle for sending and inspection while the relay connects through another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use triggers::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerTarget, BrokeredMessage, LockToken,
    MessageReceiver, ReceivedMessage,
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_RECEIVE_WINDOW: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Entity {
    ready: VecDeque<BrokeredMessage>,
    /// lock token -> (receiver id, message)
    locked: HashMap<String, (u64, BrokeredMessage)>,
    open_receivers: usize,
}

#[derive(Default)]
struct BrokerState {
    entities: HashMap<String, Entity>,
    /// topic -> subscription names
    subscriptions: HashMap<String, Vec<String>>,
    completed: HashMap<String, usize>,
    abandoned: HashMap<String, usize>,
    missing: HashSet<String>,
    unavailable: bool,
    next_lock: u64,
    next_receiver: u64,
}

/// Shared in-memory broker. Implements [`BrokerConnector`].
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    receive_window: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_receive_window(DEFAULT_RECEIVE_WINDOW)
    }

    /// A broker whose `receive` waits up to `window` before returning `None`.
    pub fn with_receive_window(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            receive_window: window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -- messaging -----------------------------------------------------------

    pub fn send_to_queue(&self, queue: &str, message: BrokeredMessage) {
        self.lock()
            .entities
            .entry(queue.to_owned())
            .or_default()
            .ready
            .push_back(message);
    }

    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.lock();
        let subs = state.subscriptions.entry(topic.to_owned()).or_default();
        if !subs.iter().any(|s| s == subscription) {
            subs.push(subscription.to_owned());
        }
        let path = BrokerTarget::TopicSubscription {
            topic: topic.to_owned(),
            subscription_name: subscription.to_owned(),
        }
        .entity_path();
        state.entities.entry(path).or_default();
    }

    /// Copies `message` into every subscription of `topic`.
    pub fn publish(&self, topic: &str, message: BrokeredMessage) {
        let mut state = self.lock();
        let subs = state.subscriptions.get(topic).cloned().unwrap_or_default();
        for sub in subs {
            let path = format!("{topic}/subscriptions/{sub}");
            state
                .entities
                .entry(path)
                .or_default()
                .ready
                .push_back(message.clone());
        }
    }

    // -- inspection ----------------------------------------------------------

    /// Times the message with `message_id` was completed.
    pub fn completed_count(&self, message_id: &str) -> usize {
        self.lock().completed.get(message_id).copied().unwrap_or(0)
    }

    /// Times the message with `message_id` was abandoned.
    pub fn abandoned_count(&self, message_id: &str) -> usize {
        self.lock().abandoned.get(message_id).copied().unwrap_or(0)
    }

    pub fn open_receivers(&self, target: &BrokerTarget) -> usize {
        self.lock()
            .entities
            .get(&target.entity_path())
            .map_or(0, |e| e.open_receivers)
    }

    /// Messages waiting on `target`, excluding locked ones.
    pub fn pending(&self, target: &BrokerTarget) -> usize {
        self.lock()
            .entities
            .get(&target.entity_path())
            .map_or(0, |e| e.ready.len())
    }

    /// Messages currently locked on `target`.
    pub fn locked(&self, target: &BrokerTarget) -> usize {
        self.lock()
            .entities
            .get(&target.entity_path())
            .map_or(0, |e| e.locked.len())
    }

    // -- fault injection -----------------------------------------------------

    /// While set, `connect` fails with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Simulates deleting `target`: `open_receiver` and `receive` on it fail
    /// with `EntityNotFound`.
    pub fn mark_missing(&self, target: &BrokerTarget) {
        self.lock().missing.insert(target.entity_path());
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        if connection_string.trim().is_empty() {
            return Err(BrokerError::Configuration {
                message: "empty connection string".into(),
            });
        }
        if self.lock().unavailable {
            return Err(BrokerError::Connection {
                message: "in-memory broker is unavailable".into(),
            });
        }
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_receiver(
        &self,
        target: &BrokerTarget,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let entity = target.entity_path();
        let id = {
            let mut state = self.broker.lock();
            if state.missing.contains(&entity) {
                return Err(BrokerError::EntityNotFound { entity });
            }
            state.next_receiver += 1;
            let id = state.next_receiver;
            state.entities.entry(entity.clone()).or_default().open_receivers += 1;
            id
        };
        Ok(Arc::new(InMemoryReceiver {
            broker: self.broker.clone(),
            entity,
            id,
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryReceiver {
    broker: InMemoryBroker,
    entity: String,
    id: u64,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_exists(&self) -> Result<(), BrokerError> {
        if self.broker.lock().missing.contains(&self.entity) {
            Err(BrokerError::EntityNotFound {
                entity: self.entity.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn try_take(&self) -> Option<ReceivedMessage> {
        let mut state = self.broker.lock();
        state.next_lock += 1;
        let token = format!("lock-{}", state.next_lock);
        let entity = state.entities.entry(self.entity.clone()).or_default();
        let mut message = entity.ready.pop_front()?;
        message.properties.delivery_count += 1;
        entity
            .locked
            .insert(token.clone(), (self.id, message.clone()));
        Some(ReceivedMessage {
            lock_token: LockToken::new(token),
            message,
        })
    }

    fn take_lock(&self, token: &LockToken) -> Result<BrokeredMessage, BrokerError> {
        let mut state = self.broker.lock();
        state
            .entities
            .get_mut(&self.entity)
            .and_then(|e| e.locked.remove(token.as_str()))
            .map(|(_, message)| message)
            .ok_or_else(|| BrokerError::LockLost {
                message: format!("no lock '{}' on '{}'", token.as_str(), self.entity),
            })
    }
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive(&self) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.broker.receive_window;
        loop {
            self.ensure_open()?;
            self.ensure_exists()?;
            if let Some(received) = self.try_take() {
                return Ok(Some(received));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let completed = self.take_lock(&message.lock_token)?;
        let id = completed.id_for_log().to_owned();
        *self.broker.lock().completed.entry(id).or_default() += 1;
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let abandoned = self.take_lock(&message.lock_token)?;
        let mut state = self.broker.lock();
        *state
            .abandoned
            .entry(abandoned.id_for_log().to_owned())
            .or_default() += 1;
        state
            .entities
            .entry(self.entity.clone())
            .or_default()
            .ready
            .push_front(abandoned);
        Ok(())
    }

    /// Releases this receiver's outstanding locks back to the entity, the way
    /// lock expiry would on a real broker.
    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.lock();
        if let Some(entity) = state.entities.get_mut(&self.entity) {
            let mine: Vec<String> = entity
                .locked
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(token, _)| token.clone())
                .collect();
            for token in mine {
                if let Some((_, message)) = entity.locked.remove(&token) {
                    entity.ready.push_front(message);
                }
            }
            entity.open_receivers = entity.open_receivers.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str) -> BrokerTarget {
        BrokerTarget::Queue { name: name.into() }
    }

    async fn receiver(broker: &InMemoryBroker, target: &BrokerTarget) -> Arc<dyn MessageReceiver> {
        broker
            .connect("Endpoint=sb://memory/")
            .await
            .unwrap()
            .open_receiver(target)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn complete_removes_message() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", BrokeredMessage::new("m-1", b"x".to_vec()));
        let rx = receiver(&broker, &queue("orders")).await;

        let msg = rx.receive().await.unwrap().unwrap();
        assert_eq!(msg.message.properties.delivery_count, 1);
        rx.complete(&msg).await.unwrap();

        assert_eq!(broker.completed_count("m-1"), 1);
        assert_eq!(broker.pending(&queue("orders")), 0);
        assert!(rx.receive().await.unwrap().is_none());
        assert!(matches!(
            rx.complete(&msg).await,
            Err(BrokerError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_delivery_count() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", BrokeredMessage::new("m-1", b"x".to_vec()));
        let rx = receiver(&broker, &queue("orders")).await;

        let first = rx.receive().await.unwrap().unwrap();
        rx.abandon(&first).await.unwrap();
        let second = rx.receive().await.unwrap().unwrap();

        assert_eq!(broker.abandoned_count("m-1"), 1);
        assert_eq!(second.message.properties.delivery_count, 2);
        assert_ne!(first.lock_token, second.lock_token);
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscriptions() {
        let broker = InMemoryBroker::new();
        broker.create_subscription("events", "a");
        broker.create_subscription("events", "b");
        broker.publish("events", BrokeredMessage::new("e-1", Vec::new()));

        let a = BrokerTarget::TopicSubscription {
            topic: "events".into(),
            subscription_name: "a".into(),
        };
        let b = BrokerTarget::TopicSubscription {
            topic: "events".into(),
            subscription_name: "b".into(),
        };
        assert_eq!(broker.pending(&a), 1);
        assert_eq!(broker.pending(&b), 1);
    }

    #[tokio::test]
    async fn close_releases_locks_and_receiver_count() {
        let broker = InMemoryBroker::new();
        broker.send_to_queue("orders", BrokeredMessage::new("m-1", Vec::new()));
        let rx = receiver(&broker, &queue("orders")).await;
        assert_eq!(broker.open_receivers(&queue("orders")), 1);

        let _held = rx.receive().await.unwrap().unwrap();
        assert_eq!(broker.locked(&queue("orders")), 1);

        rx.close().await.unwrap();
        rx.close().await.unwrap();
        assert_eq!(broker.open_receivers(&queue("orders")), 0);
        assert_eq!(broker.pending(&queue("orders")), 1);
        assert_eq!(broker.abandoned_count("m-1"), 0);
        assert!(matches!(rx.receive().await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn fault_injection() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        assert!(matches!(
            broker.connect("cs").await,
            Err(BrokerError::Connection { .. })
        ));
        broker.set_unavailable(false);

        broker.mark_missing(&queue("gone"));
        let connection = broker.connect("cs").await.unwrap();
        assert!(matches!(
            connection.open_receiver(&queue("gone")).await,
            Err(BrokerError::EntityNotFound { .. })
        ));
    }
}
