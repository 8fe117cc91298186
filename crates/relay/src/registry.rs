//! Trigger registry: the in-memory map of triggers and the single mutator of
//! both the map and the durable store.
//!
//! Operations on the same workflow id are serialised by a per-key async lock;
//! operations on different ids proceed in parallel. Durable writes happen
//! before a listener starts, and durable deletes before a listener is asked to
//! stop, so a restart never resurrects an unregistered trigger and never loses
//! a registered one.

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use triggers::{
    BrokerConnector, CallbackClient, RegisteredTrigger, RelayError, StorageError, StoredTriggers,
    SubscriptionRecord, TriggerStore, WorkflowId,
};

use crate::config::ListenerConfig;
use crate::listener::{ExitReason, Listener, ListenerExit, ListenerHandle};

/// Outcome of [`TriggerRegistry::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Triggers whose listener is running again.
    pub recovered: Vec<WorkflowId>,
    /// Triggers kept record-only because their listener failed to start.
    pub degraded: Vec<(WorkflowId, String)>,
    /// Stored rows that could not be read, by raw key, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl RecoveryReport {
    /// Number of stored rows seen, readable or not.
    pub fn total(&self) -> usize {
        self.recovered.len() + self.degraded.len() + self.skipped.len()
    }
}

struct TriggerEntry {
    record: SubscriptionRecord,
    listener: Option<Arc<ListenerHandle>>,
}

impl TriggerEntry {
    fn snapshot(&self) -> RegisteredTrigger {
        RegisteredTrigger {
            record: self.record.clone(),
            listener: self.listener.as_ref().map(|l| l.status()),
        }
    }
}

/// Holds the per-key lock; prunes the lock table entry when nobody else
/// is waiting on it.
struct KeyGuard<'a> {
    locks: &'a DashMap<WorkflowId, Arc<tokio::sync::Mutex<()>>>,
    key: WorkflowId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

struct RegistryInner {
    entries: DashMap<WorkflowId, TriggerEntry>,
    key_locks: DashMap<WorkflowId, Arc<tokio::sync::Mutex<()>>>,
    store: Arc<dyn TriggerStore>,
    connector: Arc<dyn BrokerConnector>,
    callback: Arc<dyn CallbackClient>,
    config: ListenerConfig,
    exits_tx: mpsc::UnboundedSender<ListenerExit>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<ListenerExit>>>,
}

/// Process-wide trigger registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TriggerRegistry {
    inner: Arc<RegistryInner>,
}

impl TriggerRegistry {
    pub fn new(
        store: Arc<dyn TriggerStore>,
        connector: Arc<dyn BrokerConnector>,
        callback: Arc<dyn CallbackClient>,
        config: ListenerConfig,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                key_locks: DashMap::new(),
                store,
                connector,
                callback,
                config,
                exits_tx,
                exits_rx: Mutex::new(Some(exits_rx)),
            }),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Starts the listener-exit watcher, then recovers every durable trigger.
    ///
    /// Must complete before registration traffic is accepted.
    pub async fn init(&self) -> Result<RecoveryReport, StorageError> {
        self.spawn_exit_watcher();
        self.recover().await
    }

    fn spawn_exit_watcher(&self) {
        let rx = self
            .inner
            .exits_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(exit) = rx.recv().await {
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                inner.clear_listener(exit).await;
            }
        });
    }

    /// Registers or replaces a trigger and starts its listener.
    ///
    /// An existing entry is fully unregistered first. A storage failure
    /// leaves no new state behind. A listener start failure keeps the
    /// persisted record and reports [`RelayError::ListenerStart`].
    #[instrument(skip_all, fields(workflow_id = %record.workflow_id, trigger = %record.display_name))]
    pub async fn register(&self, record: SubscriptionRecord) -> Result<RegisteredTrigger, RelayError> {
        let inner = &self.inner;
        let workflow_id = record.workflow_id.clone();
        let _key = inner.lock_key(&workflow_id).await;

        if inner.entries.contains_key(&workflow_id) {
            info!("trigger already registered; replacing it");
            inner.remove_locked(&workflow_id).await?;
        }

        inner
            .store
            .put(&workflow_id, &record)
            .await
            .map_err(|source| RelayError::Storage {
                workflow_id: workflow_id.clone(),
                source,
            })?;
        inner.entries.insert(
            workflow_id.clone(),
            TriggerEntry {
                record: record.clone(),
                listener: None,
            },
        );

        let handle = match inner.start_listener(&record).await {
            Ok(handle) => handle,
            Err(source) => {
                warn!(error = %source, "trigger persisted but its listener failed to start");
                return Err(RelayError::ListenerStart {
                    workflow_id,
                    source,
                });
            }
        };
        let status = handle.status();
        if let Some(mut entry) = inner.entries.get_mut(&workflow_id) {
            entry.listener = Some(handle);
        }
        info!(listener_id = %status.listener_id, "trigger registered");
        Ok(RegisteredTrigger {
            record,
            listener: Some(status),
        })
    }

    /// Deletes the durable record, stops the listener, then drops the entry.
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub async fn unregister(&self, workflow_id: &WorkflowId) -> Result<(), RelayError> {
        let inner = &self.inner;
        let _key = inner.lock_key(workflow_id).await;
        if !inner.entries.contains_key(workflow_id) {
            debug!("no trigger to unregister");
            return Err(RelayError::NotFound {
                workflow_id: workflow_id.clone(),
            });
        }
        inner.remove_locked(workflow_id).await?;
        info!("trigger unregistered");
        Ok(())
    }

    /// Rebuilds the in-memory map from the durable store and restarts every
    /// listener without persisting again.
    ///
    /// One failing trigger never aborts the others; it is kept record-only
    /// and listed in [`RecoveryReport::degraded`]. Rows that cannot be read
    /// are listed in [`RecoveryReport::skipped`]. Only a failed scan of the
    /// store is an error.
    #[instrument(skip_all)]
    pub async fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let inner = &self.inner;
        let StoredTriggers {
            records,
            unreadable,
        } = inner.store.list_all().await?;
        info!(
            count = records.len(),
            unreadable = unreadable.len(),
            "recovering triggers"
        );

        let mut report = RecoveryReport::default();
        for row in unreadable {
            warn!(key = %row.key, error = %row.error, "stored trigger row unreadable; skipped");
            report.skipped.push((row.key, row.error.to_string()));
        }

        let attempts = records.into_iter().map(|(workflow_id, record)| async move {
            let _key = inner.lock_key(&workflow_id).await;
            let running = inner
                .entries
                .get(&workflow_id)
                .is_some_and(|e| e.listener.is_some());
            if running {
                return (workflow_id, Ok(()));
            }

            inner.entries.insert(
                workflow_id.clone(),
                TriggerEntry {
                    record: record.clone(),
                    listener: None,
                },
            );
            match inner.start_listener(&record).await {
                Ok(handle) => {
                    if let Some(mut entry) = inner.entries.get_mut(&workflow_id) {
                        entry.listener = Some(handle);
                    }
                    (workflow_id, Ok(()))
                }
                Err(e) => {
                    warn!(
                        workflow_id = %workflow_id,
                        trigger = %record.display_name,
                        error = %e,
                        "listener failed to start during recovery; trigger kept without listener"
                    );
                    (workflow_id, Err(e.to_string()))
                }
            }
        });

        for (workflow_id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => report.recovered.push(workflow_id),
                Err(reason) => report.degraded.push((workflow_id, reason)),
            }
        }
        info!(
            recovered = report.recovered.len(),
            degraded = report.degraded.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }

    pub async fn lookup(&self, workflow_id: &WorkflowId) -> Result<RegisteredTrigger, RelayError> {
        let _key = self.inner.lock_key(workflow_id).await;
        self.inner
            .entries
            .get(workflow_id)
            .map(|e| e.snapshot())
            .ok_or_else(|| RelayError::NotFound {
                workflow_id: workflow_id.clone(),
            })
    }

    /// Snapshot of every trigger, ordered by workflow id.
    pub fn list_all(&self) -> Vec<RegisteredTrigger> {
        let mut all: Vec<RegisteredTrigger> =
            self.inner.entries.iter().map(|e| e.snapshot()).collect();
        all.sort_by(|a, b| a.record.workflow_id.cmp(&b.record.workflow_id));
        all
    }

    /// Stops every listener. Durable records are left in place so the next
    /// start recovers them.
    #[instrument(skip_all)]
    pub async fn teardown(&self) {
        let inner = &self.inner;
        let ids: Vec<WorkflowId> = inner.entries.iter().map(|e| e.key().clone()).collect();
        info!(count = ids.len(), "stopping all listeners");

        let stops = ids.into_iter().map(|workflow_id| async move {
            let _key = inner.lock_key(&workflow_id).await;
            let listener = inner
                .entries
                .get_mut(&workflow_id)
                .and_then(|mut e| e.listener.take());
            if let Some(listener) = listener {
                inner.stop_listener(&workflow_id, &listener).await;
            }
        });
        join_all(stops).await;
    }
}

impl RegistryInner {
    async fn lock_key(&self, workflow_id: &WorkflowId) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .entry(workflow_id.clone())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: &self.key_locks,
            key: workflow_id.clone(),
            guard: Some(guard),
        }
    }

    async fn start_listener(
        &self,
        record: &SubscriptionRecord,
    ) -> Result<Arc<ListenerHandle>, triggers::BrokerError> {
        Listener::start(
            record,
            self.connector.as_ref(),
            Arc::clone(&self.callback),
            &self.config,
            self.exits_tx.clone(),
        )
        .await
    }

    /// Full unregister sequence. Caller holds the key lock.
    async fn remove_locked(&self, workflow_id: &WorkflowId) -> Result<(), RelayError> {
        self.store
            .delete(workflow_id)
            .await
            .map_err(|source| RelayError::Storage {
                workflow_id: workflow_id.clone(),
                source,
            })?;

        let listener = self
            .entries
            .get_mut(workflow_id)
            .and_then(|mut e| e.listener.take());
        if let Some(listener) = listener {
            self.stop_listener(workflow_id, &listener).await;
        }
        self.entries.remove(workflow_id);
        Ok(())
    }

    async fn stop_listener(&self, workflow_id: &WorkflowId, listener: &ListenerHandle) {
        let bound = self.config.stop_timeout();
        match tokio::time::timeout(bound, listener.stop()).await {
            Ok(()) => debug!(workflow_id = %workflow_id, listener_id = %listener.id(), "listener stopped"),
            Err(_) => warn!(
                workflow_id = %workflow_id,
                listener_id = %listener.id(),
                timeout_ms = bound.as_millis() as u64,
                "listener did not stop in time; removing it anyway"
            ),
        }
    }

    /// Clears the handle of a listener that exited on its own.
    async fn clear_listener(&self, exit: ListenerExit) {
        let _key = self.lock_key(&exit.workflow_id).await;
        let Some(mut entry) = self.entries.get_mut(&exit.workflow_id) else {
            return;
        };
        let current = entry
            .listener
            .as_ref()
            .is_some_and(|l| l.id() == exit.listener_id);
        if current {
            entry.listener = None;
            match &exit.reason {
                ExitReason::Requested => {
                    debug!(workflow_id = %exit.workflow_id, "listener handle cleared")
                }
                ExitReason::ConnectionLost { error } => warn!(
                    workflow_id = %exit.workflow_id,
                    listener_id = %exit.listener_id,
                    error = %error,
                    "listener exited on a broker failure; trigger kept without listener"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use servicebus::InMemoryBroker;
    use table_store::{InMemoryTable, TableTriggerStore};
    use triggers::{
        BrokerConnection, BrokerError, BrokerTarget, CallbackPayload, CallbackUrl,
        ConnectionString, DeliveryError, ListenerState, MessageReceiver, ReceivedMessage,
    };

    struct NoopCallback;

    #[async_trait]
    impl CallbackClient for NoopCallback {
        async fn post(&self, _: &CallbackUrl, _: &CallbackPayload) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    /// Broker whose receivers never finish closing.
    struct StuckCloseBroker;

    struct StuckCloseConnection;

    struct StuckCloseReceiver;

    #[async_trait]
    impl BrokerConnector for StuckCloseBroker {
        async fn connect(&self, _: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            Ok(Box::new(StuckCloseConnection))
        }
    }

    #[async_trait]
    impl BrokerConnection for StuckCloseConnection {
        async fn open_receiver(
            &self,
            _: &BrokerTarget,
        ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
            Ok(Arc::new(StuckCloseReceiver))
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl MessageReceiver for StuckCloseReceiver {
        async fn receive(&self) -> Result<Option<ReceivedMessage>, BrokerError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(None)
        }

        async fn complete(&self, _: &ReceivedMessage) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn abandon(&self, _: &ReceivedMessage) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            std::future::pending().await
        }
    }

    fn record(id: &str, queue: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            workflow_id: WorkflowId::new(id).unwrap(),
            display_name: format!("{id}-app"),
            callback_url: CallbackUrl::parse("http://x/cb").unwrap(),
            broker_target: BrokerTarget::Queue { name: queue.into() },
            connection_credential: None,
        }
    }

    fn registry(table: InMemoryTable, broker: InMemoryBroker) -> TriggerRegistry {
        TriggerRegistry::new(
            Arc::new(TableTriggerStore::new(table)),
            Arc::new(broker),
            Arc::new(NoopCallback),
            ListenerConfig {
                drain_timeout: Duration::from_millis(200),
                default_connection_string: ConnectionString::new("Endpoint=sb://memory/"),
                ..ListenerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn register_then_lookup_shows_running_listener() {
        let registry = registry(InMemoryTable::new(), InMemoryBroker::new());
        registry.register(record("W1", "orders")).await.unwrap();

        let found = registry.lookup(&WorkflowId::new("W1").unwrap()).await.unwrap();
        assert!(found.is_listening());
        assert_eq!(found.record.display_name, "W1-app");
    }

    #[tokio::test]
    async fn storage_failure_starts_nothing() {
        let table = InMemoryTable::new();
        let broker = InMemoryBroker::new();
        let registry = registry(table.clone(), broker.clone());
        table.fail_writes(true);

        let err = registry.register(record("W1", "orders")).await.unwrap_err();

        assert!(matches!(err, RelayError::Storage { .. }));
        assert!(registry.list_all().is_empty());
        assert_eq!(
            broker.open_receivers(&BrokerTarget::Queue {
                name: "orders".into()
            }),
            0
        );
    }

    #[tokio::test]
    async fn listener_start_failure_keeps_the_record() {
        let table = InMemoryTable::new();
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let registry = registry(table.clone(), broker);

        let err = registry.register(record("W1", "orders")).await.unwrap_err();

        assert!(matches!(err, RelayError::ListenerStart { .. }));
        let found = registry.lookup(&WorkflowId::new("W1").unwrap()).await.unwrap();
        assert!(found.listener.is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_is_not_found() {
        let table = InMemoryTable::new();
        let registry = registry(table.clone(), InMemoryBroker::new());
        registry.register(record("W1", "orders")).await.unwrap();

        let err = registry
            .unregister(&WorkflowId::new("W2").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::NotFound { .. }));
        assert_eq!(registry.list_all().len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_durable_and_in_memory_state() {
        let table = InMemoryTable::new();
        let broker = InMemoryBroker::new();
        let registry = registry(table.clone(), broker.clone());
        registry.register(record("W1", "orders")).await.unwrap();

        registry.unregister(&WorkflowId::new("W1").unwrap()).await.unwrap();

        assert!(registry.list_all().is_empty());
        assert!(table.is_empty());
        assert_eq!(
            broker.open_receivers(&BrokerTarget::Queue {
                name: "orders".into()
            }),
            0
        );
    }

    #[tokio::test]
    async fn failed_unregister_delete_leaves_trigger_running() {
        let table = InMemoryTable::new();
        let registry = registry(table.clone(), InMemoryBroker::new());
        registry.register(record("W1", "orders")).await.unwrap();
        table.fail_writes(true);

        let err = registry
            .unregister(&WorkflowId::new("W1").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Storage { .. }));
        let found = registry.lookup(&WorkflowId::new("W1").unwrap()).await.unwrap();
        assert!(found.is_listening());
    }

    #[tokio::test]
    async fn recovery_continues_past_a_failing_trigger() {
        let table = InMemoryTable::new();
        let broker = InMemoryBroker::new();
        let first = registry(table.clone(), broker.clone());
        first.register(record("W1", "orders")).await.unwrap();
        first.register(record("W2", "gone")).await.unwrap();
        first.teardown().await;

        broker.mark_missing(&BrokerTarget::Queue {
            name: "gone".into(),
        });
        let restarted = registry(table, broker);
        let report = restarted.init().await.unwrap();

        assert_eq!(report.recovered, vec![WorkflowId::new("W1").unwrap()]);
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].0.as_str(), "W2");
        let all = restarted.list_all();
        assert_eq!(all.len(), 2);
        assert!(all[0].is_listening());
        assert!(all[1].listener.is_none());
    }

    #[tokio::test]
    async fn unreadable_row_does_not_block_recovery() {
        let table = InMemoryTable::new();
        let broker = InMemoryBroker::new();
        let first = registry(table.clone(), broker.clone());
        first.register(record("W1", "orders")).await.unwrap();
        first.teardown().await;
        table.insert_raw("W2", "{not json");

        let restarted = registry(table, broker);
        let report = restarted.init().await.unwrap();

        assert_eq!(report.recovered, vec![WorkflowId::new("W1").unwrap()]);
        assert!(report.degraded.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "W2");
        assert_eq!(report.total(), 2);
        let all = restarted.list_all();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_listening());
    }

    #[tokio::test]
    async fn unregister_force_removes_a_listener_that_will_not_close() {
        let table = InMemoryTable::new();
        let registry = TriggerRegistry::new(
            Arc::new(TableTriggerStore::new(table.clone())),
            Arc::new(StuckCloseBroker),
            Arc::new(NoopCallback),
            ListenerConfig {
                drain_timeout: Duration::from_millis(50),
                stop_grace: Duration::from_millis(50),
                default_connection_string: ConnectionString::new("Endpoint=sb://memory/"),
                ..ListenerConfig::default()
            },
        );
        let id = WorkflowId::new("W1").unwrap();
        registry.register(record("W1", "orders")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), registry.unregister(&id))
            .await
            .expect("unregister is bounded by the stop timeout")
            .unwrap();

        assert!(matches!(
            registry.lookup(&id).await,
            Err(RelayError::NotFound { .. })
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn teardown_keeps_durable_records() {
        let table = InMemoryTable::new();
        let registry = registry(table.clone(), InMemoryBroker::new());
        registry.register(record("W1", "orders")).await.unwrap();

        registry.teardown().await;

        assert_eq!(table.len(), 1);
        let found = registry.lookup(&WorkflowId::new("W1").unwrap()).await.unwrap();
        assert!(found.listener.is_none());
    }

    #[tokio::test]
    async fn self_terminated_listener_is_cleared() {
        let broker = InMemoryBroker::new();
        let registry = registry(InMemoryTable::new(), broker.clone());
        registry.init().await.unwrap();
        registry.register(record("W1", "orders")).await.unwrap();

        broker.mark_missing(&BrokerTarget::Queue {
            name: "orders".into(),
        });

        let id = WorkflowId::new("W1").unwrap();
        for _ in 0..200 {
            if registry.lookup(&id).await.unwrap().listener.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let state = registry.lookup(&id).await.unwrap().listener.map(|l| l.state);
        panic!("listener handle not cleared, state {state:?}");
    }

    #[tokio::test]
    async fn key_locks_are_pruned() {
        let registry = registry(InMemoryTable::new(), InMemoryBroker::new());
        registry.register(record("W1", "orders")).await.unwrap();
        let _ = registry.lookup(&WorkflowId::new("W1").unwrap()).await;
        assert!(registry.inner.key_locks.is_empty());
        assert_eq!(
            registry.list_all()[0].listener.as_ref().map(|l| l.state),
            Some(ListenerState::Running)
        );
    }
}
