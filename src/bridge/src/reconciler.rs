use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use common::catalog::CatalogPublisher;
use common::model::Status;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ServiceImporter;
use crate::diff::{Diff, diff};
use crate::error::{BridgeError, RegistryError};
use crate::index::{Registration, RegistrationIndex};
use crate::instance::ExternalInstance;
use crate::registry::{RegistryQuery, WatchAdapter, WatchEvent};

/// Identity type of the instances served by registry `R`
pub type KeyOf<R> = <<R as RegistryQuery>::Instance as ExternalInstance>::Key;

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Stopped => "stopped",
            BridgeState::Starting => "starting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Actions applied by a successful reconciliation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub published: usize,
    pub unpublished: usize,
}

impl CycleOutcome {
    pub fn is_noop(&self) -> bool {
        self.published == 0 && self.unpublished == 0
    }
}

struct Inner<R: RegistryQuery> {
    registry: Arc<R>,
    publisher: Arc<dyn CatalogPublisher>,
    /// Holding this lock is what makes a cycle exclusive
    index: Mutex<RegistrationIndex<KeyOf<R>>>,
    state: RwLock<BridgeState>,
}

struct WatchTask {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Keeps the catalog in line with an external registry.
///
/// `start` runs an initial reconciliation and then follows the registry's
/// watch events. Events pending when the watch loop wakes up are coalesced
/// into one cycle, so a burst of changes arriving during an in-flight cycle
/// costs exactly one follow-up cycle.
pub struct Reconciler<R: RegistryQuery + WatchAdapter> {
    inner: Arc<Inner<R>>,
    watch_task: Mutex<Option<WatchTask>>,
}

impl<R: RegistryQuery + WatchAdapter> Inner<R> {
    async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: BridgeState) {
        *self.state.write().await = state;
    }

    async fn fetch_snapshot(&self) -> Result<Vec<R::Instance>, RegistryError> {
        let names = match self.registry.query_names().await {
            Ok(names) => names,
            Err(RegistryError::NoNode(path)) => {
                log::debug!("Registry path {path} does not exist, no services");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut instances = Vec::new();
        for name in names {
            match self.registry.query_instances(&name).await {
                Ok(found) => instances.extend(found),
                // The name vanished between the two queries
                Err(RegistryError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(instances)
    }

    async fn publish_instance(
        &self,
        instance: &R::Instance,
    ) -> Result<Registration<KeyOf<R>>, BridgeError> {
        let key = instance.key();
        let mut record = instance
            .to_record()
            .map_err(|source| BridgeError::Translate {
                key: key.to_string(),
                source,
            })?
            .with_status(Status::Up);

        let handle = self
            .publisher
            .publish(record.clone())
            .await
            .map_err(|source| BridgeError::Publish {
                key: key.to_string(),
                source,
            })?;
        record.registration = Some(handle.clone());

        Ok(Registration {
            key,
            handle,
            record,
        })
    }

    /// One fetch-diff-apply pass. The caller holds the index lock.
    async fn cycle(
        &self,
        index: &mut RegistrationIndex<KeyOf<R>>,
    ) -> Result<CycleOutcome, BridgeError> {
        let snapshot = self.fetch_snapshot().await.map_err(BridgeError::Snapshot)?;
        let changes = diff(index, &snapshot);
        log::debug!(
            "Registry snapshot has {} instances, {} to unpublish, {} to publish",
            snapshot.len(),
            changes.to_remove.len(),
            changes.to_add.len()
        );
        if changes.is_empty() {
            return Ok(CycleOutcome::default());
        }
        let Diff { to_remove, to_add } = changes;

        let removals = join_all(to_remove.into_iter().map(|registration| async move {
            let result = self.publisher.unpublish(&registration.handle).await;
            (registration, result)
        }));
        let additions = join_all(
            to_add
                .iter()
                .map(|instance| async move { self.publish_instance(instance).await }),
        );
        let (removed, added) = futures::join!(removals, additions);

        let mut outcome = CycleOutcome::default();
        let mut first_failure = None;

        for (registration, result) in removed {
            // Dropped even when the catalog refused, the instance is gone remotely
            index.remove(&registration.key);
            match result {
                Ok(()) => {
                    log::info!(
                        "Unpublished {} ({})",
                        registration.key,
                        registration.handle
                    );
                    outcome.unpublished += 1;
                }
                Err(source) => {
                    let error = BridgeError::Unpublish {
                        key: registration.key.to_string(),
                        handle: registration.handle,
                        source,
                    };
                    log::warn!("{error}");
                    first_failure.get_or_insert(error);
                }
            }
        }

        for result in added {
            match result {
                Ok(registration) => {
                    log::info!(
                        "Published {} as {} ({})",
                        registration.key,
                        registration.handle,
                        registration.record.record_type
                    );
                    index.insert(registration);
                    outcome.published += 1;
                }
                Err(error) => {
                    log::warn!("{error}");
                    first_failure.get_or_insert(error);
                }
            }
        }

        match first_failure {
            Some(error) => Err(error),
            None => Ok(outcome),
        }
    }

    /// Best-effort unpublish of every registration
    async fn drain(&self, index: &mut RegistrationIndex<KeyOf<R>>) {
        if index.is_empty() {
            return;
        }
        let registrations = index.drain();
        log::info!("Unpublishing {} registrations", registrations.len());

        let results = join_all(
            registrations
                .iter()
                .map(|registration| self.publisher.unpublish(&registration.handle)),
        )
        .await;

        for (registration, result) in registrations.iter().zip(results) {
            if let Err(e) = result {
                log::warn!(
                    "Failed to unpublish {} ({}) during shutdown: {e}",
                    registration.key,
                    registration.handle
                );
            }
        }
    }

    /// Unattended reconciliation triggered by a watch event
    async fn on_event(&self, event: &WatchEvent) {
        let mut index = self.index.lock().await;
        let state = self.state().await;
        if state != BridgeState::Running {
            log::debug!("Ignoring registry change {event:?} while {state}");
            return;
        }

        log::debug!("Registry changed ({:?} {}), reconciling", event.kind, event.path);
        match self.cycle(&mut index).await {
            Ok(outcome) if outcome.is_noop() => log::debug!("Catalog already up to date"),
            Ok(outcome) => log::debug!(
                "Reconciliation done: {} published, {} unpublished, {} registered",
                outcome.published,
                outcome.unpublished,
                index.len()
            ),
            Err(e @ BridgeError::Snapshot(_)) => log::error!("{e}"),
            Err(e) => log::warn!("Reconciliation completed with failures: {e}"),
        }
    }
}

async fn watch_loop<R: RegistryQuery + WatchAdapter>(
    inner: Arc<Inner<R>>,
    mut events: mpsc::Receiver<WatchEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = events.recv() => {
                let Some(event) = event else {
                    log::debug!("Registry watch channel closed");
                    break;
                };
                let mut coalesced = 0usize;
                while events.try_recv().is_ok() {
                    coalesced += 1;
                }
                if coalesced > 0 {
                    log::debug!("Coalesced {coalesced} further registry changes into one cycle");
                }
                inner.on_event(&event).await;
            }
        }
    }
}

impl<R: RegistryQuery + WatchAdapter> Reconciler<R> {
    pub fn new(registry: Arc<R>, publisher: Arc<dyn CatalogPublisher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                publisher,
                index: Mutex::new(RegistrationIndex::new()),
                state: RwLock::new(BridgeState::Stopped),
            }),
            watch_task: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> BridgeState {
        self.inner.state().await
    }

    /// Current registrations, in key order
    pub async fn registrations(&self) -> Vec<Registration<KeyOf<R>>> {
        self.inner.index.lock().await.iter().cloned().collect()
    }

    pub async fn registered_keys(&self) -> Vec<KeyOf<R>> {
        self.inner.index.lock().await.keys().cloned().collect()
    }

    /// Connect, subscribe to changes and run the initial reconciliation.
    ///
    /// On failure nothing stays subscribed, registrations made by the partial
    /// initial cycle are withdrawn and the bridge is back to `Stopped`.
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.inner.state.write().await;
            if *state != BridgeState::Stopped {
                return Err(BridgeError::InvalidState(*state));
            }
            *state = BridgeState::Starting;
        }
        log::info!("Starting registry bridge");

        if let Err(e) = self.inner.registry.connect().await {
            self.inner.set_state(BridgeState::Stopped).await;
            return Err(BridgeError::Connection(e));
        }

        let events = match self.inner.registry.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                self.inner.registry.close().await;
                self.inner.set_state(BridgeState::Stopped).await;
                return Err(BridgeError::Watch(e));
            }
        };
        self.spawn_watch_loop(events).await;

        let initial = {
            let mut index = self.inner.index.lock().await;
            if self.inner.state().await != BridgeState::Starting {
                // close() owns the index from here
                drop(index);
                self.abandon_start().await;
                return Err(BridgeError::ClosedWhileStarting);
            }
            let result = self.inner.cycle(&mut index).await;
            if result.is_err() {
                self.inner.set_state(BridgeState::Stopping).await;
                self.inner.drain(&mut index).await;
            }
            result
        };

        let outcome = match initial {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Initial reconciliation failed: {e}");
                self.abandon_start().await;
                self.inner.set_state(BridgeState::Stopped).await;
                return Err(e);
            }
        };

        let mut state = self.inner.state.write().await;
        if *state != BridgeState::Starting {
            // close() may have run before the connection was even made
            drop(state);
            self.abandon_start().await;
            return Err(BridgeError::ClosedWhileStarting);
        }
        *state = BridgeState::Running;
        log::info!(
            "Registry bridge started with {} published records",
            outcome.published
        );
        Ok(())
    }

    /// Run a reconciliation cycle now and report its aggregate result.
    pub async fn reconcile(&self) -> Result<CycleOutcome, BridgeError> {
        let mut index = self.inner.index.lock().await;
        let state = self.inner.state().await;
        if state != BridgeState::Running {
            return Err(BridgeError::InvalidState(state));
        }
        self.inner.cycle(&mut index).await
    }

    /// Stop watching, unpublish every registration and disconnect.
    ///
    /// An in-flight cycle is allowed to finish; no cycle starts afterwards.
    /// Completes whatever the outcome of the unpublish calls.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                BridgeState::Running | BridgeState::Starting => *state = BridgeState::Stopping,
                BridgeState::Stopped | BridgeState::Stopping => return,
            }
        }
        log::info!("Stopping registry bridge");

        self.stop_watch_loop().await;
        self.inner.registry.unsubscribe().await;

        {
            let mut index = self.inner.index.lock().await;
            self.inner.drain(&mut index).await;
        }

        self.inner.registry.close().await;
        self.inner.set_state(BridgeState::Stopped).await;
        log::info!("Registry bridge stopped");
    }

    /// Undo what `start` set up: watch loop, subscription and connection
    async fn abandon_start(&self) {
        self.stop_watch_loop().await;
        self.inner.registry.unsubscribe().await;
        self.inner.registry.close().await;
    }

    async fn spawn_watch_loop(&self, events: mpsc::Receiver<WatchEvent>) {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(watch_loop(Arc::clone(&self.inner), events, shutdown_rx));
        let previous = self
            .watch_task
            .lock()
            .await
            .replace(WatchTask { handle, shutdown });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    async fn stop_watch_loop(&self) {
        let task = self.watch_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    log::warn!("Registry watch loop terminated abnormally: {e}");
                }
            }
        }
    }
}

impl<R: RegistryQuery + WatchAdapter> Drop for Reconciler<R> {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[async_trait]
impl<R: RegistryQuery + WatchAdapter> ServiceImporter for Reconciler<R> {
    async fn start(&self) -> Result<(), BridgeError> {
        Reconciler::start(self).await
    }

    async fn on_event(&self, event: WatchEvent) {
        self.inner.on_event(&event).await;
    }

    async fn close(&self) {
        Reconciler::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServiceInstance;
    use crate::registry::ChangeKind;
    use crate::testing::{FakeRegistry, FlakyCatalog, eventually};
    use common::model::RecordType;
    use std::time::Duration;

    fn orders(id: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new("orders", id)
            .with_address("10.0.0.1")
            .with_port(port)
            .with_payload("service-type", "http-endpoint")
    }

    fn bridge(
        registry: &Arc<FakeRegistry<ServiceInstance>>,
        catalog: &Arc<FlakyCatalog>,
    ) -> Reconciler<FakeRegistry<ServiceInstance>> {
        Reconciler::new(registry.clone(), catalog.clone())
    }

    #[tokio::test]
    async fn test_start_publishes_existing_instances() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        registry.insert(orders("2", 8081)).await;
        let catalog = Arc::new(FlakyCatalog::new());

        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        assert_eq!(reconciler.state().await, BridgeState::Running);
        assert_eq!(reconciler.registrations().await.len(), 2);
        let records = catalog.catalog().records().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.record_type == RecordType::HttpEndpoint));
        assert!(registry.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let registry = Arc::new(FakeRegistry::<ServiceInstance>::new());
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        reconciler.start().await.unwrap();
        let second = reconciler.start().await;
        assert!(matches!(
            second,
            Err(BridgeError::InvalidState(BridgeState::Running))
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_fails_start() {
        let registry = Arc::new(FakeRegistry::<ServiceInstance>::new());
        registry.fail_connect(true);
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        let result = reconciler.start().await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(reconciler.state().await, BridgeState::Stopped);
        assert!(!registry.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_initial_snapshot_failure_leaves_nothing_behind() {
        let registry = Arc::new(FakeRegistry::<ServiceInstance>::new());
        registry.insert(orders("1", 8080)).await;
        registry.fail_queries(Some("connection loss")).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        let result = reconciler.start().await;
        assert!(matches!(result, Err(BridgeError::Snapshot(_))));
        assert_eq!(reconciler.state().await, BridgeState::Stopped);
        assert!(!registry.is_subscribed().await);
        assert_eq!(registry.closes(), 1);
        assert!(catalog.catalog().is_empty().await);
    }

    #[tokio::test]
    async fn test_initial_publish_failure_withdraws_partial_registrations() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        registry
            .insert(ServiceInstance::new("billing", "1").with_address("10.0.0.2"))
            .await;
        let catalog = Arc::new(FlakyCatalog::new());
        catalog.fail_publish_of("billing").await;
        let reconciler = bridge(&registry, &catalog);

        let result = reconciler.start().await;
        assert!(matches!(result, Err(BridgeError::Publish { .. })));
        assert!(reconciler.registrations().await.is_empty());
        assert!(catalog.catalog().is_empty().await);
        assert_eq!(reconciler.state().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_namespace_is_an_empty_snapshot() {
        let registry = Arc::new(FakeRegistry::<ServiceInstance>::new());
        registry.set_missing_namespace(true);
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        reconciler.start().await.unwrap();
        assert!(reconciler.registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_requires_running_bridge() {
        let registry = Arc::new(FakeRegistry::<ServiceInstance>::new());
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        let result = reconciler.reconcile().await;
        assert!(matches!(
            result,
            Err(BridgeError::InvalidState(BridgeState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_translation_failure_is_a_failed_publish() {
        let registry = Arc::new(FakeRegistry::new());
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        registry.insert_quietly(ServiceInstance::new("orders", "")).await;
        registry.insert_quietly(orders("1", 8080)).await;

        let result = reconciler.reconcile().await;
        assert!(matches!(result, Err(BridgeError::Translate { .. })));
        // The valid instance is still published
        assert_eq!(reconciler.registrations().await.len(), 1);
        assert_eq!(catalog.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_unpublish_still_drops_registration() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        catalog.fail_unpublish(true);
        registry.remove_quietly(&orders("1", 8080).key()).await;

        let result = reconciler.reconcile().await;
        assert!(matches!(result, Err(BridgeError::Unpublish { .. })));
        assert!(reconciler.registrations().await.is_empty());

        // Nothing left to retry
        catalog.fail_unpublish(false);
        let outcome = reconciler.reconcile().await.unwrap();
        assert!(outcome.is_noop());
        assert_eq!(catalog.unpublish_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_next_cycle() {
        let registry = Arc::new(FakeRegistry::new());
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        catalog.fail_publish_of("orders").await;
        registry.insert_quietly(orders("1", 8080)).await;
        assert!(reconciler.reconcile().await.is_err());
        assert!(reconciler.registrations().await.is_empty());

        catalog.heal().await;
        let outcome = reconciler.reconcile().await.unwrap();
        assert_eq!(outcome.published, 1);
        assert_eq!(reconciler.registrations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_leaves_index_untouched() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        registry.remove_quietly(&orders("1", 8080).key()).await;
        registry.fail_queries(Some("timeout")).await;

        assert!(matches!(
            reconciler.reconcile().await,
            Err(BridgeError::Snapshot(_))
        ));
        assert_eq!(reconciler.registrations().await.len(), 1);
        assert_eq!(catalog.unpublish_calls(), 0);
    }

    #[tokio::test]
    async fn test_unattended_snapshot_failure_keeps_watching() {
        let registry = Arc::new(FakeRegistry::new());
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        registry.fail_queries(Some("timeout")).await;
        registry.insert(orders("1", 8080)).await;
        assert!(eventually(|| async { registry.names_queries() >= 2 }).await);
        assert_eq!(reconciler.state().await, BridgeState::Running);

        registry.fail_queries(None).await;
        registry.notify(ChangeKind::Updated, "orders").await;
        assert!(eventually(|| async { reconciler.registrations().await.len() == 1 }).await);
    }

    #[tokio::test]
    async fn test_importer_events_ignored_unless_running() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        let importer: &dyn ServiceImporter = &reconciler;
        importer
            .on_event(WatchEvent::new(ChangeKind::Added, "orders"))
            .await;
        assert_eq!(registry.names_queries(), 0);
        assert!(catalog.catalog().is_empty().await);

        importer.start().await.unwrap();
        importer.close().await;
        importer
            .on_event(WatchEvent::new(ChangeKind::Added, "orders"))
            .await;
        assert_eq!(registry.names_queries(), 1);
        assert!(catalog.catalog().is_empty().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);
        reconciler.start().await.unwrap();

        reconciler.close().await;
        reconciler.close().await;
        assert_eq!(reconciler.state().await, BridgeState::Stopped);
        assert_eq!(catalog.unpublish_calls(), 1);
        assert_eq!(registry.closes(), 1);
        assert!(!registry.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_close_during_connect_tears_down_start() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        registry.delay_connect(Duration::from_millis(200));
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = Arc::new(bridge(&registry, &catalog));

        let starting = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.state().await, BridgeState::Starting);
        reconciler.close().await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ClosedWhileStarting)));
        assert_eq!(reconciler.state().await, BridgeState::Stopped);
        assert!(!registry.is_subscribed().await);
        assert!(!registry.is_connected());
        assert_eq!(registry.closes(), 2);
        assert_eq!(catalog.publish_calls(), 0);
        assert!(reconciler.watch_task.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_after_close() {
        let registry = Arc::new(FakeRegistry::new());
        registry.insert(orders("1", 8080)).await;
        let catalog = Arc::new(FlakyCatalog::new());
        let reconciler = bridge(&registry, &catalog);

        reconciler.start().await.unwrap();
        reconciler.close().await;
        reconciler.start().await.unwrap();

        assert_eq!(reconciler.registrations().await.len(), 1);
        assert_eq!(catalog.catalog().len().await, 1);
        assert_eq!(catalog.publish_calls(), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        fn arb_snapshot() -> impl Strategy<Value = Vec<ServiceInstance>> {
            prop::collection::vec((0u8..4, 0u8..6, 8080u16..8083), 0..10).prop_map(|specs| {
                specs
                    .into_iter()
                    .map(|(name, id, port)| {
                        ServiceInstance::new(format!("svc-{name}"), id.to_string())
                            .with_address("10.0.0.1")
                            .with_port(port)
                    })
                    .collect()
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Whatever the registry went through, a successful cycle leaves
            /// exactly the latest snapshot registered.
            #[test]
            fn test_cycle_converges_on_snapshot(snapshots in prop::collection::vec(arb_snapshot(), 1..5)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async {
                    let registry = Arc::new(FakeRegistry::new());
                    let catalog = Arc::new(FlakyCatalog::new());
                    let reconciler = bridge(&registry, &catalog);
                    reconciler.start().await.unwrap();

                    for snapshot in snapshots {
                        let expected: BTreeSet<_> =
                            snapshot.iter().map(ExternalInstance::key).collect();
                        registry.replace_quietly(snapshot).await;
                        reconciler.reconcile().await.unwrap();

                        let keys = reconciler.registered_keys().await;
                        prop_assert_eq!(keys.len(), expected.len());
                        prop_assert_eq!(keys.into_iter().collect::<BTreeSet<_>>(), expected.clone());
                        prop_assert_eq!(catalog.catalog().len().await, expected.len());
                    }

                    reconciler.close().await;
                    prop_assert!(catalog.catalog().is_empty().await);
                    Ok(())
                })?;
            }
        }
    }
}
