//! In-memory stand-ins for the registry and the catalog.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::catalog::{CatalogError, CatalogPublisher, CatalogResult, InMemoryCatalog};
use common::model::{Record, RecordHandle};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};

use crate::error::RegistryError;
use crate::instance::ExternalInstance;
use crate::registry::{
    ChangeKind, RegistryQuery, WATCH_CHANNEL_SIZE, WatchAdapter, WatchEvent, forward,
};

/// Namespace reported by [`FakeRegistry`] when it pretends to be empty
pub const FAKE_NAMESPACE: &str = "/services";

/// Registry holding instances in memory, grouped by service name.
///
/// Mutations made through [`insert`](FakeRegistry::insert) and
/// [`remove`](FakeRegistry::remove) notify the current subscriber; the
/// `_quietly` variants do not.
pub struct FakeRegistry<I: ExternalInstance> {
    services: RwLock<BTreeMap<String, Vec<I>>>,
    watcher: Mutex<Option<mpsc::Sender<WatchEvent>>>,
    gate: Arc<Mutex<()>>,
    query_failure: RwLock<Option<String>>,
    connect_fails: AtomicBool,
    connect_delay_ms: AtomicU64,
    connected: AtomicBool,
    missing_namespace: AtomicBool,
    connects: AtomicUsize,
    names_queries: AtomicUsize,
    closes: AtomicUsize,
}

impl<I: ExternalInstance> Default for FakeRegistry<I> {
    fn default() -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            watcher: Mutex::new(None),
            gate: Arc::new(Mutex::new(())),
            query_failure: RwLock::new(None),
            connect_fails: AtomicBool::new(false),
            connect_delay_ms: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            missing_namespace: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            names_queries: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl<I: ExternalInstance> FakeRegistry<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: I) {
        let name = instance.name().to_string();
        self.insert_quietly(instance).await;
        self.notify(ChangeKind::Added, &name).await;
    }

    pub async fn insert_quietly(&self, instance: I) {
        self.services
            .write()
            .await
            .entry(instance.name().to_string())
            .or_default()
            .push(instance);
    }

    pub async fn remove(&self, key: &I::Key) {
        if let Some(name) = self.remove_quietly(key).await {
            self.notify(ChangeKind::Removed, &name).await;
        }
    }

    /// Remove the instance with identity `key`, returning its service name
    pub async fn remove_quietly(&self, key: &I::Key) -> Option<String> {
        let mut services = self.services.write().await;
        let mut found = None;
        for (name, instances) in services.iter_mut() {
            let before = instances.len();
            instances.retain(|instance| &instance.key() != key);
            if instances.len() != before {
                found = Some(name.clone());
                break;
            }
        }
        services.retain(|_, instances| !instances.is_empty());
        found
    }

    /// Swap the whole registry content without notifying anyone
    pub async fn replace_quietly(&self, instances: impl IntoIterator<Item = I>) {
        let mut services = BTreeMap::<String, Vec<I>>::new();
        for instance in instances {
            services
                .entry(instance.name().to_string())
                .or_default()
                .push(instance);
        }
        *self.services.write().await = services;
    }

    /// Deliver a change notification to the current subscriber, if any
    pub async fn notify(&self, kind: ChangeKind, path: &str) {
        if let Some(tx) = self.watcher.lock().await.as_ref() {
            forward(tx, WatchEvent::new(kind, path));
        }
    }

    /// Block every names query until the returned guard is dropped. The query
    /// is counted before it blocks.
    pub async fn hold_queries(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    pub async fn fail_queries(&self, reason: Option<&str>) {
        *self.query_failure.write().await = reason.map(str::to_string);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.connect_fails.store(fail, Ordering::SeqCst);
    }

    /// Make every connect attempt take `delay` before it resolves
    pub fn delay_connect(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report the namespace as not existing
    pub fn set_missing_namespace(&self, missing: bool) {
        self.missing_namespace.store(missing, Ordering::SeqCst);
    }

    pub async fn is_subscribed(&self) -> bool {
        self.watcher.lock().await.is_some()
    }

    /// Whether a connection was made and not closed since
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn names_queries(&self) -> usize {
        self.names_queries.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn check_failure(&self) -> Result<(), RegistryError> {
        match self.query_failure.read().await.as_ref() {
            Some(reason) => Err(RegistryError::Query(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<I: ExternalInstance> RegistryQuery for FakeRegistry<I> {
    type Instance = I;

    async fn connect(&self) -> Result<(), RegistryError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(RegistryError::Connection("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn query_names(&self) -> Result<Vec<String>, RegistryError> {
        self.names_queries.fetch_add(1, Ordering::SeqCst);
        let _gate = self.gate.lock().await;
        self.check_failure().await?;
        if self.missing_namespace.load(Ordering::SeqCst) {
            return Err(RegistryError::NoNode(FAKE_NAMESPACE.into()));
        }
        Ok(self.services.read().await.keys().cloned().collect())
    }

    async fn query_instances(&self, name: &str) -> Result<Vec<I>, RegistryError> {
        self.check_failure().await?;
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NoNode(format!("{FAKE_NAMESPACE}/{name}")))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<I: ExternalInstance> WatchAdapter for FakeRegistry<I> {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WatchEvent>, RegistryError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        *self.watcher.lock().await = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        self.watcher.lock().await.take();
    }
}

/// Catalog wrapper that counts calls and fails on demand.
#[derive(Default)]
pub struct FlakyCatalog {
    catalog: InMemoryCatalog,
    failing_names: RwLock<HashSet<String>>,
    unpublish_fails: AtomicBool,
    publish_calls: AtomicUsize,
    unpublish_calls: AtomicUsize,
}

impl FlakyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    /// Reject every publish of a record named `name`
    pub async fn fail_publish_of(&self, name: &str) {
        self.failing_names.write().await.insert(name.to_string());
    }

    pub fn fail_unpublish(&self, fail: bool) {
        self.unpublish_fails.store(fail, Ordering::SeqCst);
    }

    /// Stop failing anything
    pub async fn heal(&self) {
        self.failing_names.write().await.clear();
        self.fail_unpublish(false);
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn unpublish_calls(&self) -> usize {
        self.unpublish_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogPublisher for FlakyCatalog {
    async fn publish(&self, record: Record) -> CatalogResult<RecordHandle> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_names.read().await.contains(&record.name) {
            return Err(CatalogError::PublishRejected {
                name: record.name,
                reason: "catalog unavailable".into(),
            });
        }
        self.catalog.publish(record).await
    }

    async fn unpublish(&self, handle: &RecordHandle) -> CatalogResult<()> {
        self.unpublish_calls.fetch_add(1, Ordering::SeqCst);
        if self.unpublish_fails.load(Ordering::SeqCst) {
            return Err(CatalogError::UnpublishRejected {
                handle: handle.clone(),
                reason: "catalog unavailable".into(),
            });
        }
        self.catalog.unpublish(handle).await
    }
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
