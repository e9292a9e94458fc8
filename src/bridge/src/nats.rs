//! Registry backed by a NATS JetStream key-value bucket.
//!
//! Each instance is stored as JSON under the key `{name}.{id}` of the bucket
//! derived from the configured base path (`/services/prod` becomes
//! `services_prod`). Service names must therefore not contain dots.

use std::collections::BTreeSet;
use std::fmt;

use async_nats::jetstream::{
    self,
    context::KeyValueErrorKind,
    kv::{self, Operation, Store},
};
use async_trait::async_trait;
use common::config::{RegistryConfig, RetryPolicy};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::RegistryError;
use crate::instance::ServiceInstance;
use crate::registry::{
    ChangeKind, RegistryQuery, WATCH_CHANNEL_SIZE, WatchAdapter, WatchEvent, forward,
};

const DEFAULT_BUCKET: &str = "discovery";

/// Caps the watch error backoff at `base * 2^6`
const MAX_WATCH_BACKOFF_EXPONENT: u32 = 6;

/// Bucket name for a registry base path
pub fn bucket_name(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BUCKET.to_string();
    }
    trimmed.replace('/', "_")
}

fn instance_key(name: &str, id: &str) -> String {
    format!("{name}.{id}")
}

pub struct NatsRegistry {
    config: RegistryConfig,
    bucket: String,
    client: RwLock<Option<async_nats::Client>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl NatsRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let bucket = bucket_name(&config.base_path);
        Self {
            config,
            bucket,
            client: RwLock::new(None),
            watch_task: Mutex::new(None),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn context(&self) -> Result<jetstream::Context, RegistryError> {
        let client = self.client.read().await;
        let client = client.as_ref().ok_or(RegistryError::NotConnected)?;
        Ok(jetstream::new(client.clone()))
    }

    /// The bucket, reported as [`RegistryError::NoNode`] when it does not exist
    async fn store(&self) -> Result<Store, RegistryError> {
        let context = self.context().await?;
        context.get_key_value(&self.bucket).await.map_err(|e| {
            if matches!(e.kind(), KeyValueErrorKind::GetBucket) {
                RegistryError::NoNode(self.bucket.clone())
            } else {
                RegistryError::Query(e.to_string())
            }
        })
    }

    async fn ensure_store(&self) -> Result<Store, RegistryError> {
        match self.store().await {
            Err(RegistryError::NoNode(_)) => {
                log::info!("Creating registry bucket {}", self.bucket);
                self.context()
                    .await?
                    .create_key_value(kv::Config {
                        bucket: self.bucket.clone(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| RegistryError::Query(e.to_string()))
            }
            other => other,
        }
    }

    async fn keys(&self, store: &Store) -> Result<Vec<String>, RegistryError> {
        let keys = store
            .keys()
            .await
            .map_err(|e| RegistryError::Query(e.to_string()))?;
        keys.try_collect()
            .await
            .map_err(|e| RegistryError::Query(e.to_string()))
    }

    /// Announce an instance in the registry
    pub async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let store = self.ensure_store().await?;
        let value = serde_json::to_vec(instance)?;
        store
            .put(instance_key(&instance.name, &instance.id), value.into())
            .await
            .map_err(|e| RegistryError::Query(e.to_string()))?;
        log::debug!("Registered {}/{} in bucket {}", instance.name, instance.id, self.bucket);
        Ok(())
    }

    /// Withdraw an instance from the registry
    pub async fn deregister(&self, name: &str, id: &str) -> Result<(), RegistryError> {
        let store = self.store().await?;
        store
            .delete(instance_key(name, id))
            .await
            .map_err(|e| RegistryError::Query(e.to_string()))?;
        log::debug!("Deregistered {name}/{id} from bucket {}", self.bucket);
        Ok(())
    }
}

#[async_trait]
impl RegistryQuery for NatsRegistry {
    type Instance = ServiceInstance;

    async fn connect(&self) -> Result<(), RegistryError> {
        if self.client.read().await.is_some() {
            return Ok(());
        }

        let policy = self.config.retry_policy();
        let mut attempt = 0;
        let client = loop {
            let options = async_nats::ConnectOptions::new()
                .max_reconnects(Some(policy.max_retries as usize))
                .reconnect_delay_callback(move |attempts| policy.delay_for(attempts as u32));

            match options.connect(self.config.connection.as_str()).await {
                Ok(client) => break client,
                Err(e) if attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    log::warn!(
                        "Failed to connect to registry at {} (attempt {}): {e}, retrying in {delay:?}",
                        self.config.connection,
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(RegistryError::Connection(e.to_string())),
            }
        };

        log::info!(
            "Connected to registry at {}, watching bucket {}",
            self.config.connection,
            self.bucket
        );
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn query_names(&self) -> Result<Vec<String>, RegistryError> {
        let store = self.store().await?;
        let names: BTreeSet<String> = self
            .keys(&store)
            .await?
            .into_iter()
            .filter_map(|key| key.split_once('.').map(|(name, _)| name.to_string()))
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn query_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let store = self.store().await?;
        let prefix = format!("{name}.");

        let mut instances = Vec::new();
        for key in self.keys(&store).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let value = store
                .get(&key)
                .await
                .map_err(|e| RegistryError::Query(e.to_string()))?;
            // Deleted between listing and reading
            let Some(value) = value else {
                continue;
            };
            match serde_json::from_slice::<ServiceInstance>(&value) {
                Ok(instance) => instances.push(instance),
                Err(e) => log::warn!("Skipping undecodable registry entry {key}: {e}"),
            }
        }

        if instances.is_empty() {
            return Err(RegistryError::NoNode(format!("{}/{name}", self.bucket)));
        }
        Ok(instances)
    }

    async fn close(&self) {
        if self.client.write().await.take().is_some() {
            log::info!("Disconnected from registry at {}", self.config.connection);
        }
    }
}

#[async_trait]
impl WatchAdapter for NatsRegistry {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WatchEvent>, RegistryError> {
        let store = self.ensure_store().await?;
        let watch = Box::pin(
            store
                .watch_all()
                .await
                .map_err(|e| RegistryError::Watch(e.to_string()))?,
        );

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        let handle = tokio::spawn(forward_changes(
            watch,
            tx,
            self.bucket.clone(),
            self.config.retry_policy(),
            |entry: kv::Entry| {
                let kind = match entry.operation {
                    Operation::Put => ChangeKind::Added,
                    Operation::Delete | Operation::Purge => ChangeKind::Removed,
                };
                WatchEvent::new(kind, entry.key)
            },
        ));

        if let Some(previous) = self.watch_task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self.watch_task.lock().await.take() {
            handle.abort();
        }
    }
}

/// Forward bucket changes until the stream ends or nobody listens.
///
/// A stream error backs off exponentially and then emits an `Updated` event
/// for the bucket, since changes may have been missed meanwhile.
async fn forward_changes<S, T, E>(
    mut changes: S,
    tx: mpsc::Sender<WatchEvent>,
    bucket: String,
    policy: RetryPolicy,
    to_event: impl Fn(T) -> WatchEvent,
) where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: fmt::Display,
{
    let mut failures = 0u32;
    while let Some(change) = changes.next().await {
        let event = match change {
            Ok(change) => {
                failures = 0;
                to_event(change)
            }
            Err(e) => {
                let delay = policy.delay_for(failures.min(MAX_WATCH_BACKOFF_EXPONENT));
                failures = failures.saturating_add(1);
                log::warn!("Error watching registry bucket {bucket}: {e}, resuming in {delay:?}");
                tokio::time::sleep(delay).await;
                WatchEvent::new(ChangeKind::Updated, bucket.clone())
            }
        };
        if !forward(&tx, event) {
            break;
        }
    }
    log::debug!("Registry watch on bucket {bucket} ended");
}
