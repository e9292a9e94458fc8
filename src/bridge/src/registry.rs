use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RegistryError;
use crate::instance::ExternalInstance;

/// Capacity of watch channels. A full channel already guarantees a follow-up
/// reconciliation, so adapters drop events rather than wait.
pub const WATCH_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Notification that something changed below the watched subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    /// Registry path (or key) that changed
    pub path: String,
}

impl WatchEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Read side of the external registry.
#[async_trait]
pub trait RegistryQuery: Send + Sync + 'static {
    type Instance: ExternalInstance;

    /// Establish the connection, retrying as configured
    async fn connect(&self) -> Result<(), RegistryError>;

    /// Names of all services below the watched subtree.
    ///
    /// A subtree that does not exist yet is reported as
    /// [`RegistryError::NoNode`].
    async fn query_names(&self) -> Result<Vec<String>, RegistryError>;

    /// All instances registered under `name`
    async fn query_instances(&self, name: &str) -> Result<Vec<Self::Instance>, RegistryError>;

    /// Release the connection
    async fn close(&self);
}

/// Change notifications of the external registry.
#[async_trait]
pub trait WatchAdapter: Send + Sync + 'static {
    /// Start watching; events are delivered on the returned channel until
    /// [`unsubscribe`](WatchAdapter::unsubscribe) is called
    async fn subscribe(&self) -> Result<mpsc::Receiver<WatchEvent>, RegistryError>;

    async fn unsubscribe(&self);
}

/// Forward `event` without waiting, returns false once the receiver is gone
pub(crate) fn forward(tx: &mpsc::Sender<WatchEvent>, event: WatchEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::trace!("Watch channel full, dropping {event:?}");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
