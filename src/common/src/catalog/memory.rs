use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use super::{ANNOUNCE_CHANNEL_SIZE, CatalogError, CatalogPublisher, CatalogResult};
use crate::model::{Record, RecordHandle, Status};

/// In-memory catalog using a hash map and tokio's broadcast channel for
/// announcements
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    records: Arc<RwLock<HashMap<RecordHandle, Record>>>,
    announcements: broadcast::Sender<Record>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        let (announcements, _) = broadcast::channel(ANNOUNCE_CHANNEL_SIZE);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            announcements,
        }
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every record change: `UP` on publish, `DOWN` on unpublish
    pub fn announcements(&self) -> broadcast::Receiver<Record> {
        self.announcements.subscribe()
    }

    /// Snapshot of the currently published records
    pub async fn records(&self) -> Vec<Record> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn get(&self, handle: &RecordHandle) -> Option<Record> {
        self.records.read().await.get(handle).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn announce(&self, record: Record) {
        // No subscribers is fine
        let _ = self.announcements.send(record);
    }
}

#[async_trait]
impl CatalogPublisher for InMemoryCatalog {
    async fn publish(&self, mut record: Record) -> CatalogResult<RecordHandle> {
        let handle = RecordHandle::new(Uuid::new_v4().to_string());
        record.registration = Some(handle.clone());
        if record.status == Status::Unknown {
            record.status = Status::Up;
        }

        self.records
            .write()
            .await
            .insert(handle.clone(), record.clone());
        log::debug!("Published record {} as {}", record.name, handle);

        self.announce(record);
        Ok(handle)
    }

    async fn unpublish(&self, handle: &RecordHandle) -> CatalogResult<()> {
        let removed = self.records.write().await.remove(handle);
        let Some(mut record) = removed else {
            return Err(CatalogError::NotFound(handle.clone()));
        };
        log::debug!("Unpublished record {} ({})", record.name, handle);

        record.status = Status::Down;
        self.announce(record);
        Ok(())
    }
}
