use async_trait::async_trait;

use crate::model::{Record, RecordHandle};

pub mod memory;
pub mod sql;

pub use memory::InMemoryCatalog;
pub use sql::SqlCatalog;

/// Capacity of the announcement channel of the bundled catalogs.
pub const ANNOUNCE_CHANNEL_SIZE: usize = 256;

/// Error types that can occur during catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("No record published under registration {0}")]
    NotFound(RecordHandle),

    #[error("Failed to publish record {name}: {reason}")]
    PublishRejected { name: String, reason: String },

    #[error("Failed to unpublish record {handle}: {reason}")]
    UnpublishRejected { handle: RecordHandle, reason: String },

    #[error("Catalog database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Write side of the local discovery catalog.
///
/// `publish` stores the record and returns the handle under which it can later
/// be removed. Implementations assign the handle and stamp it into the stored
/// record's `registration` field.
#[async_trait]
pub trait CatalogPublisher: Send + Sync {
    async fn publish(&self, record: Record) -> CatalogResult<RecordHandle>;

    async fn unpublish(&self, handle: &RecordHandle) -> CatalogResult<()>;
}
