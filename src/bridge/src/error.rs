use common::catalog::CatalogError;
use common::model::RecordHandle;

use crate::reconciler::BridgeState;

/// Errors reported by a registry collaborator
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The queried namespace or name does not exist (yet)
    #[error("Registry node does not exist: {0}")]
    NoNode(String),

    #[error("Failed to connect to registry: {0}")]
    Connection(String),

    #[error("Registry is not connected")]
    NotConnected,

    #[error("Registry query failed: {0}")]
    Query(String),

    #[error("Registry watch failed: {0}")]
    Watch(String),

    #[error("Invalid service instance payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A service descriptor that cannot be turned into a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("Service descriptor is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Service descriptor declares no ports")]
    NoPorts,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to connect to the registry: {0}")]
    Connection(#[source] RegistryError),

    #[error("Failed to subscribe to registry changes: {0}")]
    Watch(#[source] RegistryError),

    #[error("Unable to retrieve service instances from the registry: {0}")]
    Snapshot(#[source] RegistryError),

    #[error("Failed to translate instance {key}: {source}")]
    Translate {
        key: String,
        #[source]
        source: TranslateError,
    },

    #[error("Failed to publish instance {key}: {source}")]
    Publish {
        key: String,
        #[source]
        source: CatalogError,
    },

    #[error("Failed to unpublish instance {key} ({handle}): {source}")]
    Unpublish {
        key: String,
        handle: RecordHandle,
        #[source]
        source: CatalogError,
    },

    #[error("Operation not allowed while the bridge is {0}")]
    InvalidState(BridgeState),

    #[error("Bridge was closed while starting")]
    ClosedWhileStarting,
}
