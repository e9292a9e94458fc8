//! Mirrors the service instances of an external registry into the local
//! discovery catalog.
//!
//! A [`Reconciler`] owns the set of records it published. On start and on
//! every change notification it fetches a full snapshot of the registry,
//! diffs it against that set and applies the difference, so the catalog
//! converges to the registry content however notifications are batched or
//! lost.

use async_trait::async_trait;

pub mod classify;
pub mod diff;
pub mod error;
pub mod index;
pub mod instance;
pub mod kubernetes;
pub mod nats;
pub mod reconciler;
pub mod registry;
pub mod translate;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{BridgeError, RegistryError, TranslateError};
pub use index::{Registration, RegistrationIndex};
pub use instance::{ExternalInstance, InstanceKey, InstanceType, ServiceInstance};
pub use kubernetes::{KubernetesService, ServiceKey, ServicePort};
pub use nats::NatsRegistry;
pub use reconciler::{BridgeState, CycleOutcome, Reconciler};
pub use registry::{ChangeKind, RegistryQuery, WatchAdapter, WatchEvent};

/// Lifecycle of a service importer plugged into the discovery catalog.
#[async_trait]
pub trait ServiceImporter: Send + Sync {
    /// Begin importing; resolves once the initial import completed
    async fn start(&self) -> Result<(), BridgeError>;

    /// React to a change notification of the registry
    async fn on_event(&self, event: WatchEvent);

    /// Stop importing and withdraw every imported record
    async fn close(&self);
}
