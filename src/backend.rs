//! Narrow interfaces to the collaborators of the ingestion control plane.
//!
//! The consumption engine, the storage engine and the metadata service are black boxes to
//! this crate; they are reached only through these traits, and they are wired together by
//! a `ComponentFactory` when the supervising process sends its INIT action.

use std::sync::Arc;

use anyhow::Result;

use crate::config::IngestionConfig;
use crate::models::{IngestionTaskReport, PartitionKey, ResourceId, Store};
use crate::notifier::IngestionNotifier;
use crate::state_model::SectionToken;

/// The log consumption engine which applies records to storage.
///
/// Lifecycle milestones are reported by the engine through the `IngestionNotifier` it is
/// built with.
#[async_trait::async_trait]
pub trait ConsumptionService: Send + Sync {
    /// Begin consuming the given partition. This is expected to return once the consumption
    /// task has been queued, not once it has caught up.
    async fn start_consumption(&self, key: &PartitionKey) -> Result<()>;

    /// Cooperatively stop consuming the given partition.
    async fn stop_consumption(&self, key: &PartitionKey) -> Result<()>;

    /// Forcibly terminate the consumption task of a whole resource, returning `true` if a
    /// task was running.
    async fn kill_consumption_task(&self, resource: &ResourceId) -> Result<bool>;

    /// Reset the stored offset of the given partition.
    async fn reset_consumption_offset(&self, key: &PartitionKey) -> Result<()>;

    /// Promote the given partition to leader.
    ///
    /// The engine must re-check `section.is_current()` before acting on a queued promotion.
    async fn promote_to_leader(&self, key: &PartitionKey, section: SectionToken) -> Result<()>;

    /// Demote the given partition to standby, honoring `section` like `promote_to_leader`.
    async fn demote_to_standby(&self, key: &PartitionKey, section: SectionToken) -> Result<()>;

    /// Check if the given partition is currently consuming. Unknown partitions are not.
    fn is_partition_consuming(&self, key: &PartitionKey) -> bool;

    /// Check if the given resource has a running consumption task.
    fn contains_running_consumption(&self, resource: &ResourceId) -> bool;

    /// Stop the engine as a whole.
    async fn stop(&self) -> Result<()>;
}

/// The embedded storage engine.
#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    /// Open the given data partition, creating it if absent.
    async fn open_partition(&self, key: &PartitionKey) -> Result<()>;

    /// Open only the metadata partition of the given resource.
    async fn open_metadata_partition(&self, resource: &ResourceId) -> Result<()>;

    /// Drop the given data partition along with its data.
    async fn drop_partition(&self, key: &PartitionKey) -> Result<()>;

    /// Remove the storage engine of the given resource entirely.
    async fn remove_storage_engine(&self, resource: &ResourceId) -> Result<()>;

    /// A snapshot of all resources which have a local storage engine.
    fn local_resources(&self) -> Vec<ResourceId>;

    /// The number of open data partitions across all resources.
    fn open_partition_count(&self) -> usize;

    /// Stop the storage service as a whole.
    async fn stop(&self) -> Result<()>;
}

/// The cluster metadata service's view of stores.
#[async_trait::async_trait]
pub trait StoreRepository: Send + Sync {
    /// Get the given store, if it is known.
    fn get_store(&self, name: &str) -> Option<Store>;

    /// Ensure the given store's metadata is being tracked.
    async fn subscribe(&self, name: &str) -> Result<()>;
}

/// Persisted per-partition and per-resource storage metadata.
#[async_trait::async_trait]
pub trait StorageMetadataService: Send + Sync {
    async fn put_offset_record(&self, key: &PartitionKey, record: &[u8]) -> Result<()>;

    async fn clear_offset_record(&self, key: &PartitionKey) -> Result<()>;

    async fn put_store_version_state(&self, resource: &ResourceId, state: &[u8]) -> Result<()>;

    async fn clear_store_version_state(&self, resource: &ResourceId) -> Result<()>;
}

/// The transport used to push reports back to the supervising process.
#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, report: IngestionTaskReport) -> Result<()>;
}

/// The components wired together by the INIT action.
#[derive(Clone)]
pub struct Components {
    pub consumption: Arc<dyn ConsumptionService>,
    pub storage: Arc<dyn StorageService>,
    pub stores: Arc<dyn StoreRepository>,
    pub storage_metadata: Arc<dyn StorageMetadataService>,
    pub report_sink: Arc<dyn ReportSink>,
}

/// Builds the worker's components from the INIT config.
///
/// The consumption engine is expected to report through the given notifier.
#[async_trait::async_trait]
pub trait ComponentFactory: Send + Sync {
    async fn build(&self, config: Arc<IngestionConfig>, notifier: IngestionNotifier) -> Result<Components>;
}
