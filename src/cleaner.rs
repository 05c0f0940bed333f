//! Leaked resource reconciliation.
//!
//! Races between transitions and worker restarts can leave storage engines on disk which no
//! longer belong to any live version. The cleaner periodically removes every local resource
//! which the metadata service does not know of and which has no running consumption task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{ConsumptionService, StorageService, StoreRepository};
use crate::config::IngestionConfig;
use crate::models::ResourceId;

const METRIC_LEAKED_RESOURCES_REMOVED: &str = "hadron_ingest_leaked_resources_removed";
const METRIC_LEAKED_RESOURCE_REMOVAL_FAILURES: &str = "hadron_ingest_leaked_resource_removal_failures";

/// A background task removing leaked storage engines on a fixed interval.
pub struct LeakedResourceCleaner {
    interval: Duration,
    storage: Arc<dyn StorageService>,
    stores: Arc<dyn StoreRepository>,
    consumption: Arc<dyn ConsumptionService>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl LeakedResourceCleaner {
    /// Create a new instance.
    pub fn new(
        config: &IngestionConfig, storage: Arc<dyn StorageService>, stores: Arc<dyn StoreRepository>, consumption: Arc<dyn ConsumptionService>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        metrics::register_counter!(METRIC_LEAKED_RESOURCES_REMOVED, metrics::Unit::Count, "leaked storage engines removed by the cleaner");
        metrics::register_counter!(METRIC_LEAKED_RESOURCE_REMOVAL_FAILURES, metrics::Unit::Count, "leaked storage engines which failed to be removed");
        Self {
            interval: config.leaked_resource_cleanup_interval(),
            storage,
            stores,
            consumption,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(interval = ?self.interval, "leaked resource cleaner has started");
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.clean_up_leaked_resources().await;
                    if !removed.is_empty() {
                        tracing::info!(removed = ?removed, "removed leaked resources");
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }
        tracing::debug!("leaked resource cleaner has shutdown");
        Ok(())
    }

    /// Execute one reconciliation pass, returning the resources which were removed.
    ///
    /// The set of local resources is snapshotted up front. A resource is leaked when its
    /// version is unknown to the metadata service and it has no running consumption task.
    /// Removal failures are logged and do not stop the pass.
    pub async fn clean_up_leaked_resources(&self) -> Vec<ResourceId> {
        let mut by_store: BTreeMap<String, Vec<ResourceId>> = BTreeMap::new();
        for resource in self.storage.local_resources() {
            by_store.entry(resource.store().to_string()).or_default().push(resource);
        }

        let mut removed = vec![];
        for (store_name, resources) in by_store {
            let store = self.stores.get_store(&store_name);
            if store.is_none() {
                tracing::debug!(store = %store_name, "store is unknown to the metadata service");
            }
            for resource in resources {
                if matches!(&store, Some(store) if store.has_version(resource.version())) {
                    continue;
                }
                if self.consumption.contains_running_consumption(&resource) {
                    tracing::debug!(%resource, "resource is unknown to the metadata service but is still consuming, keeping");
                    continue;
                }
                match self.storage.remove_storage_engine(&resource).await {
                    Ok(()) => {
                        tracing::info!(%resource, "removed leaked resource");
                        metrics::increment_counter!(METRIC_LEAKED_RESOURCES_REMOVED);
                        removed.push(resource);
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, %resource, "error removing leaked resource");
                        metrics::increment_counter!(METRIC_LEAKED_RESOURCE_REMOVAL_FAILURES);
                    }
                }
            }
        }
        removed
    }
}
