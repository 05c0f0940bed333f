//! In-memory collaborators used across the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::backend::{ComponentFactory, Components, ConsumptionService, ReportSink, StorageMetadataService, StorageService, StoreRepository};
use crate::config::IngestionConfig;
use crate::error::IngestionError;
use crate::models::{IngestionTaskReport, PartitionKey, ResourceId, Store};
use crate::notifier::IngestionNotifier;
use crate::state_model::SectionToken;

/// Build a partition key.
pub fn key(store: &str, version: u32, partition: u32) -> PartitionKey {
    PartitionKey::new(ResourceId::new(store, version), partition)
}

/// Build a store with the given current version and known versions.
pub fn store(name: &str, current_version: u32, versions: &[u32]) -> Store {
    Store {
        name: name.into(),
        current_version,
        versions: versions.to_vec(),
        bootstrap_to_online_timeout_hours: None,
    }
}

/// Find the typed ingestion error in the given error's chain.
pub fn ingestion_error(err: &anyhow::Error) -> Option<&IngestionError> {
    err.chain().find_map(|cause| cause.downcast_ref::<IngestionError>())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A call made against the fake consumption engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumptionCall {
    Start(PartitionKey),
    Stop(PartitionKey),
    Kill(ResourceId),
    Reset(PartitionKey),
    Promote(PartitionKey, u64),
    Demote(PartitionKey, u64),
    StopService,
}

/// A consumption engine recording every call.
#[derive(Default)]
pub struct FakeConsumption {
    calls: Mutex<Vec<ConsumptionCall>>,
    consuming: Mutex<HashSet<PartitionKey>>,
    running: Mutex<HashSet<ResourceId>>,
    /// When set, partitions keep consuming after being stopped.
    stuck: AtomicBool,
    /// When set, the next engine call fails with this message.
    failure: Mutex<Option<String>>,
}

impl FakeConsumption {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ConsumptionCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&ConsumptionCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| pred(call)).count()
    }

    pub fn started(&self, key: &PartitionKey) -> bool {
        self.count(|call| call == &ConsumptionCall::Start(key.clone())) > 0
    }

    /// Mark the given partition as consuming, along with its resource.
    pub fn set_consuming(&self, key: &PartitionKey) {
        lock(&self.consuming).insert(key.clone());
        lock(&self.running).insert(key.resource.clone());
    }

    /// Mark the given resource as having a running consumption task.
    pub fn set_running(&self, resource: &ResourceId) {
        lock(&self.running).insert(resource.clone());
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn fail_next(&self, message: &str) {
        *lock(&self.failure) = Some(message.into());
    }

    fn record(&self, call: ConsumptionCall) -> Result<()> {
        lock(&self.calls).push(call);
        if let Some(message) = lock(&self.failure).take() {
            bail!("{}", message);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConsumptionService for FakeConsumption {
    async fn start_consumption(&self, key: &PartitionKey) -> Result<()> {
        self.record(ConsumptionCall::Start(key.clone()))?;
        self.set_consuming(key);
        Ok(())
    }

    async fn stop_consumption(&self, key: &PartitionKey) -> Result<()> {
        self.record(ConsumptionCall::Stop(key.clone()))?;
        if !self.stuck.load(Ordering::SeqCst) {
            lock(&self.consuming).remove(key);
        }
        Ok(())
    }

    async fn kill_consumption_task(&self, resource: &ResourceId) -> Result<bool> {
        self.record(ConsumptionCall::Kill(resource.clone()))?;
        lock(&self.consuming).retain(|key| &key.resource != resource);
        Ok(lock(&self.running).remove(resource))
    }

    async fn reset_consumption_offset(&self, key: &PartitionKey) -> Result<()> {
        self.record(ConsumptionCall::Reset(key.clone()))
    }

    async fn promote_to_leader(&self, key: &PartitionKey, section: SectionToken) -> Result<()> {
        self.record(ConsumptionCall::Promote(key.clone(), section.id()))
    }

    async fn demote_to_standby(&self, key: &PartitionKey, section: SectionToken) -> Result<()> {
        self.record(ConsumptionCall::Demote(key.clone(), section.id()))
    }

    fn is_partition_consuming(&self, key: &PartitionKey) -> bool {
        lock(&self.consuming).contains(key)
    }

    fn contains_running_consumption(&self, resource: &ResourceId) -> bool {
        lock(&self.running).contains(resource)
    }

    async fn stop(&self) -> Result<()> {
        self.record(ConsumptionCall::StopService)
    }
}

/// An in-memory storage service.
#[derive(Default)]
pub struct FakeStorage {
    resources: Mutex<BTreeMap<ResourceId, BTreeSet<u32>>>,
    metadata_open: Mutex<BTreeSet<ResourceId>>,
    dropped: Mutex<Vec<PartitionKey>>,
    removed: Mutex<Vec<ResourceId>>,
    fail_removal: Mutex<HashSet<ResourceId>>,
    stopped: AtomicBool,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a resource as present on disk.
    pub fn add_resource(&self, resource: ResourceId) {
        lock(&self.resources).entry(resource).or_default();
    }

    pub fn fail_removal_of(&self, resource: &ResourceId) {
        lock(&self.fail_removal).insert(resource.clone());
    }

    pub fn has_partition(&self, key: &PartitionKey) -> bool {
        lock(&self.resources).get(&key.resource).map(|parts| parts.contains(&key.partition)).unwrap_or(false)
    }

    pub fn is_metadata_open(&self, resource: &ResourceId) -> bool {
        lock(&self.metadata_open).contains(resource)
    }

    pub fn dropped(&self) -> Vec<PartitionKey> {
        lock(&self.dropped).clone()
    }

    pub fn removed(&self) -> Vec<ResourceId> {
        lock(&self.removed).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StorageService for FakeStorage {
    async fn open_partition(&self, key: &PartitionKey) -> Result<()> {
        lock(&self.resources).entry(key.resource.clone()).or_default().insert(key.partition);
        Ok(())
    }

    async fn open_metadata_partition(&self, resource: &ResourceId) -> Result<()> {
        lock(&self.resources).entry(resource.clone()).or_default();
        lock(&self.metadata_open).insert(resource.clone());
        Ok(())
    }

    async fn drop_partition(&self, key: &PartitionKey) -> Result<()> {
        if let Some(parts) = lock(&self.resources).get_mut(&key.resource) {
            parts.remove(&key.partition);
        }
        lock(&self.dropped).push(key.clone());
        Ok(())
    }

    async fn remove_storage_engine(&self, resource: &ResourceId) -> Result<()> {
        if lock(&self.fail_removal).contains(resource) {
            bail!("injected failure removing {}", resource);
        }
        lock(&self.resources).remove(resource);
        lock(&self.metadata_open).remove(resource);
        lock(&self.removed).push(resource.clone());
        Ok(())
    }

    fn local_resources(&self) -> Vec<ResourceId> {
        lock(&self.resources).keys().cloned().collect()
    }

    fn open_partition_count(&self) -> usize {
        lock(&self.resources).values().map(|parts| parts.len()).sum()
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An in-memory store repository.
#[derive(Default)]
pub struct FakeStores {
    stores: Mutex<HashMap<String, Store>>,
    subscribed: Mutex<HashSet<String>>,
}

impl FakeStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, store: Store) {
        lock(&self.stores).insert(store.name.clone(), store);
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        lock(&self.subscribed).contains(name)
    }
}

#[async_trait::async_trait]
impl StoreRepository for FakeStores {
    fn get_store(&self, name: &str) -> Option<Store> {
        lock(&self.stores).get(name).cloned()
    }

    async fn subscribe(&self, name: &str) -> Result<()> {
        lock(&self.subscribed).insert(name.into());
        Ok(())
    }
}

/// An in-memory storage metadata service.
#[derive(Default)]
pub struct FakeStorageMetadata {
    offsets: Mutex<HashMap<PartitionKey, Vec<u8>>>,
    version_states: Mutex<HashMap<ResourceId, Vec<u8>>>,
}

impl FakeStorageMetadata {
    pub fn offset_record(&self, key: &PartitionKey) -> Option<Vec<u8>> {
        lock(&self.offsets).get(key).cloned()
    }

    pub fn store_version_state(&self, resource: &ResourceId) -> Option<Vec<u8>> {
        lock(&self.version_states).get(resource).cloned()
    }
}

#[async_trait::async_trait]
impl StorageMetadataService for FakeStorageMetadata {
    async fn put_offset_record(&self, key: &PartitionKey, record: &[u8]) -> Result<()> {
        lock(&self.offsets).insert(key.clone(), record.to_vec());
        Ok(())
    }

    async fn clear_offset_record(&self, key: &PartitionKey) -> Result<()> {
        lock(&self.offsets).remove(key);
        Ok(())
    }

    async fn put_store_version_state(&self, resource: &ResourceId, state: &[u8]) -> Result<()> {
        lock(&self.version_states).insert(resource.clone(), state.to_vec());
        Ok(())
    }

    async fn clear_store_version_state(&self, resource: &ResourceId) -> Result<()> {
        lock(&self.version_states).remove(resource);
        Ok(())
    }
}

/// A report sink forwarding every report onto a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<IngestionTaskReport>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<IngestionTaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait::async_trait]
impl ReportSink for ChannelSink {
    async fn send(&self, report: IngestionTaskReport) -> Result<()> {
        self.tx.send(report)?;
        Ok(())
    }
}

/// A component factory handing out in-memory components.
pub struct FakeFactory {
    pub consumption: Arc<FakeConsumption>,
    pub storage: Arc<FakeStorage>,
    pub stores: Arc<FakeStores>,
    pub storage_metadata: Arc<FakeStorageMetadata>,
    pub sink: Arc<ChannelSink>,
    notifier: Mutex<Option<IngestionNotifier>>,
    fail: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<IngestionTaskReport>) {
        let (sink, reports) = ChannelSink::new();
        (
            Arc::new(Self {
                consumption: FakeConsumption::new(),
                storage: FakeStorage::new(),
                stores: FakeStores::new(),
                storage_metadata: Arc::new(FakeStorageMetadata::default()),
                sink,
                notifier: Mutex::new(None),
                fail: AtomicBool::new(false),
            }),
            reports,
        )
    }

    /// Make the next builds fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The notifier handed to the last successful build.
    pub fn notifier(&self) -> Option<IngestionNotifier> {
        lock(&self.notifier).clone()
    }
}

#[async_trait::async_trait]
impl ComponentFactory for FakeFactory {
    async fn build(&self, _config: Arc<IngestionConfig>, notifier: IngestionNotifier) -> Result<Components> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("injected failure building components");
        }
        *lock(&self.notifier) = Some(notifier);
        Ok(Components {
            consumption: self.consumption.clone(),
            storage: self.storage.clone(),
            stores: self.stores.clone(),
            storage_metadata: self.storage_metadata.clone(),
            report_sink: self.sink.clone(),
        })
    }
}
