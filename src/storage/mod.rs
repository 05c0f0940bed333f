//! Sled backed storage.
//!
//! Each resource is a storage engine made of one sled tree per data partition, named
//! `resources/{resource}/{partition}`, plus a metadata partition named
//! `resources/{resource}/metadata`. Trees found on disk at startup are only discovered, they
//! are opened again on demand.

mod metadata;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use sled::{Config as SledConfig, Db, IVec};

use crate::backend::StorageService;
use crate::config::IngestionConfig;
use crate::error::{ShutdownError, ShutdownResult};
use crate::models::{PartitionKey, ResourceId};

pub use metadata::SledStorageMetadataService;

pub type Tree = sled::Tree;

/// The directory under the storage data path holding the database.
const DB_DIR: &str = "ingestion";
/// The DB tree prefix used for resource partitions.
const TREE_RESOURCE_PREFIX: &str = "resources/";
/// The name of the metadata partition of each resource.
const METADATA_PARTITION: &str = "metadata";

/// Open the database under the given config along with the storage services built on it.
pub async fn open(config: &IngestionConfig) -> Result<(Arc<SledStorageService>, Arc<SledStorageMetadataService>)> {
    let db = Database::open(config).await?;
    let storage = SledStorageService::new(db.clone());
    let metadata = SledStorageMetadataService::new(db).await?;
    Ok((Arc::new(storage), Arc::new(metadata)))
}

/// An abstraction over the ingestion database.
#[derive(Clone)]
pub struct Database {
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn open(config: &IngestionConfig) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path).join(DB_DIR);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for ingestion database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            Ok(Self { db })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the given DB tree, creating it if needed.
    pub async fn open_tree(&self, name: &str) -> ShutdownResult<Tree> {
        let (db, ivname, name) = (self.db.clone(), IVec::from(name), name.to_string());
        Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))
    }

    /// Drop the given DB tree along with its data, returning `true` if it existed.
    pub async fn drop_tree(&self, name: &str) -> ShutdownResult<bool> {
        let (db, ivname, name) = (self.db.clone(), IVec::from(name), name.to_string());
        Self::spawn_blocking(move || -> Result<bool> { Ok(db.drop_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not drop DB tree {} {}", &name, err))))
    }

    /// The names of all trees in the database.
    pub fn tree_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .map(|name| String::from_utf8_lossy(&name).into_owned())
            .collect()
    }

    /// Flush all dirty data to disk.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.context("error flushing database")?;
        Ok(())
    }
}

/// The open partitions of one resource.
#[derive(Default)]
struct StorageEngine {
    metadata: Option<Tree>,
    partitions: BTreeMap<u32, Tree>,
}

/// A storage service keeping one sled backed storage engine per resource.
pub struct SledStorageService {
    db: Database,
    engines: DashMap<ResourceId, StorageEngine>,
    stopped: AtomicBool,
}

impl SledStorageService {
    /// Create a new instance, discovering all resources already on disk.
    pub fn new(db: Database) -> Self {
        let engines = DashMap::new();
        for name in db.tree_names() {
            if let Some((resource, _)) = parse_tree_name(&name) {
                engines.entry(resource).or_insert_with(StorageEngine::default);
            }
        }
        tracing::info!(resources = engines.len(), "discovered on-disk storage engines");
        Self {
            db,
            engines,
            stopped: AtomicBool::new(false),
        }
    }

    /// Get a handle to the tree of an open data partition.
    pub fn partition_tree(&self, key: &PartitionKey) -> Option<Tree> {
        self.engines
            .get(&key.resource)
            .and_then(|engine| engine.partitions.get(&key.partition).cloned())
    }

    /// Get a handle to the metadata tree of an open resource.
    pub fn metadata_tree(&self, resource: &ResourceId) -> Option<Tree> {
        self.engines.get(resource).and_then(|engine| engine.metadata.clone())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("storage service has been stopped");
        }
        Ok(())
    }

    /// The names of all on-disk trees belonging to the given resource.
    fn resource_tree_names(&self, resource: &ResourceId) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|name| matches!(parse_tree_name(name), Some((found, _)) if &found == resource))
            .collect()
    }
}

#[async_trait::async_trait]
impl StorageService for SledStorageService {
    async fn open_partition(&self, key: &PartitionKey) -> Result<()> {
        self.ensure_running()?;
        if self.partition_tree(key).is_some() {
            return Ok(());
        }
        let tree = self.db.open_tree(&partition_tree_name(key)).await?;
        self.engines
            .entry(key.resource.clone())
            .or_insert_with(StorageEngine::default)
            .partitions
            .insert(key.partition, tree);
        tracing::debug!(%key, "opened storage partition");
        Ok(())
    }

    async fn open_metadata_partition(&self, resource: &ResourceId) -> Result<()> {
        self.ensure_running()?;
        if self.metadata_tree(resource).is_some() {
            return Ok(());
        }
        let tree = self.db.open_tree(&metadata_tree_name(resource)).await?;
        let mut engine = self.engines.entry(resource.clone()).or_insert_with(StorageEngine::default);
        engine.metadata = Some(tree);
        drop(engine);
        tracing::debug!(%resource, "opened storage metadata partition");
        Ok(())
    }

    async fn drop_partition(&self, key: &PartitionKey) -> Result<()> {
        self.ensure_running()?;
        if let Some(mut engine) = self.engines.get_mut(&key.resource) {
            engine.partitions.remove(&key.partition);
        }
        let existed = self.db.drop_tree(&partition_tree_name(key)).await?;
        tracing::info!(%key, existed, "dropped storage partition");
        Ok(())
    }

    async fn remove_storage_engine(&self, resource: &ResourceId) -> Result<()> {
        self.ensure_running()?;
        self.engines.remove(resource);
        for name in self.resource_tree_names(resource) {
            self.db.drop_tree(&name).await?;
        }
        tracing::info!(%resource, "removed storage engine");
        Ok(())
    }

    fn local_resources(&self) -> Vec<ResourceId> {
        let mut resources: Vec<_> = self.engines.iter().map(|engine| engine.key().clone()).collect();
        resources.sort();
        resources
    }

    fn open_partition_count(&self) -> usize {
        self.engines.iter().map(|engine| engine.partitions.len()).sum()
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engines.clear();
        self.db.flush().await.context("error flushing storage on stop")?;
        tracing::info!("storage service has stopped");
        Ok(())
    }
}

fn partition_tree_name(key: &PartitionKey) -> String {
    format!("{}{}/{}", TREE_RESOURCE_PREFIX, key.resource, key.partition)
}

fn metadata_tree_name(resource: &ResourceId) -> String {
    format!("{}{}/{}", TREE_RESOURCE_PREFIX, resource, METADATA_PARTITION)
}

/// Parse a resource tree name into its resource and partition, `None` being the metadata
/// partition. Trees which are not resource trees yield `None`.
fn parse_tree_name(name: &str) -> Option<(ResourceId, Option<u32>)> {
    let (resource, partition) = name.strip_prefix(TREE_RESOURCE_PREFIX)?.rsplit_once('/')?;
    let resource = resource.parse().ok()?;
    if partition == METADATA_PARTITION {
        return Some((resource, None));
    }
    Some((resource, Some(partition.parse().ok()?)))
}
