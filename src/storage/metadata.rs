use anyhow::{Context, Result};

use super::{Database, Tree};
use crate::backend::StorageMetadataService;
use crate::models::{PartitionKey, ResourceId};

/// The DB tree holding all storage metadata.
const TREE_INGESTION_METADATA: &str = "__ingestion_metadata";
/// The key prefix of partition offset records.
const PREFIX_OFFSET_RECORD: &str = "offset/";
/// The key prefix of store version states.
const PREFIX_STORE_VERSION_STATE: &str = "svs/";

/// Storage metadata persisted in a dedicated sled tree.
///
/// Offset records are keyed by partition and store version states by resource. Both are
/// opaque, already serialized payloads.
pub struct SledStorageMetadataService {
    tree: Tree,
}

impl SledStorageMetadataService {
    /// Create a new instance.
    pub async fn new(db: Database) -> Result<Self> {
        let tree = db.open_tree(TREE_INGESTION_METADATA).await?;
        Ok(Self { tree })
    }

    pub fn get_offset_record(&self, key: &PartitionKey) -> Result<Option<Vec<u8>>> {
        self.get(&offset_key(key))
    }

    pub fn get_store_version_state(&self, resource: &ResourceId) -> Result<Option<Vec<u8>>> {
        self.get(&store_version_state_key(resource))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let val = self.tree.get(key).with_context(|| format!("error reading storage metadata {}", key))?;
        Ok(val.map(|val| val.to_vec()))
    }

    async fn put(&self, key: String, val: &[u8]) -> Result<()> {
        self.tree.insert(key.as_bytes(), val).with_context(|| format!("error writing storage metadata {}", key))?;
        self.tree.flush_async().await.context("error flushing storage metadata")?;
        Ok(())
    }

    async fn clear(&self, key: String) -> Result<()> {
        self.tree.remove(key.as_bytes()).with_context(|| format!("error clearing storage metadata {}", key))?;
        self.tree.flush_async().await.context("error flushing storage metadata")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageMetadataService for SledStorageMetadataService {
    async fn put_offset_record(&self, key: &PartitionKey, record: &[u8]) -> Result<()> {
        self.put(offset_key(key), record).await
    }

    async fn clear_offset_record(&self, key: &PartitionKey) -> Result<()> {
        self.clear(offset_key(key)).await
    }

    async fn put_store_version_state(&self, resource: &ResourceId, state: &[u8]) -> Result<()> {
        self.put(store_version_state_key(resource), state).await
    }

    async fn clear_store_version_state(&self, resource: &ResourceId) -> Result<()> {
        self.clear(store_version_state_key(resource)).await
    }
}

fn offset_key(key: &PartitionKey) -> String {
    format!("{}{}/{}", PREFIX_OFFSET_RECORD, key.resource, key.partition)
}

fn store_version_state_key(resource: &ResourceId) -> String {
    format!("{}{}", PREFIX_STORE_VERSION_STATE, resource)
}
