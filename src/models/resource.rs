use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::IngestionError;

/// The separator between a store name and its version in a resource name.
const VERSION_SEPARATOR: &str = "_v";

/// One versioned partition-set of a store, named `{store}_v{version}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    store: Arc<str>,
    version: u32,
}

impl ResourceId {
    /// Create a new instance.
    pub fn new(store: &str, version: u32) -> Self {
        Self { store: Arc::from(store), version }
    }

    /// The name of the store which owns this resource.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// The store version of this resource.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The canonical topic-like name of this resource.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.store, VERSION_SEPARATOR, self.version)
    }
}

impl FromStr for ResourceId {
    type Err = IngestionError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let (store, version) = name
            .rsplit_once(VERSION_SEPARATOR)
            .ok_or_else(|| IngestionError::InvalidResource(name.into()))?;
        if store.is_empty() {
            return Err(IngestionError::InvalidResource(name.into()));
        }
        let version = version.parse().map_err(|_| IngestionError::InvalidResource(name.into()))?;
        Ok(Self::new(store, version))
    }
}

/// A single partition of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub resource: ResourceId,
    pub partition: u32,
}

impl PartitionKey {
    /// Create a new instance.
    pub fn new(resource: ResourceId, partition: u32) -> Self {
        Self { resource, partition }
    }

    /// Parse a partition key from a wire resource name and partition id.
    pub fn parse(name: &str, partition: i32) -> Result<Self, IngestionError> {
        let resource = name.parse()?;
        let partition = u32::try_from(partition).map_err(|_| IngestionError::InvalidResource(format!("{}/{}", name, partition)))?;
        Ok(Self { resource, partition })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.partition)
    }
}

/// The replication role of a partition replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Offline,
    Standby,
    Leader,
    Dropped,
    Error,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "OFFLINE",
            Self::Standby => "STANDBY",
            Self::Leader => "LEADER",
            Self::Dropped => "DROPPED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The state record of one partition replica owned by this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub key: PartitionKey,
    pub role: Role,
    /// Whether the resource was the store's current version as of the last transition.
    pub is_current_version: bool,
}

/// A store as seen by the metadata service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Store {
    pub name: String,
    /// The version currently serving read traffic, `0` when none.
    pub current_version: u32,
    /// All versions which the metadata service reports as existing.
    pub versions: Vec<u32>,
    /// How long a current-version partition may take to catch up when coming online.
    pub bootstrap_to_online_timeout_hours: Option<u64>,
}

impl Store {
    /// Check if the given resource is this store's current serving version.
    pub fn is_current_version(&self, resource: &ResourceId) -> bool {
        resource.store() == self.name && self.current_version != 0 && resource.version() == self.current_version
    }

    /// Check if the metadata service still knows the given version.
    pub fn has_version(&self, version: u32) -> bool {
        self.versions.contains(&version)
    }
}
