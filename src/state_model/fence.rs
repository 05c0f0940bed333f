//! Fencing of promote/demote commands.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::IngestionError;
use crate::models::{PartitionKey, ResourceId};

/// A race guard for leader promotion & demotion.
///
/// Partitions which are mid-unsubscribe reject promote/demote outright, and each
/// promote/demote is issued under a section id which is invalidated by any newer one.
#[derive(Default)]
pub struct PromotionFence {
    /// Partitions currently being unsubscribed, with the number of in-flight unsubscribes.
    unsubscribing: DashMap<PartitionKey, usize>,
    /// The current section id of each partition.
    sections: DashMap<PartitionKey, u64>,
}

impl PromotionFence {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Check if the given partition is currently being unsubscribed.
    pub fn is_unsubscribing(&self, key: &PartitionKey) -> bool {
        self.unsubscribing.contains_key(key)
    }

    /// Mark the given partition as being unsubscribed until the returned guard is dropped.
    ///
    /// This also closes the partition's current section, so tokens issued before the
    /// unsubscribe are stale once the partition is subscribed again.
    pub fn begin_unsubscribe(self: &Arc<Self>, key: PartitionKey) -> UnsubscribeGuard {
        *self.unsubscribing.entry(key.clone()).or_insert(0) += 1;
        *self.sections.entry(key.clone()).or_insert(0) += 1;
        UnsubscribeGuard { fence: self.clone(), key }
    }

    fn end_unsubscribe(&self, key: &PartitionKey) {
        if let Some(mut count) = self.unsubscribing.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        self.unsubscribing.remove_if(key, |_, count| *count == 0);
    }

    /// Open a new section for the given partition, superseding all previous tokens.
    pub fn next_section(self: &Arc<Self>, key: &PartitionKey) -> SectionToken {
        let id = {
            let mut section = self.sections.entry(key.clone()).or_insert(0);
            *section += 1;
            *section
        };
        SectionToken {
            fence: self.clone(),
            key: key.clone(),
            id,
        }
    }

    /// Close the current section of every partition of the given resource.
    pub fn invalidate_resource(&self, resource: &ResourceId) {
        self.sections
            .iter_mut()
            .filter(|section| &section.key().resource == resource)
            .for_each(|mut section| *section += 1);
    }

    /// The current section id of the given partition, `0` if none has been opened.
    pub fn current_section(&self, key: &PartitionKey) -> u64 {
        self.sections.get(key).map(|section| *section).unwrap_or(0)
    }
}

/// A guard which keeps a partition marked as being unsubscribed.
pub struct UnsubscribeGuard {
    fence: Arc<PromotionFence>,
    key: PartitionKey,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.fence.end_unsubscribe(&self.key);
    }
}

/// A token identifying the section under which a promote/demote was issued.
#[derive(Clone)]
pub struct SectionToken {
    fence: Arc<PromotionFence>,
    key: PartitionKey,
    id: u64,
}

impl SectionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// Check if this token still matches its partition's current section.
    pub fn is_current(&self) -> bool {
        self.fence.current_section(&self.key) == self.id
    }

    /// Fail with `StaleSection` if this token has been superseded.
    pub fn check(&self) -> Result<(), IngestionError> {
        let current = self.fence.current_section(&self.key);
        if current == self.id {
            Ok(())
        } else {
            Err(IngestionError::StaleSection {
                key: self.key.to_string(),
                section: self.id,
                current,
            })
        }
    }
}

impl fmt::Debug for SectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionToken").field("key", &self.key).field("id", &self.id).finish()
    }
}
