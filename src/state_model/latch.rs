//! Latches awaited by transitions which must block until consumption catches up.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::IngestionError;
use crate::models::{PartitionKey, ResourceId};

#[derive(Clone, Debug, PartialEq, Eq)]
enum LatchState {
    Pending,
    Completed,
    Failed(String),
    Killed,
}

/// The set of latches placed on partitions whose consumption is being awaited.
///
/// Latches are released by `completed` events and failed by `error` events & kills.
#[derive(Default)]
pub struct ConsumptionLatches {
    latches: DashMap<PartitionKey, watch::Sender<LatchState>>,
    /// A per-resource counter bumped every time the resource's consumption is killed.
    kill_epochs: DashMap<ResourceId, u64>,
}

impl ConsumptionLatches {
    /// Place a latch on the given partition, replacing any previous latch.
    pub fn place(&self, key: &PartitionKey) -> Latch {
        let (tx, rx) = watch::channel(LatchState::Pending);
        self.latches.insert(key.clone(), tx);
        Latch { key: key.clone(), rx }
    }

    /// Release the latch of the given partition, if any.
    pub fn release(&self, key: &PartitionKey) {
        self.resolve(key, LatchState::Completed);
    }

    /// Fail the latch of the given partition, if any.
    pub fn fail(&self, key: &PartitionKey, reason: String) {
        self.resolve(key, LatchState::Failed(reason));
    }

    /// Remove the latch of the given partition without resolving it.
    pub fn discard(&self, key: &PartitionKey) {
        self.latches.remove(key);
    }

    /// Record a kill of the given resource, failing all of its latches.
    pub fn kill(&self, resource: &ResourceId) {
        *self.kill_epochs.entry(resource.clone()).or_insert(0) += 1;
        let keys: Vec<_> = self.latches.iter().filter(|entry| &entry.key().resource == resource).map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.resolve(&key, LatchState::Killed);
        }
    }

    /// The number of kills recorded for the given resource.
    pub fn kill_epoch(&self, resource: &ResourceId) -> u64 {
        self.kill_epochs.get(resource).map(|epoch| *epoch).unwrap_or(0)
    }

    /// The number of latches currently awaiting resolution.
    pub fn pending(&self) -> usize {
        self.latches.len()
    }

    fn resolve(&self, key: &PartitionKey, state: LatchState) {
        if let Some((_, tx)) = self.latches.remove(key) {
            let _res = tx.send(state);
        }
    }
}

/// A latch placed on a single partition.
pub struct Latch {
    key: PartitionKey,
    rx: watch::Receiver<LatchState>,
}

impl Latch {
    /// Wait until the latch is released, failed, or the given number of hours elapse.
    pub async fn wait(mut self, timeout_hours: u64) -> Result<(), IngestionError> {
        let timeout = Duration::from_secs(timeout_hours.saturating_mul(60 * 60));
        let key = self.key.clone();
        let waiting = async {
            loop {
                let state = self.rx.borrow().clone();
                if let Some(res) = self.outcome(state) {
                    return res;
                }
                if self.rx.changed().await.is_err() {
                    let state = self.rx.borrow().clone();
                    return self.outcome(state).unwrap_or_else(|| {
                        Err(IngestionError::ConsumptionFailed {
                            key: self.key.to_string(),
                            reason: "latch was discarded".into(),
                        })
                    });
                }
            }
        };
        match tokio::time::timeout(timeout, waiting).await {
            Ok(res) => res,
            Err(_elapsed) => Err(IngestionError::Timeout {
                key: key.to_string(),
                hours: timeout_hours,
            }),
        }
    }

    fn outcome(&self, state: LatchState) -> Option<Result<(), IngestionError>> {
        match state {
            LatchState::Pending => None,
            LatchState::Completed => Some(Ok(())),
            LatchState::Failed(reason) => Some(Err(IngestionError::ConsumptionFailed { key: self.key.to_string(), reason })),
            LatchState::Killed => Some(Err(IngestionError::Killed { key: self.key.to_string() })),
        }
    }
}
