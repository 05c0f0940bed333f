//! The per-partition replication state model.
//!
//! Every partition owned by this process moves through a closed set of roles. The legal
//! moves are listed in `TRANSITIONS`, and each one is executed under a per-partition lock so
//! that at most one transition is in flight per partition.

mod fence;
mod latch;
#[cfg(test)]
mod mod_test;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::backend::{ConsumptionService, StorageService, StoreRepository};
use crate::config::IngestionConfig;
use crate::error::IngestionError;
use crate::models::{PartitionKey, Replica, ResourceId, Role};

pub use fence::{PromotionFence, SectionToken, UnsubscribeGuard};
pub use latch::{ConsumptionLatches, Latch};
pub use stats::{BlockedOnDropGuard, TransitionStats, METRIC_THREADS_BLOCKED_ON_DROP, METRIC_TRANSITIONS, METRIC_TRANSITION_FAILURES};

/// A legal role transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    OfflineToStandby,
    StandbyToLeader,
    LeaderToStandby,
    StandbyToOffline,
    OfflineToDropped,
    StandbyToDropped,
    ErrorToOffline,
}

/// All legal transitions, keyed by `(from, to)`.
const TRANSITIONS: &[(Role, Role, Transition)] = &[
    (Role::Offline, Role::Standby, Transition::OfflineToStandby),
    (Role::Standby, Role::Leader, Transition::StandbyToLeader),
    (Role::Leader, Role::Standby, Transition::LeaderToStandby),
    (Role::Standby, Role::Offline, Transition::StandbyToOffline),
    (Role::Offline, Role::Dropped, Transition::OfflineToDropped),
    (Role::Standby, Role::Dropped, Transition::StandbyToDropped),
    (Role::Error, Role::Offline, Transition::ErrorToOffline),
];

impl Transition {
    /// Look up the transition between the given roles, if it is legal.
    pub fn lookup(from: Role, to: Role) -> Option<Self> {
        TRANSITIONS.iter().find(|(f, t, _)| *f == from && *t == to).map(|(_, _, transition)| *transition)
    }
}

/// The replica records of all partitions owned by this process.
///
/// A partition without a record is OFFLINE.
#[derive(Default)]
pub struct ReplicaTable {
    replicas: DashMap<PartitionKey, Replica>,
}

impl ReplicaTable {
    /// Create a new instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The current role of the given partition.
    pub fn role(&self, key: &PartitionKey) -> Role {
        self.replicas.get(key).map(|replica| replica.role).unwrap_or(Role::Offline)
    }

    pub fn get(&self, key: &PartitionKey) -> Option<Replica> {
        self.replicas.get(key).map(|replica| replica.value().clone())
    }

    /// A point in time copy of all replica records.
    pub fn snapshot(&self) -> Vec<Replica> {
        let mut replicas: Vec<_> = self.replicas.iter().map(|replica| replica.value().clone()).collect();
        replicas.sort_by(|a, b| a.key.cmp(&b.key));
        replicas
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Move the given partition into the ERROR role, returning `false` if it has no record.
    pub fn mark_error(&self, key: &PartitionKey) -> bool {
        match self.replicas.get_mut(key) {
            Some(mut replica) => {
                replica.role = Role::Error;
                true
            }
            None => false,
        }
    }

    fn record(&self, key: &PartitionKey, role: Role, is_current_version: bool) {
        if role == Role::Dropped {
            self.replicas.remove(key);
            return;
        }
        self.replicas.insert(
            key.clone(),
            Replica {
                key: key.clone(),
                role,
                is_current_version,
            },
        );
    }

    /// Move all active replicas of the given resource back to OFFLINE.
    fn reset_resource(&self, resource: &ResourceId) {
        for mut replica in self.replicas.iter_mut() {
            if &replica.key.resource == resource && matches!(replica.role, Role::Standby | Role::Leader) {
                replica.role = Role::Offline;
            }
        }
    }
}

/// The partition state model, driving the consumption & storage engines through role
/// transitions.
pub struct PartitionStateModel {
    config: Arc<IngestionConfig>,
    consumption: Arc<dyn ConsumptionService>,
    storage: Arc<dyn StorageService>,
    stores: Arc<dyn StoreRepository>,
    replicas: Arc<ReplicaTable>,
    latches: Arc<ConsumptionLatches>,
    fence: Arc<PromotionFence>,
    stats: Arc<TransitionStats>,
    /// Per-partition locks serializing transitions.
    locks: DashMap<PartitionKey, Arc<Mutex<()>>>,
}

impl PartitionStateModel {
    /// Create a new instance.
    pub fn new(
        config: Arc<IngestionConfig>, consumption: Arc<dyn ConsumptionService>, storage: Arc<dyn StorageService>, stores: Arc<dyn StoreRepository>,
        replicas: Arc<ReplicaTable>, latches: Arc<ConsumptionLatches>,
    ) -> Self {
        Self {
            config,
            consumption,
            storage,
            stores,
            replicas,
            latches,
            fence: PromotionFence::new(),
            stats: TransitionStats::new(),
            locks: DashMap::new(),
        }
    }

    pub fn replicas(&self) -> &Arc<ReplicaTable> {
        &self.replicas
    }

    pub fn fence(&self) -> &Arc<PromotionFence> {
        &self.fence
    }

    pub fn stats(&self) -> &Arc<TransitionStats> {
        &self.stats
    }

    pub fn latches(&self) -> &Arc<ConsumptionLatches> {
        &self.latches
    }

    pub async fn become_standby_from_offline(&self, key: &PartitionKey) -> Result<()> {
        self.transition(key, Role::Standby, None).await
    }

    pub async fn become_leader_from_standby(&self, key: &PartitionKey, section: SectionToken) -> Result<()> {
        self.transition(key, Role::Leader, Some(section)).await
    }

    pub async fn become_standby_from_leader(&self, key: &PartitionKey, section: SectionToken) -> Result<()> {
        self.transition(key, Role::Standby, Some(section)).await
    }

    pub async fn become_offline_from_standby(&self, key: &PartitionKey) -> Result<()> {
        self.transition(key, Role::Offline, None).await
    }

    pub async fn become_dropped_from_offline(&self, key: &PartitionKey) -> Result<()> {
        self.transition(key, Role::Dropped, None).await
    }

    pub async fn become_dropped_from_standby(&self, key: &PartitionKey) -> Result<()> {
        self.transition(key, Role::Dropped, None).await
    }

    /// Reset a partition out of the ERROR role.
    pub async fn become_offline_from_error(&self, key: &PartitionKey) -> Result<()> {
        self.transition(key, Role::Offline, None).await
    }

    /// Transition the given partition from its current role to the given role.
    ///
    /// Promote & demote transitions open a new section when none is given. On failure the
    /// partition keeps its current role.
    pub async fn transition(&self, key: &PartitionKey, to: Role, section: Option<SectionToken>) -> Result<()> {
        let lock = self.partition_lock(key);
        let res = {
            let _guard = lock.lock().await;
            self.transition_locked(key, to, section).await
        };
        drop(lock);
        if to == Role::Dropped {
            self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
        res
    }

    async fn transition_locked(&self, key: &PartitionKey, to: Role, section: Option<SectionToken>) -> Result<()> {
        let from = self.replicas.role(key);
        let transition = match Transition::lookup(from, to) {
            Some(transition) => transition,
            None if from == Role::Error => bail!(IngestionError::ReplicaInError { key: key.to_string() }),
            None => bail!(IngestionError::InvalidTransition {
                key: key.to_string(),
                from,
                to
            }),
        };
        if transition == Transition::OfflineToStandby {
            self.stores
                .subscribe(key.resource.store())
                .await
                .with_context(|| format!("error subscribing to store {}", key.resource.store()))?;
        }
        let is_current = self.is_current_version(&key.resource);
        tracing::info!(%key, %from, %to, is_current, "executing partition transition");

        let res = match transition {
            Transition::OfflineToStandby => self.start(key, is_current, true).await,
            Transition::StandbyToLeader => self.change_leadership(key, section, true).await,
            Transition::LeaderToStandby => self.change_leadership(key, section, false).await,
            Transition::StandbyToOffline => {
                let _unsubscribing = self.fence.begin_unsubscribe(key.clone());
                self.consumption.stop_consumption(key).await
            }
            Transition::OfflineToDropped | Transition::StandbyToDropped => self.drop_partition(key, is_current).await,
            Transition::ErrorToOffline => {
                self.latches.discard(key);
                self.consumption.stop_consumption(key).await
            }
        };
        self.stats.record_transition(res.is_ok());
        match res {
            Ok(()) => {
                self.replicas.record(key, to, is_current);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = ?err, %key, %from, %to, "error executing partition transition");
                Err(err.context(format!("error transitioning {} from {} to {}", key, from, to)))
            }
        }
    }

    /// Start consuming the given partition without waiting for it to catch up, as done for
    /// START_CONSUMPTION commands. Idempotent for partitions which are already active.
    pub async fn subscribe(&self, key: &PartitionKey) -> Result<()> {
        let lock = self.partition_lock(key);
        let _guard = lock.lock().await;
        let from = self.replicas.role(key);
        if from == Role::Error {
            bail!(IngestionError::ReplicaInError { key: key.to_string() });
        }
        self.stores
            .subscribe(key.resource.store())
            .await
            .with_context(|| format!("error subscribing to store {}", key.resource.store()))?;
        let is_current = self.is_current_version(&key.resource);
        self.start(key, is_current, false).await?;
        if from == Role::Offline {
            self.replicas.record(key, Role::Standby, is_current);
        }
        Ok(())
    }

    /// Cooperatively stop consuming the given partition, keeping its storage.
    ///
    /// This also resets a partition out of the ERROR role.
    pub async fn unsubscribe(&self, key: &PartitionKey) -> Result<()> {
        let lock = self.partition_lock(key);
        let _guard = lock.lock().await;
        let _unsubscribing = self.fence.begin_unsubscribe(key.clone());
        let replica = self.replicas.get(key);
        if matches!(&replica, Some(replica) if replica.role == Role::Error) {
            self.latches.discard(key);
        }
        self.consumption.stop_consumption(key).await?;
        if let Some(replica) = replica {
            if matches!(replica.role, Role::Standby | Role::Leader | Role::Error) {
                self.replicas.record(key, Role::Offline, replica.is_current_version);
            }
        }
        Ok(())
    }

    /// Drop the given partition, first stopping its consumption and waiting for the stop
    /// to be observed if it is consuming.
    pub async fn remove_partition(&self, key: &PartitionKey) -> Result<()> {
        let lock = self.partition_lock(key);
        let _guard = lock.lock().await;
        let _unsubscribing = self.fence.begin_unsubscribe(key.clone());
        if self.consumption.is_partition_consuming(key) {
            stop_and_wait(self.consumption.as_ref(), &self.latches, key, self.config.stop_consumption_wait_interval(), self.config.stop_consumption_wait_retries).await?;
        }
        self.storage.drop_partition(key).await?;
        self.replicas.record(key, Role::Dropped, false);
        Ok(())
    }

    /// Forcibly terminate the consumption task of the given resource.
    ///
    /// All latches of the resource are failed, so blocked transitions end with `Killed`.
    pub async fn kill(&self, resource: &ResourceId) -> Result<bool> {
        self.latches.kill(resource);
        self.fence.invalidate_resource(resource);
        let killed = self.consumption.kill_consumption_task(resource).await?;
        self.replicas.reset_resource(resource);
        tracing::info!(%resource, killed, "killed consumption task");
        Ok(killed)
    }

    /// Check if the given resource is its store's current serving version.
    pub fn is_current_version(&self, resource: &ResourceId) -> bool {
        self.stores
            .get_store(resource.store())
            .map(|store| store.is_current_version(resource))
            .unwrap_or(false)
    }

    async fn start(&self, key: &PartitionKey, is_current: bool, await_catch_up: bool) -> Result<()> {
        self.storage.open_partition(key).await?;
        if !(is_current && await_catch_up) {
            return self.consumption.start_consumption(key).await;
        }

        let latch = self.latches.place(key);
        if let Err(err) = self.consumption.start_consumption(key).await {
            self.latches.discard(key);
            return Err(err);
        }
        let timeout_hours = self.bootstrap_timeout_hours(&key.resource);
        tracing::info!(%key, timeout_hours, "waiting for current version partition to catch up");
        if let Err(err) = latch.wait(timeout_hours).await {
            self.latches.discard(key);
            return Err(err.into());
        }
        Ok(())
    }

    async fn change_leadership(&self, key: &PartitionKey, section: Option<SectionToken>, promote: bool) -> Result<()> {
        if self.fence.is_unsubscribing(key) {
            bail!(IngestionError::Fenced { key: key.to_string() });
        }
        let section = match section {
            Some(section) => section,
            None => self.fence.next_section(key),
        };
        section.check()?;
        if promote {
            self.consumption.promote_to_leader(key, section).await
        } else {
            self.consumption.demote_to_standby(key, section).await
        }
    }

    async fn drop_partition(&self, key: &PartitionKey, is_current: bool) -> Result<()> {
        let interval = self.config.stop_consumption_wait_interval();
        let retries = self.config.stop_consumption_wait_retries;
        if is_current {
            let _blocked = self.stats.block_on_drop();
            let _unsubscribing = self.fence.begin_unsubscribe(key.clone());
            stop_and_wait(self.consumption.as_ref(), &self.latches, key, interval, retries).await?;
            return self.storage.drop_partition(key).await;
        }

        let (consumption, storage, latches) = (self.consumption.clone(), self.storage.clone(), self.latches.clone());
        let (replicas, lock) = (self.replicas.clone(), self.partition_lock(key));
        let unsubscribing = self.fence.begin_unsubscribe(key.clone());
        let key = key.clone();
        tokio::spawn(async move {
            let _unsubscribing = unsubscribing;
            let _guard = lock.lock().await;
            // A record means the partition has been re-assigned since it was dropped.
            if replicas.get(&key).is_some() {
                tracing::debug!(%key, "partition re-assigned before its removal ran, keeping it");
                return;
            }
            let res = match stop_and_wait(consumption.as_ref(), &latches, &key, interval, retries).await {
                Ok(()) => storage.drop_partition(&key).await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                tracing::error!(error = ?err, %key, "error removing partition of non-current version");
            }
        });
        Ok(())
    }

    fn bootstrap_timeout_hours(&self, resource: &ResourceId) -> u64 {
        self.stores
            .get_store(resource.store())
            .and_then(|store| store.bootstrap_to_online_timeout_hours)
            .unwrap_or(self.config.bootstrap_to_online_timeout_hours)
    }

    fn partition_lock(&self, key: &PartitionKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().value().clone()
    }
}

/// Stop consuming the given partition and poll until the stop has been observed.
///
/// Fails with `StopTimeout` once `retries` checks have been exhausted, or with `Killed` if
/// the partition's resource is killed while waiting.
pub(crate) async fn stop_and_wait(
    consumption: &dyn ConsumptionService, latches: &ConsumptionLatches, key: &PartitionKey, interval: Duration, retries: u32,
) -> Result<()> {
    let epoch = latches.kill_epoch(&key.resource);
    consumption.stop_consumption(key).await?;
    for _ in 0..retries {
        if latches.kill_epoch(&key.resource) != epoch {
            bail!(IngestionError::Killed { key: key.to_string() });
        }
        if !consumption.is_partition_consuming(key) {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
    if latches.kill_epoch(&key.resource) != epoch {
        bail!(IngestionError::Killed { key: key.to_string() });
    }
    if consumption.is_partition_consuming(key) {
        bail!(IngestionError::StopTimeout { key: key.to_string(), retries });
    }
    Ok(())
}
