use std::sync::Arc;

use anyhow::Result;

use super::{ConsumptionLatches, PartitionStateModel, ReplicaTable};
use crate::backend::ConsumptionService;
use crate::config::IngestionConfig;
use crate::error::IngestionError;
use crate::fixtures::{self, ConsumptionCall, FakeConsumption, FakeStorage, FakeStores};
use crate::models::{PartitionKey, Role};

struct Harness {
    model: Arc<PartitionStateModel>,
    consumption: Arc<FakeConsumption>,
    storage: Arc<FakeStorage>,
    stores: Arc<FakeStores>,
    _tmpdir: tempfile::TempDir,
}

/// Build a model over a store `store` whose current version is `2`, with `1` a backup.
fn harness() -> Result<Harness> {
    let (config, tmpdir) = IngestionConfig::new_test()?;
    let (consumption, storage, stores) = (FakeConsumption::new(), FakeStorage::new(), FakeStores::new());
    stores.put(fixtures::store("store", 2, &[1, 2]));
    let model = PartitionStateModel::new(
        config,
        consumption.clone(),
        storage.clone(),
        stores.clone(),
        ReplicaTable::new(),
        Arc::new(ConsumptionLatches::default()),
    );
    Ok(Harness {
        model: Arc::new(model),
        consumption,
        storage,
        stores,
        _tmpdir: tmpdir,
    })
}

fn current() -> PartitionKey {
    fixtures::key("store", 2, 0)
}

fn backup() -> PartitionKey {
    fixtures::key("store", 1, 0)
}

/// Yield to spawned tasks until the given condition holds.
async fn yield_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    cond()
}

#[tokio::test]
async fn standby_from_offline_non_current_does_not_wait() -> Result<()> {
    let h = harness()?;
    let key = backup();

    h.model.become_standby_from_offline(&key).await?;

    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));
    assert!(h.consumption.started(&key), "expected consumption to be started for {}", key);
    assert!(h.storage.has_partition(&key), "expected storage partition {} to be open", key);
    assert!(h.stores.is_subscribed("store"), "expected store to be subscribed");
    assert!(h.model.latches().pending() == 0, "expected no pending latches got {}", h.model.latches().pending());

    Ok(())
}

#[tokio::test]
async fn standby_from_offline_current_waits_for_completion() -> Result<()> {
    let h = harness()?;
    let key = current();

    let (model, task_key) = (h.model.clone(), key.clone());
    let handle = tokio::spawn(async move { model.become_standby_from_offline(&task_key).await });
    let placed = yield_until(|| h.model.latches().pending() == 1).await;
    assert!(placed, "expected a latch to be placed for {}", key);
    assert!(h.consumption.started(&key), "expected consumption to be started before waiting");
    assert!(h.model.replicas().get(&key).is_none(), "expected replica to stay OFFLINE while waiting");

    h.model.latches().release(&key);
    handle.await??;

    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));
    let replica = h.model.replicas().get(&key);
    assert!(
        replica.as_ref().map(|replica| replica.is_current_version).unwrap_or(false),
        "expected replica to be recorded as current version, got {:?}",
        replica
    );

    Ok(())
}

#[tokio::test]
async fn standby_from_offline_current_times_out_with_store_hours() -> Result<()> {
    tokio::time::pause();
    let h = harness()?;
    let mut store = fixtures::store("store", 2, &[1, 2]);
    store.bootstrap_to_online_timeout_hours = Some(2);
    h.stores.put(store);
    let key = current();

    let err = match h.model.become_standby_from_offline(&key).await {
        Ok(()) => anyhow::bail!("expected transition to time out"),
        Err(err) => err,
    };

    assert!(
        matches!(fixtures::ingestion_error(&err), Some(IngestionError::Timeout { hours: 2, .. })),
        "expected a 2h timeout error got {:?}",
        err
    );
    assert!(h.model.replicas().get(&key).is_none(), "expected replica to keep its OFFLINE role");
    assert!(h.model.latches().pending() == 0, "expected timed out latch to be discarded");
    assert!(h.model.stats().failures() == 1, "expected 1 failed transition got {}", h.model.stats().failures());

    Ok(())
}

#[tokio::test]
async fn standby_from_offline_current_fails_on_consumption_error() -> Result<()> {
    let h = harness()?;
    let key = current();

    let (model, task_key) = (h.model.clone(), key.clone());
    let handle = tokio::spawn(async move { model.become_standby_from_offline(&task_key).await });
    yield_until(|| h.model.latches().pending() == 1).await;
    h.model.latches().fail(&key, "Exception_boom".into());
    let res = handle.await?;

    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::ConsumptionFailed { .. })),
        "expected consumption failure got {:?}",
        res
    );

    Ok(())
}

#[tokio::test]
async fn dropped_from_standby_current_tracks_blocked_gauge() -> Result<()> {
    let h = harness()?;
    let key = current();
    h.model.subscribe(&key).await?;

    h.model.become_dropped_from_standby(&key).await?;

    let stats = h.model.stats();
    assert!(stats.blocked_on_drop() == 0, "expected gauge to be back at 0 got {}", stats.blocked_on_drop());
    assert!(stats.blocked_on_drop_entries() == 1, "expected 1 blocked drop got {}", stats.blocked_on_drop_entries());
    assert!(h.storage.dropped() == vec![key.clone()], "expected {} to be dropped got {:?}", key, h.storage.dropped());
    assert!(h.model.replicas().get(&key).is_none(), "expected replica record to be removed");
    assert!(!h.model.fence().is_unsubscribing(&key), "expected unsubscribe mark to be cleared");

    Ok(())
}

#[tokio::test]
async fn dropped_from_standby_current_decrements_gauge_on_failure() -> Result<()> {
    tokio::time::pause();
    let h = harness()?;
    let key = current();
    h.model.subscribe(&key).await?;
    h.consumption.set_stuck(true);

    let res = h.model.become_dropped_from_standby(&key).await;

    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::StopTimeout { retries: 3, .. })),
        "expected stop timeout got {:?}",
        res
    );
    let stats = h.model.stats();
    assert!(stats.blocked_on_drop() == 0, "expected gauge to be back at 0 got {}", stats.blocked_on_drop());
    assert!(stats.blocked_on_drop_entries() == 1, "expected 1 blocked drop got {}", stats.blocked_on_drop_entries());
    assert!(h.storage.dropped().is_empty(), "expected no partition to be dropped got {:?}", h.storage.dropped());
    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY to be kept got {}", h.model.replicas().role(&key));

    Ok(())
}

#[tokio::test]
async fn dropped_from_standby_non_current_never_touches_gauge() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;

    h.model.become_dropped_from_standby(&key).await?;

    let stats = h.model.stats();
    assert!(stats.blocked_on_drop_entries() == 0, "expected no blocked drops got {}", stats.blocked_on_drop_entries());
    assert!(h.model.replicas().get(&key).is_none(), "expected replica record to be removed");
    let dropped = yield_until(|| h.storage.dropped().contains(&key)).await;
    assert!(dropped, "expected {} to be dropped in the background", key);

    Ok(())
}

#[tokio::test]
async fn dropped_from_offline_non_current_never_touches_gauge() -> Result<()> {
    let h = harness()?;
    let key = backup();

    h.model.become_dropped_from_offline(&key).await?;

    let stats = h.model.stats();
    assert!(stats.blocked_on_drop_entries() == 0, "expected no blocked drops got {}", stats.blocked_on_drop_entries());
    assert!(h.model.replicas().get(&key).is_none(), "expected no replica record");
    let dropped = yield_until(|| h.storage.dropped().contains(&key)).await;
    assert!(dropped, "expected {} to be dropped in the background", key);

    Ok(())
}

#[tokio::test]
async fn dropped_from_offline_current_tracks_blocked_gauge() -> Result<()> {
    let h = harness()?;
    let key = current();
    h.consumption.set_consuming(&key);

    h.model.become_dropped_from_offline(&key).await?;

    let stats = h.model.stats();
    assert!(stats.blocked_on_drop() == 0, "expected gauge to be back at 0 got {}", stats.blocked_on_drop());
    assert!(stats.blocked_on_drop_entries() == 1, "expected 1 blocked drop got {}", stats.blocked_on_drop_entries());
    assert!(h.storage.dropped() == vec![key.clone()], "expected {} to be dropped got {:?}", key, h.storage.dropped());
    assert!(!h.consumption.is_partition_consuming(&key), "expected consumption of {} to be stopped", key);

    Ok(())
}

#[tokio::test]
async fn dropped_from_offline_current_decrements_gauge_on_failure() -> Result<()> {
    tokio::time::pause();
    let h = harness()?;
    let key = current();
    h.consumption.set_consuming(&key);
    h.consumption.set_stuck(true);

    let res = h.model.become_dropped_from_offline(&key).await;

    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::StopTimeout { retries: 3, .. })),
        "expected stop timeout got {:?}",
        res
    );
    let stats = h.model.stats();
    assert!(stats.blocked_on_drop() == 0, "expected gauge to be back at 0 got {}", stats.blocked_on_drop());
    assert!(stats.blocked_on_drop_entries() == 1, "expected 1 blocked drop got {}", stats.blocked_on_drop_entries());
    assert!(h.storage.dropped().is_empty(), "expected no partition to be dropped got {:?}", h.storage.dropped());

    Ok(())
}

#[tokio::test]
async fn reassignment_after_non_current_drop_keeps_partition() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.become_standby_from_offline(&key).await?;

    h.model.become_dropped_from_standby(&key).await?;
    h.model.become_standby_from_offline(&key).await?;
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }

    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));
    assert!(h.consumption.is_partition_consuming(&key), "expected {} to keep consuming", key);
    assert!(h.storage.has_partition(&key), "expected storage partition {} to be kept", key);
    assert!(h.storage.dropped().is_empty(), "expected no partition to be dropped got {:?}", h.storage.dropped());
    assert!(!h.model.fence().is_unsubscribing(&key), "expected unsubscribe mark to be cleared");

    Ok(())
}

#[tokio::test]
async fn kill_unblocks_drop_wait() -> Result<()> {
    tokio::time::pause();
    let h = harness()?;
    let key = current();
    h.model.subscribe(&key).await?;
    h.consumption.set_stuck(true);

    let (model, task_key) = (h.model.clone(), key.clone());
    let handle = tokio::spawn(async move { model.become_dropped_from_standby(&task_key).await });
    let blocked = yield_until(|| h.model.stats().blocked_on_drop() == 1).await;
    assert!(blocked, "expected drop to block on consumption stopping");

    let killed = h.model.kill(&key.resource).await?;
    let res = handle.await?;

    assert!(killed, "expected a running consumption task to be killed");
    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::Killed { .. })),
        "expected drop to end with Killed got {:?}",
        res
    );
    assert!(h.model.stats().blocked_on_drop() == 0, "expected gauge to be back at 0 got {}", h.model.stats().blocked_on_drop());

    Ok(())
}

#[tokio::test]
async fn kill_fails_pending_catch_up_wait() -> Result<()> {
    let h = harness()?;
    let key = current();

    let (model, task_key) = (h.model.clone(), key.clone());
    let handle = tokio::spawn(async move { model.become_standby_from_offline(&task_key).await });
    yield_until(|| h.model.latches().pending() == 1).await;
    h.model.kill(&key.resource).await?;
    let res = handle.await?;

    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::Killed { .. })),
        "expected wait to end with Killed got {:?}",
        res
    );
    assert!(h.model.replicas().get(&key).is_none(), "expected replica to keep its OFFLINE role");

    Ok(())
}

#[tokio::test]
async fn promote_rejected_while_unsubscribing() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;

    let _unsubscribing = h.model.fence().begin_unsubscribe(key.clone());
    let section = h.model.fence().next_section(&key);
    let res = h.model.become_leader_from_standby(&key, section).await;

    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::Fenced { .. })),
        "expected promotion to be fenced got {:?}",
        res
    );
    let promotions = h.consumption.count(|call| matches!(call, ConsumptionCall::Promote(..)));
    assert!(promotions == 0, "expected no promotion to reach the engine got {}", promotions);
    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));

    Ok(())
}

#[tokio::test]
async fn promote_rejected_with_stale_section() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;

    let stale = h.model.fence().next_section(&key);
    let fresh = h.model.fence().next_section(&key);
    let res = h.model.become_leader_from_standby(&key, stale).await;
    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::StaleSection { section: 1, current: 2, .. })),
        "expected stale section error got {:?}",
        res
    );
    let promotions = h.consumption.count(|call| matches!(call, ConsumptionCall::Promote(..)));
    assert!(promotions == 0, "expected no promotion to reach the engine got {}", promotions);

    h.model.become_leader_from_standby(&key, fresh).await?;
    assert!(h.model.replicas().role(&key) == Role::Leader, "expected LEADER got {}", h.model.replicas().role(&key));
    let promotions = h.consumption.count(|call| call == &ConsumptionCall::Promote(key.clone(), 2));
    assert!(promotions == 1, "expected 1 promotion under section 2 got {}", promotions);

    Ok(())
}

#[tokio::test]
async fn unsubscribe_invalidates_issued_sections() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;

    let section = h.model.fence().next_section(&key);
    h.model.unsubscribe(&key).await?;
    h.model.subscribe(&key).await?;

    assert!(!section.is_current(), "expected section {} to be stale after unsubscribe", section.id());
    let res = h.model.become_leader_from_standby(&key, section).await;
    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::StaleSection { section: 1, .. })),
        "expected stale section error got {:?}",
        res
    );
    let promotions = h.consumption.count(|call| matches!(call, ConsumptionCall::Promote(..)));
    assert!(promotions == 0, "expected no promotion to reach the engine got {}", promotions);
    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));

    Ok(())
}

#[tokio::test]
async fn kill_invalidates_issued_sections() -> Result<()> {
    let h = harness()?;
    let (key, other) = (backup(), fixtures::key("store", 2, 1));
    h.model.subscribe(&key).await?;

    let section = h.model.fence().next_section(&key);
    let unrelated = h.model.fence().next_section(&other);
    h.model.kill(&key.resource).await?;

    assert!(!section.is_current(), "expected section of killed resource to be stale");
    assert!(unrelated.is_current(), "expected section of other resource to stay current");

    Ok(())
}

#[tokio::test]
async fn demote_from_leader_returns_to_standby() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;
    h.model.transition(&key, Role::Leader, None).await?;

    h.model.transition(&key, Role::Standby, None).await?;

    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));
    let demotions = h.consumption.count(|call| call == &ConsumptionCall::Demote(key.clone(), 2));
    assert!(demotions == 1, "expected 1 demotion under section 2 got {}", demotions);

    Ok(())
}

#[tokio::test]
async fn invalid_transition_is_rejected() -> Result<()> {
    let h = harness()?;
    let key = backup();

    let res = h.model.transition(&key, Role::Leader, None).await;

    assert!(
        matches!(
            res.as_ref().err().and_then(fixtures::ingestion_error),
            Some(IngestionError::InvalidTransition { from: Role::Offline, to: Role::Leader, .. })
        ),
        "expected invalid transition got {:?}",
        res
    );
    assert!(h.consumption.calls().is_empty(), "expected no engine calls got {:?}", h.consumption.calls());

    Ok(())
}

#[tokio::test]
async fn error_role_blocks_transitions_until_reset() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;
    assert!(h.model.replicas().mark_error(&key), "expected replica record to exist");

    let res = h.model.transition(&key, Role::Leader, None).await;
    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::ReplicaInError { .. })),
        "expected replica in error got {:?}",
        res
    );
    let res = h.model.subscribe(&key).await;
    assert!(
        matches!(res.as_ref().err().and_then(fixtures::ingestion_error), Some(IngestionError::ReplicaInError { .. })),
        "expected replica in error got {:?}",
        res
    );

    h.model.become_offline_from_error(&key).await?;
    assert!(h.model.replicas().role(&key) == Role::Offline, "expected OFFLINE got {}", h.model.replicas().role(&key));
    h.model.become_standby_from_offline(&key).await?;
    assert!(h.model.replicas().role(&key) == Role::Standby, "expected STANDBY got {}", h.model.replicas().role(&key));

    Ok(())
}

#[tokio::test]
async fn unsubscribe_resets_error_role() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;
    h.model.replicas().mark_error(&key);

    h.model.unsubscribe(&key).await?;

    assert!(h.model.replicas().role(&key) == Role::Offline, "expected OFFLINE got {}", h.model.replicas().role(&key));
    assert!(!h.consumption.is_partition_consuming(&key), "expected {} to stop consuming", key);

    Ok(())
}

#[tokio::test]
async fn offline_from_standby_keeps_storage() -> Result<()> {
    let h = harness()?;
    let key = backup();
    h.model.subscribe(&key).await?;

    h.model.become_offline_from_standby(&key).await?;

    assert!(h.model.replicas().role(&key) == Role::Offline, "expected OFFLINE got {}", h.model.replicas().role(&key));
    assert!(h.storage.has_partition(&key), "expected storage partition {} to be kept", key);
    let stops = h.consumption.count(|call| call == &ConsumptionCall::Stop(key.clone()));
    assert!(stops == 1, "expected 1 stop call got {}", stops);

    Ok(())
}

#[tokio::test]
async fn remove_partition_stops_consuming_partitions_first() -> Result<()> {
    let h = harness()?;
    let (consuming, idle) = (backup(), fixtures::key("store", 1, 1));
    h.model.subscribe(&consuming).await?;
    h.storage.add_resource(idle.resource.clone());

    h.model.remove_partition(&consuming).await?;
    h.model.remove_partition(&idle).await?;

    let stops = h.consumption.count(|call| matches!(call, ConsumptionCall::Stop(_)));
    assert!(stops == 1, "expected only the consuming partition to be stopped got {}", stops);
    assert!(h.storage.dropped() == vec![consuming.clone(), idle], "expected both partitions dropped got {:?}", h.storage.dropped());
    assert!(h.model.replicas().get(&consuming).is_none(), "expected replica record to be removed");

    Ok(())
}
