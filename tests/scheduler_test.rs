mod common;

use arquebus::config::TimerConfig;
use arquebus::{
    AttackConfig, Attacker, IndexCache, MemoryStorage, RunReport, Scheduler, SchedulerState,
    SqliteStorage, Storage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cache() -> IndexCache {
    IndexCache::new(1_000_000, Duration::from_secs(3600))
}

fn scheduler(store: Arc<dyn Storage>, cache: IndexCache, cancel_grace: Duration) -> Scheduler {
    let attacker = Attacker::new(AttackConfig {
        cancel_grace,
        ..AttackConfig::default()
    })
    .unwrap();
    Scheduler::new(
        store,
        cache,
        Arc::new(attacker),
        TimerConfig {
            interval: Duration::from_secs(3600),
            startup_delay: Duration::ZERO,
        },
        CancellationToken::new(),
    )
}

fn latest(store: &dyn Storage, id: i64) -> Option<RunReport> {
    store
        .latest_report(id)
        .unwrap()
        .map(|record| serde_json::from_value(record.data).unwrap())
}

#[tokio::test]
async fn valid_definitions_run_and_invalid_ones_are_skipped() {
    let target = common::spawn_target().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Storage> =
        Arc::new(SqliteStorage::open(dir.path().join("tick.db")).unwrap());

    let mut valid = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let data = common::definition(name, &target.url("/health"), 10, "1s");
        valid.push(store.insert(name, &data).unwrap());
    }
    let invalid = store
        .insert("broken", &common::definition("broken", &target.url("/health"), -1, "1s"))
        .unwrap();

    // Nothing cached yet: the tick has to list the store
    let scheduler = scheduler(store.clone(), cache(), Duration::from_secs(2));
    let summary = scheduler.tick().await.unwrap();

    assert_eq!(summary.definitions, 4);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.persisted, 3);
    assert!(!summary.cancelled);

    for id in valid {
        let report = latest(store.as_ref(), id).unwrap();
        assert!(report.requests > 0);
        assert_eq!(report.requests, report.success + report.errors.len() as u64);
    }
    assert!(latest(store.as_ref(), invalid).is_none());
}

#[tokio::test]
async fn each_tick_appends_a_report() {
    let target = common::spawn_target().await;
    let store = Arc::new(MemoryStorage::new());
    let id = store
        .insert("repeat", &common::definition("repeat", &target.url("/health"), 5, "200ms"))
        .unwrap();

    let scheduler = scheduler(store.clone(), cache(), Duration::from_secs(2));
    scheduler.tick().await.unwrap();
    scheduler.tick().await.unwrap();

    assert_eq!(store.select_reports(id, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn stopping_mid_run_persists_the_partial_report() {
    let target = common::spawn_target().await;
    let store = Arc::new(MemoryStorage::new());
    let first = store
        .insert("long", &common::definition("long", &target.url("/health"), 100, "30s"))
        .unwrap();
    let second = store
        .insert("next", &common::definition("next", &target.url("/health"), 10, "1s"))
        .unwrap();

    let scheduler = Arc::new(scheduler(
        store.clone(),
        cache(),
        Duration::from_millis(500),
    ));
    let mut states = scheduler.subscribe();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    scheduler.stop();
    assert_eq!(*states.borrow_and_update(), SchedulerState::Stopping);

    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    let report = latest(store.as_ref(), first).unwrap();
    assert!(report.cancelled);
    assert!(report.requests > 0 && report.requests < 3000);
    // The rest of the tick is not started
    assert!(latest(store.as_ref(), second).is_none());
}

#[tokio::test]
async fn store_outage_is_retried_on_the_next_tick() {
    let target = common::spawn_target().await;
    let store = Arc::new(MemoryStorage::new());
    let id = store
        .insert("flaky", &common::definition("flaky", &target.url("/health"), 5, "200ms"))
        .unwrap();
    let scheduler = scheduler(store.clone(), cache(), Duration::from_secs(2));

    store.set_available(false);
    assert!(scheduler.tick().await.is_err());

    store.set_available(true);
    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.persisted, 1);
    assert!(latest(store.as_ref(), id).is_some());
}
