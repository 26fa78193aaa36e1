//! Identity swaps, benching, retirement and the shutdown census.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use spawnwatch::scanner::protocol::MapObjects;
use spawnwatch::scanner::{timing, MemoryStore, ProtocolError, ScanConfig, SnapshotStore};
use spawnwatch::types::SpawnPointRecord;

fn bound_user(guard: &spawnwatch::scanner::worker::BusyGuard) -> String {
    guard.identity().map(|i| i.username.clone()).unwrap_or_default()
}

#[tokio::test]
async fn test_sustained_zero_yield_swaps_identity() {
    let protocol = MockProtocol::new();
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(1, 1, identities(2)), protocol.clone(), store).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    for _ in 0..3 {
        assert!(!worker.visit(&mut guard, CENTER, false).await.unwrap());
        assert_eq!(bound_user(&guard), "user0");
    }
    assert_eq!(guard.empty_visits(), 3);

    // The fourth empty response pushes the identity over the limit
    worker.visit(&mut guard, CENTER, false).await.unwrap();
    assert_eq!(bound_user(&guard), "user1");
    assert_eq!(guard.empty_visits(), 0);

    let census = overseer.context().pool.census();
    assert_eq!(census.available, vec!["user0".to_string()]);
    assert_eq!(census.owned.get(&0).map(String::as_str), Some("user1"));

    drop(guard);
    overseer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_records_reset_the_empty_counter() {
    let protocol = MockProtocol::new();
    protocol.set_default_map(map_with(vec![wild(1, 10, CENTER, 600_000)]));
    protocol.script("user0", vec![Ok(MapObjects::default()), Ok(MapObjects::default())]);
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(1, 1, identities(2)), protocol.clone(), store).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    worker.visit(&mut guard, CENTER, false).await.unwrap();
    worker.visit(&mut guard, CENTER, false).await.unwrap();
    assert_eq!(guard.empty_visits(), 2);
    assert!(worker.visit(&mut guard, CENTER, false).await.unwrap());
    assert_eq!(guard.empty_visits(), 0);
    assert_eq!(bound_user(&guard), "user0");

    drop(guard);
    overseer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_challenge_without_solver_benches_identity() {
    let protocol = MockProtocol::new();
    protocol.script(
        "user0",
        vec![Err(ProtocolError::ChallengeRequired {
            url: "https://challenge.example/1".to_string(),
        })],
    );
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(1, 1, identities(2)), protocol.clone(), store).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    assert!(!worker.visit(&mut guard, CENTER, false).await.unwrap());
    assert_eq!(bound_user(&guard), "user1");

    let pool = &overseer.context().pool;
    assert_eq!(pool.manual_solve_pending(), 1);
    assert!(pool.resolve_challenge("user0"));
    assert_eq!(pool.census().available, vec!["user0".to_string()]);

    drop(guard);
    overseer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_banned_identity_is_retired() {
    let protocol = MockProtocol::new();
    protocol.script("user0", vec![Err(ProtocolError::Banned)]);
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(1, 1, identities(2)), protocol.clone(), store).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    worker.visit(&mut guard, CENTER, false).await.unwrap();
    assert_eq!(bound_user(&guard), "user1");
    assert_eq!(overseer.context().pool.census().retired, vec!["user0".to_string()]);

    drop(guard);
    let census = overseer.shutdown().await.unwrap();
    assert_eq!(census.retired, vec!["user0".to_string()]);
    assert!(census.is_consistent(&usernames(2)));
}

#[tokio::test]
async fn test_throttling_is_counted_and_persisted() {
    let protocol = MockProtocol::new();
    protocol.script(
        "user0",
        vec![Err(ProtocolError::Throttled {
            reset_at: Some(timing::now() + 0.2),
        })],
    );
    protocol.set_default_map(map_with(vec![wild(1, 10, CENTER, 60_000)]));
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(1, 1, identities(1)), protocol.clone(), store.clone()).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    // The cooldown is absorbed and the same identity retries
    assert!(worker.visit(&mut guard, CENTER, false).await.unwrap());
    assert_eq!(bound_user(&guard), "user0");
    assert_eq!(guard.identity().map(|i| i.throttle_failures), Some(1));

    drop(guard);
    overseer.shutdown().await.unwrap();
    assert_eq!(store.throttle_failures("user0"), Some(1));
    assert_eq!(store.sightings().len(), 1);
}

#[tokio::test]
async fn test_shutdown_accounts_for_every_identity() {
    let mut ids = identities(6);
    ids[5].banned = true;
    let protocol = MockProtocol::new();
    let store = Arc::new(MemoryStore::new());
    let config = ScanConfig {
        scan_delay: 10.0,
        ..test_config(2, 2, ids)
    };
    let overseer = build(config, protocol.clone(), store.clone()).await;
    let runner = tokio::spawn(overseer.clone().run());

    assert!(protocol.wait_for_visits(4, Duration::from_secs(10)).await);
    let census = overseer.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();

    assert!(census.owned.is_empty());
    assert_eq!(census.retired, vec!["user5".to_string()]);
    assert_eq!(census.available.len(), 5);
    assert!(census.is_consistent(&usernames(6)));

    // Identities were persisted with their learned session state
    let snapshot = store.load_snapshot("identities").await.unwrap().expect("identities snapshot");
    let saved: Vec<spawnwatch::scanner::Identity> = serde_json::from_value(snapshot).unwrap();
    assert_eq!(saved.len(), 6);
    let bound: Vec<_> = saved.iter().filter(|i| i.username.as_str() < "user4").collect();
    assert_eq!(bound.len(), 4);
    assert!(bound.iter().all(|i| i.device.is_some() && i.last_active.is_some()));
}

#[tokio::test]
async fn test_manual_solve_backlog_pauses_dispatch() {
    let now = timing::now();
    let deadline = timing::now_secs() + 2;
    let mut ids = identities(2);
    ids[1].captcha = true;
    ids[0].location = Some(CENTER);
    ids[0].last_active = Some(now);

    let store = Arc::new(MemoryStore::new());
    store.insert_spawn(SpawnPointRecord {
        spawn_id: 7,
        coords: CENTER,
        despawn_offset: Some(timing::hour_offset(deadline)),
        updated: timing::now_secs(),
    });
    let config = ScanConfig {
        max_captchas: 0,
        min_spawns_for_schedule: 1,
        ..test_config(1, 1, ids)
    };
    let protocol = MockProtocol::new();
    let overseer = build(config, protocol.clone(), store).await;
    assert_eq!(overseer.context().pool.manual_solve_pending(), 1);
    let runner = tokio::spawn(overseer.clone().run());

    // Nothing is dispatched past the deadline while the backlog exceeds the limit
    assert!(!protocol.wait_for_visits(1, Duration::from_secs(4)).await);
    assert_eq!(overseer.status().dispatch.dispatched, 0);

    assert!(overseer.context().pool.resolve_challenge("user1"));
    assert!(protocol.wait_for_visits(1, Duration::from_secs(5)).await);
    assert_eq!(protocol.visits()[0].username, "user0");

    overseer.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bench_during_gap_fill_pauses_untimed_dispatch() {
    let deadline = timing::now_secs() + 8;
    let store = Arc::new(MemoryStore::new());
    store.insert_spawn(SpawnPointRecord {
        spawn_id: 1,
        coords: CENTER,
        despawn_offset: Some(timing::hour_offset(deadline)),
        updated: timing::now_secs(),
    });
    for i in 0..5u64 {
        store.insert_spawn(SpawnPointRecord {
            spawn_id: 100 + i,
            coords: north_of(CENTER, 50.0 * (i + 1) as f64),
            despawn_offset: None,
            updated: timing::now_secs(),
        });
    }
    let protocol = MockProtocol::new();
    protocol.script(
        "user0",
        vec![Err(ProtocolError::ChallengeRequired {
            url: "https://challenge.example/2".to_string(),
        })],
    );
    let config = ScanConfig {
        max_captchas: 0,
        min_spawns_for_schedule: 1,
        ..test_config(1, 1, identities(2))
    };
    let overseer = build(config, protocol.clone(), store).await;
    let runner = tokio::spawn(overseer.clone().run());

    // The first untimed visit benches user0; nothing else leaves the overseer
    assert!(protocol.wait_for_visits(1, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(overseer.context().pool.manual_solve_pending(), 1);
    assert_eq!(protocol.visits().len(), 1);
    assert_eq!(protocol.visits()[0].username, "user0");
    assert_eq!(overseer.status().dispatch.dispatched, 1);

    assert!(overseer.context().pool.resolve_challenge("user0"));
    assert!(protocol.wait_for_visits(2, Duration::from_secs(5)).await);

    overseer.shutdown().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_during_running_visits_frees_every_slot() {
    let protocol = MockProtocol::new();
    protocol.set_visit_delay(Duration::from_secs(60));
    let store = Arc::new(MemoryStore::new());
    let overseer = build(test_config(2, 2, identities(6)), protocol.clone(), store).await;
    let runner = tokio::spawn(overseer.clone().run());

    // Every worker is stuck inside a map request
    assert!(protocol.wait_for_visits(4, Duration::from_secs(5)).await);
    assert_eq!(overseer.in_flight(), 4);
    assert!(overseer.workers().iter().all(|w| w.try_acquire().is_none()));

    let census = tokio::time::timeout(Duration::from_secs(10), overseer.shutdown())
        .await
        .expect("shutdown should not wait for the blocked requests")
        .unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(overseer.in_flight(), 0);
    assert!(overseer.workers().iter().all(|w| w.try_acquire().is_some()));
    assert!(census.owned.is_empty());
    assert_eq!(census.available.len(), 6);
    assert!(census.is_consistent(&usernames(6)));
}
