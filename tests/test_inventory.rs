//! Spinning stops only while the inventory has room.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use spawnwatch::scanner::protocol::{MapCell, MapObjects};
use spawnwatch::scanner::{timing, ItemLimit, MemoryStore, ScanConfig};

fn map_with_stop() -> MapObjects {
    MapObjects {
        cells: vec![MapCell {
            wild: vec![wild(1, 10, CENTER, 60_000)],
            features: vec![stop("stop-1", CENTER)],
            spawn_points: Vec::new(),
        }],
        timestamp_ms: timing::now_secs() * 1000,
    }
}

fn holding(items: BTreeMap<u32, u32>) -> Vec<spawnwatch::scanner::Identity> {
    let mut ids = identities(1);
    ids[0].inventory_timestamp = Some(timing::now_secs());
    ids[0].items = items;
    ids
}

#[tokio::test]
async fn test_full_inventory_skips_spinning() {
    let protocol = MockProtocol::new();
    protocol.set_default_map(map_with_stop());
    let config = ScanConfig {
        spin_features: true,
        ..test_config(1, 1, holding(BTreeMap::from([(1, 400)])))
    };
    let overseer = build(config, protocol.clone(), Arc::new(MemoryStore::new())).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    assert!(worker.visit(&mut guard, CENTER, false).await.unwrap());
    assert_eq!(protocol.spins(), 0);
    assert!(protocol.recycled().is_empty());

    drop(guard);
    overseer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_surplus_items_are_recycled_before_spinning() {
    let protocol = MockProtocol::new();
    protocol.set_default_map(map_with_stop());
    let config = ScanConfig {
        spin_features: true,
        item_limits: vec![ItemLimit { item_id: 1, keep: 320 }],
        ..test_config(1, 1, holding(BTreeMap::from([(1, 360)])))
    };
    let overseer = build(config, protocol.clone(), Arc::new(MemoryStore::new())).await;
    let worker = overseer.workers()[0].clone();
    let mut guard = worker.acquire().await;

    assert!(worker.visit(&mut guard, CENTER, false).await.unwrap());
    assert_eq!(protocol.recycled(), vec![(1, 40)]);
    assert_eq!(protocol.spins(), 1);
    // 320 kept plus 3 awarded by the spin
    assert_eq!(guard.identity().map(|i| i.items.get(&1).copied()), Some(Some(323)));

    drop(guard);
    overseer.shutdown().await.unwrap();
}
