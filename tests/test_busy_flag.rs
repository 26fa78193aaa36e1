//! A worker is never handed to two visits at once.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use proptest::prelude::*;
use spawnwatch::scanner::{timing, MemoryStore, Point, ScanConfig};

async fn contend(workers: usize, tasks: usize, hold_ms: u64) -> Vec<(usize, f64, f64)> {
    let config = ScanConfig {
        speed_limit: 1e9,
        give_up_unknown: 0.3,
        ..test_config(1, workers, identities(workers))
    };
    let overseer = build(config, MockProtocol::new(), Arc::new(MemoryStore::new())).await;
    let spans = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..tasks)
        .map(|i| {
            let overseer = overseer.clone();
            let spans = spans.clone();
            tokio::spawn(async move {
                let point = Point::untimed(north_of(CENTER, 10.0 * i as f64));
                if let Some((worker, guard, _)) = overseer.best_worker(&point).await {
                    let start = timing::now();
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    let end = timing::now();
                    drop(guard);
                    spans.lock().unwrap().push((worker.slot(), start, end));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    overseer.shutdown().await.unwrap();
    let spans = spans.lock().unwrap().clone();
    spans
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn busy_workers_never_overlap(workers in 1usize..4, tasks in 1usize..10, hold_ms in 5u64..40) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let mut spans = runtime.block_on(contend(workers, tasks, hold_ms));

        prop_assert!(!spans.is_empty());
        spans.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
        for pair in spans.windows(2) {
            if pair[0].0 == pair[1].0 {
                prop_assert!(pair[0].2 <= pair[1].1, "slot {} held twice: {:?}", pair[0].0, pair);
            }
        }
    }
}
