//! Mutual exclusion and liveness under contention.

mod common;

use common::{group, within};
use hot_potato_monitor::Phase;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

const ROUNDS: u64 = 10;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_peer_in_critical_section() {
    let names = ["a", "b", "c", "d", "e"];
    let peers = group(&names, "c", 0u64);

    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = peers
        .iter()
        .cloned()
        .map(|peer| {
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let guard = peer.lock().await?;
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    *guard.protected() += 1;
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    inside.store(false, Ordering::SeqCst);
                    guard.unlock()?;
                }
                Ok::<_, hot_potato_monitor::MonitorError>(())
            })
        })
        .collect();

    for task in tasks {
        within(task).await.unwrap().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let holders = peers.iter().filter(|peer| peer.phase() != Phase::NoToken).count();
    assert_eq!(holders, 1, "exactly one token must exist");

    let total = within(peers[0].entry(|count| *count)).await.unwrap();
    assert_eq!(total, ROUNDS * names.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_tasks_share_one_peer() {
    let peers = group(&["a", "b"], "b", 0u64);
    let a = peers[0].clone();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let a = a.clone();
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    a.entry(|count| *count += 1).await?;
                }
                Ok::<_, hot_potato_monitor::MonitorError>(())
            })
        })
        .collect();

    for task in tasks {
        within(task).await.unwrap().unwrap();
    }

    let total = within(peers[1].entry(|count| *count)).await.unwrap();
    assert_eq!(total, 4 * ROUNDS);
}
