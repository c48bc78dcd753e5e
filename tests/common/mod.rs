//! Helpers shared by the integration tests.

#![allow(dead_code)]

use hot_potato_monitor::{
    Monitor, MonitorBuilder, ProtectedState,
    buffer::{BoundedBuffer, BufferMonitor},
    transport::{LocalNetwork, LocalTransport},
};
use std::{future::Future, time::Duration};

pub const PATIENCE: Duration = Duration::from_secs(10);

/// Helper: one monitor per name on a fresh in-process network.
pub fn group<S>(names: &[&str], holder: &str, initial: S) -> Vec<Monitor<S, LocalTransport>>
where
    S: ProtectedState + Clone,
{
    let network = LocalNetwork::new();
    names
        .iter()
        .map(|name| {
            let (transport, router) = network.join(name);
            MonitorBuilder::new(name, names.iter().copied(), holder)
                .build(initial.clone(), transport, &router)
                .expect("monitor")
        })
        .collect()
}

/// Helper: one bounded-buffer monitor per name on a fresh in-process network.
pub fn buffers(names: &[&str], holder: &str, initial: &BoundedBuffer) -> Vec<BufferMonitor<LocalTransport>> {
    let network = LocalNetwork::new();
    names
        .iter()
        .map(|name| {
            let (transport, router) = network.join(name);
            BufferMonitor::build(
                MonitorBuilder::new(name, names.iter().copied(), holder).tag("buffer"),
                initial.clone(),
                transport,
                &router,
            )
            .expect("buffer monitor")
        })
        .collect()
}

/// Helper: fail the test instead of hanging when a future never completes.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(PATIENCE, future)
        .await
        .expect("timed out waiting for the token")
}

/// Helper: poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
}
