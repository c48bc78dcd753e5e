//! Bounded-buffer producer/consumer monitor, the demo application of the crate.

use crate::error::Result;
use crate::log;
use crate::monitor::{Condition, Monitor, MonitorBuilder};
use crate::transport::{Router, Transport};
use color_print::cformat;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 10;
pub const NOT_FULL: &str = "not_full";
pub const NOT_EMPTY: &str = "not_empty";

/// Protected state of the buffer monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedBuffer {
    pub items: VecDeque<u64>,
    pub capacity: usize,
    /// Operations in the order they happened across the whole group.
    pub trace: Vec<String>,
}

impl BoundedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            trace: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn record(&mut self, peer: &str, operation: &str) {
        self.trace.push(format!("{peer}:{operation}"));
    }
}

pub struct BufferMonitor<T: Transport> {
    monitor: Monitor<BoundedBuffer, T>,
    not_full: Condition,
    not_empty: Condition,
}

impl<T: Transport> BufferMonitor<T> {
    /// Function that registers the two conditions on `builder` and builds the monitor.
    pub fn build(builder: MonitorBuilder, buffer: BoundedBuffer, transport: T, router: &Router) -> Result<Self> {
        let monitor = builder
            .condition(NOT_FULL)
            .condition(NOT_EMPTY)
            .build(buffer, transport, router)?;

        Ok(Self {
            not_full: monitor.condition(NOT_FULL)?,
            not_empty: monitor.condition(NOT_EMPTY)?,
            monitor,
        })
    }

    pub fn monitor(&self) -> &Monitor<BoundedBuffer, T> {
        &self.monitor
    }

    /// Function that appends `item`, waiting on `not_full` while the buffer is full.
    pub async fn produce(&self, item: u64) -> Result<()> {
        let peer = self.monitor.peer_name();
        let mut guard = self.monitor.lock().await?;

        loop {
            let full = guard.protected().is_full();
            if !full {
                break;
            }
            log::info(&cformat!("<bold>{peer}</bold> found the buffer <red>full</red>."));
            guard.wait(&self.not_full).await?;
        }

        let len = {
            let mut buffer = guard.protected();
            buffer.items.push_back(item);
            buffer.record(peer, &format!("produce:{item}"));
            buffer.items.len()
        };
        log::info(&cformat!("<bold>{peer}</bold> produced <green>{item}</green> ({len} queued)."));

        guard.signal(&self.not_empty).await?;
        guard.unlock()
    }

    /// Function that removes the oldest item, waiting on `not_empty` while there is none.
    pub async fn consume(&self) -> Result<u64> {
        let peer = self.monitor.peer_name();
        let mut guard = self.monitor.lock().await?;

        let item = loop {
            let next = guard.protected().items.pop_front();
            match next {
                Some(item) => break item,
                None => {
                    log::info(&cformat!("<bold>{peer}</bold> found the buffer <red>empty</red>."));
                    guard.wait(&self.not_empty).await?;
                }
            }
        };

        let len = {
            let mut buffer = guard.protected();
            buffer.record(peer, &format!("consume:{item}"));
            buffer.items.len()
        };
        log::info(&cformat!("<bold>{peer}</bold> consumed <green>{item}</green> ({len} queued)."));

        guard.signal(&self.not_full).await?;
        guard.unlock()?;
        Ok(item)
    }
}
