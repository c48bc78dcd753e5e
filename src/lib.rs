//! Distributed monitor over Suzuki–Kasami token passing, with condition variables.

pub mod buffer;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod monitor;
pub mod poisson;
pub mod request;
pub mod token;
pub mod transport;

pub use error::{MonitorError, Result};
pub use monitor::{Condition, Monitor, MonitorBuilder, MonitorGuard, Phase, ProtectedState};
pub use token::{Token, TokenState};

/// Mean number of demo operations per second and peer.
pub const RATE: f64 = 1.;
