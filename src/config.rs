//! Peer table loaded from a JSON file.

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

pub const DEFAULT_PEERS_FILE_NAME: &str = "peers.json";
pub const DEFAULT_MONITOR_CHANNEL: &str = "default-monitor-channel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub address: String,
    pub port: u16,
}

/// Static membership of a monitor group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub peers: BTreeMap<String, PeerAddress>,
    pub initial_token_holder: String,
}

impl PeerAddress {
    /// Function that returns the address in `host:port` form.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config = serde_json::from_str::<Self>(json)
            .map_err(|e| MonitorError::Config(format!("invalid peer table: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MonitorError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(MonitorError::Config("peer table is empty".to_string()));
        }
        if !self.peers.contains_key(&self.initial_token_holder) {
            return Err(MonitorError::Config(format!(
                "initial token holder `{}` is not a peer",
                self.initial_token_holder
            )));
        }
        Ok(())
    }

    pub fn address_of(&self, peer: &str) -> Result<&PeerAddress> {
        self.peers
            .get(peer)
            .ok_or_else(|| MonitorError::PeerNotFound(peer.to_string()))
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEERS: &str = r#"{
        "peers": {
            "a": { "address": "127.0.0.1", "port": 5001 },
            "b": { "address": "127.0.0.1", "port": 5002 }
        },
        "initial_token_holder": "a"
    }"#;

    #[test]
    fn parses_peer_table() {
        let config = Config::from_json_str(PEERS).unwrap();

        assert_eq!(config.peer_names(), vec!["a", "b"]);
        assert_eq!(config.address_of("b").unwrap().socket_address(), "127.0.0.1:5002");
        assert!(matches!(config.address_of("z"), Err(MonitorError::PeerNotFound(_))));
    }

    #[test]
    fn rejects_unknown_initial_holder() {
        let json = PEERS.replace(r#""initial_token_holder": "a""#, r#""initial_token_holder": "z""#);

        assert!(matches!(Config::from_json_str(&json), Err(MonitorError::Config(_))));
    }

    #[test]
    fn rejects_empty_table() {
        let json = r#"{ "peers": {}, "initial_token_holder": "a" }"#;

        assert!(matches!(Config::from_json_str(json), Err(MonitorError::Config(_))));
    }
}
