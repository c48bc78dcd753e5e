//! Per-peer request sequence bookkeeping.

use std::collections::BTreeMap;

/// Highest request number known for every peer, this peer's own included.
///
/// Entries never decrease. The own entry only moves through [`RequestVector::bump_own`],
/// every other entry only through [`RequestVector::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVector {
    own: String,
    numbers: BTreeMap<String, u64>,
}

impl RequestVector {
    /// Function that creates a vector with every peer at zero.
    pub fn new<I, S>(own: &str, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut numbers: BTreeMap<String, u64> =
            peers.into_iter().map(|peer| (peer.into(), 0)).collect();
        numbers.entry(own.to_string()).or_insert(0);

        Self {
            own: own.to_string(),
            numbers,
        }
    }

    /// Function that starts a new request of this peer and returns its number.
    pub fn bump_own(&mut self) -> u64 {
        let number = self.numbers.entry(self.own.clone()).or_insert(0);
        *number += 1;
        *number
    }

    /// Function that merges a request number seen from `peer` and returns the merged value.
    pub fn observe(&mut self, peer: &str, number: u64) -> u64 {
        let current = self.numbers.entry(peer.to_string()).or_insert(0);
        *current = (*current).max(number);
        *current
    }

    pub fn read(&self, peer: &str) -> u64 {
        self.numbers.get(peer).copied().unwrap_or(0)
    }

    pub fn own(&self) -> u64 {
        self.read(&self.own)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.numbers.contains_key(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_own_counts_up_from_zero() {
        let mut requests = RequestVector::new("a", ["a", "b"]);

        assert_eq!(requests.own(), 0);
        assert_eq!(requests.bump_own(), 1);
        assert_eq!(requests.bump_own(), 2);
        assert_eq!(requests.read("b"), 0);
    }

    #[test]
    fn observe_keeps_the_maximum() {
        let mut requests = RequestVector::new("a", ["a", "b"]);

        assert_eq!(requests.observe("b", 3), 3);
        assert_eq!(requests.observe("b", 1), 3);
        assert_eq!(requests.read("b"), 3);
    }

    #[test]
    fn own_peer_is_always_tracked() {
        let requests = RequestVector::new("a", ["b", "c"]);

        assert!(requests.contains("a"));
        assert!(!requests.contains("d"));
        assert_eq!(requests.read("d"), 0);
    }
}
