//! The single transferable ownership object and the state of holding it.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

pub type PeerQueue = VecDeque<String>;

/// Struct that represents the token passed between peers to ensure mutual exclusion.
///
/// Every queue holds each peer name at most once.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Token {
    /// Request number already served for every peer.
    pub last_request_numbers: BTreeMap<String, u64>,
    /// Peers waiting for an ordinary handoff.
    pub queue: PeerQueue,
    /// Peers blocked on each condition variable.
    pub conditional_variable_queues: BTreeMap<String, PeerQueue>,
    /// Signallers owed a priority handoff.
    pub signalled_queue: PeerQueue,
}

/// Enum that tells if a peer is holding the token or not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TokenState {
    Holding(Token),
    #[default]
    NotHolding,
}

/// Struct that bundles the token with the packed protected state for a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub token: Token,
    pub protected_data: serde_json::Value,
}

fn push_unique(queue: &mut PeerQueue, peer: &str) -> bool {
    if queue.iter().any(|queued| queued == peer) {
        return false;
    }
    queue.push_back(peer.to_string());
    true
}

impl Token {
    /// Function that creates the initial token for a group of peers.
    pub fn new<'a, P, C>(peers: P, conditions: C) -> Self
    where
        P: IntoIterator<Item = &'a str>,
        C: IntoIterator<Item = &'a str>,
    {
        Self {
            last_request_numbers: peers.into_iter().map(|p| (p.to_string(), 0)).collect(),
            queue: PeerQueue::new(),
            conditional_variable_queues: conditions
                .into_iter()
                .map(|c| (c.to_string(), PeerQueue::new()))
                .collect(),
            signalled_queue: PeerQueue::new(),
        }
    }

    pub fn last_served(&self, peer: &str) -> u64 {
        self.last_request_numbers.get(peer).copied().unwrap_or(0)
    }

    pub fn set_last_served(&mut self, peer: &str, number: u64) {
        self.last_request_numbers.insert(peer.to_string(), number);
    }

    /// Function that appends `peer` to the main queue. Returns `false` if it was already there.
    pub fn enqueue(&mut self, peer: &str) -> bool {
        push_unique(&mut self.queue, peer)
    }

    /// Function that appends `peer` to the priority queue of signallers.
    pub fn enqueue_signalled(&mut self, peer: &str) -> bool {
        push_unique(&mut self.signalled_queue, peer)
    }

    /// Function that picks the next holder: signalled peers first, then the main queue.
    pub fn dequeue_next(&mut self) -> Option<String> {
        self.signalled_queue
            .pop_front()
            .or_else(|| self.queue.pop_front())
    }

    /// Function that appends `peer` to the waiters of `condition`.
    pub fn enqueue_waiter(&mut self, condition: &str, peer: &str) -> bool {
        let queue = self
            .conditional_variable_queues
            .entry(condition.to_string())
            .or_default();
        push_unique(queue, peer)
    }

    pub fn dequeue_waiter(&mut self, condition: &str) -> Option<String> {
        self.conditional_variable_queues
            .get_mut(condition)
            .and_then(VecDeque::pop_front)
    }

    pub fn waiters(&self, condition: &str) -> usize {
        self.conditional_variable_queues
            .get(condition)
            .map_or(0, VecDeque::len)
    }

    /// Function that takes `peer` out of the signalled queue and every waiter queue.
    pub fn withdraw(&mut self, peer: &str) {
        self.signalled_queue.retain(|queued| queued != peer);
        for waiters in self.conditional_variable_queues.values_mut() {
            waiters.retain(|queued| queued != peer);
        }
    }

    /// Function that tells if `peer` sits in any queue of the token.
    pub fn is_queued(&self, peer: &str) -> bool {
        let in_queue = |queue: &PeerQueue| queue.iter().any(|queued| queued == peer);

        in_queue(&self.queue)
            || in_queue(&self.signalled_queue)
            || self.conditional_variable_queues.values().any(in_queue)
    }

    /// Function that bundles the token with packed protected state.
    pub fn attach(self, protected_data: serde_json::Value) -> Handoff {
        Handoff {
            token: self,
            protected_data,
        }
    }

    /// Function that returns the token as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the token from a JSON formatted `String`.
    pub fn from_json_string(token: &str) -> Result<Self> {
        Ok(serde_json::from_str::<Self>(token)?)
    }
}

impl Handoff {
    /// Function that splits a handoff back into the token and the packed protected state.
    pub fn detach(self) -> (Token, serde_json::Value) {
        (self.token, self.protected_data)
    }
}

impl TokenState {
    pub fn is_holding(&self) -> bool {
        matches!(self, Self::Holding(_))
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Holding(token) => Some(token),
            Self::NotHolding => None,
        }
    }

    pub fn token_mut(&mut self) -> Option<&mut Token> {
        match self {
            Self::Holding(token) => Some(token),
            Self::NotHolding => None,
        }
    }

    /// Function that gives the token away, leaving `NotHolding` behind.
    pub fn take(&mut self) -> Option<Token> {
        match std::mem::take(self) {
            Self::Holding(token) => Some(token),
            Self::NotHolding => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token::new(["a", "b", "c"], ["full", "empty"])
    }

    #[test]
    fn enqueue_ignores_duplicates() {
        let mut token = token();

        assert!(token.enqueue("b"));
        assert!(!token.enqueue("b"));
        assert_eq!(token.queue, PeerQueue::from(["b".to_string()]));
    }

    #[test]
    fn signalled_peers_are_served_first() {
        let mut token = token();
        token.enqueue("b");
        token.enqueue("c");
        token.enqueue_signalled("a");

        assert_eq!(token.dequeue_next().as_deref(), Some("a"));
        assert_eq!(token.dequeue_next().as_deref(), Some("b"));
        assert_eq!(token.dequeue_next().as_deref(), Some("c"));
        assert_eq!(token.dequeue_next(), None);
    }

    #[test]
    fn withdraw_leaves_the_main_queue_alone() {
        let mut token = token();
        token.enqueue("b");
        token.enqueue_signalled("a");
        token.enqueue_waiter("full", "a");
        token.enqueue_waiter("full", "c");

        token.withdraw("a");

        assert!(token.signalled_queue.is_empty());
        assert_eq!(token.waiters("full"), 1);
        assert_eq!(token.queue, PeerQueue::from(["b".to_string()]));
        assert!(!token.is_queued("a"));
    }

    #[test]
    fn waiters_are_fifo_per_condition() {
        let mut token = token();
        token.enqueue_waiter("full", "b");
        token.enqueue_waiter("full", "c");
        token.enqueue_waiter("empty", "a");

        assert_eq!(token.waiters("full"), 2);
        assert_eq!(token.dequeue_waiter("full").as_deref(), Some("b"));
        assert_eq!(token.dequeue_waiter("empty").as_deref(), Some("a"));
        assert_eq!(token.dequeue_waiter("empty"), None);
        assert_eq!(token.dequeue_waiter("missing"), None);
    }

    #[test]
    fn is_queued_looks_at_every_queue() {
        let mut token = token();
        token.enqueue_waiter("empty", "c");
        token.enqueue_signalled("b");

        assert!(token.is_queued("b"));
        assert!(token.is_queued("c"));
        assert!(!token.is_queued("a"));
    }

    #[test]
    fn json_round_trip_keeps_queue_order() {
        let mut token = token();
        token.set_last_served("b", 4);
        token.enqueue("c");
        token.enqueue("b");
        token.enqueue_waiter("full", "a");

        let parsed = Token::from_json_string(&token.to_json_string().unwrap()).unwrap();
        assert_eq!(parsed, token);
        assert_eq!(parsed.queue, PeerQueue::from(["c".to_string(), "b".to_string()]));
    }

    #[test]
    fn take_leaves_not_holding() {
        let mut state = TokenState::Holding(token());

        assert!(state.take().is_some());
        assert!(!state.is_holding());
        assert!(state.take().is_none());
    }
}
