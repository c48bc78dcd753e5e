//! Distributed monitor built on Suzuki–Kasami token passing.
//!
//! Every peer owns one [`Monitor`] per tag. The peer holding the [`Token`] may enter
//! the critical section; the others broadcast a REQUEST and wait for the token to
//! be handed to them. Condition variables live inside the token, so waiting and
//! signalling move ownership between peers the way a Hoare monitor moves it
//! between threads.
//!
//! # Locking
//!
//! All protocol state sits behind one `parking_lot` mutex that is never held
//! across an `.await`. A task waiting for the token parks on a `Notify` with that
//! mutex released, so the inbound task can keep handling REQUEST and TOKEN
//! messages and eventually deliver the wake-up.
//!
//! # Cancellation
//!
//! Dropping a `lock`, `wait` or `signal` future does not recall the REQUEST or
//! the token already sent. If the token later reaches a peer where nobody waits
//! for it any more, the peer records its request as served and passes the token
//! on. A guard whose `wait` or `signal` was cancelled no longer holds the critical
//! section and releases nothing when dropped.

use crate::config::{Config, DEFAULT_MONITOR_CHANNEL};
use crate::error::{MonitorError, Result};
use crate::log;
use crate::message::{ChannelMessage, Envelope, MonitorMessage};
use crate::request::RequestVector;
use crate::token::{Handoff, Token, TokenState};
use crate::transport::{Inbox, Router, Transport};
use color_print::cformat;
use parking_lot::{Mutex, MutexGuard};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::Notify;

pub const DEFAULT_MONITOR_TAG: &str = "monitor";

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Application state that travels with the token.
///
/// Implemented for every serde type; `pack` runs when the token leaves this peer
/// and `unpack` when it arrives.
pub trait ProtectedState: Send + 'static {
    fn pack(&self) -> Result<serde_json::Value>;

    fn unpack(value: serde_json::Value) -> Result<Self>
    where
        Self: Sized;
}

impl<S> ProtectedState for S
where
    S: Serialize + DeserializeOwned + Send + 'static,
{
    fn pack(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn unpack(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Where this peer stands with respect to the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NoToken,
    HoldingIdle,
    InCriticalSection,
}

/// Handle to a condition variable registered on one monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    name: Arc<str>,
    owner: u64,
}

impl Condition {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct State {
    requests: RequestVector,
    token: TokenState,
    in_critical_section: bool,
    /// A local task is parked until the token is handed to it.
    waiting: bool,
    /// Our last REQUEST went out and the token has not arrived since.
    request_outstanding: bool,
}

struct Shared<S, T> {
    id: u64,
    peer_name: String,
    /// Every other member of the group.
    peers: Vec<String>,
    channel: String,
    tag: String,
    conditions: BTreeSet<String>,
    transport: T,
    state: Mutex<State>,
    protected: Mutex<S>,
    token_acquired: Notify,
    /// Serializes local tasks: at most one of them takes part in the protocol.
    entry: tokio::sync::Mutex<()>,
}

/// One peer's end of a distributed monitor.
pub struct Monitor<S, T> {
    shared: Arc<Shared<S, T>>,
}

impl<S, T> Clone for Monitor<S, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Proof of being inside the critical section. Dropping it unlocks the monitor.
pub struct MonitorGuard<'a, S: ProtectedState, T: Transport> {
    monitor: &'a Monitor<S, T>,
    released: bool,
    _entry: tokio::sync::MutexGuard<'a, ()>,
}

/// Lives across the await in `await_token`; dropping it early abandons the wait.
struct Parked<'a, S: ProtectedState, T: Transport> {
    shared: &'a Shared<S, T>,
    granted: bool,
}

impl<S: ProtectedState, T: Transport> Drop for Parked<'_, S, T> {
    fn drop(&mut self) {
        if !self.granted {
            self.shared.abandon();
        }
    }
}

/// Describes a monitor before it joins the group.
#[derive(Debug, Clone)]
pub struct MonitorBuilder {
    peer_name: String,
    peers: Vec<String>,
    initial_token_holder: String,
    channel: String,
    tag: String,
    conditions: Vec<String>,
}

fn invariant_violation(operation: &str) -> ! {
    panic!("invariant violation: {operation} while not holding the token")
}

impl MonitorBuilder {
    /// `peers` is the whole group, `peer_name` included.
    pub fn new<I, P>(peer_name: &str, peers: I, initial_token_holder: &str) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            peer_name: peer_name.to_string(),
            peers: peers.into_iter().map(Into::into).collect(),
            initial_token_holder: initial_token_holder.to_string(),
            channel: DEFAULT_MONITOR_CHANNEL.to_string(),
            tag: DEFAULT_MONITOR_TAG.to_string(),
            conditions: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, peer_name: &str) -> Self {
        Self::new(peer_name, config.peer_names(), &config.initial_token_holder)
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = channel.to_string();
        self
    }

    /// Name of this monitor instance; peers only talk to monitors with the same tag.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Function that registers a condition variable by name.
    pub fn condition(mut self, name: &str) -> Self {
        if !self.conditions.iter().any(|c| c == name) {
            self.conditions.push(name.to_string());
        }
        self
    }

    /// Function that subscribes the monitor to `router` and starts its inbound task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build<S, T>(self, protected: S, transport: T, router: &Router) -> Result<Monitor<S, T>>
    where
        S: ProtectedState,
        T: Transport,
    {
        if !self.peers.contains(&self.peer_name) {
            return Err(MonitorError::Config(format!(
                "`{}` is not a member of its own group",
                self.peer_name
            )));
        }
        if !self.peers.contains(&self.initial_token_holder) {
            return Err(MonitorError::Config(format!(
                "initial token holder `{}` is not a member of the group",
                self.initial_token_holder
            )));
        }

        let token = if self.peer_name == self.initial_token_holder {
            TokenState::Holding(Token::new(
                self.peers.iter().map(String::as_str),
                self.conditions.iter().map(String::as_str),
            ))
        } else {
            TokenState::NotHolding
        };

        let state = State {
            requests: RequestVector::new(&self.peer_name, self.peers.iter().cloned()),
            token,
            in_critical_section: false,
            waiting: false,
            request_outstanding: false,
        };

        let inbox = router.subscribe(&self.channel, &self.tag);
        let peers = self
            .peers
            .into_iter()
            .filter(|peer| *peer != self.peer_name)
            .collect();

        let shared = Arc::new(Shared {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            peer_name: self.peer_name,
            peers,
            channel: self.channel,
            tag: self.tag,
            conditions: self.conditions.into_iter().collect(),
            transport,
            state: Mutex::new(state),
            protected: Mutex::new(protected),
            token_acquired: Notify::new(),
            entry: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(serve_inbox(Arc::downgrade(&shared), inbox));

        Ok(Monitor { shared })
    }
}

/// Inbound path: messages for one monitor are handled strictly one after another.
async fn serve_inbox<S, T>(shared: Weak<Shared<S, T>>, mut inbox: Inbox)
where
    S: ProtectedState,
    T: Transport,
{
    while let Some(message) = inbox.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.on_message(message) {
            log::warn(&cformat!("<bold>{}</bold> dropped a message: {e}", shared.peer_name));
        }
    }
}

impl<S, T> Shared<S, T>
where
    S: ProtectedState,
    T: Transport,
{
    fn envelope(&self, message: &MonitorMessage) -> Result<Envelope> {
        let message = ChannelMessage::new(&self.peer_name, message)?;
        Ok(Envelope::new(&self.channel, &self.tag, message))
    }

    fn on_message(&self, message: ChannelMessage) -> Result<()> {
        if !self.peers.contains(&message.sender) {
            return Err(MonitorError::Protocol(format!(
                "message from unknown peer `{}`",
                message.sender
            )));
        }

        match message.decode()? {
            MonitorMessage::Request(body) => self.on_request(&message.sender, body.request_number),
            MonitorMessage::Token(handoff) => self.on_token(&message.sender, handoff),
        }
    }

    fn on_request(&self, sender: &str, number: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let merged = state.requests.observe(sender, number);
        log::debug(&cformat!(
            "<bold>{}</bold> got <cyan>REQUEST {number}</cyan> from <bold>{sender}</bold>.",
            self.peer_name
        ));

        let Some(token) = state.token.token_mut() else {
            return Ok(());
        };
        if merged != token.last_served(sender) + 1 || token.is_queued(sender) {
            return Ok(());
        }

        // queued on arrival, so requests made during a critical section keep their order
        token.enqueue(sender);
        if !state.in_critical_section {
            self.hand_off(state)?;
        }
        Ok(())
    }

    fn on_token(&self, sender: &str, handoff: Handoff) -> Result<()> {
        let (token, protected_data) = handoff.detach();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.token.is_holding() {
            return Err(MonitorError::Protocol(format!(
                "second token received from `{sender}`"
            )));
        }

        match S::unpack(protected_data) {
            Ok(protected) => *self.protected.lock() = protected,
            Err(e) => log::error(&cformat!(
                "<bold>{}</bold> kept its protected state, the one from {sender} is unreadable: {e}",
                self.peer_name
            )),
        }

        state.token = TokenState::Holding(token);
        state.request_outstanding = false;

        if !state.waiting {
            // the task that asked for it is gone
            let own = state.requests.own();
            if let Some(token) = state.token.token_mut() {
                token.set_last_served(&self.peer_name, own);
            }
            state.in_critical_section = false;
            log::debug(&cformat!(
                "<bold>{}</bold> got the <yellow, bold>token</yellow, bold> from {sender} with nobody waiting, passing it on.",
                self.peer_name
            ));
            return self.hand_off(state).map(|_| ());
        }

        state.waiting = false;
        state.in_critical_section = true;
        drop(guard);

        log::debug(&cformat!(
            "<bold>{}</bold> is holding the <yellow, bold>token</yellow, bold> (from {sender}).",
            self.peer_name
        ));
        self.token_acquired.notify_one();
        Ok(())
    }

    /// Function that enters the critical section, requesting the token if needed.
    async fn acquire(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.token.is_holding() {
                state.in_critical_section = true;
                return Ok(());
            }

            // an unanswered REQUEST is sent again under the same number
            if !state.request_outstanding {
                state.requests.bump_own();
                state.request_outstanding = true;
            }
            let number = state.requests.own();
            let envelope = self.envelope(&MonitorMessage::request(number))?;

            state.waiting = true;
            if let Err(e) = self.transport.broadcast(&self.peers, &envelope) {
                // whoever got the REQUEST may still grant it; on_token passes the token on
                state.waiting = false;
                return Err(e);
            }
            log::debug(&cformat!(
                "<bold>{}</bold> broadcast <cyan>REQUEST {number}</cyan>.",
                self.peer_name
            ));
        }

        self.await_token().await;
        Ok(())
    }

    /// Parks until `on_token` hands the critical section to this peer.
    async fn await_token(&self) {
        let mut parked = Parked {
            shared: self,
            granted: false,
        };

        loop {
            self.token_acquired.notified().await;
            let granted = {
                let state = self.state.lock();
                !state.waiting && state.token.is_holding()
            };
            if granted {
                parked.granted = true;
                return;
            }
        }
    }

    /// Function that cleans up after a parked task was dropped.
    fn abandon(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.waiting {
            state.waiting = false;
            if let Some(token) = state.token.token_mut() {
                token.withdraw(&self.peer_name);
            }
            return;
        }

        // granted after the task stopped listening
        if state.in_critical_section {
            if let Err(e) = self.leave(state) {
                log::error(&cformat!(
                    "<bold>{}</bold> failed to pass the token on: {e}",
                    self.peer_name
                ));
            }
        }
    }

    fn release(&self) -> Result<()> {
        let mut guard = self.state.lock();
        self.leave(&mut guard)
    }

    fn leave(&self, state: &mut State) -> Result<()> {
        let own = state.requests.own();
        let token = state
            .token
            .token_mut()
            .unwrap_or_else(|| invariant_violation("unlock"));
        token.set_last_served(&self.peer_name, own);
        state.in_critical_section = false;

        self.hand_off(state).map(|_| ())
    }

    /// Function that queues every peer whose request is next in line and hands the
    /// token to the head of the queues, if any.
    fn hand_off(&self, state: &mut State) -> Result<Option<String>> {
        let token = state
            .token
            .token_mut()
            .unwrap_or_else(|| invariant_violation("hand off"));

        for peer in &self.peers {
            if !token.is_queued(peer) && state.requests.read(peer) == token.last_served(peer) + 1 {
                token.enqueue(peer);
            }
        }

        if token.signalled_queue.is_empty() && token.queue.is_empty() {
            return Ok(None);
        }

        let protected_data = self.protected.lock().pack()?;
        let from_signalled = !token.signalled_queue.is_empty();
        let Some(next) = token.dequeue_next() else {
            return Ok(None);
        };

        if let Err(e) = self.send_token(state, &next, protected_data) {
            if let Some(token) = state.token.token_mut() {
                if from_signalled {
                    token.signalled_queue.push_front(next);
                } else {
                    token.queue.push_front(next);
                }
            }
            return Err(e);
        }
        Ok(Some(next))
    }

    /// Function that ships the token to `peer`. On failure the token stays here.
    fn send_token(&self, state: &mut State, peer: &str, protected_data: serde_json::Value) -> Result<()> {
        let token = state
            .token
            .take()
            .unwrap_or_else(|| invariant_violation("send the token"));

        let message = MonitorMessage::Token(token.attach(protected_data));
        let sent = self
            .envelope(&message)
            .and_then(|envelope| self.transport.send(peer, &envelope));

        if let Err(e) = sent {
            if let MonitorMessage::Token(handoff) = message {
                state.token = TokenState::Holding(handoff.detach().0);
            }
            return Err(e);
        }

        state.in_critical_section = false;
        log::debug(&cformat!(
            "<bold>{}</bold> sent the <yellow, bold>token</yellow, bold> to <bold>{peer}</bold>.",
            self.peer_name
        ));
        Ok(())
    }

    fn check(&self, condition: &Condition) -> Result<()> {
        if condition.owner != self.id {
            return Err(MonitorError::ForeignCondition(condition.name.to_string()));
        }
        Ok(())
    }

    async fn wait(&self, condition: &Condition) -> Result<()> {
        self.check(condition)?;

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let own = state.requests.own();
            let token = state
                .token
                .token_mut()
                .unwrap_or_else(|| invariant_violation("wait"));
            token.set_last_served(&self.peer_name, own);
            token.enqueue_waiter(&condition.name, &self.peer_name);
            state.in_critical_section = false;
            state.waiting = true;

            if let Err(e) = self.hand_off(state) {
                state.waiting = false;
                if let Some(token) = state.token.token_mut() {
                    if let Some(waiters) = token.conditional_variable_queues.get_mut(&*condition.name) {
                        waiters.retain(|peer| *peer != self.peer_name);
                    }
                }
                state.in_critical_section = true;
                return Err(e);
            }
        }

        log::debug(&cformat!(
            "<bold>{}</bold> waits on <magenta>{}</magenta>.",
            self.peer_name,
            condition.name
        ));
        self.await_token().await;
        Ok(())
    }

    async fn signal(&self, condition: &Condition) -> Result<bool> {
        self.check(condition)?;

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let own = state.requests.own();
            let token = state
                .token
                .token_mut()
                .unwrap_or_else(|| invariant_violation("signal"));
            if token.waiters(&condition.name) == 0 {
                return Ok(false);
            }

            let protected_data = self.protected.lock().pack()?;
            let Some(waiter) = token.dequeue_waiter(&condition.name) else {
                return Ok(false);
            };
            token.set_last_served(&self.peer_name, own);
            token.enqueue_signalled(&self.peer_name);
            state.waiting = true;

            if let Err(e) = self.send_token(state, &waiter, protected_data) {
                state.waiting = false;
                if let Some(token) = state.token.token_mut() {
                    token.signalled_queue.retain(|peer| *peer != self.peer_name);
                    token
                        .conditional_variable_queues
                        .entry(condition.name.to_string())
                        .or_default()
                        .push_front(waiter);
                }
                return Err(e);
            }

            log::debug(&cformat!(
                "<bold>{}</bold> signalled <magenta>{}</magenta>, <bold>{waiter}</bold> resumes.",
                self.peer_name,
                condition.name
            ));
        }

        self.await_token().await;
        Ok(true)
    }
}

impl<S, T> Monitor<S, T>
where
    S: ProtectedState,
    T: Transport,
{
    pub fn peer_name(&self) -> &str {
        &self.shared.peer_name
    }

    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Function that returns the handle of a registered condition variable.
    pub fn condition(&self, name: &str) -> Result<Condition> {
        if !self.shared.conditions.contains(name) {
            return Err(MonitorError::UnknownCondition(name.to_string()));
        }
        Ok(Condition {
            name: Arc::from(name),
            owner: self.shared.id,
        })
    }

    /// Function that enters the critical section.
    ///
    /// Holding the idle token enters directly; otherwise a REQUEST is broadcast and
    /// the call waits, without a timeout, for the token to arrive.
    pub async fn lock(&self) -> Result<MonitorGuard<'_, S, T>> {
        let entry = self.shared.entry.lock().await;
        self.shared.acquire().await?;

        Ok(MonitorGuard {
            monitor: self,
            released: false,
            _entry: entry,
        })
    }

    /// Function that runs `operation` on the protected state inside the critical section.
    ///
    /// The monitor is unlocked on every exit path, unwinding included.
    pub async fn entry<R>(&self, operation: impl FnOnce(&mut S) -> R) -> Result<R> {
        let guard = self.lock().await?;
        let result = operation(&mut guard.protected());
        guard.unlock()?;
        Ok(result)
    }

    pub fn phase(&self) -> Phase {
        let state = self.shared.state.lock();
        match (&state.token, state.in_critical_section) {
            (TokenState::NotHolding, _) => Phase::NoToken,
            (TokenState::Holding(_), false) => Phase::HoldingIdle,
            (TokenState::Holding(_), true) => Phase::InCriticalSection,
        }
    }

    /// Highest request number this peer has seen from `peer`.
    pub fn observed(&self, peer: &str) -> u64 {
        self.shared.state.lock().requests.read(peer)
    }

    /// Copy of the token, if this peer holds it.
    pub fn token_snapshot(&self) -> Option<Token> {
        self.shared.state.lock().token.token().cloned()
    }
}

impl<S, T> MonitorGuard<'_, S, T>
where
    S: ProtectedState,
    T: Transport,
{
    /// Function that gives access to the protected state.
    pub fn protected(&self) -> MutexGuard<'_, S> {
        self.monitor.shared.protected.lock()
    }

    /// Function that releases the token until another peer signals `condition`.
    ///
    /// Returns inside the critical section, holding the token again.
    pub async fn wait(&mut self, condition: &Condition) -> Result<()> {
        // stays set if this future is dropped before the token comes back
        self.released = true;
        let result = self.monitor.shared.wait(condition).await;
        self.released = false;
        result
    }

    /// Function that hands the token to the first waiter of `condition` and waits
    /// for it to come back. Returns `false` without blocking when nobody waits.
    pub async fn signal(&mut self, condition: &Condition) -> Result<bool> {
        self.released = true;
        let result = self.monitor.shared.signal(condition).await;
        self.released = false;
        result
    }

    /// Function that leaves the critical section and reports handoff errors.
    pub fn unlock(mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        self.monitor.shared.release()
    }
}

impl<S, T> Drop for MonitorGuard<'_, S, T>
where
    S: ProtectedState,
    T: Transport,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.monitor.shared.release() {
            log::error(&cformat!(
                "<bold>{}</bold> failed to pass the token on: {e}",
                self.monitor.shared.peer_name
            ));
        }
    }
}
