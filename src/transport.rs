//! Point-to-point delivery of envelopes and local dispatch of inbound ones.
//!
//! Both transports keep one ordered stream per (sender, receiver) pair, which is
//! what the token protocol relies on: messages from one sender are delivered in
//! the order they were sent.
//!
//! Over TCP this holds for the lifetime of one connection. A failed write drops
//! the connection and the next frame opens a new one; the receiver reads it in a
//! fresh task while the old reader may still be draining, so frames sent around
//! a reconnect can be delivered out of order.

use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::log;
use crate::message::{ChannelMessage, Envelope};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

pub type Inbox = UnboundedReceiver<ChannelMessage>;

/// Outbound half of a transport. Sends never block: they enqueue and return.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, peer: &str, envelope: &Envelope) -> Result<()>;

    /// Function that sends to every peer, even after a failure, and returns the first error.
    fn broadcast(&self, peers: &[String], envelope: &Envelope) -> Result<()> {
        let mut first_error = None;
        for peer in peers {
            if let Err(e) = self.send(peer, envelope) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Routes inbound envelopes to the subscriber of their `(channel, tag)` pair.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<RwLock<HashMap<(String, String), UnboundedSender<ChannelMessage>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Function that registers a subscriber, replacing any previous one for the same route.
    pub fn subscribe(&self, channel: &str, tag: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .insert((channel.to_string(), tag.to_string()), tx);
        rx
    }

    pub fn dispatch(&self, envelope: Envelope) -> Result<()> {
        let key = (envelope.channel, envelope.tag);
        let closed = {
            let routes = self.routes.read();
            let Some(route) = routes.get(&key) else {
                return Err(MonitorError::Protocol(format!(
                    "no subscriber for channel `{}` tag `{}`",
                    key.0, key.1
                )));
            };
            route.send(envelope.message).is_err()
        };

        if closed {
            self.routes.write().remove(&key);
            return Err(MonitorError::Protocol(format!(
                "subscriber for channel `{}` tag `{}` is gone",
                key.0, key.1
            )));
        }
        Ok(())
    }

    pub fn dispatch_line(&self, line: &str) -> Result<()> {
        self.dispatch(Envelope::from_json_string(line)?)
    }
}

/// Transport over TCP: one persistent connection per peer, one JSON envelope per line.
pub struct TcpTransport {
    outbound: HashMap<String, UnboundedSender<String>>,
}

impl TcpTransport {
    /// Function that starts a writer task for every peer of the table but `own_name`.
    pub fn connect(config: &Config, own_name: &str) -> Self {
        let outbound = config
            .peers
            .iter()
            .filter(|(name, _)| name.as_str() != own_name)
            .map(|(name, address)| {
                let (tx, rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(write_to_peer(name.clone(), address.socket_address(), rx));
                (name.clone(), tx)
            })
            .collect();

        Self { outbound }
    }

    /// Function that binds `address` and feeds every accepted connection into `router`.
    pub async fn listen(address: &str, router: Router) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(address).await?;
        log::info(&cformat!("Listening for peers on <bold>{address}</bold>."));

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_address)) => {
                        log::debug(&cformat!("Accepted a <bold>connection</bold> from {peer_address}."));
                        tokio::spawn(read_from_peer(stream, router.clone()));
                    }
                    Err(e) => log::error(&format!("Accept failed: {e}")),
                }
            }
        }))
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: &str, envelope: &Envelope) -> Result<()> {
        let outbound = self
            .outbound
            .get(peer)
            .ok_or_else(|| MonitorError::PeerNotFound(peer.to_string()))?;

        outbound
            .send(envelope.to_json_string()?)
            .map_err(|_| MonitorError::Protocol(format!("writer for `{peer}` has stopped")))
    }
}

async fn connect_to_peer(peer: &str, address: &str) -> Framed<TcpStream, LinesCodec> {
    let mut announced = false;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                log::debug(&cformat!("Connected to <bold>{peer}</bold> at {address}."));
                return Framed::new(stream, LinesCodec::new());
            }
            Err(e) => {
                if !announced {
                    log::warn(&cformat!("Waiting for <bold>{peer}</bold> at {address}: {e}"));
                    announced = true;
                }
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

async fn write_to_peer(peer: String, address: String, mut rx: UnboundedReceiver<String>) {
    let mut connection: Option<Framed<TcpStream, LinesCodec>> = None;

    while let Some(line) = rx.recv().await {
        if connection.is_none() {
            connection = Some(connect_to_peer(&peer, &address).await);
        }
        let Some(lines) = connection.as_mut() else {
            continue;
        };

        if let Err(e) = lines.send(line).await {
            // the frame is lost; the next one reconnects, and ordering against
            // frames still buffered on the old socket is not guaranteed
            log::error(&cformat!("Couldn't send to <bold>{peer}</bold>: {e}"));
            connection = None;
        }
    }
}

async fn read_from_peer(stream: TcpStream, router: Router) {
    let mut lines = Framed::new(stream, LinesCodec::new());

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if let Err(e) = router.dispatch_line(&line) {
                    log::warn(&format!("Dropped inbound message: {e}"));
                }
            }
            Err(e) => {
                log::error(&format!("Connection closed: {e}"));
                break;
            }
        }
    }
}

/// In-process network. Every send still goes through the JSON line codec.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routers: Arc<RwLock<HashMap<String, Router>>>,
}

/// Outbound half handed to one peer of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Function that registers `peer` and returns its transport and inbound router.
    pub fn join(&self, peer: &str) -> (LocalTransport, Router) {
        let router = self
            .routers
            .write()
            .entry(peer.to_string())
            .or_default()
            .clone();

        (
            LocalTransport {
                network: self.clone(),
            },
            router,
        )
    }
}

impl Transport for LocalTransport {
    fn send(&self, peer: &str, envelope: &Envelope) -> Result<()> {
        let router = self
            .network
            .routers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| MonitorError::PeerNotFound(peer.to_string()))?;

        let line = envelope.to_json_string()?;
        if let Err(e) = router.dispatch_line(&line) {
            log::warn(&format!("Dropped message for {peer}: {e}"));
        }
        Ok(())
    }
}
