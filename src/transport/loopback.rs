//! In-memory transport
//!
//! Every [`open`](Transport::open) creates a channel pair and hands the far end
//! to whoever holds the [`LoopbackAcceptor`], as a [`PeerLink`]. Clones share
//! the acceptor, so a test can keep one to make later opens fail.

use super::{Transport, TransportLink};
use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundCommand};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_BUFFER: usize = 100;

#[derive(Clone)]
pub struct LoopbackTransport {
    buffer: usize,
    peers: mpsc::UnboundedSender<PeerLink>,
    /// Reason reported by `open` while links are refused
    refusal: Arc<Mutex<Option<String>>>,
}

/// Receives the far end of every link the transport opens
#[derive(Debug)]
pub struct LoopbackAcceptor {
    peers: mpsc::UnboundedReceiver<PeerLink>,
}

/// The codec side of one loopback link
#[derive(Debug)]
pub struct PeerLink {
    pub client_id: String,
    pub commands: mpsc::Receiver<OutboundCommand>,
    pub events: mpsc::Sender<InboundEvent>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackAcceptor) {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> (Self, LoopbackAcceptor) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                buffer,
                peers: peers_tx,
                refusal: Arc::new(Mutex::new(None)),
            },
            LoopbackAcceptor { peers: peers_rx },
        )
    }

    /// Makes every following `open` fail with `reason`
    pub fn refuse_with(&self, reason: impl Into<String>) {
        *self.refusal.lock() = Some(reason.into());
    }

    pub fn accept_again(&self) {
        *self.refusal.lock() = None;
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, config: &SessionConfig) -> Result<TransportLink, TransportError> {
        if let Some(reason) = self.refusal.lock().clone() {
            debug!("Refusing loopback link: {}", reason);
            return Err(TransportError::Open(reason));
        }
        let (command_tx, command_rx) = mpsc::channel(self.buffer);
        let (event_tx, event_rx) = mpsc::channel(self.buffer);

        let peer = PeerLink {
            client_id: config.client_id.clone(),
            commands: command_rx,
            events: event_tx,
        };
        self.peers.send(peer).map_err(|_| TransportError::Closed)?;
        debug!("Opened loopback link");

        Ok(TransportLink {
            outbound: command_tx,
            inbound: event_rx,
        })
    }
}

impl LoopbackAcceptor {
    pub async fn accept(&mut self) -> Option<PeerLink> {
        self.peers.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<PeerLink> {
        tokio::time::timeout(timeout, self.peers.recv())
            .await
            .ok()
            .flatten()
    }
}

impl PeerLink {
    /// Next command the engine wrote, if one arrives within `timeout`
    pub async fn next_command(&mut self, timeout: Duration) -> Option<OutboundCommand> {
        tokio::time::timeout(timeout, self.commands.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next command that is not a liveness request
    pub async fn next_non_ping(&mut self, timeout: Duration) -> Option<OutboundCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_command(remaining).await? {
                OutboundCommand::PingReq => continue,
                command => return Some(command),
            }
        }
    }

    pub async fn send(&self, event: InboundEvent) -> Result<(), TransportError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
