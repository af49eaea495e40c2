//! Transport seam
//!
//! The engine does not frame or parse packets. A [`Transport`] is the codec
//! collaborator: each call to [`Transport::open`] yields a fresh
//! [`TransportLink`], a pair of ordered channels carrying decoded events in and
//! commands out. Closing the inbound side (dropping its sender) is how the
//! collaborator reports a transport-level failure.
//!
//! [`loopback`] provides an in-memory implementation whose far end can be
//! scripted, which is how the engine is exercised without a network.

pub mod loopback;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::protocol::{InboundEvent, OutboundCommand};
use tokio::sync::mpsc;

/// One established link to the codec
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundCommand>,
    pub inbound: mpsc::Receiver<InboundEvent>,
}

pub trait Transport: Send + Sync + 'static {
    /// Opens a new link for one connection attempt
    fn open(&self, config: &SessionConfig) -> Result<TransportLink, TransportError>;
}
