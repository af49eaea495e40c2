//! # Session engine
//!
//! Owns one logical connection to a broker: lifecycle, subscriptions, QoS
//! handshakes and delivery to handlers.
//!
//! ## State machine
//!
//! ```text
//!                connect()              ConnAck ok
//! Disconnected ───────────► Connecting ───────────► Connected
//!      ▲                        │                      │   │
//!      │   refused / timeout    │                      │   │ disconnect()
//!      ├────────────────────────┘                      │   ▼
//!      │          transport fault / missed ping        │ Disconnecting
//!      ├───────────────────────────────────────────────┘   │
//!      └───────────────────────────────────────────────────┘
//! ```
//!
//! `ConnectionLost` and `DispatchOverload` are the only transitions not
//! triggered by the caller. The engine never reconnects on its own; a new
//! `connect` call is always the caller's decision.
//!
//! ## Tasks per connection
//!
//! ```text
//! writer         owns the order of outgoing commands, tracks last activity
//! reader         owns the order of inbound events, runs QoS bookkeeping
//! keepalive      requests liveness after an idle interval
//! retransmitter  sweeps in-flight deadlines
//! ```
//!
//! All four stop on the connection's cancellation token. Shared structures
//! are locked only for bookkeeping, never across an `.await` or a handler call.

mod client;
mod connection;

pub use client::{PublishReceipt, SessionClient};

/// Lifecycle state of a session
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Observable session activity, delivered on the stream returned by
/// [`SessionClient::new`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ConnectFailed {
        reason: String,
    },
    ConnectionLost {
        reason: String,
    },
    DispatchOverload {
        waited_ms: u64,
    },
    DeliveryFailed {
        packet_id: u16,
        topic: String,
        attempts: u32,
    },
    SubscriptionRejected {
        filter: String,
    },
}

pub type SessionEvents = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;
