//! Error types for the session engine
//!
//! Errors fall into the classes described by [`ErrorClass`]. Caller misuse is
//! returned synchronously and never retried, transient delivery errors affect a
//! single message, and session-fatal errors always leave the session
//! `Disconnected`.

use crate::session::SessionState;
use thiserror::Error;

/// Classification used by callers to decide how to react to a [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller issued an operation that can never succeed as given
    CallerMisuse,
    /// A single message could not be delivered; the session continues
    Transient,
    /// The session has moved to `Disconnected`
    SessionFatal,
    /// Timeouts, cancellations and rejections of a single request
    Operational,
}

/// Errors returned by [`SessionClient`](crate::SessionClient) operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Filter violates the wildcard placement rules
    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Topic name is empty or contains wildcard characters
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Operation requires an established connection
    #[error("Session is not connected")]
    NotConnected,

    /// Lifecycle operation issued from a state that does not allow it
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Transport handshake failed, was refused or timed out
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Transport fault or missed liveness response while connected
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Work queue stayed full for longer than the dispatch timeout
    #[error("Dispatch queue overloaded for {waited_ms}ms")]
    DispatchOverload { waited_ms: u64 },

    /// QoS handshake was not completed within the retry budget
    #[error("Delivery of packet {packet_id} on '{topic}' failed after {attempts} attempts")]
    DeliveryFailed {
        packet_id: u16,
        topic: String,
        attempts: u32,
    },

    /// Broker refused the subscription request
    #[error("Subscription to '{filter}' rejected by broker")]
    SubscriptionRejected { filter: String },

    /// Filter was unsubscribed or subscribed again before the broker
    /// acknowledged this request
    #[error("Subscription to '{filter}' withdrawn before acknowledgment")]
    SubscriptionWithdrawn { filter: String },

    /// Handshake acknowledgment did not arrive in time
    #[error("Timed out waiting for {operation} acknowledgment")]
    Timeout { operation: &'static str },

    /// Caller-supplied cancellation signal fired mid-operation
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    /// Every packet identifier is held by an outstanding entry
    #[error("No free packet identifier available")]
    PacketIdsExhausted,

    /// Outstanding state was discarded by a clean-session teardown or reset
    #[error("Outstanding state for packet {packet_id} was discarded")]
    SessionDiscarded { packet_id: u16 },

    /// Configuration rejected when building the client
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker threads could not be started
    #[error("Failed to start dispatcher: {0}")]
    Startup(#[from] std::io::Error),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::InvalidFilter { .. }
            | SessionError::InvalidTopic { .. }
            | SessionError::NotConnected
            | SessionError::InvalidState { .. }
            | SessionError::Config(_) => ErrorClass::CallerMisuse,
            SessionError::DeliveryFailed { .. } | SessionError::SessionDiscarded { .. } => {
                ErrorClass::Transient
            }
            SessionError::ConnectFailed(_)
            | SessionError::ConnectionLost(_)
            | SessionError::DispatchOverload { .. } => ErrorClass::SessionFatal,
            SessionError::SubscriptionRejected { .. }
            | SessionError::SubscriptionWithdrawn { .. }
            | SessionError::Timeout { .. }
            | SessionError::Cancelled { .. }
            | SessionError::PacketIdsExhausted
            | SessionError::Startup(_) => ErrorClass::Operational,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::SessionFatal
    }
}

/// Errors from loading or validating a [`SessionConfig`](crate::SessionConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// The collaborator could not establish the underlying link
    #[error("Failed to open transport: {0}")]
    Open(String),

    /// The collaborator is gone and will not hand out further links
    #[error("Transport closed")]
    Closed,
}
