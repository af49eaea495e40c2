//! # broker-session
//!
//! Client-side session engine for topic-based publish/subscribe brokers.
//!
//! The crate owns everything between the caller and a packet codec: connection
//! lifecycle, subscription bookkeeping, QoS 1/2 handshakes with
//! retransmission, keepalive, and ordered delivery of inbound messages to
//! handlers on a bounded worker pool. Framing and I/O are left to a
//! [`Transport`] implementation.
//!
//! ```text
//! caller ──► SessionClient ──► writer ──► Transport (codec)
//!                 ▲                            │
//!                 │ SessionEvent               ▼
//!              events ◄── reader ◄────── InboundEvent
//!                              │
//!                              └──► Dispatcher ──► MessageHandler
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use broker_session::transport::loopback::LoopbackTransport;
//! use broker_session::{Message, QoS, SessionClient, SessionConfig};
//!
//! # async fn run() -> Result<(), broker_session::SessionError> {
//! let (transport, _acceptor) = LoopbackTransport::new();
//! let (client, _events) = SessionClient::new(SessionConfig::default(), transport)?;
//! client.connect().await?;
//! client
//!     .subscribe("sensor/+/temp", QoS::AtLeastOnce, |message: Message| {
//!         println!("{}", message);
//!     })
//!     .await?;
//! client.publish("sensor/room1/temp", "21.5", QoS::AtLeastOnce, false).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod inflight;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod topic;
pub mod transport;

pub use config::SessionConfig;
pub use error::{ConfigError, ErrorClass, SessionError, TransportError};
pub use inflight::InFlightCounts;
pub use protocol::{InboundEvent, InboundPublish, Message, OutboundCommand, QoS};
pub use session::{PublishReceipt, SessionClient, SessionEvent, SessionEvents, SessionState};
pub use subscription::{MessageHandler, SubscriptionInfo};
pub use topic::{matches, TopicFilter};
pub use transport::{Transport, TransportLink};
