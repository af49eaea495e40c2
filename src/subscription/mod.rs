//! Subscription bookkeeping
//!
//! The registry maps each filter string to its requested QoS, the QoS the broker
//! granted, and the handler that receives matching messages. A filter is only
//! dispatched to once the broker has granted it.
//!
//! ```text
//! subscribe ──► Pending ──ConfirmGrant(qos)──► Active ──unsubscribe──► removed
//!                  │
//!                  └──ConfirmGrant(rejected)──► removed
//! ```

mod registry;

pub use registry::{DetachedSubscription, Grant, MatchedHandler, SubscribeToken, SubscriptionInfo, SubscriptionRegistry};

use crate::protocol::Message;

/// Receives messages for one subscription.
///
/// Handlers run on the dispatcher's worker threads, never on the transport read
/// path, so a handler may block. Messages for one subscription arrive in the
/// order the transport received them.
pub trait MessageHandler: Send + Sync {
    fn deliver(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn deliver(&self, message: Message) {
        self(message)
    }
}
