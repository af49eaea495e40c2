use super::MessageHandler;
use crate::error::SessionError;
use crate::protocol::{min_qos, Message, QoS};
use crate::topic::TopicFilter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Correlates a subscribe request with the broker's acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscribeToken(u64);

/// Broker verdict on a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted(QoS),
    Rejected,
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub filter: String,
    pub requested_qos: QoS,
    pub granted_qos: Option<QoS>,
}

/// A handler selected for one message, with the QoS it receives the message at
#[derive(Clone)]
pub struct MatchedHandler {
    pub filter: String,
    pub qos: QoS,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for MatchedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchedHandler")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .finish()
    }
}

struct Subscription {
    filter: TopicFilter,
    requested_qos: QoS,
    granted_qos: Option<QoS>,
    handler: Arc<dyn MessageHandler>,
    /// Latest request awaiting acknowledgment
    pending: Option<Staged>,
}

/// Handler and QoS of a request, installed once the broker grants it
struct Staged {
    token: SubscribeToken,
    requested_qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    fn waits_on(&self, token: SubscribeToken) -> bool {
        self.pending.as_ref().map(|s| s.token) == Some(token)
    }
}

/// An entry taken out of the registry by [`SubscriptionRegistry::detach`]
pub struct DetachedSubscription {
    filter: String,
    entry: Subscription,
}

impl DetachedSubscription {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.entry.granted_qos.is_some()
    }
}

/// Active filters keyed by their exact filter string
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Subscription>>,
    next_token: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers interest in `filter`.
    ///
    /// A new entry stays undispatchable until [`confirm_grant`](Self::confirm_grant)
    /// is called with the returned token. For an active entry the new handler
    /// and QoS are staged; the previous ones keep receiving until the grant.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscribeToken, SessionError> {
        let parsed = TopicFilter::parse(filter).map_err(|e| SessionError::InvalidFilter {
            filter: filter.to_string(),
            reason: e.to_string(),
        })?;
        let token = SubscribeToken(self.next_token.fetch_add(1, Ordering::Relaxed));

        let mut entries = self.entries.write();
        match entries.get_mut(filter) {
            Some(existing) => {
                debug!("Staging new handler for filter '{}'", filter);
                existing.pending = Some(Staged {
                    token,
                    requested_qos: qos,
                    handler,
                });
            }
            None => {
                debug!("Registering filter '{}' at {:?}", filter, qos);
                entries.insert(
                    filter.to_string(),
                    Subscription {
                        filter: parsed,
                        requested_qos: qos,
                        granted_qos: None,
                        handler: handler.clone(),
                        pending: Some(Staged {
                            token,
                            requested_qos: qos,
                            handler,
                        }),
                    },
                );
            }
        }
        Ok(token)
    }

    /// Applies the broker's answer. Returns the affected filter, or `None` if the
    /// token is stale (entry removed or superseded by a newer request).
    pub fn confirm_grant(&self, token: SubscribeToken, grant: Grant) -> Option<String> {
        let mut entries = self.entries.write();
        let filter = entries
            .iter()
            .find(|(_, sub)| sub.waits_on(token))
            .map(|(filter, _)| filter.clone())?;

        match grant {
            Grant::Granted(qos) => {
                if let Some(sub) = entries.get_mut(&filter) {
                    if let Some(staged) = sub.pending.take() {
                        sub.requested_qos = staged.requested_qos;
                        sub.handler = staged.handler;
                    }
                    sub.granted_qos = Some(qos);
                }
                info!("Subscription '{}' active at {:?}", filter, qos);
            }
            Grant::Rejected => {
                entries.remove(&filter);
                warn!("Subscription '{}' rejected by broker", filter);
            }
        }
        Some(filter)
    }

    /// Removes the entry for `filter`; absent filters are ignored
    pub fn unsubscribe(&self, filter: &str) -> bool {
        self.detach(filter).is_some()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.read().contains_key(filter)
    }

    /// Removes the entry for `filter`, keeping it so it can be [`restore`](Self::restore)d
    pub fn detach(&self, filter: &str) -> Option<DetachedSubscription> {
        let entry = self.entries.write().remove(filter)?;
        debug!("Removed filter '{}'", filter);
        Some(DetachedSubscription {
            filter: filter.to_string(),
            entry,
        })
    }

    /// Puts back an active detached entry.
    ///
    /// Returns `false` if the entry never had a grant or the filter was
    /// subscribed again in the meantime.
    pub fn restore(&self, detached: DetachedSubscription) -> bool {
        if !detached.is_active() {
            return false;
        }
        let DetachedSubscription { filter, mut entry } = detached;
        let mut entries = self.entries.write();
        if entries.contains_key(&filter) {
            return false;
        }
        entry.pending = None;
        debug!("Restored filter '{}'", filter);
        entries.insert(filter, entry);
        true
    }

    /// Withdraws the request for `token`.
    ///
    /// An entry that never had a grant is removed; an active one keeps its
    /// previous handler and QoS.
    pub fn abandon(&self, token: SubscribeToken) -> Option<String> {
        let mut entries = self.entries.write();
        let filter = entries
            .iter()
            .find(|(_, sub)| sub.waits_on(token))
            .map(|(filter, _)| filter.clone())?;

        let was_active = entries
            .get(&filter)
            .map(|sub| sub.granted_qos.is_some())
            .unwrap_or(false);
        if was_active {
            if let Some(sub) = entries.get_mut(&filter) {
                sub.pending = None;
            }
        } else {
            entries.remove(&filter);
        }
        Some(filter)
    }

    /// Handlers of every active filter matching the message's topic
    pub fn dispatch(&self, message: &Message) -> Vec<MatchedHandler> {
        let entries = self.entries.read();
        entries
            .values()
            .filter_map(|sub| {
                let granted = sub.granted_qos?;
                sub.filter.matches(message.topic()).then(|| MatchedHandler {
                    filter: sub.filter.as_str().to_string(),
                    qos: min_qos(message.qos(), granted),
                    handler: sub.handler.clone(),
                })
            })
            .collect()
    }

    /// Filters with a broker grant, with the QoS they were requested at
    pub fn active(&self) -> Vec<(String, QoS)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, sub)| sub.granted_qos.is_some())
            .map(|(filter, sub)| (filter.clone(), sub.requested_qos))
            .collect()
    }

    /// Marks an active entry as re-requested after a reconnect
    pub fn reassert(&self, filter: &str) -> Option<SubscribeToken> {
        let mut entries = self.entries.write();
        let sub = entries.get_mut(filter)?;
        let token = SubscribeToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        sub.pending = Some(Staged {
            token,
            requested_qos: sub.requested_qos,
            handler: sub.handler.clone(),
        });
        Some(token)
    }

    /// Drops entries that never received a grant
    pub fn discard_pending(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, sub| sub.granted_qos.is_some());
        for sub in entries.values_mut() {
            sub.pending = None;
        }
        before - entries.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            info!("Discarding {} subscriptions", entries.len());
        }
        entries.clear();
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .entries
            .read()
            .iter()
            .map(|(filter, sub)| SubscriptionInfo {
                filter: filter.clone(),
                requested_qos: sub.requested_qos,
                granted_qos: sub.granted_qos,
            })
            .collect();
        infos.sort_by(|a, b| a.filter.cmp(&b.filter));
        infos
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
