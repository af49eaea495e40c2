use super::connection::{PendingRequest, SessionCore};
use super::{SessionEvent, SessionEvents, SessionState};
use crate::config::SessionConfig;
use crate::dispatch::{Dispatcher, DispatcherSettings};
use crate::error::SessionError;
use crate::inflight::{InFlightCounts, InFlightTable, RetryPolicy};
use crate::protocol::{InboundEvent, OutboundCommand, OutgoingPublish, QoS};
use crate::subscription::{MessageHandler, SubscriptionInfo};
use crate::topic::{validate_topic, TopicFilter};
use crate::transport::{Transport, TransportLink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Completion handle for a published message.
///
/// QoS 0 receipts resolve immediately. QoS 1/2 receipts resolve when the
/// handshake completes, fails after its retries, or is discarded.
#[derive(Debug)]
pub struct PublishReceipt {
    packet_id: Option<u16>,
    completion: Option<oneshot::Receiver<Result<(), SessionError>>>,
}

impl PublishReceipt {
    /// Packet identifier assigned to a QoS 1/2 publish
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    pub async fn wait(self) -> Result<(), SessionError> {
        match self.completion {
            None => Ok(()),
            Some(rx) => rx.await.unwrap_or(Err(SessionError::SessionDiscarded {
                packet_id: self.packet_id.unwrap_or_default(),
            })),
        }
    }
}

/// Facade over one broker session.
///
/// ```text
/// SessionClient ──► SessionCore ──► registry / in-flight / dispatcher
///                        │
///                        └──► connection tasks (writer, reader, keepalive, retransmitter)
/// ```
///
/// Dropping the client stops the live connection without a graceful close.
pub struct SessionClient {
    core: Arc<SessionCore>,
    transport: Arc<dyn Transport>,
}

impl SessionClient {
    /// Builds a disconnected session and the stream of its [`SessionEvent`]s
    pub fn new(
        mut config: SessionConfig,
        transport: impl Transport,
    ) -> Result<(Self, SessionEvents), SessionError> {
        config.validate()?;
        config.client_id = config.resolved_client_id();

        let dispatcher = Dispatcher::spawn(DispatcherSettings {
            capacity: config.work_queue_capacity,
            workers: config.worker_count,
            enqueue_timeout: config.dispatch_timeout(),
        })?;
        let inflight = InFlightTable::new(RetryPolicy {
            interval: config.retry_interval(),
            max_retries: config.max_retries,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            "Session '{}' created (clean session: {})",
            config.client_id, config.clean_session
        );
        let core = Arc::new(SessionCore::new(config, inflight, dispatcher, events_tx));
        Ok((
            Self {
                core,
                transport: Arc::new(transport),
            },
            events_rx,
        ))
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.connect_with(&CancellationToken::new()).await
    }

    /// Opens a link and performs the connect handshake.
    ///
    /// Legal only while `Disconnected`. Any failure, including cancellation,
    /// leaves the session `Disconnected`.
    pub async fn connect_with(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.core.transition(
            SessionState::Disconnected,
            SessionState::Connecting,
            "connect",
        )?;

        let link = match self.handshake(cancel).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.core.set_state(SessionState::Disconnected);
                if let SessionError::ConnectFailed(reason) = &e {
                    self.core.emit(SessionEvent::ConnectFailed {
                        reason: reason.clone(),
                    });
                }
                return Err(e);
            }
        };
        self.core.start_connection(link).await
    }

    async fn handshake(&self, cancel: &CancellationToken) -> Result<TransportLink, SessionError> {
        let config = &self.core.config;
        let mut link = self
            .transport
            .open(config)
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        info!("Connecting as '{}'", config.client_id);
        let connect = OutboundCommand::Connect {
            client_id: config.client_id.clone(),
            clean_session: config.clean_session,
            keep_alive: config.keep_alive().unwrap_or(Duration::ZERO),
        };
        let timeout = config.handshake_timeout();

        let session_present = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(SessionError::Cancelled { operation: "connect" });
            }
            result = tokio::time::timeout(timeout, exchange_connect(&mut link, connect)) => {
                match result {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SessionError::ConnectFailed(format!(
                            "no acknowledgment within {}ms",
                            timeout.as_millis()
                        )));
                    }
                }
            }
        };

        if !config.clean_session && !session_present {
            debug!("Broker holds no session state, subscriptions will be re-asserted");
        }
        Ok(link)
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnect_with(&CancellationToken::new()).await
    }

    /// Flushes a graceful close and tears the connection down.
    ///
    /// A cancelled or timed-out flush still ends `Disconnected`; the error
    /// reports that the close was not graceful.
    pub async fn disconnect_with(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        if self.core.state() == SessionState::Disconnected {
            return Err(SessionError::NotConnected);
        }
        self.core.transition(
            SessionState::Connected,
            SessionState::Disconnecting,
            "disconnect",
        )?;

        let Some(mut handle) = self.core.take_connection() else {
            // Faulted in between; the fault already tore everything down
            self.core.set_state(SessionState::Disconnected);
            return Ok(());
        };

        let writer = handle.writer.clone();
        let writer_task = handle.writer_task.take();
        let flush = async move {
            if writer.send(OutboundCommand::Disconnect).await.is_err() {
                debug!("Writer already closed, skipping graceful close");
                return;
            }
            if let Some(task) = writer_task {
                let _ = task.await;
            }
        };

        let timeout = self.core.config.handshake_timeout();
        let flushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled { operation: "disconnect" }),
            result = tokio::time::timeout(timeout, flush) => {
                result.map_err(|_| SessionError::Timeout { operation: "disconnect" })
            }
        };

        handle.abort();
        self.core.set_state(SessionState::Disconnected);
        self.core.discard_connection_state();
        match &flushed {
            Ok(()) => info!("Disconnected"),
            Err(e) => warn!("Disconnected without graceful close: {}", e),
        }
        flushed
    }

    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: impl MessageHandler + 'static,
    ) -> Result<QoS, SessionError> {
        self.subscribe_with(filter, qos, handler, &CancellationToken::new())
            .await
    }

    /// Registers `handler` for `filter` and waits for the broker's grant.
    ///
    /// Returns the granted QoS. Subscribing an already registered filter
    /// replaces its handler once the broker grants the new request; a failed
    /// or cancelled request leaves the previous handler in place.
    pub async fn subscribe_with(
        &self,
        filter: &str,
        qos: QoS,
        handler: impl MessageHandler + 'static,
        cancel: &CancellationToken,
    ) -> Result<QoS, SessionError> {
        parse_filter(filter)?;
        let writer = self.core.writer()?;

        let token = self.core.registry.subscribe(filter, qos, Arc::new(handler))?;
        let packet_id = match self.core.inflight.lock().reserve_request_id() {
            Ok(id) => id,
            Err(e) => {
                self.core.registry.abandon(token);
                return Err(e);
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.core.requests.lock().insert(
            packet_id,
            PendingRequest::Subscribe {
                token,
                filter: filter.to_string(),
                reply: Some(reply_tx),
            },
        );

        debug!("Subscribing to '{}' at {:?} (packet {})", filter, qos, packet_id);
        let command = OutboundCommand::Subscribe {
            packet_id,
            filter: filter.to_string(),
            qos,
        };
        let outcome = match writer.send(command).await {
            Ok(()) => self.await_reply(reply_rx, "subscribe", cancel).await,
            Err(_) => Err(writer_closed()),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                self.forget_request(packet_id);
                self.core.registry.abandon(token);
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SessionError> {
        self.unsubscribe_with(filter, &CancellationToken::new())
            .await
    }

    /// Removes `filter` and waits for the broker's acknowledgment.
    ///
    /// The handler stops receiving messages immediately. Unknown filters
    /// succeed without contacting the broker. If the request fails, an active
    /// subscription is put back, unless a clean session was torn down meanwhile.
    pub async fn unsubscribe_with(
        &self,
        filter: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        parse_filter(filter)?;
        let writer = self.core.writer()?;

        if !self.core.registry.contains(filter) {
            debug!("Filter '{}' not subscribed, nothing to do", filter);
            return Ok(());
        }

        let packet_id = self.core.inflight.lock().reserve_request_id()?;
        let Some(detached) = self.core.registry.detach(filter) else {
            self.core.inflight.lock().release_request_id(packet_id);
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core.requests.lock().insert(
            packet_id,
            PendingRequest::Unsubscribe {
                filter: filter.to_string(),
                reply: reply_tx,
            },
        );

        debug!("Unsubscribing from '{}' (packet {})", filter, packet_id);
        let command = OutboundCommand::Unsubscribe {
            packet_id,
            filter: filter.to_string(),
        };
        let outcome = match writer.send(command).await {
            Ok(()) => self.await_reply(reply_rx, "unsubscribe", cancel).await,
            Err(_) => Err(writer_closed()),
        };

        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(e) => {
                self.forget_request(packet_id);
                e
            }
        };
        let discarded =
            self.core.config.clean_session && self.core.state() != SessionState::Connected;
        if !discarded && self.core.registry.restore(detached) {
            debug!("Unsubscribe from '{}' failed, subscription kept", filter);
        }
        Err(error)
    }

    /// Publishes `payload` on `topic`.
    ///
    /// The call returns once the publish is handed to the writer; the receipt
    /// tracks the rest of the handshake.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishReceipt, SessionError> {
        validate_topic(topic).map_err(|e| SessionError::InvalidTopic {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let writer = self.core.writer()?;

        let publish = OutgoingPublish {
            packet_id: None,
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            duplicate: false,
        };

        if qos == QoS::AtMostOnce {
            writer
                .send(OutboundCommand::Publish(publish))
                .await
                .map_err(|_| writer_closed())?;
            return Ok(PublishReceipt {
                packet_id: None,
                completion: None,
            });
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let command =
            self.core
                .inflight
                .lock()
                .track_publish(publish, Some(completion_tx), Instant::now())?;
        let packet_id = match &command {
            OutboundCommand::Publish(p) => p.packet_id,
            _ => None,
        };
        debug!("Publishing to '{}' at {:?} (packet {:?})", topic, qos, packet_id);

        if writer.send(command).await.is_err() {
            if let Some(id) = packet_id {
                self.core.inflight.lock().remove_outgoing(id);
            }
            return Err(writer_closed());
        }
        Ok(PublishReceipt {
            packet_id,
            completion: Some(completion_rx),
        })
    }

    /// Discards retained subscriptions and in-flight state.
    ///
    /// Only legal while `Disconnected`.
    pub fn reset_session(&self) -> Result<(), SessionError> {
        let state = self.core.state();
        if state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                operation: "reset session",
                state,
            });
        }
        info!("Resetting session '{}'", self.core.config.client_id);
        self.core.inflight.lock().clear();
        self.core.registry.clear();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn client_id(&self) -> &str {
        &self.core.config.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.core.registry.snapshot()
    }

    pub fn in_flight(&self) -> InFlightCounts {
        self.core.inflight.lock().counts()
    }

    /// Messages queued for, or being processed by, handlers
    pub fn pending_dispatch(&self) -> usize {
        self.core.dispatcher.pending()
    }

    /// Waits for a request's reply. The outer error means the request was
    /// abandoned and its bookkeeping must be undone.
    async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T, SessionError>>,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Result<T, SessionError>, SessionError> {
        let timeout = self.core.config.handshake_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled { operation }),
            result = tokio::time::timeout(timeout, reply) => match result {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Ok(Err(SessionError::ConnectionLost(
                    "connection closed before acknowledgment".to_string(),
                ))),
                Err(_) => Err(SessionError::Timeout { operation }),
            },
        }
    }

    fn forget_request(&self, packet_id: u16) {
        self.core.requests.lock().remove(&packet_id);
        self.core.inflight.lock().release_request_id(packet_id);
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(handle) = self.core.take_connection() {
            debug!("Session client dropped while connected");
            handle.abort();
        }
    }
}

fn parse_filter(filter: &str) -> Result<TopicFilter, SessionError> {
    TopicFilter::parse(filter).map_err(|e| SessionError::InvalidFilter {
        filter: filter.to_string(),
        reason: e.to_string(),
    })
}

fn writer_closed() -> SessionError {
    SessionError::ConnectionLost("writer closed".to_string())
}

/// Writes the connect command and reads the broker's answer.
///
/// Returns whether the broker reports a present session.
async fn exchange_connect(
    link: &mut TransportLink,
    connect: OutboundCommand,
) -> Result<bool, SessionError> {
    link.outbound
        .send(connect)
        .await
        .map_err(|_| SessionError::ConnectFailed("transport closed before connect".to_string()))?;

    match link.inbound.recv().await {
        Some(InboundEvent::ConnAck {
            session_present,
            return_code: 0,
        }) => Ok(session_present),
        Some(InboundEvent::ConnAck { return_code, .. }) => Err(SessionError::ConnectFailed(
            format!("refused with return code {}", return_code),
        )),
        Some(other) => Err(SessionError::ConnectFailed(format!(
            "unexpected {:?} before connect acknowledgment",
            other
        ))),
        None => Err(SessionError::ConnectFailed(
            "transport closed during handshake".to_string(),
        )),
    }
}
