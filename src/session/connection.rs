use super::{SessionEvent, SessionState};
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::inflight::{AckOutcome, DeliveryDecision, InFlightTable, PeerAck, RetryAction};
use crate::protocol::{InboundEvent, InboundPublish, Message, OutboundCommand, QoS};
use crate::subscription::{Grant, SubscribeToken, SubscriptionRegistry};
use crate::transport::TransportLink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WRITER_BUFFER: usize = 256;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5);

/// Subscribe or unsubscribe request waiting for its acknowledgment
pub(crate) enum PendingRequest {
    Subscribe {
        token: SubscribeToken,
        filter: String,
        reply: Option<oneshot::Sender<Result<QoS, SessionError>>>,
    },
    Unsubscribe {
        filter: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

impl PendingRequest {
    fn fail(self, error: SessionError) {
        match self {
            PendingRequest::Subscribe {
                reply: Some(reply), ..
            } => {
                let _ = reply.send(Err(error));
            }
            PendingRequest::Subscribe { reply: None, .. } => {}
            PendingRequest::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Outgoing traffic timestamp and liveness-response signal shared by the
/// writer, reader and keepalive tasks
struct Activity {
    last_sent: Mutex<Instant>,
    pong: Notify,
}

impl Activity {
    fn new() -> Self {
        Self {
            last_sent: Mutex::new(Instant::now()),
            pong: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last_sent.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_sent.lock().elapsed()
    }
}

/// Live connection owned by the session while `Connected`
pub(crate) struct ConnectionHandle {
    generation: u64,
    pub(crate) writer: mpsc::Sender<OutboundCommand>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) writer_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared between the facade and the connection tasks
pub(crate) struct SessionCore {
    pub(crate) config: SessionConfig,
    state: Mutex<SessionState>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) inflight: Mutex<InFlightTable>,
    pub(crate) requests: Mutex<HashMap<u16, PendingRequest>>,
    pub(crate) connection: Mutex<Option<ConnectionHandle>>,
    pub(crate) dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<SessionEvent>,
    generation: AtomicU64,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        inflight: InFlightTable,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(SessionState::Disconnected),
            registry: SubscriptionRegistry::new(),
            inflight: Mutex::new(inflight),
            requests: Mutex::new(HashMap::new()),
            connection: Mutex::new(None),
            dispatcher,
            events,
            generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; the event is informational for observers
        let _ = self.events.send(event);
    }

    /// Moves `from` → `to`, failing with `InvalidState` if the session is elsewhere
    pub(crate) fn transition(
        &self,
        from: SessionState,
        to: SessionState,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if *state != from {
                return Err(SessionError::InvalidState {
                    operation,
                    state: *state,
                });
            }
            *state = to;
        }
        info!("Session state {:?} -> {:?}", from, to);
        self.emit(SessionEvent::StateChanged { from, to });
        Ok(())
    }

    pub(crate) fn set_state(&self, to: SessionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            info!("Session state {:?} -> {:?}", from, to);
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    /// Writer of the live connection, if the session is `Connected`
    pub(crate) fn writer(&self) -> Result<mpsc::Sender<OutboundCommand>, SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or(SessionError::NotConnected)
    }

    pub(crate) fn take_connection(&self) -> Option<ConnectionHandle> {
        self.connection.lock().take()
    }

    /// Starts the connection tasks over an acknowledged link
    pub(crate) async fn start_connection(
        self: &Arc<Self>,
        link: TransportLink,
    ) -> Result<(), SessionError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_BUFFER);
        let activity = Arc::new(Activity::new());
        let TransportLink { outbound, inbound } = link;

        *self.connection.lock() = Some(ConnectionHandle {
            generation,
            writer: writer_tx.clone(),
            shutdown: shutdown.clone(),
            writer_task: None,
            tasks: Vec::new(),
        });
        if let Err(e) = self.transition(SessionState::Connecting, SessionState::Connected, "connect")
        {
            if let Some(handle) = self.take_connection() {
                handle.abort();
            }
            return Err(e);
        }

        let writer_task = {
            let core = self.clone();
            let activity = activity.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(reason) = run_writer(writer_rx, outbound, activity, shutdown).await {
                    core.fault(generation, SessionError::ConnectionLost(reason));
                }
            })
        };

        let mut tasks = Vec::with_capacity(3);
        {
            let core = self.clone();
            let writer = writer_tx.clone();
            let activity = activity.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = core.run_reader(inbound, writer, activity, shutdown).await {
                    core.fault(generation, e);
                }
            }));
        }

        if let Some(keep_alive) = self.config.keep_alive() {
            let core = self.clone();
            let writer = writer_tx.clone();
            let activity = activity.clone();
            let shutdown = shutdown.clone();
            let grace = self.config.keep_alive_grace();
            tasks.push(tokio::spawn(async move {
                if let Err(reason) =
                    run_keepalive(writer, activity, keep_alive, grace, shutdown).await
                {
                    core.fault(generation, SessionError::ConnectionLost(reason));
                }
            }));
        }

        {
            let core = self.clone();
            let writer = writer_tx.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = core.run_retransmitter(writer, shutdown).await {
                    core.fault(generation, e);
                }
            }));
        }

        match self.connection.lock().as_mut() {
            Some(handle) if handle.generation == generation => {
                handle.writer_task = Some(writer_task);
                handle.tasks = tasks;
            }
            // Faulted while starting; tasks are already cancelled
            _ => {}
        }

        if !self.config.clean_session {
            self.resume(&writer_tx).await;
        }
        Ok(())
    }

    /// Re-asserts active subscriptions and resumes outgoing handshakes
    async fn resume(&self, writer: &mpsc::Sender<OutboundCommand>) {
        let mut commands = Vec::new();
        for (filter, qos) in self.registry.active() {
            let Some(token) = self.registry.reassert(&filter) else {
                continue;
            };
            let packet_id = match self.inflight.lock().reserve_request_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Cannot re-assert '{}': {}", filter, e);
                    continue;
                }
            };
            self.requests.lock().insert(
                packet_id,
                PendingRequest::Subscribe {
                    token,
                    filter: filter.clone(),
                    reply: None,
                },
            );
            commands.push(OutboundCommand::Subscribe {
                packet_id,
                filter,
                qos,
            });
        }
        let subscriptions = commands.len();
        commands.extend(self.inflight.lock().resume(Instant::now()));

        info!(
            "Resuming session: {} subscriptions, {} in-flight handshakes",
            subscriptions,
            commands.len() - subscriptions
        );
        for command in commands {
            if writer.send(command).await.is_err() {
                warn!("Connection closed while resuming session");
                return;
            }
        }
    }

    /// Tears down the connection of `generation` after a fault
    pub(crate) fn fault(&self, generation: u64, error: SessionError) {
        let handle = {
            let mut connection = self.connection.lock();
            match connection.as_ref() {
                Some(handle) if handle.generation == generation => connection.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            debug!("Ignoring fault from retired connection: {}", error);
            return;
        };

        error!("Session fault: {}", error);
        handle.abort();
        self.set_state(SessionState::Disconnected);
        self.discard_connection_state();

        match error {
            SessionError::DispatchOverload { waited_ms } => {
                self.emit(SessionEvent::DispatchOverload { waited_ms })
            }
            other => self.emit(SessionEvent::ConnectionLost {
                reason: other.to_string(),
            }),
        }
    }

    /// Drops per-connection bookkeeping; with a clean session, everything else too
    pub(crate) fn discard_connection_state(&self) {
        let requests: Vec<PendingRequest> =
            self.requests.lock().drain().map(|(_, r)| r).collect();
        for request in requests {
            request.fail(SessionError::ConnectionLost(
                "connection closed before acknowledgment".to_string(),
            ));
        }
        self.registry.discard_pending();

        let mut inflight = self.inflight.lock();
        inflight.clear_requests();
        if self.config.clean_session {
            inflight.clear();
            drop(inflight);
            self.registry.clear();
        }
    }

    async fn run_reader(
        &self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        writer: mpsc::Sender<OutboundCommand>,
        activity: Arc<Activity>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        debug!("Reader started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Reader stopped");
                    return Ok(());
                }
                event = inbound.recv() => event,
            };

            match event {
                Some(event) => self.handle_inbound(event, &writer, &activity).await?,
                None => {
                    return Err(SessionError::ConnectionLost(
                        "transport closed".to_string(),
                    ))
                }
            }
        }
    }

    async fn handle_inbound(
        &self,
        event: InboundEvent,
        writer: &mpsc::Sender<OutboundCommand>,
        activity: &Activity,
    ) -> Result<(), SessionError> {
        match event {
            InboundEvent::Publish(publish) => self.handle_publish(publish, writer).await,
            InboundEvent::PubAck { packet_id } => {
                self.handle_ack(packet_id, PeerAck::PubAck, writer).await
            }
            InboundEvent::PubRec { packet_id } => {
                self.handle_ack(packet_id, PeerAck::PubRec, writer).await
            }
            InboundEvent::PubComp { packet_id } => {
                self.handle_ack(packet_id, PeerAck::PubComp, writer).await
            }
            InboundEvent::PubRel { packet_id } => {
                if !self.inflight.lock().release_delivery(packet_id) {
                    debug!("Release for unknown delivery {}", packet_id);
                }
                send(writer, OutboundCommand::PubComp { packet_id }).await
            }
            InboundEvent::SubAck { packet_id, granted } => {
                self.handle_suback(packet_id, granted);
                Ok(())
            }
            InboundEvent::UnsubAck { packet_id } => {
                self.handle_unsuback(packet_id);
                Ok(())
            }
            InboundEvent::PingResp => {
                debug!("Liveness response received");
                activity.pong.notify_waiters();
                Ok(())
            }
            InboundEvent::Disconnect { reason } => Err(SessionError::ConnectionLost(format!(
                "broker disconnected: {}",
                reason
            ))),
            InboundEvent::ConnAck { .. } => {
                warn!("Ignoring connect acknowledgment on established connection");
                Ok(())
            }
        }
    }

    async fn handle_publish(
        &self,
        publish: InboundPublish,
        writer: &mpsc::Sender<OutboundCommand>,
    ) -> Result<(), SessionError> {
        let qos = publish.qos;
        let packet_id = publish.packet_id;
        debug!(
            "Inbound publish on '{}' at {:?} (packet {:?})",
            publish.topic, qos, packet_id
        );

        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => self.deliver(publish).await,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.deliver(publish).await?;
                send(writer, OutboundCommand::PubAck { packet_id }).await
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let decision = self
                    .inflight
                    .lock()
                    .record_delivery(packet_id, Instant::now());
                if decision == DeliveryDecision::Deliver {
                    self.deliver(publish).await?;
                }
                send(writer, OutboundCommand::PubRec { packet_id }).await
            }
            (_, None) => {
                warn!(
                    "Publish on '{}' at {:?} without packet id, delivering unacknowledged",
                    publish.topic, qos
                );
                self.deliver(publish).await
            }
        }
    }

    async fn deliver(&self, publish: InboundPublish) -> Result<(), SessionError> {
        let message = Message::from_publish(publish);
        let matched = self.registry.dispatch(&message);
        if matched.is_empty() {
            debug!("No subscription matches '{}'", message.topic());
            return Ok(());
        }
        self.dispatcher.enqueue(matched, &message).await
    }

    async fn handle_ack(
        &self,
        packet_id: u16,
        ack: PeerAck,
        writer: &mpsc::Sender<OutboundCommand>,
    ) -> Result<(), SessionError> {
        let outcome = self
            .inflight
            .lock()
            .acknowledge(packet_id, ack, Instant::now());
        match outcome {
            AckOutcome::Completed => Ok(()),
            AckOutcome::Release(command) => send(writer, command).await,
            AckOutcome::Unexpected => {
                debug!("Unexpected {:?} for packet {}", ack, packet_id);
                Ok(())
            }
        }
    }

    fn handle_suback(&self, packet_id: u16, granted: Option<QoS>) {
        let request = self.requests.lock().remove(&packet_id);
        self.inflight.lock().release_request_id(packet_id);

        match request {
            Some(PendingRequest::Subscribe {
                token,
                filter,
                reply,
            }) => {
                let grant = granted.map(Grant::Granted).unwrap_or(Grant::Rejected);
                let confirmed = self.registry.confirm_grant(token, grant).is_some();
                let result = match granted {
                    Some(qos) if confirmed => Ok(qos),
                    Some(_) => {
                        debug!("Grant for '{}' arrived after the request was withdrawn", filter);
                        Err(SessionError::SubscriptionWithdrawn { filter })
                    }
                    None => {
                        self.emit(SessionEvent::SubscriptionRejected {
                            filter: filter.clone(),
                        });
                        Err(SessionError::SubscriptionRejected { filter })
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Some(other) => {
                warn!("Subscribe acknowledgment for non-subscribe packet {}", packet_id);
                other.fail(SessionError::ConnectionLost(
                    "mismatched acknowledgment".to_string(),
                ));
            }
            None => debug!("Subscribe acknowledgment for unknown packet {}", packet_id),
        }
    }

    fn handle_unsuback(&self, packet_id: u16) {
        let request = self.requests.lock().remove(&packet_id);
        self.inflight.lock().release_request_id(packet_id);

        match request {
            Some(PendingRequest::Unsubscribe { filter, reply }) => {
                debug!("Unsubscribe from '{}' acknowledged", filter);
                let _ = reply.send(Ok(()));
            }
            Some(other) => {
                warn!(
                    "Unsubscribe acknowledgment for non-unsubscribe packet {}",
                    packet_id
                );
                other.fail(SessionError::ConnectionLost(
                    "mismatched acknowledgment".to_string(),
                ));
            }
            None => debug!("Unsubscribe acknowledgment for unknown packet {}", packet_id),
        }
    }

    async fn run_retransmitter(
        &self,
        writer: mpsc::Sender<OutboundCommand>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        let period = (self.config.retry_interval() / 4).max(MIN_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let actions = self.inflight.lock().expire(Instant::now());
            for action in actions {
                match action {
                    RetryAction::Retransmit(command) => send(&writer, command).await?,
                    RetryAction::Abandoned {
                        packet_id,
                        topic,
                        attempts,
                    } => self.emit(SessionEvent::DeliveryFailed {
                        packet_id,
                        topic,
                        attempts,
                    }),
                }
            }
        }
    }
}

impl ConnectionHandle {
    /// Stops every task of this connection
    pub(crate) fn abort(self) {
        self.shutdown.cancel();
        debug!(
            "Connection {} stopped ({} tasks)",
            self.generation,
            self.tasks.len() + usize::from(self.writer_task.is_some())
        );
    }
}

async fn send(
    writer: &mpsc::Sender<OutboundCommand>,
    command: OutboundCommand,
) -> Result<(), SessionError> {
    writer
        .send(command)
        .await
        .map_err(|_| SessionError::ConnectionLost("writer closed".to_string()))
}

async fn run_writer(
    mut commands: mpsc::Receiver<OutboundCommand>,
    transport: mpsc::Sender<OutboundCommand>,
    activity: Arc<Activity>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    debug!("Writer started");
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => command,
        };
        let Some(command) = command else { break };

        let is_disconnect = command == OutboundCommand::Disconnect;
        debug!("Writing {}", command.name());
        transport
            .send(command)
            .await
            .map_err(|_| "transport rejected write".to_string())?;
        activity.touch();

        if is_disconnect {
            debug!("Disconnect written, writer finished");
            break;
        }
    }
    Ok(())
}

async fn run_keepalive(
    writer: mpsc::Sender<OutboundCommand>,
    activity: Arc<Activity>,
    keep_alive: Duration,
    grace: Duration,
    shutdown: CancellationToken,
) -> Result<(), String> {
    debug!("Keepalive started with {}ms interval", keep_alive.as_millis());
    loop {
        let idle = activity.idle();
        if idle < keep_alive {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(keep_alive - idle) => continue,
            }
        }

        // Only a response arriving after this point answers the request
        let pong = activity.pong.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        debug!("Idle for {}ms, sending liveness request", idle.as_millis());
        if writer.send(OutboundCommand::PingReq).await.is_err() {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = &mut pong => {}
            _ = tokio::time::sleep(grace) => {
                return Err(format!(
                    "no liveness response within {}ms",
                    grace.as_millis()
                ));
            }
        }
    }
}
