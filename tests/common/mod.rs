#![allow(dead_code)]

use broker_session::transport::loopback::{LoopbackAcceptor, LoopbackTransport, PeerLink};
use broker_session::{
    InboundEvent, Message, OutboundCommand, QoS, SessionClient, SessionConfig, SessionError,
    SessionEvent, SessionEvents,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_test_writer()
        .try_init();
}

/// Fast timers, no keepalive
pub fn test_config() -> SessionConfig {
    SessionConfig {
        client_id: "test-client".to_string(),
        keep_alive_ms: 0,
        retry_interval_ms: 50,
        max_retries: 2,
        handshake_timeout_ms: 500,
        dispatch_timeout_ms: 500,
        ..Default::default()
    }
}

pub struct Harness {
    pub client: SessionClient,
    pub events: SessionEvents,
    pub acceptor: LoopbackAcceptor,
    /// Shares the client's transport
    pub transport: LoopbackTransport,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        init_logging();
        let (transport, acceptor) = LoopbackTransport::new();
        let (client, events) = SessionClient::new(config, transport.clone()).expect("client");
        Self {
            client,
            events,
            acceptor,
            transport,
        }
    }

    /// Connects, answering the handshake as an accepting broker
    pub async fn connect(&mut self) -> PeerLink {
        let acceptor = &mut self.acceptor;
        let (result, peer) = tokio::join!(self.client.connect(), async move {
            let mut peer = acceptor.accept_timeout(WAIT).await.expect("no link opened");
            match peer.next_command(WAIT).await {
                Some(OutboundCommand::Connect { .. }) => {}
                other => panic!("expected connect, got {:?}", other),
            }
            peer.send(InboundEvent::ConnAck {
                session_present: false,
                return_code: 0,
            })
            .await
            .expect("peer send");
            peer
        });
        result.expect("connect");
        peer
    }

    /// Subscribes, answering with `granted`
    pub async fn subscribe(
        &self,
        peer: &mut PeerLink,
        filter: &str,
        qos: QoS,
        granted: Option<QoS>,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<QoS, SessionError> {
        let (result, _) = tokio::join!(self.client.subscribe(filter, qos, handler), async {
            match peer.next_non_ping(WAIT).await {
                Some(OutboundCommand::Subscribe { packet_id, .. }) => peer
                    .send(InboundEvent::SubAck { packet_id, granted })
                    .await
                    .expect("peer send"),
                other => panic!("expected subscribe, got {:?}", other),
            }
        });
        result
    }
}

pub fn recorder() -> (
    impl Fn(Message) + Send + Sync + 'static,
    Arc<Mutex<Vec<Message>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (move |message: Message| sink.lock().unwrap().push(message), seen)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Skips events until one satisfies `predicate`
pub async fn expect_event(
    events: &mut SessionEvents,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event stream closed"),
            Err(_) => panic!("expected event not observed"),
        }
    }
}

/// Events already queued, without waiting
pub fn drain_events(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
