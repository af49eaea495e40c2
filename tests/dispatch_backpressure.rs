mod common;

use broker_session::{
    InboundEvent, InboundPublish, Message, OutboundCommand, QoS, SessionConfig, SessionEvent,
    SessionState,
};
use common::*;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Records the payload, then blocks until released
fn gated_handler() -> (
    impl Fn(Message) + Send + Sync + 'static,
    Arc<Mutex<Vec<String>>>,
    mpsc::Sender<()>,
) {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = move |message: Message| {
        sink.lock()
            .unwrap()
            .push(message.payload_str().unwrap_or_default().to_string());
        let _ = release_rx.lock().unwrap().recv();
    };
    (handler, seen, release_tx)
}

fn numbered(packet_id: u16) -> InboundEvent {
    InboundEvent::Publish(
        InboundPublish::new("line/1", packet_id.to_string(), QoS::AtLeastOnce)
            .with_packet_id(packet_id),
    )
}

#[tokio::test]
async fn full_queue_blocks_reader_without_dropping() {
    let mut h = Harness::new(SessionConfig {
        work_queue_capacity: 2,
        worker_count: 1,
        dispatch_timeout_ms: 5_000,
        ..test_config()
    });
    let mut peer = h.connect().await;
    let (handler, seen, release) = gated_handler();
    h.subscribe(
        &mut peer,
        "line/+",
        QoS::AtLeastOnce,
        Some(QoS::AtLeastOnce),
        handler,
    )
    .await
    .unwrap();

    for packet_id in 1..=3 {
        peer.send(numbered(packet_id)).await.unwrap();
    }
    assert_eq!(
        peer.next_non_ping(WAIT).await,
        Some(OutboundCommand::PubAck { packet_id: 1 })
    );
    assert_eq!(
        peer.next_non_ping(WAIT).await,
        Some(OutboundCommand::PubAck { packet_id: 2 })
    );

    // third enqueue waits for a free slot
    assert_eq!(peer.next_non_ping(Duration::from_millis(200)).await, None);
    assert_eq!(h.client.pending_dispatch(), 2);
    assert_eq!(*seen.lock().unwrap(), vec!["1".to_string()]);
    assert_eq!(h.client.state(), SessionState::Connected);

    drop(release);
    assert_eq!(
        peer.next_non_ping(WAIT).await,
        Some(OutboundCommand::PubAck { packet_id: 3 })
    );
    assert!(wait_until(|| seen.lock().unwrap().len() == 3).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["1".to_string(), "2".to_string(), "3".to_string()]
    );
}

#[tokio::test]
async fn stuck_handler_overloads_session() {
    let mut h = Harness::new(SessionConfig {
        work_queue_capacity: 1,
        worker_count: 1,
        dispatch_timeout_ms: 100,
        ..test_config()
    });
    let mut peer = h.connect().await;
    let (handler, _seen, release) = gated_handler();
    h.subscribe(
        &mut peer,
        "line/+",
        QoS::AtLeastOnce,
        Some(QoS::AtLeastOnce),
        handler,
    )
    .await
    .unwrap();

    peer.send(numbered(1)).await.unwrap();
    peer.send(numbered(2)).await.unwrap();

    expect_event(&mut h.events, |e| {
        matches!(e, SessionEvent::DispatchOverload { waited_ms: 100 })
    })
    .await;
    assert_eq!(h.client.state(), SessionState::Disconnected);
    assert!(h.client.subscriptions().is_empty());
    drop(release);
}

#[tokio::test]
async fn slow_handler_does_not_stall_acknowledgments() {
    let mut h = Harness::new(SessionConfig {
        work_queue_capacity: 8,
        worker_count: 2,
        ..test_config()
    });
    let mut peer = h.connect().await;
    let (handler, _seen, release) = gated_handler();
    h.subscribe(
        &mut peer,
        "line/+",
        QoS::AtLeastOnce,
        Some(QoS::AtLeastOnce),
        handler,
    )
    .await
    .unwrap();

    for packet_id in 1..=4 {
        peer.send(numbered(packet_id)).await.unwrap();
    }
    for packet_id in 1..=4 {
        assert_eq!(
            peer.next_non_ping(WAIT).await,
            Some(OutboundCommand::PubAck { packet_id })
        );
    }

    let publish = h
        .client
        .publish("line/ack", "ok", QoS::AtMostOnce, false)
        .await;
    assert!(publish.is_ok());
    drop(release);
}
