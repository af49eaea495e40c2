//! In-flight handshake tracking
//!
//! Outgoing QoS 1/2 publishes and incoming QoS 2 deliveries are kept here,
//! keyed by packet identifier, until their handshake completes.
//!
//! # Outgoing
//!
//! ```text
//! QoS 1:  Sent ──PUBACK──► done
//! QoS 2:  Sent ──PUBREC──► Released ──PUBCOMP──► done
//! ```
//!
//! Each phase has its own deadline. A missed deadline retransmits the phase's
//! packet (publishes with the duplicate marker) until `max_retries` is spent,
//! after which the entry is abandoned and reported.
//!
//! # Incoming QoS 2
//!
//! ```text
//! PUBLISH ──► Acked (deliver once, PUBREC) ──PUBREL──► done (PUBCOMP)
//! ```
//!
//! A repeated PUBLISH while `Acked` is answered again but not redelivered.

mod allocator;

pub use allocator::PacketIdAllocator;

use crate::error::SessionError;
use crate::protocol::{qos_level, OutboundCommand, OutgoingPublish, QoS};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Resolves the caller's [`PublishReceipt`](crate::session::PublishReceipt)
pub type CompletionSender = oneshot::Sender<Result<(), SessionError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

/// Handshake phase of an outgoing publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingPhase {
    /// Publish written, waiting for PUBACK (QoS 1) or PUBREC (QoS 2)
    Sent,
    /// PUBREL written, waiting for PUBCOMP
    Released,
}

/// Handshake phase of an incoming QoS 2 delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingPhase {
    Acked,
}

#[derive(Debug)]
pub struct OutgoingEntry {
    pub publish: OutgoingPublish,
    pub phase: OutgoingPhase,
    pub retries: u32,
    pub deadline: Instant,
    completion: Option<CompletionSender>,
}

impl OutgoingEntry {
    fn complete(mut self, result: Result<(), SessionError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }

    /// Packet to write for the current phase
    fn phase_command(&self, duplicate: bool) -> OutboundCommand {
        let packet_id = self.publish.packet_id.unwrap_or_default();
        match self.phase {
            OutgoingPhase::Sent => {
                let mut publish = self.publish.clone();
                publish.duplicate = duplicate;
                OutboundCommand::Publish(publish)
            }
            OutgoingPhase::Released => OutboundCommand::PubRel { packet_id },
        }
    }
}

#[derive(Debug)]
pub struct IncomingEntry {
    pub phase: IncomingPhase,
    pub received_at: Instant,
}

/// Result of feeding a peer acknowledgment into the table
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Handshake finished, entry removed
    Completed,
    /// QoS 2 moved to `Released`; the release step must be written
    Release(OutboundCommand),
    /// No entry in a phase that expects this acknowledgment
    Unexpected,
}

/// Kind of peer acknowledgment for an outgoing publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAck {
    PubAck,
    PubRec,
    PubComp,
}

/// What to do with an incoming QoS 2 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// First receipt: hand to handlers, then acknowledge
    Deliver,
    /// Repeat of an acknowledged packet: acknowledge again only
    Duplicate,
}

/// Work produced by a deadline sweep
#[derive(Debug)]
pub enum RetryAction {
    Retransmit(OutboundCommand),
    Abandoned {
        packet_id: u16,
        topic: String,
        attempts: u32,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InFlightCounts {
    pub outgoing: usize,
    pub incoming: usize,
    pub requests: usize,
}

pub struct InFlightTable {
    outgoing: HashMap<u16, OutgoingEntry>,
    incoming: HashMap<u16, IncomingEntry>,
    /// Ids held by subscribe/unsubscribe requests awaiting their acknowledgment
    requests: HashSet<u16>,
    allocator: PacketIdAllocator,
    policy: RetryPolicy,
}

impl InFlightTable {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            requests: HashSet::new(),
            allocator: PacketIdAllocator::new(),
            policy,
        }
    }

    fn allocate(&mut self) -> Result<u16, SessionError> {
        let outgoing = &self.outgoing;
        let requests = &self.requests;
        self.allocator
            .allocate(|id| outgoing.contains_key(&id) || requests.contains(&id))
            .ok_or(SessionError::PacketIdsExhausted)
    }

    /// Holds a packet id for a subscribe or unsubscribe request
    pub fn reserve_request_id(&mut self) -> Result<u16, SessionError> {
        let id = self.allocate()?;
        self.requests.insert(id);
        Ok(id)
    }

    pub fn release_request_id(&mut self, packet_id: u16) -> bool {
        self.requests.remove(&packet_id)
    }

    /// Registers a QoS 1/2 publish, assigning its packet id.
    ///
    /// Returns the publish command to write.
    pub fn track_publish(
        &mut self,
        mut publish: OutgoingPublish,
        completion: Option<CompletionSender>,
        now: Instant,
    ) -> Result<OutboundCommand, SessionError> {
        debug_assert!(qos_level(publish.qos) > 0);
        let packet_id = self.allocate()?;
        publish.packet_id = Some(packet_id);
        publish.duplicate = false;

        let entry = OutgoingEntry {
            publish,
            phase: OutgoingPhase::Sent,
            retries: 0,
            deadline: now + self.policy.interval,
            completion,
        };
        let command = entry.phase_command(false);
        debug!("Tracking outgoing publish {}", packet_id);
        self.outgoing.insert(packet_id, entry);
        Ok(command)
    }

    pub fn acknowledge(&mut self, packet_id: u16, ack: PeerAck, now: Instant) -> AckOutcome {
        let Some(entry) = self.outgoing.get_mut(&packet_id) else {
            return AckOutcome::Unexpected;
        };

        match (ack, entry.publish.qos, entry.phase) {
            (PeerAck::PubAck, QoS::AtLeastOnce, OutgoingPhase::Sent)
            | (PeerAck::PubComp, QoS::ExactlyOnce, OutgoingPhase::Released) => {
                if let Some(entry) = self.outgoing.remove(&packet_id) {
                    debug!("Outgoing publish {} completed", packet_id);
                    entry.complete(Ok(()));
                }
                AckOutcome::Completed
            }
            (PeerAck::PubRec, QoS::ExactlyOnce, OutgoingPhase::Sent) => {
                entry.phase = OutgoingPhase::Released;
                entry.retries = 0;
                entry.deadline = now + self.policy.interval;
                debug!("Outgoing publish {} received, releasing", packet_id);
                AckOutcome::Release(entry.phase_command(false))
            }
            // Peer repeated PUBREC after we released: release again
            (PeerAck::PubRec, QoS::ExactlyOnce, OutgoingPhase::Released) => {
                AckOutcome::Release(entry.phase_command(false))
            }
            _ => AckOutcome::Unexpected,
        }
    }

    /// Records an incoming QoS 2 publish
    pub fn record_delivery(&mut self, packet_id: u16, now: Instant) -> DeliveryDecision {
        if self.incoming.contains_key(&packet_id) {
            debug!("Duplicate delivery {}, acknowledging again", packet_id);
            return DeliveryDecision::Duplicate;
        }
        self.incoming.insert(
            packet_id,
            IncomingEntry {
                phase: IncomingPhase::Acked,
                received_at: now,
            },
        );
        DeliveryDecision::Deliver
    }

    /// Completes an incoming QoS 2 delivery on the peer's release
    pub fn release_delivery(&mut self, packet_id: u16) -> bool {
        self.incoming.remove(&packet_id).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outgoing.values().map(|e| e.deadline).min()
    }

    /// Retransmits or abandons every outgoing entry whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<RetryAction> {
        let expired: Vec<u16> = self
            .outgoing
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut actions = Vec::with_capacity(expired.len());
        for packet_id in expired {
            let Some(entry) = self.outgoing.get_mut(&packet_id) else {
                continue;
            };

            if entry.retries >= self.policy.max_retries {
                if let Some(entry) = self.outgoing.remove(&packet_id) {
                    let attempts = entry.retries + 1;
                    let topic = entry.publish.topic.clone();
                    warn!(
                        "Giving up on packet {} ('{}') after {} attempts",
                        packet_id, topic, attempts
                    );
                    entry.complete(Err(SessionError::DeliveryFailed {
                        packet_id,
                        topic: topic.clone(),
                        attempts,
                    }));
                    actions.push(RetryAction::Abandoned {
                        packet_id,
                        topic,
                        attempts,
                    });
                }
                continue;
            }

            entry.retries += 1;
            entry.deadline = now + self.policy.interval;
            warn!(
                "Retransmitting packet {} ({:?}), retry {}/{}",
                packet_id, entry.phase, entry.retries, self.policy.max_retries
            );
            actions.push(RetryAction::Retransmit(entry.phase_command(true)));
        }
        actions
    }

    /// Commands to resume every outgoing handshake on a new connection
    pub fn resume(&mut self, now: Instant) -> Vec<OutboundCommand> {
        let mut ids: Vec<u16> = self.outgoing.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.outgoing.get_mut(&id)?;
                entry.deadline = now + self.policy.interval;
                Some(entry.phase_command(true))
            })
            .collect()
    }

    /// Drops everything, failing outstanding publishes with `SessionDiscarded`
    pub fn clear(&mut self) {
        for (packet_id, entry) in self.outgoing.drain() {
            entry.complete(Err(SessionError::SessionDiscarded { packet_id }));
        }
        self.incoming.clear();
        self.requests.clear();
    }

    /// Drops request reservations; those requests fail with the connection
    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Forgets an outgoing entry whose publish never reached the writer
    pub fn remove_outgoing(&mut self, packet_id: u16) -> bool {
        self.outgoing.remove(&packet_id).is_some()
    }

    pub fn contains_outgoing(&self, packet_id: u16) -> bool {
        self.outgoing.contains_key(&packet_id)
    }

    pub fn outgoing_phase(&self, packet_id: u16) -> Option<OutgoingPhase> {
        self.outgoing.get(&packet_id).map(|e| e.phase)
    }

    pub fn contains_incoming(&self, packet_id: u16) -> bool {
        self.incoming.contains_key(&packet_id)
    }

    pub fn counts(&self) -> InFlightCounts {
        InFlightCounts {
            outgoing: self.outgoing.len(),
            incoming: self.incoming.len(),
            requests: self.requests.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(100),
            max_retries: 2,
        }
    }

    fn publish(qos: QoS) -> OutgoingPublish {
        OutgoingPublish {
            packet_id: None,
            topic: "sensor/room1/temp".to_string(),
            payload: b"21.5".to_vec(),
            qos,
            retain: false,
            duplicate: false,
        }
    }

    fn packet_id(command: &OutboundCommand) -> u16 {
        match command {
            OutboundCommand::Publish(p) => p.packet_id.unwrap(),
            other => panic!("expected publish, got {:?}", other),
        }
    }

    #[test]
    fn qos1_completes_on_puback() {
        let mut table = InFlightTable::new(policy());
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        let command = table
            .track_publish(publish(QoS::AtLeastOnce), Some(tx), now)
            .unwrap();
        let id = packet_id(&command);

        assert_eq!(table.acknowledge(id, PeerAck::PubRec, now), AckOutcome::Unexpected);
        assert_eq!(table.acknowledge(id, PeerAck::PubAck, now), AckOutcome::Completed);
        assert!(!table.contains_outgoing(id));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn qos2_walks_both_phases() {
        let mut table = InFlightTable::new(policy());
        let now = Instant::now();
        let id = packet_id(
            &table
                .track_publish(publish(QoS::ExactlyOnce), None, now)
                .unwrap(),
        );

        assert_eq!(
            table.acknowledge(id, PeerAck::PubRec, now),
            AckOutcome::Release(OutboundCommand::PubRel { packet_id: id })
        );
        assert_eq!(table.outgoing_phase(id), Some(OutgoingPhase::Released));
        assert_eq!(table.acknowledge(id, PeerAck::PubAck, now), AckOutcome::Unexpected);
        assert_eq!(table.acknowledge(id, PeerAck::PubComp, now), AckOutcome::Completed);
        assert_eq!(table.counts().outgoing, 0);
    }

    #[test]
    fn retries_then_abandons_once() {
        let mut table = InFlightTable::new(policy());
        let (tx, mut rx) = oneshot::channel();
        let start = Instant::now();
        let id = packet_id(
            &table
                .track_publish(publish(QoS::AtLeastOnce), Some(tx), start)
                .unwrap(),
        );

        assert!(table.expire(start).is_empty());

        let mut now = start;
        for retry in 1..=2 {
            now += Duration::from_millis(100);
            let actions = table.expire(now);
            assert_eq!(actions.len(), 1, "retry {retry}");
            match &actions[0] {
                RetryAction::Retransmit(OutboundCommand::Publish(p)) => {
                    assert!(p.duplicate);
                    assert_eq!(p.packet_id, Some(id));
                }
                other => panic!("unexpected action {:?}", other),
            }
        }

        now += Duration::from_millis(100);
        let actions = table.expire(now);
        assert!(matches!(
            actions.as_slice(),
            [RetryAction::Abandoned { attempts: 3, .. }]
        ));
        assert!(!table.contains_outgoing(id));
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(SessionError::DeliveryFailed { attempts: 3, .. }))
        ));

        now += Duration::from_millis(100);
        assert!(table.expire(now).is_empty());
    }

    #[test]
    fn released_phase_retransmits_pubrel() {
        let mut table = InFlightTable::new(policy());
        let now = Instant::now();
        let id = packet_id(
            &table
                .track_publish(publish(QoS::ExactlyOnce), None, now)
                .unwrap(),
        );
        table.acknowledge(id, PeerAck::PubRec, now);

        let actions = table.expire(now + Duration::from_millis(100));
        assert!(matches!(
            actions.as_slice(),
            [RetryAction::Retransmit(OutboundCommand::PubRel { packet_id })] if *packet_id == id
        ));
    }

    #[test]
    fn incoming_duplicate_not_redelivered() {
        let mut table = InFlightTable::new(policy());
        let now = Instant::now();
        assert_eq!(table.record_delivery(9, now), DeliveryDecision::Deliver);
        assert_eq!(table.record_delivery(9, now), DeliveryDecision::Duplicate);
        assert!(table.release_delivery(9));
        assert!(!table.release_delivery(9));
        assert_eq!(table.record_delivery(9, now), DeliveryDecision::Deliver);
    }

    #[test]
    fn ids_unique_across_publishes_and_requests() {
        let mut table = InFlightTable::new(policy());
        let now = Instant::now();
        let request = table.reserve_request_id().unwrap();
        let publish_id = packet_id(
            &table
                .track_publish(publish(QoS::AtLeastOnce), None, now)
                .unwrap(),
        );
        assert_ne!(request, publish_id);
        assert_eq!(table.counts().requests, 1);
        assert!(table.release_request_id(request));
    }

    #[test]
    fn clear_fails_outstanding_publishes() {
        let mut table = InFlightTable::new(policy());
        let (tx, mut rx) = oneshot::channel();
        table
            .track_publish(publish(QoS::ExactlyOnce), Some(tx), Instant::now())
            .unwrap();
        table.record_delivery(4, Instant::now());

        table.clear();
        assert_eq!(table.counts(), InFlightCounts::default());
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(SessionError::SessionDiscarded { .. }))
        ));
    }

    #[test]
    fn resume_marks_publishes_duplicate() {
        let mut table = InFlightTable::new(policy());
        let now = Instant::now();
        let first = packet_id(
            &table
                .track_publish(publish(QoS::AtLeastOnce), None, now)
                .unwrap(),
        );
        let second = packet_id(
            &table
                .track_publish(publish(QoS::ExactlyOnce), None, now)
                .unwrap(),
        );
        table.acknowledge(second, PeerAck::PubRec, now);

        let commands = table.resume(now);
        assert_eq!(commands.len(), 2);
        assert!(matches!(&commands[0], OutboundCommand::Publish(p) if p.duplicate && p.packet_id == Some(first)));
        assert_eq!(commands[1], OutboundCommand::PubRel { packet_id: second });
    }
}
