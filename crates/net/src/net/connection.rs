use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::config::NetConfig;
use super::error::PacketError;
use super::message::{MessageOptions, WireMessage};
use super::packet::{ReceivedPacket, WirePacket};
use super::protocol::{
    INVALID_ACK, INVALID_RELIABLE_ID, PACKET_HEADER_SIZE, PACKET_MTU, RELIABLE_RESEND_INTERVAL,
    next_sequence,
};
use super::simulator::{LatencyQueue, NetworkSimulation};
use super::stats::NetworkStats;
use super::tracking::{AckTracker, PacketTracker, ReceiveTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connected = 1,
    Ready = 2,
}

impl ConnectionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionState::Disconnected),
            1 => Some(ConnectionState::Connected),
            2 => Some(ConnectionState::Ready),
            _ => None,
        }
    }
}

/// Per-peer reliability engine.
///
/// Outgoing: queues unreliable and reliable messages, assigns reliable ids
/// on first send, resends unconfirmed reliables and tracks every sent
/// packet until the peer's ack history confirms it. Incoming: buffers
/// packets behind simulated latency, updates ack history, drops duplicate
/// reliables and releases in-order messages by reliable id.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    index: u8,
    display_id: String,
    state: ConnectionState,
    local: bool,
    marked_for_destroy: bool,
    simulation: NetworkSimulation,
    max_reliables_per_packet: usize,

    unsent_unreliables: VecDeque<WireMessage>,
    unsent_reliables: VecDeque<WireMessage>,
    unconfirmed_reliables: Vec<WireMessage>,
    next_reliable_id: u16,

    received_reliable_ids: HashSet<u16>,
    in_order_buffer: BTreeMap<u16, WireMessage>,
    next_expected_reliable_id: u16,

    next_ack: u16,
    receive_tracker: ReceiveTracker,
    ack_tracker: AckTracker,

    incoming: LatencyQueue<ReceivedPacket>,
    last_received_time: Instant,
    last_flush_time: Option<Instant>,
    stats: NetworkStats,
}

impl Connection {
    pub fn new(addr: SocketAddr, index: u8, config: &NetConfig, now: Instant) -> Self {
        Self {
            addr,
            index,
            display_id: String::new(),
            state: ConnectionState::Disconnected,
            local: false,
            marked_for_destroy: false,
            simulation: config.simulation,
            max_reliables_per_packet: config.max_reliables_per_packet.max(1),
            unsent_unreliables: VecDeque::new(),
            unsent_reliables: VecDeque::new(),
            unconfirmed_reliables: Vec::new(),
            next_reliable_id: 0,
            received_reliable_ids: HashSet::new(),
            in_order_buffer: BTreeMap::new(),
            next_expected_reliable_id: 0,
            next_ack: 0,
            receive_tracker: ReceiveTracker::new(),
            ack_tracker: AckTracker::new(config.max_tracked_packets),
            incoming: LatencyQueue::new(),
            last_received_time: now,
            last_flush_time: None,
            stats: NetworkStats::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: u8) {
        self.index = index;
    }

    pub fn display_id(&self) -> &str {
        &self.display_id
    }

    pub fn set_display_id(&mut self, display_id: impl Into<String>) {
        self.display_id = display_id.into();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!(
                "Connection {} ({}) {:?} -> {:?}",
                self.index,
                self.addr,
                self.state,
                state
            );
        }
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn set_local(&mut self, local: bool) {
        self.local = local;
    }

    pub fn mark_for_destroy(&mut self) {
        self.marked_for_destroy = true;
    }

    pub fn is_marked_for_destroy(&self) -> bool {
        self.marked_for_destroy
    }

    pub fn simulation(&self) -> NetworkSimulation {
        self.simulation
    }

    pub fn set_simulation(&mut self, simulation: NetworkSimulation) {
        self.simulation = simulation;
    }

    pub fn rtt(&self) -> Duration {
        self.ack_tracker.rtt()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn last_received_time(&self) -> Instant {
        self.last_received_time
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed_reliables.len()
    }

    pub fn queued_count(&self) -> usize {
        self.unsent_unreliables.len() + self.unsent_reliables.len()
    }

    pub fn in_flight_packets(&self) -> usize {
        self.ack_tracker.in_flight()
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received_time) > timeout
    }

    pub fn is_send_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_flush_time
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    /// Queues a message. Reliable messages get their id on first flush.
    pub fn send(&mut self, message: WireMessage) -> Result<(), PacketError> {
        if message.wire_size() > PACKET_MTU - PACKET_HEADER_SIZE {
            return Err(PacketError::MessageTooLarge(message.wire_size()));
        }
        if message.is_reliable() {
            self.unsent_reliables.push_back(message);
        } else {
            self.unsent_unreliables.push_back(message);
        }
        Ok(())
    }

    pub fn flush(&mut self, now: Instant, local_index: u8) -> Option<WirePacket> {
        self.flush_with(now, local_index, |_| {})
    }

    /// Builds at most one packet: due resends, then newly promoted reliables,
    /// then unreliables, then whatever `fill` adds. Returns `None` when the
    /// packet would carry no messages.
    pub fn flush_with<F>(&mut self, now: Instant, local_index: u8, fill: F) -> Option<WirePacket>
    where
        F: FnOnce(&mut WirePacket),
    {
        self.last_flush_time = Some(now);
        let mut packet = WirePacket::new(local_index);
        let mut reliable_ids = Vec::new();

        for message in &mut self.unconfirmed_reliables {
            if !message.needs_resend(now, RELIABLE_RESEND_INTERVAL) {
                continue;
            }
            if !packet.write_message(message) {
                break;
            }
            message.mark_sent(now);
            reliable_ids.push(message.reliable_id());
            self.stats.reliable_resends += 1;
        }

        let mut promoted = 0;
        while promoted < self.max_reliables_per_packet {
            let Some(mut message) = self.unsent_reliables.pop_front() else {
                break;
            };
            if !packet.can_fit(&message) {
                self.unsent_reliables.push_front(message);
                break;
            }
            if message.reliable_id() == INVALID_RELIABLE_ID {
                message.set_reliable_id(self.next_reliable_id);
                self.next_reliable_id = next_sequence(self.next_reliable_id);
            }
            packet.write_message(&message);
            message.mark_sent(now);
            reliable_ids.push(message.reliable_id());
            self.unconfirmed_reliables.push(message);
            promoted += 1;
        }

        while let Some(message) = self.unsent_unreliables.pop_front() {
            if !packet.write_message(&message) {
                self.unsent_unreliables.push_front(message);
                break;
            }
        }

        fill(&mut packet);

        if packet.is_empty() {
            return None;
        }

        let ack = self.next_ack;
        self.next_ack = next_sequence(ack);
        let (last_received_ack, history) = self.receive_tracker.ack_data();
        packet.finalize(ack, last_received_ack, history);

        self.ack_tracker.track(PacketTracker {
            ack,
            sent_at: now,
            reliable_ids,
        });
        self.stats.record_sent(packet.len());
        self.stats.packets_lost = self.ack_tracker.lost();

        Some(packet)
    }

    /// Accepts a parsed packet, applying simulated loss and latency.
    pub fn receive(&mut self, packet: ReceivedPacket, now: Instant) {
        self.stats.record_received(packet.size);
        if self.simulation.should_drop() {
            self.stats.packets_dropped += 1;
            log::trace!("Simulated loss of packet {} from {}", packet.header.ack, self.addr);
            return;
        }
        self.incoming.push(now + self.simulation.delay(), packet);
    }

    /// Releases every due packet and returns the messages ready for dispatch,
    /// in delivery order.
    pub fn process(&mut self, now: Instant) -> Vec<WireMessage> {
        let mut delivered = Vec::new();

        for packet in self.incoming.take_due(now) {
            self.last_received_time = now;

            let header = packet.header;
            if header.last_received_ack != INVALID_ACK {
                self.confirm_acks(
                    header.last_received_ack,
                    header.previous_received_ack_bitfield,
                    now,
                );
            }
            self.receive_tracker.record_received(header.ack);

            for message in packet.messages {
                self.accept_message(message, &mut delivered);
            }
        }

        delivered
    }

    fn confirm_acks(&mut self, last_received_ack: u16, history: u16, now: Instant) {
        let confirmed = self.ack_tracker.process_ack(last_received_ack, history, now);
        if !confirmed.is_empty() {
            let confirmed: HashSet<u16> = confirmed.into_iter().collect();
            self.unconfirmed_reliables
                .retain(|message| !confirmed.contains(&message.reliable_id()));
        }
        self.stats.packets_confirmed = self.ack_tracker.confirmed();
        self.stats.packets_lost = self.ack_tracker.lost();
        self.stats.packet_loss_percent = self.ack_tracker.loss_ratio() * 100.0;
        self.stats.rtt = self.ack_tracker.rtt();
    }

    fn accept_message(&mut self, message: WireMessage, delivered: &mut Vec<WireMessage>) {
        if message.options().contains(MessageOptions::HEARTBEAT) {
            self.stats.heartbeats_received += 1;
        }
        if !message.is_reliable() {
            delivered.push(message);
            return;
        }

        let reliable_id = message.reliable_id();
        if !self.received_reliable_ids.insert(reliable_id) {
            self.stats.duplicates_dropped += 1;
            log::trace!("Duplicate reliable {} from {}", reliable_id, self.addr);
            return;
        }

        if message.options().is_in_order() {
            self.in_order_buffer.insert(reliable_id, message);
        } else {
            delivered.push(message);
        }

        for _ in 0..u16::MAX {
            if !self
                .received_reliable_ids
                .contains(&self.next_expected_reliable_id)
            {
                break;
            }
            if let Some(ready) = self.in_order_buffer.remove(&self.next_expected_reliable_id) {
                delivered.push(ready);
            }
            self.next_expected_reliable_id = next_sequence(self.next_expected_reliable_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::MessageRegistry;

    fn registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register("state", MessageOptions::empty(), None, Some(0)).unwrap();
        registry.register("event", MessageOptions::RELIABLE, None, Some(1)).unwrap();
        registry
            .register("chat", MessageOptions::RELIABLE_IN_ORDER, None, Some(2))
            .unwrap();
        registry
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair(now: Instant) -> (Connection, Connection) {
        let config = NetConfig::default();
        (
            Connection::new(addr(5000), 1, &config, now),
            Connection::new(addr(5001), 0, &config, now),
        )
    }

    fn message(registry: &MessageRegistry, name: &str, value: u32) -> WireMessage {
        let mut message = WireMessage::new(registry.by_name(name).unwrap());
        message.payload_mut().write_u32(value);
        message
    }

    fn values(messages: Vec<WireMessage>) -> Vec<u32> {
        messages
            .into_iter()
            .map(|mut m| m.payload_mut().read_u32().unwrap())
            .collect()
    }

    fn deliver(bytes: &[u8], to: &mut Connection, registry: &MessageRegistry, now: Instant) {
        let packet = WirePacket::parse(bytes, addr(5000), registry).unwrap();
        to.receive(packet, now);
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let now = Instant::now();
        let (mut sender, _) = pair(now);
        assert!(sender.flush(now, 0).is_none());
        assert_eq!(sender.in_flight_packets(), 0);
    }

    #[test]
    fn test_in_order_release_after_gap() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, mut receiver) = pair(now);

        sender.send(message(&registry, "chat", 1)).unwrap();
        let first = sender.flush(now, 0).unwrap();
        sender.send(message(&registry, "chat", 2)).unwrap();
        let second = sender.flush(now, 0).unwrap();

        deliver(second.as_bytes(), &mut receiver, &registry, now);
        assert!(receiver.process(now).is_empty());

        deliver(first.as_bytes(), &mut receiver, &registry, now);
        assert_eq!(values(receiver.process(now)), vec![1, 2]);
    }

    #[test]
    fn test_in_order_permutation_with_duplicates() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, mut receiver) = pair(now);

        let packets: Vec<Vec<u8>> = (0..5)
            .map(|value| {
                sender.send(message(&registry, "chat", value)).unwrap();
                sender.flush(now, 0).unwrap().as_bytes().to_vec()
            })
            .collect();

        let mut delivered = Vec::new();
        for position in [3, 1, 1, 4, 0, 2, 3, 0] {
            deliver(&packets[position], &mut receiver, &registry, now);
            delivered.extend(values(receiver.process(now)));
        }

        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
        assert_eq!(receiver.stats().duplicates_dropped, 3);
    }

    #[test]
    fn test_unordered_reliable_dispatched_once() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, mut receiver) = pair(now);

        sender.send(message(&registry, "event", 7)).unwrap();
        let packet = sender.flush(now, 0).unwrap();

        for _ in 0..3 {
            deliver(packet.as_bytes(), &mut receiver, &registry, now);
        }
        assert_eq!(values(receiver.process(now)), vec![7]);
    }

    #[test]
    fn test_unreliable_duplicates_dispatched_each_time() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, mut receiver) = pair(now);

        sender.send(message(&registry, "state", 9)).unwrap();
        let packet = sender.flush(now, 0).unwrap();

        deliver(packet.as_bytes(), &mut receiver, &registry, now);
        deliver(packet.as_bytes(), &mut receiver, &registry, now);
        assert_eq!(values(receiver.process(now)), vec![9, 9]);
    }

    #[test]
    fn test_reliable_resent_after_interval() {
        let registry = registry();
        let t0 = Instant::now();
        let (mut sender, _) = pair(t0);

        sender.send(message(&registry, "event", 3)).unwrap();
        let lost = sender.flush(t0, 0).unwrap();
        let original = WirePacket::parse(lost.as_bytes(), addr(5000), &registry).unwrap();
        let original_id = original.messages[0].reliable_id();

        assert!(sender.flush(t0 + Duration::from_millis(50), 0).is_none());

        let resent = sender.flush(t0 + Duration::from_millis(150), 0).unwrap();
        let resent = WirePacket::parse(resent.as_bytes(), addr(5000), &registry).unwrap();
        assert_eq!(resent.messages.len(), 1);
        assert_eq!(resent.messages[0].reliable_id(), original_id);
        assert_ne!(resent.header.ack, original.header.ack);
        assert_eq!(sender.stats().reliable_resends, 1);
    }

    #[test]
    fn test_ack_confirms_reliable() {
        let registry = registry();
        let t0 = Instant::now();
        let (mut sender, mut receiver) = pair(t0);

        sender.send(message(&registry, "event", 1)).unwrap();
        let packet = sender.flush(t0, 0).unwrap();
        assert_eq!(sender.unconfirmed_count(), 1);

        deliver(packet.as_bytes(), &mut receiver, &registry, t0);
        receiver.process(t0);

        receiver.send(message(&registry, "state", 0)).unwrap();
        let reply = receiver.flush(t0, 1).unwrap();
        assert_eq!(reply.header().last_received_ack, packet.header().ack);

        let t1 = t0 + Duration::from_millis(20);
        deliver(reply.as_bytes(), &mut sender, &registry, t1);
        sender.process(t1);

        assert_eq!(sender.unconfirmed_count(), 0);
        assert!(sender.rtt() > Duration::ZERO);
        assert!(sender.flush(t1 + Duration::from_millis(500), 0).is_none());
    }

    #[test]
    fn test_reliable_promotion_capped_per_packet() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, _) = pair(now);

        for value in 0..40 {
            sender.send(message(&registry, "event", value)).unwrap();
        }
        let first = sender.flush(now, 0).unwrap();
        assert_eq!(first.message_count(), 32);
        let second = sender.flush(now, 0).unwrap();
        assert_eq!(second.message_count(), 8);
        assert_eq!(sender.unconfirmed_count(), 40);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, mut receiver) = pair(now);
        receiver.set_simulation(NetworkSimulation::new(1.0, Duration::ZERO, Duration::ZERO));

        for value in 0..10 {
            sender.send(message(&registry, "state", value)).unwrap();
            let packet = sender.flush(now, 0).unwrap();
            deliver(packet.as_bytes(), &mut receiver, &registry, now);
        }
        assert!(receiver.process(now).is_empty());
        assert_eq!(receiver.stats().packets_dropped, 10);
    }

    #[test]
    fn test_simulated_latency_holds_packets() {
        let registry = registry();
        let t0 = Instant::now();
        let (mut sender, mut receiver) = pair(t0);
        let latency = Duration::from_millis(100);
        receiver.set_simulation(NetworkSimulation::new(0.0, latency, latency));

        sender.send(message(&registry, "state", 5)).unwrap();
        let packet = sender.flush(t0, 0).unwrap();
        deliver(packet.as_bytes(), &mut receiver, &registry, t0);

        assert!(receiver.process(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(values(receiver.process(t0 + latency)), vec![5]);
    }

    #[test]
    fn test_tracker_overflow_counts_loss() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, _) = pair(now);

        for value in 0..301 {
            sender.send(message(&registry, "state", value)).unwrap();
            sender.flush(now, 0).unwrap();
        }
        assert_eq!(sender.in_flight_packets(), 300);
        assert_eq!(sender.stats().packets_lost, 1);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let registry = registry();
        let now = Instant::now();
        let (mut sender, _) = pair(now);

        let mut huge = WireMessage::new(registry.by_name("state").unwrap());
        huge.payload_mut().write_bytes(&vec![0u8; PACKET_MTU]);
        assert!(matches!(sender.send(huge), Err(PacketError::MessageTooLarge(_))));
    }

    #[test]
    fn test_timeout_and_send_due() {
        let now = Instant::now();
        let (mut sender, _) = pair(now);
        let timeout = Duration::from_secs(10);

        assert!(!sender.is_timed_out(now + Duration::from_secs(5), timeout));
        assert!(sender.is_timed_out(now + Duration::from_secs(11), timeout));

        let interval = Duration::from_millis(16);
        assert!(sender.is_send_due(now, interval));
        sender.flush(now, 0);
        assert!(!sender.is_send_due(now + Duration::from_millis(10), interval));
        assert!(sender.is_send_due(now + Duration::from_millis(16), interval));
    }
}
