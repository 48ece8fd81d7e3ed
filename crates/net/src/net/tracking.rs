use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::{ACK_HISTORY_BITS, INVALID_ACK, sequence_distance};

const RTT_BLEND: f32 = 0.2;

/// A sent packet awaiting acknowledgement, with the reliable ids it carried.
#[derive(Debug, Clone)]
pub struct PacketTracker {
    pub ack: u16,
    pub sent_at: Instant,
    pub reliable_ids: Vec<u16>,
}

/// Whether `ack` is covered by a peer's `(last_received_ack, history)` pair.
pub fn is_ack_confirmed(ack: u16, last_received_ack: u16, history: u16) -> bool {
    if last_received_ack == INVALID_ACK {
        return false;
    }
    if ack == last_received_ack {
        return true;
    }
    let back = last_received_ack.wrapping_sub(ack);
    (1..=ACK_HISTORY_BITS).contains(&back) && history & (1 << (back - 1)) != 0
}

#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PacketTracker>,
    max_pending: usize,
    rtt: Duration,
    confirmed: u64,
    lost: u64,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending: max_pending.max(1),
            rtt: Duration::ZERO,
            confirmed: 0,
            lost: 0,
        }
    }

    /// Starts tracking a packet. Trackers evicted to stay under the limit
    /// are counted as lost.
    pub fn track(&mut self, tracker: PacketTracker) {
        while self.pending.len() >= self.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                log::trace!("Packet {} never acknowledged", evicted.ack);
                self.lost += 1;
            }
        }
        self.pending.push_back(tracker);
    }

    /// Removes every tracker the peer confirmed and returns their reliable ids.
    pub fn process_ack(&mut self, last_received_ack: u16, history: u16, now: Instant) -> Vec<u16> {
        let mut confirmed_ids = Vec::new();
        let mut samples = Vec::new();

        let mut i = 0;
        while i < self.pending.len() {
            if is_ack_confirmed(self.pending[i].ack, last_received_ack, history) {
                if let Some(tracker) = self.pending.remove(i) {
                    samples.push(now.saturating_duration_since(tracker.sent_at));
                    confirmed_ids.extend(tracker.reliable_ids);
                    self.confirmed += 1;
                }
            } else {
                i += 1;
            }
        }

        for sample in samples {
            self.update_rtt(sample);
        }

        confirmed_ids
    }

    fn update_rtt(&mut self, sample: Duration) {
        self.rtt = self.rtt.mul_f32(1.0 - RTT_BLEND) + sample.mul_f32(RTT_BLEND);
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn loss_ratio(&self) -> f32 {
        let total = self.confirmed + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f32 / total as f32
        }
    }
}

/// Receive-side ack history: the newest ack seen plus a 16-bit window of
/// the acks before it.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveTracker {
    last_received: u16,
    history: u16,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: INVALID_ACK,
            history: 0,
        }
    }

    pub fn record_received(&mut self, ack: u16) {
        if ack == INVALID_ACK {
            return;
        }
        if self.last_received == INVALID_ACK {
            self.last_received = ack;
            self.history = 0;
            return;
        }

        let distance = sequence_distance(ack, self.last_received);
        if distance > 0 {
            let shift = distance as u32;
            self.history = if shift > ACK_HISTORY_BITS as u32 {
                0
            } else {
                (((self.history as u32) << shift) | (1 << (shift - 1))) as u16
            };
            self.last_received = ack;
        } else if distance < 0 {
            let back = distance.unsigned_abs();
            if back <= ACK_HISTORY_BITS {
                self.history |= 1 << (back - 1);
            }
        }
    }

    pub fn ack_data(&self) -> (u16, u16) {
        (self.last_received, self.history)
    }
}
