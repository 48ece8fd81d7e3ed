use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_lost: u64,
    pub packets_confirmed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reliable_resends: u64,
    pub duplicates_dropped: u64,
    pub heartbeats_received: u64,
    pub rtt: Duration,
    pub packet_loss_percent: f32,
}

impl NetworkStats {
    pub fn rtt_ms(&self) -> f32 {
        self.rtt.as_secs_f32() * 1000.0
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }
}
