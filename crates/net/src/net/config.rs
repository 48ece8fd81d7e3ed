use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::INVALID_CONNECTION_INDEX;
use super::simulator::NetworkSimulation;

pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
pub const DEFAULT_SEND_RATE: f32 = 60.0;
pub const DEFAULT_HEARTBEAT_RATE: f32 = 2.0;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT_RANGE: u16 = 8;
pub const DEFAULT_MAX_RELIABLES_PER_PACKET: usize = 32;
pub const DEFAULT_MAX_TRACKED_PACKETS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub bind_ip: IpAddr,
    /// Consecutive ports tried when the requested one is taken.
    pub port_range: u16,
    pub max_connections: usize,
    pub send_rate: f32,
    pub heartbeat_rate: f32,
    pub connection_timeout: Duration,
    pub join_retry_interval: Duration,
    pub join_timeout: Duration,
    pub max_reliables_per_packet: usize,
    pub max_tracked_packets: usize,
    pub simulation: NetworkSimulation,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: DEFAULT_PORT_RANGE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            send_rate: DEFAULT_SEND_RATE,
            heartbeat_rate: DEFAULT_HEARTBEAT_RATE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            join_retry_interval: DEFAULT_JOIN_RETRY_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            max_reliables_per_packet: DEFAULT_MAX_RELIABLES_PER_PACKET,
            max_tracked_packets: DEFAULT_MAX_TRACKED_PACKETS,
            simulation: NetworkSimulation::default(),
        }
    }
}

impl NetConfig {
    pub fn send_interval(&self) -> Duration {
        rate_to_interval(self.send_rate)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        rate_to_interval(self.heartbeat_rate)
    }

    /// Table size, clamped so every slot has a valid 8-bit index.
    pub fn connection_slots(&self) -> usize {
        self.max_connections
            .clamp(1, INVALID_CONNECTION_INDEX as usize)
    }
}

fn rate_to_interval(rate: f32) -> Duration {
    if rate <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / f64::from(rate))
    }
}
