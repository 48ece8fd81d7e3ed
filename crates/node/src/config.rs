use std::time::Duration;

use netplay::NetConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub net: NetConfig,
    pub display_name: String,
    pub run_time: Duration,
    pub chat_interval: Duration,
    pub beacon_radius: f32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            display_name: String::from("player"),
            run_time: Duration::from_secs(30),
            chat_interval: Duration::from_secs(2),
            beacon_radius: 4.0,
        }
    }
}
