use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

use crate::AgentConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub agent: AgentConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DISCOVERD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:1111".to_string())
            .parse()?;

        let log_level = std::env::var("DISCOVERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let heartbeat_secs: u64 = std::env::var("DISCOVERD_HEARTBEAT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?;

        let grace_secs: u64 = std::env::var("DISCOVERD_GRACE_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()?;

        let external_ip = std::env::var("EXTERNAL_IP").ok().filter(|ip| !ip.is_empty());

        Ok(Self {
            listen_addr,
            log_level,
            agent: AgentConfig {
                heartbeat: Duration::from_secs(heartbeat_secs),
                grace: Duration::from_secs(grace_secs),
                external_ip,
            },
        })
    }
}
