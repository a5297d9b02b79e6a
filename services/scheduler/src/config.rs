use std::time::Duration;

use anyhow::{bail, Result};

use crate::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Discovery agent URL.
    pub discoverd_url: String,
    pub controller_url: String,
    pub controller_key: Option<String>,
    /// Basic-auth key for host APIs.
    pub auth_key: Option<String>,
    /// Address registered for leader election. No election when unset.
    pub scheduler_addr: Option<String>,
    pub host_grace: Duration,
    pub log_level: String,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let discoverd_url =
            std::env::var("DISCOVERD").unwrap_or_else(|_| "http://127.0.0.1:1111".to_string());

        let cluster_domain =
            std::env::var("CLUSTER_DOMAIN").unwrap_or_else(|_| "tug.local".to_string());
        let controller_url = std::env::var("CONTROLLER_URL")
            .unwrap_or_else(|_| format!("http://controller.{cluster_domain}"));
        let controller_key = std::env::var("CONTROLLER_KEY").ok().filter(|k| !k.is_empty());
        let auth_key = std::env::var("AUTH_KEY").ok().filter(|k| !k.is_empty());

        let external_ip = std::env::var("EXTERNAL_IP").ok().filter(|ip| !ip.is_empty());
        // ":port" addresses take this host's external IP when known; otherwise
        // the discovery agent resolves them.
        let scheduler_addr = std::env::var("SCHEDULER_ADDR")
            .ok()
            .filter(|a| !a.is_empty())
            .map(|addr| match (addr.strip_prefix(':'), &external_ip) {
                (Some(port), Some(ip)) => format!("{ip}:{port}"),
                _ => addr,
            });

        let anti_entropy_secs: u64 = std::env::var("SCHEDULER_ANTI_ENTROPY_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()?;

        let host_grace_secs: u64 = std::env::var("SCHEDULER_HOST_GRACE_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let crash_threshold: f64 = std::env::var("SCHEDULER_CRASH_THRESHOLD")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        if crash_threshold <= 0.0 {
            bail!("SCHEDULER_CRASH_THRESHOLD must be positive");
        }

        let log_level = std::env::var("SCHEDULER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            discoverd_url,
            controller_url,
            controller_key,
            auth_key,
            scheduler_addr,
            host_grace: Duration::from_secs(host_grace_secs),
            log_level,
            scheduler: SchedulerConfig {
                sync_interval: Duration::from_secs(anti_entropy_secs.max(1)),
                crash_threshold,
                ..SchedulerConfig::default()
            },
        })
    }
}
