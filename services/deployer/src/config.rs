use std::net::SocketAddr;

use anyhow::{bail, Result};
use tug_queue::{DbConfig, WorkerConfig};

use crate::DeployerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub controller_url: String,
    pub controller_key: Option<String>,
    pub log_level: String,
    pub database: DbConfig,
    pub workers: WorkerConfig,
    pub deployer: DeployerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DEPLOYER_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8081".to_string())
            .parse()?;

        let cluster_domain =
            std::env::var("CLUSTER_DOMAIN").unwrap_or_else(|_| "tug.local".to_string());
        let controller_url = std::env::var("CONTROLLER_URL")
            .unwrap_or_else(|_| format!("http://controller.{cluster_domain}"));
        let controller_key = std::env::var("CONTROLLER_KEY").ok().filter(|k| !k.is_empty());

        let workers: usize = std::env::var("DEPLOYER_WORKERS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        if workers == 0 {
            bail!("DEPLOYER_WORKERS must be at least 1");
        }

        let database = DbConfig::from_env();
        // Each busy worker pins a connection for the life of its job.
        if database.max_connections as usize <= workers {
            bail!(
                "DB_MAX_CONNECTIONS ({}) must exceed DEPLOYER_WORKERS ({workers})",
                database.max_connections
            );
        }

        let log_level = std::env::var("DEPLOYER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            controller_url,
            controller_key,
            log_level,
            database,
            workers: WorkerConfig {
                workers,
                ..WorkerConfig::default()
            },
            deployer: DeployerConfig::default(),
        })
    }
}
