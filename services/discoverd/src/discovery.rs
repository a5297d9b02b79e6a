//! The discovery capability and its wire records.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::DiscoveryError;

/// Instance attributes.
pub type Attrs = BTreeMap<String, String>;

/// An ordered stream of subscription events.
pub type Subscription = BoxStream<'static, Result<SubscribeEvent, DiscoveryError>>;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Default extra time an instance survives without a heartbeat.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// A change to one instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub service: String,
    pub addr: String,
    pub online: bool,
    #[serde(default)]
    pub attrs: Attrs,
    /// Store index at which the instance was first registered.
    pub created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscribeEvent {
    Update(ServiceUpdate),
    /// Every instance present at subscribe time has been delivered.
    Current,
}

/// Register, unregister, heartbeat and subscribe.
///
/// Implemented by the in-process [`Agent`](crate::Agent) and by
/// [`HttpDiscovery`](crate::HttpDiscovery) for remote agents.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Registers an instance and returns its resolved address.
    async fn register(&self, service: &str, addr: &str, attrs: &Attrs)
        -> Result<String, DiscoveryError>;

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError>;

    /// Extends an instance's lifetime.
    ///
    /// Fails with [`DiscoveryError::NotRegistered`] if the instance is gone.
    async fn heartbeat(&self, service: &str, addr: &str) -> Result<(), DiscoveryError>;

    /// Streams an `online` update per current instance, then
    /// [`SubscribeEvent::Current`], then every later change.
    async fn subscribe(&self, service: &str) -> Result<Subscription, DiscoveryError>;

    /// How often registered instances should heartbeat.
    fn heartbeat_interval(&self) -> Duration {
        DEFAULT_HEARTBEAT
    }
}

pub(crate) fn validate_service(service: &str) -> Result<(), DiscoveryError> {
    if service.is_empty() || service.contains('/') || service.chars().any(char::is_whitespace) {
        return Err(DiscoveryError::InvalidName {
            what: "service name",
            value: service.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_addr(addr: &str) -> Result<(), DiscoveryError> {
    if addr.is_empty() || addr.contains('/') || addr.chars().any(char::is_whitespace) {
        return Err(DiscoveryError::InvalidName {
            what: "address",
            value: addr.to_string(),
        });
    }
    Ok(())
}
