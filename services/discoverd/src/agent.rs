//! The discovery agent.
//!
//! Instances live under `/discover/services/<service>/<addr>` with the JSON
//! attribute map as value and a TTL of heartbeat plus grace. Registering an
//! existing instance updates it in place so its created index, and with it
//! leader order, survives re-registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::discovery::{validate_addr, validate_service, DEFAULT_GRACE, DEFAULT_HEARTBEAT};
use crate::store::{Node, Snapshot, Store, StoreEvent};
use crate::{
    Attrs, Discovery, DiscoveryError, Heartbeater, ServiceUpdate, StoreError, SubscribeEvent,
    Subscription,
};

/// Root of every service key.
pub const SERVICES_PREFIX: &str = "/discover/services";

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat: Duration,
    pub grace: Duration,
    /// Substituted for the host part of `:port` addresses.
    pub external_ip: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            grace: DEFAULT_GRACE,
            external_ip: None,
        }
    }
}

impl AgentConfig {
    pub fn ttl(&self) -> Duration {
        self.heartbeat + self.grace
    }
}

/// Serves discovery operations from a backend store.
pub struct Agent {
    store: Arc<dyn Store>,
    config: AgentConfig,
}

pub fn service_prefix(service: &str) -> String {
    format!("{SERVICES_PREFIX}/{service}/")
}

fn instance_key(service: &str, addr: &str) -> String {
    format!("{SERVICES_PREFIX}/{service}/{addr}")
}

impl Agent {
    pub fn new(store: Arc<dyn Store>, config: AgentConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Expands `:port` to `<EXTERNAL_IP>:port`.
    pub fn resolve_addr(&self, addr: &str) -> Result<String, DiscoveryError> {
        validate_addr(addr)?;
        if !addr.starts_with(':') {
            return Ok(addr.to_string());
        }
        match &self.config.external_ip {
            Some(ip) => Ok(format!("{ip}{addr}")),
            None => Err(DiscoveryError::MissingExternalIp(addr.to_string())),
        }
    }

    /// Registers and keeps the instance alive until the handle is stopped.
    pub async fn register_with_heartbeat(
        self: &Arc<Self>,
        service: &str,
        addr: &str,
        attrs: Attrs,
    ) -> Result<Heartbeater, DiscoveryError> {
        crate::heartbeat::register_with_heartbeat(self.clone(), service, addr, attrs).await
    }
}

#[async_trait]
impl Discovery for Agent {
    #[instrument(skip(self, attrs), name = "register")]
    async fn register(
        &self,
        service: &str,
        addr: &str,
        attrs: &Attrs,
    ) -> Result<String, DiscoveryError> {
        validate_service(service)?;
        let addr = self.resolve_addr(addr)?;
        let key = instance_key(service, &addr);
        let value = serde_json::to_string(attrs).map_err(|e| DiscoveryError::Protocol(e.to_string()))?;
        let ttl = Some(self.config.ttl());

        let node = match self.store.update(&key, &value, ttl).await {
            Ok(node) => node,
            Err(StoreError::NotFound(_)) => self.store.put(&key, &value, ttl).await?,
            Err(e) => return Err(e.into()),
        };

        info!(service, addr = %addr, created = node.created_index, "Registered instance");
        Ok(addr)
    }

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        validate_service(service)?;
        let addr = self.resolve_addr(addr)?;
        match self.store.delete(&instance_key(service, &addr)).await {
            Ok(_) => {
                info!(service, addr = %addr, "Unregistered instance");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                debug!(service, addr = %addr, "Unregister of unknown instance");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn heartbeat(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        validate_service(service)?;
        let addr = self.resolve_addr(addr)?;
        match self
            .store
            .refresh(&instance_key(service, &addr), Some(self.config.ttl()))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => Err(DiscoveryError::NotRegistered {
                service: service.to_string(),
                addr,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, DiscoveryError> {
        validate_service(service)?;
        let relay = Relay::new(service);
        // The first snapshot is taken before returning so errors surface here.
        let snapshot = self.store.get(&relay.prefix).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(relay.run(self.store.clone(), snapshot, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Known {
    value: String,
    attrs: Attrs,
    created: u64,
}

type Tx = mpsc::Sender<Result<SubscribeEvent, DiscoveryError>>;

/// Turns store snapshots and watch events into service updates for one
/// subscriber.
struct Relay {
    service: String,
    prefix: String,
    known: HashMap<String, Known>,
}

impl Relay {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            prefix: service_prefix(service),
            known: HashMap::new(),
        }
    }

    async fn run(mut self, store: Arc<dyn Store>, snapshot: Snapshot, tx: Tx) {
        let mut index = snapshot.index;
        for update in self.resync(snapshot) {
            if tx.send(Ok(SubscribeEvent::Update(update))).await.is_err() {
                return;
            }
        }
        if tx.send(Ok(SubscribeEvent::Current)).await.is_err() {
            return;
        }

        loop {
            match self.follow(&*store, index, &tx).await {
                Ok(None) => return,
                Ok(Some(last)) => index = last,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }

            info!(service = %self.service, index, "Resyncing subscription");
            let snapshot = match store.get(&self.prefix).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            index = snapshot.index;
            for update in self.resync(snapshot) {
                if tx.send(Ok(SubscribeEvent::Update(update))).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Relays the watch from `index` until it needs a resync, returning the
    /// last index seen, or `None` once the subscriber is gone.
    async fn follow(
        &mut self,
        store: &dyn Store,
        mut index: u64,
        tx: &Tx,
    ) -> Result<Option<u64>, StoreError> {
        let mut watch = match store.watch(&self.prefix, index).await {
            Ok(watch) => watch,
            Err(e) if e.needs_resync() => return Ok(Some(index)),
            Err(e) => return Err(e),
        };

        loop {
            let item = tokio::select! {
                _ = tx.closed() => return Ok(None),
                item = watch.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    index = event.index;
                    if let Some(update) = self.apply(event) {
                        if tx.send(Ok(SubscribeEvent::Update(update))).await.is_err() {
                            return Ok(None);
                        }
                    }
                }
                Some(Err(e)) if e.needs_resync() => {
                    warn!(service = %self.service, error = %e, "Watch interrupted");
                    return Ok(Some(index));
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(Some(index)),
            }
        }
    }

    fn addr<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix).filter(|a| !a.is_empty() && !a.contains('/'))
    }

    fn update(&self, addr: &str, known: &Known, online: bool) -> ServiceUpdate {
        ServiceUpdate {
            service: self.service.clone(),
            addr: addr.to_string(),
            online,
            attrs: known.attrs.clone(),
            created: known.created,
        }
    }

    fn known(&self, node: &Node) -> Known {
        let attrs = serde_json::from_str(&node.value).unwrap_or_else(|e| {
            warn!(key = %node.key, error = %e, "Instance value is not an attribute map");
            Attrs::new()
        });
        Known {
            value: node.value.clone(),
            attrs,
            created: node.created_index,
        }
    }

    /// Applies one watch event. Writes that leave the value unchanged are
    /// heartbeats and produce nothing.
    fn apply(&mut self, event: StoreEvent) -> Option<ServiceUpdate> {
        let addr = self.addr(&event.node.key)?.to_string();

        if event.action.is_removal() {
            let known = self.known.remove(&addr)?;
            return Some(self.update(&addr, &known, false));
        }

        if event.prev_value.as_deref() == Some(event.node.value.as_str()) {
            return None;
        }
        let known = self.known(&event.node);
        if self.known.get(&addr) == Some(&known) {
            return None;
        }
        let update = self.update(&addr, &known, true);
        self.known.insert(addr, known);
        Some(update)
    }

    /// Replaces the known instances with a snapshot, returning the updates
    /// that move a subscriber from the old view to the new one.
    fn resync(&mut self, snapshot: Snapshot) -> Vec<ServiceUpdate> {
        let mut updates = Vec::new();
        let mut next = HashMap::new();

        for node in &snapshot.nodes {
            let Some(addr) = self.addr(&node.key) else {
                continue;
            };
            let known = self.known(node);
            if self.known.get(addr) != Some(&known) {
                updates.push(self.update(addr, &known, true));
            }
            next.insert(addr.to_string(), known);
        }

        let mut gone: Vec<_> = self
            .known
            .iter()
            .filter(|(addr, _)| !next.contains_key(*addr))
            .map(|(addr, known)| self.update(addr, known, false))
            .collect();
        gone.sort_by_key(|u| u.created);
        updates.extend(gone);

        self.known = next;
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreAction;

    fn node(addr: &str, value: &str, created: u64, modified: u64) -> Node {
        Node {
            key: format!("/discover/services/api/{addr}"),
            value: value.to_string(),
            created_index: created,
            modified_index: modified,
        }
    }

    fn event(action: StoreAction, node: Node, prev: Option<&str>) -> StoreEvent {
        StoreEvent {
            index: node.modified_index,
            action,
            node,
            prev_value: prev.map(str::to_string),
        }
    }

    #[test]
    fn test_resolve_addr() {
        let store: Arc<dyn Store> = Arc::new(crate::MemoryStore::new());
        let agent = Agent::new(store.clone(), AgentConfig::default());
        assert_eq!(agent.resolve_addr("10.0.0.1:80").unwrap(), "10.0.0.1:80");
        assert_eq!(
            agent.resolve_addr(":80"),
            Err(DiscoveryError::MissingExternalIp(":80".into()))
        );

        let agent = Agent::new(
            store,
            AgentConfig {
                external_ip: Some("192.168.1.5".into()),
                ..Default::default()
            },
        );
        assert_eq!(agent.resolve_addr(":80").unwrap(), "192.168.1.5:80");
    }

    #[test]
    fn test_apply_filters_heartbeats() {
        let mut relay = Relay::new("api");

        let up = relay.apply(event(StoreAction::Set, node("a:1", "{}", 1, 1), None));
        assert!(up.is_some_and(|u| u.online && u.created == 1));

        let beat = relay.apply(event(StoreAction::Update, node("a:1", "{}", 1, 2), Some("{}")));
        assert!(beat.is_none());

        // A re-register with identical attributes is not a change either.
        let same = relay.apply(event(StoreAction::Set, node("a:1", "{}", 1, 3), None));
        assert!(same.is_none());

        let changed = relay
            .apply(event(StoreAction::Update, node("a:1", r#"{"v":"2"}"#, 1, 4), Some("{}")))
            .unwrap();
        assert!(changed.online);
        assert_eq!(changed.attrs.get("v").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_apply_removals_map_to_offline_once() {
        let mut relay = Relay::new("api");
        relay.apply(event(StoreAction::Set, node("a:1", "{}", 1, 1), None));

        let down = relay
            .apply(event(StoreAction::Expire, node("a:1", "{}", 1, 2), Some("{}")))
            .unwrap();
        assert!(!down.online);
        assert_eq!(down.created, 1);

        assert!(relay
            .apply(event(StoreAction::Delete, node("a:1", "{}", 1, 3), Some("{}")))
            .is_none());
    }

    #[test]
    fn test_resync_diffs_against_known() {
        let mut relay = Relay::new("api");
        relay.resync(Snapshot {
            index: 2,
            nodes: vec![node("a:1", "{}", 1, 1), node("b:1", "{}", 2, 2)],
        });

        let updates = relay.resync(Snapshot {
            index: 9,
            nodes: vec![node("b:1", "{}", 2, 5), node("c:1", "{}", 8, 8)],
        });

        let summary: Vec<_> = updates.iter().map(|u| (u.addr.as_str(), u.online)).collect();
        assert_eq!(summary, vec![("c:1", true), ("a:1", false)]);
    }
}
