//! The pool of hosts known to the scheduler.
//!
//! The pool follows the discovery [`HOST_SERVICE`] set. A host that goes
//! down is kept for a grace window so a brief discovery flap does not cost
//! its jobs; once the window passes the host is removed and subscribers
//! see [`PoolEvent::HostDown`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use tug_discoverd::{Attrs, Instance, ServiceEvent, ServiceSet};
use tug_id::HostId;

use super::{HostClient, HostError, HostResult, HttpHostClient, HOST_ID_ATTR, TAG_PREFIX};

const EVENT_CAPACITY: usize = 256;

/// A host as advertised in discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub addr: String,
    pub tags: BTreeMap<String, String>,
}

impl Host {
    /// Reads a host from its discovery instance. Instances without a valid
    /// `id` attribute are not hosts.
    pub fn from_instance(instance: &Instance) -> Option<Self> {
        let id = HostId::new(instance.attrs.get(HOST_ID_ATTR)?.clone()).ok()?;
        let tags = instance
            .attrs
            .iter()
            .filter_map(|(k, v)| Some((k.strip_prefix(TAG_PREFIX)?.to_string(), v.clone())))
            .collect();
        Some(Self {
            id,
            addr: instance.addr.clone(),
            tags,
        })
    }

    /// True if every required tag is present with the same value.
    pub fn satisfies(&self, required: Option<&BTreeMap<String, String>>) -> bool {
        required.is_none_or(|required| {
            required
                .iter()
                .all(|(k, v)| self.tags.get(k).is_some_and(|have| have == v))
        })
    }
}

/// Discovery attributes a host registers with.
pub fn host_attrs(host_id: &HostId, tags: &BTreeMap<String, String>) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(HOST_ID_ATTR.to_string(), host_id.to_string());
    for (k, v) in tags {
        attrs.insert(format!("{TAG_PREFIX}{k}"), v.clone());
    }
    attrs
}

/// A change to the pool's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A host joined or changed address or tags.
    HostUp(Host),
    /// A host left and its grace window ran out.
    HostDown(HostId),
}

/// Builds the client used to reach a host.
pub trait HostConnector: Send + Sync + 'static {
    fn connect(&self, host: &Host) -> HostResult<Arc<dyn HostClient>>;
}

/// Connects to hosts over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    auth_key: Option<String>,
}

impl HttpConnector {
    pub fn new(auth_key: Option<String>) -> Self {
        Self { auth_key }
    }
}

impl HostConnector for HttpConnector {
    fn connect(&self, host: &Host) -> HostResult<Arc<dyn HostClient>> {
        let client = HttpHostClient::new(host.id.clone(), &host.addr, self.auth_key.clone())?;
        Ok(Arc::new(client))
    }
}

struct Entry {
    host: Host,
    client: Option<Arc<dyn HostClient>>,
}

/// Hosts keyed by id, each with a lazily built client.
pub struct HostPool {
    connector: Arc<dyn HostConnector>,
    hosts: RwLock<BTreeMap<HostId, Entry>>,
    events: broadcast::Sender<PoolEvent>,
}

impl HostPool {
    pub fn new(connector: Arc<dyn HostConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            hosts: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<HostId, Entry>> {
        self.hosts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<HostId, Entry>> {
        self.hosts.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or updates a host. Returns false if nothing changed.
    pub fn add_host(&self, host: Host) -> bool {
        {
            let mut hosts = self.write();
            match hosts.get_mut(&host.id) {
                Some(entry) if entry.host == host => return false,
                Some(entry) => {
                    if entry.host.addr != host.addr {
                        entry.client = None;
                    }
                    entry.host = host.clone();
                }
                None => {
                    hosts.insert(
                        host.id.clone(),
                        Entry {
                            host: host.clone(),
                            client: None,
                        },
                    );
                }
            }
        }
        info!(host_id = %host.id, addr = %host.addr, tags = ?host.tags, "Host up");
        let _ = self.events.send(PoolEvent::HostUp(host));
        true
    }

    /// Removes a host at once, without a grace window.
    pub fn remove_host(&self, host_id: &HostId) -> Option<Host> {
        let removed = self.write().remove(host_id)?;
        info!(host_id = %host_id, "Host removed");
        let _ = self.events.send(PoolEvent::HostDown(host_id.clone()));
        Some(removed.host)
    }

    /// Known hosts in id order.
    pub fn hosts(&self) -> Vec<Host> {
        self.read().values().map(|e| e.host.clone()).collect()
    }

    pub fn host(&self, host_id: &HostId) -> Option<Host> {
        self.read().get(host_id).map(|e| e.host.clone())
    }

    pub fn contains(&self, host_id: &HostId) -> bool {
        self.read().contains_key(host_id)
    }

    /// The client for a host, built on first use.
    pub fn client(&self, host_id: &HostId) -> HostResult<Arc<dyn HostClient>> {
        let host = {
            let hosts = self.read();
            let entry = hosts
                .get(host_id)
                .ok_or_else(|| HostError::UnknownHost(host_id.clone()))?;
            if let Some(client) = &entry.client {
                return Ok(client.clone());
            }
            entry.host.clone()
        };

        let client = self.connector.connect(&host)?;
        let mut hosts = self.write();
        match hosts.get_mut(host_id) {
            // Someone else may have connected, or the host moved, meanwhile.
            Some(entry) if entry.host.addr == host.addr => {
                Ok(entry.client.get_or_insert(client).clone())
            }
            Some(_) => Ok(client),
            None => Err(HostError::UnknownHost(host_id.clone())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Keeps the pool in line with a discovery set of hosts until shutdown.
    #[instrument(skip_all, fields(service = %set.service()), name = "host_pool")]
    pub async fn follow(
        self: Arc<Self>,
        set: Arc<ServiceSet>,
        grace: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut removals: HashMap<HostId, JoinHandle<()>> = HashMap::new();

        'watch: loop {
            let mut watch = set.watch().await;
            // Hosts seen in the initial view; the rest went away while we
            // were not watching.
            let mut initial = Some(BTreeSet::new());

            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break 'watch;
                        }
                        continue;
                    }
                    event = watch.recv() => event,
                };

                match event {
                    Ok(Some(ServiceEvent::Up(instance) | ServiceEvent::Update(instance))) => {
                        let Some(host) = Host::from_instance(&instance) else {
                            warn!(addr = %instance.addr, "Ignoring host without a valid id");
                            continue;
                        };
                        if let Some(seen) = initial.as_mut() {
                            seen.insert(host.id.clone());
                        }
                        if let Some(pending) = removals.remove(&host.id) {
                            if !pending.is_finished() {
                                debug!(host_id = %host.id, "Host back within grace window");
                            }
                            pending.abort();
                        }
                        self.add_host(host);
                    }
                    Ok(Some(ServiceEvent::Down(instance))) => {
                        if let Some(host) = Host::from_instance(&instance) {
                            self.schedule_removal(&mut removals, host.id, grace);
                        }
                    }
                    Ok(Some(ServiceEvent::Current)) => {
                        if let Some(seen) = initial.take() {
                            for host in self.hosts() {
                                if !seen.contains(&host.id) {
                                    self.schedule_removal(&mut removals, host.id, grace);
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Host set closed");
                        break 'watch;
                    }
                    Err(e) => {
                        warn!(error = %e, "Lost host watch, watching again");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue 'watch;
                    }
                }
            }
        }

        for (_, pending) in removals {
            pending.abort();
        }
    }

    fn schedule_removal(
        self: &Arc<Self>,
        removals: &mut HashMap<HostId, JoinHandle<()>>,
        host_id: HostId,
        grace: Duration,
    ) {
        if removals.get(&host_id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        debug!(host_id = %host_id, grace = ?grace, "Host down, waiting out grace window");
        let pool = self.clone();
        let id = host_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if pool.remove_host(&id).is_some() {
                warn!(host_id = %id, "Host lost");
            }
        });
        removals.insert(host_id, handle);
    }
}
