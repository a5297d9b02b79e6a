//! A client-side view of one service's instances.
//!
//! A [`ServiceSet`] follows a discovery subscription and keeps the online
//! instances in memory. Consumers can read the current view, ask for the
//! leader (the instance registered first), or register watchers that get
//! the view followed by every change in order.
//!
//! Watcher channels are bounded. A watcher that does not drain its channel
//! within the configured send timeout is dropped and sees
//! [`DiscoveryError::Lagged`], so one slow consumer never stalls the set.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use tug_reconcile::Attempts;

use crate::{Attrs, Discovery, DiscoveryError, ServiceUpdate, SubscribeEvent, Subscription};

/// An online instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub addr: String,
    pub attrs: Attrs,
    pub created: u64,
}

impl From<&ServiceUpdate> for Instance {
    fn from(update: &ServiceUpdate) -> Self {
        Self {
            addr: update.addr.clone(),
            attrs: update.attrs.clone(),
            created: update.created,
        }
    }
}

/// A change to the set as seen by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Up(Instance),
    /// An online instance changed attributes or was re-created.
    Update(Instance),
    Down(Instance),
    /// Separates the initial view from live changes.
    Current,
}

impl ServiceEvent {
    pub fn instance(&self) -> Option<&Instance> {
        match self {
            Self::Up(i) | Self::Update(i) | Self::Down(i) => Some(i),
            Self::Current => None,
        }
    }
}

/// Restricts a set to instances whose attributes match.
pub type Filter = Arc<dyn Fn(&Attrs) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServiceSetConfig {
    /// Events buffered per watcher.
    pub watch_buffer: usize,
    /// How long delivery waits on a full watcher before dropping it.
    pub send_timeout: Duration,
    /// Resubscribe attempts after the upstream subscription breaks.
    pub reconnect: Attempts,
}

impl Default for ServiceSetConfig {
    fn default() -> Self {
        Self {
            watch_buffer: 64,
            send_timeout: Duration::from_secs(1),
            reconnect: Attempts::new(10, Duration::from_secs(1)),
        }
    }
}

/// Receiving end of a set watcher.
pub struct SetWatch<T> {
    rx: mpsc::Receiver<T>,
    error: Arc<OnceLock<DiscoveryError>>,
}

/// Receives every [`ServiceEvent`].
pub type ServiceWatch = SetWatch<ServiceEvent>;

/// Receives the current leader, then every leader change.
pub type LeaderWatch = SetWatch<Option<Instance>>;

impl<T> SetWatch<T> {
    /// Next item, `Ok(None)` once the set is closed, or the error that
    /// disconnected this watcher.
    pub async fn recv(&mut self) -> Result<Option<T>, DiscoveryError> {
        match self.rx.recv().await {
            Some(item) => Ok(Some(item)),
            None => match self.error.get() {
                Some(e) => Err(e.clone()),
                None => Ok(None),
            },
        }
    }
}

struct Sink<T> {
    tx: mpsc::Sender<T>,
    error: Arc<OnceLock<DiscoveryError>>,
}

impl<T> Sink<T> {
    fn fail(&self, error: DiscoveryError) {
        let _ = self.error.set(error);
    }
}

fn sink<T>(capacity: usize) -> (Sink<T>, SetWatch<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let error = Arc::new(OnceLock::new());
    (
        Sink {
            tx,
            error: error.clone(),
        },
        SetWatch { rx, error },
    )
}

/// Delivers `items` to every sink in order, dropping sinks that are closed
/// or stay full past `timeout`.
async fn fan_out<T: Clone>(sinks: &mut Vec<Sink<T>>, items: &[T], timeout: Duration) {
    if items.is_empty() || sinks.is_empty() {
        return;
    }
    let mut keep = Vec::with_capacity(sinks.len());
    'sinks: for sink in sinks.drain(..) {
        for item in items {
            match sink.tx.send_timeout(item.clone(), timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(timeout = ?timeout, "Disconnecting slow watcher");
                    sink.fail(DiscoveryError::Lagged);
                    continue 'sinks;
                }
                Err(SendTimeoutError::Closed(_)) => continue 'sinks,
            }
        }
        keep.push(sink);
    }
    *sinks = keep;
}

#[derive(Default)]
struct State {
    /// Every online instance reported upstream.
    online: BTreeMap<String, Instance>,
    /// Online instances that pass the filter.
    visible: BTreeMap<String, Instance>,
    filter: Option<Filter>,
    leader: Option<Instance>,
    watchers: Vec<Sink<ServiceEvent>>,
    leader_watchers: Vec<Sink<Option<Instance>>>,
    failed: Option<DiscoveryError>,
}

impl State {
    fn matches(&self, attrs: &Attrs) -> bool {
        self.filter.as_ref().is_none_or(|f| f(attrs))
    }

    /// Applies one upstream update to the view.
    fn apply(&mut self, update: &ServiceUpdate) -> Option<ServiceEvent> {
        let addr = &update.addr;
        if !update.online {
            self.online.remove(addr);
            return self.visible.remove(addr).map(ServiceEvent::Down);
        }

        let instance = Instance::from(update);
        self.online.insert(addr.clone(), instance.clone());
        self.show(instance)
    }

    /// Puts an online instance into the filtered view.
    fn show(&mut self, instance: Instance) -> Option<ServiceEvent> {
        if !self.matches(&instance.attrs) {
            return self.visible.remove(&instance.addr).map(ServiceEvent::Down);
        }
        match self.visible.insert(instance.addr.clone(), instance.clone()) {
            None => Some(ServiceEvent::Up(instance)),
            Some(prev) if prev != instance => Some(ServiceEvent::Update(instance)),
            Some(_) => None,
        }
    }

    /// Replaces the upstream view after a resubscribe.
    fn replace(&mut self, fresh: BTreeMap<String, Instance>) -> Vec<ServiceEvent> {
        let gone: Vec<String> = self
            .online
            .keys()
            .filter(|addr| !fresh.contains_key(*addr))
            .cloned()
            .collect();

        let mut events = Vec::new();
        for addr in gone {
            self.online.remove(&addr);
            events.extend(self.visible.remove(&addr).map(ServiceEvent::Down));
        }

        for instance in sorted(fresh.into_values()) {
            self.online.insert(instance.addr.clone(), instance.clone());
            events.extend(self.show(instance));
        }
        events
    }

    fn set_filter(&mut self, filter: Option<Filter>) -> Vec<ServiceEvent> {
        self.filter = filter;
        let online: Vec<Instance> = sorted(self.online.values().cloned());
        online.into_iter().filter_map(|i| self.show(i)).collect()
    }

    /// The visible instance with the smallest created index.
    fn elect(&self) -> Option<Instance> {
        self.visible
            .values()
            .min_by(|a, b| (a.created, &a.addr).cmp(&(b.created, &b.addr)))
            .cloned()
    }

    async fn deliver(&mut self, events: Vec<ServiceEvent>, timeout: Duration) {
        if events.is_empty() {
            return;
        }
        fan_out(&mut self.watchers, &events, timeout).await;

        let leader = self.elect();
        if leader != self.leader {
            debug!(
                leader = leader.as_ref().map(|l| l.addr.as_str()).unwrap_or("none"),
                "Leader changed"
            );
            self.leader = leader.clone();
            fan_out(&mut self.leader_watchers, &[leader], timeout).await;
        }
    }

    fn instances(&self) -> Vec<Instance> {
        sorted(self.visible.values().cloned())
    }

    fn fail(&mut self, error: DiscoveryError) {
        for w in self.watchers.drain(..) {
            w.fail(error.clone());
        }
        for w in self.leader_watchers.drain(..) {
            w.fail(error.clone());
        }
        self.failed = Some(error);
    }
}

fn sorted(instances: impl IntoIterator<Item = Instance>) -> Vec<Instance> {
    let mut instances: Vec<_> = instances.into_iter().collect();
    instances.sort_by(|a, b| (a.created, &a.addr).cmp(&(b.created, &b.addr)));
    instances
}

/// Reads a fresh subscription up to its caught-up marker.
async fn read_until_current(
    subscription: &mut Subscription,
) -> Result<BTreeMap<String, Instance>, DiscoveryError> {
    let mut instances = BTreeMap::new();
    loop {
        match subscription.next().await {
            Some(Ok(SubscribeEvent::Update(update))) => {
                if update.online {
                    instances.insert(update.addr.clone(), Instance::from(&update));
                } else {
                    instances.remove(&update.addr);
                }
            }
            Some(Ok(SubscribeEvent::Current)) => return Ok(instances),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(DiscoveryError::Disconnected(
                    "subscription ended before it was current".into(),
                ))
            }
        }
    }
}

struct Shared {
    service: String,
    config: ServiceSetConfig,
    state: Mutex<State>,
}

/// The online instances of one service.
pub struct ServiceSet {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ServiceSet {
    /// Subscribes to `service` and returns once the initial view is loaded.
    pub async fn connect(
        discovery: Arc<dyn Discovery>,
        service: &str,
    ) -> Result<Self, DiscoveryError> {
        Self::connect_with(discovery, service, ServiceSetConfig::default()).await
    }

    pub async fn connect_with(
        discovery: Arc<dyn Discovery>,
        service: &str,
        config: ServiceSetConfig,
    ) -> Result<Self, DiscoveryError> {
        let mut subscription = discovery.subscribe(service).await?;
        let initial = read_until_current(&mut subscription).await?;

        let mut state = State::default();
        state.replace(initial);
        state.leader = state.elect();

        let shared = Arc::new(Shared {
            service: service.to_string(),
            config,
            state: Mutex::new(state),
        });
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(follow(shared.clone(), discovery, subscription, stop_rx));

        Ok(Self {
            shared,
            stop,
            task: StdMutex::new(Some(task)),
        })
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Online instances, oldest first.
    pub async fn instances(&self) -> Vec<Instance> {
        self.shared.state.lock().await.instances()
    }

    pub async fn addrs(&self) -> Vec<String> {
        self.instances().await.into_iter().map(|i| i.addr).collect()
    }

    /// The online instance with the smallest created index.
    pub async fn leader(&self) -> Option<Instance> {
        self.shared.state.lock().await.leader.clone()
    }

    /// Restricts the set to instances whose attributes satisfy `predicate`.
    ///
    /// Instances that stop matching are reported down to watchers; ones that
    /// start matching are reported up.
    pub async fn filter<F>(&self, predicate: F)
    where
        F: Fn(&Attrs) -> bool + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().await;
        let events = state.set_filter(Some(Arc::new(predicate)));
        state.deliver(events, self.shared.config.send_timeout).await;
    }

    /// Registers a watcher. It receives an `Up` per instance in the current
    /// view, then [`ServiceEvent::Current`], then every later change.
    pub async fn watch(&self) -> ServiceWatch {
        let mut state = self.shared.state.lock().await;
        let instances = state.instances();
        let (sink, watch) = sink(self.shared.config.watch_buffer + instances.len() + 1);

        for instance in instances {
            let _ = sink.tx.try_send(ServiceEvent::Up(instance));
        }
        let _ = sink.tx.try_send(ServiceEvent::Current);

        match &state.failed {
            Some(e) => sink.fail(e.clone()),
            None => state.watchers.push(sink),
        }
        watch
    }

    /// Registers a leader watcher. It receives the current leader, then
    /// every change, including the leader going away and coming back.
    pub async fn leaders(&self) -> LeaderWatch {
        let mut state = self.shared.state.lock().await;
        let (sink, watch) = sink(self.shared.config.watch_buffer);
        let _ = sink.tx.try_send(state.leader.clone());

        match &state.failed {
            Some(e) => sink.fail(e.clone()),
            None => state.leader_watchers.push(sink),
        }
        watch
    }

    /// Waits until at least `count` instances are online.
    pub async fn wait_for_instances(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Instance>, DiscoveryError> {
        let mut watch = self.watch().await;
        let mut seen: HashMap<String, Instance> = HashMap::new();
        let mut current = false;

        let wait = async {
            loop {
                if current && seen.len() >= count {
                    return Ok(sorted(seen.values().cloned()));
                }
                match watch.recv().await? {
                    Some(ServiceEvent::Up(i)) | Some(ServiceEvent::Update(i)) => {
                        seen.insert(i.addr.clone(), i);
                    }
                    Some(ServiceEvent::Down(i)) => {
                        seen.remove(&i.addr);
                    }
                    Some(ServiceEvent::Current) => current = true,
                    None => return Err(DiscoveryError::Disconnected("service set closed".into())),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DiscoveryError::Timeout(timeout))?
    }

    /// Stops following upstream and closes every watcher.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut state = self.shared.state.lock().await;
        state.watchers.clear();
        state.leader_watchers.clear();
    }
}

impl Drop for ServiceSet {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[instrument(skip_all, fields(service = %shared.service), name = "service_set")]
async fn follow(
    shared: Arc<Shared>,
    discovery: Arc<dyn Discovery>,
    mut subscription: Subscription,
    mut stop: watch::Receiver<bool>,
) {
    let timeout = shared.config.send_timeout;
    loop {
        let item = tokio::select! {
            _ = stop.changed() => return,
            item = subscription.next() => item,
        };

        let reason = match item {
            Some(Ok(SubscribeEvent::Update(update))) => {
                let mut state = shared.state.lock().await;
                let events: Vec<_> = state.apply(&update).into_iter().collect();
                state.deliver(events, timeout).await;
                continue;
            }
            Some(Ok(SubscribeEvent::Current)) => continue,
            Some(Err(e)) => e.to_string(),
            None => "subscription ended".to_string(),
        };

        warn!(reason = %reason, "Upstream subscription lost, resubscribing");
        let service = shared.service.as_str();
        let discovery = &discovery;
        let resubscribe = shared.config.reconnect.run(|attempt| async move {
            debug!(attempt, "Resubscribing");
            let mut subscription = discovery.subscribe(service).await?;
            let fresh = read_until_current(&mut subscription).await?;
            Ok::<_, DiscoveryError>((subscription, fresh))
        });

        let result = tokio::select! {
            _ = stop.changed() => return,
            result = resubscribe => result,
        };

        let mut state = shared.state.lock().await;
        match result {
            Ok((fresh_subscription, fresh)) => {
                info!(instances = fresh.len(), "Resubscribed");
                subscription = fresh_subscription;
                let events = state.replace(fresh);
                state.deliver(events, timeout).await;
            }
            Err(e) => {
                warn!(error = %e, "Giving up on upstream subscription");
                state.fail(DiscoveryError::Disconnected(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(addr: &str, online: bool, created: u64, attrs: &[(&str, &str)]) -> ServiceUpdate {
        ServiceUpdate {
            service: "api".into(),
            addr: addr.into(),
            online,
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created,
        }
    }

    #[test]
    fn test_apply_and_elect() {
        let mut state = State::default();
        assert!(matches!(state.apply(&update("b", true, 2, &[])), Some(ServiceEvent::Up(_))));
        assert!(matches!(state.apply(&update("a", true, 1, &[])), Some(ServiceEvent::Up(_))));
        assert_eq!(state.elect().unwrap().addr, "a");

        assert!(state.apply(&update("a", true, 1, &[])).is_none());
        assert!(matches!(
            state.apply(&update("a", true, 1, &[("v", "2")])),
            Some(ServiceEvent::Update(_))
        ));
        assert!(matches!(state.apply(&update("a", false, 1, &[])), Some(ServiceEvent::Down(_))));
        assert!(state.apply(&update("a", false, 1, &[])).is_none());
        assert_eq!(state.elect().unwrap().addr, "b");
    }

    #[test]
    fn test_filter_hides_and_reveals() {
        let mut state = State::default();
        state.apply(&update("a", true, 1, &[("role", "web")]));
        state.apply(&update("b", true, 2, &[("role", "db")]));

        let events = state.set_filter(Some(Arc::new(|attrs: &Attrs| {
            attrs.get("role").map(String::as_str) == Some("db")
        })));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServiceEvent::Down(i) if i.addr == "a"));
        assert_eq!(state.elect().unwrap().addr, "b");

        // Future updates respect the filter.
        assert!(state.apply(&update("c", true, 3, &[("role", "web")])).is_none());
        assert!(matches!(
            state.apply(&update("b", true, 2, &[("role", "web")])),
            Some(ServiceEvent::Down(_))
        ));

        let events = state.set_filter(None);
        let ups: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ServiceEvent::Up(i) => Some(i.addr.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ups, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_replace_diffs_views() {
        let mut state = State::default();
        state.apply(&update("a", true, 1, &[]));
        state.apply(&update("b", true, 2, &[]));

        let fresh: BTreeMap<String, Instance> = [
            Instance::from(&update("b", true, 2, &[])),
            Instance::from(&update("c", true, 5, &[])),
        ]
        .into_iter()
        .map(|i| (i.addr.clone(), i))
        .collect();

        let events = state.replace(fresh);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ServiceEvent::Down(i) if i.addr == "a"));
        assert!(matches!(&events[1], ServiceEvent::Up(i) if i.addr == "c"));
    }

    #[tokio::test]
    async fn test_fan_out_drops_slow_sink() {
        let (fast, mut fast_watch) = sink::<u32>(4);
        let (slow, mut slow_watch) = sink::<u32>(1);
        let mut sinks = vec![fast, slow];

        fan_out(&mut sinks, &[1, 2], Duration::from_millis(10)).await;

        assert_eq!(sinks.len(), 1);
        assert_eq!(fast_watch.recv().await, Ok(Some(1)));
        assert_eq!(fast_watch.recv().await, Ok(Some(2)));
        assert_eq!(slow_watch.recv().await, Ok(Some(1)));
        assert_eq!(slow_watch.recv().await, Err(DiscoveryError::Lagged));
    }
}
