use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tug_discoverd::{
    Agent, AgentConfig, Attrs, Discovery, DiscoveryError, MemoryStore, ServiceEvent, ServiceSet,
    ServiceSetConfig, ServiceUpdate, SubscribeEvent, Subscription,
};
use tug_reconcile::Attempts;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tug_discoverd=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn agent_with(store: Arc<MemoryStore>, config: AgentConfig) -> Arc<Agent> {
    init_tracing();
    Arc::new(Agent::new(store, config))
}

fn agent() -> (Arc<MemoryStore>, Arc<Agent>) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), agent_with(store, AgentConfig::default()))
}

fn attrs(items: &[(&str, &str)]) -> Attrs {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn next_update(sub: &mut Subscription) -> ServiceUpdate {
    match timeout(WAIT, sub.next()).await.expect("timed out") {
        Some(Ok(SubscribeEvent::Update(update))) => update,
        other => panic!("expected update, got {other:?}"),
    }
}

async fn expect_current(sub: &mut Subscription) {
    match timeout(WAIT, sub.next()).await.expect("timed out") {
        Some(Ok(SubscribeEvent::Current)) => {}
        other => panic!("expected current, got {other:?}"),
    }
}

async fn nothing_pending(sub: &mut Subscription) {
    assert!(
        timeout(Duration::from_millis(100), sub.next()).await.is_err(),
        "unexpected event"
    );
}

const API: [&str; 3] = ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"];

#[tokio::test]
async fn test_subscribe_after_registration_then_unregister() {
    let (_store, agent) = agent();
    for addr in API {
        agent.register("api", addr, &Attrs::new()).await.unwrap();
    }

    let mut sub = agent.subscribe("api").await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let update = next_update(&mut sub).await;
        assert!(update.online);
        assert_eq!(update.service, "api");
        seen.push(update.addr);
    }
    seen.sort();
    assert_eq!(seen, API);
    expect_current(&mut sub).await;
    nothing_pending(&mut sub).await;

    let set = ServiceSet::connect(agent.clone(), "api").await.unwrap();
    assert_eq!(set.leader().await.unwrap().addr, "10.0.0.1:80");
    assert_eq!(set.addrs().await, API);
    let mut leaders = set.leaders().await;
    assert_eq!(
        leaders.recv().await.unwrap().unwrap().map(|l| l.addr),
        Some("10.0.0.1:80".to_string())
    );

    agent.unregister("api", "10.0.0.1:80").await.unwrap();

    let offline = next_update(&mut sub).await;
    assert!(!offline.online);
    assert_eq!(offline.addr, "10.0.0.1:80");
    nothing_pending(&mut sub).await;

    let next = timeout(WAIT, leaders.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(next.map(|l| l.addr), Some("10.0.0.2:80".to_string()));
    assert_eq!(set.leader().await.unwrap().addr, "10.0.0.2:80");
}

#[tokio::test]
async fn test_heartbeats_and_identical_registrations_are_suppressed() {
    let (_store, agent) = agent();
    agent
        .register("api", "10.0.0.1:80", &attrs(&[("v", "1")]))
        .await
        .unwrap();
    let mut sub = agent.subscribe("api").await.unwrap();
    let first = next_update(&mut sub).await;
    expect_current(&mut sub).await;

    for _ in 0..3 {
        agent.heartbeat("api", "10.0.0.1:80").await.unwrap();
    }
    agent
        .register("api", "10.0.0.1:80", &attrs(&[("v", "1")]))
        .await
        .unwrap();
    nothing_pending(&mut sub).await;

    agent
        .register("api", "10.0.0.1:80", &attrs(&[("v", "2")]))
        .await
        .unwrap();
    let changed = next_update(&mut sub).await;
    assert!(changed.online);
    assert_eq!(changed.attrs, attrs(&[("v", "2")]));
    // Re-registering updates in place, so leader order is unchanged.
    assert_eq!(changed.created, first.created);
}

#[tokio::test]
async fn test_heartbeat_unknown_instance_is_not_registered() {
    let (_store, agent) = agent();
    let err = agent.heartbeat("api", "10.0.0.9:80").await.unwrap_err();
    assert!(err.is_not_registered());
}

#[tokio::test(start_paused = true)]
async fn test_expired_instance_goes_offline() {
    let store = Arc::new(MemoryStore::new());
    let sweeper = MemoryStore::spawn_expiry(&store, Duration::from_millis(100));
    let agent = agent_with(
        store,
        AgentConfig {
            heartbeat: Duration::from_secs(1),
            grace: Duration::from_secs(1),
            external_ip: None,
        },
    );

    agent.register("api", "10.0.0.1:80", &Attrs::new()).await.unwrap();
    let mut sub = agent.subscribe("api").await.unwrap();
    next_update(&mut sub).await;
    expect_current(&mut sub).await;

    // Heartbeats keep it alive past the TTL.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        agent.heartbeat("api", "10.0.0.1:80").await.unwrap();
    }
    nothing_pending(&mut sub).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let offline = next_update(&mut sub).await;
    assert!(!offline.online);
    assert!(agent
        .heartbeat("api", "10.0.0.1:80")
        .await
        .unwrap_err()
        .is_not_registered());

    sweeper.abort();
}

#[tokio::test]
async fn test_subscription_resyncs_after_watch_loss() {
    let (store, agent) = agent();
    agent.register("api", "10.0.0.1:80", &Attrs::new()).await.unwrap();
    agent.register("api", "10.0.0.2:80", &Attrs::new()).await.unwrap();

    let mut sub = agent.subscribe("api").await.unwrap();
    next_update(&mut sub).await;
    next_update(&mut sub).await;
    expect_current(&mut sub).await;

    // Changes made while the watch is gone are recovered from a snapshot.
    store.drop_watchers();
    agent.unregister("api", "10.0.0.1:80").await.unwrap();
    agent.register("api", "10.0.0.3:80", &Attrs::new()).await.unwrap();
    agent.heartbeat("api", "10.0.0.2:80").await.unwrap();

    let mut changes = vec![next_update(&mut sub).await, next_update(&mut sub).await];
    changes.sort_by(|a, b| a.addr.cmp(&b.addr));
    assert_eq!(changes[0].addr, "10.0.0.1:80");
    assert!(!changes[0].online);
    assert_eq!(changes[1].addr, "10.0.0.3:80");
    assert!(changes[1].online);
    nothing_pending(&mut sub).await;

    // And the new watch is live.
    agent.unregister("api", "10.0.0.2:80").await.unwrap();
    let offline = next_update(&mut sub).await;
    assert_eq!((offline.addr.as_str(), offline.online), ("10.0.0.2:80", false));
}

#[tokio::test]
async fn test_slow_watcher_is_disconnected() {
    let (_store, agent) = agent();
    let set = ServiceSet::connect_with(
        agent.clone(),
        "api",
        ServiceSetConfig {
            watch_buffer: 1,
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut slow = set.watch().await;
    let mut fast = set.watch().await;
    let reader = tokio::spawn(async move {
        let mut events = Vec::new();
        while events.len() < 4 {
            match fast.recv().await {
                Ok(Some(event)) => events.push(event),
                other => panic!("fast watcher ended: {other:?}"),
            }
        }
        events
    });

    for addr in API {
        agent.register("api", addr, &Attrs::new()).await.unwrap();
    }

    let events = timeout(WAIT, reader).await.unwrap().unwrap();
    assert_eq!(events[0], ServiceEvent::Current);
    assert!(events[1..].iter().all(|e| matches!(e, ServiceEvent::Up(_))));

    assert_eq!(slow.recv().await, Ok(Some(ServiceEvent::Current)));
    assert!(matches!(slow.recv().await, Ok(Some(ServiceEvent::Up(_)))));
    assert_eq!(slow.recv().await, Err(DiscoveryError::Lagged));

    assert_eq!(set.instances().await.len(), 3);
}

#[tokio::test]
async fn test_watch_gets_snapshot_then_current_then_live() {
    let (_store, agent) = agent();
    agent.register("api", "10.0.0.2:80", &Attrs::new()).await.unwrap();
    agent.register("api", "10.0.0.1:80", &Attrs::new()).await.unwrap();
    let set = ServiceSet::connect(agent.clone(), "api").await.unwrap();

    let mut watch = set.watch().await;
    let first = watch.recv().await.unwrap().unwrap();
    let second = watch.recv().await.unwrap().unwrap();
    // Oldest first.
    assert_eq!(first.instance().unwrap().addr, "10.0.0.2:80");
    assert_eq!(second.instance().unwrap().addr, "10.0.0.1:80");
    assert_eq!(watch.recv().await.unwrap(), Some(ServiceEvent::Current));

    agent
        .register("api", "10.0.0.1:80", &attrs(&[("weight", "2")]))
        .await
        .unwrap();
    let live = timeout(WAIT, watch.recv()).await.unwrap().unwrap().unwrap();
    assert!(matches!(live, ServiceEvent::Update(ref i) if i.attrs == attrs(&[("weight", "2")])));
}

#[tokio::test]
async fn test_filter_applies_to_view_and_future_events() {
    let (_store, agent) = agent();
    agent
        .register("api", "10.0.0.1:80", &attrs(&[("proto", "http")]))
        .await
        .unwrap();
    agent
        .register("api", "10.0.0.2:80", &attrs(&[("proto", "grpc")]))
        .await
        .unwrap();
    let set = ServiceSet::connect(agent.clone(), "api").await.unwrap();

    set.filter(|attrs: &Attrs| attrs.get("proto").map(String::as_str) == Some("grpc"))
        .await;
    assert_eq!(set.addrs().await, vec!["10.0.0.2:80"]);
    assert_eq!(set.leader().await.unwrap().addr, "10.0.0.2:80");

    let mut watch = set.watch().await;
    assert!(matches!(watch.recv().await, Ok(Some(ServiceEvent::Up(_)))));
    assert_eq!(watch.recv().await, Ok(Some(ServiceEvent::Current)));

    agent
        .register("api", "10.0.0.3:80", &attrs(&[("proto", "http")]))
        .await
        .unwrap();
    agent
        .register("api", "10.0.0.4:80", &attrs(&[("proto", "grpc")]))
        .await
        .unwrap();
    let up = timeout(WAIT, watch.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(up.instance().unwrap().addr, "10.0.0.4:80");
}

#[tokio::test]
async fn test_leader_flaps_when_it_leaves_and_returns() {
    let (_store, agent) = agent();
    agent.register("scheduler", "10.0.0.1:80", &Attrs::new()).await.unwrap();
    let set = ServiceSet::connect(agent.clone(), "scheduler").await.unwrap();
    let mut leaders = set.leaders().await;
    assert!(leaders.recv().await.unwrap().unwrap().is_some());

    agent.unregister("scheduler", "10.0.0.1:80").await.unwrap();
    assert_eq!(timeout(WAIT, leaders.recv()).await.unwrap(), Ok(Some(None)));

    agent.register("scheduler", "10.0.0.1:80", &Attrs::new()).await.unwrap();
    let back = timeout(WAIT, leaders.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(back.unwrap().addr, "10.0.0.1:80");
}

#[tokio::test]
async fn test_wait_for_instances() {
    let (_store, agent) = agent();
    let set = ServiceSet::connect(agent.clone(), "api").await.unwrap();

    let err = set
        .wait_for_instances(1, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, DiscoveryError::Timeout(Duration::from_millis(50)));

    let registrar = {
        let agent = agent.clone();
        tokio::spawn(async move {
            for addr in API {
                tokio::time::sleep(Duration::from_millis(20)).await;
                agent.register("api", addr, &Attrs::new()).await.unwrap();
            }
        })
    };
    let instances = set.wait_for_instances(3, WAIT).await.unwrap();
    assert_eq!(instances.len(), 3);
    registrar.await.unwrap();
}

/// Wraps an agent so tests can cut every open subscription.
struct Flaky {
    agent: Arc<Agent>,
    cut: watch::Sender<u32>,
}

#[async_trait]
impl Discovery for Flaky {
    async fn register(
        &self,
        service: &str,
        addr: &str,
        attrs: &Attrs,
    ) -> Result<String, DiscoveryError> {
        self.agent.register(service, addr, attrs).await
    }

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        self.agent.unregister(service, addr).await
    }

    async fn heartbeat(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        self.agent.heartbeat(service, addr).await
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, DiscoveryError> {
        let mut cut = self.cut.subscribe();
        let sub = self.agent.subscribe(service).await?;
        Ok(sub
            .take_until(async move {
                let _ = cut.changed().await;
            })
            .boxed())
    }
}

#[tokio::test]
async fn test_service_set_reconnects_and_diffs() {
    let (_store, agent) = agent();
    for addr in &API[..2] {
        agent.register("api", addr, &Attrs::new()).await.unwrap();
    }
    let (cut, _) = watch::channel(0);
    let flaky = Arc::new(Flaky {
        agent: agent.clone(),
        cut,
    });
    let set = ServiceSet::connect_with(
        flaky.clone(),
        "api",
        ServiceSetConfig {
            reconnect: Attempts::new(5, Duration::from_millis(10)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut watch = set.watch().await;
    for _ in 0..3 {
        watch.recv().await.unwrap();
    }

    flaky.cut.send_modify(|n| *n += 1);
    // The set does not see these directly; it has to rebuild them.
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.unregister("api", "10.0.0.1:80").await.unwrap();
    agent.register("api", "10.0.0.3:80", &Attrs::new()).await.unwrap();

    let mut events = Vec::new();
    while events.len() < 2 {
        events.push(timeout(WAIT, watch.recv()).await.unwrap().unwrap().unwrap());
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, ServiceEvent::Down(i) if i.addr == "10.0.0.1:80")));
    assert!(events
        .iter()
        .any(|e| matches!(e, ServiceEvent::Up(i) if i.addr == "10.0.0.3:80")));
    assert_eq!(set.addrs().await, vec!["10.0.0.2:80", "10.0.0.3:80"]);
    assert_eq!(set.leader().await.unwrap().addr, "10.0.0.2:80");
}
