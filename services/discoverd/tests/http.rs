use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use tug_discoverd::{
    http, register_with_heartbeat, Agent, AgentConfig, Attrs, Discovery, DiscoveryError,
    HttpDiscovery, MemoryStore, ServiceSet, SubscribeEvent,
};

const WAIT: Duration = Duration::from_secs(5);

async fn serve(config: AgentConfig) -> (Arc<Agent>, HttpDiscovery) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tug_discoverd=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    MemoryStore::spawn_expiry(&store, Duration::from_millis(50));
    let agent = Arc::new(Agent::new(store, config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::create_router(agent.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    let client = HttpDiscovery::new(format!("http://{addr}"))
        .unwrap()
        .with_heartbeat(agent.config().heartbeat);
    (agent, client)
}

#[tokio::test]
async fn test_register_and_subscribe_over_http() {
    let (agent, client) = serve(AgentConfig {
        external_ip: Some("192.168.0.7".into()),
        ..Default::default()
    })
    .await;

    let attrs: Attrs = [("proto".to_string(), "http".to_string())].into();
    let resolved = client.register("api", ":8080", &attrs).await.unwrap();
    assert_eq!(resolved, "192.168.0.7:8080");

    let mut sub = client.subscribe("api").await.unwrap();
    match timeout(WAIT, sub.next()).await.unwrap() {
        Some(Ok(SubscribeEvent::Update(update))) => {
            assert_eq!(update.addr, "192.168.0.7:8080");
            assert_eq!(update.attrs, attrs);
            assert!(update.online);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert!(matches!(
        timeout(WAIT, sub.next()).await.unwrap(),
        Some(Ok(SubscribeEvent::Current))
    ));

    client.heartbeat("api", "192.168.0.7:8080").await.unwrap();
    agent.unregister("api", "192.168.0.7:8080").await.unwrap();
    match timeout(WAIT, sub.next()).await.unwrap() {
        Some(Ok(SubscribeEvent::Update(update))) => assert!(!update.online),
        other => panic!("expected offline, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_errors_map_to_discovery_errors() {
    let (_agent, client) = serve(AgentConfig::default()).await;

    let err = client.heartbeat("api", "10.0.0.1:80").await.unwrap_err();
    assert!(err.is_not_registered());

    let err = client.register("api", ":80", &Attrs::new()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidName { .. }), "{err:?}");

    client.unregister("api", "10.0.0.1:80").await.unwrap();
}

#[tokio::test]
async fn test_heartbeater_keeps_instance_alive_over_http() {
    let (_agent, client) = serve(AgentConfig {
        heartbeat: Duration::from_millis(100),
        grace: Duration::from_millis(100),
        external_ip: None,
    })
    .await;
    let client: Arc<dyn Discovery> = Arc::new(client);

    let set = ServiceSet::connect(client.clone(), "tug-host").await.unwrap();
    let heartbeater =
        register_with_heartbeat(client.clone(), "tug-host", "10.0.0.5:1113", Attrs::new())
            .await
            .unwrap();
    assert_eq!(heartbeater.addr(), "10.0.0.5:1113");
    set.wait_for_instances(1, WAIT).await.unwrap();

    // Several TTLs pass without the instance dropping out.
    let mut watch = set.watch().await;
    for _ in 0..2 {
        watch.recv().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(set.addrs().await, vec!["10.0.0.5:1113"]);

    heartbeater.stop().await.unwrap();
    let down = timeout(WAIT, watch.recv()).await.unwrap().unwrap().unwrap();
    assert!(matches!(down, tug_discoverd::ServiceEvent::Down(_)));
    assert!(set.addrs().await.is_empty());
}

#[tokio::test]
async fn test_heartbeater_reregisters_expired_instance() {
    let (agent, client) = serve(AgentConfig {
        heartbeat: Duration::from_millis(100),
        grace: Duration::from_millis(100),
        external_ip: None,
    })
    .await;
    let heartbeater = agent
        .register_with_heartbeat("tug-host", "10.0.0.6:1113", Attrs::new())
        .await
        .unwrap();

    // Simulate the key expiring during a partition.
    agent.unregister("tug-host", "10.0.0.6:1113").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    client.heartbeat("tug-host", "10.0.0.6:1113").await.unwrap();

    heartbeater.stop().await.unwrap();
    assert!(client
        .heartbeat("tug-host", "10.0.0.6:1113")
        .await
        .unwrap_err()
        .is_not_registered());
}
