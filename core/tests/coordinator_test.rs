mod common;

use std::time::Duration;

use common::{endpoint, eventually, fast_config, registration, ScriptedTransport};
use switchboard_core::{
    Coordinator, CoordinatorConfig, DeliveryStatus, DiscoveryQuery, HealthState, MessageEnvelope,
    MessageType, Priority, Recipient, RegistryEvent, SwitchboardError, ViolationKind,
};

#[tokio::test]
async fn test_discover_deliver_then_expire() {
    let transport = ScriptedTransport::new();
    let mut coordinator = Coordinator::new(fast_config(), transport.clone()).unwrap();
    coordinator.start().await.unwrap();

    coordinator
        .directory
        .register(registration("A1", &["billing"]))
        .unwrap();
    let found = coordinator
        .directory
        .discover(&DiscoveryQuery::new(["billing"]))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "A1");

    let env = MessageEnvelope::new(
        "client",
        Recipient::capability(["billing"]),
        MessageType::Request,
        5.0,
    )
    .with_priority(Priority::Critical);
    let outcomes = coordinator
        .router
        .send(env)
        .unwrap()
        .wait_all()
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, DeliveryStatus::Delivered);
    assert_eq!(transport.calls()[0].endpoint, endpoint("A1"));

    // No heartbeats: the sweeper expires A1 once its lease runs out.
    let gone = eventually(Duration::from_secs(2), || {
        coordinator.directory.get("A1").map(|d| d.health) == Some(HealthState::Expired)
    })
    .await;
    assert!(gone);
    assert!(coordinator
        .directory
        .discover(&DiscoveryQuery::new(["billing"]).include_degraded())
        .unwrap()
        .is_empty());

    let late = MessageEnvelope::new(
        "client",
        Recipient::capability(["billing"]),
        MessageType::Request,
        5.0,
    );
    assert!(matches!(
        coordinator.router.send(late),
        Err(SwitchboardError::NotFound(_))
    ));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_keep_agent_discoverable() {
    let transport = ScriptedTransport::new();
    let mut coordinator = Coordinator::new(fast_config(), transport).unwrap();
    coordinator.start().await.unwrap();
    coordinator
        .directory
        .register(registration("A1", &["billing"]))
        .unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.directory.heartbeat("A1").unwrap();
    }
    assert_eq!(
        coordinator
            .directory
            .discover(&DiscoveryQuery::new(["billing"]))
            .unwrap()
            .len(),
        1
    );
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_agent_is_demoted_by_monitor() {
    let transport = ScriptedTransport::new();
    transport.script(
        &endpoint("A1"),
        (0..20)
            .map(|_| Err(switchboard_core::TransportError::Fatal("500".into())))
            .collect(),
    );
    let config = CoordinatorConfig {
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_lease: Duration::from_secs(60),
        sla_cooldown: Duration::from_secs(30),
        ..fast_config()
    };
    let mut coordinator = Coordinator::new(config, transport).unwrap();
    coordinator.start().await.unwrap();
    coordinator
        .directory
        .register(registration("A1", &["billing"]))
        .unwrap();

    for _ in 0..5 {
        let env = MessageEnvelope::new("client", Recipient::agent("A1"), MessageType::Event, 5.0);
        coordinator
            .router
            .send(env)
            .unwrap()
            .wait_all()
            .await
            .unwrap();
    }

    let demoted = eventually(Duration::from_secs(1), || {
        coordinator.directory.get("A1").map(|d| d.health) == Some(HealthState::Degraded)
    })
    .await;
    assert!(demoted);
    // Healthy-only discovery now skips it.
    assert!(coordinator
        .directory
        .discover(&DiscoveryQuery::new(["billing"]))
        .unwrap()
        .is_empty());
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pending_deliveries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig {
        heartbeat_lease: Duration::from_secs(30),
        snapshot_path: Some(dir.path().join("state.json")),
        snapshot_interval: None,
        ..fast_config()
    };

    let slow = ScriptedTransport::new();
    slow.slow(&endpoint("A1"), Duration::from_secs(5));
    let mut first = Coordinator::new(config.clone(), slow).unwrap();
    first.start().await.unwrap();
    first
        .directory
        .register(registration("A1", &["billing"]))
        .unwrap();
    for i in 0..3 {
        let env = MessageEnvelope::new("client", Recipient::agent("A1"), MessageType::Event, 10.0)
            .with_message_id(format!("m{i}"));
        first.router.send(env).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.shutdown().await.unwrap();
    assert!(dir.path().join("state.json").exists());

    let fast = ScriptedTransport::new();
    let mut second = Coordinator::new(config, fast.clone()).unwrap();
    second.start().await.unwrap();
    assert!(second.directory.live("A1").is_ok());

    let all_delivered = eventually(Duration::from_secs(2), || fast.delivered().len() == 3).await;
    assert!(all_delivered, "delivered {:?}", fast.delivered());
    let mut ids = fast.delivered();
    ids.sort();
    assert_eq!(ids, vec!["m0", "m1", "m2"]);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_agent_is_demoted_before_it_expires() {
    // Same proportions as the defaults: lease covers three missed beats plus a sweep.
    let config = CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_lease: Duration::from_millis(400),
        heartbeat_miss_cap: 2,
        sweep_interval: Duration::from_millis(5),
        ..fast_config()
    };
    let mut coordinator = Coordinator::new(config, ScriptedTransport::new()).unwrap();
    let mut events = coordinator.directory.subscribe();
    coordinator.start().await.unwrap();
    coordinator
        .directory
        .register(registration("A1", &["billing"]))
        .unwrap();

    let mut demoted_first = false;
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.unwrap() {
                RegistryEvent::HealthChanged {
                    to: HealthState::Degraded,
                    ..
                } => demoted_first = true,
                RegistryEvent::Expired { .. } => break,
                _ => {}
            }
        }
    })
    .await
    .expect("agent expires within the lease");
    assert!(demoted_first);

    let snapshot = coordinator.monitor.snapshot("A1").unwrap();
    assert!(snapshot.consecutive_missed_heartbeats >= 3);
    assert!(snapshot
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::MissedHeartbeats));
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_agent_churn_releases_queues_and_windows() {
    let config = CoordinatorConfig {
        tombstone_retention: Duration::from_millis(50),
        ..fast_config()
    };
    let mut coordinator = Coordinator::new(config, ScriptedTransport::new()).unwrap();
    coordinator.start().await.unwrap();

    for i in 0..5 {
        let id = format!("temp{i}");
        coordinator
            .directory
            .register(registration(&id, &["billing"]))
            .unwrap();
        let env = MessageEnvelope::new("client", Recipient::agent(&id), MessageType::Event, 5.0);
        coordinator
            .router
            .send(env)
            .unwrap()
            .wait_all()
            .await
            .unwrap();
    }
    assert_eq!(coordinator.router.active_queues(), 5);
    let tracked = eventually(Duration::from_secs(1), || coordinator.monitor.tracked() == 5).await;
    assert!(tracked);

    // No heartbeats: each agent expires, its tombstone is purged, and
    // nothing keyed by it is left behind.
    let released = eventually(Duration::from_secs(2), || {
        coordinator.directory.is_empty()
            && coordinator.router.active_queues() == 0
            && coordinator.monitor.tracked() == 0
            && coordinator.directory.tracked_loads() == 0
    })
    .await;
    assert!(released);
    coordinator.shutdown().await.unwrap();
}
