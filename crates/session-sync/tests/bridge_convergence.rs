use std::sync::Arc;
use std::time::Duration;

use session_sync::{
    parse_resource, BusBridge, ClientId, DistributedSessionSnapshot, DistributedSessionUpdate,
    HostInfo, HostStatus, SessionMetadata, SessionPatch, SessionStatus, SessionSync, SyncConfig,
    SyncCoordinator, VersionVector,
};
use transport_bus::{Bus, LocalBus};

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Node {
    sync: Arc<SyncCoordinator>,
    bridge: BusBridge,
}

async fn node(bus: &Arc<LocalBus>, name: &str) -> Result<Node, Box<dyn std::error::Error>> {
    let sync = Arc::new(SyncCoordinator::from_config(&SyncConfig::default()));
    sync.connect(ClientId::new(name, name)).await?;
    let bridge = BusBridge::attach(sync.clone(), bus.clone() as Arc<dyn Bus>, name);
    Ok(Node { sync, bridge })
}

/// Poll until `check` holds, yielding to the bridge tasks between attempts.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn published_and_updated_sessions_reach_the_other_node() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "node-a").await?;
    let b = node(&bus, "node-b").await?;
    let resource = parse_resource("session://shared/1")?;

    a.sync
        .publish_session(DistributedSessionSnapshot::new(
            resource.clone(),
            VersionVector::single("node-a", 1),
            "host-a",
            SessionMetadata::new("shared").with_status(SessionStatus::InProgress),
        ))
        .await;
    let (a_sync, b_sync, res) = (&a.sync, &b.sync, &resource);
    eventually(|| async move { b_sync.get_session(res).await.is_some() }).await;

    let base = b.sync.get_session(&resource).await.expect("replicated").version;
    let outcome = b
        .sync
        .apply_update(DistributedSessionUpdate::new(
            resource.clone(),
            base,
            SessionPatch::label("renamed on b"),
        ))
        .await?;
    assert!(outcome.is_accepted());

    eventually(|| async move {
        a_sync
            .get_session(res)
            .await
            .is_some_and(|s| s.item.label == "renamed on b")
    })
    .await;
    assert_eq!(
        a.sync.get_session(&resource).await.map(|s| s.version),
        b.sync.get_session(&resource).await.map(|s| s.version)
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_updates_from_one_base_converge() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "node-a").await?;
    let b = node(&bus, "node-b").await?;
    let resource = parse_resource("session://shared/3")?;

    a.sync
        .publish_session(DistributedSessionSnapshot::new(
            resource.clone(),
            VersionVector::single("node-a", 1),
            "host-a",
            SessionMetadata::new("shared").with_status(SessionStatus::InProgress),
        ))
        .await;
    let (a_sync, b_sync, res) = (&a.sync, &b.sync, &resource);
    eventually(|| async move { b_sync.get_session(res).await.is_some() }).await;

    // Neither update yields before both are applied, so each node writes on the
    // shared base without having seen the other's write.
    let base = VersionVector::single("node-a", 1);
    let on_a = a
        .sync
        .apply_update(DistributedSessionUpdate::new(
            resource.clone(),
            base.clone(),
            SessionPatch::label("from a"),
        ))
        .await?;
    let on_b = b
        .sync
        .apply_update(DistributedSessionUpdate::new(
            resource.clone(),
            base,
            SessionPatch::label("from b"),
        ))
        .await?;
    assert!(on_a.is_accepted() && on_b.is_accepted());
    assert_ne!(on_a.snapshot().version, on_b.snapshot().version);

    eventually(|| async move {
        let left = a_sync.get_session(res).await;
        let right = b_sync.get_session(res).await;
        left.is_some() && left == right
    })
    .await;
    let settled = a.sync.get_session(&resource).await.expect("converged");
    assert!(settled.item.label == "from a" || settled.item.label == "from b");
    Ok(())
}

#[tokio::test]
async fn removal_propagates() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "node-a").await?;
    let b = node(&bus, "node-b").await?;
    let resource = parse_resource("session://shared/2")?;

    a.sync
        .publish_session(DistributedSessionSnapshot::new(
            resource.clone(),
            VersionVector::single("node-a", 1),
            "host-a",
            SessionMetadata::new("short lived"),
        ))
        .await;
    let (b_sync, res) = (&b.sync, &resource);
    eventually(|| async move { b_sync.get_session(res).await.is_some() }).await;

    assert!(a.sync.remove_session(&resource).await);
    eventually(|| async move { b_sync.get_session(res).await.is_none() }).await;
    Ok(())
}

#[tokio::test]
async fn heartbeats_register_remote_hosts() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "node-a").await?;
    let b = node(&bus, "node-b").await?;
    let _host = a.sync.register_host(HostInfo::new(
        "host-a",
        "Host A",
        parse_resource("tcp://host-a:7000")?,
    ));

    let b_sync = &b.sync;
    assert_eq!(a.bridge.publish_heartbeats()?, 1);
    eventually(|| async move {
        b_sync
            .get_hosts()
            .await
            .iter()
            .any(|h| h.host_id == "host-a" && h.status == HostStatus::Online)
    })
    .await;
    assert_eq!(b.bridge.remote_host_ids(), vec!["host-a".to_string()]);

    b.sync.simulate_host_failure("host-a")?;
    a.bridge.publish_heartbeats()?;
    eventually(|| async move {
        b_sync
            .get_hosts()
            .await
            .iter()
            .any(|h| h.host_id == "host-a" && h.status == HostStatus::Online)
    })
    .await;
    Ok(())
}
