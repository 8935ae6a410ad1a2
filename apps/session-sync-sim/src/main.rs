mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use session_sync::{
    parse_resource, BusBridge, ClientId, DistributedSessionSnapshot, DistributedSessionUpdate,
    HostInfo, HostRegistration, SessionMetadata, SessionPatch, SessionStatus, SessionSync,
    SyncConfig, SyncCoordinator, SyncMetrics, VersionVector,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use transport_bus::{Bus, LocalBus};
use url::Url;

use crate::telemetry::{init_tracing, DEFAULT_FILTER};

#[derive(Debug, Parser)]
#[command(
    name = "session-sync-sim",
    version,
    about = "Runs two bridged session-sync nodes through a host failure and failover"
)]
struct Cli {
    /// Tracing filter; `RUST_LOG` takes precedence when set.
    #[arg(long, env = "SESSION_SYNC_LOG", default_value = DEFAULT_FILTER)]
    log_filter: String,

    /// Heartbeat interval override. Other settings come from `SESSION_SYNC_*`.
    #[arg(long, env = "SESSION_SYNC_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,

    /// Hosts registered on each node.
    #[arg(long, default_value_t = 2)]
    hosts: usize,

    /// Sessions published by the first node.
    #[arg(long, default_value_t = 3)]
    sessions: usize,

    /// Keep both nodes running after the scenario until ctrl-c.
    #[arg(long, default_value_t = false)]
    hold: bool,
}

struct Node {
    name: String,
    sync: Arc<SyncCoordinator>,
    bridge: BusBridge,
    hosts: Vec<HostRegistration>,
    metrics: SyncMetrics,
    _tasks: Vec<JoinHandle<()>>,
}

impl Node {
    async fn start(
        name: &str,
        cfg: &SyncConfig,
        bus: &Arc<LocalBus>,
        hosts: usize,
    ) -> Result<Self> {
        let metrics = SyncMetrics::new().context("register metrics")?;
        let sync = Arc::new(SyncCoordinator::from_config(cfg).with_metrics(metrics.clone()));
        sync.connect(ClientId::new(name, format!("{name} simulator"))).await?;

        let mut registrations = Vec::with_capacity(hosts);
        for i in 0..hosts {
            let host_id = format!("{name}-host-{i}");
            let endpoint = parse_resource(&format!("tcp://{host_id}.local:7000"))?;
            let info = HostInfo::new(host_id.clone(), host_id, endpoint);
            registrations.push(sync.register_host(info));
        }

        let bridge = BusBridge::attach(sync.clone(), bus.clone() as Arc<dyn Bus>, name);
        let tasks = vec![
            bridge.spawn_heartbeat_publisher(cfg.heartbeat_interval),
            sync.spawn_gc(cfg.gc_interval, cfg.session_retention),
        ];

        Ok(Self {
            name: name.to_string(),
            sync,
            bridge,
            hosts: registrations,
            metrics,
            _tasks: tasks,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let mut cfg = SyncConfig::from_env();
    if let Some(ms) = cli.heartbeat_ms {
        cfg = cfg.with_heartbeat_interval(Duration::from_millis(ms.max(1)));
    }
    if cli.hosts < 2 {
        bail!("at least two hosts per node are needed to fail over");
    }
    info!(
        heartbeat_ms = cfg.heartbeat_interval.as_millis() as u64,
        suspect_ms = cfg.suspect_threshold().as_millis() as u64,
        offline_ms = cfg.offline_threshold().as_millis() as u64,
        hosts = cli.hosts,
        sessions = cli.sessions,
        "starting session-sync-sim"
    );

    let bus = Arc::new(LocalBus::new());
    let mut alpha = Node::start("alpha", &cfg, &bus, cli.hosts).await?;
    let beta = Node::start("beta", &cfg, &bus, cli.hosts).await?;
    alpha.bridge.publish_heartbeats()?;
    beta.bridge.publish_heartbeats()?;

    let owner = alpha.hosts[0].host_id().to_string();
    let mut resources = Vec::with_capacity(cli.sessions);
    for i in 0..cli.sessions {
        let resource = parse_resource(&format!("session://alpha/{i}"))?;
        alpha
            .sync
            .publish_session(DistributedSessionSnapshot::new(
                resource.clone(),
                VersionVector::single(alpha.name.as_str(), 1),
                owner.as_str(),
                SessionMetadata::new(format!("task {i}")).with_status(SessionStatus::InProgress),
            ))
            .await;
        resources.push(resource);
    }
    settle(&beta, cli.sessions).await?;

    // Both nodes edit the first session from the same base; the later one conflicts.
    if let Some(first) = resources.first() {
        let base = alpha
            .sync
            .get_session(first)
            .await
            .context("published session missing")?
            .version;
        let from_beta = beta
            .sync
            .apply_update(DistributedSessionUpdate::new(
                first.clone(),
                base.clone(),
                SessionPatch::label("renamed by beta"),
            ))
            .await?;
        info!(outcome = from_beta.as_str(), "beta update");
        settle_version(&alpha, first, &from_beta.snapshot().version).await;
        let from_alpha = alpha
            .sync
            .apply_update(DistributedSessionUpdate::new(
                first.clone(),
                base,
                SessionPatch::status(SessionStatus::NeedsInput),
            ))
            .await?;
        info!(outcome = from_alpha.as_str(), "alpha update on stale base");
    }

    // The owning host leaves alpha; beta stops hearing about it.
    let departed = alpha.hosts.remove(0);
    departed.dispose();
    beta.sync.simulate_host_failure(&owner)?;

    let plans = beta.sync.plan_failover();
    info!(count = plans.len(), "failover planned on beta");
    for plan in &plans {
        let moved = beta
            .sync
            .reassign_session_owner(&plan.session_resource, &plan.to_host_id)
            .await?;
        if !moved {
            warn!(resource = %plan.session_resource, to = %plan.to_host_id, "reassignment refused");
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for node in [&alpha, &beta] {
        report(node).await;
    }

    if cli.hold {
        info!("holding; ctrl-c to exit");
        tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    }
    Ok(())
}

async fn settle(node: &Node, expected: usize) -> Result<()> {
    for _ in 0..100 {
        if node.sync.get_sessions().await.len() >= expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("{} never saw {expected} sessions", node.name)
}

async fn settle_version(node: &Node, resource: &Url, version: &VersionVector) {
    for _ in 0..100 {
        let current = node.sync.get_session(resource).await.map(|s| s.version);
        if current.as_ref() == Some(version) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    warn!(node = %node.name, resource = %resource, "version did not converge in time");
}

async fn report(node: &Node) {
    for host in node.sync.get_hosts().await {
        info!(node = %node.name, host_id = %host.host_id, status = host.status.as_str(), "host");
    }
    for session in node.sync.get_sessions().await {
        info!(
            node = %node.name,
            resource = %session.session_resource,
            owner = %session.owner_host_id,
            label = %session.item.label,
            "session"
        );
    }
    println!("# metrics for {}", node.name);
    println!("{}", String::from_utf8_lossy(&node.metrics.gather()));
}
