//! The sync coordinator: connection lifecycle, publish/update/reassign, and the
//! version-vector conflict check.
//!
//! All state lives in the coordinator instance. Whoever composes it owns its lifetime;
//! there is no process-wide tracker.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{Emitter, Listener, Subscription};
use crate::failover::{plan_failover, FailoverPlan};
use crate::hosts::{HostRegistration, HostRegistry, LivenessPolicy};
use crate::metrics::SyncMetrics;
use crate::store::SnapshotStore;
use crate::types::{
    ClientId, DistributedSessionSnapshot, DistributedSessionUpdate, HostInfo, HostStatus,
    SessionHost, UpdateOutcome,
};
use crate::version::CausalOrder;

/// Operations every session-sync implementation offers. The in-memory
/// [`SyncCoordinator`] resolves immediately; a networked implementation can sit behind
/// the same trait without callers changing.
#[async_trait]
pub trait SessionSync: Send + Sync {
    /// Idempotent for the same client id. Fires a connection event only on transition.
    async fn connect(&self, client: ClientId) -> SyncResult<()>;
    async fn disconnect(&self);
    fn client(&self) -> Option<ClientId>;

    fn is_connected(&self) -> bool {
        self.client().is_some()
    }

    /// Store a snapshot unconditionally. Creation, not mutation: no conflict check.
    async fn publish_session(&self, snapshot: DistributedSessionSnapshot);
    async fn apply_update(&self, update: DistributedSessionUpdate) -> SyncResult<UpdateOutcome>;
    /// `Ok(false)` when the session or host is unknown, or the new owner is offline.
    async fn reassign_session_owner(
        &self,
        session_resource: &Url,
        new_owner_host_id: &str,
    ) -> SyncResult<bool>;
    async fn remove_session(&self, session_resource: &Url) -> bool;

    async fn get_sessions(&self) -> Vec<DistributedSessionSnapshot>;
    async fn get_session(&self, session_resource: &Url) -> Option<DistributedSessionSnapshot>;
    async fn get_hosts(&self) -> Vec<SessionHost>;

    fn register_host(&self, info: HostInfo) -> HostRegistration;

    fn on_did_change_session(
        &self,
        listener: Listener<DistributedSessionSnapshot>,
    ) -> Subscription;
    fn on_did_remove_session(&self, listener: Listener<Url>) -> Subscription;
    fn on_did_change_host_status(&self, listener: Listener<SessionHost>) -> Subscription;
    fn on_did_change_connection_state(&self, listener: Listener<bool>) -> Subscription;
}

pub struct SyncCoordinator {
    hosts: HostRegistry,
    store: SnapshotStore,
    client: Mutex<Option<ClientId>>,
    session_changed: Emitter<DistributedSessionSnapshot>,
    session_removed: Emitter<Url>,
    connection_changed: Emitter<bool>,
    metrics: Option<SyncMetrics>,
}

impl SyncCoordinator {
    pub fn new(hosts: HostRegistry) -> Self {
        Self {
            hosts,
            store: SnapshotStore::new(),
            client: Mutex::new(None),
            session_changed: Emitter::new(),
            session_removed: Emitter::new(),
            connection_changed: Emitter::new(),
            metrics: None,
        }
    }

    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self::new(HostRegistry::new(LivenessPolicy::from_config(cfg)))
    }

    /// Count coordinator outcomes and host status transitions into `metrics`.
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.hosts.attach_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn host_registry(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn register_remote_host(&self, info: HostInfo) -> HostRegistration {
        self.hosts.register_remote_host(info)
    }

    pub fn record_heartbeat(&self, host_id: &str) -> SyncResult<()> {
        self.hosts.record_heartbeat(host_id)
    }

    /// Test hook: force `host_id` offline right now.
    pub fn simulate_host_failure(&self, host_id: &str) -> SyncResult<()> {
        self.hosts.simulate_host_failure(host_id)
    }

    /// Failover plans for every active session whose owner is gone or offline.
    pub fn plan_failover(&self) -> Vec<FailoverPlan> {
        plan_failover(&self.store.all(), &self.hosts.get_hosts())
    }

    /// Store a snapshot received from another node if it is causally newer than the
    /// local one, or concurrent with it and later by timestamp. Identical
    /// versions are ignored. Returns whether the snapshot was stored.
    pub fn ingest_remote_snapshot(&self, snapshot: DistributedSessionSnapshot) -> bool {
        let resource = snapshot.session_resource.clone();
        let stored = self.store.update(&resource, |current| {
            let accept = match current {
                None => true,
                Some(current) => match snapshot.version.compare(&current.version) {
                    CausalOrder::After => true,
                    CausalOrder::Before => false,
                    CausalOrder::Concurrent => {
                        snapshot.version != current.version && wins_concurrent(&snapshot, current)
                    }
                },
            };
            if accept {
                (Some(snapshot.clone()), true)
            } else {
                (None, false)
            }
        });
        if stored {
            debug!(
                resource = %resource,
                owner = %snapshot.owner_host_id,
                "remote snapshot ingested"
            );
            self.session_changed.fire(&snapshot);
        }
        stored
    }

    /// Drop inactive or archived sessions whose last change is older than `retention`.
    pub fn prune_sessions(&self, retention: Duration) -> Vec<Url> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let removed = self.store.remove_where(|snapshot| {
            (!snapshot.item.is_active() || snapshot.item.archived) && snapshot.timestamp < cutoff
        });
        removed
            .into_iter()
            .map(|snapshot| {
                self.notify_removed(&snapshot.session_resource, "expired");
                snapshot.session_resource
            })
            .collect()
    }

    pub fn spawn_gc(self: &Arc<Self>, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                let pruned = coordinator.prune_sessions(retention);
                if !pruned.is_empty() {
                    info!(count = pruned.len(), "pruned expired sessions");
                }
            }
        })
    }

    fn require_client(&self) -> SyncResult<ClientId> {
        self.client.lock().clone().ok_or(SyncError::NotConnected)
    }

    fn notify_removed(&self, resource: &Url, reason: &str) {
        info!(resource = %resource, reason, "session removed");
        if let Some(metrics) = &self.metrics {
            metrics.sessions_removed.with_label_values(&[reason]).inc();
        }
        self.session_removed.fire(resource);
    }

    fn count_reassignment(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.reassignments.with_label_values(&[result]).inc();
        }
    }
}

/// Tie-break between concurrent snapshots: the later timestamp wins, and equal
/// timestamps fall back to the larger version entry list. Every node picks the same
/// winner, so concurrent writes converge.
fn wins_concurrent(
    remote: &DistributedSessionSnapshot,
    local: &DistributedSessionSnapshot,
) -> bool {
    match remote.timestamp.cmp(&local.timestamp) {
        std::cmp::Ordering::Equal => {
            let key = |s: &DistributedSessionSnapshot| {
                s.version
                    .entries()
                    .map(|e| (e.client_id, e.counter))
                    .collect::<Vec<_>>()
            };
            key(remote) > key(local)
        }
        order => order == std::cmp::Ordering::Greater,
    }
}

#[async_trait]
impl SessionSync for SyncCoordinator {
    async fn connect(&self, client: ClientId) -> SyncResult<()> {
        {
            let mut current = self.client.lock();
            match current.as_ref() {
                Some(existing) if existing.client_id == client.client_id => return Ok(()),
                Some(existing) => {
                    return Err(SyncError::AlreadyConnected(existing.client_id.clone()))
                }
                None => {}
            }
            *current = Some(client.clone());
        }
        info!(client_id = %client.client_id, display_name = %client.display_name, "connected");
        self.connection_changed.fire(&true);
        Ok(())
    }

    async fn disconnect(&self) {
        let previous = self.client.lock().take();
        if let Some(client) = previous {
            info!(client_id = %client.client_id, "disconnected");
            self.connection_changed.fire(&false);
        }
    }

    fn client(&self) -> Option<ClientId> {
        self.client.lock().clone()
    }

    async fn publish_session(&self, snapshot: DistributedSessionSnapshot) {
        info!(
            resource = %snapshot.session_resource,
            owner = %snapshot.owner_host_id,
            "session published"
        );
        self.store.insert(snapshot.clone());
        self.session_changed.fire(&snapshot);
    }

    async fn apply_update(&self, update: DistributedSessionUpdate) -> SyncResult<UpdateOutcome> {
        let client = self.require_client()?;
        let resource = update.session_resource.clone();
        let outcome = self.store.update(&resource, |current| {
            let Some(current) = current else {
                let placeholder =
                    DistributedSessionSnapshot::placeholder(update.session_resource.clone());
                return (None, Ok(UpdateOutcome::Conflict(placeholder)));
            };
            let owner_offline = self
                .hosts
                .get_host(&current.owner_host_id)
                .is_some_and(|host| host.status == HostStatus::Offline);
            if owner_offline {
                return (None, Ok(UpdateOutcome::OwnerOffline(current.clone())));
            }
            if update.base_version.compare(&current.version) == CausalOrder::Before {
                return (None, Ok(UpdateOutcome::Conflict(current.clone())));
            }
            // Join both histories, then advance our own counter: the result strictly
            // dominates the base and the stored version.
            let version = match update
                .base_version
                .merged(&current.version)
                .incremented(&client.client_id)
            {
                Ok(version) => version,
                Err(err) => return (None, Err(err)),
            };
            let next = current.patched(version, &update.patch);
            (Some(next.clone()), Ok(UpdateOutcome::Accepted(next)))
        })?;

        if let Some(metrics) = &self.metrics {
            metrics.updates.with_label_values(&[outcome.as_str()]).inc();
        }
        match &outcome {
            UpdateOutcome::Accepted(snapshot) => {
                debug!(resource = %resource, client_id = %client.client_id, "update accepted");
                self.session_changed.fire(snapshot);
            }
            UpdateOutcome::Conflict(_) => {
                debug!(
                    resource = %resource,
                    client_id = %client.client_id,
                    "update rejected: stale base version"
                );
            }
            UpdateOutcome::OwnerOffline(snapshot) => {
                warn!(
                    resource = %resource,
                    owner = %snapshot.owner_host_id,
                    "update deferred: owner offline"
                );
            }
        }
        Ok(outcome)
    }

    async fn reassign_session_owner(
        &self,
        session_resource: &Url,
        new_owner_host_id: &str,
    ) -> SyncResult<bool> {
        let client = self.require_client()?;
        match self.hosts.get_host(new_owner_host_id) {
            None => {
                debug!(
                    resource = %session_resource,
                    new_owner_host_id,
                    "reassignment rejected: unknown host"
                );
                self.count_reassignment("unknown_host");
                return Ok(false);
            }
            Some(host) if host.status == HostStatus::Offline => {
                debug!(
                    resource = %session_resource,
                    new_owner_host_id,
                    "reassignment rejected: host offline"
                );
                self.count_reassignment("host_offline");
                return Ok(false);
            }
            Some(_) => {}
        }

        let reassigned = self.store.update(session_resource, |current| {
            let Some(current) = current else {
                return (None, Ok(None));
            };
            let version = match current.version.incremented(&client.client_id) {
                Ok(version) => version,
                Err(err) => return (None, Err(err)),
            };
            let next = current.with_owner(version, new_owner_host_id);
            (Some(next.clone()), Ok(Some((current.owner_host_id.clone(), next))))
        })?;

        let Some((previous_owner, snapshot)) = reassigned else {
            debug!(resource = %session_resource, "reassignment rejected: unknown session");
            self.count_reassignment("unknown_session");
            return Ok(false);
        };
        info!(
            resource = %session_resource,
            from = %previous_owner,
            to = new_owner_host_id,
            "session owner reassigned"
        );
        self.count_reassignment("reassigned");
        self.session_changed.fire(&snapshot);
        Ok(true)
    }

    async fn remove_session(&self, session_resource: &Url) -> bool {
        if self.store.remove(session_resource).is_some() {
            self.notify_removed(session_resource, "explicit");
            true
        } else {
            false
        }
    }

    async fn get_sessions(&self) -> Vec<DistributedSessionSnapshot> {
        self.store.all()
    }

    async fn get_session(&self, session_resource: &Url) -> Option<DistributedSessionSnapshot> {
        self.store.get(session_resource)
    }

    async fn get_hosts(&self) -> Vec<SessionHost> {
        self.hosts.get_hosts()
    }

    fn register_host(&self, info: HostInfo) -> HostRegistration {
        self.hosts.register_host(info)
    }

    fn on_did_change_session(
        &self,
        listener: Listener<DistributedSessionSnapshot>,
    ) -> Subscription {
        self.session_changed.subscribe(listener)
    }

    fn on_did_remove_session(&self, listener: Listener<Url>) -> Subscription {
        self.session_removed.subscribe(listener)
    }

    fn on_did_change_host_status(&self, listener: Listener<SessionHost>) -> Subscription {
        self.hosts.on_did_change_host_status(listener)
    }

    fn on_did_change_connection_state(&self, listener: Listener<bool>) -> Subscription {
        self.connection_changed.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_resource, SessionMetadata, SessionPatch, SessionStatus};
    use crate::version::VersionVector;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::from_config(&SyncConfig::default())
    }

    fn host(id: &str) -> HostInfo {
        HostInfo::new(id, id, parse_resource(&format!("tcp://{id}:7000")).unwrap())
    }

    fn session(resource: &Url, owner: &str) -> DistributedSessionSnapshot {
        DistributedSessionSnapshot::new(
            resource.clone(),
            VersionVector::single("c1", 1),
            owner,
            SessionMetadata::new("initial").with_status(SessionStatus::InProgress),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let sync = coordinator();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub =
            sync.on_did_change_connection_state(Box::new(move |c: &bool| sink.lock().push(*c)));

        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        assert!(sync.is_connected());
        sync.disconnect().await;
        sync.disconnect().await;
        assert_eq!(*events.lock(), vec![true, false]);
    }

    #[tokio::test]
    async fn connecting_as_someone_else_is_rejected() {
        let sync = coordinator();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let err = sync.connect(ClientId::new("c2", "Laptop")).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyConnected(id) if id == "c1"));
    }

    #[tokio::test]
    async fn mutations_require_a_connection() {
        let sync = coordinator();
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "host-1")).await;
        let update = DistributedSessionUpdate::new(
            resource.clone(),
            VersionVector::single("c1", 1),
            SessionPatch::label("X"),
        );
        assert!(matches!(
            sync.apply_update(update).await,
            Err(SyncError::NotConnected)
        ));
        assert!(matches!(
            sync.reassign_session_owner(&resource, "host-2").await,
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unknown_session_yields_placeholder_conflict() {
        let sync = coordinator();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let resource = parse_resource("session://local/missing").unwrap();
        let outcome = sync
            .apply_update(DistributedSessionUpdate::new(
                resource.clone(),
                VersionVector::new(),
                SessionPatch::label("X"),
            ))
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Conflict(snapshot) => {
                assert_eq!(snapshot.session_resource, resource);
                assert!(snapshot.version.is_empty());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(sync.get_session(&resource).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_base_is_accepted_last_writer_wins() {
        let sync = coordinator();
        sync.connect(ClientId::new("c2", "Laptop")).await.unwrap();
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "host-1")).await;

        let outcome = sync
            .apply_update(DistributedSessionUpdate::new(
                resource.clone(),
                VersionVector::single("c2", 3),
                SessionPatch::archived(true),
            ))
            .await
            .unwrap();
        let snapshot = outcome.snapshot();
        assert!(outcome.is_accepted());
        assert!(snapshot.item.archived);
        assert_eq!(snapshot.version.counter("c1"), 1);
        assert_eq!(snapshot.version.counter("c2"), 4);
    }

    #[tokio::test]
    async fn unregistered_owner_does_not_block_updates() {
        let sync = coordinator();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "elsewhere")).await;
        let outcome = sync
            .apply_update(DistributedSessionUpdate::new(
                resource,
                VersionVector::single("c1", 1),
                SessionPatch::status(SessionStatus::Completed),
            ))
            .await
            .unwrap();
        assert!(outcome.is_accepted());
    }

    #[tokio::test]
    async fn reassignment_rejects_unknown_and_offline_targets() {
        let sync = coordinator();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let _h1 = sync.register_host(host("host-1"));
        let _h2 = sync.register_host(host("host-2"));
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "host-1")).await;

        assert!(!sync.reassign_session_owner(&resource, "ghost").await.unwrap());
        sync.simulate_host_failure("host-2").unwrap();
        assert!(!sync.reassign_session_owner(&resource, "host-2").await.unwrap());
        let missing = parse_resource("session://local/none").unwrap();
        sync.record_heartbeat("host-2").unwrap();
        assert!(!sync.reassign_session_owner(&missing, "host-2").await.unwrap());
        assert_eq!(
            sync.get_session(&resource).await.unwrap().owner_host_id,
            "host-1"
        );
    }

    #[tokio::test]
    async fn remove_session_fires_once() {
        let sync = coordinator();
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "host-1")).await;
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let _sub =
            sync.on_did_remove_session(Box::new(move |r: &Url| sink.lock().push(r.clone())));

        assert!(sync.remove_session(&resource).await);
        assert!(!sync.remove_session(&resource).await);
        assert_eq!(*removed.lock(), vec![resource]);
    }

    #[tokio::test]
    async fn prune_drops_only_stale_inactive_sessions() {
        let sync = coordinator();
        let old = SystemTime::now() - Duration::from_secs(7200);
        let active = parse_resource("session://local/active").unwrap();
        let done = parse_resource("session://local/done").unwrap();
        let fresh = parse_resource("session://local/fresh").unwrap();

        let mut s = session(&active, "host-1");
        s.timestamp = old;
        sync.publish_session(s).await;
        let mut s = session(&done, "host-1");
        s.item.status = Some(SessionStatus::Completed);
        s.timestamp = old;
        sync.publish_session(s).await;
        let mut s = session(&fresh, "host-1");
        s.item.status = Some(SessionStatus::Completed);
        sync.publish_session(s).await;

        let pruned = sync.prune_sessions(Duration::from_secs(3600));
        assert_eq!(pruned, vec![done]);
        assert_eq!(sync.get_sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn remote_snapshots_apply_only_when_newer() {
        let sync = coordinator();
        let resource = parse_resource("session://local/1").unwrap();
        let base = session(&resource, "host-1");
        sync.publish_session(base.clone()).await;

        assert!(!sync.ingest_remote_snapshot(base.clone()));
        let mut stale = base.clone();
        stale.version = VersionVector::new();
        assert!(!sync.ingest_remote_snapshot(stale));

        let mut newer = base.clone();
        newer.version = base.version.incremented("c9").unwrap();
        newer.item.label = "remote".into();
        assert!(sync.ingest_remote_snapshot(newer));
        assert_eq!(sync.get_session(&resource).await.unwrap().item.label, "remote");
    }

    #[tokio::test]
    async fn concurrent_remote_snapshot_needs_a_later_timestamp() {
        let sync = coordinator();
        let resource = parse_resource("session://local/1").unwrap();
        let mut local = session(&resource, "host-1");
        local.version = VersionVector::single("c1", 2);
        sync.publish_session(local.clone()).await;

        let mut older = local.clone();
        older.version = VersionVector::single("c2", 1);
        older.item.label = "older".into();
        older.timestamp = local.timestamp - Duration::from_secs(5);
        assert!(!sync.ingest_remote_snapshot(older));
        assert_eq!(sync.get_session(&resource).await.unwrap().item.label, "initial");

        let mut newer = local.clone();
        newer.version = VersionVector::single("c2", 1);
        newer.item.label = "newer".into();
        newer.timestamp = local.timestamp + Duration::from_secs(5);
        assert!(sync.ingest_remote_snapshot(newer));
        assert_eq!(sync.get_session(&resource).await.unwrap().item.label, "newer");
    }

    #[tokio::test]
    async fn concurrent_tie_is_broken_the_same_way_on_both_sides() {
        let resource = parse_resource("session://local/1").unwrap();
        let at = SystemTime::now();
        let mut left = session(&resource, "host-1");
        left.version = VersionVector::single("c1", 2);
        left.item.label = "left".into();
        left.timestamp = at;
        let mut right = left.clone();
        right.version = VersionVector::single("c2", 1);
        right.item.label = "right".into();

        let a = coordinator();
        a.publish_session(left.clone()).await;
        let b = coordinator();
        b.publish_session(right.clone()).await;
        let a_took = a.ingest_remote_snapshot(right);
        let b_took = b.ingest_remote_snapshot(left);

        assert_ne!(a_took, b_took);
        assert_eq!(
            a.get_session(&resource).await.unwrap(),
            b.get_session(&resource).await.unwrap()
        );
    }

    #[tokio::test]
    async fn exhausted_counter_is_an_error_not_a_wrap() {
        let sync = coordinator();
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let _h2 = sync.register_host(host("host-2"));
        let resource = parse_resource("session://local/1").unwrap();
        let mut full = session(&resource, "host-1");
        full.version = VersionVector::single("c1", u64::MAX);
        sync.publish_session(full.clone()).await;

        let result = sync
            .apply_update(DistributedSessionUpdate::new(
                resource.clone(),
                full.version.clone(),
                SessionPatch::label("X"),
            ))
            .await;
        assert!(matches!(result, Err(SyncError::CounterExhausted(id)) if id == "c1"));
        assert!(matches!(
            sync.reassign_session_owner(&resource, "host-2").await,
            Err(SyncError::CounterExhausted(_))
        ));
        assert_eq!(sync.get_session(&resource).await.unwrap(), full);
    }

    #[tokio::test]
    async fn coordinator_metrics_reach_the_host_registry() {
        let metrics = SyncMetrics::new().unwrap();
        let sync = coordinator().with_metrics(metrics.clone());
        let _h1 = sync.register_host(host("host-1"));
        sync.simulate_host_failure("host-1").unwrap();
        assert_eq!(metrics.host_status.with_label_values(&["online"]).get(), 1);
        assert_eq!(metrics.host_status.with_label_values(&["offline"]).get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_task_prunes_expired_sessions() {
        let sync = Arc::new(coordinator());
        let resource = parse_resource("session://local/done").unwrap();
        let mut done = session(&resource, "host-1");
        done.item.status = Some(SessionStatus::Completed);
        done.timestamp = SystemTime::now() - Duration::from_secs(7200);
        sync.publish_session(done).await;
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let _sub =
            sync.on_did_remove_session(Box::new(move |r: &Url| sink.lock().push(r.clone())));

        let _gc = sync.spawn_gc(Duration::from_secs(60), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(removed.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*removed.lock(), vec![resource.clone()]);
        assert!(sync.get_session(&resource).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gc_task_stops_with_its_coordinator() {
        let sync = Arc::new(coordinator());
        let gc = sync.spawn_gc(Duration::from_secs(60), Duration::from_secs(3600));
        drop(sync);
        let finished = tokio::time::timeout(Duration::from_secs(120), gc).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn metrics_track_update_outcomes() {
        let metrics = SyncMetrics::new().unwrap();
        let sync = coordinator().with_metrics(metrics.clone());
        sync.connect(ClientId::new("c1", "Desk")).await.unwrap();
        let resource = parse_resource("session://local/1").unwrap();
        sync.publish_session(session(&resource, "host-1")).await;
        let update = DistributedSessionUpdate::new(
            resource,
            VersionVector::single("c1", 1),
            SessionPatch::label("X"),
        );
        sync.apply_update(update.clone()).await.unwrap();
        sync.apply_update(update).await.unwrap();
        assert_eq!(metrics.updates.with_label_values(&["accepted"]).get(), 1);
        assert_eq!(metrics.updates.with_label_values(&["conflict"]).get(), 1);
    }
}
