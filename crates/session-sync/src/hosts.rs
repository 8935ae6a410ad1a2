//! Host registry and heartbeat-driven liveness.
//!
//! Liveness is purely time based. Every registered host gets a liveness checker that
//! derives its status from the time since the last heartbeat. Local hosts also get a
//! heartbeat sender that checks themselves in; remote hosts are fed through
//! [`HostRegistry::record_heartbeat`] by whatever transport carries their heartbeats.
//!
//! Timer tasks only hold a weak reference to the registry and are tagged with the
//! registration generation, so a timer can never act on an entry it does not own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{Emitter, Subscription};
use crate::metrics::SyncMetrics;
use crate::types::{HostInfo, HostStatus, SessionHost};

/// Thresholds that turn "time since last heartbeat" into a [`HostStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub suspect_after: Duration,
    pub offline_after: Duration,
}

impl LivenessPolicy {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            heartbeat_interval: cfg.heartbeat_interval,
            suspect_after: cfg.suspect_threshold(),
            offline_after: cfg.offline_threshold(),
        }
    }

    pub fn status_for(&self, elapsed: Duration) -> HostStatus {
        if elapsed >= self.offline_after {
            HostStatus::Offline
        } else if elapsed >= self.suspect_after {
            HostStatus::Suspect
        } else {
            HostStatus::Online
        }
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostOrigin {
    Local,
    Remote,
}

struct HostEntry {
    host: SessionHost,
    origin: HostOrigin,
    generation: u64,
    last_seen: Instant,
    // Added to the real elapsed time; lets tests age a host without waiting.
    backdate: Duration,
}

impl HostEntry {
    fn elapsed(&self) -> Duration {
        self.last_seen.elapsed() + self.backdate
    }
}

struct RegistryInner {
    hosts: Mutex<HashMap<String, HostEntry>>,
    policy: LivenessPolicy,
    status_changed: Emitter<SessionHost>,
    next_generation: AtomicU64,
    metrics: Mutex<Option<SyncMetrics>>,
}

#[derive(Clone)]
pub struct HostRegistry {
    inner: Arc<RegistryInner>,
}

impl HostRegistry {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self::build(policy, None)
    }

    pub fn with_metrics(policy: LivenessPolicy, metrics: SyncMetrics) -> Self {
        Self::build(policy, Some(metrics))
    }

    fn build(policy: LivenessPolicy, metrics: Option<SyncMetrics>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hosts: Mutex::new(HashMap::new()),
                policy,
                status_changed: Emitter::new(),
                next_generation: AtomicU64::new(1),
                metrics: Mutex::new(metrics),
            }),
        }
    }

    /// Count status transitions into `metrics` from now on, replacing any earlier sink.
    pub fn attach_metrics(&self, metrics: SyncMetrics) {
        *self.inner.metrics.lock() = Some(metrics);
    }

    pub fn policy(&self) -> LivenessPolicy {
        self.inner.policy
    }

    /// Register a host that heartbeats itself in. Must be called inside a tokio runtime.
    pub fn register_host(&self, info: HostInfo) -> HostRegistration {
        self.register(info, HostOrigin::Local)
    }

    /// Register a host whose heartbeats arrive via [`HostRegistry::record_heartbeat`].
    pub fn register_remote_host(&self, info: HostInfo) -> HostRegistration {
        self.register(info, HostOrigin::Remote)
    }

    fn register(&self, info: HostInfo, origin: HostOrigin) -> HostRegistration {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let host = SessionHost {
            host_id: info.host_id.clone(),
            display_name: info.display_name,
            status: HostStatus::Online,
            endpoint: info.endpoint,
            last_heartbeat: SystemTime::now(),
        };
        let replaced = self.inner.hosts.lock().insert(
            info.host_id.clone(),
            HostEntry {
                host: host.clone(),
                origin,
                generation,
                last_seen: Instant::now(),
                backdate: Duration::ZERO,
            },
        );
        if replaced.is_some() {
            warn!(host_id = %info.host_id, "host re-registered; previous registration superseded");
        }
        info!(host_id = %info.host_id, ?origin, "host registered");
        self.inner.notify(&host);

        let interval = self.inner.policy.heartbeat_interval;
        let weak = Arc::downgrade(&self.inner);
        let mut tasks = Vec::with_capacity(2);
        if origin == HostOrigin::Local {
            tasks.push(spawn_ticker(
                weak.clone(),
                info.host_id.clone(),
                generation,
                interval,
                |inner, host_id, generation| inner.touch(host_id, Some(generation)),
            ));
        }
        tasks.push(spawn_ticker(
            weak.clone(),
            info.host_id.clone(),
            generation,
            interval,
            |inner, host_id, generation| inner.check_liveness(host_id, Some(generation)),
        ));

        HostRegistration {
            registry: weak,
            host_id: info.host_id,
            generation,
            tasks,
            released: false,
        }
    }

    /// Point-in-time copy of every known host, ordered by host id.
    pub fn get_hosts(&self) -> Vec<SessionHost> {
        let mut hosts: Vec<SessionHost> = self
            .inner
            .hosts
            .lock()
            .values()
            .map(|entry| entry.host.clone())
            .collect();
        hosts.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        hosts
    }

    pub fn get_host(&self, host_id: &str) -> Option<SessionHost> {
        self.inner
            .hosts
            .lock()
            .get(host_id)
            .map(|entry| entry.host.clone())
    }

    /// Hosts registered through [`HostRegistry::register_host`] on this node.
    pub fn local_hosts(&self) -> Vec<SessionHost> {
        let mut hosts: Vec<SessionHost> = self
            .inner
            .hosts
            .lock()
            .values()
            .filter(|entry| entry.origin == HostOrigin::Local)
            .map(|entry| entry.host.clone())
            .collect();
        hosts.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        hosts
    }

    pub fn record_heartbeat(&self, host_id: &str) -> SyncResult<()> {
        if self.inner.touch(host_id, None) {
            Ok(())
        } else {
            Err(SyncError::UnknownHost(host_id.to_string()))
        }
    }

    /// Age the host past the offline threshold and re-derive its status now, without
    /// waiting for the liveness timer.
    pub fn simulate_host_failure(&self, host_id: &str) -> SyncResult<()> {
        {
            let mut hosts = self.inner.hosts.lock();
            let entry = hosts
                .get_mut(host_id)
                .ok_or_else(|| SyncError::UnknownHost(host_id.to_string()))?;
            let offline_after = self.inner.policy.offline_after;
            entry.backdate = offline_after;
            entry.last_seen = Instant::now();
            entry.host.last_heartbeat = SystemTime::now()
                .checked_sub(offline_after)
                .unwrap_or(SystemTime::UNIX_EPOCH);
        }
        warn!(host_id, "simulating host failure");
        self.inner.check_liveness(host_id, None);
        Ok(())
    }

    pub fn on_did_change_host_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionHost) + Send + Sync + 'static,
    {
        self.inner.status_changed.subscribe(listener)
    }
}

impl RegistryInner {
    /// Heartbeat receipt. Returns false when the host (or this generation of it) is gone.
    fn touch(&self, host_id: &str, generation: Option<u64>) -> bool {
        let changed = {
            let mut hosts = self.hosts.lock();
            let Some(entry) = hosts.get_mut(host_id) else {
                return false;
            };
            if generation.is_some_and(|g| g != entry.generation) {
                return false;
            }
            entry.last_seen = Instant::now();
            entry.backdate = Duration::ZERO;
            entry.host.last_heartbeat = SystemTime::now();
            if entry.host.status != HostStatus::Online {
                entry.host.status = HostStatus::Online;
                Some(entry.host.clone())
            } else {
                None
            }
        };
        if let Some(host) = changed {
            self.notify(&host);
        }
        true
    }

    fn check_liveness(&self, host_id: &str, generation: Option<u64>) -> bool {
        let changed = {
            let mut hosts = self.hosts.lock();
            let Some(entry) = hosts.get_mut(host_id) else {
                return false;
            };
            if generation.is_some_and(|g| g != entry.generation) {
                return false;
            }
            let status = self.policy.status_for(entry.elapsed());
            if status != entry.host.status {
                entry.host.status = status;
                Some(entry.host.clone())
            } else {
                None
            }
        };
        if let Some(host) = changed {
            self.notify(&host);
        }
        true
    }

    fn remove(&self, host_id: &str, generation: u64) {
        let removed = {
            let mut hosts = self.hosts.lock();
            let owned = hosts
                .get(host_id)
                .is_some_and(|entry| entry.generation == generation);
            if owned {
                hosts.remove(host_id)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            info!(host_id, "host registration disposed");
            let mut host = entry.host;
            host.status = HostStatus::Offline;
            self.notify(&host);
        }
    }

    fn notify(&self, host: &SessionHost) {
        debug!(host_id = %host.host_id, status = host.status.as_str(), "host status changed");
        if let Some(metrics) = self.metrics.lock().as_ref() {
            metrics
                .host_status
                .with_label_values(&[host.status.as_str()])
                .inc();
        }
        self.status_changed.fire(host);
    }
}

fn spawn_ticker<F>(
    registry: Weak<RegistryInner>,
    host_id: String,
    generation: u64,
    interval: Duration,
    on_tick: F,
) -> JoinHandle<()>
where
    F: Fn(&RegistryInner, &str, u64) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = registry.upgrade() else {
                break;
            };
            if !on_tick(&*inner, &host_id, generation) {
                break;
            }
        }
    })
}

/// Keeps a host registered. Releasing it (explicitly or by drop) stops both timers,
/// removes the host, and fires one final `Offline` status event.
#[must_use = "dropping a HostRegistration unregisters the host"]
pub struct HostRegistration {
    registry: Weak<RegistryInner>,
    host_id: String,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl HostRegistration {
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.host_id, self.generation);
        }
    }
}

impl Drop for HostRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for HostRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistration")
            .field("host_id", &self.host_id)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}
