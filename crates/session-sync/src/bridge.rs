//! Binds a local [`SyncCoordinator`] to a [`Bus`] so several nodes converge.
//!
//! Every local snapshot change or removal is published as an [`Envelope`]. Remote
//! envelopes are fed back into the local coordinator as if they were local calls.
//! Echoes terminate because a node ignores its own origin and ignores snapshots whose
//! version it already holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use transport_bus::{Bus, BusResult, Envelope};
use url::Url;

use crate::coordinator::{SessionSync, SyncCoordinator};
use crate::error::SyncResult;
use crate::events::Subscription;
use crate::hosts::HostRegistration;
use crate::types::{DistributedSessionSnapshot, HostInfo};

pub const TOPIC_SNAPSHOT: &str = "session-sync.snapshot";
pub const TOPIC_REMOVED: &str = "session-sync.removed";
pub const TOPIC_HEARTBEAT: &str = "session-sync.heartbeat";

pub const BRIDGE_TOPICS: &[&str] = &[TOPIC_SNAPSHOT, TOPIC_REMOVED, TOPIC_HEARTBEAT];

const KIND_SNAPSHOT: &str = "snapshot";
const KIND_REMOVED: &str = "removed";
const KIND_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMessage {
    origin: String,
    snapshot: DistributedSessionSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemovedMessage {
    origin: String,
    session_resource: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatMessage {
    origin: String,
    host: HostInfo,
}

type RemoteHosts = Arc<Mutex<HashMap<String, HostRegistration>>>;

pub struct BusBridge {
    origin: String,
    bus: Arc<dyn Bus>,
    coordinator: Arc<SyncCoordinator>,
    remote_hosts: RemoteHosts,
    tasks: Vec<JoinHandle<()>>,
    _subscriptions: Vec<Subscription>,
}

impl BusBridge {
    /// Start publishing local changes and ingesting remote ones. `origin` must be unique
    /// per node. Must be called inside a tokio runtime.
    pub fn attach(
        coordinator: Arc<SyncCoordinator>,
        bus: Arc<dyn Bus>,
        origin: impl Into<String>,
    ) -> Self {
        let origin = origin.into();
        let remote_hosts: RemoteHosts = Arc::new(Mutex::new(HashMap::new()));

        let changed = {
            let bus = bus.clone();
            let origin = origin.clone();
            coordinator.on_did_change_session(Box::new(
                move |snapshot: &DistributedSessionSnapshot| {
                    let message = SnapshotMessage {
                        origin: origin.clone(),
                        snapshot: snapshot.clone(),
                    };
                    let envelope = Envelope::new(KIND_SNAPSHOT, message);
                    if let Err(err) = envelope.publish_on(&*bus, TOPIC_SNAPSHOT) {
                        warn!(
                            error = %err,
                            resource = %snapshot.session_resource,
                            "snapshot publish failed"
                        );
                    }
                },
            ))
        };
        let removed = {
            let bus = bus.clone();
            let origin = origin.clone();
            coordinator.on_did_remove_session(Box::new(move |resource: &Url| {
                let message = RemovedMessage {
                    origin: origin.clone(),
                    session_resource: resource.clone(),
                };
                let envelope = Envelope::new(KIND_REMOVED, message);
                if let Err(err) = envelope.publish_on(&*bus, TOPIC_REMOVED) {
                    warn!(error = %err, resource = %resource, "removal publish failed");
                }
            }))
        };

        let tasks = BRIDGE_TOPICS
            .iter()
            .map(|&topic| {
                let mut sub = bus.subscribe(topic);
                let ctx = IngestContext {
                    origin: origin.clone(),
                    coordinator: coordinator.clone(),
                    remote_hosts: remote_hosts.clone(),
                };
                tokio::spawn(async move {
                    loop {
                        match sub.recv().await {
                            Ok(msg) => ctx.ingest(topic, &msg.payload).await,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(topic, skipped, "bridge lagged behind bus");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            origin,
            bus,
            coordinator,
            remote_hosts,
            tasks,
            _subscriptions: vec![changed, removed],
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Announce every local host once. Returns how many were announced.
    pub fn publish_heartbeats(&self) -> SyncResult<usize> {
        Ok(announce_local_hosts(&*self.bus, &self.coordinator, &self.origin)?)
    }

    pub fn spawn_heartbeat_publisher(&self, interval: Duration) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let weak = Arc::downgrade(&self.coordinator);
        let origin = self.origin.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = announce_local_hosts(&*bus, &coordinator, &origin) {
                    warn!(error = %err, "heartbeat publish failed");
                }
            }
        })
    }

    /// Host ids this bridge registered on behalf of remote nodes.
    pub fn remote_host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.remote_hosts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for BusBridge {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Dropping the registrations removes the hosts and fires their final Offline.
        let remote: Vec<HostRegistration> =
            self.remote_hosts.lock().drain().map(|(_, r)| r).collect();
        drop(remote);
    }
}

fn announce_local_hosts(
    bus: &dyn Bus,
    coordinator: &SyncCoordinator,
    origin: &str,
) -> BusResult<usize> {
    let hosts = coordinator.host_registry().local_hosts();
    for host in &hosts {
        let message = HeartbeatMessage {
            origin: origin.to_string(),
            host: HostInfo::new(
                host.host_id.clone(),
                host.display_name.clone(),
                host.endpoint.clone(),
            ),
        };
        Envelope::new(KIND_HEARTBEAT, message).publish_on(bus, TOPIC_HEARTBEAT)?;
    }
    Ok(hosts.len())
}

struct IngestContext {
    origin: String,
    coordinator: Arc<SyncCoordinator>,
    remote_hosts: RemoteHosts,
}

impl IngestContext {
    async fn ingest(&self, topic: &str, payload: &[u8]) {
        match topic {
            TOPIC_SNAPSHOT => match Envelope::<SnapshotMessage>::decode(payload) {
                Ok(env) if env.payload.origin != self.origin => {
                    self.coordinator.ingest_remote_snapshot(env.payload.snapshot);
                }
                Ok(_) => {}
                Err(err) => warn!(topic, error = %err, "failed to parse snapshot envelope"),
            },
            TOPIC_REMOVED => match Envelope::<RemovedMessage>::decode(payload) {
                Ok(env) if env.payload.origin != self.origin => {
                    self.coordinator
                        .remove_session(&env.payload.session_resource)
                        .await;
                }
                Ok(_) => {}
                Err(err) => warn!(topic, error = %err, "failed to parse removal envelope"),
            },
            TOPIC_HEARTBEAT => match Envelope::<HeartbeatMessage>::decode(payload) {
                Ok(env) if env.payload.origin != self.origin => self.heartbeat(env.payload.host),
                Ok(_) => {}
                Err(err) => warn!(topic, error = %err, "failed to parse heartbeat envelope"),
            },
            _ => warn!(topic, "ignoring unknown bus topic"),
        }
    }

    fn heartbeat(&self, host: HostInfo) {
        if self.coordinator.record_heartbeat(&host.host_id).is_ok() {
            return;
        }
        debug!(host_id = %host.host_id, "registering remote host from heartbeat");
        let host_id = host.host_id.clone();
        let registration = self.coordinator.register_remote_host(host);
        self.remote_hosts.lock().insert(host_id, registration);
    }
}
