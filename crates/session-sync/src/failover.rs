//! Failover policy.
//!
//! Pure functions only. Nothing here reassigns anything: a reconciliation loop outside
//! this crate polls or reacts to host status events, consults these helpers, and calls
//! `reassign_session_owner` itself.

use sha2::{Digest, Sha256};
use url::Url;

use crate::types::{DistributedSessionSnapshot, HostStatus, SessionHost};

/// An active session should move when its owner is missing from `hosts` or offline.
/// Inactive sessions never need a live owner.
pub fn session_needs_failover(
    snapshot: &DistributedSessionSnapshot,
    hosts: &[SessionHost],
) -> bool {
    if !snapshot.item.is_active() {
        return false;
    }
    match hosts.iter().find(|h| h.host_id == snapshot.owner_host_id) {
        None => true,
        Some(owner) => owner.status == HostStatus::Offline,
    }
}

/// Deterministic replacement owner via rendezvous hashing on the session resource.
/// Online hosts are preferred; suspect hosts are used only when no host is online.
/// Offline hosts and `exclude` are never chosen.
///
/// Scores are SHA-256 based, so nodes built with different toolchains still agree on
/// the target.
pub fn select_failover_host(
    session_resource: &Url,
    hosts: &[SessionHost],
    exclude: &str,
) -> Option<SessionHost> {
    [HostStatus::Online, HostStatus::Suspect]
        .into_iter()
        .find_map(|tier| {
            hosts
                .iter()
                .filter(|h| h.status == tier && h.host_id != exclude)
                .max_by_key(|h| rendezvous_score(session_resource, &h.host_id))
        })
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPlan {
    pub session_resource: Url,
    pub from_host_id: String,
    pub to_host_id: String,
}

/// One plan per session that needs failover and has somewhere to go.
pub fn plan_failover(
    sessions: &[DistributedSessionSnapshot],
    hosts: &[SessionHost],
) -> Vec<FailoverPlan> {
    sessions
        .iter()
        .filter(|s| session_needs_failover(s, hosts))
        .filter_map(|s| {
            select_failover_host(&s.session_resource, hosts, &s.owner_host_id).map(|target| {
                FailoverPlan {
                    session_resource: s.session_resource.clone(),
                    from_host_id: s.owner_host_id.clone(),
                    to_host_id: target.host_id,
                }
            })
        })
        .collect()
}

fn rendezvous_score(session_resource: &Url, host_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(session_resource.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(host_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
