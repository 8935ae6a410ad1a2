use std::collections::HashMap;

use parking_lot::RwLock;
use url::Url;

use crate::types::DistributedSessionSnapshot;

/// Latest accepted snapshot per session resource.
///
/// Exactly one entry per resource. Read-modify-write goes through [`SnapshotStore::update`],
/// which holds the write lock for the whole decision, so a rejected or in-flight
/// snapshot is never visible.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    sessions: RwLock<HashMap<Url, DistributedSessionSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &Url) -> Option<DistributedSessionSnapshot> {
        self.sessions.read().get(resource).cloned()
    }

    /// All snapshots, ordered by resource for stable output.
    pub fn all(&self) -> Vec<DistributedSessionSnapshot> {
        let mut sessions: Vec<DistributedSessionSnapshot> =
            self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.session_resource.as_str().cmp(b.session_resource.as_str()));
        sessions
    }

    pub fn insert(
        &self,
        snapshot: DistributedSessionSnapshot,
    ) -> Option<DistributedSessionSnapshot> {
        self.sessions
            .write()
            .insert(snapshot.session_resource.clone(), snapshot)
    }

    pub fn remove(&self, resource: &Url) -> Option<DistributedSessionSnapshot> {
        self.sessions.write().remove(resource)
    }

    /// Atomically decide on the current entry. `decide` returns the replacement
    /// snapshot (if any) plus a value handed back to the caller.
    pub fn update<F, R>(&self, resource: &Url, decide: F) -> R
    where
        F: FnOnce(Option<&DistributedSessionSnapshot>) -> (Option<DistributedSessionSnapshot>, R),
    {
        let mut sessions = self.sessions.write();
        let (replacement, result) = decide(sessions.get(resource));
        if let Some(snapshot) = replacement {
            sessions.insert(resource.clone(), snapshot);
        }
        result
    }

    /// Remove every snapshot matching `predicate` and return the removed ones.
    pub fn remove_where<F>(&self, predicate: F) -> Vec<DistributedSessionSnapshot>
    where
        F: Fn(&DistributedSessionSnapshot) -> bool,
    {
        let mut sessions = self.sessions.write();
        let doomed: Vec<Url> = sessions
            .values()
            .filter(|snapshot| predicate(*snapshot))
            .map(|snapshot| snapshot.session_resource.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|resource| sessions.remove(resource))
            .collect()
    }
}
