use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::version::VersionVector;

/// Identity of one connected process. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId {
    pub client_id: String,
    pub display_name: String,
}

impl ClientId {
    pub fn new(client_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Staleness of a host, ordered from freshest to stalest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Suspect,
    Offline,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Online => "online",
            HostStatus::Suspect => "suspect",
            HostStatus::Offline => "offline",
        }
    }
}

/// What a host announces about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_id: String,
    pub display_name: String,
    pub endpoint: Url,
}

impl HostInfo {
    pub fn new(host_id: impl Into<String>, display_name: impl Into<String>, endpoint: Url) -> Self {
        Self {
            host_id: host_id.into(),
            display_name: display_name.into(),
            endpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHost {
    pub host_id: String,
    pub display_name: String,
    pub status: HostStatus,
    pub endpoint: Url,
    pub last_heartbeat: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    NeedsInput,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Active sessions are the ones that need a live owner.
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::InProgress | SessionStatus::NeedsInput)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTiming {
    pub created_at: SystemTime,
    #[serde(default)]
    pub last_request_started: Option<SystemTime>,
    #[serde(default)]
    pub last_request_ended: Option<SystemTime>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            created_at: SystemTime::now(),
            last_request_started: None,
            last_request_ended: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub label: String,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub timing: SessionTiming,
}

impl SessionMetadata {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: None,
            archived: false,
            timing: SessionTiming::default(),
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_some_and(SessionStatus::is_active)
    }
}

/// Fields a writer may replace. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl SessionPatch {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn archived(archived: bool) -> Self {
        Self {
            archived: Some(archived),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.status.is_none() && self.archived.is_none()
    }

    pub fn apply_to(&self, item: &mut SessionMetadata) {
        if let Some(label) = &self.label {
            item.label = label.clone();
        }
        if let Some(status) = self.status {
            item.status = Some(status);
        }
        if let Some(archived) = self.archived {
            item.archived = archived;
        }
    }
}

/// The latest accepted state of one session. Never mutated in place: every change
/// produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSessionSnapshot {
    pub session_resource: Url,
    pub version: VersionVector,
    pub owner_host_id: String,
    pub item: SessionMetadata,
    pub timestamp: SystemTime,
}

impl DistributedSessionSnapshot {
    pub fn new(
        session_resource: Url,
        version: VersionVector,
        owner_host_id: impl Into<String>,
        item: SessionMetadata,
    ) -> Self {
        Self {
            session_resource,
            version,
            owner_host_id: owner_host_id.into(),
            item,
            timestamp: SystemTime::now(),
        }
    }

    /// Stand-in returned when an update targets a session nobody has published.
    pub fn placeholder(session_resource: Url) -> Self {
        Self::new(
            session_resource,
            VersionVector::new(),
            String::new(),
            SessionMetadata::new(""),
        )
    }

    pub(crate) fn patched(&self, version: VersionVector, patch: &SessionPatch) -> Self {
        let mut item = self.item.clone();
        patch.apply_to(&mut item);
        Self {
            session_resource: self.session_resource.clone(),
            version,
            owner_host_id: self.owner_host_id.clone(),
            item,
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn with_owner(&self, version: VersionVector, owner_host_id: &str) -> Self {
        Self {
            session_resource: self.session_resource.clone(),
            version,
            owner_host_id: owner_host_id.to_string(),
            item: self.item.clone(),
            timestamp: SystemTime::now(),
        }
    }
}

/// A proposed mutation. Only ever an input to `apply_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSessionUpdate {
    pub session_resource: Url,
    pub base_version: VersionVector,
    pub patch: SessionPatch,
}

impl DistributedSessionUpdate {
    pub fn new(session_resource: Url, base_version: VersionVector, patch: SessionPatch) -> Self {
        Self {
            session_resource,
            base_version,
            patch,
        }
    }
}

/// Result of `apply_update`. Every variant carries the authoritative snapshot after
/// the call, so a caller always learns the true current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted(DistributedSessionSnapshot),
    /// The base version is causally stale (or the session is unknown); re-fetch and retry.
    Conflict(DistributedSessionSnapshot),
    /// The owner host cannot witness writes right now; queue and retry later.
    OwnerOffline(DistributedSessionSnapshot),
}

impl UpdateOutcome {
    pub fn snapshot(&self) -> &DistributedSessionSnapshot {
        match self {
            UpdateOutcome::Accepted(s)
            | UpdateOutcome::Conflict(s)
            | UpdateOutcome::OwnerOffline(s) => s,
        }
    }

    pub fn into_snapshot(self) -> DistributedSessionSnapshot {
        match self {
            UpdateOutcome::Accepted(s)
            | UpdateOutcome::Conflict(s)
            | UpdateOutcome::OwnerOffline(s) => s,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateOutcome::Accepted(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Accepted(_) => "accepted",
            UpdateOutcome::Conflict(_) => "conflict",
            UpdateOutcome::OwnerOffline(_) => "owner_offline",
        }
    }
}

/// Parse a session resource or host endpoint URI.
pub fn parse_resource(input: &str) -> SyncResult<Url> {
    Url::parse(input).map_err(|source| SyncError::InvalidResource {
        input: input.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_only_touches_present_fields() {
        let mut item = SessionMetadata::new("original").with_status(SessionStatus::InProgress);
        SessionPatch::archived(true).apply_to(&mut item);
        assert_eq!(item.label, "original");
        assert_eq!(item.status, Some(SessionStatus::InProgress));
        assert!(item.archived);

        SessionPatch {
            label: Some("renamed".into()),
            status: Some(SessionStatus::Completed),
            archived: None,
        }
        .apply_to(&mut item);
        assert_eq!(item.label, "renamed");
        assert_eq!(item.status, Some(SessionStatus::Completed));
        assert!(item.archived);
    }

    #[test]
    fn unset_status_is_not_active() {
        assert!(!SessionMetadata::new("idle").is_active());
        assert!(SessionMetadata::new("busy")
            .with_status(SessionStatus::NeedsInput)
            .is_active());
        assert!(!SessionMetadata::new("done")
            .with_status(SessionStatus::Failed)
            .is_active());
    }

    #[test]
    fn malformed_resource_is_an_error() {
        let err = parse_resource("not a uri").unwrap_err();
        assert!(matches!(err, SyncError::InvalidResource { .. }));
        assert!(parse_resource("session://local/abc").is_ok());
    }

    #[test]
    fn empty_patch_serializes_to_empty_object() {
        let json = serde_json::to_value(SessionPatch::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
        assert!(SessionPatch::default().is_empty());
    }
}
