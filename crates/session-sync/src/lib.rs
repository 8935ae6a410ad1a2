//! Distributed session synchronization core.
//!
//! Lets several clients and several execution hosts share an eventually converging view
//! of which sessions exist, who owns them, and what state they are in:
//! - optimistic concurrent mutation checked with version vectors ([`version`])
//! - heartbeat-only failure detection of hosts ([`hosts`])
//! - ownership transfer away from unreachable hosts ([`failover`])
//!
//! [`SyncCoordinator`] ties these together behind the [`SessionSync`] trait. It is
//! transport agnostic; [`bridge::BusBridge`] binds it to a `transport_bus::Bus`.
//!
//! This is not consensus. Concurrent writes are resolved last-writer-wins on the whole
//! patch, and nothing survives a restart.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod failover;
pub mod hosts;
pub mod metrics;
mod store;
pub mod types;
pub mod version;

pub use bridge::BusBridge;
pub use config::SyncConfig;
pub use coordinator::{SessionSync, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use events::{Emitter, Listener, Subscription};
pub use failover::{plan_failover, select_failover_host, session_needs_failover, FailoverPlan};
pub use hosts::{HostRegistration, HostRegistry, LivenessPolicy};
pub use metrics::SyncMetrics;
pub use types::{
    parse_resource, ClientId, DistributedSessionSnapshot, DistributedSessionUpdate, HostInfo,
    HostStatus, SessionHost, SessionMetadata, SessionPatch, SessionStatus, SessionTiming,
    UpdateOutcome,
};
pub use version::{CausalOrder, VersionVector, VersionVectorEntry};
