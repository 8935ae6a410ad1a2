use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

/// Counters for one coordinator. Each instance owns its registry so several
/// coordinators can live in one process.
#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    pub updates: IntCounterVec,
    pub reassignments: IntCounterVec,
    pub host_status: IntCounterVec,
    pub sessions_removed: IntCounterVec,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let updates = counter(
            &registry,
            "session_sync_updates_total",
            "apply_update calls by outcome",
            "result",
        )?;
        let reassignments = counter(
            &registry,
            "session_sync_reassignments_total",
            "owner reassignment attempts by outcome",
            "result",
        )?;
        let host_status = counter(
            &registry,
            "session_sync_host_status_total",
            "host status transitions by new status",
            "status",
        )?;
        let sessions_removed = counter(
            &registry,
            "session_sync_sessions_removed_total",
            "sessions removed from the snapshot store by reason",
            "reason",
        )?;
        Ok(Self {
            registry,
            updates,
            reassignments,
            host_status,
            sessions_removed,
        })
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %err, "metrics encode failed");
        }
        buffer
    }
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let c = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}
