use std::time::Duration;

pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;
pub const DEFAULT_SUSPECT_MULTIPLIER: u32 = 3;
pub const DEFAULT_OFFLINE_MULTIPLIER: u32 = 6;
pub const DEFAULT_RETENTION_MS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub heartbeat_interval: Duration,
    pub suspect_multiplier: u32,
    pub offline_multiplier: u32,
    pub session_retention: Duration,
    pub gc_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            suspect_multiplier: DEFAULT_SUSPECT_MULTIPLIER,
            offline_multiplier: DEFAULT_OFFLINE_MULTIPLIER,
            session_retention: Duration::from_millis(DEFAULT_RETENTION_MS),
            gc_interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or unparsable values fall back to
    /// the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let heartbeat_ms = parse_u64("SESSION_SYNC_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS);
        let suspect_multiplier = parse_u64(
            "SESSION_SYNC_SUSPECT_MULTIPLIER",
            DEFAULT_SUSPECT_MULTIPLIER as u64,
        )
        .min(u32::MAX as u64) as u32;
        let offline_multiplier = parse_u64(
            "SESSION_SYNC_OFFLINE_MULTIPLIER",
            DEFAULT_OFFLINE_MULTIPLIER as u64,
        )
        .min(u32::MAX as u64) as u32;
        let retention_ms = parse_u64("SESSION_SYNC_RETENTION_MS", DEFAULT_RETENTION_MS);
        let gc_interval_ms = parse_u64("SESSION_SYNC_GC_INTERVAL_MS", DEFAULT_GC_INTERVAL_MS);

        Self {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            suspect_multiplier,
            offline_multiplier: offline_multiplier.max(suspect_multiplier),
            session_retention: Duration::from_millis(retention_ms),
            gc_interval: Duration::from_millis(gc_interval_ms),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn suspect_threshold(&self) -> Duration {
        self.heartbeat_interval * self.suspect_multiplier
    }

    pub fn offline_threshold(&self) -> Duration {
        self.heartbeat_interval * self.offline_multiplier.max(self.suspect_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_thresholds() {
        let cfg = SyncConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.suspect_threshold(), Duration::from_secs(15));
        assert_eq!(cfg.offline_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("SESSION_SYNC_HEARTBEAT_MS", "1000"),
            ("SESSION_SYNC_SUSPECT_MULTIPLIER", "nope"),
            ("SESSION_SYNC_GC_INTERVAL_MS", "0"),
        ]));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(cfg.suspect_multiplier, DEFAULT_SUSPECT_MULTIPLIER);
        assert_eq!(cfg.gc_interval, Duration::from_millis(DEFAULT_GC_INTERVAL_MS));
    }

    #[test]
    fn offline_never_precedes_suspect() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("SESSION_SYNC_SUSPECT_MULTIPLIER", "8"),
            ("SESSION_SYNC_OFFLINE_MULTIPLIER", "2"),
        ]));
        assert_eq!(cfg.offline_multiplier, 8);
        assert!(cfg.offline_threshold() >= cfg.suspect_threshold());
    }
}
