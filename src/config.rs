use std::env;
use std::time::Duration;

/// Runtime settings for the orchestration engine. Every knob has a default;
/// environment variables override individual values.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cadence of the recurring node health check.
    pub health_check_interval: Duration,
    /// Cadence of the per-node user-stats collection tick.
    pub usage_collect_interval: Duration,
    /// Cadence of the per-node outbound-stats collection tick.
    pub outbound_collect_interval: Duration,
    /// Cadence of the user traffic review tick.
    pub user_review_interval: Duration,
    /// Cadence of the rolling / calendar traffic reset tasks.
    pub traffic_reset_interval: Duration,
    /// Cadence of the threshold notification scan.
    pub threshold_scan_interval: Duration,

    /// Timeout applied to every remote agent call.
    pub agent_timeout: Duration,

    /// Worker ceiling for the single-node start/stop queues.
    pub node_queue_workers: usize,
    /// Worker ceiling for per-user node membership jobs.
    pub user_queue_workers: usize,
    /// Fan-out width for health probes.
    pub health_fanout: usize,
    /// Fan-out width for config pushes (start-all and friends).
    pub start_fanout: usize,
    /// Fan-out width for per-user add/remove calls.
    pub user_fanout: usize,

    /// Dedup window for coalescible fleet/profile restart triggers.
    pub restart_dedup_window: Duration,

    /// Above this many rows, a bulk user transition skips per-row
    /// notifications and falls back to a full-fleet restart.
    pub bulk_transition_cutoff: usize,
    /// Above this many users in one threshold batch, notification events are
    /// suppressed while the watermark advance still applies.
    pub threshold_notify_cutoff: usize,
    /// Usage-limit percentages that trigger a threshold notification.
    pub notify_thresholds: Vec<u8>,
    /// Chunk size for bulk traffic-counter increments.
    pub traffic_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            health_check_interval: Duration::from_secs(30),
            usage_collect_interval: Duration::from_secs(60),
            outbound_collect_interval: Duration::from_secs(60),
            user_review_interval: Duration::from_secs(60),
            traffic_reset_interval: Duration::from_secs(3600),
            threshold_scan_interval: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(10),
            node_queue_workers: 10,
            user_queue_workers: 40,
            health_fanout: 40,
            start_fanout: 20,
            user_fanout: 30,
            restart_dedup_window: Duration::from_secs(30),
            bulk_transition_cutoff: 10_000,
            threshold_notify_cutoff: 500,
            notify_thresholds: vec![60, 80, 95],
            traffic_chunk_size: 1500,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(secs) = env_u64("FLEET_HEALTH_CHECK_INTERVAL_SECS") {
            cfg.health_check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLEET_USAGE_COLLECT_INTERVAL_SECS") {
            cfg.usage_collect_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLEET_USER_REVIEW_INTERVAL_SECS") {
            cfg.user_review_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLEET_AGENT_TIMEOUT_SECS") {
            cfg.agent_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("FLEET_HEALTH_FANOUT") {
            cfg.health_fanout = n as usize;
        }
        if let Some(n) = env_u64("FLEET_START_FANOUT") {
            cfg.start_fanout = n as usize;
        }
        if let Some(n) = env_u64("FLEET_BULK_TRANSITION_CUTOFF") {
            cfg.bulk_transition_cutoff = n as usize;
        }
        if let Some(n) = env_u64("FLEET_THRESHOLD_NOTIFY_CUTOFF") {
            cfg.threshold_notify_cutoff = n as usize;
        }
        if let Ok(raw) = env::var("FLEET_NOTIFY_THRESHOLDS") {
            let parsed: Vec<u8> = raw
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .filter(|p| *p > 0 && *p <= 100)
                .collect();
            if !parsed.is_empty() {
                cfg.notify_thresholds = parsed;
            }
        }
        cfg.notify_thresholds.sort_unstable();
        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_documented_cutoffs() {
        let cfg = Config::default();
        assert_eq!(cfg.bulk_transition_cutoff, 10_000);
        assert_eq!(cfg.threshold_notify_cutoff, 500);
        assert_eq!(cfg.traffic_chunk_size, 1500);
    }
}
