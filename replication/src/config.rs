//! Configuration recognized by the replication core (§6). Mirrors the
//! teacher's convention of a single `*Conf` struct with documented
//! defaults, constructed once and shared as `Arc<ReplicationConfig>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_sleep_before_failover() -> Duration {
    Duration::from_secs(30)
}

fn default_executor_workers() -> usize {
    1
}

fn default_sync_sleep_for_retries() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retries_multiplier() -> u32 {
    60
}

fn default_bulkload_enabled() -> bool {
    false
}

fn default_total_buffer() -> u64 {
    256 * 1024 * 1024
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// `replication.sleep.before.failover` — base of the jitter window a
    /// failover task sleeps before claiming a dead node's queue.
    #[serde(with = "humantime_serde")]
    pub sleep_before_failover: Duration,

    /// `replication.executor.workers` — size of the failover worker pool.
    pub executor_workers: usize,

    /// `replication.source.sync.sleepforretries` — base backoff for
    /// sync-replication remote WAL delete retries.
    #[serde(with = "humantime_serde")]
    pub sync_sleep_for_retries: Duration,

    /// `replication.source.sync.maxretriesmultiplier` — cap on the
    /// backoff multiplier for remote WAL delete retries.
    pub sync_max_retries_multiplier: u32,

    /// `replication.bulkload.enabled`.
    pub bulkload_enabled: bool,

    /// `replication.source.total.buffer` — global in-flight batch byte
    /// budget shared by every source.
    pub total_buffer_limit: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            sleep_before_failover: default_sleep_before_failover(),
            executor_workers: default_executor_workers(),
            sync_sleep_for_retries: default_sync_sleep_for_retries(),
            sync_max_retries_multiplier: default_max_retries_multiplier(),
            bulkload_enabled: default_bulkload_enabled(),
            total_buffer_limit: default_total_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_doc() {
        let conf = ReplicationConfig::default();
        assert_eq!(conf.sleep_before_failover, Duration::from_secs(30));
        assert_eq!(conf.executor_workers, 1);
        assert_eq!(conf.sync_sleep_for_retries, Duration::from_secs(1));
        assert_eq!(conf.sync_max_retries_multiplier, 60);
        assert!(!conf.bulkload_enabled);
    }

    #[test]
    fn overridden_value_round_trips_through_json() {
        let mut conf = ReplicationConfig::default();
        conf.executor_workers = 4;
        conf.bulkload_enabled = true;
        let json = serde_json::to_string(&conf).unwrap();
        let back: ReplicationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.executor_workers, 4);
        assert!(back.bulkload_enabled);
        assert_eq!(back.sync_max_retries_multiplier, 60);
    }

    #[test]
    fn partial_json_fills_in_remaining_defaults() {
        let conf: ReplicationConfig = serde_json::from_str(r#"{"executor_workers": 3}"#).unwrap();
        assert_eq!(conf.executor_workers, 3);
        assert_eq!(conf.total_buffer_limit, default_total_buffer());
    }
}
