use serde::{Deserialize, Serialize};

/// Recognised configuration options and their effects (§6 config table).
/// Every field has the documented default; callers override what they need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub scheduler_interval_s: u64,
    pub scheduler_batch_size: u32,
    pub worker_timeout_s: u64,
    pub inactive_worker_sweep_s: u64,
    pub stale_job_sweep_s: u64,
    pub stale_job_grace_s: u64,
    pub old_job_retention_days: u64,
    pub buffer_flush_size: usize,
    pub buffer_flush_timeout_s: u64,
    pub buffer_scan_interval_s: u64,
    pub min_workers_default: u32,
    pub max_workers_default: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_s: 180,
            scheduler_batch_size: 10,
            worker_timeout_s: 900,
            inactive_worker_sweep_s: 300,
            stale_job_sweep_s: 900,
            stale_job_grace_s: 3600,
            old_job_retention_days: 7,
            buffer_flush_size: 3,
            buffer_flush_timeout_s: 60,
            buffer_scan_interval_s: 30,
            min_workers_default: 1,
            max_workers_default: 3,
        }
    }
}

impl DispatchConfig {
    pub fn worker_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.worker_timeout_s as i64)
    }

    pub fn stale_job_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_job_grace_s as i64)
    }

    pub fn old_job_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.old_job_retention_days as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = DispatchConfig::default();
        assert_eq!(config.scheduler_interval_s, 180);
        assert_eq!(config.scheduler_batch_size, 10);
        assert_eq!(config.worker_timeout_s, 900);
        assert_eq!(config.min_workers_default, 1);
        assert_eq!(config.max_workers_default, 3);
        assert_eq!(config.buffer_flush_size, 3);
        assert_eq!(config.buffer_flush_timeout_s, 60);
    }
}
