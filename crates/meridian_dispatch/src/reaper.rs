//! Timeout / reaper loops (C7, §4.5). Three independent sweeps, each run on
//! its own cadence by the orchestrator: the stale partial-response reaper,
//! the very-old terminal-job reaper, and the inactive-worker reaper.
//! Reapers commit per-job/per-row and never abort a sweep on a single
//! failure (§7 propagation policy); a transaction-level failure on one row
//! is logged and the sweep continues with the next.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use meridian_protocol::job::JobState;
use meridian_protocol::DispatchConfig;

use crate::error::Result;
use crate::roster::Roster;
use crate::store::JobStore;

/// Large enough to sweep every job in one pass without a true pagination
/// cursor; reapers run on a multi-minute cadence over bounded-size pools.
const REAP_SCAN_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperSummary {
    pub partial_completed: usize,
    pub never_assigned_failed: usize,
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    roster: Roster,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, roster: Roster) -> Self {
        Self { store, roster }
    }

    /// Stale partial-response reaper (§4.5, every `stale_job_sweep_s`).
    pub async fn sweep_stale_jobs(&self, config: &DispatchConfig) -> Result<ReaperSummary> {
        let now = Utc::now();
        let grace = config.stale_job_grace();
        let mut summary = ReaperSummary::default();

        let assigned = self.store.list_jobs_by_state(JobState::Assigned, REAP_SCAN_LIMIT).await?;
        for job in assigned {
            if now.signed_duration_since(job.created_at) <= grace {
                continue;
            }
            if job.responses.is_empty() {
                // "leave them and let validators see the partial failure" (§4.5).
                continue;
            }
            let mut patch = serde_json::Map::new();
            patch.insert(
                "completion_reason".to_string(),
                serde_json::Value::String(format!(
                    "timeout cleanup ({} response(s) after 1+ hour)",
                    job.responses.len()
                )),
            );
            patch.insert(
                "actual_response_count".to_string(),
                serde_json::Value::from(job.responses.len() as u64),
            );
            patch.insert(
                "expected_response_count".to_string(),
                serde_json::Value::from(job.assigned_workers.len() as u64),
            );
            if let Err(err) = self.store.update_state(job.job_id, JobState::Completed, patch).await {
                warn!(job_id = %job.job_id, error = %err, "reaper: failed to force-complete stale job, continuing sweep");
                continue;
            }
            if let Some(best) = meridian_protocol::response::best_response(&job.responses) {
                if let Err(err) = self.store.set_best_response(job.job_id, best.response_id).await {
                    warn!(job_id = %job.job_id, error = %err, "reaper: failed to set best_response on stale job");
                }
            }
            summary.partial_completed += 1;
        }

        let pending = self.store.list_jobs_by_state(JobState::Pending, REAP_SCAN_LIMIT).await?;
        for job in pending {
            if now.signed_duration_since(job.created_at) <= grace {
                continue;
            }
            let mut patch = serde_json::Map::new();
            patch.insert(
                "failure_reason".to_string(),
                serde_json::Value::String("task never assigned to miners after 1+ hour".to_string()),
            );
            patch.insert(
                "failure_timestamp".to_string(),
                serde_json::Value::String(now.to_rfc3339()),
            );
            if let Err(err) = self.store.update_state(job.job_id, JobState::Failed, patch).await {
                warn!(job_id = %job.job_id, error = %err, "reaper: failed to fail never-assigned job, continuing sweep");
                continue;
            }
            summary.never_assigned_failed += 1;
        }

        Ok(summary)
    }

    /// Very-old reaper (§4.5, every 24h): deletes terminal jobs older than
    /// `old_job_retention_days`. Policy-only per the spec; the store
    /// operation is a real delete since it costs nothing to implement.
    pub async fn sweep_old_jobs(&self, config: &DispatchConfig, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - config.old_job_retention();
        self.store.reap_terminal_jobs(cutoff).await
    }

    /// Inactive-worker reaper (§4.5, every `inactive_worker_sweep_s`):
    /// deletes worker rows whose `last_seen` is older than
    /// `worker_timeout_s` or missing.
    pub async fn sweep_inactive_workers(&self, config: &DispatchConfig, now: DateTime<Utc>) -> Result<u64> {
        self.roster.reap_inactive(config.worker_timeout(), now).await
    }
}
