//! Assignment scheduler (C5, §4.3). A periodic pass fetches a bounded batch
//! of `pending`/`assigned` jobs and, for each, selects eligible workers from
//! the roster and commits new assignments. Per-job work within one pass
//! fans out with bounded concurrency and exception isolation (§5): one
//! job's failure is logged and does not abort the pass, mirroring the
//! teacher's gather-style dispatch loop.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use meridian_ids::{JobId, WorkerId};
use meridian_protocol::job::JobState;
use meridian_protocol::DispatchConfig;

use crate::error::Result;
use crate::roster::Roster;
use crate::store::JobStore;

/// Bounded fan-out within a single pass. Not a config knob in the spec's
/// table — an implementation detail of how the batch is processed, not
/// what gets processed.
const PASS_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerPassSummary {
    pub jobs_considered: usize,
    pub jobs_assigned: usize,
    pub assignments_committed: usize,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    roster: Roster,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, roster: Roster) -> Self {
        Self { store, roster }
    }

    /// One scheduler pass (§4.3 steps 1-2). Fetches at most
    /// `scheduler_batch_size` jobs in each of `pending` and `assigned`,
    /// then processes every job concurrently.
    pub async fn run_pass(&self, config: &DispatchConfig) -> Result<SchedulerPassSummary> {
        let mut jobs = self
            .store
            .list_jobs_by_state(JobState::Pending, config.scheduler_batch_size)
            .await?;
        jobs.extend(
            self.store
                .list_jobs_by_state(JobState::Assigned, config.scheduler_batch_size)
                .await?,
        );

        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.job_id).collect();
        let worker_timeout = config.worker_timeout();

        let results = stream::iter(job_ids)
            .map(move |job_id| async move { self.process_job(job_id, worker_timeout).await })
            .buffer_unordered(PASS_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut summary = SchedulerPassSummary {
            jobs_considered: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(Some(committed)) => {
                    summary.jobs_assigned += 1;
                    summary.assignments_committed += committed;
                }
                Ok(None) => {}
                Err(err) => {
                    // Per-job isolation (§5, §7): log and move on, never
                    // abort the rest of the pass.
                    warn!(error = %err, "scheduler pass: job processing failed, continuing");
                }
            }
        }
        Ok(summary)
    }

    /// Process one job (§4.3 step 2a-f). Returns `Some(n)` with the number
    /// of workers newly committed if an assignment was attempted and
    /// non-empty, `None` if the job was skipped (already full, or no
    /// eligible workers found).
    async fn process_job(&self, job_id: JobId, worker_timeout: chrono::Duration) -> Result<Option<usize>> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };

        let current = job.assigned_workers.len() as u32;
        if current >= job.max_workers {
            return Ok(None);
        }

        let mut needed = job.max_workers - current;
        if current < job.min_workers {
            needed = needed.max(job.min_workers - current);
        }
        if needed == 0 {
            return Ok(None);
        }

        let candidates = self
            .roster
            .eligible(job.kind, needed * 2, &job.assigned_workers, worker_timeout)
            .await?;

        if candidates.is_empty() {
            // No eligible workers: leave untouched, no log spam (§4.3e).
            return Ok(None);
        }

        // Re-check capacity at assignment time (§4.3d) before trusting the
        // roster snapshot; `assign_workers` re-checks again atomically, but
        // filtering here avoids proposing workers we already know are full.
        let selected: Vec<WorkerId> = candidates
            .into_iter()
            .filter(|w| w.load < w.max_capacity)
            .take(needed as usize)
            .map(|w| w.worker_id)
            .collect();

        if selected.is_empty() {
            return Ok(None);
        }

        let outcome = self
            .store
            .assign_workers(job_id, &selected, job.min_workers, job.max_workers)
            .await?;

        for &worker_id in &outcome.committed {
            self.roster.inc_load(worker_id).await?;
        }

        debug!(
            job_id = %job_id,
            committed = outcome.committed.len(),
            transitioned = outcome.transitioned_to_assigned,
            "scheduler: assignment committed"
        );

        Ok(Some(outcome.committed.len()))
    }
}
