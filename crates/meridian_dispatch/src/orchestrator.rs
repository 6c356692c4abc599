//! The root orchestrator (`[AMBIENT]`, SPEC_FULL §2/§9). `Dispatcher` owns
//! the store, roster, scheduler, aggregator, and reaper as explicit values
//! — no module-level singletons (§9 "Ambient globals and initialisation")
//! — and exposes the ingress/egress surface of §6 as inherent async
//! methods. Background loops are long-lived `tokio` tasks signaled by a
//! `watch<bool>` "running" channel (§9 "Coroutine control flow"), matching
//! the teacher's bind-then-run binary shape (`Sentinel::bind` / `run`).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use meridian_ids::{JobId, ValidatorId, WorkerId};
use meridian_protocol::job::{desired_worker_count, InputRef, JobKind, JobState, Priority};
use meridian_protocol::{DispatchConfig, Job, Response};

use crate::aggregator::Aggregator;
use crate::api::JobResponsesView;
use crate::error::{DispatchError, Result};
use crate::reaper::Reaper;
use crate::roster::Roster;
use crate::scheduler::Scheduler;
use crate::stats::{JobCounts, StatsReporter};
use crate::store::{BlobStore, JobStore, RecordResponseOutcome, Store, WorkerSnapshot, WorkerStore};

pub struct Dispatcher {
    job_store: Arc<dyn JobStore>,
    blob_store: Arc<dyn BlobStore>,
    roster: Roster,
    scheduler: Scheduler,
    aggregator: Arc<Aggregator>,
    reaper: Reaper,
    stats: StatsReporter,
    config: DispatchConfig,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatchConfig) -> Arc<Self> {
        let store = Arc::new(store);
        let job_store: Arc<dyn JobStore> = store.clone();
        let blob_store: Arc<dyn BlobStore> = store.clone();
        let worker_store: Arc<dyn WorkerStore> = store.clone();
        let roster = Roster::new(worker_store);
        let scheduler = Scheduler::new(job_store.clone(), roster.clone());
        let aggregator = Arc::new(Aggregator::new(
            job_store.clone(),
            config.buffer_flush_size,
            chrono::Duration::seconds(config.buffer_flush_timeout_s as i64),
        ));
        let reaper = Reaper::new(job_store.clone(), roster.clone());
        let stats = StatsReporter::new(job_store.clone(), roster.clone());
        let (running_tx, running_rx) = watch::channel(true);

        Arc::new(Self {
            job_store,
            blob_store,
            roster,
            scheduler,
            aggregator,
            reaper,
            stats,
            config,
            running_tx,
            running_rx,
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    // ---------------------------------------------------------------
    // Background loops (§2 leaves C5-C8, §5 concurrency model)
    // ---------------------------------------------------------------

    /// Spawns every background loop. Each loop observes the shutdown
    /// signal at the top of its iteration and exits cleanly (§5
    /// "Cancellation and shutdown").
    pub async fn spawn_background_loops(self: Arc<Self>) {
        let mut handles = self.handles.lock().await;
        handles.push(self.clone().spawn_scheduler_loop());
        handles.push(self.clone().spawn_aggregator_scan_loop());
        handles.push(self.clone().spawn_stale_job_reaper_loop());
        handles.push(self.clone().spawn_old_job_reaper_loop());
        handles.push(self.clone().spawn_inactive_worker_reaper_loop());
        handles.push(self.clone().spawn_stats_loop());
    }

    fn spawn_scheduler_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            let interval = StdDuration::from_secs(self.config.scheduler_interval_s);
            while *running.borrow() {
                match self.scheduler.run_pass(&self.config).await {
                    Ok(summary) => info!(
                        considered = summary.jobs_considered,
                        assigned = summary.jobs_assigned,
                        committed = summary.assignments_committed,
                        "scheduler pass complete"
                    ),
                    Err(err) => warn!(error = %err, "scheduler pass failed"),
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    fn spawn_aggregator_scan_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            let interval = StdDuration::from_secs(self.config.buffer_scan_interval_s);
            while *running.borrow() {
                if let Err(err) = self.aggregator.flush_timed_out().await {
                    warn!(error = %err, "aggregator timeout scan failed");
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    fn spawn_stale_job_reaper_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            let interval = StdDuration::from_secs(self.config.stale_job_sweep_s);
            while *running.borrow() {
                match self.reaper.sweep_stale_jobs(&self.config).await {
                    Ok(summary) => info!(
                        partial_completed = summary.partial_completed,
                        never_assigned_failed = summary.never_assigned_failed,
                        "stale job sweep complete"
                    ),
                    Err(err) => warn!(error = %err, "stale job sweep failed"),
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    fn spawn_old_job_reaper_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            // §4.5: every 24h. Not in the §6 config table (only the policy
            // is specified there); fixed at the documented cadence.
            let interval = StdDuration::from_secs(24 * 60 * 60);
            while *running.borrow() {
                match self.reaper.sweep_old_jobs(&self.config, Utc::now()).await {
                    Ok(deleted) => info!(deleted, "old terminal job sweep complete"),
                    Err(err) => warn!(error = %err, "old terminal job sweep failed"),
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    fn spawn_inactive_worker_reaper_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            let interval = StdDuration::from_secs(self.config.inactive_worker_sweep_s);
            while *running.borrow() {
                match self.reaper.sweep_inactive_workers(&self.config, Utc::now()).await {
                    Ok(deleted) => info!(deleted, "inactive worker sweep complete"),
                    Err(err) => warn!(error = %err, "inactive worker sweep failed"),
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    fn spawn_stats_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut running = self.running_rx.clone();
            let interval = StdDuration::from_secs(60);
            while *running.borrow() {
                match self.stats.job_counts().await {
                    Ok(counts) => info!(total = counts.total, by_state = ?counts.by_state, "statistics"),
                    Err(err) => warn!(error = %err, "statistics query failed"),
                }
                if Self::sleep_or_shutdown(interval, &mut running).await {
                    break;
                }
            }
        })
    }

    /// Sleeps for `interval` unless the shutdown signal fires first.
    /// Returns `true` if shutdown was observed.
    async fn sleep_or_shutdown(interval: StdDuration, running: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => !*running.borrow(),
            changed = running.changed() => changed.is_err() || !*running.borrow(),
        }
    }

    /// Flips the shutdown signal, force-flushes the aggregator, and awaits
    /// every background task (§5 "Cancellation and shutdown"). No hard
    /// timeout is imposed on in-flight store operations.
    pub async fn shutdown(&self) {
        let _ = self.running_tx.send(false);
        if let Err(err) = self.aggregator.force_flush_all().await {
            warn!(error = %err, "shutdown: force-flush of aggregator buffer failed");
        }
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "background loop panicked during shutdown");
            }
        }
    }

    // ---------------------------------------------------------------
    // Ingress (§6)
    // ---------------------------------------------------------------

    /// `SubmitJob` (ingress from clients, §6).
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_job(
        &self,
        kind: JobKind,
        priority: Priority,
        min_workers: Option<u32>,
        max_workers: Option<u32>,
        desired_workers: Option<u32>,
        input: InputRef,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<JobId> {
        let min_workers = min_workers.unwrap_or(self.config.min_workers_default);
        let max_workers = max_workers.unwrap_or(self.config.max_workers_default);
        if min_workers == 0 {
            return Err(DispatchError::invariant("min_workers must be >= 1"));
        }
        if max_workers < min_workers {
            return Err(DispatchError::invariant("max_workers must be >= min_workers"));
        }
        let desired_workers =
            desired_workers.unwrap_or_else(|| desired_worker_count(kind, priority, min_workers, max_workers));

        self.job_store
            .create_job(kind, priority, input, min_workers, max_workers, desired_workers, metadata)
            .await
    }

    /// `CancelJob` (ingress from clients, §6): collapses to the terminal
    /// branch of `UpdateState` (SPEC_FULL §4.1 supplement) — nothing about
    /// cancellation is special beyond being caller-initiated.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.job_store
            .update_state(job_id, JobState::Cancelled, serde_json::Map::new())
            .await
    }

    /// `ReportWorkers` (ingress from validators, §6/§4.2). `epoch` is
    /// accepted for protocol completeness but is not itself a trust
    /// decision (§9 security note); only `validator_id` is used, as a
    /// weighting key for the reporter-count merges in §4.2.1.
    pub async fn report_workers(
        &self,
        validator_id: ValidatorId,
        workers: Vec<WorkerSnapshot>,
        _epoch: u64,
    ) -> Result<()> {
        let now = Utc::now();
        let validator_id = validator_id.to_string();
        for worker in workers {
            self.roster.report(&validator_id, worker, now).await?;
        }
        Ok(())
    }

    /// `MarkJobDone` (ingress from validators, §6): `completed -> done` (or
    /// `done -> approved`). The evaluation blob is persisted verbatim in
    /// metadata; the core never interprets it.
    pub async fn mark_job_done(&self, job_id: JobId, evaluation: serde_json::Value) -> Result<()> {
        let job = self
            .job_store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("job {job_id} not found")))?;

        let next_state = match job.state {
            JobState::Completed => JobState::Done,
            JobState::Done => JobState::Approved,
            other => {
                return Err(DispatchError::invariant(format!(
                    "cannot mark job done from state {}",
                    other.as_str()
                )))
            }
        };

        let mut patch = serde_json::Map::new();
        patch.insert("evaluation".to_string(), evaluation);
        self.job_store.update_state(job_id, next_state, patch).await
    }

    /// `SubmitResponse` (ingress from workers, §6), feeding C6.
    pub async fn submit_response(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        response: Response,
    ) -> Result<RecordResponseOutcome> {
        self.aggregator.submit(job_id, worker_id, response).await
    }

    // ---------------------------------------------------------------
    // Egress (§6)
    // ---------------------------------------------------------------

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.job_store.get_job(job_id).await
    }

    /// `ListMyJobs` (egress to workers, §6): only jobs assigned to
    /// `worker_id`, filtered to the requested active states; terminal
    /// states are excluded even if the caller asked for them.
    pub async fn list_my_jobs(&self, worker_id: WorkerId, states: &[JobState]) -> Result<Vec<Job>> {
        let active: Vec<JobState> = states.iter().copied().filter(|s| !s.is_terminal()).collect();
        self.job_store.list_jobs_assigned_to(worker_id, &active).await
    }

    /// `ListJobsReadyForEvaluation` (egress to validators, §6): jobs in
    /// `completed` not yet evaluated by `validator_id`. Since `MarkJobDone`
    /// advances a job out of `completed` the moment any validator records
    /// an evaluation, "not yet evaluated" reduces exactly to "still in
    /// state `completed`" — the per-job transition is the only record of
    /// evaluation the core keeps; `validator_id` does not further narrow
    /// the result set.
    pub async fn list_jobs_ready_for_evaluation(&self, _validator_id: ValidatorId) -> Result<Vec<Job>> {
        self.job_store
            .list_jobs_by_state(JobState::Completed, self.config.scheduler_batch_size.max(100))
            .await
    }

    /// `GetJobResponses` (egress to validators, §6).
    pub async fn get_job_responses(&self, job_id: JobId) -> Result<Option<JobResponsesView>> {
        let Some(job) = self.job_store.get_job(job_id).await? else {
            return Ok(None);
        };
        let best_response = job
            .best_response
            .and_then(|id| job.responses.iter().find(|r| r.response_id == id).cloned());
        Ok(Some(JobResponsesView {
            job_id: job.job_id,
            state: job.state,
            best_response,
            response_count: job.responses.len(),
            expected_count: job.assigned_workers.len() as u32,
        }))
    }

    /// `GetStatistics` (egress to observers, §6).
    pub async fn get_statistics(&self) -> Result<JobCounts> {
        self.stats.job_counts().await
    }

    /// `GetLeaderboard` (egress to observers, §6).
    pub async fn get_leaderboard(&self, limit: u32) -> Result<Vec<meridian_protocol::Worker>> {
        self.stats.leaderboard(limit).await
    }

    pub async fn get_blob(&self, blob_id: meridian_ids::BlobId) -> Result<Option<meridian_protocol::worker::BlobMetadata>> {
        self.blob_store.get_blob(blob_id).await
    }

    pub async fn put_blob(&self, blob: meridian_protocol::worker::BlobMetadata) -> Result<()> {
        self.blob_store.put_blob(blob).await
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Exposed mainly for tests that want to drive a scheduler pass or
    /// buffer flush deterministically instead of waiting on the background
    /// loop cadence.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }
}
