//! Response aggregator (C6, §4.4). Coalesces bursts of per-worker
//! responses into batched store writes: responses accumulate in an
//! in-memory buffer and are flushed as a unit either when the buffer fills,
//! when the oldest entry ages past the timeout, or on demand (shutdown,
//! cancellation, or test determinism).
//!
//! The buffer is a mutex-protected map, the systems-language rendering of
//! the teacher's in-process Python buffer (§9 "Coroutine control flow").
//! Per-job flushes are additionally serialized by a lock so at most one
//! flush per job runs at a time (§5).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use meridian_ids::{JobId, WorkerId};
use meridian_protocol::job::JobState;
use meridian_protocol::Response;

use crate::error::Result;
use crate::store::{JobStore, RecordResponseOutcome};

struct Buffered {
    response: Response,
    arrived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub buffered_jobs: usize,
    pub buffered_responses: usize,
    pub flush_size_threshold: usize,
    pub flush_timeout_s: u64,
}

pub struct Aggregator {
    store: Arc<dyn JobStore>,
    buffer: Mutex<HashMap<JobId, Vec<Buffered>>>,
    flush_locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    flush_size_threshold: usize,
    flush_timeout: chrono::Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn JobStore>, flush_size_threshold: usize, flush_timeout: chrono::Duration) -> Self {
        Self {
            store,
            buffer: Mutex::new(HashMap::new()),
            flush_locks: Mutex::new(HashMap::new()),
            flush_size_threshold,
            flush_timeout,
        }
    }

    /// `SubmitResponse` ingress (§6) feeding into C6. Duplicate protection
    /// (second line, §4.4): rejects if the worker already appears in the
    /// job's committed responses or in this job's in-memory buffer.
    pub async fn submit(&self, job_id: JobId, worker_id: WorkerId, response: Response) -> Result<RecordResponseOutcome> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(RecordResponseOutcome::UnknownJob);
        };
        if !job.assigned_workers.contains(&worker_id) {
            return Ok(RecordResponseOutcome::WorkerNotAssigned);
        }
        if job.responses.iter().any(|r| r.worker_id == worker_id) {
            return Ok(RecordResponseOutcome::Duplicate);
        }

        let should_flush_now;
        {
            let mut buffer = self.buffer.lock().await;
            let entries = buffer.entry(job_id).or_default();
            if entries.iter().any(|b| b.response.worker_id == worker_id) {
                return Ok(RecordResponseOutcome::Duplicate);
            }
            entries.push(Buffered {
                response,
                arrived_at: Utc::now(),
            });
            // "the job is known to have reached its required replication"
            // (§4.4 flush policy): every currently assigned worker has now
            // either already responded or has a response sitting in this
            // buffer, so there is nothing left to wait for. This is a
            // trigger for *writing the buffer*, distinct from the
            // completion check inside `flush` itself, which compares
            // against `min_workers`.
            let reached_replication =
                entries.len() + job.responses.len() >= job.assigned_workers.len().max(1);
            should_flush_now = entries.len() >= self.flush_size_threshold || reached_replication;
        }

        if should_flush_now {
            self.flush(job_id).await?;
        }

        Ok(RecordResponseOutcome::Accepted)
    }

    /// Flush every job whose oldest buffered entry is older than
    /// `flush_timeout`. Intended to be driven by the background scan task
    /// on `buffer_scan_interval_s` (§4.4).
    pub async fn flush_timed_out(&self) -> Result<usize> {
        let now = Utc::now();
        let stale_jobs: Vec<JobId> = {
            let buffer = self.buffer.lock().await;
            buffer
                .iter()
                .filter(|(_, entries)| {
                    entries
                        .first()
                        .map(|b| now.signed_duration_since(b.arrived_at) > self.flush_timeout)
                        .unwrap_or(false)
                })
                .map(|(job_id, _)| *job_id)
                .collect()
        };

        let mut flushed = 0;
        for job_id in stale_jobs {
            if let Err(err) = self.flush(job_id).await {
                warn!(job_id = %job_id, error = %err, "aggregator: timed-out flush failed, continuing");
                continue;
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// `force_flush_all` (SPEC_FULL §4.4 supplement): drains every buffered
    /// job immediately. Used by orchestrator shutdown and by tests wanting
    /// deterministic flushing.
    pub async fn force_flush_all(&self) -> Result<usize> {
        let job_ids: Vec<JobId> = {
            let buffer = self.buffer.lock().await;
            buffer.keys().copied().collect()
        };
        let mut flushed = 0;
        for job_id in job_ids {
            if let Err(err) = self.flush(job_id).await {
                warn!(job_id = %job_id, error = %err, "aggregator: force flush failed, continuing");
                continue;
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// `buffer_stats` (SPEC_FULL §4.4 supplement): a read-only snapshot for
    /// operators.
    pub async fn buffer_stats(&self) -> BufferStats {
        let buffer = self.buffer.lock().await;
        BufferStats {
            buffered_jobs: buffer.len(),
            buffered_responses: buffer.values().map(|v| v.len()).sum(),
            flush_size_threshold: self.flush_size_threshold,
            flush_timeout_s: self.flush_timeout.num_seconds().max(0) as u64,
        }
    }

    /// Flush semantics for one job (§4.4 steps 1-5). Holds a per-job
    /// cooperative lock so at most one flush for this `job_id` runs at a
    /// time; other jobs flush concurrently.
    async fn flush(&self, job_id: JobId) -> Result<()> {
        let job_lock = {
            let mut locks = self.flush_locks.lock().await;
            Arc::clone(locks.entry(job_id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let _guard = job_lock.lock().await;

        let entries = {
            let mut buffer = self.buffer.lock().await;
            buffer.remove(&job_id).unwrap_or_default()
        };
        if entries.is_empty() {
            return Ok(());
        }

        let mut applied = 0usize;
        for buffered in entries {
            match self
                .store
                .record_response(job_id, buffered.response.worker_id, buffered.response)
                .await?
            {
                RecordResponseOutcome::Accepted => applied += 1,
                RecordResponseOutcome::Duplicate => {
                    debug!(job_id = %job_id, "aggregator: dropped duplicate response at flush time");
                }
                RecordResponseOutcome::UnknownJob | RecordResponseOutcome::WorkerNotAssigned => {
                    warn!(job_id = %job_id, "aggregator: buffered response no longer valid at flush time");
                }
            }
        }
        if applied == 0 {
            return Ok(());
        }

        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.state.is_terminal() {
            return Ok(());
        }
        if job.responses.len() < job.min_workers as usize {
            return Ok(());
        }

        let best_response_id = meridian_protocol::response::best_response(&job.responses).map(|r| r.response_id);

        // `update_state` owns the load-decrement-on-terminalisation
        // contract (§3 Worker invariant (b), §4.1): it decrements every
        // assigned worker's load exactly once, guarded by the job's own
        // `load_decremented` flag, so this flush does not repeat that work.
        self.store
            .update_state(job_id, JobState::Completed, serde_json::Map::new())
            .await?;
        if let Some(response_id) = best_response_id {
            self.store.set_best_response(job_id, response_id).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, WorkerSnapshot, WorkerStore};
    use meridian_ids::ResponseId;
    use meridian_protocol::job::{InputRef, JobKind, Priority};
    use meridian_protocol::worker::Specialization;

    fn response(worker_id: WorkerId) -> Response {
        Response {
            response_id: ResponseId::new(),
            worker_id,
            submitted_at: Utc::now(),
            processing_time_s: 1.2,
            accuracy_score: Some(0.9),
            speed_score: Some(0.8),
            output: serde_json::json!({"text": "ok"}),
            output_blob_id: None,
            error: None,
        }
    }

    async fn setup(min_workers: u32, max_workers: u32) -> (Arc<dyn JobStore>, JobId, Vec<WorkerId>) {
        let store = Store::connect_in_memory().await.unwrap();
        let job_store: Arc<dyn JobStore> = Arc::new(store);
        let job_id = job_store
            .create_job(
                JobKind::Transcription,
                Priority::Normal,
                InputRef::none(),
                min_workers,
                max_workers,
                max_workers,
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        let workers: Vec<WorkerId> = (1..=max_workers as u64).map(WorkerId::from).collect();
        job_store.assign_workers(job_id, &workers, min_workers, max_workers).await.unwrap();
        (job_store, job_id, workers)
    }

    #[tokio::test]
    async fn buffers_until_full_replication_then_completes() {
        let (job_store, job_id, workers) = setup(1, 3).await;
        let aggregator = Aggregator::new(job_store.clone(), 10, chrono::Duration::hours(1));

        aggregator.submit(job_id, workers[0], response(workers[0])).await.unwrap();
        aggregator.submit(job_id, workers[1], response(workers[1])).await.unwrap();

        // Neither flush trigger (buffer size, full replication) has fired
        // yet with only 2 of 3 assigned workers responded.
        let job = job_store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.responses.is_empty());
        assert_eq!(aggregator.buffer_stats().await.buffered_responses, 2);

        // The third response reaches full replication and triggers a flush;
        // min_workers == 1 is already satisfied, so the job completes.
        let outcome = aggregator.submit(job_id, workers[2], response(workers[2])).await.unwrap();
        assert_eq!(outcome, RecordResponseOutcome::Accepted);

        let job = job_store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.responses.len(), 3);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.best_response.is_some());
        assert_eq!(aggregator.buffer_stats().await.buffered_responses, 0);
    }

    #[tokio::test]
    async fn rejects_duplicate_response_from_same_worker() {
        let (job_store, job_id, workers) = setup(1, 3).await;
        let aggregator = Aggregator::new(job_store.clone(), 10, chrono::Duration::hours(1));

        let first = aggregator.submit(job_id, workers[0], response(workers[0])).await.unwrap();
        assert_eq!(first, RecordResponseOutcome::Accepted);

        // Still buffered (not yet flushed), duplicate caught in-buffer.
        let dup = aggregator.submit(job_id, workers[0], response(workers[0])).await.unwrap();
        assert_eq!(dup, RecordResponseOutcome::Duplicate);

        aggregator.force_flush_all().await.unwrap();

        // Duplicate caught against the committed store row after flush.
        let dup_after_flush = aggregator.submit(job_id, workers[0], response(workers[0])).await.unwrap();
        assert_eq!(dup_after_flush, RecordResponseOutcome::Duplicate);
    }

    #[tokio::test]
    async fn rejects_response_from_worker_not_assigned() {
        let (job_store, job_id, _workers) = setup(1, 3).await;
        let aggregator = Aggregator::new(job_store, 10, chrono::Duration::hours(1));

        let stranger = WorkerId::from(999u64);
        let outcome = aggregator.submit(job_id, stranger, response(stranger)).await.unwrap();
        assert_eq!(outcome, RecordResponseOutcome::WorkerNotAssigned);
    }

    #[tokio::test]
    async fn partial_responses_stay_buffered_below_size_threshold_until_forced() {
        let (job_store, job_id, workers) = setup(1, 3).await;
        let aggregator = Aggregator::new(job_store.clone(), 10, chrono::Duration::hours(1));

        aggregator.submit(job_id, workers[0], response(workers[0])).await.unwrap();
        let job = job_store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.responses.is_empty(), "single response under both thresholds should stay buffered");

        let flushed = aggregator.force_flush_all().await.unwrap();
        assert_eq!(flushed, 1);
        let job = job_store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.responses.len(), 1);
        // min_workers == 1 so the forced flush alone completes the job.
        assert_eq!(job.state, JobState::Completed);
    }
}
