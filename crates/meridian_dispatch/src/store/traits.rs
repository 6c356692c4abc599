//! Capability sets the orchestrator, scheduler, and aggregator are
//! polymorphic over (§9 "Dynamic typing / duck typing"). A Postgres-backed
//! implementation is a drop-in: it only needs to satisfy these traits, not
//! branch on the concrete adapter the way the source did.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use meridian_ids::{JobId, WorkerId};
use meridian_protocol::job::{InputRef, JobKind, JobState, Priority};
use meridian_protocol::worker::{BlobMetadata, Worker};
use meridian_protocol::{Job, Response};

use crate::error::Result;

/// Outcome of `AssignWorkers` (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct AssignOutcome {
    /// The subset of the requested workers actually committed. May be
    /// shorter than requested if some were rejected for duplication or
    /// capacity at commit time.
    pub committed: Vec<WorkerId>,
    /// Whether this commit moved the job from `pending` to `assigned`.
    pub transitioned_to_assigned: bool,
}

/// Outcome of `RecordResponse` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordResponseOutcome {
    Accepted,
    Duplicate,
    UnknownJob,
    WorkerNotAssigned,
}

/// The job half of the persistent store (C4). A concrete implementation
/// is expected to also implement `WorkerStore` over the same underlying
/// connection pool, since `assign_workers` needs a capacity check against
/// the worker roster at commit time (§4.3) — the core does not hold
/// transactions spanning both tables, but it does need both within reach.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        kind: JobKind,
        priority: Priority,
        input: InputRef,
        min_workers: u32,
        max_workers: u32,
        desired_workers: u32,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<JobId>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    async fn list_jobs_by_state(&self, state: JobState, limit: u32) -> Result<Vec<Job>>;

    /// Must use an index (array-contains semantics) on `assigned_workers`;
    /// duplicates from the underlying index are deduplicated before return.
    async fn list_jobs_assigned_to(
        &self,
        worker_id: WorkerId,
        state_filter: &[JobState],
    ) -> Result<Vec<Job>>;

    /// Atomic contract per §4.3: rejects workers already assigned, rejects
    /// workers whose `effective_load >= max_capacity` at commit time,
    /// commits the remaining subset, and transitions `pending -> assigned`
    /// iff the post-commit size reaches `min_workers`.
    async fn assign_workers(
        &self,
        job_id: JobId,
        new_worker_ids: &[WorkerId],
        min_workers: u32,
        max_workers: u32,
    ) -> Result<AssignOutcome>;

    /// Idempotent w.r.t. `(job_id, worker_id)` (§4.1).
    async fn record_response(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        response: Response,
    ) -> Result<RecordResponseOutcome>;

    /// Enforces the state machine of §4.1. On transition into a terminal
    /// state, the store decrements load for every currently-assigned
    /// worker exactly once (idempotent via `load_decremented`).
    async fn update_state(
        &self,
        job_id: JobId,
        new_state: JobState,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    /// Records the `best_response` pointer computed by the aggregator
    /// (§4.4.1). Separate from `update_state`'s metadata patch since it
    /// targets a dedicated column, not the opaque metadata map.
    async fn set_best_response(
        &self,
        job_id: JobId,
        response_id: meridian_ids::ResponseId,
    ) -> Result<()>;

    /// Deletes terminal jobs older than `retention`. Policy-only per §4.5;
    /// provided as a real operation since it costs nothing to implement.
    async fn reap_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get_worker(&self, worker_id: WorkerId) -> Result<Option<Worker>>;

    async fn upsert_worker_report(
        &self,
        validator_id: &str,
        worker: WorkerSnapshot,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Eligibility and ranking per §4.2.2.
    async fn get_eligible_workers(
        &self,
        kind: JobKind,
        limit: u32,
        exclude: &[WorkerId],
        worker_timeout: chrono::Duration,
    ) -> Result<Vec<Worker>>;

    async fn inc_load(&self, worker_id: WorkerId) -> Result<()>;
    async fn dec_load(&self, worker_id: WorkerId) -> Result<()>;
    async fn load_of(&self, worker_id: WorkerId) -> Result<u32>;

    async fn reap_inactive(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Result<u64>;

    async fn leaderboard(&self, limit: u32) -> Result<Vec<Worker>>;

    /// Observability-only bookkeeping of which validators are actively
    /// reporting (§4.2 supplement). Never consulted for eligibility or
    /// trust decisions.
    async fn record_validator_seen(&self, validator_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn list_validators(&self) -> Result<Vec<(String, DateTime<Utc>)>>;
}

/// What a validator reports about one worker it observed (§4.2, input to
/// `UpsertWorkerReport`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub identity_key: String,
    pub is_serving: bool,
    pub stake: f64,
    pub performance_score: f64,
    pub load: f64,
    pub max_capacity: u32,
    pub specialization: meridian_protocol::worker::Specialization,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_blob(&self, blob_id: meridian_ids::BlobId) -> Result<Option<BlobMetadata>>;
    async fn put_blob(&self, blob: BlobMetadata) -> Result<()>;
}
