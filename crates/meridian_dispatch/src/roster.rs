//! Worker roster (C3): a thin cache-shaped layer over the store's worker
//! rows. Per §9 "Cyclic collaborators", the roster holds no back-reference
//! to the scheduler or aggregator that consult it — it is purely a
//! polymorphic view over `WorkerStore`, so a Postgres-backed store slots in
//! here without this module changing at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use meridian_ids::WorkerId;
use meridian_protocol::job::JobKind;
use meridian_protocol::Worker;

use crate::error::Result;
use crate::store::{WorkerSnapshot, WorkerStore};

#[derive(Clone)]
pub struct Roster {
    store: Arc<dyn WorkerStore>,
}

impl Roster {
    pub fn new(store: Arc<dyn WorkerStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, worker_id: WorkerId) -> Result<Option<Worker>> {
        self.store.get_worker(worker_id).await
    }

    /// `UpsertWorkerReport` (§4.2). Also records the reporting validator for
    /// the leaderboard/observability bookkeeping the distillation's §4.2
    /// supplement mentions; the validator id is never used as a trust
    /// decision (§9 security note).
    pub async fn report(&self, validator_id: &str, snapshot: WorkerSnapshot, now: DateTime<Utc>) -> Result<()> {
        self.store.upsert_worker_report(validator_id, snapshot, now).await?;
        self.store.record_validator_seen(validator_id, now).await
    }

    /// `GetEligibleWorkers` (§4.2.2).
    pub async fn eligible(
        &self,
        kind: JobKind,
        limit: u32,
        exclude: &[WorkerId],
        worker_timeout: chrono::Duration,
    ) -> Result<Vec<Worker>> {
        self.store.get_eligible_workers(kind, limit, exclude, worker_timeout).await
    }

    pub async fn inc_load(&self, worker_id: WorkerId) -> Result<()> {
        self.store.inc_load(worker_id).await
    }

    pub async fn dec_load(&self, worker_id: WorkerId) -> Result<()> {
        self.store.dec_load(worker_id).await
    }

    pub async fn load_of(&self, worker_id: WorkerId) -> Result<u32> {
        self.store.load_of(worker_id).await
    }

    /// §4.2 / §4.5: deletes rows whose `last_seen` is older than `timeout`.
    pub async fn reap_inactive(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Result<u64> {
        self.store.reap_inactive(timeout, now).await
    }

    /// `GetLeaderboard` (§6 egress to observers), sorted by
    /// `performance_score` descending then `stake` descending.
    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<Worker>> {
        self.store.leaderboard(limit).await
    }

    pub async fn validators(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.store.list_validators().await
    }
}
