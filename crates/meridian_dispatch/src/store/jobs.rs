use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use meridian_ids::{AssignmentId, JobId, WorkerId};
use meridian_protocol::job::{InputRef, JobKind, JobState, Priority};
use meridian_protocol::Response;

use crate::error::{DispatchError, Result};

use super::models::{
    self, job_from_row, job_insert_params, job_state_str, response_from_row, response_output_json,
    to_rfc3339, worker_id_to_i64, worker_ids_json, JobInsert,
};
use super::traits::{AssignOutcome, JobStore, RecordResponseOutcome};
use super::Store;

fn parse_job_state(raw: &str) -> Result<JobState> {
    JobState::parse(raw).ok_or_else(|| DispatchError::fatal(format!("unknown job state {raw:?}")))
}

impl Store {
    async fn responses_for(&self, job_id: JobId) -> Result<Vec<Response>> {
        let rows = sqlx::query(
            "SELECT * FROM responses WHERE job_id = ?1 ORDER BY submitted_at ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(response_from_row).collect()
    }
}

#[async_trait]
impl JobStore for Store {
    async fn create_job(
        &self,
        kind: JobKind,
        priority: Priority,
        input: InputRef,
        min_workers: u32,
        max_workers: u32,
        desired_workers: u32,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<JobId> {
        if !input.is_valid() {
            return Err(DispatchError::invariant(
                "input_blob_id and input_text_id cannot both be set",
            ));
        }
        if min_workers == 0 || min_workers > max_workers {
            return Err(DispatchError::invariant(format!(
                "min_workers={min_workers} must be >0 and <= max_workers={max_workers}"
            )));
        }
        let job_id = JobId::new();
        let metadata: std::collections::BTreeMap<String, serde_json::Value> =
            metadata.into_iter().collect();
        let params = job_insert_params(&JobInsert {
            job_id,
            kind,
            priority,
            min_workers,
            max_workers,
            desired_workers,
            input: &input,
            metadata: &metadata,
            now: Utc::now(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, kind, priority, state, min_workers, max_workers, desired_workers,
                assigned_workers, load_decremented, input_blob_id, input_text_id, best_response,
                created_at, updated_at, distributed_at, all_responses_at, completed_at, metadata
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, NULL, ?11, ?12, NULL, NULL, NULL, ?13
            )
            "#,
        )
        .bind(params.job_id)
        .bind(params.kind)
        .bind(params.priority)
        .bind(params.state)
        .bind(params.min_workers)
        .bind(params.max_workers)
        .bind(params.desired_workers)
        .bind(params.assigned_workers)
        .bind(params.input_blob_id)
        .bind(params.input_text_id)
        .bind(params.created_at)
        .bind(params.updated_at)
        .bind(params.metadata)
        .execute(&self.pool)
        .await?;

        Ok(job_id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<meridian_protocol::Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let responses = self.responses_for(job_id).await?;
        Ok(Some(job_from_row(&row, responses)?))
    }

    async fn list_jobs_by_state(&self, state: JobState, limit: u32) -> Result<Vec<meridian_protocol::Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC LIMIT ?2",
        )
        .bind(job_state_str(state))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let job_id_raw: String = row.try_get("job_id")?;
            let job_id = JobId::parse(&job_id_raw)
                .map_err(|e| DispatchError::fatal(format!("bad job_id in store: {e}")))?;
            let responses = self.responses_for(job_id).await?;
            jobs.push(job_from_row(row, responses)?);
        }
        Ok(jobs)
    }

    async fn list_jobs_assigned_to(
        &self,
        worker_id: WorkerId,
        state_filter: &[JobState],
    ) -> Result<Vec<meridian_protocol::Job>> {
        let rows = sqlx::query(
            r#"
            SELECT j.* FROM jobs j
            JOIN assignments a ON a.job_id = j.job_id
            WHERE a.worker_id = ?1
            ORDER BY j.created_at ASC
            "#,
        )
        .bind(worker_id_to_i64(worker_id))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::new();
        for row in &rows {
            let state_raw: String = row.try_get("state")?;
            let state = parse_job_state(&state_raw)?;
            if !state_filter.is_empty() && !state_filter.contains(&state) {
                continue;
            }
            let job_id_raw: String = row.try_get("job_id")?;
            let job_id = JobId::parse(&job_id_raw)
                .map_err(|e| DispatchError::fatal(format!("bad job_id in store: {e}")))?;
            let responses = self.responses_for(job_id).await?;
            jobs.push(job_from_row(row, responses)?);
        }
        Ok(jobs)
    }

    async fn assign_workers(
        &self,
        job_id: JobId,
        new_worker_ids: &[WorkerId],
        min_workers: u32,
        max_workers: u32,
    ) -> Result<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, assigned_workers FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("job {job_id} not found")))?;

        let state = parse_job_state(&row.try_get::<String, _>("state")?)?;
        if state != JobState::Pending && state != JobState::Assigned {
            return Err(DispatchError::invariant(format!(
                "job {job_id} is not open for assignment (state={})",
                state.as_str()
            )));
        }
        let mut assigned = models::parse_worker_ids(&row.try_get::<String, _>("assigned_workers")?)?;

        let mut committed = Vec::new();
        for &candidate in new_worker_ids {
            if assigned.len() as u32 >= max_workers {
                break;
            }
            if assigned.contains(&candidate) {
                continue;
            }
            let worker_row = sqlx::query("SELECT load, max_capacity FROM workers WHERE worker_id = ?1")
                .bind(worker_id_to_i64(candidate))
                .fetch_optional(&mut *tx)
                .await?;
            let Some(worker_row) = worker_row else {
                continue; // worker vanished from the roster since selection
            };
            let load: i64 = worker_row.try_get("load")?;
            let max_capacity: i64 = worker_row.try_get("max_capacity")?;

            // §4.3 commit-time re-check: reject on `effective_load =
            // max(counter, live_count)`, not the raw counter alone. The
            // scheduler only calls `IncLoad` after this transaction
            // commits, so a concurrent pass can still see a stale `load`
            // counter for this worker; the live join against active jobs
            // closes that race (§5 scenario 6).
            let live_count: i64 = sqlx::query(
                r#"
                SELECT COUNT(*) AS n
                FROM assignments a
                JOIN jobs j ON j.job_id = a.job_id
                WHERE a.worker_id = ?1 AND j.state IN ('assigned', 'in_progress')
                "#,
            )
            .bind(worker_id_to_i64(candidate))
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
            let effective_load = load.max(live_count);
            if effective_load >= max_capacity {
                continue; // over quota at commit time, drop silently (§4.3)
            }
            assigned.push(candidate);
            committed.push(candidate);
        }

        let now = Utc::now();
        let transitioned = state == JobState::Pending && assigned.len() as u32 >= min_workers;
        let new_state = if transitioned { JobState::Assigned } else { state };

        sqlx::query(
            r#"
            UPDATE jobs
            SET assigned_workers = ?1, state = ?2, updated_at = ?3,
                distributed_at = COALESCE(distributed_at, ?3)
            WHERE job_id = ?4
            "#,
        )
        .bind(worker_ids_json(&assigned)?)
        .bind(new_state.as_str())
        .bind(to_rfc3339(now))
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        for &worker_id in &committed {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO assignments
                    (assignment_id, job_id, worker_id, state, assigned_at, completed_at)
                VALUES (?1, ?2, ?3, 'pending', ?4, NULL)
                "#,
            )
            .bind(AssignmentId::new().to_string())
            .bind(job_id.to_string())
            .bind(worker_id_to_i64(worker_id))
            .bind(to_rfc3339(now))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(AssignOutcome {
            committed,
            transitioned_to_assigned: transitioned,
        })
    }

    async fn record_response(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        response: Response,
    ) -> Result<RecordResponseOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, assigned_workers FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(RecordResponseOutcome::UnknownJob);
        };
        let assigned = models::parse_worker_ids(&row.try_get::<String, _>("assigned_workers")?)?;
        if !assigned.contains(&worker_id) {
            return Ok(RecordResponseOutcome::WorkerNotAssigned);
        }

        let output_json = response_output_json(&response)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO responses (
                response_id, job_id, worker_id, submitted_at, processing_time_s,
                accuracy_score, speed_score, output, output_blob_id, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(response.response_id.to_string())
        .bind(job_id.to_string())
        .bind(worker_id_to_i64(worker_id))
        .bind(to_rfc3339(response.submitted_at))
        .bind(response.processing_time_s)
        .bind(response.accuracy_score)
        .bind(response.speed_score)
        .bind(output_json)
        .bind(response.output_blob_id.map(|id| id.to_string()))
        .bind(response.error)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Either this worker already responded (job_id, worker_id) is
            // unique, or the response_id itself collided.
            tx.commit().await?;
            return Ok(RecordResponseOutcome::Duplicate);
        }

        let response_count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM responses WHERE job_id = ?1")
                .bind(job_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get("n")?;

        if response_count as usize >= assigned.len() {
            sqlx::query(
                "UPDATE jobs SET all_responses_at = COALESCE(all_responses_at, ?1), updated_at = ?1 WHERE job_id = ?2",
            )
            .bind(to_rfc3339(Utc::now()))
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(RecordResponseOutcome::Accepted)
    }

    async fn update_state(
        &self,
        job_id: JobId,
        new_state: JobState,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, assigned_workers, metadata, load_decremented FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("job {job_id} not found")))?;

        let current_state = parse_job_state(&row.try_get::<String, _>("state")?)?;
        if !meridian_protocol::job::is_legal_transition(current_state, new_state) {
            return Err(DispatchError::invariant(format!(
                "illegal transition {} -> {}",
                current_state.as_str(),
                new_state.as_str()
            )));
        }

        let mut metadata: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&row.try_get::<String, _>("metadata")?)?;
        for (key, value) in patch {
            metadata.insert(key, value);
        }

        let now = Utc::now();
        let assigned = models::parse_worker_ids(&row.try_get::<String, _>("assigned_workers")?)?;
        let already_decremented = row.try_get::<i64, _>("load_decremented")? != 0;
        let entering_terminal = new_state.is_terminal();

        let metadata_json = serde_json::to_string(&metadata)?;
        let now_str = to_rfc3339(now);
        if entering_terminal {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = ?1, metadata = ?2, updated_at = ?3, completed_at = ?3,
                    load_decremented = 1
                WHERE job_id = ?4
                "#,
            )
            .bind(new_state.as_str())
            .bind(metadata_json)
            .bind(&now_str)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET state = ?1, metadata = ?2, updated_at = ?3 WHERE job_id = ?4",
            )
            .bind(new_state.as_str())
            .bind(metadata_json)
            .bind(&now_str)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        if entering_terminal && !already_decremented {
            for &worker_id in &assigned {
                sqlx::query(
                    "UPDATE workers SET load = MAX(load - 1, 0) WHERE worker_id = ?1",
                )
                .bind(worker_id_to_i64(worker_id))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_best_response(&self, job_id: JobId, response_id: meridian_ids::ResponseId) -> Result<()> {
        sqlx::query("UPDATE jobs SET best_response = ?1, updated_at = ?2 WHERE job_id = ?3")
            .bind(response_id.to_string())
            .bind(to_rfc3339(Utc::now()))
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reap_terminal_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'done', 'approved', 'failed', 'cancelled')
              AND updated_at < ?1
            "#,
        )
        .bind(to_rfc3339(older_than))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let state_raw: String = row.try_get("state")?;
            if let Ok(state) = parse_job_state(&state_raw) {
                counts.push((state, row.try_get::<i64, _>("n")?));
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_ids::ResponseId;

    fn dummy_response(worker_id: WorkerId) -> Response {
        Response {
            response_id: ResponseId::new(),
            worker_id,
            submitted_at: Utc::now(),
            processing_time_s: 1.0,
            accuracy_score: Some(0.8),
            speed_score: Some(0.8),
            output: serde_json::json!({}),
            output_blob_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_job_rejects_zero_min_workers() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 0, 3, 3, serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_max_below_min() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 3, 2, 2, serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_both_input_refs_set() {
        let store = Store::connect_in_memory().await.unwrap();
        let input = InputRef {
            input_blob_id: Some(meridian_ids::BlobId::new()),
            input_text_id: Some("x".to_string()),
        };
        let err = store
            .create_job(JobKind::Transcription, Priority::Normal, input, 1, 3, 3, serde_json::Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn record_response_is_idempotent_per_worker() {
        let store = Store::connect_in_memory().await.unwrap();
        let job_id = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
            .await
            .unwrap();
        let w1 = WorkerId::from(1u64);
        JobStore::assign_workers(&store, job_id, &[w1], 1, 3).await.unwrap();

        let first = store.record_response(job_id, w1, dummy_response(w1)).await.unwrap();
        assert_eq!(first, RecordResponseOutcome::Accepted);
        let second = store.record_response(job_id, w1, dummy_response(w1)).await.unwrap();
        assert_eq!(second, RecordResponseOutcome::Duplicate);

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.responses.len(), 1);
    }

    #[tokio::test]
    async fn record_response_rejects_worker_not_assigned() {
        let store = Store::connect_in_memory().await.unwrap();
        let job_id = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
            .await
            .unwrap();
        let stranger = WorkerId::from(99u64);
        let outcome = store.record_response(job_id, stranger, dummy_response(stranger)).await.unwrap();
        assert_eq!(outcome, RecordResponseOutcome::WorkerNotAssigned);
    }

    #[tokio::test]
    async fn update_state_rejects_illegal_transition() {
        let store = Store::connect_in_memory().await.unwrap();
        let job_id = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
            .await
            .unwrap();
        // pending -> completed skips the legal `assigned`/`in_progress` steps.
        let err = store.update_state(job_id, JobState::Completed, serde_json::Map::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn update_state_decrements_load_exactly_once_on_terminalisation() {
        let store = Store::connect_in_memory().await.unwrap();
        let job_id = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 1, 1, serde_json::Map::new())
            .await
            .unwrap();
        let w1 = WorkerId::from(1u64);
        sqlx::query(
            "INSERT INTO workers (worker_id, identity_key, is_serving, stake, performance_score, specialization, max_capacity, load, last_seen, reporters) VALUES (1, 'k', 1, 0.0, 0.0, '[]', 5, 0, ?1, '[]')",
        )
        .bind(to_rfc3339(Utc::now()))
        .execute(&store.pool)
        .await
        .unwrap();
        JobStore::assign_workers(&store, job_id, &[w1], 1, 1).await.unwrap();
        // `assign_workers` itself does not touch `load`; the scheduler is
        // responsible for calling `IncLoad` for each newly committed
        // worker (§4.3 step 2f). Simulate that here.
        crate::store::WorkerStore::inc_load(&store, w1).await.unwrap();
        assert_eq!(
            sqlx::query("SELECT load FROM workers WHERE worker_id = 1").fetch_one(&store.pool).await.unwrap().try_get::<i64, _>("load").unwrap(),
            1
        );

        store.update_state(job_id, JobState::Cancelled, serde_json::Map::new()).await.unwrap();
        assert_eq!(
            sqlx::query("SELECT load FROM workers WHERE worker_id = 1").fetch_one(&store.pool).await.unwrap().try_get::<i64, _>("load").unwrap(),
            0
        );

        // A second terminal transition attempt is itself illegal (cancelled
        // is terminal), so the load-decrement-once guard can't be probed
        // via update_state again; the `load_decremented` flag exists purely
        // to survive a restart mid-flush, which this test can't simulate
        // without re-entrant access to the same row outside the trait.
    }

    #[tokio::test]
    async fn reap_terminal_jobs_deletes_only_old_terminal_rows() {
        let store = Store::connect_in_memory().await.unwrap();
        let old_job = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 1, 1, serde_json::Map::new())
            .await
            .unwrap();
        let recent_job = store
            .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 1, 1, serde_json::Map::new())
            .await
            .unwrap();
        store.update_state(old_job, JobState::Failed, serde_json::Map::new()).await.unwrap();
        store.update_state(recent_job, JobState::Failed, serde_json::Map::new()).await.unwrap();

        let ancient = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE job_id = ?2")
            .bind(ancient)
            .bind(old_job.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let deleted = store.reap_terminal_jobs(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_job(old_job).await.unwrap().is_none());
        assert!(store.get_job(recent_job).await.unwrap().is_some());
    }
}
