use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};

use meridian_ids::WorkerId;
use meridian_protocol::job::JobKind;
use meridian_protocol::worker::{self as worker_fns, Worker};

use crate::error::{DispatchError, Result};

use super::models::{
    parse_reporters, parse_specialization, parse_worker_id_column, reporters_json,
    specialization_json, to_rfc3339, worker_from_row, worker_id_to_i64,
};
use super::traits::{WorkerSnapshot, WorkerStore};
use super::Store;

#[async_trait]
impl WorkerStore for Store {
    async fn get_worker(&self, worker_id: WorkerId) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE worker_id = ?1")
            .bind(worker_id_to_i64(worker_id))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn upsert_worker_report(
        &self,
        validator_id: &str,
        worker: WorkerSnapshot,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM workers WHERE worker_id = ?1")
            .bind(worker_id_to_i64(worker.worker_id))
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            None => {
                let mut reporters = BTreeSet::new();
                reporters.insert(validator_id.to_string());
                sqlx::query(
                    r#"
                    INSERT INTO workers (
                        worker_id, identity_key, is_serving, stake, performance_score,
                        specialization, max_capacity, load, last_seen, reporters
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)
                    "#,
                )
                .bind(worker_id_to_i64(worker.worker_id))
                .bind(&worker.identity_key)
                .bind(worker.is_serving)
                .bind(worker.stake)
                .bind(worker.performance_score)
                .bind(specialization_json(&worker.specialization)?)
                .bind(worker.max_capacity as i64)
                .bind(to_rfc3339(now))
                .bind(reporters_json(&reporters)?)
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let stored_identity: String = row.try_get("identity_key")?;
                let mut reporters = parse_reporters(&row.try_get::<String, _>("reporters")?)?;

                // A worker_id is network-assigned and can be handed to a
                // different physical worker over time. When the reported
                // identity no longer matches what we have on file, treat
                // this as a new worker occupying the slot rather than
                // merging stale history into it (SPEC_FULL §4.2.1).
                let reused_slot = !stored_identity.is_empty() && stored_identity != worker.identity_key;

                if reused_slot {
                    reporters.clear();
                    reporters.insert(validator_id.to_string());
                    sqlx::query(
                        r#"
                        UPDATE workers
                        SET identity_key = ?1, is_serving = ?2, stake = ?3, performance_score = ?4,
                            specialization = ?5, max_capacity = ?6, load = 0, last_seen = ?7,
                            reporters = ?8
                        WHERE worker_id = ?9
                        "#,
                    )
                    .bind(&worker.identity_key)
                    .bind(worker.is_serving)
                    .bind(worker.stake)
                    .bind(worker.performance_score)
                    .bind(specialization_json(&worker.specialization)?)
                    .bind(worker.max_capacity as i64)
                    .bind(to_rfc3339(now))
                    .bind(reporters_json(&reporters)?)
                    .bind(worker_id_to_i64(worker.worker_id))
                    .execute(&mut *tx)
                    .await?;
                } else {
                    let old_reporter_count = reporters.len();
                    reporters.insert(validator_id.to_string());

                    let old_performance: f64 = row.try_get("performance_score")?;
                    let old_stake: f64 = row.try_get("stake")?;
                    let old_serving = row.try_get::<i64, _>("is_serving")? != 0;
                    let old_max_capacity: i64 = row.try_get("max_capacity")?;
                    let old_specialization =
                        parse_specialization(&row.try_get::<String, _>("specialization")?)?;

                    let merged_performance = worker_fns::weighted_merge(
                        old_performance,
                        old_reporter_count,
                        worker.performance_score,
                        1,
                    );
                    let merged_stake = old_stake.max(worker.stake);
                    let merged_serving = old_serving || worker.is_serving;
                    let merged_max_capacity = (old_max_capacity as u32).max(worker.max_capacity);
                    let merged_specialization =
                        worker_fns::merge_specialization(&old_specialization, &worker.specialization);

                    sqlx::query(
                        r#"
                        UPDATE workers
                        SET is_serving = ?1, stake = ?2, performance_score = ?3, specialization = ?4,
                            max_capacity = ?5, last_seen = ?6, reporters = ?7
                        WHERE worker_id = ?8
                        "#,
                    )
                    .bind(merged_serving)
                    .bind(merged_stake)
                    .bind(merged_performance)
                    .bind(specialization_json(&merged_specialization)?)
                    .bind(merged_max_capacity as i64)
                    .bind(to_rfc3339(now))
                    .bind(reporters_json(&reporters)?)
                    .bind(worker_id_to_i64(worker.worker_id))
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_eligible_workers(
        &self,
        kind: JobKind,
        limit: u32,
        exclude: &[WorkerId],
        worker_timeout: chrono::Duration,
    ) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE is_serving = 1")
            .fetch_all(&self.pool)
            .await?;

        let live_count_rows = sqlx::query(
            r#"
            SELECT a.worker_id AS worker_id, COUNT(*) AS live_count
            FROM assignments a
            JOIN jobs j ON j.job_id = a.job_id
            WHERE j.state IN ('assigned', 'in_progress')
            GROUP BY a.worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut live_counts: HashMap<WorkerId, u32> = HashMap::new();
        for row in &live_count_rows {
            let worker_id = parse_worker_id_column(row.try_get("worker_id")?);
            live_counts.insert(worker_id, row.try_get::<i64, _>("live_count")? as u32);
        }

        let now = Utc::now();
        let excluded: BTreeSet<WorkerId> = exclude.iter().copied().collect();
        let mut candidates = Vec::new();
        for row in &rows {
            let worker = worker_from_row(row)?;
            if excluded.contains(&worker.worker_id) {
                continue;
            }
            let live_count = live_counts.get(&worker.worker_id).copied().unwrap_or(0);
            let effective_load = worker_fns::effective_load(worker.load, live_count);
            if !worker_fns::is_eligible(&worker, effective_load, kind, now, worker_timeout) {
                continue;
            }
            let score = worker_fns::availability_score(
                worker.performance_score,
                effective_load,
                worker.max_capacity,
                worker.stake,
                now,
                worker.last_seen,
                worker_timeout,
            );
            candidates.push((score, worker));
        }

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        candidates.truncate(limit as usize);
        Ok(candidates.into_iter().map(|(_, worker)| worker).collect())
    }

    async fn inc_load(&self, worker_id: WorkerId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE workers SET load = MIN(load + 1, max_capacity) WHERE worker_id = ?1",
        )
        .bind(worker_id_to_i64(worker_id))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // §4.2 `IncLoad`: a row that does not yet exist is created
            // minimally (max_capacity=5, load=1) rather than erroring.
            let mut reporters = BTreeSet::new();
            reporters.insert("__inc_load__".to_string());
            sqlx::query(
                r#"
                INSERT INTO workers (
                    worker_id, identity_key, is_serving, stake, performance_score,
                    specialization, max_capacity, load, last_seen, reporters
                ) VALUES (?1, '', 1, 0.0, 0.0, ?2, 5, 1, ?3, ?4)
                "#,
            )
            .bind(worker_id_to_i64(worker_id))
            .bind(specialization_json(&worker_fns::Specialization::new())?)
            .bind(to_rfc3339(Utc::now()))
            .bind(reporters_json(&reporters)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dec_load(&self, worker_id: WorkerId) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET load = MAX(load - 1, 0) WHERE worker_id = ?1")
            .bind(worker_id_to_i64(worker_id))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DispatchError::not_found(format!("worker {worker_id} not found")));
        }
        Ok(())
    }

    async fn load_of(&self, worker_id: WorkerId) -> Result<u32> {
        let row = sqlx::query("SELECT load FROM workers WHERE worker_id = ?1")
            .bind(worker_id_to_i64(worker_id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("worker {worker_id} not found")))?;
        Ok(row.try_get::<i64, _>("load")? as u32)
    }

    async fn reap_inactive(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - timeout;
        let result = sqlx::query("DELETE FROM workers WHERE last_seen <= ?1")
            .bind(to_rfc3339(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_validator_seen(&self, validator_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO validators (validator_id, last_seen) VALUES (?1, ?2)
            ON CONFLICT(validator_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(validator_id)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_validators(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows = sqlx::query("SELECT validator_id, last_seen FROM validators ORDER BY validator_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let validator_id: String = row.try_get("validator_id")?;
                let last_seen_raw: String = row.try_get("last_seen")?;
                let last_seen = super::models::parse_ts(&last_seen_raw, "last_seen")?;
                Ok((validator_id, last_seen))
            })
            .collect()
    }

    async fn leaderboard(&self, limit: u32) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workers
            ORDER BY performance_score DESC, stake DESC, worker_id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }
}
