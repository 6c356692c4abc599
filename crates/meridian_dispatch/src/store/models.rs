//! Row <-> domain conversions for the SQLite-backed store. Timestamps are
//! stored as RFC3339 text, identifiers as their `Display` form, and the
//! handful of composite fields (`assigned_workers`, `metadata`,
//! `specialization`, `reporters`, response `output`) as JSON text columns —
//! SQLite has no native array or object type, and the core never needs to
//! query inside them from SQL itself.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};

use meridian_ids::{BlobId, JobId, ResponseId, WorkerId};
use meridian_protocol::job::{InputRef, JobKind, JobState, Priority};
use meridian_protocol::worker::{BlobMetadata, Specialization};
use meridian_protocol::{Job, Response, Worker};

use crate::error::{DispatchError, Result};

pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| DispatchError::fatal(format!("bad timestamp in column {field}: {err}")))
}

pub fn parse_opt_ts(raw: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s, field)).transpose()
}

fn parse_job_state(raw: &str) -> Result<JobState> {
    JobState::parse(raw).ok_or_else(|| DispatchError::fatal(format!("unknown job state {raw:?}")))
}

fn parse_job_kind(raw: &str) -> Result<JobKind> {
    JobKind::parse(raw).ok_or_else(|| DispatchError::fatal(format!("unknown job kind {raw:?}")))
}

fn parse_priority(raw: &str) -> Result<Priority> {
    Ok(match raw {
        "low" => Priority::Low,
        "normal" => Priority::Normal,
        "high" => Priority::High,
        "urgent" => Priority::Urgent,
        other => return Err(DispatchError::fatal(format!("unknown priority {other:?}"))),
    })
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

pub fn parse_worker_ids(raw: &str) -> Result<Vec<WorkerId>> {
    let ids: Vec<u64> = serde_json::from_str(raw)?;
    Ok(ids.into_iter().map(WorkerId::from).collect())
}

pub fn worker_ids_json(ids: &[WorkerId]) -> Result<String> {
    let raw: Vec<u64> = ids.iter().map(|id| id.as_u64()).collect();
    Ok(serde_json::to_string(&raw)?)
}

fn parse_metadata(raw: &str) -> Result<BTreeMap<String, serde_json::Value>> {
    Ok(serde_json::from_str(raw)?)
}

pub fn parse_specialization(raw: &str) -> Result<Specialization> {
    let kinds: Vec<String> = serde_json::from_str(raw)?;
    kinds
        .iter()
        .map(|k| parse_job_kind(k))
        .collect::<Result<BTreeSet<_>>>()
}

pub fn specialization_json(specialization: &Specialization) -> Result<String> {
    let raw: Vec<&str> = specialization.iter().map(|k| k.as_str()).collect();
    Ok(serde_json::to_string(&raw)?)
}

pub fn parse_reporters(raw: &str) -> Result<BTreeSet<String>> {
    Ok(serde_json::from_str(raw)?)
}

pub fn reporters_json(reporters: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(reporters)?)
}

/// Reconstructs a `Job` from a `jobs` row joined with its `responses` rows.
/// `responses` must already be filtered to this job's `job_id` and ordered
/// by `submitted_at` ascending.
pub fn job_from_row(row: &SqliteRow, responses: Vec<Response>) -> Result<Job> {
    let job_id: String = row.try_get("job_id")?;
    let kind: String = row.try_get("kind")?;
    let priority: String = row.try_get("priority")?;
    let state: String = row.try_get("state")?;
    let assigned_workers: String = row.try_get("assigned_workers")?;
    let metadata: String = row.try_get("metadata")?;
    let input_blob_id: Option<String> = row.try_get("input_blob_id")?;
    let input_text_id: Option<String> = row.try_get("input_text_id")?;
    let best_response: Option<String> = row.try_get("best_response")?;

    Ok(Job {
        job_id: JobId::parse(&job_id)
            .map_err(|e| DispatchError::fatal(format!("bad job_id in store: {e}")))?,
        kind: parse_job_kind(&kind)?,
        priority: parse_priority(&priority)?,
        state: parse_job_state(&state)?,
        min_workers: row.try_get::<i64, _>("min_workers")? as u32,
        max_workers: row.try_get::<i64, _>("max_workers")? as u32,
        desired_workers: row.try_get::<i64, _>("desired_workers")? as u32,
        assigned_workers: parse_worker_ids(&assigned_workers)?,
        responses,
        load_decremented: row.try_get::<i64, _>("load_decremented")? != 0,
        input: InputRef {
            input_blob_id: input_blob_id
                .map(|raw| BlobId::parse(&raw))
                .transpose()
                .map_err(|e| DispatchError::fatal(format!("bad input_blob_id in store: {e}")))?,
            input_text_id,
        },
        best_response: best_response
            .map(|raw| ResponseId::parse(&raw))
            .transpose()
            .map_err(|e| DispatchError::fatal(format!("bad best_response id in store: {e}")))?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
        distributed_at: parse_opt_ts(row.try_get("distributed_at")?, "distributed_at")?,
        all_responses_at: parse_opt_ts(row.try_get("all_responses_at")?, "all_responses_at")?,
        completed_at: parse_opt_ts(row.try_get("completed_at")?, "completed_at")?,
        metadata: parse_metadata(&metadata)?,
    })
}

pub fn response_from_row(row: &SqliteRow) -> Result<Response> {
    let response_id: String = row.try_get("response_id")?;
    let worker_id: i64 = row.try_get("worker_id")?;
    let output: String = row.try_get("output")?;
    let output_blob_id: Option<String> = row.try_get("output_blob_id")?;

    Ok(Response {
        response_id: ResponseId::parse(&response_id)
            .map_err(|e| DispatchError::fatal(format!("bad response_id in store: {e}")))?,
        worker_id: WorkerId::from(worker_id as u64),
        submitted_at: parse_ts(&row.try_get::<String, _>("submitted_at")?, "submitted_at")?,
        processing_time_s: row.try_get("processing_time_s")?,
        accuracy_score: row.try_get("accuracy_score")?,
        speed_score: row.try_get("speed_score")?,
        output: serde_json::from_str(&output)?,
        output_blob_id: output_blob_id
            .map(|raw| BlobId::parse(&raw))
            .transpose()
            .map_err(|e| DispatchError::fatal(format!("bad output_blob_id in store: {e}")))?,
        error: row.try_get("error")?,
    })
}

pub fn response_output_json(response: &Response) -> Result<String> {
    Ok(serde_json::to_string(&response.output)?)
}

pub fn worker_from_row(row: &SqliteRow) -> Result<Worker> {
    let worker_id: i64 = row.try_get("worker_id")?;
    let specialization: String = row.try_get("specialization")?;
    let reporters: String = row.try_get("reporters")?;

    Ok(Worker {
        worker_id: WorkerId::from(worker_id as u64),
        identity_key: row.try_get("identity_key")?,
        is_serving: row.try_get::<i64, _>("is_serving")? != 0,
        stake: row.try_get("stake")?,
        performance_score: row.try_get("performance_score")?,
        specialization: parse_specialization(&specialization)?,
        max_capacity: row.try_get::<i64, _>("max_capacity")? as u32,
        load: row.try_get::<i64, _>("load")? as u32,
        last_seen: parse_ts(&row.try_get::<String, _>("last_seen")?, "last_seen")?,
        reporters: parse_reporters(&reporters)?,
    })
}

pub fn blob_from_row(row: &SqliteRow) -> Result<BlobMetadata> {
    let blob_id: String = row.try_get("blob_id")?;
    Ok(BlobMetadata {
        blob_id: BlobId::parse(&blob_id)
            .map_err(|e| DispatchError::fatal(format!("bad blob_id in store: {e}")))?,
        bucket: row.try_get("bucket")?,
        key: row.try_get("key")?,
        content_type: row.try_get("content_type")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
        public_url: row.try_get("public_url")?,
        hash: row.try_get("hash")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
    })
}

pub struct JobInsert<'a> {
    pub job_id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub min_workers: u32,
    pub max_workers: u32,
    pub desired_workers: u32,
    pub input: &'a InputRef,
    pub metadata: &'a BTreeMap<String, serde_json::Value>,
    pub now: DateTime<Utc>,
}

pub fn job_insert_params(insert: &JobInsert<'_>) -> Result<JobInsertParams> {
    Ok(JobInsertParams {
        job_id: insert.job_id.to_string(),
        kind: insert.kind.as_str().to_string(),
        priority: priority_str(insert.priority).to_string(),
        state: JobState::Pending.as_str().to_string(),
        min_workers: insert.min_workers as i64,
        max_workers: insert.max_workers as i64,
        desired_workers: insert.desired_workers as i64,
        assigned_workers: "[]".to_string(),
        metadata: serde_json::to_string(insert.metadata)?,
        input_blob_id: insert.input.input_blob_id.map(|id| id.to_string()),
        input_text_id: insert.input.input_text_id.clone(),
        created_at: to_rfc3339(insert.now),
        updated_at: to_rfc3339(insert.now),
    })
}

pub struct JobInsertParams {
    pub job_id: String,
    pub kind: String,
    pub priority: String,
    pub state: String,
    pub min_workers: i64,
    pub max_workers: i64,
    pub desired_workers: i64,
    pub assigned_workers: String,
    pub metadata: String,
    pub input_blob_id: Option<String>,
    pub input_text_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn job_state_str(state: JobState) -> &'static str {
    state.as_str()
}

pub fn worker_id_to_i64(worker_id: WorkerId) -> i64 {
    worker_id.as_u64() as i64
}

pub fn parse_worker_id_column(raw: i64) -> WorkerId {
    WorkerId::from(raw as u64)
}
