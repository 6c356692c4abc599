//! In-process control facade (§6, SPEC_FULL "Unchanged operation list...
//! In this workspace these are inherent async methods on `Dispatcher`").
//! This request/response enum pair mirrors the teacher's `control.rs`
//! shape purely so an eventual transport layer has something to
//! serialize; it does not implement that transport (out of scope, §1).

use serde::{Deserialize, Serialize};

use meridian_ids::{JobId, ValidatorId, WorkerId};
use meridian_protocol::job::{InputRef, JobKind, JobState, Priority};
use meridian_protocol::{Job, Response};

use crate::store::WorkerSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlRequest {
    SubmitJob {
        kind: JobKind,
        priority: Priority,
        min_workers: Option<u32>,
        max_workers: Option<u32>,
        desired_workers: Option<u32>,
        input: InputRef,
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    CancelJob {
        job_id: JobId,
    },
    ReportWorkers {
        validator_id: ValidatorId,
        workers: Vec<WorkerSnapshot>,
        epoch: u64,
    },
    MarkJobDone {
        job_id: JobId,
        evaluation: serde_json::Value,
    },
    SubmitResponse {
        job_id: JobId,
        worker_id: WorkerId,
        response: Response,
    },
    ListMyJobs {
        worker_id: WorkerId,
        states: Vec<JobState>,
    },
    ListJobsReadyForEvaluation {
        validator_id: ValidatorId,
    },
    GetJobResponses {
        job_id: JobId,
    },
    GetStatistics,
    GetLeaderboard {
        limit: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlResponse {
    JobSubmitted { job_id: JobId },
    Ack,
    Jobs(Vec<Job>),
    JobResponses(Option<JobResponsesView>),
    Statistics(crate::stats::JobCounts),
    Leaderboard(Vec<meridian_protocol::Worker>),
    Error { code: String, message: String },
}

/// `GetJobResponses` egress view (§6): the best response and summary
/// statistics, not the raw bytes of competing responses unless the caller
/// is authorised (authorisation is a transport/auth concern, out of
/// scope; this view simply omits non-best responses by construction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponsesView {
    pub job_id: JobId,
    pub state: JobState,
    pub best_response: Option<Response>,
    pub response_count: usize,
    pub expected_count: u32,
}
