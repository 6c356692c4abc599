use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use meridian_ids::{AssignmentId, BlobId, JobId, ResponseId, WorkerId};

use crate::response::Response;

/// The kind of compute job a client can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transcription,
    Tts,
    Summarization,
    TextTranslation,
    DocumentTranslation,
    VideoTranscription,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Transcription,
        JobKind::Tts,
        JobKind::Summarization,
        JobKind::TextTranslation,
        JobKind::DocumentTranslation,
        JobKind::VideoTranscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcription => "transcription",
            JobKind::Tts => "tts",
            JobKind::Summarization => "summarization",
            JobKind::TextTranslation => "text_translation",
            JobKind::DocumentTranslation => "document_translation",
            JobKind::VideoTranscription => "video_transcription",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    /// Base replication hint used only to size `desired_workers` when a
    /// caller does not specify one explicitly. See SPEC_FULL §3.
    fn base_replication_hint(&self) -> u32 {
        match self {
            JobKind::Transcription | JobKind::Tts | JobKind::VideoTranscription => 2,
            JobKind::Summarization | JobKind::TextTranslation | JobKind::DocumentTranslation => 3,
        }
    }
}

/// Client-declared urgency. Affects only the default replication sizing
/// (`desired_worker_count`), never scheduling order within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    fn multiplier(&self) -> f64 {
        match self {
            Priority::Low => 0.8,
            Priority::Normal => 1.0,
            Priority::High => 1.3,
            Priority::Urgent => 1.5,
        }
    }
}

/// Size the default `desired_workers` for a job from its kind and priority,
/// clamped into `[min_workers, max_workers]`. Callers may still override
/// this with an explicit value at submission time.
pub fn desired_worker_count(kind: JobKind, priority: Priority, min: u32, max: u32) -> u32 {
    let raw = (kind.base_replication_hint() as f64 * priority.multiplier()).round() as i64;
    raw.clamp(min as i64, max as i64) as u32
}

/// The job lifecycle state machine (§4.1). Transitions are enforced by the
/// job store, not by this type — this enum only names the legal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Done,
    Approved,
    Failed,
    Cancelled,
}

impl JobState {
    /// States from the core's authority the job will never leave on its
    /// own. `Completed` is terminal from the core's perspective too, but an
    /// external validator flow may still advance it to `Done`/`Approved`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Done
                | JobState::Approved
                | JobState::Failed
                | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Assigned => "assigned",
            JobState::InProgress => "in_progress",
            JobState::Completed => "completed",
            JobState::Done => "done",
            JobState::Approved => "approved",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "pending" => JobState::Pending,
            "assigned" => JobState::Assigned,
            "in_progress" => JobState::InProgress,
            "completed" => JobState::Completed,
            "done" => JobState::Done,
            "approved" => JobState::Approved,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            _ => return None,
        })
    }

    pub const ALL: [JobState; 8] = [
        JobState::Pending,
        JobState::Assigned,
        JobState::InProgress,
        JobState::Completed,
        JobState::Done,
        JobState::Approved,
        JobState::Failed,
        JobState::Cancelled,
    ];
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStateError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
}

/// Check whether `from -> to` is a legal transition per the state machine
/// diagram in §4.1. `UpdateState` must refuse anything this rejects.
pub fn is_legal_transition(from: JobState, to: JobState) -> bool {
    use JobState::*;
    if from == to {
        return false;
    }
    match (from, to) {
        (Pending, Assigned) => true,
        (Pending, Failed) => true,
        (Assigned, InProgress) => true,
        (Assigned, Completed) => true,
        (InProgress, Completed) => true,
        (Completed, Done) => true,
        (Done, Approved) => true,
        // cancellation is reachable from any non-terminal state
        (Pending | Assigned | InProgress, Cancelled) => true,
        _ => false,
    }
}

/// Either a blob (binary payload, e.g. audio/video) or a text reference.
/// At most one of these is set; neither is set for jobs whose payload is
/// carried entirely in `metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InputRef {
    pub input_blob_id: Option<BlobId>,
    pub input_text_id: Option<String>,
}

impl InputRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn blob(id: BlobId) -> Self {
        Self {
            input_blob_id: Some(id),
            input_text_id: None,
        }
    }

    pub fn text(id: impl Into<String>) -> Self {
        Self {
            input_blob_id: None,
            input_text_id: Some(id.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.input_blob_id.is_some() && self.input_text_id.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: AssignmentId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub state: AssignmentState,
    pub assigned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Pending,
    Completed,
    Failed,
    Timeout,
}

/// A job as tracked by the core. Field order roughly mirrors §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: JobKind,
    pub priority: Priority,
    pub state: JobState,

    pub min_workers: u32,
    pub max_workers: u32,
    pub desired_workers: u32,

    pub assigned_workers: Vec<WorkerId>,
    pub responses: Vec<Response>,
    pub load_decremented: bool,

    pub input: InputRef,
    pub best_response: Option<ResponseId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub distributed_at: Option<DateTime<Utc>>,
    pub all_responses_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Job {
    /// Check invariants (a)-(d) of §3. Used by tests and by the store as a
    /// cheap sanity check after a mutation; never run on the hot path for
    /// every read.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.assigned_workers.len() as u32 > self.max_workers {
            return Err(format!(
                "job {}: {} assigned workers exceeds max_workers {}",
                self.job_id,
                self.assigned_workers.len(),
                self.max_workers
            ));
        }
        let unique: BTreeSet<_> = self.assigned_workers.iter().collect();
        if unique.len() != self.assigned_workers.len() {
            return Err(format!("job {}: duplicate assigned workers", self.job_id));
        }
        if self.state == JobState::Pending && !self.assigned_workers.is_empty() {
            return Err(format!(
                "job {}: pending job has assigned workers",
                self.job_id
            ));
        }
        if self.state == JobState::Assigned
            && (self.assigned_workers.len() as u32) < self.min_workers
        {
            return Err(format!(
                "job {}: assigned job below min_workers",
                self.job_id
            ));
        }
        if matches!(
            self.state,
            JobState::Completed | JobState::Done | JobState::Approved
        ) && self.responses.is_empty()
        {
            return Err(format!(
                "job {}: terminal completion state with no responses",
                self.job_id
            ));
        }
        let mut seen_workers = BTreeSet::new();
        for response in &self.responses {
            if !self.assigned_workers.contains(&response.worker_id) {
                return Err(format!(
                    "job {}: response from unassigned worker {}",
                    self.job_id, response.worker_id
                ));
            }
            if !seen_workers.insert(response.worker_id) {
                return Err(format!(
                    "job {}: duplicate response from worker {}",
                    self.job_id, response.worker_id
                ));
            }
        }
        if !self.input.is_valid() {
            return Err(format!(
                "job {}: both input_blob_id and input_text_id set",
                self.job_id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_worker_count_scales_with_priority_and_clamps() {
        assert_eq!(
            desired_worker_count(JobKind::Transcription, Priority::Normal, 1, 10),
            2
        );
        assert_eq!(
            desired_worker_count(JobKind::Summarization, Priority::Urgent, 1, 10),
            5 // round(3 * 1.5) = 5 (rounds to nearest, not floor)
        );
        assert_eq!(
            desired_worker_count(JobKind::Summarization, Priority::Urgent, 1, 4),
            4 // clamped to max
        );
        assert_eq!(
            desired_worker_count(JobKind::Transcription, Priority::Low, 2, 10),
            2 // clamped to min (round(2*0.8)=2, already >= min)
        );
    }

    #[test]
    fn legal_transitions_follow_the_state_diagram() {
        use JobState::*;
        assert!(is_legal_transition(Pending, Assigned));
        assert!(is_legal_transition(Pending, Failed));
        assert!(is_legal_transition(Assigned, Completed));
        assert!(is_legal_transition(Completed, Done));
        assert!(is_legal_transition(Done, Approved));
        assert!(is_legal_transition(InProgress, Cancelled));

        assert!(!is_legal_transition(Completed, Failed));
        assert!(!is_legal_transition(Failed, Pending));
        assert!(!is_legal_transition(Cancelled, Assigned));
        assert!(!is_legal_transition(Pending, Pending));
        assert!(!is_legal_transition(Approved, Pending));
    }

    #[test]
    fn input_ref_rejects_both_set() {
        let mixed = InputRef {
            input_blob_id: Some(BlobId::new()),
            input_text_id: Some("abc".to_string()),
        };
        assert!(!mixed.is_valid());
        assert!(InputRef::none().is_valid());
        assert!(InputRef::blob(BlobId::new()).is_valid());
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("not_a_kind"), None);
    }
}
