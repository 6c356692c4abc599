//! The error taxonomy of §7. Each variant maps to one row of the policy
//! table; callers match on the variant to decide whether to retry, log, or
//! surface the error upward, rather than inspecting error strings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Entity id unknown. Reported to the caller, no retry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request would break a §3 invariant (e.g. illegal state transition).
    /// Reported to the caller and logged.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Response/assignment already recorded. Policy: silently accepted as
    /// a no-op by the caller, never surfaced as a failure.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Store timeout or connection drop. Caller-bounded retry with
    /// exponential backoff; background loops retry on the next tick.
    #[error("transient store error: {0}")]
    Transient(#[from] sqlx::Error),

    /// Worker over capacity at commit time. The assignment for that
    /// worker is dropped; others in the batch proceed.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Corruption or unparseable state. Surfaced with full context; the
    /// orchestrator continues with other jobs.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Fatal(format!("metadata serialization failed: {err}"))
    }
}

impl DispatchError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a background loop should simply log this and move to the
    /// next job/worker rather than abort the whole pass (§5, §7).
    pub fn is_isolated_failure(&self) -> bool {
        !matches!(self, DispatchError::Fatal(_))
    }
}
