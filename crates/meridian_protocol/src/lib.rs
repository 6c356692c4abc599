//! Protocol payload types shared across the dispatch core.
//!
//! These are the entities described by the data model: jobs, assignments,
//! responses, workers, and blob metadata, plus the scoring formulas and
//! configuration defaults that sit on top of them. None of this crate talks
//! to a store — it is pure data and pure functions, kept separate so the
//! scoring/eligibility math can be unit tested without a database.

pub mod config;
pub mod job;
pub mod response;
pub mod worker;

pub use config::DispatchConfig;
pub use job::{Job, JobKind, JobState, Priority};
pub use response::{score as response_score, Response};
pub use worker::{availability_score, BlobMetadata, Worker};

pub use meridian_ids::{AssignmentId, BlobId, JobId, ResponseId, ValidatorId, WorkerId};
