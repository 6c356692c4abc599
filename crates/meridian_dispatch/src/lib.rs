//! Meridian Dispatch: the task dispatch and orchestration core of a
//! decentralized inference marketplace (SPEC_FULL §1-2).
//!
//! This crate is the dispatch/coordination plane only: it decides which
//! jobs go to which workers, tracks lifecycles under partial failure,
//! aggregates redundant responses, enforces per-worker capacity, and ages
//! stale work out of the system. HTTP transport, auth, object-storage
//! bytes, ML inference, validator scoring, and telemetry sinks are all
//! external collaborators reached only through the trait boundaries in
//! `store::traits`.

pub mod aggregator;
pub mod api;
pub mod error;
pub mod orchestrator;
pub mod reaper;
pub mod roster;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use error::{DispatchError, Result};
pub use orchestrator::Dispatcher;
pub use store::Store;

pub use meridian_protocol::{DispatchConfig, Job, Response, Worker};
