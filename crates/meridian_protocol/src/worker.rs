use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use meridian_ids::{BlobId, WorkerId};

use crate::job::JobKind;

/// Empty specialization means "accepts all kinds" (§3 Worker).
pub type Specialization = BTreeSet<JobKind>;

/// A worker as tracked by the roster (C3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: WorkerId,
    pub identity_key: String,
    pub is_serving: bool,
    pub stake: f64,
    pub performance_score: f64,
    pub specialization: Specialization,
    pub max_capacity: u32,
    pub load: u32,
    pub last_seen: DateTime<Utc>,
    /// Validators that have contributed to this worker's current
    /// `performance_score`/`load`, used to weight future merges (§4.2.1).
    pub reporters: BTreeSet<String>,
}

impl Worker {
    pub fn new_minimal(worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            identity_key: String::new(),
            is_serving: false,
            stake: 0.0,
            performance_score: 0.0,
            specialization: Specialization::new(),
            max_capacity: 5,
            load: 0,
            last_seen: now,
            reporters: BTreeSet::new(),
        }
    }

    pub fn accepts(&self, kind: JobKind) -> bool {
        self.specialization.is_empty() || self.specialization.contains(&kind)
    }
}

/// `effective_load = max(counter_load, live_count)` (§GLOSSARY, §9 open
/// question resolution). `live_count` is the number of jobs in active
/// states that still list this worker, queried separately by the roster;
/// this function just applies the `max`.
pub fn effective_load(counter_load: u32, live_count: u32) -> u32 {
    counter_load.max(live_count)
}

/// Eligibility check (§4.2.2), minus the `exclude` set which the caller
/// (the store query) already applies via its own index. `effective_load`
/// is passed in rather than recomputed here because resolving it requires
/// a separate live-job-count query the store performs, not something this
/// pure function can do on its own.
pub fn is_eligible(
    worker: &Worker,
    effective_load: u32,
    kind: JobKind,
    now: DateTime<Utc>,
    worker_timeout: chrono::Duration,
) -> bool {
    if !worker.is_serving {
        return false;
    }
    if now.signed_duration_since(worker.last_seen) >= worker_timeout {
        return false;
    }
    if effective_load >= worker.max_capacity {
        return false;
    }
    worker.accepts(kind)
}

/// `availability_score` (§4.2.2). `effective_load` and `max_capacity` are
/// passed explicitly because the caller has already resolved
/// `effective_load` against the live job count, not just the counter.
pub fn availability_score(
    performance_score: f64,
    effective_load: u32,
    max_capacity: u32,
    stake: f64,
    now: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    worker_timeout: chrono::Duration,
) -> f64 {
    let load_ratio = if max_capacity == 0 {
        1.0
    } else {
        effective_load as f64 / max_capacity as f64
    };
    let staleness = now.signed_duration_since(last_seen).num_milliseconds() as f64
        / worker_timeout.num_milliseconds().max(1) as f64;

    0.4 * performance_score
        + 0.3 * (1.0 - load_ratio)
        + 0.2 * (stake / 1000.0).min(1.0)
        + 0.1 * (1.0 - staleness).max(0.0)
}

/// Merge two reporter-weighted continuous values (§4.2.1): weighted mean
/// by reporter-set size, falling back to a simple mean if both sets are
/// empty.
pub fn weighted_merge(old: f64, old_reporters: usize, new: f64, new_reporters: usize) -> f64 {
    let total = old_reporters + new_reporters;
    if total == 0 {
        return (old + new) / 2.0;
    }
    (old * old_reporters as f64 + new * new_reporters as f64) / total as f64
}

/// Specialization conflict resolution (§4.2.1): the more specific
/// (smaller, non-empty) set wins when one is a superset-compatible
/// refinement of the other; equal specificity keeps the existing set.
/// An empty set means "accepts everything", i.e. the *least* specific
/// set, so a non-empty set always wins over an empty one.
pub fn merge_specialization(existing: &Specialization, incoming: &Specialization) -> Specialization {
    if existing.is_empty() && incoming.is_empty() {
        return Specialization::new();
    }
    if existing.is_empty() {
        return incoming.clone();
    }
    if incoming.is_empty() {
        return existing.clone();
    }
    if incoming.len() < existing.len() && incoming.is_subset(existing) {
        return incoming.clone();
    }
    if existing.len() < incoming.len() && existing.is_subset(incoming) {
        return existing.clone();
    }
    existing.clone()
}

/// Blob descriptor as reported by the (external) object-storage adapter
/// (C2). The core is read-mostly over this: it inserts a row when ingress
/// supplies a new blob and otherwise only reads descriptors by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: BlobId,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub public_url: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}
