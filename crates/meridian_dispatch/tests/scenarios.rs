//! End-to-end scenario tests (SPEC_FULL §8 "Concrete scenarios"), driving
//! the full pipeline — store, roster, scheduler, aggregator, reaper —
//! together rather than any one component in isolation. Mirrors the
//! teacher's `casparian_sentinel/tests/integration.rs` placement: a
//! crate-level `tests/` directory alongside the colocated unit tests.

use chrono::Utc;

use meridian_dispatch::store::{JobStore, Store, WorkerSnapshot, WorkerStore};
use meridian_ids::WorkerId;
use meridian_protocol::job::{InputRef, JobKind, JobState, Priority};
use meridian_protocol::worker::Specialization;
use meridian_protocol::{DispatchConfig, Response};

async fn seed_worker(store: &Store, id: u64, capacity: u32) {
    WorkerStore::upsert_worker_report(
        store,
        "validator-1",
        WorkerSnapshot {
            worker_id: WorkerId::from(id),
            identity_key: format!("key-{id}"),
            is_serving: true,
            stake: 500.0,
            performance_score: 0.9,
            load: 0.0,
            max_capacity: capacity,
            specialization: Specialization::new(),
        },
        Utc::now(),
    )
    .await
    .unwrap();
}

fn response(worker_id: WorkerId, accuracy: f64, speed: f64, time: f64) -> Response {
    Response {
        response_id: meridian_ids::ResponseId::new(),
        worker_id,
        submitted_at: Utc::now(),
        processing_time_s: time,
        accuracy_score: Some(accuracy),
        speed_score: Some(speed),
        output: serde_json::json!({"text": "transcript"}),
        output_blob_id: None,
        error: None,
    }
}

/// Scenario 1: happy path, replication 3.
#[tokio::test]
async fn happy_path_replication_three_picks_best_response() {
    let store = Store::connect_in_memory().await.unwrap();
    for id in 1..=3u64 {
        seed_worker(&store, id, 1).await;
    }
    let job_store: std::sync::Arc<dyn JobStore> = std::sync::Arc::new(store.clone());
    let worker_store: std::sync::Arc<dyn WorkerStore> = std::sync::Arc::new(store.clone());
    let roster = meridian_dispatch::roster::Roster::new(worker_store);
    let scheduler = meridian_dispatch::scheduler::Scheduler::new(job_store.clone(), roster);
    let aggregator = meridian_dispatch::aggregator::Aggregator::new(job_store.clone(), 3, chrono::Duration::seconds(60));

    let job_id = job_store
        .create_job(
            JobKind::Transcription,
            Priority::Normal,
            InputRef::none(),
            1,
            3,
            3,
            serde_json::Map::new(),
        )
        .await
        .unwrap();

    let config = DispatchConfig::default();
    scheduler.run_pass(&config).await.unwrap();

    let job = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Assigned);
    assert_eq!(job.assigned_workers.len(), 3);
    for &worker_id in &job.assigned_workers {
        assert_eq!(WorkerStore::load_of(&store, worker_id).await.unwrap(), 1);
    }

    let w1 = job.assigned_workers[0];
    let w2 = job.assigned_workers[1];
    let w3 = job.assigned_workers[2];

    aggregator.submit(job_id, w1, response(w1, 0.9, 0.8, 2.0)).await.unwrap();
    aggregator.submit(job_id, w2, response(w2, 0.8, 0.9, 1.5)).await.unwrap();
    aggregator.submit(job_id, w3, response(w3, 0.95, 0.7, 2.5)).await.unwrap();

    let job = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.responses.len(), 3);
    let best = job
        .best_response
        .and_then(|id| job.responses.iter().find(|r| r.response_id == id))
        .unwrap();
    assert_eq!(best.worker_id, w3, "w3's 0.875 score beats w1's 0.87 and w2's 0.83");

    for &worker_id in &job.assigned_workers {
        assert_eq!(WorkerStore::load_of(&store, worker_id).await.unwrap(), 0);
    }
}

/// Scenario 2: duplicate response from the same worker is a no-op.
#[tokio::test]
async fn duplicate_response_leaves_state_unchanged() {
    let store = Store::connect_in_memory().await.unwrap();
    let job_store: std::sync::Arc<dyn JobStore> = std::sync::Arc::new(store.clone());
    let job_id = job_store
        .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
        .await
        .unwrap();
    let w1 = WorkerId::from(1);
    job_store.assign_workers(job_id, &[w1], 1, 3).await.unwrap();

    let aggregator = meridian_dispatch::aggregator::Aggregator::new(job_store.clone(), 1, chrono::Duration::seconds(60));
    let first = aggregator.submit(job_id, w1, response(w1, 0.9, 0.9, 1.0)).await.unwrap();
    assert_eq!(first, meridian_dispatch::store::RecordResponseOutcome::Accepted);

    let job_after_first = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job_after_first.responses.len(), 1);

    let second = aggregator.submit(job_id, w1, response(w1, 0.1, 0.1, 9.0)).await.unwrap();
    assert_eq!(second, meridian_dispatch::store::RecordResponseOutcome::Duplicate);

    let job_after_second = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job_after_second.responses.len(), 1);
    assert_eq!(job_after_second, job_after_first, "duplicate must not mutate the job");
}

/// Scenario 3: partial-response timeout force-completes an `assigned` job
/// with at least one response after the grace period.
#[tokio::test]
async fn stale_assigned_job_with_partial_responses_force_completes() {
    let store = Store::connect_in_memory().await.unwrap();
    let job_store: std::sync::Arc<dyn JobStore> = std::sync::Arc::new(store.clone());
    let worker_store: std::sync::Arc<dyn WorkerStore> = std::sync::Arc::new(store.clone());
    let roster = meridian_dispatch::roster::Roster::new(worker_store);
    let reaper = meridian_dispatch::reaper::Reaper::new(job_store.clone(), roster);

    for id in 1..=3u64 {
        seed_worker(&store, id, 1).await;
    }
    let job_id = job_store
        .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
        .await
        .unwrap();
    let workers: Vec<WorkerId> = (1..=3u64).map(WorkerId::from).collect();
    job_store.assign_workers(job_id, &workers, 1, 3).await.unwrap();
    job_store.record_response(job_id, workers[0], response(workers[0], 0.7, 0.6, 3.0)).await.unwrap();

    // Backdate created_at past the grace window; the reaper has no other
    // way to observe staleness than wall-clock age of the row.
    let cutoff = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE jobs SET created_at = ?1 WHERE job_id = ?2")
        .bind(cutoff)
        .bind(job_id.to_string())
        .execute(store.pool())
        .await
        .unwrap();

    let config = DispatchConfig::default();
    let summary = reaper.sweep_stale_jobs(&config).await.unwrap();
    assert_eq!(summary.partial_completed, 1);
    assert_eq!(summary.never_assigned_failed, 0);

    let job = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.responses.len(), 1);
    assert_eq!(job.best_response, Some(job.responses[0].response_id));
    assert_eq!(
        job.metadata.get("completion_reason").and_then(|v| v.as_str()),
        Some("timeout cleanup (1 response(s) after 1+ hour)")
    );
    assert_eq!(job.metadata.get("actual_response_count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(job.metadata.get("expected_response_count").and_then(|v| v.as_u64()), Some(3));

    for &worker_id in &workers {
        assert_eq!(WorkerStore::load_of(&store, worker_id).await.unwrap(), 0, "reaper must decrement load for every assigned worker");
    }
}

/// Scenario 4: a job that never gets assigned a worker fails after the
/// grace period with a `failure_reason` annotation.
#[tokio::test]
async fn never_assigned_job_fails_after_grace_period() {
    let store = Store::connect_in_memory().await.unwrap();
    let job_store: std::sync::Arc<dyn JobStore> = std::sync::Arc::new(store.clone());
    let worker_store: std::sync::Arc<dyn WorkerStore> = std::sync::Arc::new(store.clone());
    let roster = meridian_dispatch::roster::Roster::new(worker_store);
    let reaper = meridian_dispatch::reaper::Reaper::new(job_store.clone(), roster);

    let job_id = job_store
        .create_job(JobKind::Tts, Priority::Normal, InputRef::none(), 1, 3, 3, serde_json::Map::new())
        .await
        .unwrap();

    let cutoff = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE jobs SET created_at = ?1 WHERE job_id = ?2")
        .bind(cutoff)
        .bind(job_id.to_string())
        .execute(store.pool())
        .await
        .unwrap();

    let config = DispatchConfig::default();
    let summary = reaper.sweep_stale_jobs(&config).await.unwrap();
    assert_eq!(summary.never_assigned_failed, 1);

    let job = job_store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.metadata.get("failure_reason").and_then(|v| v.as_str()),
        Some("task never assigned to miners after 1+ hour")
    );
    assert!(job.metadata.get("failure_timestamp").is_some());
}

/// Scenario 5: a worker id is reused by a different identity key; the
/// roster must treat it as a new entity, not merge prior metrics in.
#[tokio::test]
async fn worker_id_reuse_with_different_identity_replaces_rather_than_merges() {
    let store = Store::connect_in_memory().await.unwrap();

    WorkerStore::upsert_worker_report(
        &store,
        "validator-1",
        WorkerSnapshot {
            worker_id: WorkerId::from(7),
            identity_key: "K1".to_string(),
            is_serving: true,
            stake: 900.0,
            performance_score: 0.95,
            load: 0.0,
            max_capacity: 10,
            specialization: Specialization::new(),
        },
        Utc::now(),
    )
    .await
    .unwrap();
    WorkerStore::inc_load(&store, WorkerId::from(7)).await.unwrap();
    WorkerStore::inc_load(&store, WorkerId::from(7)).await.unwrap();

    // A later report reuses worker_id 7 under a different identity key.
    WorkerStore::upsert_worker_report(
        &store,
        "validator-2",
        WorkerSnapshot {
            worker_id: WorkerId::from(7),
            identity_key: "K2".to_string(),
            is_serving: true,
            stake: 10.0,
            performance_score: 0.1,
            load: 0.0,
            max_capacity: 5,
            specialization: Specialization::new(),
        },
        Utc::now(),
    )
    .await
    .unwrap();

    let worker = WorkerStore::get_worker(&store, WorkerId::from(7)).await.unwrap().unwrap();
    assert_eq!(worker.identity_key, "K2");
    // K1's prior stake/performance/load history must not bleed into K2's row.
    assert_eq!(worker.stake, 10.0);
    assert_eq!(worker.performance_score, 0.1);
    assert_eq!(worker.load, 0);
    assert_eq!(worker.max_capacity, 5);
}

/// Scenario 6: two scheduler passes race for the same single-capacity
/// worker across two jobs; the loser's batch is silently shortened.
#[tokio::test]
async fn concurrent_assignment_passes_never_oversubscribe_a_worker() {
    let store = Store::connect_in_memory().await.unwrap();
    seed_worker(&store, 1, 1).await;
    let job_store: std::sync::Arc<dyn JobStore> = std::sync::Arc::new(store.clone());
    let worker_store: std::sync::Arc<dyn WorkerStore> = std::sync::Arc::new(store.clone());
    let roster = meridian_dispatch::roster::Roster::new(worker_store);
    let scheduler = meridian_dispatch::scheduler::Scheduler::new(job_store.clone(), roster);

    let job_a = job_store
        .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 1, 1, serde_json::Map::new())
        .await
        .unwrap();
    let job_b = job_store
        .create_job(JobKind::Transcription, Priority::Normal, InputRef::none(), 1, 1, 1, serde_json::Map::new())
        .await
        .unwrap();

    let config = DispatchConfig::default();
    let summary = scheduler.run_pass(&config).await.unwrap();
    assert_eq!(summary.assignments_committed, 1);

    let a = job_store.get_job(job_a).await.unwrap().unwrap();
    let b = job_store.get_job(job_b).await.unwrap().unwrap();
    assert_eq!(a.assigned_workers.len() + b.assigned_workers.len(), 1);
    assert_eq!(WorkerStore::load_of(&store, WorkerId::from(1)).await.unwrap(), 1);
}
