//! SQLite-backed implementation of the `JobStore`/`WorkerStore`/`BlobStore`
//! capability set (C4, C3, C2). The core never branches on which database
//! backend it talks to — a Postgres-backed `Store` would implement the same
//! three traits from `traits` and be a drop-in replacement everywhere a
//! `Dispatcher` is constructed.

mod blobs;
mod jobs;
mod models;
mod workers;

pub mod traits;

pub use traits::{AssignOutcome, BlobStore, JobStore, RecordResponseOutcome, WorkerSnapshot, WorkerStore};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::error::Result;

/// A connection pool plus the schema it owns. One `Store` backs all three
/// capability traits, since `assign_workers` needs to read worker capacity
/// in the same process as it writes the job row (§4.3).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests: a fresh, private SQLite database per call.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                priority TEXT NOT NULL,
                state TEXT NOT NULL,
                min_workers INTEGER NOT NULL,
                max_workers INTEGER NOT NULL,
                desired_workers INTEGER NOT NULL,
                assigned_workers TEXT NOT NULL,
                load_decremented INTEGER NOT NULL DEFAULT 0,
                input_blob_id TEXT,
                input_text_id TEXT,
                best_response TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                distributed_at TEXT,
                all_responses_at TEXT,
                completed_at TEXT,
                metadata TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                response_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                worker_id INTEGER NOT NULL,
                submitted_at TEXT NOT NULL,
                processing_time_s REAL NOT NULL,
                accuracy_score REAL,
                speed_score REAL,
                output TEXT NOT NULL,
                output_blob_id TEXT,
                error TEXT,
                UNIQUE(job_id, worker_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_responses_job ON responses(job_id)")
            .execute(&self.pool)
            .await?;

        // Append-only assignment history, kept mainly for the audit trail
        // and `list_jobs_assigned_to`; `jobs.assigned_workers` is the
        // source of truth the scheduler and aggregator read from.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assignments (
                assignment_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                worker_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                assigned_at TEXT NOT NULL,
                completed_at TEXT,
                UNIQUE(job_id, worker_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_assignments_worker ON assignments(worker_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id INTEGER PRIMARY KEY,
                identity_key TEXT NOT NULL,
                is_serving INTEGER NOT NULL,
                stake REAL NOT NULL,
                performance_score REAL NOT NULL,
                specialization TEXT NOT NULL,
                max_capacity INTEGER NOT NULL,
                load INTEGER NOT NULL,
                last_seen TEXT NOT NULL,
                reporters TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validators (
                validator_id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                blob_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                public_url TEXT NOT NULL,
                hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
