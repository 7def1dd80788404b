//! Cluster job scheduling core.
//! Schedules cron and interval jobs on the node that owns them, keeps the
//! local registry in sync with the job store, and takes a per-job lock
//! around every run.

pub mod backoff;
pub mod error;
pub mod lock;
pub mod ownership;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod sweeper;
pub mod types;

pub use {
    error::{Error, Result},
    lock::LockService,
    ownership::{
        ExplicitOwnership, OwnAll, Ownership, OwnershipHandle, ShardOwnership,
        ownership_from_config,
    },
    runner::{JobRunner, LoggingRunner},
    schedule::{IntervalUnit, Schedule},
    scheduler::{JobScheduler, ScheduledJobState},
    stats::{JobSchedulerMetrics, JobSweeperMetrics, ScheduleStatus, ScheduledJobsStats},
    store::JobStore,
    sweeper::{JobSweeper, SweepReport, SweeperPhase},
    types::{DocVersion, JobDocument, JobPage, Lock, LockModel, RunOutcome, ScheduledJob},
};

/// Run database migrations for the scheduler crate.
///
/// Creates the `scheduled_jobs`, `job_locks` and `doc_sequence` tables.
/// [`store_sqlite::SqliteStore::new`] calls this itself.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
