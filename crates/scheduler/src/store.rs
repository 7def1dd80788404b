//! Persistence trait for job definitions and lock documents.

use {async_trait::async_trait, chrono::{DateTime, Utc}};

use crate::{
    Result,
    ownership::Ownership,
    types::{DocVersion, JobPage, LockModel, ScheduledJob},
};

/// Storage backend consumed by the sweeper and the lock service.
///
/// Queries are paged by key: results are ordered by job id and a page starts
/// after the last id of the previous one (`after`), so deletes or inserts
/// between pages never shift a live document out of the sweep.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Documents (including tombstones) with `last_update_time >= since`,
    /// restricted to ids the given ownership covers.
    async fn fetch_changed_jobs(
        &self,
        since: DateTime<Utc>,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage>;

    /// Every live (non-deleted) document the given ownership covers.
    async fn fetch_all_owned_jobs(
        &self,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage>;

    async fn read_lock(&self, job_id: &str) -> Result<Option<(LockModel, DocVersion)>>;

    /// Write the lock document if its current version equals `expected`
    /// (`None` meaning the document must not exist yet). Returns the new
    /// version, or `None` on a version conflict.
    async fn cas_write_lock(
        &self,
        job_id: &str,
        lock: &LockModel,
        expected: Option<DocVersion>,
    ) -> Result<Option<DocVersion>>;

    /// Insert or replace a job definition, assigning the next version.
    async fn put_job(&self, job: &ScheduledJob) -> Result<DocVersion>;

    /// Replace a job definition with a tombstone. Returns `false` if the job
    /// did not exist.
    async fn delete_job(&self, job_id: &str) -> Result<bool>;
}
