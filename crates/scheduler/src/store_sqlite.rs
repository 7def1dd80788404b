//! SQLite-backed job store using sqlx.

use {
    async_trait::async_trait,
    cadence_common::time::from_epoch_ms,
    chrono::{DateTime, Utc},
    sqlx::{Row, Sqlite, SqlitePool, Transaction, sqlite::SqlitePoolOptions},
    tracing::debug,
};

use crate::{
    Error, Result,
    error::StoreErrorKind,
    ownership::Ownership,
    store::JobStore,
    types::{DocVersion, JobDocument, JobPage, LockModel, ScheduledJob},
};

const PRIMARY_TERM: u64 = 1;

/// Job definitions and lock documents in SQLite.
///
/// Ownership is evaluated in process, so each page scans every row matching
/// the time filter.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        crate::run_migrations(&pool).await?;
        debug!(database_url, "job store ready");
        Ok(Self { pool })
    }

    /// Use an existing pool. [`crate::run_migrations`] must have been called.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn next_version(tx: &mut Transaction<'_, Sqlite>) -> Result<DocVersion> {
        let seq_no: i64 =
            sqlx::query_scalar("UPDATE doc_sequence SET seq_no = seq_no + 1 WHERE id = 0 RETURNING seq_no")
                .fetch_one(&mut **tx)
                .await?;
        Ok(DocVersion::new(PRIMARY_TERM, seq_no as u64))
    }

    async fn query_documents(
        &self,
        since: Option<DateTime<Utc>>,
        live_only: bool,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage> {
        if size == 0 {
            return Err(Error::store(StoreErrorKind::Invalid, "page size must be > 0"));
        }
        let since_ms = since.map_or(i64::MIN, |t| t.timestamp_millis());
        let rows = sqlx::query(
            "SELECT id, primary_term, seq_no, last_update_time_ms, source
             FROM scheduled_jobs
             WHERE last_update_time_ms >= ?
               AND (? = 0 OR source IS NOT NULL)
               AND (? IS NULL OR id > ?)
             ORDER BY id",
        )
        .bind(since_ms)
        .bind(i64::from(live_only))
        .bind(after)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;

        let mut owned = rows
            .iter()
            .filter(|row| ownership.owns(row.get::<&str, _>("id")));

        let mut documents = Vec::with_capacity(size.min(rows.len()));
        for row in owned.by_ref().take(size) {
            let source = row
                .get::<Option<String>, _>("source")
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            documents.push(JobDocument {
                id: row.get("id"),
                version: DocVersion::new(
                    row.get::<i64, _>("primary_term") as u64,
                    row.get::<i64, _>("seq_no") as u64,
                ),
                last_update_time: from_epoch_ms(row.get("last_update_time_ms")),
                source,
            });
        }
        let has_more = owned.next().is_some();
        Ok(JobPage {
            documents,
            has_more,
        })
    }

    async fn write_document(
        &self,
        id: &str,
        last_update_time: DateTime<Utc>,
        source: Option<String>,
    ) -> Result<DocVersion> {
        let mut tx = self.pool.begin().await?;
        let version = Self::next_version(&mut tx).await?;
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, primary_term, seq_no, last_update_time_ms, source)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                primary_term = excluded.primary_term,
                seq_no = excluded.seq_no,
                last_update_time_ms = excluded.last_update_time_ms,
                source = excluded.source",
        )
        .bind(id)
        .bind(version.primary_term as i64)
        .bind(version.seq_no as i64)
        .bind(last_update_time.timestamp_millis())
        .bind(source)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(version)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn fetch_changed_jobs(
        &self,
        since: DateTime<Utc>,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage> {
        self.query_documents(Some(since), false, ownership, after, size)
            .await
    }

    async fn fetch_all_owned_jobs(
        &self,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage> {
        self.query_documents(None, true, ownership, after, size).await
    }

    async fn read_lock(&self, job_id: &str) -> Result<Option<(LockModel, DocVersion)>> {
        let row = sqlx::query("SELECT primary_term, seq_no, data FROM job_locks WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.get("data");
        let model: LockModel = serde_json::from_str(&data)?;
        let version = DocVersion::new(
            row.get::<i64, _>("primary_term") as u64,
            row.get::<i64, _>("seq_no") as u64,
        );
        Ok(Some((model, version)))
    }

    async fn cas_write_lock(
        &self,
        job_id: &str,
        lock: &LockModel,
        expected: Option<DocVersion>,
    ) -> Result<Option<DocVersion>> {
        let data = serde_json::to_string(lock)?;
        let mut tx = self.pool.begin().await?;
        // Write before any read: a concurrent writer then makes SQLite wait on
        // the busy timeout instead of failing a read-to-write upgrade. The
        // version check lives in the write itself.
        let version = Self::next_version(&mut tx).await?;

        let written = match expected {
            None => sqlx::query(
                "INSERT INTO job_locks (job_id, primary_term, seq_no, data) VALUES (?, ?, ?, ?)
                 ON CONFLICT(job_id) DO NOTHING",
            )
            .bind(job_id)
            .bind(version.primary_term as i64)
            .bind(version.seq_no as i64)
            .bind(&data)
            .execute(&mut *tx)
            .await?,
            Some(expected) => sqlx::query(
                "UPDATE job_locks SET primary_term = ?, seq_no = ?, data = ?
                 WHERE job_id = ? AND primary_term = ? AND seq_no = ?",
            )
            .bind(version.primary_term as i64)
            .bind(version.seq_no as i64)
            .bind(&data)
            .bind(job_id)
            .bind(expected.primary_term as i64)
            .bind(expected.seq_no as i64)
            .execute(&mut *tx)
            .await?,
        };

        if written.rows_affected() == 0 {
            debug!(job_id, ?expected, "lock version conflict");
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(version))
    }

    async fn put_job(&self, job: &ScheduledJob) -> Result<DocVersion> {
        let source = serde_json::to_string(job)?;
        self.write_document(&job.id, job.last_update_time, Some(source))
            .await
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM scheduled_jobs WHERE id = ? AND source IS NOT NULL",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_none() {
            return Ok(false);
        }
        self.write_document(job_id, Utc::now(), None).await?;
        Ok(true)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ownership::{ExplicitOwnership, OwnAll},
            schedule::{IntervalUnit, Schedule},
        },
        cadence_common::NodeId,
        chrono::{TimeDelta, TimeZone},
        std::sync::Arc,
    };

    async fn make_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn job(id: &str, updated: DateTime<Utc>) -> ScheduledJob {
        let mut job = ScheduledJob::new(
            id,
            format!("job {id}"),
            Schedule::interval(10, IntervalUnit::Minutes).unwrap(),
            t0(),
        );
        job.last_update_time = updated;
        job
    }

    fn lock(owner: &str) -> LockModel {
        LockModel {
            job_id: "j".into(),
            owner: NodeId::from(owner),
            lock_time: t0(),
            running: true,
            last_period_end: None,
            last_outcome: None,
        }
    }

    #[tokio::test]
    async fn put_and_page_jobs() {
        let store = make_store().await;
        for id in ["c", "a", "b"] {
            store.put_job(&job(id, t0())).await.unwrap();
        }

        let first = store.fetch_all_owned_jobs(&OwnAll, None, 2).await.unwrap();
        let ids: Vec<_> = first.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(first.has_more);

        let second = store
            .fetch_all_owned_jobs(&OwnAll, Some("b"), 2)
            .await
            .unwrap();
        assert_eq!(second.documents.len(), 1);
        assert!(!second.has_more);

        let parsed = ScheduledJob::from_document(&second.documents[0])
            .unwrap()
            .unwrap();
        assert_eq!(parsed.name, "job c");
        assert_eq!(parsed.last_update_time, t0());
    }

    #[tokio::test]
    async fn versions_increase_on_every_write() {
        let store = make_store().await;
        let v1 = store.put_job(&job("a", t0())).await.unwrap();
        let v2 = store.put_job(&job("a", t0())).await.unwrap();
        assert!(v2 > v1);

        let page = store.fetch_all_owned_jobs(&OwnAll, None, 10).await.unwrap();
        assert_eq!(page.documents.len(), 1);
        assert_eq!(page.documents[0].version, v2);
    }

    #[tokio::test]
    async fn changed_jobs_filter_by_time_and_ownership() {
        let store = make_store().await;
        store.put_job(&job("old", t0())).await.unwrap();
        store
            .put_job(&job("new", t0() + TimeDelta::hours(1)))
            .await
            .unwrap();
        store
            .put_job(&job("other", t0() + TimeDelta::hours(1)))
            .await
            .unwrap();

        let owned = ExplicitOwnership::new(["old", "new"]);
        let page = store
            .fetch_changed_jobs(t0() + TimeDelta::minutes(30), &owned, None, 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["new"]);
    }

    #[tokio::test]
    async fn delete_writes_tombstone() {
        let store = make_store().await;
        store.put_job(&job("a", t0())).await.unwrap();
        assert!(store.delete_job("a").await.unwrap());
        assert!(!store.delete_job("a").await.unwrap());
        assert!(!store.delete_job("missing").await.unwrap());

        let live = store.fetch_all_owned_jobs(&OwnAll, None, 10).await.unwrap();
        assert!(live.documents.is_empty());
        let changed = store.fetch_changed_jobs(t0(), &OwnAll, None, 10).await.unwrap();
        assert_eq!(changed.documents.len(), 1);
        assert!(changed.documents[0].is_tombstone());
    }

    #[tokio::test]
    async fn lock_cas() {
        let store = make_store().await;
        assert!(store.read_lock("j").await.unwrap().is_none());

        let v1 = store
            .cas_write_lock("j", &lock("n1"), None)
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .cas_write_lock("j", &lock("n2"), None)
                .await
                .unwrap()
                .is_none()
        );

        let v2 = store
            .cas_write_lock("j", &lock("n2"), Some(v1))
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .cas_write_lock("j", &lock("n3"), Some(v1))
                .await
                .unwrap()
                .is_none()
        );

        let (model, version) = store.read_lock("j").await.unwrap().unwrap();
        assert_eq!(model.owner, NodeId::from("n2"));
        assert_eq!(version, v2);
    }

    #[tokio::test]
    async fn persists_across_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());

        let store = SqliteStore::new(&url).await.unwrap();
        store.put_job(&job("a", t0())).await.unwrap();
        drop(store);

        let reopened = SqliteStore::new(&url).await.unwrap();
        let page = reopened.fetch_all_owned_jobs(&OwnAll, None, 10).await.unwrap();
        assert_eq!(page.documents.len(), 1);
    }

    #[tokio::test]
    async fn paging_by_key_survives_deletes_between_pages() {
        let store = make_store().await;
        for id in ["a", "b", "c"] {
            store.put_job(&job(id, t0())).await.unwrap();
        }

        let first = store.fetch_all_owned_jobs(&OwnAll, None, 2).await.unwrap();
        store.delete_job("a").await.unwrap();
        let cursor = first.documents.last().map(|d| d.id.as_str());
        let second = store.fetch_all_owned_jobs(&OwnAll, cursor, 2).await.unwrap();

        let ids: Vec<_> = second.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c"]);
        assert!(!second.has_more);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_lock_writers_get_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("locks.db").display());
        let store = Arc::new(SqliteStore::new(&url).await.unwrap());
        let v1 = store
            .cas_write_lock("j", &lock("n0"), None)
            .await
            .unwrap()
            .unwrap();

        let handles: Vec<_> = (1..=4)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .cas_write_lock("j", &lock(&format!("n{i}")), Some(v1))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
