//! In-memory store, with fault injection for exercising retries.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    ops::Bound,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    cadence_common::JobId,
    chrono::{DateTime, Utc},
};

use crate::{
    Error, Result,
    error::StoreErrorKind,
    ownership::Ownership,
    store::JobStore,
    types::{DocVersion, JobDocument, JobPage, LockModel, ScheduledJob},
};

const PRIMARY_TERM: u64 = 1;

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobId, JobDocument>,
    locks: HashMap<JobId, (LockModel, DocVersion)>,
    seq_no: u64,
}

impl State {
    fn next_version(&mut self) -> DocVersion {
        self.seq_no += 1;
        DocVersion::new(PRIMARY_TERM, self.seq_no)
    }
}

/// Store backed by in-process maps. No persistence.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    query_faults: Mutex<VecDeque<StoreErrorKind>>,
    lock_faults: Mutex<VecDeque<StoreErrorKind>>,
    query_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` job queries fail with `kind`.
    pub fn fail_queries(&self, count: usize, kind: StoreErrorKind) {
        let mut faults = self.query_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.extend(std::iter::repeat_n(kind, count));
    }

    /// Make the next `count` lock reads or writes fail with `kind`.
    pub fn fail_lock_calls(&self, count: usize, kind: StoreErrorKind) {
        let mut faults = self.lock_faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.extend(std::iter::repeat_n(kind, count));
    }

    /// Number of job queries attempted so far, failed ones included.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Store a raw document as-is, for documents the scheduler cannot parse.
    pub fn put_raw(&self, id: &str, last_update_time: DateTime<Utc>, source: serde_json::Value) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let version = state.next_version();
        state.jobs.insert(id.to_string(), JobDocument {
            id: id.to_string(),
            version,
            last_update_time,
            source: Some(source),
        });
    }

    fn take_fault(faults: &Mutex<VecDeque<StoreErrorKind>>, what: &str) -> Result<()> {
        let mut faults = faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.pop_front() {
            Some(kind) => Err(Error::store(kind, format!("injected {what} failure"))),
            None => Ok(()),
        }
    }

    fn query(
        &self,
        after: Option<&str>,
        size: usize,
        filter: impl Fn(&JobDocument) -> bool,
    ) -> Result<JobPage> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Self::take_fault(&self.query_faults, "query")?;
        if size == 0 {
            return Err(Error::store(StoreErrorKind::Invalid, "page size must be > 0"));
        }

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut matching = state
            .jobs
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, doc)| doc)
            .filter(|doc| filter(doc));
        let documents: Vec<JobDocument> = matching
            .by_ref()
            .take(size)
            .cloned()
            .collect();
        let has_more = matching.next().is_some();
        Ok(JobPage {
            documents,
            has_more,
        })
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn fetch_changed_jobs(
        &self,
        since: DateTime<Utc>,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage> {
        self.query(after, size, |doc| {
            doc.last_update_time >= since && ownership.owns(&doc.id)
        })
    }

    async fn fetch_all_owned_jobs(
        &self,
        ownership: &dyn Ownership,
        after: Option<&str>,
        size: usize,
    ) -> Result<JobPage> {
        self.query(after, size, |doc| {
            !doc.is_tombstone() && ownership.owns(&doc.id)
        })
    }

    async fn read_lock(&self, job_id: &str) -> Result<Option<(LockModel, DocVersion)>> {
        Self::take_fault(&self.lock_faults, "lock read")?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.locks.get(job_id).cloned())
    }

    async fn cas_write_lock(
        &self,
        job_id: &str,
        lock: &LockModel,
        expected: Option<DocVersion>,
    ) -> Result<Option<DocVersion>> {
        Self::take_fault(&self.lock_faults, "lock write")?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = state.locks.get(job_id).map(|(_, version)| *version);
        if current != expected {
            return Ok(None);
        }
        let version = state.next_version();
        state
            .locks
            .insert(job_id.to_string(), (lock.clone(), version));
        Ok(Some(version))
    }

    async fn put_job(&self, job: &ScheduledJob) -> Result<DocVersion> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let version = state.next_version();
        let mut doc = JobDocument::from_job(job)?;
        doc.version = version;
        state.jobs.insert(job.id.clone(), doc);
        Ok(version)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.jobs.get(job_id).is_none_or(JobDocument::is_tombstone) {
            return Ok(false);
        }
        let version = state.next_version();
        state.jobs.insert(job_id.to_string(), JobDocument {
            id: job_id.to_string(),
            version,
            last_update_time: Utc::now(),
            source: None,
        });
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
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn job(id: &str, updated: DateTime<Utc>) -> ScheduledJob {
        let mut job = ScheduledJob::new(
            id,
            id,
            Schedule::interval(1, IntervalUnit::Minutes).unwrap(),
            t0(),
        );
        job.last_update_time = updated;
        job
    }

    #[tokio::test]
    async fn pages_are_disjoint_and_ordered() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.put_job(&job(&format!("j{i}"), t0())).await.unwrap();
        }

        let first = store.fetch_all_owned_jobs(&OwnAll, None, 2).await.unwrap();
        let ids: Vec<_> = first.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["j0", "j1"]);
        assert!(first.has_more);

        let last = store
            .fetch_all_owned_jobs(&OwnAll, Some("j3"), 2)
            .await
            .unwrap();
        let ids: Vec<_> = last.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["j4"]);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn delete_between_pages_does_not_shift_later_jobs() {
        let store = InMemoryStore::new();
        for id in ["a", "b", "c"] {
            store.put_job(&job(id, t0())).await.unwrap();
        }

        let first = store.fetch_all_owned_jobs(&OwnAll, None, 2).await.unwrap();
        assert!(first.has_more);
        store.delete_job("a").await.unwrap();

        let cursor = first.documents.last().map(|d| d.id.as_str());
        let second = store.fetch_all_owned_jobs(&OwnAll, cursor, 2).await.unwrap();
        let ids: Vec<_> = second.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c"]);
    }

    #[tokio::test]
    async fn changed_jobs_respect_checkpoint_and_ownership() {
        let store = InMemoryStore::new();
        store.put_job(&job("old", t0())).await.unwrap();
        store
            .put_job(&job("new", t0() + TimeDelta::minutes(5)))
            .await
            .unwrap();
        store
            .put_job(&job("foreign", t0() + TimeDelta::minutes(5)))
            .await
            .unwrap();

        let owned = ExplicitOwnership::new(["old", "new"]);
        let page = store
            .fetch_changed_jobs(t0() + TimeDelta::minutes(1), &owned, None, 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["new"]);
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let store = InMemoryStore::new();
        store.put_job(&job("j", t0())).await.unwrap();
        assert!(store.delete_job("j").await.unwrap());
        assert!(!store.delete_job("j").await.unwrap());

        let all = store.fetch_all_owned_jobs(&OwnAll, None, 10).await.unwrap();
        assert!(all.documents.is_empty());
        let changed = store.fetch_changed_jobs(t0(), &OwnAll, None, 10).await.unwrap();
        assert!(changed.documents[0].is_tombstone());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = InMemoryStore::new();
        store.fail_queries(2, StoreErrorKind::Unavailable);
        assert!(store.fetch_all_owned_jobs(&OwnAll, None, 10).await.is_err());
        assert!(store.fetch_all_owned_jobs(&OwnAll, None, 10).await.is_err());
        assert!(store.fetch_all_owned_jobs(&OwnAll, None, 10).await.is_ok());
        assert_eq!(store.query_calls(), 3);
    }

    #[tokio::test]
    async fn lock_cas_detects_conflicts() {
        let store = InMemoryStore::new();
        let lock = LockModel {
            job_id: "j".into(),
            owner: NodeId::from("n1"),
            lock_time: t0(),
            running: true,
            last_period_end: None,
            last_outcome: None,
        };
        let v1 = store.cas_write_lock("j", &lock, None).await.unwrap().unwrap();
        assert!(store.cas_write_lock("j", &lock, None).await.unwrap().is_none());
        let v2 = store
            .cas_write_lock("j", &lock, Some(v1))
            .await
            .unwrap()
            .unwrap();
        assert!(v2 > v1);
        assert!(store.cas_write_lock("j", &lock, Some(v1)).await.unwrap().is_none());
        assert_eq!(store.read_lock("j").await.unwrap().unwrap().1, v2);
    }
}
