//! Per-job ownership locks backed by compare-and-swap lock documents.

use std::{future::Future, sync::Arc};

use {
    cadence_common::NodeId,
    cadence_config::SettingsHandle,
    chrono::{DateTime, TimeDelta, Utc},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use cadence_metrics::{counter, lock as lock_metrics};

use crate::{
    Error, Result,
    error::StoreErrorKind,
    store::JobStore,
    types::{Lock, LockModel, RunOutcome},
};

/// Prevents two nodes from running the same job at the same time.
pub struct LockService {
    store: Arc<dyn JobStore>,
    node: NodeId,
    settings: SettingsHandle,
}

impl LockService {
    pub fn new(store: Arc<dyn JobStore>, node: NodeId, settings: SettingsHandle) -> Self {
        Self {
            store,
            node,
            settings,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Try to take the lock for `job_id` at the current time.
    pub async fn acquire(&self, job_id: &str) -> Result<Option<Lock>> {
        self.acquire_at(job_id, Utc::now()).await
    }

    /// Try to take the lock for `job_id` as of `now`.
    ///
    /// Returns `None` when another run holds a live lock or a concurrent
    /// writer won the compare-and-swap.
    pub async fn acquire_at(&self, job_id: &str, now: DateTime<Utc>) -> Result<Option<Lock>> {
        let current = self.bounded(self.store.read_lock(job_id)).await?;

        let (previous, expected) = match current {
            Some((model, version)) => {
                if model.running && self.is_live(&model, now) {
                    debug!(job_id, owner = %model.owner, "lock held by a live run");
                    self.record_contended();
                    return Ok(None);
                }
                (Some(model), Some(version))
            },
            None => (None, None),
        };

        let model = LockModel {
            job_id: job_id.to_string(),
            owner: self.node.clone(),
            lock_time: now,
            running: true,
            last_period_end: previous.as_ref().and_then(|p| p.last_period_end),
            last_outcome: previous.and_then(|p| p.last_outcome),
        };

        match self
            .bounded(self.store.cas_write_lock(job_id, &model, expected))
            .await?
        {
            Some(version) => {
                #[cfg(feature = "metrics")]
                counter!(lock_metrics::ACQUIRED_TOTAL).increment(1);
                debug!(job_id, %version, "lock acquired");
                Ok(Some(Lock { model, version }))
            },
            None => {
                debug!(job_id, "lost lock race");
                self.record_contended();
                Ok(None)
            },
        }
    }

    /// Mark the run finished and record its outcome. Returns `false` if the
    /// lock document changed since it was acquired; that case is not retried.
    pub async fn release(
        &self,
        lock: &Lock,
        outcome: RunOutcome,
        period_end: DateTime<Utc>,
    ) -> Result<bool> {
        let model = LockModel {
            running: false,
            last_period_end: Some(period_end),
            last_outcome: Some(outcome),
            ..lock.model.clone()
        };
        let written = self
            .bounded(
                self.store
                    .cas_write_lock(lock.job_id(), &model, Some(lock.version)),
            )
            .await?;
        if written.is_none() {
            warn!(job_id = %lock.job_id(), version = %lock.version, "lock changed before release");
            #[cfg(feature = "metrics")]
            counter!(lock_metrics::RELEASE_CONFLICTS_TOTAL).increment(1);
        }
        Ok(written.is_some())
    }

    pub async fn get_lock(&self, job_id: &str) -> Result<Option<Lock>> {
        let current = self.bounded(self.store.read_lock(job_id)).await?;
        Ok(current.map(|(model, version)| Lock { model, version }))
    }

    /// A running lock younger than `lock_expiry`, whoever holds it. Overlapping
    /// local fires are stopped by the scheduler's running flag.
    fn is_live(&self, model: &LockModel, now: DateTime<Utc>) -> bool {
        let expiry = TimeDelta::from_std(self.settings.current().lock_expiry)
            .unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(model.lock_time) < expiry
    }

    fn record_contended(&self) {
        #[cfg(feature = "metrics")]
        counter!(lock_metrics::CONTENDED_TOTAL).increment(1);
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.settings.current().request_timeout;
        tokio::time::timeout(timeout, call).await.map_err(|_| {
            Error::store(
                StoreErrorKind::Timeout,
                format!("lock call timed out after {timeout:?}"),
            )
        })?
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store_memory::InMemoryStore,
        chrono::TimeZone,
        std::time::Duration,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn service(store: &Arc<InMemoryStore>, node: &str) -> LockService {
        let settings = SettingsHandle::default();
        settings.modify(|s| s.lock_expiry = Duration::from_secs(60 * 60));
        LockService::new(
            Arc::clone(store) as Arc<dyn JobStore>,
            NodeId::from(node),
            settings,
        )
    }

    #[tokio::test]
    async fn first_acquire_creates_lock() {
        let store = Arc::new(InMemoryStore::new());
        let locks = service(&store, "n1");
        let lock = locks.acquire_at("job", t0()).await.unwrap().unwrap();
        assert!(lock.model.running);
        assert_eq!(lock.model.owner, NodeId::from("n1"));
        assert_eq!(locks.get_lock("job").await.unwrap().unwrap(), lock);
    }

    #[tokio::test]
    async fn running_lock_blocks_other_nodes_until_expiry() {
        let store = Arc::new(InMemoryStore::new());
        let n1 = service(&store, "n1");
        let n2 = service(&store, "n2");
        n1.acquire_at("job", t0()).await.unwrap().unwrap();

        assert!(
            n2.acquire_at("job", t0() + TimeDelta::minutes(30))
                .await
                .unwrap()
                .is_none()
        );
        let taken = n2
            .acquire_at("job", t0() + TimeDelta::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.model.owner, NodeId::from("n2"));
    }

    #[tokio::test]
    async fn restarted_node_reclaims_its_expired_lock() {
        let store = Arc::new(InMemoryStore::new());
        let before_crash = service(&store, "n1");
        before_crash.acquire_at("job", t0()).await.unwrap().unwrap();
        drop(before_crash);

        let restarted = service(&store, "n1");
        assert!(
            restarted
                .acquire_at("job", t0() + TimeDelta::minutes(30))
                .await
                .unwrap()
                .is_none()
        );
        let reclaimed = restarted
            .acquire_at("job", t0() + TimeDelta::days(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.model.owner, NodeId::from("n1"));
        assert_eq!(reclaimed.model.lock_time, t0() + TimeDelta::days(30));
    }

    #[tokio::test]
    async fn release_records_outcome_and_frees_lock() {
        let store = Arc::new(InMemoryStore::new());
        let n1 = service(&store, "n1");
        let n2 = service(&store, "n2");
        let lock = n1.acquire_at("job", t0()).await.unwrap().unwrap();
        let end = t0() + TimeDelta::minutes(5);
        assert!(n1.release(&lock, RunOutcome::Success, end).await.unwrap());

        let stored = n1.get_lock("job").await.unwrap().unwrap();
        assert!(!stored.model.running);
        assert_eq!(stored.model.last_period_end, Some(end));
        assert_eq!(stored.model.last_outcome, Some(RunOutcome::Success));

        let next = n2.acquire_at("job", t0() + TimeDelta::minutes(6)).await.unwrap().unwrap();
        assert_eq!(next.model.last_outcome, Some(RunOutcome::Success));
    }

    #[tokio::test]
    async fn stale_release_is_reported_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        let n1 = service(&store, "n1");
        let n2 = service(&store, "n2");
        let stale = n1.acquire_at("job", t0()).await.unwrap().unwrap();
        n2.acquire_at("job", t0() + TimeDelta::hours(2))
            .await
            .unwrap()
            .unwrap();

        let released = n1
            .release(&stale, RunOutcome::Success, t0() + TimeDelta::minutes(1))
            .await
            .unwrap();
        assert!(!released);
        let current = n1.get_lock("job").await.unwrap().unwrap();
        assert_eq!(current.model.owner, NodeId::from("n2"));
        assert!(current.model.running);
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_lock_calls(1, StoreErrorKind::Unavailable);
        let n1 = service(&store, "n1");
        assert!(n1.acquire_at("job", t0()).await.is_err());
        assert!(n1.acquire_at("job", t0()).await.unwrap().is_some());
    }
}
