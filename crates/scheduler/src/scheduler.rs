//! Per-node in-memory scheduler: job registry, timer loop and run dispatch.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    cadence_common::JobId,
    cadence_config::SchedulerSettings,
    chrono::{DateTime, Utc},
    tokio::{
        sync::{Mutex, Notify, Semaphore},
        task::JoinHandle,
        time::MissedTickBehavior,
    },
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use cadence_metrics::{counter, gauge, histogram, labels, scheduler as scheduler_metrics};

use crate::{
    Result,
    lock::LockService,
    runner::JobRunner,
    stats::JobSchedulerMetrics,
    types::{DocVersion, RunOutcome, ScheduledJob},
};

struct ScheduledJobInfo {
    job: ScheduledJob,
    next_fire: Option<DateTime<Utc>>,
    expected_previous: Option<DateTime<Utc>>,
    actual_previous: Option<DateTime<Utc>>,
    running: Arc<AtomicBool>,
    fires: u64,
    skips: u64,
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJobState {
    pub id: JobId,
    pub version: DocVersion,
    pub next_fire: Option<DateTime<Utc>>,
    pub expected_previous: Option<DateTime<Utc>>,
    pub actual_previous: Option<DateTime<Utc>>,
    pub running: bool,
    pub fires: u64,
    pub skips: u64,
}

impl From<&ScheduledJobInfo> for ScheduledJobState {
    fn from(info: &ScheduledJobInfo) -> Self {
        Self {
            id: info.job.id.clone(),
            version: info.job.version,
            next_fire: info.next_fire,
            expected_previous: info.expected_previous,
            actual_previous: info.actual_previous,
            running: info.running.load(Ordering::SeqCst),
            fires: info.fires,
            skips: info.skips,
        }
    }
}

/// A fire handed from the tick to a run task.
struct Dispatch {
    job: ScheduledJob,
    fire: DateTime<Utc>,
    running: RunningGuard,
}

/// Clears the job's running flag when the run task ends, even on panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn next_fire_for(job: &ScheduledJob, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let anchor = job.enabled_time.unwrap_or(after);
    job.schedule.next_execution_time(anchor, after)
}

/// Owns the set of jobs active on this node and fires each one when due.
pub struct JobScheduler {
    jobs: RwLock<HashMap<JobId, ScheduledJobInfo>>,
    runner: Arc<dyn JobRunner>,
    locks: Arc<LockService>,
    permits: Arc<Semaphore>,
    tick_interval: Duration,
    skipped_ticks: AtomicU64,
    active: AtomicBool,
    wake: Notify,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        locks: Arc<LockService>,
        settings: &SchedulerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            runner,
            locks,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_runs.max(1))),
            tick_interval: settings.tick_interval,
            skipped_ticks: AtomicU64::new(0),
            active: AtomicBool::new(false),
            wake: Notify::new(),
            timer_handle: Mutex::new(None),
        })
    }

    /// Register (or replace) a job. See [`JobScheduler::schedule_at`].
    pub fn schedule(&self, job: ScheduledJob) -> Result<bool> {
        self.schedule_at(job, Utc::now())
    }

    /// Register (or replace) a job, computing its next fire after `now`.
    ///
    /// Disabled jobs are ignored and return `Ok(false)`; malformed ones
    /// return a validation error. Replacing an entry with the same version
    /// and schedule keeps its next fire. The running flag and counters
    /// always survive replacement.
    pub fn schedule_at(&self, job: ScheduledJob, now: DateTime<Utc>) -> Result<bool> {
        if !job.enabled {
            debug!(job_id = %job.id, "not scheduling disabled job");
            return Ok(false);
        }
        job.validate()?;

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = jobs.get_mut(&job.id) {
            let unchanged = existing.job.version == job.version
                && existing.job.schedule == job.schedule
                && existing.job.enabled_time == job.enabled_time;
            if !unchanged {
                existing.next_fire = next_fire_for(&job, now);
                debug!(
                    job_id = %job.id,
                    version = %job.version,
                    next_fire = ?existing.next_fire,
                    "job rescheduled"
                );
            }
            existing.job = job;
            return Ok(true);
        }

        let next_fire = next_fire_for(&job, now);
        if next_fire.is_none() {
            warn!(job_id = %job.id, "job has no upcoming execution time");
        }
        info!(job_id = %job.id, name = %job.name, next_fire = ?next_fire, "job scheduled");
        jobs.insert(job.id.clone(), ScheduledJobInfo {
            job,
            next_fire,
            expected_previous: None,
            actual_previous: None,
            running: Arc::new(AtomicBool::new(false)),
            fires: 0,
            skips: 0,
        });
        #[cfg(feature = "metrics")]
        gauge!(scheduler_metrics::JOBS_SCHEDULED).set(jobs.len() as f64);
        Ok(true)
    }

    /// Schedule several jobs. Returns the ids that were not scheduled, either
    /// because they are disabled or because they failed validation.
    pub fn schedule_all(&self, jobs: impl IntoIterator<Item = ScheduledJob>) -> Vec<JobId> {
        let mut rejected = Vec::new();
        for job in jobs {
            let id = job.id.clone();
            match self.schedule(job) {
                Ok(true) => {},
                Ok(false) => rejected.push(id),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "failed to schedule job");
                    rejected.push(id);
                },
            }
        }
        rejected
    }

    /// Remove a job from the registry. Always succeeds, also for unknown ids.
    /// A run already in flight finishes normally.
    pub fn deschedule(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.remove(job_id).is_some() {
            info!(job_id, "job descheduled");
            #[cfg(feature = "metrics")]
            gauge!(scheduler_metrics::JOBS_SCHEDULED).set(jobs.len() as f64);
        }
        true
    }

    /// Deschedule several jobs. Returns the ids that could not be removed.
    pub fn deschedule_all(&self, job_ids: &[JobId]) -> Vec<JobId> {
        job_ids
            .iter()
            .filter(|id| !self.deschedule(id))
            .cloned()
            .collect()
    }

    pub fn scheduled_jobs(&self) -> BTreeSet<JobId> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.keys().cloned().collect()
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.contains_key(job_id)
    }

    pub fn job_state(&self, job_id: &str) -> Option<ScheduledJobState> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).map(ScheduledJobState::from)
    }

    /// Fires skipped because the job was still running or locked elsewhere.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::SeqCst)
    }

    pub fn job_metrics(&self) -> Vec<JobSchedulerMetrics> {
        self.job_metrics_at(Utc::now())
    }

    pub fn job_metrics_at(&self, now: DateTime<Utc>) -> Vec<JobSchedulerMetrics> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.values()
            .map(|info| JobSchedulerMetrics {
                id: info.job.id.clone(),
                last_execution_time: info.actual_previous,
                running_on_time: info.job.schedule.running_on_time(info.actual_previous, now),
            })
            .collect()
    }

    /// Start the timer loop.
    pub async fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.timer_loop().await;
        });
        *self.timer_handle.lock().await = Some(handle);
        info!(
            tick_ms = self.tick_interval.as_millis(),
            "job scheduler started"
        );
    }

    /// Stop the timer loop. Runs already dispatched keep going.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        if let Some(handle) = self.timer_handle.lock().await.take() {
            handle.abort();
        }
        info!("job scheduler stopped");
    }

    async fn timer_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                () = self.wake.notified() => {},
            }
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            // Run tasks are detached; they report through logs and the lock.
            drop(self.tick(Utc::now()));
        }
    }

    /// Dispatch every job due at `now` and recompute its next fire.
    ///
    /// Never awaits. Returns the handles of the spawned run tasks.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due: Vec<Dispatch> = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let mut due = Vec::new();
            for info in jobs.values_mut() {
                let Some(fire) = info.next_fire.filter(|t| *t <= now) else {
                    continue;
                };
                info.next_fire = next_fire_for(&info.job, now);

                if info.running.swap(true, Ordering::SeqCst) {
                    info.skips += 1;
                    self.skipped_ticks.fetch_add(1, Ordering::SeqCst);
                    debug!(job_id = %info.job.id, %fire, "job still running, skipping fire");
                    #[cfg(feature = "metrics")]
                    counter!(scheduler_metrics::SKIPPED_TICKS_TOTAL).increment(1);
                    continue;
                }
                info.expected_previous = Some(fire);
                info.fires += 1;
                #[cfg(feature = "metrics")]
                histogram!(scheduler_metrics::TICK_LATENCY_SECONDS)
                    .record((now - fire).num_milliseconds() as f64 / 1000.0);
                due.push(Dispatch {
                    job: info.job.clone(),
                    fire,
                    running: RunningGuard(Arc::clone(&info.running)),
                });
            }
            due
        };

        #[cfg(feature = "metrics")]
        counter!(scheduler_metrics::JOBS_DUE_TOTAL).increment(due.len() as u64);

        due.into_iter()
            .map(|dispatch| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.execute(dispatch).await })
            })
            .collect()
    }

    async fn execute(&self, dispatch: Dispatch) {
        let Dispatch {
            job,
            fire,
            running: _running,
        } = dispatch;

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        if !self.is_scheduled(&job.id) {
            debug!(job_id = %job.id, "job descheduled before it ran");
            return;
        }

        let lock = match self.locks.acquire(&job.id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(job_id = %job.id, "lock held elsewhere, skipping fire");
                self.record_skip(&job.id);
                return;
            },
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to acquire job lock");
                self.record_skip(&job.id);
                return;
            },
        };

        let (period_start, period_end) = job.schedule.period_ending_at(fire);
        let started = Utc::now();
        self.update_entry(&job.id, |info| info.actual_previous = Some(started));
        info!(job_id = %job.id, %period_start, %period_end, "executing job");
        #[cfg(feature = "metrics")]
        counter!(scheduler_metrics::EXECUTIONS_TOTAL, labels::JOB_TYPE => job.job_type.clone())
            .increment(1);

        let outcome = match self.runner.run_job(&job, period_start, period_end).await {
            Ok(()) => RunOutcome::Success,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "job run failed");
                #[cfg(feature = "metrics")]
                counter!(scheduler_metrics::RUNNER_ERRORS_TOTAL).increment(1);
                RunOutcome::Failed {
                    error: e.to_string(),
                }
            },
        };

        #[cfg(feature = "metrics")]
        {
            let label = match outcome {
                RunOutcome::Success => "success",
                RunOutcome::Failed { .. } => "failed",
            };
            histogram!(
                scheduler_metrics::EXECUTION_DURATION_SECONDS,
                labels::JOB_TYPE => job.job_type.clone(),
                labels::OUTCOME => label
            )
            .record((Utc::now() - started).num_milliseconds() as f64 / 1000.0);
        }

        if let Err(e) = self.locks.release(&lock, outcome, period_end).await {
            warn!(job_id = %job.id, error = %e, "failed to release job lock");
        }
    }

    fn record_skip(&self, job_id: &str) {
        self.skipped_ticks.fetch_add(1, Ordering::SeqCst);
        self.update_entry(job_id, |info| info.skips += 1);
        #[cfg(feature = "metrics")]
        counter!(scheduler_metrics::SKIPPED_TICKS_TOTAL).increment(1);
    }

    fn update_entry(&self, job_id: &str, update: impl FnOnce(&mut ScheduledJobInfo)) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = jobs.get_mut(job_id) {
            update(info);
        }
    }
}
