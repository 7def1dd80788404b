//! Keeps the local scheduler in line with the job store.
//!
//! Each cycle is either incremental (documents changed since the checkpoint)
//! or a full resync of every owned job. Full resyncs run on start, after an
//! ownership change, after a cycle that ran out of retries and once
//! `full_sweep_period` has passed since the last one.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    cadence_common::{JobId, time::clean_truncate},
    cadence_config::SettingsHandle,
    chrono::{DateTime, TimeDelta, Utc},
    rand::Rng,
    serde::{Deserialize, Serialize},
    tokio::{
        sync::{Mutex, Notify},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use cadence_metrics::{counter, histogram, labels, sweeper as sweeper_metrics};

use crate::{
    Result,
    backoff::BackoffPolicy,
    ownership::OwnershipHandle,
    runner::JobRunner,
    scheduler::JobScheduler,
    stats::JobSweeperMetrics,
    store::JobStore,
    types::{DocVersion, JobDocument, ScheduledJob},
};

/// Longest prefix of an unparseable document included in the warning.
const MAX_LOGGED_SOURCE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweeperPhase {
    Stopped,
    InitialFullSweep,
    SteadyState,
    FullSweep,
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub full: bool,
    pub pages: usize,
    pub scheduled: usize,
    pub descheduled: usize,
    pub stale: usize,
    pub parse_failures: usize,
}

struct SweepContext {
    phase: SweeperPhase,
    disabled: bool,
    checkpoint: Option<DateTime<Utc>>,
    last_full_sweep: Option<DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
    needs_full_sweep: bool,
    consecutive_failures: u32,
    ownership_generation: u64,
    /// Highest document version applied per job.
    swept: HashMap<JobId, DocVersion>,
}

impl SweepContext {
    fn new() -> Self {
        Self {
            phase: SweeperPhase::Stopped,
            disabled: false,
            checkpoint: None,
            last_full_sweep: None,
            last_sweep: None,
            needs_full_sweep: true,
            consecutive_failures: 0,
            ownership_generation: 0,
            swept: HashMap::new(),
        }
    }

    fn abort(&mut self, kind: &str, error: &crate::Error) {
        self.needs_full_sweep = true;
        self.consecutive_failures += 1;
        warn!(
            kind,
            consecutive_failures = self.consecutive_failures,
            error = %error,
            "sweep aborted, full resync scheduled"
        );
        #[cfg(feature = "metrics")]
        counter!(sweeper_metrics::ABORTED_SWEEPS_TOTAL).increment(1);
    }
}

fn jittered(period: Duration) -> Duration {
    let max_cut = u64::try_from(period.as_millis() / 10).unwrap_or(u64::MAX);
    if max_cut == 0 {
        return period;
    }
    let cut = rand::rng().random_range(0..=max_cut);
    period.saturating_sub(Duration::from_millis(cut))
}

/// Polls the store and schedules or deschedules jobs on this node.
pub struct JobSweeper {
    store: Arc<dyn JobStore>,
    scheduler: Arc<JobScheduler>,
    runner: Arc<dyn JobRunner>,
    ownership: OwnershipHandle,
    settings: SettingsHandle,
    created_at: DateTime<Utc>,
    context: Mutex<SweepContext>,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        scheduler: Arc<JobScheduler>,
        runner: Arc<dyn JobRunner>,
        ownership: OwnershipHandle,
        settings: SettingsHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            scheduler,
            runner,
            ownership,
            settings,
            created_at: Utc::now(),
            context: Mutex::new(SweepContext::new()),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.current().enabled
    }

    pub async fn phase(&self) -> SweeperPhase {
        self.context.lock().await.phase
    }

    /// Start of the last successful incremental or full sweep.
    pub async fn checkpoint(&self) -> Option<DateTime<Utc>> {
        self.context.lock().await.checkpoint
    }

    pub async fn metrics(&self) -> JobSweeperMetrics {
        self.metrics_at(Utc::now()).await
    }

    pub async fn metrics_at(&self, now: DateTime<Utc>) -> JobSweeperMetrics {
        let settings = self.settings.current();
        if !settings.enabled {
            return JobSweeperMetrics::DISABLED;
        }
        let last = self.context.lock().await.last_sweep.unwrap_or(self.created_at);
        let elapsed = now.signed_duration_since(last).max(TimeDelta::zero());
        let allowed = TimeDelta::from_std(settings.sweep_period + settings.sweep_period / 10)
            .unwrap_or(TimeDelta::MAX);
        JobSweeperMetrics {
            last_full_sweep_time_millis: elapsed.num_milliseconds(),
            full_sweep_on_time: elapsed <= allowed,
        }
    }

    /// Run one cycle now: a full resync when one is pending, otherwise an
    /// incremental sweep. Deschedules everything when the sweeper is disabled.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.cycle_at(Utc::now()).await
    }

    pub async fn run_full_sweep(&self) -> Result<SweepReport> {
        self.full_sweep_at(Utc::now()).await
    }

    pub async fn run_incremental_sweep(&self) -> Result<SweepReport> {
        self.incremental_sweep_at(Utc::now()).await
    }

    async fn cycle_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        if !self.is_enabled() {
            self.disable().await;
            return Ok(SweepReport::default());
        }
        let generation = self.ownership.current().generation;
        let resync_after = TimeDelta::from_std(self.settings.current().full_sweep_period)
            .unwrap_or(TimeDelta::MAX);
        let full = {
            let ctx = self.context.lock().await;
            ctx.needs_full_sweep
                || ctx.ownership_generation != generation
                || ctx
                    .last_full_sweep
                    .is_none_or(|last| now.signed_duration_since(last) >= resync_after)
        };
        if full {
            self.full_sweep_at(now).await
        } else {
            self.incremental_sweep_at(now).await
        }
    }

    /// Deschedule every job and forget all sweep state.
    pub async fn disable(&self) {
        let mut ctx = self.context.lock().await;
        if ctx.disabled {
            return;
        }
        let ids: Vec<JobId> = self.scheduler.scheduled_jobs().into_iter().collect();
        self.scheduler.deschedule_all(&ids);
        *ctx = SweepContext {
            disabled: true,
            ..SweepContext::new()
        };
        info!(descheduled = ids.len(), "sweeper disabled, all jobs descheduled");
    }

    async fn full_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let settings = self.settings.current();
        let policy = BackoffPolicy::from_settings(&settings);
        let snapshot = self.ownership.current();
        let ownership = snapshot.ownership.as_ref();
        let store = &self.store;
        let size = settings.sweep_page_size;

        let mut ctx = self.context.lock().await;
        ctx.disabled = false;
        ctx.phase = if ctx.last_full_sweep.is_none() {
            SweeperPhase::InitialFullSweep
        } else {
            SweeperPhase::FullSweep
        };
        let mut report = SweepReport {
            full: true,
            ..SweepReport::default()
        };

        for id in self.scheduler.scheduled_jobs() {
            if !ownership.owns(&id) {
                debug!(job_id = %id, "job no longer owned");
                self.scheduler.deschedule(&id);
                ctx.swept.remove(&id);
                report.descheduled += 1;
            }
        }

        let mut seen = HashSet::new();
        let mut after: Option<JobId> = None;
        loop {
            let cursor = after.as_deref();
            let fetched = match policy
                .retry("fetch_all_owned_jobs", move || {
                    store.fetch_all_owned_jobs(ownership, cursor, size)
                })
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    ctx.abort("full", &e);
                    return Err(e);
                },
            };
            report.pages += 1;
            for doc in &fetched.documents {
                seen.insert(doc.id.clone());
                self.apply_document(&mut ctx, doc, &mut report);
            }
            if !fetched.has_more {
                break;
            }
            after = fetched.documents.last().map(|doc| doc.id.clone());
        }

        for id in self.scheduler.scheduled_jobs() {
            if !seen.contains(&id) {
                debug!(job_id = %id, "job missing from store");
                self.scheduler.deschedule(&id);
                report.descheduled += 1;
            }
        }
        ctx.swept.retain(|id, _| seen.contains(id));

        ctx.checkpoint = Some(now);
        ctx.last_full_sweep = Some(now);
        ctx.last_sweep = Some(now);
        ctx.needs_full_sweep = false;
        ctx.consecutive_failures = 0;
        ctx.ownership_generation = snapshot.generation;
        ctx.phase = SweeperPhase::SteadyState;

        info!(
            generation = snapshot.generation,
            pages = report.pages,
            scheduled = report.scheduled,
            descheduled = report.descheduled,
            elapsed_ms = started.elapsed().as_millis(),
            "full sweep complete"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(sweeper_metrics::FULL_SWEEPS_TOTAL).increment(1);
            histogram!(sweeper_metrics::SWEEP_DURATION_SECONDS, labels::SWEEP_KIND => "full")
                .record(started.elapsed().as_secs_f64());
        }
        Ok(report)
    }

    async fn incremental_sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let settings = self.settings.current();
        let policy = BackoffPolicy::from_settings(&settings);
        let snapshot = self.ownership.current();
        let ownership = snapshot.ownership.as_ref();
        let store = &self.store;
        let size = settings.sweep_page_size;

        let mut ctx = self.context.lock().await;
        ctx.disabled = false;
        let since = ctx.checkpoint.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = SweepReport::default();

        let mut after: Option<JobId> = None;
        loop {
            let cursor = after.as_deref();
            let fetched = match policy
                .retry("fetch_changed_jobs", move || {
                    store.fetch_changed_jobs(since, ownership, cursor, size)
                })
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    ctx.abort("incremental", &e);
                    return Err(e);
                },
            };
            report.pages += 1;
            for doc in &fetched.documents {
                self.apply_document(&mut ctx, doc, &mut report);
            }
            if !fetched.has_more {
                break;
            }
            after = fetched.documents.last().map(|doc| doc.id.clone());
        }

        ctx.checkpoint = Some(now);
        ctx.last_sweep = Some(now);
        ctx.consecutive_failures = 0;

        debug!(
            %since,
            pages = report.pages,
            scheduled = report.scheduled,
            descheduled = report.descheduled,
            stale = report.stale,
            elapsed_ms = started.elapsed().as_millis(),
            "incremental sweep complete"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(sweeper_metrics::INCREMENTAL_SWEEPS_TOTAL).increment(1);
            histogram!(sweeper_metrics::SWEEP_DURATION_SECONDS, labels::SWEEP_KIND => "incremental")
                .record(started.elapsed().as_secs_f64());
        }
        Ok(report)
    }

    fn apply_document(&self, ctx: &mut SweepContext, doc: &JobDocument, report: &mut SweepReport) {
        if let Some(seen) = ctx.swept.get(&doc.id)
            && doc.version <= *seen
        {
            report.stale += 1;
            return;
        }

        match ScheduledJob::from_document(doc) {
            Ok(None) => {
                ctx.swept.insert(doc.id.clone(), doc.version);
                self.scheduler.deschedule(&doc.id);
                self.runner.post_delete(&doc.id);
                report.descheduled += 1;
            },
            Ok(Some(job)) => {
                ctx.swept.insert(doc.id.clone(), doc.version);
                if !job.enabled {
                    self.scheduler.deschedule(&job.id);
                    report.descheduled += 1;
                    return;
                }
                match self.scheduler.schedule(job.clone()) {
                    Ok(true) => {
                        self.runner.post_index(&job);
                        report.scheduled += 1;
                    },
                    Ok(false) => {},
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "failed to schedule job");
                        self.scheduler.deschedule(&job.id);
                        report.descheduled += 1;
                    },
                }
            },
            Err(e) => {
                let source = doc
                    .source
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                warn!(
                    job_id = %doc.id,
                    version = %doc.version,
                    error = %e,
                    source = %clean_truncate(&source, MAX_LOGGED_SOURCE_CHARS),
                    "unable to parse job document, descheduling"
                );
                #[cfg(feature = "metrics")]
                counter!(sweeper_metrics::PARSE_FAILURES_TOTAL).increment(1);
                self.scheduler.deschedule(&doc.id);
                report.parse_failures += 1;
            },
        }
    }

    /// Start the sweep loop. Wakes every jittered sweep period, and early on
    /// ownership or settings changes.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let sweeper = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            sweeper.run_loop().await;
        }));
        info!("job sweeper started");
    }

    pub async fn stop(&self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.context.lock().await.phase = SweeperPhase::Stopped;
        info!("job sweeper stopped");
    }

    async fn run_loop(self: &Arc<Self>) {
        let mut ownership_rx = self.ownership.subscribe();
        let mut settings_rx = self.settings.subscribe();
        loop {
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "sweep cycle failed");
            }
            let delay = jittered(self.settings.current().sweep_period);
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                changed = ownership_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    info!(generation = ownership_rx.borrow().generation, "ownership changed");
                },
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("sweeper settings changed");
                },
                () = self.shutdown.notified() => break,
            }
        }
    }
}
