//! The execution-layer collaborator invoked when a job fires.

use std::sync::Mutex;

use {
    async_trait::async_trait,
    cadence_common::JobId,
    chrono::{DateTime, Utc},
    tokio::sync::watch,
    tracing::info,
};

use crate::{Error, Result, types::ScheduledJob};

/// Runs a job for one period. Implemented by the alerting layer.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(
        &self,
        job: &ScheduledJob,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()>;

    /// Called after the sweeper schedules a new or changed definition.
    fn post_index(&self, _job: &ScheduledJob) {}

    /// Called after the sweeper observes a deletion.
    fn post_delete(&self, _job_id: &str) {}
}

/// Runner that only logs. Used by `cadence run` when no other runner is wired.
#[derive(Debug, Default)]
pub struct LoggingRunner;

#[async_trait]
impl JobRunner for LoggingRunner {
    async fn run_job(
        &self,
        job: &ScheduledJob,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        info!(
            job_id = %job.id,
            name = %job.name,
            job_type = %job.job_type,
            %period_start,
            %period_end,
            "running job"
        );
        Ok(())
    }
}

/// A recorded invocation of [`RecordingRunner::run_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub job_id: JobId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Runner that records every call. Can be made to fail, or to hold runs
/// until [`RecordingRunner::open_gate`] is called.
pub struct RecordingRunner {
    runs: Mutex<Vec<RecordedRun>>,
    indexed: Mutex<Vec<JobId>>,
    deleted: Mutex<Vec<JobId>>,
    fail_with: Option<String>,
    gate: watch::Sender<bool>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            runs: Mutex::new(Vec::new()),
            indexed: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_with: None,
            gate,
        }
    }

    /// Every run returns an error with this message.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::new()
        }
    }

    /// Runs block until the gate is opened.
    pub fn gated() -> Self {
        let runner = Self::new();
        runner.gate.send_replace(false);
        runner
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn run_count(&self, job_id: &str) -> usize {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.job_id == job_id)
            .count()
    }

    pub fn indexed(&self) -> Vec<JobId> {
        self.indexed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn run_job(
        &self,
        job: &ScheduledJob,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRun {
                job_id: job.id.clone(),
                period_start,
                period_end,
            });

        let mut gate = self.gate.subscribe();
        // The sender lives in `self`, so this only errors if the runner is gone.
        let _ = gate.wait_for(|open| *open).await;

        match &self.fail_with {
            Some(message) => Err(Error::message(message.clone())),
            None => Ok(()),
        }
    }

    fn post_index(&self, job: &ScheduledJob) {
        self.indexed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.id.clone());
    }

    fn post_delete(&self, job_id: &str) {
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job_id.to_string());
    }
}
