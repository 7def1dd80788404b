//! Per-node scheduling health report.

use {
    cadence_common::{JobId, NodeId},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::info,
};

use crate::{scheduler::JobScheduler, sweeper::JobSweeper};

/// How one scheduled job is keeping up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedulerMetrics {
    pub id: JobId,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub running_on_time: bool,
}

/// How the sweeper is keeping up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSweeperMetrics {
    /// Milliseconds since the last full sweep finished, `-1` when disabled.
    pub last_full_sweep_time_millis: i64,
    /// Whether that is within one sweep period.
    pub full_sweep_on_time: bool,
}

impl JobSweeperMetrics {
    pub const DISABLED: Self = Self {
        last_full_sweep_time_millis: -1,
        full_sweep_on_time: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Green,
    Red,
}

/// Scheduling health of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobsStats {
    pub node_id: NodeId,
    pub status: ScheduleStatus,
    pub sweeper_enabled: bool,
    pub scheduled_job_count: usize,
    pub skipped_ticks: u64,
    pub sweeper: JobSweeperMetrics,
    pub jobs: Vec<JobSchedulerMetrics>,
}

impl ScheduledJobsStats {
    /// Green when the last full sweep is recent and every job ran on time.
    pub fn evaluate_status(
        jobs: &[JobSchedulerMetrics],
        sweeper: &JobSweeperMetrics,
    ) -> ScheduleStatus {
        let all_on_time = jobs.iter().all(|j| j.running_on_time);
        if all_on_time && sweeper.full_sweep_on_time {
            ScheduleStatus::Green
        } else {
            info!(
                jobs_on_time = all_on_time,
                sweeper_on_time = sweeper.full_sweep_on_time,
                "node is not on schedule"
            );
            ScheduleStatus::Red
        }
    }

    pub async fn collect(
        node_id: NodeId,
        scheduler: &JobScheduler,
        sweeper: &JobSweeper,
        now: DateTime<Utc>,
    ) -> Self {
        let sweeper_metrics = sweeper.metrics_at(now).await;
        let mut jobs = scheduler.job_metrics_at(now);
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            node_id,
            status: Self::evaluate_status(&jobs, &sweeper_metrics),
            sweeper_enabled: sweeper.is_enabled(),
            scheduled_job_count: jobs.len(),
            skipped_ticks: scheduler.skipped_ticks(),
            sweeper: sweeper_metrics,
            jobs,
        }
    }
}
