//! Metric name and label definitions.
//!
//! All metric names used by the scheduling core live here so dashboards and
//! alerts have one place to look.

/// In-memory job scheduler metrics
pub mod scheduler {
    /// Number of jobs currently registered on this node
    pub const JOBS_SCHEDULED: &str = "cadence_scheduler_jobs_scheduled";
    /// Jobs found due during a tick
    pub const JOBS_DUE_TOTAL: &str = "cadence_scheduler_jobs_due_total";
    /// Total job executions handed to the runner
    pub const EXECUTIONS_TOTAL: &str = "cadence_scheduler_executions_total";
    /// Job execution duration in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "cadence_scheduler_execution_duration_seconds";
    /// Runner errors caught at the task boundary
    pub const RUNNER_ERRORS_TOTAL: &str = "cadence_scheduler_runner_errors_total";
    /// Fires skipped because the job was still running or locked elsewhere
    pub const SKIPPED_TICKS_TOTAL: &str = "cadence_scheduler_skipped_ticks_total";
    /// Delay between the expected fire time and the tick that dispatched it
    pub const TICK_LATENCY_SECONDS: &str = "cadence_scheduler_tick_latency_seconds";
}

/// Sweeper metrics
pub mod sweeper {
    /// Completed full sweeps
    pub const FULL_SWEEPS_TOTAL: &str = "cadence_sweeper_full_sweeps_total";
    /// Completed incremental sweeps
    pub const INCREMENTAL_SWEEPS_TOTAL: &str = "cadence_sweeper_incremental_sweeps_total";
    /// Sweep cycles aborted after exhausting retries
    pub const ABORTED_SWEEPS_TOTAL: &str = "cadence_sweeper_aborted_sweeps_total";
    /// Store call retries
    pub const RETRIES_TOTAL: &str = "cadence_sweeper_retries_total";
    /// Job documents that failed to parse
    pub const PARSE_FAILURES_TOTAL: &str = "cadence_sweeper_parse_failures_total";
    /// Sweep duration in seconds
    pub const SWEEP_DURATION_SECONDS: &str = "cadence_sweeper_sweep_duration_seconds";
}

/// Lock service metrics
pub mod lock {
    /// Locks acquired
    pub const ACQUIRED_TOTAL: &str = "cadence_lock_acquired_total";
    /// Acquire attempts that lost to another holder or a CAS race
    pub const CONTENDED_TOTAL: &str = "cadence_lock_contended_total";
    /// Release writes that hit a CAS conflict
    pub const RELEASE_CONFLICTS_TOTAL: &str = "cadence_lock_release_conflicts_total";
}

/// Common label keys
pub mod labels {
    pub const JOB_TYPE: &str = "job_type";
    pub const SWEEP_KIND: &str = "sweep_kind";
    pub const OUTCOME: &str = "outcome";
}

/// Standard histogram buckets for different metric types
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Job execution duration buckets (in seconds)
    /// Covers 10ms to 10 minutes
    pub static EXECUTION_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
        ]
    });

    /// Sweep duration buckets (in seconds)
    pub static SWEEP_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ]
    });
}
