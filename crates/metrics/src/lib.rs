//! Metric names and exporter setup for cadence.
//!
//! This crate provides a unified metrics interface using the `metrics` crate facade.
//! When the `prometheus` feature is enabled, metrics are exported in Prometheus format.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cadence_metrics::{counter, gauge, scheduler};
//!
//! counter!(scheduler::EXECUTIONS_TOTAL).increment(1);
//! gauge!(scheduler::JOBS_SCHEDULED).set(42.0);
//! ```

mod definitions;
mod error;
mod recorder;

pub use {
    definitions::*,
    error::{Error, Result},
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
