//! Config schema types (node identity, storage, sweeper, scheduler, ownership, metrics).

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::duration::serde_human;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub scheduled_jobs: ScheduledJobSettings,
    pub scheduler: SchedulerSettings,
    pub ownership: OwnershipConfig,
    pub metrics: MetricsConfig,
}

/// Identity of the local node. Falls back to the hostname when unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: "sqlite://cadence.db?mode=rwc".into(),
        }
    }
}

/// Settings that drive the job sweeper and the lock service. All of them can
/// be changed at runtime through [`crate::SettingsHandle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledJobSettings {
    /// When false no job is scheduled on this node.
    pub enabled: bool,
    /// Timeout applied to every store call.
    #[serde(with = "serde_human")]
    pub request_timeout: Duration,
    /// Base delay of the exponential backoff around store calls.
    #[serde(with = "serde_human")]
    pub sweep_backoff: Duration,
    /// Retries after the first failed attempt.
    pub sweep_backoff_retry_count: u32,
    #[serde(with = "serde_human")]
    pub sweep_period: Duration,
    /// A sweep cycle is a full resync once this long has passed since the
    /// last one, catching changes the incremental query missed.
    #[serde(with = "serde_human")]
    pub full_sweep_period: Duration,
    pub sweep_page_size: usize,
    /// A lock marked running longer than this is treated as abandoned.
    #[serde(with = "serde_human")]
    pub lock_expiry: Duration,
}

impl Default for ScheduledJobSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            request_timeout: Duration::from_secs(10),
            sweep_backoff: Duration::from_millis(50),
            sweep_backoff_retry_count: 3,
            sweep_period: Duration::from_secs(5 * 60),
            full_sweep_period: Duration::from_secs(30 * 60),
            sweep_page_size: 100,
            lock_expiry: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Granularity of the timer that looks for due jobs.
    #[serde(with = "serde_human")]
    pub tick_interval: Duration,
    /// Upper bound on concurrently executing job runs.
    pub max_concurrent_runs: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            max_concurrent_runs: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipMode {
    /// This node owns every job (single-node deployments).
    #[default]
    All,
    /// Jobs are owned through shard routing and a consistent hash per shard.
    Shards,
}

/// Nodes holding an active copy of one shard of the job index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard: u32,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    pub mode: OwnershipMode,
    pub shard_count: u32,
    pub routing: Vec<ShardRouting>,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            mode: OwnershipMode::default(),
            shard_count: 1,
            routing: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub labels: BTreeMap<String, String>,
}
