//! Configuration loading, validation, env substitution, and live settings.
//!
//! Config files: `cadence.toml`, `cadence.yaml`, or `cadence.json`
//! Searched in `./` then `~/.config/cadence/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in the raw file,
//! and `CADENCE_*` overrides after parsing.

pub mod duration;
pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod settings;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        CadenceConfig, MetricsConfig, NodeConfig, OwnershipConfig, OwnershipMode,
        ScheduledJobSettings, SchedulerSettings, ShardRouting, StorageBackend, StorageConfig,
    },
    settings::SettingsHandle,
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
