use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    Error, Result, duration::parse_duration, env_subst::substitute_env, schema::CadenceConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "cadence.toml",
    "cadence.yaml",
    "cadence.yml",
    "cadence.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<CadenceConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./cadence.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/cadence/cadence.{toml,yaml,yml,json}` (user-global)
///
/// Returns `CadenceConfig::default()` if no config file is found or it fails to load.
pub fn discover_and_load() -> CadenceConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    CadenceConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| {
            let dir = config_dir()?;
            CONFIG_FILENAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        })
}

/// Returns the user-global config directory (`~/.config/cadence/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "cadence").map(|d| d.config_dir().to_path_buf())
}

/// Apply `CADENCE_*` environment overrides on top of a parsed config.
///
/// Recognised variables: `CADENCE_NODE_ID`, `CADENCE_DATABASE_URL`,
/// `CADENCE_SWEEPER_ENABLED`, `CADENCE_SWEEP_PERIOD`, `CADENCE_REQUEST_TIMEOUT`.
pub fn apply_env_overrides(config: CadenceConfig) -> Result<CadenceConfig> {
    apply_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_overrides_with(
    mut config: CadenceConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CadenceConfig> {
    if let Some(id) = lookup("CADENCE_NODE_ID") {
        config.node.id = Some(id);
    }
    if let Some(url) = lookup("CADENCE_DATABASE_URL") {
        config.storage.database_url = url;
    }
    if let Some(raw) = lookup("CADENCE_SWEEPER_ENABLED") {
        config.scheduled_jobs.enabled = parse_bool("CADENCE_SWEEPER_ENABLED", &raw)?;
    }
    if let Some(raw) = lookup("CADENCE_SWEEP_PERIOD") {
        config.scheduled_jobs.sweep_period = parse_override("CADENCE_SWEEP_PERIOD", &raw)?;
    }
    if let Some(raw) = lookup("CADENCE_REQUEST_TIMEOUT") {
        config.scheduled_jobs.request_timeout = parse_override("CADENCE_REQUEST_TIMEOUT", &raw)?;
    }
    Ok(config)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::invalid_override(key, format!("not a boolean: {other}"))),
    }
}

fn parse_override(key: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw).map_err(|e| Error::invalid_override(key, e.to_string()))
}

fn parse_config(raw: &str, path: &Path) -> Result<CadenceConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::StorageBackend};

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.yaml");
        std::fs::write(
            &path,
            "storage:\n  backend: memory\nscheduled_jobs:\n  sweep_page_size: 25\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.scheduled_jobs.sweep_page_size, 25);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_config(Path::new("/definitely/not/here/cadence.toml")).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let lookup = |name: &str| match name {
            "CADENCE_NODE_ID" => Some("node-9".to_string()),
            "CADENCE_SWEEPER_ENABLED" => Some("off".to_string()),
            "CADENCE_SWEEP_PERIOD" => Some("30s".to_string()),
            _ => None,
        };
        let cfg = apply_overrides_with(CadenceConfig::default(), lookup).unwrap();
        assert_eq!(cfg.node.id.as_deref(), Some("node-9"));
        assert!(!cfg.scheduled_jobs.enabled);
        assert_eq!(cfg.scheduled_jobs.sweep_period, Duration::from_secs(30));
    }

    #[test]
    fn bad_override_is_reported() {
        let lookup = |name: &str| (name == "CADENCE_SWEEPER_ENABLED").then(|| "maybe".to_string());
        let err = apply_overrides_with(CadenceConfig::default(), lookup).unwrap_err();
        assert!(err.to_string().contains("CADENCE_SWEEPER_ENABLED"));
    }
}
