//! Configuration validation engine.
//!
//! Detects syntax errors, unknown/misspelled fields, type errors and settings
//! combinations that would make the sweeper or scheduler misbehave.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use crate::schema::{CadenceConfig, OwnershipMode};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "semantic", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "scheduled_jobs.sweep_period"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema shape for unknown-field detection ────────────────────────────────

enum Shape {
    Leaf,
    /// Free-form map (metrics labels).
    AnyMap,
    Struct(&'static [(&'static str, Shape)]),
    Array(&'static Shape),
}

const SCHEMA: Shape = Shape::Struct(&[
    ("node", Shape::Struct(&[("id", Shape::Leaf)])),
    (
        "storage",
        Shape::Struct(&[("backend", Shape::Leaf), ("database_url", Shape::Leaf)]),
    ),
    (
        "scheduled_jobs",
        Shape::Struct(&[
            ("enabled", Shape::Leaf),
            ("request_timeout", Shape::Leaf),
            ("sweep_backoff", Shape::Leaf),
            ("sweep_backoff_retry_count", Shape::Leaf),
            ("sweep_period", Shape::Leaf),
            ("full_sweep_period", Shape::Leaf),
            ("sweep_page_size", Shape::Leaf),
            ("lock_expiry", Shape::Leaf),
        ]),
    ),
    (
        "scheduler",
        Shape::Struct(&[
            ("tick_interval", Shape::Leaf),
            ("max_concurrent_runs", Shape::Leaf),
        ]),
    ),
    (
        "ownership",
        Shape::Struct(&[
            ("mode", Shape::Leaf),
            ("shard_count", Shape::Leaf),
            (
                "routing",
                Shape::Array(&Shape::Struct(&[
                    ("shard", Shape::Leaf),
                    ("nodes", Shape::Leaf),
                ])),
            ),
        ]),
    ),
    (
        "metrics",
        Shape::Struct(&[("enabled", Shape::Leaf), ("labels", Shape::AnyMap)]),
    ),
]);

fn check_unknown_fields(
    value: &serde_json::Value,
    shape: &Shape,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, shape) {
        (serde_json::Value::Object(map), Shape::Struct(fields)) => {
            let known: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match fields.iter().find(|(name, _)| *name == key.as_str()) {
                    Some((_, child_shape)) => {
                        check_unknown_fields(child, child_shape, &path, diagnostics);
                    },
                    None => {
                        let message = match suggest(key, &known, 3) {
                            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                            None => "unknown field".to_string(),
                        };
                        diagnostics.push(Diagnostic::new(
                            Severity::Error,
                            "unknown-field",
                            path,
                            message,
                        ));
                    },
                }
            }
        },
        (serde_json::Value::Array(items), Shape::Array(item_shape)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_shape, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Type mismatches are reported by the deserialization step.
        _ => {},
    }
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let format = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("toml")
        .to_string();

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => validate_str(&crate::env_subst::substitute_env(&content), &format),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate raw config text in the given format (`toml`, `yaml`, `yml`, `json`).
#[must_use]
pub fn validate_str(raw: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let value: Result<serde_json::Value, String> = match format {
        "toml" => toml::from_str::<toml::Value>(raw)
            .map_err(|e| e.to_string())
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(raw).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format: .{other}")),
    };

    let value = match value {
        Ok(v) => v,
        Err(message) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                message,
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&value, &SCHEMA, "", &mut diagnostics);

    match serde_json::from_value::<CadenceConfig>(value) {
        Ok(config) => diagnostics.extend(validate_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Semantic checks on an already parsed config.
#[must_use]
pub fn validate_config(config: &CadenceConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let jobs = &config.scheduled_jobs;

    if jobs.sweep_page_size == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "scheduled_jobs.sweep_page_size",
            "page size must be at least 1",
        ));
    }
    if jobs.sweep_backoff_retry_count > 10 {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "scheduled_jobs.sweep_backoff_retry_count",
            format!(
                "{} retries with exponential backoff can stall a sweep for a long time",
                jobs.sweep_backoff_retry_count
            ),
        ));
    }
    if jobs.request_timeout >= jobs.sweep_period {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "scheduled_jobs.request_timeout",
            "request timeout is not shorter than the sweep period",
        ));
    }
    if jobs.full_sweep_period < jobs.sweep_period {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "semantic",
            "scheduled_jobs.full_sweep_period",
            "full sweep period is shorter than the sweep period, every cycle is a full resync",
        ));
    }
    if config.scheduler.max_concurrent_runs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "scheduler.max_concurrent_runs",
            "at least one concurrent run is required",
        ));
    }

    check_ownership(config, &mut diagnostics);
    diagnostics
}

fn check_ownership(config: &CadenceConfig, diagnostics: &mut Vec<Diagnostic>) {
    let ownership = &config.ownership;
    match ownership.mode {
        OwnershipMode::All => {
            if !ownership.routing.is_empty() {
                diagnostics.push(Diagnostic::new(
                    Severity::Warning,
                    "semantic",
                    "ownership.routing",
                    "routing is ignored when mode = \"all\"",
                ));
            }
        },
        OwnershipMode::Shards => {
            if ownership.shard_count == 0 {
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "semantic",
                    "ownership.shard_count",
                    "shard count must be at least 1",
                ));
            }
            if ownership.routing.is_empty() {
                diagnostics.push(Diagnostic::new(
                    Severity::Warning,
                    "semantic",
                    "ownership.routing",
                    "no shard routing configured; this node owns no jobs",
                ));
            }
            let mut seen = HashSet::new();
            for (i, route) in ownership.routing.iter().enumerate() {
                let path = format!("ownership.routing[{i}]");
                if route.shard >= ownership.shard_count {
                    diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        "semantic",
                        path.clone(),
                        format!(
                            "shard {} is out of range (shard_count = {})",
                            route.shard, ownership.shard_count
                        ),
                    ));
                }
                if !seen.insert(route.shard) {
                    diagnostics.push(Diagnostic::new(
                        Severity::Error,
                        "semantic",
                        path.clone(),
                        format!("shard {} is routed more than once", route.shard),
                    ));
                }
                if route.nodes.is_empty() {
                    diagnostics.push(Diagnostic::new(
                        Severity::Warning,
                        "semantic",
                        path,
                        format!("shard {} has no nodes; its jobs will not run", route.shard),
                    ));
                }
            }
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn paths(result: &ValidationResult, category: &str) -> Vec<String> {
        result
            .diagnostics
            .iter()
            .filter(|d| d.category == category)
            .map(|d| d.path.clone())
            .collect()
    }

    #[test]
    fn default_config_is_clean() {
        assert!(validate_config(&CadenceConfig::default()).is_empty());
    }

    #[test]
    fn flags_misspelled_field_with_suggestion() {
        let result = validate_str("[scheduled_jobs]\nsweep_perid = \"5m\"\n", "toml");
        let d = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field")
            .unwrap();
        assert_eq!(d.path, "scheduled_jobs.sweep_perid");
        assert!(d.message.contains("sweep_period"));
    }

    #[test]
    fn syntax_error_stops_validation() {
        let result = validate_str("[scheduled_jobs", "toml");
        assert!(result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_error_is_reported() {
        let result = validate_str(r#"{"scheduled_jobs": {"sweep_period": "soon"}}"#, "json");
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.diagnostics[0].category, "type-error");
    }

    #[test]
    fn metrics_labels_accept_any_key() {
        let result = validate_str("metrics:\n  labels:\n    region: eu\n", "yaml");
        assert!(!result.has_errors());
    }

    #[test]
    fn shard_routing_checks() {
        let raw = r#"
            [ownership]
            mode = "shards"
            shard_count = 2
            routing = [
              { shard = 0, nodes = ["a"] },
              { shard = 0, nodes = [] },
              { shard = 5, nodes = ["b"] },
            ]
        "#;
        let result = validate_str(raw, "toml");
        let semantic = paths(&result, "semantic");
        assert!(semantic.contains(&"ownership.routing[1]".to_string()));
        assert!(semantic.contains(&"ownership.routing[2]".to_string()));
        assert_eq!(result.count(Severity::Error), 2);
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn zero_page_size_is_error() {
        let mut config = CadenceConfig::default();
        config.scheduled_jobs.sweep_page_size = 0;
        let diagnostics = validate_config(&config);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Error);
    }

    #[test]
    fn full_sweep_shorter_than_sweep_is_noted() {
        let mut config = CadenceConfig::default();
        config.scheduled_jobs.full_sweep_period = std::time::Duration::from_secs(60);
        let diagnostics = validate_config(&config);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Info);
        assert_eq!(diagnostics[0].path, "scheduled_jobs.full_sweep_period");
    }

    #[test]
    fn validates_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, "[scheduler]\nmax_concurrent_runs = 0\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(result.has_errors());
    }
}
