//! Core data types shared by the store, the scheduler and the sweeper.

use {
    cadence_common::{JobId, NodeId},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result, schedule::Schedule};

/// Optimistic-concurrency version of a stored document.
///
/// Ordered by primary term first, then sequence number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DocVersion {
    pub primary_term: u64,
    pub seq_no: u64,
}

impl DocVersion {
    pub const fn new(primary_term: u64, seq_no: u64) -> Self {
        Self {
            primary_term,
            seq_no,
        }
    }

    /// The version that follows this one within the same term.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            primary_term: self.primary_term,
            seq_no: self.seq_no + 1,
        }
    }
}

impl std::fmt::Display for DocVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.primary_term, self.seq_no)
    }
}

fn default_job_type() -> String {
    "monitor".into()
}

/// A job definition as held by the scheduler. A read-only, possibly stale
/// copy of the stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    #[serde(default)]
    pub id: JobId,
    #[serde(default)]
    pub version: DocVersion,
    pub name: String,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_time: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
    #[serde(default)]
    pub inputs: serde_json::Value,
}

impl ScheduledJob {
    /// Create an enabled job whose schedule is anchored at `now`.
    pub fn new(
        id: impl Into<JobId>,
        name: impl Into<String>,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            version: DocVersion::default(),
            name: name.into(),
            job_type: default_job_type(),
            enabled: true,
            schedule,
            enabled_time: Some(now),
            last_update_time: now,
            inputs: serde_json::Value::Null,
        }
    }

    /// Check the definition is consistent: schedule valid, `enabled_time`
    /// present exactly when enabled.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("job id must not be empty"));
        }
        self.schedule
            .validate()
            .map_err(|e| Error::validation(format!("job {}: {e}", self.id)))?;
        match (self.enabled, self.enabled_time) {
            (true, None) => Err(Error::validation(format!(
                "job {} is enabled but has no enabled_time",
                self.id
            ))),
            (false, Some(_)) => Err(Error::validation(format!(
                "job {} is disabled but has an enabled_time",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Toggle the enabled flag, stamping or clearing `enabled_time`.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled && !self.enabled {
            self.enabled_time = Some(now);
        } else if !enabled {
            self.enabled_time = None;
        }
        self.enabled = enabled;
        self.last_update_time = now;
    }

    /// Parse a stored document. Returns `None` for tombstones.
    ///
    /// Identity and version always come from the document metadata.
    pub fn from_document(doc: &JobDocument) -> Result<Option<Self>> {
        let Some(source) = &doc.source else {
            return Ok(None);
        };
        let mut job: Self = serde_json::from_value(source.clone())?;
        job.id = doc.id.clone();
        job.version = doc.version;
        job.validate()?;
        Ok(Some(job))
    }
}

/// A job document as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub id: JobId,
    pub version: DocVersion,
    pub last_update_time: DateTime<Utc>,
    /// Raw definition; `None` marks a deleted job.
    pub source: Option<serde_json::Value>,
}

impl JobDocument {
    pub fn from_job(job: &ScheduledJob) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            version: job.version,
            last_update_time: job.last_update_time,
            source: Some(serde_json::to_value(job)?),
        })
    }

    pub fn is_tombstone(&self) -> bool {
        self.source.is_none()
    }
}

/// One page of a paged store query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub documents: Vec<JobDocument>,
    pub has_more: bool,
}

/// Result of a single job run, recorded on the lock document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed { error: String },
}

/// Cross-node mutual exclusion record for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockModel {
    pub job_id: JobId,
    pub owner: NodeId,
    pub lock_time: DateTime<Utc>,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<RunOutcome>,
}

/// A lock document together with the version it was read or written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub model: LockModel,
    pub version: DocVersion,
}

impl Lock {
    pub fn job_id(&self) -> &str {
        &self.model.job_id
    }
}
