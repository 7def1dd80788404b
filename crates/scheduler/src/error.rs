use thiserror::Error;

/// Classification of a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Unavailable,
    Overloaded,
    Timeout,
    NotFound,
    Conflict,
    Invalid,
    Other,
}

impl StoreErrorKind {
    /// Whether a retry of the same call may succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unavailable | Self::Overloaded | Self::Timeout)
    }
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid job: {message}")]
    Validation { message: String },

    #[error("invalid cron expression '{expression}': {source}")]
    CronParse {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("store {kind}: {message}")]
    Store {
        kind: StoreErrorKind,
        message: String,
    },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Common(#[from] cadence_common::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self::Store {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// Store failures worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store { kind, .. } => kind.is_transient(),
            Self::Sqlx(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_store_kinds_retry() {
        assert!(Error::store(StoreErrorKind::Unavailable, "down").is_transient());
        assert!(Error::store(StoreErrorKind::Timeout, "slow").is_transient());
        assert!(!Error::store(StoreErrorKind::Invalid, "bad").is_transient());
        assert!(!Error::validation("nope").is_transient());
    }
}
