use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result, bail},
    cadence_config::{CadenceConfig, StorageBackend},
    cadence_scheduler::{ExplicitOwnership, JobStore, OwnAll, ScheduledJob},
    chrono::{DateTime, Utc},
    clap::Subcommand,
    serde_json::{Map, Value},
};

#[derive(Subcommand)]
pub enum JobAction {
    /// Create or replace a job from a JSON file.
    Put {
        /// Path to the job definition.
        file: PathBuf,
    },
    /// Delete a job. Nodes deschedule it on their next sweep.
    Delete { id: String },
    /// List stored jobs with their next execution time.
    List,
}

pub async fn handle_jobs(action: JobAction, config: &CadenceConfig) -> Result<()> {
    if config.storage.backend != StorageBackend::Sqlite {
        bail!("job commands need the sqlite storage backend");
    }
    let store = crate::node::open_store(&config.storage).await?;

    match action {
        JobAction::Put { file } => {
            let job = prepare_job(store.as_ref(), &file, Utc::now()).await?;
            let version = store.put_job(&job).await?;
            println!("Stored job '{}' at version {version}.", job.id);
        },
        JobAction::Delete { id } => {
            if store.delete_job(&id).await? {
                println!("Deleted job '{id}'.");
            } else {
                println!("No job named '{id}'.");
            }
        },
        JobAction::List => list(store.as_ref(), config.scheduled_jobs.sweep_page_size).await?,
    }
    Ok(())
}

async fn list(store: &dyn JobStore, page_size: usize) -> Result<()> {
    let now = Utc::now();
    let mut after: Option<String> = None;
    let mut shown = 0;
    loop {
        let fetched = store
            .fetch_all_owned_jobs(&OwnAll, after.as_deref(), page_size)
            .await?;
        for doc in &fetched.documents {
            shown += 1;
            match ScheduledJob::from_document(doc) {
                Ok(Some(job)) => {
                    let next = if job.enabled {
                        job.schedule
                            .next_execution_time(job.enabled_time.unwrap_or(now), now)
                            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
                    } else {
                        "disabled".to_string()
                    };
                    println!(
                        "  {} [{}] {}  next: {next}",
                        job.id,
                        job.version,
                        serde_json::to_string(&job.schedule)?
                    );
                },
                Ok(None) => {},
                Err(e) => println!("  {} [{}] unreadable: {e}", doc.id, doc.version),
            }
        }
        if !fetched.has_more {
            break;
        }
        after = fetched.documents.last().map(|doc| doc.id.clone());
    }
    if shown == 0 {
        println!("No jobs stored.");
    }
    Ok(())
}

/// Read a job file and stamp it against what the store already holds.
async fn prepare_job(store: &dyn JobStore, path: &Path, now: DateTime<Utc>) -> Result<ScheduledJob> {
    let object = read_job_file(path)?;
    let stored = match object.get("id").and_then(Value::as_str) {
        Some(id) => stored_job(store, id).await?,
        None => None,
    };
    stamp_job(object, now, stored.as_ref())
}

fn read_job_file(path: &Path) -> Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        Value::Object(object) => Ok(object),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

/// The stored job with this id. Unreadable documents count as absent.
async fn stored_job(store: &dyn JobStore, id: &str) -> Result<Option<ScheduledJob>> {
    let only = ExplicitOwnership::new([id]);
    let page = store.fetch_all_owned_jobs(&only, None, 1).await?;
    Ok(page
        .documents
        .first()
        .and_then(|doc| ScheduledJob::from_document(doc).ok().flatten()))
}

/// Stamp `last_update_time` with `now`. An enabled job without an
/// `enabled_time` keeps the stored one when it was already enabled, and
/// gets `now` otherwise.
fn stamp_job(
    mut object: Map<String, Value>,
    now: DateTime<Utc>,
    stored: Option<&ScheduledJob>,
) -> Result<ScheduledJob> {
    object.insert("last_update_time".into(), serde_json::to_value(now)?);
    let enabled = object.get("enabled").and_then(Value::as_bool).unwrap_or(false);
    if enabled && !object.contains_key("enabled_time") {
        let since = stored
            .filter(|job| job.enabled)
            .and_then(|job| job.enabled_time)
            .unwrap_or(now);
        object.insert("enabled_time".into(), serde_json::to_value(since)?);
    }

    let job: ScheduledJob = serde_json::from_value(Value::Object(object))?;
    job.validate()?;
    Ok(job)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        cadence_scheduler::store_memory::InMemoryStore,
        chrono::{TimeDelta, TimeZone},
        std::io::Write,
    };

    const ENABLED_JOB: &str = r#"{
        "id": "disk-usage",
        "name": "disk usage",
        "enabled": true,
        "schedule": {"period": {"interval": 15, "unit": "MINUTES"}}
    }"#;

    fn write(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn new_job_gets_timestamps() {
        let store = InMemoryStore::new();
        let file = write(ENABLED_JOB);
        let job = prepare_job(&store, file.path(), t0()).await.unwrap();
        assert_eq!(job.id, "disk-usage");
        assert_eq!(job.enabled_time, Some(t0()));
        assert_eq!(job.last_update_time, t0());
    }

    #[tokio::test]
    async fn editing_an_enabled_job_keeps_its_enabled_time() {
        let store = InMemoryStore::new();
        let file = write(ENABLED_JOB);
        let first = prepare_job(&store, file.path(), t0()).await.unwrap();
        store.put_job(&first).await.unwrap();

        let later = t0() + TimeDelta::hours(3);
        let edited = prepare_job(&store, file.path(), later).await.unwrap();
        assert_eq!(edited.enabled_time, Some(t0()));
        assert_eq!(edited.last_update_time, later);
    }

    #[tokio::test]
    async fn re_enabling_a_disabled_job_restarts_its_schedule() {
        let store = InMemoryStore::new();
        let file = write(ENABLED_JOB);
        let mut stored = prepare_job(&store, file.path(), t0()).await.unwrap();
        stored.set_enabled(false, t0() + TimeDelta::hours(1));
        store.put_job(&stored).await.unwrap();

        let later = t0() + TimeDelta::hours(3);
        let enabled = prepare_job(&store, file.path(), later).await.unwrap();
        assert_eq!(enabled.enabled_time, Some(later));
    }

    #[test]
    fn invalid_job_file_is_rejected() {
        let file = write(
            r#"{
                "id": "bad",
                "name": "bad",
                "enabled": false,
                "schedule": {"period": {"interval": 0, "unit": "MINUTES"}}
            }"#,
        );
        let object = read_job_file(file.path()).unwrap();
        assert!(stamp_job(object, t0(), None).is_err());
    }
}
