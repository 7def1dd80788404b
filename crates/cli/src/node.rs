//! Wiring of one scheduler node from configuration.

use std::sync::Arc;

use {
    anyhow::Result,
    cadence_common::NodeId,
    cadence_config::{CadenceConfig, SettingsHandle, StorageBackend, StorageConfig},
    cadence_scheduler::{
        JobRunner, JobScheduler, JobStore, JobSweeper, LockService, OwnershipHandle,
        ownership_from_config, store_memory::InMemoryStore, store_sqlite::SqliteStore,
    },
    tracing::info,
};

pub struct Node {
    pub node_id: NodeId,
    pub store: Arc<dyn JobStore>,
    pub settings: SettingsHandle,
    pub ownership: OwnershipHandle,
    pub scheduler: Arc<JobScheduler>,
    pub sweeper: Arc<JobSweeper>,
}

impl Node {
    pub async fn build(config: &CadenceConfig, runner: Arc<dyn JobRunner>) -> Result<Self> {
        let node_id = NodeId::resolve(config.node.id.as_deref())?;
        let store = open_store(&config.storage).await?;
        let settings = SettingsHandle::new(config.scheduled_jobs.clone());
        let ownership = OwnershipHandle::new(ownership_from_config(&node_id, &config.ownership));

        let locks = Arc::new(LockService::new(
            Arc::clone(&store),
            node_id.clone(),
            settings.clone(),
        ));
        let scheduler = JobScheduler::new(Arc::clone(&runner), locks, &config.scheduler);
        let sweeper = JobSweeper::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            runner,
            ownership.clone(),
            settings.clone(),
        );

        info!(
            node_id = %node_id,
            backend = ?config.storage.backend,
            ownership = ?config.ownership.mode,
            "node assembled"
        );
        Ok(Self {
            node_id,
            store,
            settings,
            ownership,
            scheduler,
            sweeper,
        })
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
        self.sweeper.start().await;
    }

    pub async fn stop(&self) {
        self.sweeper.stop().await;
        self.scheduler.stop().await;
    }
}

pub async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        StorageBackend::Sqlite => Arc::new(SqliteStore::new(&storage.database_url).await?),
    })
}
