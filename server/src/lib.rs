pub mod config;
pub mod lifecycle;
pub mod precache;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use lifecycle::{ServiceWorker, WorkerRegistry, WorkerState};
pub use precache::{CacheStorage, Network, PrecacheError, PrecacheManager};

use precache::local::LocalBodyStore;
use precache::sqlite::SqliteCacheIndex;
use precache::{HttpNetwork, Manifest};
use std::sync::Arc;

pub type AppState = Arc<ServerState>;

pub struct ServerState {
    pub config: ServerConfig,
    pub registry: WorkerRegistry,
    // Shared by every worker version
    pub storage: CacheStorage,
    pub network: Arc<dyn Network>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("storage", &self.storage)
            .field("network", &"<dyn Network>")
            .finish()
    }
}

impl ServerState {
    pub fn new(config: ServerConfig, storage: CacheStorage, network: Arc<dyn Network>) -> Self {
        Self {
            registry: WorkerRegistry::new(network.clone()),
            config,
            storage,
            network,
        }
    }

    /// Open the on-disk stores and HTTP network described by `config`
    ///
    /// STORAGE_DIR structure:
    ///   - precache.db (SQLite index)
    ///   - bodies/ (content-addressed response bodies)
    pub fn open(config: ServerConfig) -> Result<Self, PrecacheError> {
        std::fs::create_dir_all(&config.storage_dir)?;

        let index = SqliteCacheIndex::new(config.storage_dir.join("precache.db"))?;
        let bodies = LocalBodyStore::new(config.storage_dir.join("bodies"))?;
        let storage = CacheStorage::new(config.cache_name.clone(), Arc::new(index), Arc::new(bodies));

        let network = HttpNetwork::new(config.fetch_timeout, config.user_agent.as_deref())?;
        Ok(Self::new(config, storage, Arc::new(network)))
    }

    /// A fresh worker for `manifest`, sharing this server's store and network
    pub fn worker_for(&self, manifest: Manifest) -> ServiceWorker {
        ServiceWorker::new(PrecacheManager::new(
            manifest,
            &self.config.origin,
            self.config.precache.clone(),
            self.storage.clone(),
            self.network.clone(),
        ))
    }

    /// Read the configured manifest file and build a worker for it
    pub async fn load_worker(&self) -> Result<ServiceWorker, PrecacheError> {
        let manifest = Manifest::load(&self.config.manifest_path, &self.config.origin).await?;
        Ok(self.worker_for(manifest))
    }
}

#[cfg(test)]
mod test_support;
