use std::sync::Arc;

use storage::repository::Storage;

use crate::Clock;
use crate::catalog_service::CatalogService;
use crate::error::AppServicesError;
use crate::graph_service::GraphService;
use crate::locks::GraphLocks;
use crate::prerequisite_service::PrerequisiteService;
use crate::progress_service::ProgressService;
use crate::unlock_engine::UnlockEngine;

/// Assembles the services over one storage backend and one set of graph locks.
#[derive(Clone)]
pub struct AppServices {
    catalog: Arc<CatalogService>,
    graphs: Arc<GraphService>,
    progress: Arc<ProgressService>,
    prerequisites: Arc<PrerequisiteService>,
    unlock_engine: Arc<UnlockEngine>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if connecting or migrating fails.
    pub async fn new_sqlite(db_url: &str, clock: Clock) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(&storage, clock))
    }

    /// Build services over a fresh in-memory store.
    #[must_use]
    pub fn in_memory(clock: Clock) -> Self {
        Self::from_storage(&Storage::in_memory(), clock)
    }

    /// Build services over an existing storage aggregate.
    #[must_use]
    pub fn from_storage(storage: &Storage, clock: Clock) -> Self {
        let locks = Arc::new(GraphLocks::new());
        let unlock_engine = Arc::new(UnlockEngine::new(
            clock,
            Arc::clone(&storage.graphs),
            Arc::clone(&storage.persistence),
            Arc::clone(&locks),
        ));
        let graphs = Arc::new(GraphService::new(
            clock,
            Arc::clone(&storage.graphs),
            Arc::clone(&storage.lessons),
            Arc::clone(&storage.persistence),
            Arc::clone(&locks),
            Arc::clone(&unlock_engine),
        ));
        let progress = Arc::new(ProgressService::new(
            clock,
            Arc::clone(&storage.graphs),
            Arc::clone(&storage.lessons),
            Arc::clone(&storage.progress),
            Arc::clone(&storage.persistence),
            locks,
        ));
        let prerequisites = Arc::new(PrerequisiteService::new(
            Arc::clone(&storage.graphs),
            Arc::clone(&storage.progress),
        ));
        let catalog = Arc::new(CatalogService::new(Arc::clone(&storage.lessons)));

        Self {
            catalog,
            graphs,
            progress,
            prerequisites,
            unlock_engine,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> Arc<CatalogService> {
        Arc::clone(&self.catalog)
    }

    #[must_use]
    pub fn graphs(&self) -> Arc<GraphService> {
        Arc::clone(&self.graphs)
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressService> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn prerequisites(&self) -> Arc<PrerequisiteService> {
        Arc::clone(&self.prerequisites)
    }

    #[must_use]
    pub fn unlock_engine(&self) -> Arc<UnlockEngine> {
        Arc::clone(&self.unlock_engine)
    }
}
