//! Shared handler state.

use std::sync::Arc;

use oplet_files::FileStorage;
use oplet_store::{ExecutionRepository, RunnerRepository, Store, TaskRepository};
use oplet_task::Provider;

/// Everything the protocol handlers need, constructed once in `main` and
/// cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub files: FileStorage,
    pub provider: Arc<dyn Provider>,
}

impl AppState {
    pub fn new(store: Store, files: FileStorage, provider: Arc<dyn Provider>) -> Self {
        Self {
            store,
            files,
            provider,
        }
    }

    pub fn executions(&self) -> ExecutionRepository {
        ExecutionRepository::new(self.store.clone())
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.store.clone())
    }

    pub fn runners(&self) -> RunnerRepository {
        RunnerRepository::new(self.store.clone())
    }
}
