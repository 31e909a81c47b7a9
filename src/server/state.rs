//! Application state container
//!
//! Shared state passed to every handler via Axum's state extraction.

use anyhow::Result;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{create_credential_store, create_provisioner, create_upstream_client, Settings};
use crate::services::{Dispatcher, PoolManager, Provisioner, TaskSupervisor};
use crate::store::CredentialStore;

/// Shared application state
///
/// Cheap to clone; everything inside is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,

    /// Credential pool shared with the dispatcher
    pub pool: PoolManager,

    pub dispatcher: Arc<Dispatcher>,

    /// Sink for background task failures
    pub tasks: TaskSupervisor,

    /// Application start time (for uptime calculation)
    pub start_time: Instant,
}

impl AppState {
    /// Build state with the store and provisioner described by `settings`
    pub fn new(settings: Settings) -> Result<Self> {
        tracing::debug!(
            backend = %settings.store.backend,
            storage_key = %settings.pool.storage_key,
            "Creating credential store"
        );
        let store = create_credential_store(&settings)?;
        let provisioner = create_provisioner(&settings);
        let client = create_upstream_client(&settings)?;

        Self::from_parts(settings, store, provisioner, client)
    }

    /// Build state around explicit collaborators
    pub fn from_parts(
        settings: Settings,
        store: Arc<dyn CredentialStore>,
        provisioner: Arc<dyn Provisioner>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let exhausted_status: StatusCode = settings.upstream.exhausted_status()?;
        let tasks = TaskSupervisor::new();
        let pool = PoolManager::new(settings.pool_config(), store, provisioner, tasks.clone());
        let dispatcher = Arc::new(Dispatcher::new(client, pool.clone(), exhausted_status));

        Ok(Self {
            settings: Arc::new(settings),
            pool,
            dispatcher,
            tasks,
            start_time: Instant::now(),
        })
    }

    /// Get the application uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
