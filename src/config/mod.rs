//! Configuration management module
//!
//! Loads and validates settings from environment variables and `.env`
//! files, and builds the clients those settings describe.

pub mod clients;
pub mod settings;

pub use clients::{create_credential_store, create_provisioner, create_upstream_client, ClientFactory};
pub use settings::{
    Environment, LogFormat, PoolSettings, ProvisionerSettings, Settings, StoreBackend, StoreSettings,
    UpstreamConfig,
};
