//! Client construction
//!
//! Builds the credential store, the provisioner, and the upstream HTTP client
//! from settings.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::settings::{Settings, StoreBackend};
use crate::services::provisioner::{CommandProvisioner, DisabledProvisioner, Provisioner};
use crate::store::{BlobCodec, CredentialStore, GitHubConfig, GitHubContentStore, MemoryStore};

/// Builds the external clients the application depends on
pub struct ClientFactory<'a> {
    settings: &'a Settings,
}

impl<'a> ClientFactory<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    fn codec(&self) -> BlobCodec {
        if self.settings.store.rot13 {
            BlobCodec::rot13()
        } else {
            BlobCodec::plain()
        }
    }

    /// Create the configured credential store
    pub fn build_credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        let store = &self.settings.store;

        match store.backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory credential store");
                Ok(Arc::new(MemoryStore::with_codec(self.codec())))
            }
            StoreBackend::Github => {
                let token = store
                    .github_access_token
                    .clone()
                    .context("GITHUB_ACCESS_TOKEN is required for the GitHub store")?;
                let owner = store
                    .github_username
                    .clone()
                    .context("GITHUB_USERNAME is required for the GitHub store")?;
                let repo = store
                    .github_repo
                    .clone()
                    .context("GITHUB_REPO is required for the GitHub store")?;

                let config = GitHubConfig::new(token, owner, repo)
                    .with_branch(store.github_branch.clone())
                    .with_api_url(store.github_api_url.clone());

                let github = GitHubContentStore::new(config, self.codec())
                    .context("Failed to build GitHub credential store client")?;
                Ok(Arc::new(github))
            }
        }
    }

    /// Create the provisioner, disabled when no command is configured
    pub fn build_provisioner(&self) -> Arc<dyn Provisioner> {
        match &self.settings.provisioner.command {
            Some(command) => {
                tracing::info!(command = %command, "Using external command provisioner");
                Arc::new(CommandProvisioner::new(
                    command.clone(),
                    self.settings.provisioner.args.clone(),
                ))
            }
            None => Arc::new(DisabledProvisioner),
        }
    }

    /// Create the HTTP client used for upstream calls
    pub fn build_upstream_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.settings.upstream.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build upstream HTTP client")
    }
}

/// Create the credential store from settings (convenience function)
pub fn create_credential_store(settings: &Settings) -> Result<Arc<dyn CredentialStore>> {
    ClientFactory::new(settings).build_credential_store()
}

/// Create the provisioner from settings (convenience function)
pub fn create_provisioner(settings: &Settings) -> Arc<dyn Provisioner> {
    ClientFactory::new(settings).build_provisioner()
}

/// Create the upstream HTTP client from settings (convenience function)
pub fn create_upstream_client(settings: &Settings) -> Result<reqwest::Client> {
    ClientFactory::new(settings).build_upstream_client()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::StoreSettings;

    #[test]
    fn test_memory_store_backend() {
        let settings = Settings {
            store: StoreSettings {
                backend: StoreBackend::Memory,
                ..StoreSettings::default()
            },
            ..Settings::default()
        };
        assert_eq!(create_credential_store(&settings).unwrap().backend(), "memory");
    }

    #[test]
    fn test_github_backend_needs_token() {
        let settings = Settings::default();
        let err = create_credential_store(&settings).err().unwrap();
        assert!(err.to_string().contains("GITHUB_ACCESS_TOKEN"));
    }

    #[test]
    fn test_github_backend() {
        let mut settings = Settings::default();
        settings.store.github_access_token = Some("ghp_x".into());
        settings.store.github_username = Some("octo".into());
        settings.store.github_repo = Some("vault".into());
        assert_eq!(create_credential_store(&settings).unwrap().backend(), "github");
    }

    #[test]
    fn test_provisioner_selection() {
        let mut settings = Settings::default();
        assert_eq!(create_provisioner(&settings).describe(), "disabled");

        settings.provisioner.command = Some("/usr/local/bin/mint".into());
        assert_eq!(create_provisioner(&settings).describe(), "command:/usr/local/bin/mint");
    }

    #[test]
    fn test_upstream_client_builds() {
        assert!(create_upstream_client(&Settings::default()).is_ok());
    }
}
