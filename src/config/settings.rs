//! Application settings and configuration
//!
//! Settings are read from environment variables (after loading a `.env`
//! file if present) with defaults, then validated.

use anyhow::{Context, Result};
use axum::http::{Method, StatusCode};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

use crate::services::pool::{PersistPolicy, PoolConfig};
use crate::utils::retry::presets;

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    #[value(alias = "dev")]
    Development,
    #[value(alias = "stage")]
    Staging,
    #[value(alias = "prod")]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!("Invalid environment: {}. Expected: development, staging, or production", s),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" | "plain" => Ok(LogFormat::Text),
            _ => anyhow::bail!("Invalid log format: {}. Expected: json or text", s),
        }
    }
}

/// Credential store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Github,
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Github => write!(f, "github"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(StoreBackend::Github),
            "memory" => Ok(StoreBackend::Memory),
            _ => anyhow::bail!("Invalid store backend: {}. Expected: github or memory", s),
        }
    }
}

/// Upstream API the proxy forwards to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Methods accepted for proxying, upper-case
    pub methods: Vec<String>,
    pub timeout_seconds: u64,
    /// Status that marks a credential as exhausted
    pub exhausted_status: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://router.huggingface.co".to_string(),
            methods: vec!["POST".to_string()],
            timeout_seconds: 300,
            exhausted_status: 402,
        }
    }
}

impl UpstreamConfig {
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Upstream URL for an inbound path and query
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path_and_query)
    }

    pub fn exhausted_status(&self) -> Result<StatusCode> {
        StatusCode::from_u16(self.exhausted_status)
            .with_context(|| format!("Invalid EXHAUSTED_STATUS_CODE: {}", self.exhausted_status))
    }
}

/// Credential pool sizing and timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    pub min_api_keys: usize,
    pub key_creation_timeout_ms: u64,
    pub key_creation_lock_timeout_ms: u64,
    pub key_creation_retry_delay_ms: u64,
    pub storage_key: String,
    pub persist_policy: PersistPolicy,
    pub persist_conflict_retries: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_api_keys: 5,
            key_creation_timeout_ms: 300_000,
            key_creation_lock_timeout_ms: 30_000,
            key_creation_retry_delay_ms: 1_000,
            storage_key: "huggingface_api_keys".to_string(),
            persist_policy: PersistPolicy::OnTarget,
            persist_conflict_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    #[serde(skip_serializing)]
    pub github_access_token: Option<String>,
    pub github_username: Option<String>,
    pub github_repo: Option<String>,
    pub github_branch: String,
    pub github_api_url: String,
    /// Apply ROT13 before base64 when writing blobs
    pub rot13: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Github,
            github_access_token: None,
            github_username: None,
            github_repo: None,
            github_branch: "main".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            rot13: true,
        }
    }
}

/// External program that mints credentials; none means provisioning is off
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvisionerSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    pub log_level: String,
    pub log_format: LogFormat,

    // Server settings
    pub host: String,
    pub port: u16,

    pub upstream: UpstreamConfig,
    pub pool: PoolSettings,
    pub store: StoreSettings,
    pub provisioner: ProvisionerSettings,
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let settings = Self {
            app_name: env_or_default("APP_NAME", "credential-relay"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: env_or_default("ENVIRONMENT", "development")
                .parse()
                .unwrap_or_default(),
            log_level: env_or_default("LOG_LEVEL", "info"),
            log_format: env_or_default("LOG_FORMAT", "json")
                .parse()
                .unwrap_or_default(),

            host: env_or_default("HOST", "0.0.0.0"),
            port: env_or_default("PORT", "7860")
                .parse()
                .context("Invalid PORT value")?,

            upstream: UpstreamConfig {
                base_url: env_or_default("BASE_URL", "https://router.huggingface.co"),
                methods: parse_methods(&env_or_default("PROXY_METHODS", "POST")),
                timeout_seconds: env_or_default("UPSTREAM_TIMEOUT_SECONDS", "300")
                    .parse()
                    .unwrap_or(300),
                exhausted_status: env_or_default("EXHAUSTED_STATUS_CODE", "402")
                    .parse()
                    .context("Invalid EXHAUSTED_STATUS_CODE value")?,
            },

            pool: PoolSettings {
                min_api_keys: env_or_default("MIN_API_KEYS", "5")
                    .parse()
                    .context("Invalid MIN_API_KEYS value")?,
                key_creation_timeout_ms: env_or_default("KEY_CREATION_TIMEOUT", "300000")
                    .parse()
                    .unwrap_or(300_000),
                key_creation_lock_timeout_ms: env_or_default("KEY_CREATION_LOCK_TIMEOUT", "30000")
                    .parse()
                    .unwrap_or(30_000),
                key_creation_retry_delay_ms: env_or_default("KEY_CREATION_RETRY_DELAY", "1000")
                    .parse()
                    .unwrap_or(1_000),
                storage_key: env_or_default("API_KEYS_STORAGE_KEY", "huggingface_api_keys"),
                persist_policy: env_or_default("PERSIST_POLICY", "on_target")
                    .parse()
                    .context("Invalid PERSIST_POLICY value")?,
                persist_conflict_retries: env_or_default("PERSIST_CONFLICT_RETRIES", "2")
                    .parse()
                    .unwrap_or(2),
            },

            store: StoreSettings {
                backend: env_or_default("STORE_BACKEND", "github")
                    .parse()
                    .context("Invalid STORE_BACKEND value")?,
                github_access_token: non_empty_var("GITHUB_ACCESS_TOKEN"),
                github_username: non_empty_var("GITHUB_USERNAME"),
                github_repo: non_empty_var("GITHUB_REPO"),
                github_branch: env_or_default("GITHUB_BRANCH", "main"),
                github_api_url: env_or_default("GITHUB_API_URL", "https://api.github.com"),
                rot13: env_or_default("STORE_ROT13", "true").parse().unwrap_or(true),
            },

            provisioner: ProvisionerSettings {
                command: non_empty_var("PROVISIONER_COMMAND"),
                args: env_or_default("PROVISIONER_ARGS", "")
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.upstream.methods.is_empty() {
            anyhow::bail!("PROXY_METHODS must name at least one method");
        }
        if self.upstream.timeout_seconds == 0 {
            anyhow::bail!("UPSTREAM_TIMEOUT_SECONDS must be > 0");
        }
        self.upstream.exhausted_status()?;

        if self.pool.min_api_keys == 0 {
            anyhow::bail!("MIN_API_KEYS must be >= 1");
        }
        if self.pool.key_creation_timeout_ms == 0 || self.pool.key_creation_lock_timeout_ms == 0 {
            anyhow::bail!("KEY_CREATION_TIMEOUT and KEY_CREATION_LOCK_TIMEOUT must be > 0");
        }
        if self.pool.key_creation_lock_timeout_ms < self.pool.key_creation_timeout_ms {
            tracing::warn!(
                lock_timeout_ms = self.pool.key_creation_lock_timeout_ms,
                creation_timeout_ms = self.pool.key_creation_timeout_ms,
                "KEY_CREATION_LOCK_TIMEOUT is below KEY_CREATION_TIMEOUT; the lock is held for the full creation timeout"
            );
        }
        if self.pool.storage_key.trim_matches('/').is_empty() {
            anyhow::bail!("API_KEYS_STORAGE_KEY cannot be empty");
        }

        if self.store.backend == StoreBackend::Github {
            let missing: Vec<&str> = [
                ("GITHUB_ACCESS_TOKEN", &self.store.github_access_token),
                ("GITHUB_USERNAME", &self.store.github_username),
                ("GITHUB_REPO", &self.store.github_repo),
            ]
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name)
            .collect();

            if !missing.is_empty() {
                anyhow::bail!("GitHub store requires {}", missing.join(", "));
            }
        }

        if self.environment == Environment::Production && self.store.backend == StoreBackend::Memory {
            tracing::warn!("Running in production with the in-memory store; the pool will not survive restarts");
        }
        if self.provisioner.command.is_none() {
            tracing::warn!("PROVISIONER_COMMAND not set; the pool will only hold manually seeded keys");
        }

        Ok(())
    }

    /// Pool manager configuration derived from these settings
    ///
    /// The provisioning lock never goes stale before the provisioner call
    /// it guards has timed out.
    pub fn pool_config(&self) -> PoolConfig {
        let provision_timeout = Duration::from_millis(self.pool.key_creation_timeout_ms);
        let lock_stale_after = Duration::from_millis(self.pool.key_creation_lock_timeout_ms).max(provision_timeout);

        PoolConfig::new(self.pool.min_api_keys)
            .with_storage_key(self.pool.storage_key.clone())
            .with_provision_timeout(provision_timeout)
            .with_lock_stale_after(lock_stale_after)
            .with_retry_delay(Duration::from_millis(self.pool.key_creation_retry_delay_ms))
            .with_persist_policy(self.pool.persist_policy)
            .with_conflict_retry(presets::store_conflict(self.pool.persist_conflict_retries))
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "credential-relay".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Development,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            host: "0.0.0.0".to_string(),
            port: 7860,
            upstream: UpstreamConfig::default(),
            pool: PoolSettings::default(),
            store: StoreSettings::default(),
            provisioner: ProvisionerSettings::default(),
        }
    }
}

/// Helper function to get environment variable with default
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_methods(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_settings() -> Settings {
        Settings {
            store: StoreSettings {
                backend: StoreBackend::Memory,
                ..StoreSettings::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.app_name, "credential-relay");
        assert_eq!(settings.port, 7860);
        assert_eq!(settings.pool.min_api_keys, 5);
        assert_eq!(settings.pool.storage_key, "huggingface_api_keys");
        assert_eq!(settings.upstream.exhausted_status, 402);
        assert!(settings.store.rot13);
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("development".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_store_backend_and_log_format_parsing() {
        assert_eq!("GitHub".parse::<StoreBackend>().unwrap(), StoreBackend::Github);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("s3".parse::<StoreBackend>().is_err());
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
    }

    #[test]
    fn test_github_backend_requires_credentials() {
        let err = Settings::default().validate().unwrap_err();
        assert!(err.to_string().contains("GITHUB_ACCESS_TOKEN"));

        let mut settings = Settings::default();
        settings.store.github_access_token = Some("ghp_x".into());
        settings.store.github_username = Some("octo".into());
        settings.store.github_repo = Some("vault".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = memory_settings();
        assert!(settings.validate().is_ok());

        settings.pool.min_api_keys = 0;
        assert!(settings.validate().is_err());

        let mut settings = memory_settings();
        settings.upstream.exhausted_status = 1000;
        assert!(settings.validate().is_err());

        let mut settings = memory_settings();
        settings.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_lock_outlives_provisioner_call() {
        let config = Settings::default().pool_config();
        assert_eq!(config.provision_timeout, Duration::from_secs(300));
        assert_eq!(config.lock_stale_after, Duration::from_secs(300));

        let mut settings = memory_settings();
        settings.pool.key_creation_timeout_ms = 1_000;
        settings.pool.key_creation_lock_timeout_ms = 5_000;
        let config = settings.pool_config();
        assert_eq!(config.provision_timeout, Duration::from_secs(1));
        assert_eq!(config.lock_stale_after, Duration::from_secs(5));
    }

    #[test]
    fn test_upstream_helpers() {
        let upstream = UpstreamConfig {
            base_url: "https://router.example/".to_string(),
            methods: parse_methods("post, get"),
            ..UpstreamConfig::default()
        };

        assert!(upstream.allows(&Method::GET));
        assert!(upstream.allows(&Method::POST));
        assert!(!upstream.allows(&Method::DELETE));
        assert_eq!(
            upstream.target_url("/models/gpt2?wait=true"),
            "https://router.example/models/gpt2?wait=true"
        );
    }

    #[test]
    fn test_pool_config() {
        let mut settings = memory_settings();
        settings.pool.min_api_keys = 3;
        settings.pool.persist_conflict_retries = 4;

        let config = settings.pool_config();
        assert_eq!(config.min_active, 3);
        assert_eq!(config.provision_timeout, Duration::from_secs(300));
        assert_eq!(config.lock_stale_after, Duration::from_secs(30));
        assert_eq!(config.conflict_retry.max_retries, 4);
    }

    #[test]
    fn test_server_addr() {
        assert_eq!(Settings::default().server_addr(), "0.0.0.0:7860");
    }
}
