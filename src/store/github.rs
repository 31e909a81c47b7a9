//! GitHub contents API backend
//!
//! Each logical key is a file in a repository branch. Writes carry the blob
//! sha observed just before the write; GitHub refuses the update when the file
//! moved on in the meantime, which surfaces as [`StorageError::Conflict`].

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{sanitize_key, BlobCodec, CredentialStore, StorageError};

const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

/// Connection settings for the GitHub store
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// API root, overridable for GitHub Enterprise or tests
    pub api_url: String,
    pub timeout: Duration,
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            branch: "main".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    Listing(Vec<serde_json::Value>),
    Entry(ContentEntry),
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
    branch: &'a str,
}

#[derive(Debug, Serialize)]
struct DeleteContents<'a> {
    message: String,
    sha: String,
    branch: &'a str,
}

// ============================================================================
// Store
// ============================================================================

/// Credential store backed by files in a GitHub repository
pub struct GitHubContentStore {
    client: Client,
    config: GitHubConfig,
    codec: BlobCodec,
}

impl GitHubContentStore {
    pub fn new(config: GitHubConfig, codec: BlobCodec) -> Result<Self, StorageError> {
        let client = Client::builder()
            .user_agent(concat!("credential-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        tracing::info!(
            owner = %config.owner,
            repo = %config.repo,
            branch = %config.branch,
            transform = ?codec.transform(),
            "Initialized GitHub credential store"
        );

        Ok(Self {
            client,
            config,
            codec,
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.contents_url(path))
            .bearer_auth(&self.config.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Fetch the file entry at `path`, or `None` if it does not exist
    async fn fetch_entry(&self, path: &str) -> Result<Option<ContentEntry>, StorageError> {
        let response = self
            .request(Method::GET, path)
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        match response.json::<ContentsResponse>().await? {
            ContentsResponse::Listing(_) => Err(StorageError::UnexpectedContent {
                path: path.to_string(),
                detail: "directory found instead of file".to_string(),
            }),
            ContentsResponse::Entry(entry) if entry.kind != "file" => {
                Err(StorageError::UnexpectedContent {
                    path: path.to_string(),
                    detail: format!("expected a file, found {}", entry.kind),
                })
            }
            ContentsResponse::Entry(entry) => Ok(Some(entry)),
        }
    }
}

#[async_trait]
impl CredentialStore for GitHubContentStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = sanitize_key(key);
        match self.fetch_entry(&path).await? {
            Some(entry) => {
                let value = self.codec.decode(entry.content.as_deref().unwrap_or_default())?;
                tracing::debug!(path = %path, sha = %entry.sha, "Read blob from GitHub");
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = sanitize_key(key);
        let sha = self.fetch_entry(&path).await?.map(|entry| entry.sha);

        let body = PutContents {
            message: format!("Update key: {}", key),
            content: self.codec.encode(value),
            sha,
            branch: &self.config.branch,
        };

        let response = self.request(Method::PUT, &path).json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            tracing::debug!(path = %path, created = body.sha.is_none(), "Wrote blob to GitHub");
            return Ok(());
        }

        let error = rejected(response).await;
        if is_stale_write(status, &error) {
            return Err(StorageError::Conflict(key.to_string()));
        }
        Err(error)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = sanitize_key(key);
        let Some(entry) = self.fetch_entry(&path).await? else {
            return Ok(false);
        };

        let body = DeleteContents {
            message: format!("Delete key: {}", key),
            sha: entry.sha,
            branch: &self.config.branch,
        };

        let response = self.request(Method::DELETE, &path).json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let error = rejected(response).await;
        if is_stale_write(status, &error) {
            return Err(StorageError::Conflict(key.to_string()));
        }
        Err(error)
    }

    fn backend(&self) -> &'static str {
        "github"
    }
}

async fn rejected(response: Response) -> StorageError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    StorageError::Rejected { status, message }
}

/// GitHub answers 409 for a sha mismatch and 422 when a sha was required but
/// missing (the file appeared between our read and our write).
fn is_stale_write(status: StatusCode, error: &StorageError) -> bool {
    match (status, error) {
        (StatusCode::CONFLICT, _) => true,
        (StatusCode::UNPROCESSABLE_ENTITY, StorageError::Rejected { message, .. }) => {
            message.contains("sha")
        }
        _ => false,
    }
}
