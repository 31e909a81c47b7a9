//! Credential provisioning
//!
//! A [`Provisioner`] mints one fresh upstream credential per call. Minting is
//! slow and fallible; callers bound it with a timeout and make sure only one
//! call is outstanding at a time.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

use crate::utils::{mask_secret, truncate_str};

const STDERR_LIMIT: usize = 512;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No provisioner configured")]
    NotConfigured,

    #[error("Failed to launch provisioner '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provisioner exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Provisioner produced no credential")]
    EmptyCredential,

    #[error("Provisioner timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Provisioning failed: {0}")]
    Failed(String),
}

/// Source of fresh upstream credentials
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Mint one credential
    async fn acquire(&self) -> Result<String, ProvisionError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

// ============================================================================
// External Command
// ============================================================================

/// Runs a program that prints a new credential on stdout
///
/// The last non-empty stdout line is taken as the token. A non-zero exit is a
/// failure and carries the (truncated) stderr.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    program: String,
    args: Vec<String>,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn acquire(&self) -> Result<String, ProvisionError> {
        tracing::debug!(program = %self.program, "Running provisioner");

        // Dropping the future (timeout) kills the child.
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisionError::Launch {
                command: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::CommandFailed {
                status: output.status.to_string(),
                stderr: truncate_str(stderr.trim(), STDERR_LIMIT).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let token = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or(ProvisionError::EmptyCredential)?
            .to_string();

        tracing::info!(
            program = %self.program,
            credential = %mask_secret(&token),
            "Provisioner produced a credential"
        );

        Ok(token)
    }

    fn describe(&self) -> String {
        format!("command:{}", self.program)
    }
}

// ============================================================================
// Disabled
// ============================================================================

/// Provisioner for pools that are seeded by hand
#[derive(Debug, Clone, Default)]
pub struct DisabledProvisioner;

#[async_trait]
impl Provisioner for DisabledProvisioner {
    async fn acquire(&self) -> Result<String, ProvisionError> {
        Err(ProvisionError::NotConfigured)
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provisioner_fails() {
        let err = DisabledProvisioner.acquire().await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotConfigured));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let provisioner = CommandProvisioner::new("/nonexistent/mint-credential", vec![]);
        let err = provisioner.acquire().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_last_stdout_line_is_token() {
        let provisioner = CommandProvisioner::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'signing up...'; echo 'hf_minted_token_0001'; echo".to_string(),
            ],
        );
        assert_eq!(provisioner.acquire().await.unwrap(), "hf_minted_token_0001");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let provisioner = CommandProvisioner::new(
            "sh",
            vec!["-c".to_string(), "echo 'captcha rejected' >&2; exit 3".to_string()],
        );
        match provisioner.acquire().await.unwrap_err() {
            ProvisionError::CommandFailed { stderr, .. } => assert_eq!(stderr, "captcha rejected"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_blank_output_is_empty_credential() {
        let provisioner = CommandProvisioner::new("sh", vec!["-c".to_string(), "echo '  '".to_string()]);
        assert!(matches!(
            provisioner.acquire().await,
            Err(ProvisionError::EmptyCredential)
        ));
    }

    #[test]
    fn test_describe() {
        assert_eq!(CommandProvisioner::new("mint", vec![]).describe(), "command:mint");
        assert_eq!(DisabledProvisioner.describe(), "disabled");
    }
}
