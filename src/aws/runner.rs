//! Command Runner
//!
//! Runs a single AWS CLI query under a named identity via `aws-vault exec`.
//! Arguments are passed as an argv vector, never through a shell.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::validate;

/// Identity wrapper executable
pub const AWS_VAULT_BIN: &str = "aws-vault";
/// AWS CLI executable
pub const AWS_BIN: &str = "aws";

/// Executes control-plane queries. Never fails loudly: a failed or non-zero
/// command yields `None` and the caller decides what that means.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, profile: &str, args: &[String]) -> Option<String>;
}

/// Build `aws-vault exec <profile> -- aws <args…>`
pub fn aws_vault_command(profile: &str, aws_args: &[String]) -> Command {
    let mut cmd = Command::new(AWS_VAULT_BIN);
    cmd.arg("exec").arg(profile).arg("--").arg(AWS_BIN).args(aws_args);
    cmd
}

/// Production runner backed by `aws-vault` + `aws`
#[derive(Debug, Clone)]
pub struct AwsVaultRunner {
    timeout: Duration,
}

impl AwsVaultRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for AwsVaultRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CommandRunner for AwsVaultRunner {
    async fn run(&self, profile: &str, args: &[String]) -> Option<String> {
        if let Err(e) = validate::profile(profile) {
            warn!("Refusing to run aws query: {}", e);
            return None;
        }

        let mut cmd = aws_vault_command(profile, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("aws {} (profile {})", args.join(" "), profile);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to run {}: {}", AWS_VAULT_BIN, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "aws {} timed out after {}s",
                    args.first().map(String::as_str).unwrap_or_default(),
                    self.timeout.as_secs()
                );
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "aws query exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
