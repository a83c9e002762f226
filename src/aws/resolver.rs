//! Infrastructure Resolver
//!
//! Locates the running bastion, the RDS endpoint and port, the database
//! credentials, and SSM agent liveness. Also drives bastion replacement:
//! terminate, then poll until the auto-scaling group brings up a new one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::CommandRunner;
use super::validate;
use crate::config::{ProjectDefinition, RdsType};
use crate::error::TunnelError;
use crate::wait::{sleep_or_cancel, Poll};

/// Database username/password pair from Secrets Manager
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Deserialize)]
struct SecretPayload {
    #[serde(alias = "user")]
    username: Option<String>,
    password: Option<String>,
}

/// Parse a secret string into credentials.
/// Accepts `username` or `user`; both fields must be non-empty.
pub fn parse_credentials(secret: &str) -> Result<DbCredentials, TunnelError> {
    let payload: SecretPayload = serde_json::from_str(secret)
        .map_err(|e| TunnelError::Resolution(format!("Malformed credentials payload: {}", e)))?;

    match (payload.username, payload.password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Ok(DbCredentials { username, password })
        }
        _ => Err(TunnelError::Resolution(
            "Credentials payload is missing username or password".into(),
        )),
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// First whitespace-separated token, or `None` for the "nothing found" sentinel
fn first_value(output: Option<String>) -> Option<String> {
    let output = output?;
    let first = output.split_whitespace().next()?.to_string();
    if validate::is_none_sentinel(&first) {
        None
    } else {
        Some(first)
    }
}

/// Resolves infrastructure identity through a `CommandRunner`
#[derive(Clone)]
pub struct InfrastructureResolver {
    runner: Arc<dyn CommandRunner>,
    /// Polling used to confirm a replacement's agent
    agent_poll: Poll,
    /// Grace period after the agent first reports `Online`
    stabilization: Duration,
}

impl InfrastructureResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, agent_poll: Poll, stabilization: Duration) -> Self {
        Self {
            runner,
            agent_poll,
            stabilization,
        }
    }

    /// Find the first running instance whose Name tag matches `pattern`
    pub async fn find_jump_host(
        &self,
        profile: &str,
        region: &str,
        pattern: &str,
    ) -> Result<String, TunnelError> {
        validate::profile(profile)?;
        validate::region(region)?;
        validate::search_pattern(pattern)?;

        let output = self
            .runner
            .run(
                profile,
                &args(&[
                    "ec2",
                    "describe-instances",
                    "--region",
                    region,
                    "--filters",
                    &format!("Name=tag:Name,Values={}", pattern),
                    "Name=instance-state-name,Values=running",
                    "--query",
                    "Reservations[].Instances[].InstanceId",
                    "--output",
                    "text",
                ]),
            )
            .await;

        let instance_id = first_value(output).ok_or_else(|| {
            TunnelError::Resolution(format!("No running jump host matching {}", pattern))
        })?;
        validate::instance_id(&instance_id)?;
        debug!("Resolved jump host {} for {}", instance_id, profile);
        Ok(instance_id)
    }

    /// Endpoint hostname of the first available cluster/instance matching the pattern
    pub async fn database_endpoint(
        &self,
        profile: &str,
        project: &ProjectDefinition,
    ) -> Result<String, TunnelError> {
        let query = self.rds_query(profile, project, RdsField::Endpoint)?;
        let endpoint = first_value(self.runner.run(profile, &query).await).ok_or_else(|| {
            TunnelError::Resolution(format!(
                "No available RDS {:?} matching {}",
                project.rds_type, project.rds_pattern
            ))
        })?;
        validate::hostname(&endpoint)?;
        Ok(endpoint)
    }

    /// Remote database port; falls back to the engine default
    pub async fn database_port(
        &self,
        profile: &str,
        project: &ProjectDefinition,
    ) -> Result<u16, TunnelError> {
        let query = self.rds_query(profile, project, RdsField::Port)?;
        let port = first_value(self.runner.run(profile, &query).await)
            .and_then(|value| value.parse::<u16>().ok())
            .filter(|port| *port > 0);

        Ok(port.unwrap_or_else(|| {
            debug!(
                "No port reported for {}, using engine default {}",
                project.rds_pattern,
                project.default_remote_port()
            );
            project.default_remote_port()
        }))
    }

    fn rds_query(
        &self,
        profile: &str,
        project: &ProjectDefinition,
        field: RdsField,
    ) -> Result<Vec<String>, TunnelError> {
        validate::profile(profile)?;
        validate::region(&project.region)?;
        validate::search_pattern(&project.rds_pattern)?;

        let (operation, query) = match project.rds_type {
            RdsType::Cluster => (
                "describe-db-clusters",
                format!(
                    "DBClusters[?contains(DBClusterIdentifier, '{}') && Status=='available'].{}",
                    project.rds_pattern,
                    match field {
                        RdsField::Endpoint => "Endpoint",
                        RdsField::Port => "Port",
                    }
                ),
            ),
            RdsType::Instance => (
                "describe-db-instances",
                format!(
                    "DBInstances[?contains(DBInstanceIdentifier, '{}') && DBInstanceStatus=='available'].{}",
                    project.rds_pattern,
                    match field {
                        RdsField::Endpoint => "Endpoint.Address",
                        RdsField::Port => "Endpoint.Port",
                    }
                ),
            ),
        };

        Ok(args(&[
            "rds",
            operation,
            "--region",
            &project.region,
            "--query",
            &query,
            "--output",
            "text",
        ]))
    }

    /// Fetch `{username, password}` from the first secret under the project's prefix
    pub async fn credentials(
        &self,
        profile: &str,
        project: &ProjectDefinition,
    ) -> Result<DbCredentials, TunnelError> {
        validate::profile(profile)?;
        validate::region(&project.region)?;
        validate::secret_prefix(&project.secret_prefix)?;

        let listed = self
            .runner
            .run(
                profile,
                &args(&[
                    "secretsmanager",
                    "list-secrets",
                    "--region",
                    &project.region,
                    "--filters",
                    &format!("Key=name,Values={}", project.secret_prefix),
                    "--query",
                    "SecretList[].Name",
                    "--output",
                    "text",
                ]),
            )
            .await;

        let secret_name = first_value(listed).ok_or_else(|| {
            TunnelError::Resolution(format!(
                "No credentials secret found with prefix {}",
                project.secret_prefix
            ))
        })?;
        validate::secret_prefix(&secret_name)?;

        let secret = self
            .runner
            .run(
                profile,
                &args(&[
                    "secretsmanager",
                    "get-secret-value",
                    "--region",
                    &project.region,
                    "--secret-id",
                    &secret_name,
                    "--query",
                    "SecretString",
                    "--output",
                    "text",
                ]),
            )
            .await
            .ok_or_else(|| {
                TunnelError::Resolution(format!("Failed to read secret {}", secret_name))
            })?;

        parse_credentials(&secret)
    }

    /// Whether the SSM agent on `instance_id` currently reports `Online`
    pub async fn agent_online(&self, profile: &str, instance_id: &str, region: &str) -> bool {
        if validate::instance_id(instance_id).is_err() || validate::region(region).is_err() {
            return false;
        }
        let status = self
            .runner
            .run(
                profile,
                &args(&[
                    "ssm",
                    "describe-instance-information",
                    "--region",
                    region,
                    "--filters",
                    &format!("Key=InstanceIds,Values={}", instance_id),
                    "--query",
                    "InstanceInformationList[0].PingStatus",
                    "--output",
                    "text",
                ]),
            )
            .await;
        matches!(status.as_deref(), Some(s) if s.trim() == "Online")
    }

    /// Poll agent status until `Online`, then wait one stabilization period.
    ///
    /// The agent reports online slightly before it accepts port-forwarding
    /// sessions; skipping the grace period makes the first session fail.
    pub async fn wait_for_agent_ready(
        &self,
        profile: &str,
        instance_id: &str,
        region: &str,
        poll: Poll,
        cancel: &CancellationToken,
    ) -> bool {
        for attempt in 1..=poll.attempts {
            if cancel.is_cancelled() {
                return false;
            }
            if self.agent_online(profile, instance_id, region).await {
                info!(
                    "SSM agent on {} online (attempt {}/{}), stabilizing for {}s",
                    instance_id,
                    attempt,
                    poll.attempts,
                    self.stabilization.as_secs()
                );
                return sleep_or_cancel(self.stabilization, cancel).await;
            }
            debug!(
                "SSM agent on {} not online yet ({}/{})",
                instance_id, attempt, poll.attempts
            );
            if attempt < poll.attempts && !sleep_or_cancel(poll.interval, cancel).await {
                return false;
            }
        }
        warn!(
            "SSM agent on {} did not come online after {} attempts",
            instance_id, poll.attempts
        );
        false
    }

    /// Poll for a running bastion different from `old_instance_id`, then
    /// confirm its agent. `None` after `poll.attempts` or on cancellation.
    pub async fn wait_for_replacement_jump_host(
        &self,
        profile: &str,
        old_instance_id: &str,
        region: &str,
        pattern: &str,
        poll: Poll,
        cancel: &CancellationToken,
    ) -> Option<String> {
        for attempt in 1..=poll.attempts {
            if !sleep_or_cancel(poll.interval, cancel).await {
                return None;
            }

            match self.find_jump_host(profile, region, pattern).await {
                Ok(instance_id) if instance_id != old_instance_id => {
                    info!(
                        "Replacement jump host {} found (attempt {}/{})",
                        instance_id, attempt, poll.attempts
                    );
                    if self
                        .wait_for_agent_ready(profile, &instance_id, region, self.agent_poll, cancel)
                        .await
                    {
                        return Some(instance_id);
                    }
                    if cancel.is_cancelled() {
                        return None;
                    }
                }
                Ok(_) => debug!(
                    "Still seeing old jump host {} ({}/{})",
                    old_instance_id, attempt, poll.attempts
                ),
                Err(e) => debug!("No replacement yet ({}/{}): {}", attempt, poll.attempts, e),
            }
        }
        warn!(
            "No replacement for jump host {} after {} attempts",
            old_instance_id, poll.attempts
        );
        None
    }

    /// Ask EC2 to terminate the bastion; the auto-scaling group replaces it
    pub async fn terminate_jump_host(&self, profile: &str, instance_id: &str, region: &str) {
        if let Err(e) = validate::instance_id(instance_id).and(validate::region(region)) {
            warn!("Not terminating jump host: {}", e);
            return;
        }
        let result = self
            .runner
            .run(
                profile,
                &args(&[
                    "ec2",
                    "terminate-instances",
                    "--region",
                    region,
                    "--instance-ids",
                    instance_id,
                ]),
            )
            .await;
        match result {
            Some(_) => info!("Requested termination of jump host {}", instance_id),
            None => warn!("Terminate request for jump host {} failed", instance_id),
        }
    }
}

#[derive(Clone, Copy)]
enum RdsField {
    Endpoint,
    Port,
}
