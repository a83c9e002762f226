//! Project Definitions
//!
//! A project describes where a database lives: region, how to find the
//! bastion and the RDS resource, where the credentials are stored, and which
//! local port each environment gets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::TunnelError;

/// Default bastion Name-tag search pattern
pub const DEFAULT_BASTION_PATTERN: &str = "*bastion*";

/// Which RDS API family holds the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RdsType {
    /// Aurora cluster (`describe-db-clusters`)
    Cluster,
    /// Standalone instance (`describe-db-instances`)
    Instance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Postgres,
    Mysql,
}

impl DatabaseEngine {
    /// Port used when the RDS query does not report one
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
        }
    }
}

/// Immutable per-session description of a project (one entry of projects.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDefinition {
    /// Display name
    pub name: String,
    /// AWS region, e.g. `us-east-2`
    pub region: String,
    /// Database name handed to clients
    pub database: String,
    /// Secrets Manager name prefix holding `{username, password}`
    pub secret_prefix: String,
    pub rds_type: RdsType,
    /// Substring matched against the cluster / instance identifier
    pub rds_pattern: String,
    /// Environment-name suffix → local port (numeric strings)
    #[serde(default)]
    pub env_port_mapping: BTreeMap<String, String>,
    /// Local port used when no suffix matches
    pub default_port: String,
    #[serde(default)]
    pub engine: DatabaseEngine,
    /// EC2 Name-tag pattern for the jump host
    #[serde(default = "default_bastion_pattern")]
    pub bastion_pattern: String,
    /// Only profiles containing this substring are offered for the project
    #[serde(default)]
    pub profile_filter: Option<String>,
}

fn default_bastion_pattern() -> String {
    DEFAULT_BASTION_PATTERN.to_string()
}

impl ProjectDefinition {
    /// Remote port fallback for this project's engine
    pub fn default_remote_port(&self) -> u16 {
        self.engine.default_port()
    }

    /// Fixed local port for an environment (profile) name.
    ///
    /// The longest suffix in `env_port_mapping` that `env` ends with wins, so
    /// `myproj-perf-dev` picks `perf-dev` over `dev`. Falls back to
    /// `default_port`.
    pub fn local_port_for(&self, env: &str) -> Result<u16, TunnelError> {
        let mut suffixes: Vec<&String> = self.env_port_mapping.keys().collect();
        suffixes.sort_by(|a, b| b.len().cmp(&a.len()));

        match suffixes.into_iter().find(|suffix| env.ends_with(suffix.as_str())) {
            Some(suffix) => parse_port("envPortMapping", &self.env_port_mapping[suffix]),
            None => {
                tracing::debug!(
                    "No port mapping for environment {}, using default {}",
                    env,
                    self.default_port
                );
                parse_port("defaultPort", &self.default_port)
            }
        }
    }

    /// Whether a profile belongs to this project
    pub fn matches_profile(&self, profile: &str) -> bool {
        match &self.profile_filter {
            Some(filter) if !filter.is_empty() => profile.contains(filter.as_str()),
            _ => true,
        }
    }
}

/// Parse a numeric port string (1..=65535)
pub fn parse_port(field: &'static str, value: &str) -> Result<u16, TunnelError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TunnelError::validation(field, value));
    }
    match trimmed.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(TunnelError::validation(field, value)),
    }
}
