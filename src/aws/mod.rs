//! AWS Module
//!
//! Control-plane queries issued through `aws-vault` and the AWS CLI.

pub mod prerequisites;
pub mod resolver;
pub mod runner;
pub mod validate;

#[cfg(test)]
pub(crate) mod fake;

pub use prerequisites::{check_prerequisites, PrerequisiteStatus, PrerequisitesResult};
pub use resolver::{parse_credentials, DbCredentials, InfrastructureResolver};
pub use runner::{aws_vault_command, AwsVaultRunner, CommandRunner};
