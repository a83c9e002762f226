//! Checks that the external tools the tunnel shells out to are installed.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

use super::runner::{AWS_BIN, AWS_VAULT_BIN};

pub const SSM_PLUGIN_BIN: &str = "session-manager-plugin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteStatus {
    pub name: String,
    pub installed: bool,
    pub version: Option<String>,
    pub install_url: String,
    pub install_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisitesResult {
    pub all_installed: bool,
    pub prerequisites: Vec<PrerequisiteStatus>,
}

struct Tool {
    name: &'static str,
    binary: &'static str,
    install_url: &'static str,
    install_command: Option<&'static str>,
    /// Keep only the first token of `--version` output
    first_token: bool,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "aws-vault",
        binary: AWS_VAULT_BIN,
        install_url: "https://github.com/99designs/aws-vault#installing",
        install_command: Some("brew install aws-vault"),
        first_token: false,
    },
    Tool {
        name: "AWS CLI",
        binary: AWS_BIN,
        install_url: "https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html",
        install_command: Some("brew install awscli"),
        first_token: true,
    },
    Tool {
        name: "Session Manager Plugin",
        binary: SSM_PLUGIN_BIN,
        install_url: "https://docs.aws.amazon.com/systems-manager/latest/userguide/session-manager-working-with-install-plugin.html",
        install_command: None,
        first_token: false,
    },
];

async fn installed_version(binary: &str) -> Option<String> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    // Older AWS CLI builds print the version on stderr
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    Some(String::from_utf8_lossy(&text).trim().to_string())
}

fn status_for(tool: &Tool, version: Option<String>) -> PrerequisiteStatus {
    let version = version.map(|v| {
        if tool.first_token {
            v.split_whitespace().next().unwrap_or_default().to_string()
        } else {
            v
        }
    });
    PrerequisiteStatus {
        name: tool.name.to_string(),
        installed: version.is_some(),
        version,
        install_url: tool.install_url.to_string(),
        install_command: tool.install_command.map(str::to_string),
    }
}

/// Run `--version` for aws-vault, the AWS CLI and the Session Manager plugin
pub async fn check_prerequisites() -> PrerequisitesResult {
    let mut prerequisites = Vec::with_capacity(TOOLS.len());
    for tool in TOOLS {
        let version = installed_version(tool.binary).await;
        tracing::debug!("{}: {:?}", tool.name, version);
        prerequisites.push(status_for(tool, version));
    }

    PrerequisitesResult {
        all_installed: prerequisites.iter().all(|p| p.installed),
        prerequisites,
    }
}
