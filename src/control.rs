//! Control Service
//!
//! The surface a front end drives: project and profile listing, connect,
//! disconnect, status and the event stream.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::aws::{check_prerequisites, AwsVaultRunner, CommandRunner, PrerequisitesResult};
use crate::config::{load_settings, read_profiles, settings_file, ProjectStore};
use crate::error::TunnelError;
use crate::process::{Launcher, ProcessLauncher};
use crate::registry::{ActiveConnection, ConnectOptions, ConnectResult, ConnectionRegistry};
use crate::tunnel::{SessionDeps, TunnelEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub key: String,
    pub name: String,
}

pub struct TunnelService {
    projects: ProjectStore,
    /// `None` means the default AWS config location
    aws_config: Option<PathBuf>,
    registry: Arc<ConnectionRegistry>,
}

impl TunnelService {
    pub fn new(projects: ProjectStore, aws_config: Option<PathBuf>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            projects,
            aws_config,
            registry,
        }
    }

    /// Service wired to `aws-vault`, the real process launcher and the
    /// settings under `~/.rds-ssm-connect/`
    pub async fn from_default_config() -> Result<Self, TunnelError> {
        let settings = load_settings(&settings_file()?).await;
        let runner: Arc<dyn CommandRunner> = Arc::new(AwsVaultRunner::new(settings.command_timeout()));
        let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher::default());
        let registry = ConnectionRegistry::new(SessionDeps::new(runner, launcher, settings.retry));
        Ok(Self::new(ProjectStore::new()?, None, Arc::new(registry)))
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub async fn list_available_projects(&self) -> Result<Vec<ProjectSummary>, TunnelError> {
        let projects = self.projects.load().await?;
        Ok(projects
            .into_iter()
            .map(|(key, project)| ProjectSummary {
                key,
                name: project.name,
            })
            .collect())
    }

    /// Profiles from the AWS config that belong to the project
    pub async fn list_profiles_for_project(&self, project_key: &str) -> Result<Vec<String>, TunnelError> {
        let project = self
            .projects
            .get(project_key)
            .await?
            .ok_or_else(|| TunnelError::UnknownProject(project_key.to_string()))?;
        let profiles = read_profiles(self.aws_config.clone()).await?;
        Ok(profiles
            .into_iter()
            .filter(|profile| project.matches_profile(profile))
            .collect())
    }

    pub async fn connect(
        &self,
        project_key: &str,
        profile: &str,
        options: ConnectOptions,
    ) -> Result<ConnectResult, TunnelError> {
        let project = self
            .projects
            .get(project_key)
            .await?
            .ok_or_else(|| TunnelError::UnknownProject(project_key.to_string()))?;
        self.registry.connect(project_key, project, profile, options).await
    }

    /// Disconnect one connection, or all of them when `connection_id` is
    /// `None`. Returns the number of sessions stopped.
    pub async fn disconnect(&self, connection_id: Option<&str>) -> usize {
        match connection_id {
            Some(id) => usize::from(self.registry.disconnect(id).await),
            None => self.registry.disconnect_all().await,
        }
    }

    pub fn status(&self) -> Vec<ActiveConnection> {
        self.registry.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.registry.subscribe()
    }

    pub async fn check_prerequisites(&self) -> PrerequisitesResult {
        let result = check_prerequisites().await;
        if !result.all_installed {
            info!(
                "Missing prerequisites: {:?}",
                result
                    .prerequisites
                    .iter()
                    .filter(|p| !p.installed)
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::ScriptedRunner;
    use crate::config::RetryPolicy;
    use crate::process::fake::FakeLauncher;
    use tempfile::TempDir;

    const PROJECTS: &str = r#"{
        "emr": {
            "name": "EMR",
            "region": "us-east-2",
            "database": "emr",
            "secretPrefix": "emr/rds",
            "rdsType": "cluster",
            "rdsPattern": "rds-aurora",
            "envPortMapping": {"dev": "5433", "perf-dev": "5440"},
            "defaultPort": "5432",
            "profileFilter": "emr"
        },
        "billing": {
            "name": "Billing",
            "region": "eu-west-1",
            "database": "billing",
            "secretPrefix": "billing/db",
            "rdsType": "instance",
            "rdsPattern": "billing-db",
            "envPortMapping": {},
            "defaultPort": "3307",
            "engine": "mysql"
        }
    }"#;

    const AWS_CONFIG: &str = "\
[default]
region = us-east-1

[profile emr-dev]
region = us-east-2

[profile emr-perf-dev]
[profile billing-prod]
";

    fn service(dir: &TempDir) -> (TunnelService, Arc<FakeLauncher>, Arc<ScriptedRunner>) {
        let projects = dir.path().join("projects.json");
        std::fs::write(&projects, PROJECTS).unwrap();
        let aws_config = dir.path().join("config");
        std::fs::write(&aws_config, AWS_CONFIG).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let launcher = Arc::new(FakeLauncher::new());
        let registry = ConnectionRegistry::new(SessionDeps::new(
            runner.clone(),
            launcher.clone(),
            RetryPolicy::default(),
        ));
        (
            TunnelService::new(ProjectStore::with_path(projects), Some(aws_config), Arc::new(registry)),
            launcher,
            runner,
        )
    }

    #[tokio::test]
    async fn test_list_projects() {
        let dir = TempDir::new().unwrap();
        let (service, _, _) = service(&dir);
        let projects = service.list_available_projects().await.unwrap();
        assert_eq!(
            projects,
            vec![
                ProjectSummary {
                    key: "billing".into(),
                    name: "Billing".into()
                },
                ProjectSummary {
                    key: "emr".into(),
                    name: "EMR".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_profiles_filtered_by_project() {
        let dir = TempDir::new().unwrap();
        let (service, _, _) = service(&dir);

        let emr = service.list_profiles_for_project("emr").await.unwrap();
        assert_eq!(emr, vec!["emr-dev", "emr-perf-dev"]);

        let billing = service.list_profiles_for_project("billing").await.unwrap();
        assert_eq!(billing.len(), 4);

        assert!(matches!(
            service.list_profiles_for_project("nope").await,
            Err(TunnelError::UnknownProject(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_unknown_project() {
        let dir = TempDir::new().unwrap();
        let (service, launcher, runner) = service(&dir);
        let err = service
            .connect("nope", "emr-dev", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::UnknownProject(_)));
        assert_eq!(launcher.launches(), 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_without_connections() {
        let dir = TempDir::new().unwrap();
        let (service, _, _) = service(&dir);
        assert_eq!(service.disconnect(None).await, 0);
        assert_eq!(service.disconnect(Some("conn_00000000")).await, 0);
        assert!(service.status().is_empty());
    }
}
