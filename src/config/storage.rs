//! Configuration Storage
//!
//! Reads the project catalog and tunnel settings from disk.
//! Config location: ~/.rds-ssm-connect

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::project::ProjectDefinition;
use super::settings::TunnelSettings;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Get the configuration directory (~/.rds-ssm-connect)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".rds-ssm-connect"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the project catalog path
pub fn projects_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("projects.json"))
}

/// Get the tunnel settings path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Read-only view of `projects.json`
#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
}

impl ProjectStore {
    /// Store at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: projects_file()?,
        })
    }

    /// Store with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every project, keyed by project key.
    /// A missing file is an empty catalog; malformed JSON is an error.
    pub async fn load(&self) -> Result<BTreeMap<String, ProjectDefinition>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StorageError::Json {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Load a single project by key
    pub async fn get(&self, key: &str) -> Result<Option<ProjectDefinition>, StorageError> {
        Ok(self.load().await?.remove(key))
    }
}

/// Load tunnel settings.
/// Returns defaults if the file doesn't exist or is corrupted.
pub async fn load_settings(path: &Path) -> TunnelSettings {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<TunnelSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Settings file {:?} corrupted, using defaults: {}", path, e);
                TunnelSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => TunnelSettings::default(),
        Err(e) => {
            tracing::warn!("Failed to read settings {:?}, using defaults: {}", path, e);
            TunnelSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let store = ProjectStore::with_path(temp.path().join("projects.json"));

        let projects = store.load().await.unwrap();
        assert!(projects.is_empty());
    }

    #[tokio::test]
    async fn test_load_projects() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("projects.json");
        std::fs::write(
            &path,
            r#"{
                "emr": {
                    "name": "EMR",
                    "region": "us-east-2",
                    "database": "emr",
                    "secretPrefix": "emr/rds",
                    "rdsType": "cluster",
                    "rdsPattern": "rds-aurora",
                    "envPortMapping": {"dev": "5433", "perf-dev": "5440"},
                    "defaultPort": "5432"
                }
            }"#,
        )
        .unwrap();
        let store = ProjectStore::with_path(path);

        let project = store.get("emr").await.unwrap().unwrap();
        assert_eq!(project.name, "EMR");
        assert_eq!(project.local_port_for("emr-perf-dev").unwrap(), 5440);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_projects_is_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("projects.json");
        std::fs::write(&path, "{ not valid json }").unwrap();

        let err = ProjectStore::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::Json { .. }));
    }

    #[tokio::test]
    async fn test_corrupted_settings_fall_back_to_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "[1, 2").unwrap();

        assert_eq!(load_settings(&path).await, TunnelSettings::default());
        assert_eq!(
            load_settings(&temp.path().join("absent.json")).await,
            TunnelSettings::default()
        );
    }
}
