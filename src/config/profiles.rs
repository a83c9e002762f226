//! AWS Profile Source
//!
//! Enumerates identity profile names from the AWS CLI config file. Only the
//! bracketed section headers are read; everything else is opaque.

use std::path::PathBuf;
use tokio::fs;

use super::storage::StorageError;

/// Get the AWS config path (honours `AWS_CONFIG_FILE`)
pub fn aws_config_path() -> Result<PathBuf, StorageError> {
    if let Some(path) = std::env::var_os("AWS_CONFIG_FILE") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".aws").join("config"))
        .ok_or(StorageError::NoConfigDir)
}

/// Read profile names from an AWS config file. Missing file ⇒ no profiles.
pub async fn read_profiles(path: Option<PathBuf>) -> Result<Vec<String>, StorageError> {
    let path = match path {
        Some(p) => p,
        None => aws_config_path()?,
    };

    let content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e)),
    };

    Ok(parse_profiles(&content))
}

/// Parse `[profile name]` / `[name]` headers
pub fn parse_profiles(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('[') && line.ends_with(']'))
        .map(|line| {
            let inner = line[1..line.len() - 1].trim();
            inner.strip_prefix("profile ").unwrap_or(inner).trim().to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profiles() {
        let content = "\n[profile dev]\nregion = us-east-2\n\n[profile stage]\nregion = us-east-2\n\n[default]\nregion = us-east-1\n";
        assert_eq!(parse_profiles(content), vec!["dev", "stage", "default"]);
    }

    #[test]
    fn test_empty_config() {
        assert!(parse_profiles("").is_empty());
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let content = "[profile valid-env]\r\nregion = us-east-2\r\n\r\nthis is not a profile\r\n[another-invalid\r\n\r\n[profile another-valid]\r\n";
        assert_eq!(parse_profiles(content), vec!["valid-env", "another-valid"]);
    }

    #[tokio::test]
    async fn test_missing_file_has_no_profiles() {
        let temp = tempfile::tempdir().unwrap();
        let profiles = read_profiles(Some(temp.path().join("config"))).await.unwrap();
        assert!(profiles.is_empty());
    }
}
