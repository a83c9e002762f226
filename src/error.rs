//! Tunnel error types

use thiserror::Error;

use crate::config::StorageError;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// No jump host / endpoint / credentials found, or a malformed secret.
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// A value failed its allow-list before being used in a command.
    #[error("Invalid {field}: {value:?}")]
    Validation { field: &'static str, value: String },

    #[error("Forwarding target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Forwarding session ended (exit code {exit_code:?})")]
    SessionEnded { exit_code: Option<i32> },

    #[error("{budget} budget exhausted after {attempts} attempts: {last}")]
    BudgetExhausted {
        budget: &'static str,
        attempts: u32,
        last: Box<TunnelError>,
    },

    #[error("Port {0} is not available. Close the application using it or change the port in project settings.")]
    PortConflict(u16),

    #[error("Connection was cancelled before it was established")]
    Cancelled,

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Failed to spawn forwarding process: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn validation(field: &'static str, value: impl Into<String>) -> Self {
        Self::Validation {
            field,
            value: value.into(),
        }
    }
}

// Errors travel to the front end as plain strings
impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&TunnelError::PortConflict(5440)).unwrap();
        assert!(json.starts_with("\"Port 5440 is not available"));
    }

    #[test]
    fn test_budget_message_includes_cause() {
        let err = TunnelError::BudgetExhausted {
            budget: "recovery",
            attempts: 2,
            last: Box::new(TunnelError::TargetUnreachable("i-0abc is not connected".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("recovery budget exhausted after 2 attempts"));
        assert!(msg.contains("i-0abc"));
    }
}
