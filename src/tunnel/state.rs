//! Session states and exit classification

use serde::{Deserialize, Serialize};

use crate::process::SessionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Resolving,
    Forwarding,
    Recovering,
    Reconnecting,
    Terminated,
    Failed,
}

impl SessionState {
    /// `Terminated` and `Failed` are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resolving => "resolving",
            Self::Forwarding => "forwarding",
            Self::Recovering => "recovering",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a forwarding session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The user asked for it
    Manual,
    /// The jump host went away; replace it
    TargetUnreachable,
    /// Anything else, zero exit included
    SessionEnded,
}

pub fn classify(outcome: &SessionOutcome, manually_disconnected: bool) -> Exit {
    if manually_disconnected {
        Exit::Manual
    } else if outcome.target_unreachable() {
        Exit::TargetUnreachable
    } else {
        Exit::SessionEnded
    }
}
