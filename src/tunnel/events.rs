//! Tunnel Event System
//!
//! Status, credential and lifecycle events for the presentation layer. Many
//! sessions share one process, so failures travel here rather than through
//! exit codes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::session::ConnectionInfo;
use super::state::SessionState;

/// Buffered events per subscriber before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TunnelEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        connection_id: String,
        state: SessionState,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Credentials {
        connection_id: String,
        info: ConnectionInfo,
    },
    #[serde(rename_all = "camelCase")]
    Disconnected {
        connection_id: String,
        reason: DisconnectReason,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        connection_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Manual disconnect or shutdown
    Manual,
    /// Budgets exhausted or a fatal error
    Error,
}

/// Per-connection event emitter
///
/// Wraps the registry's broadcast sender and stamps every event with the
/// connection id.
#[derive(Clone)]
pub struct TunnelEventEmitter {
    sender: broadcast::Sender<TunnelEvent>,
    connection_id: String,
}

impl TunnelEventEmitter {
    pub fn new(sender: broadcast::Sender<TunnelEvent>, connection_id: String) -> Self {
        Self { sender, connection_id }
    }

    pub fn emit(&self, event: TunnelEvent) {
        // Err only means there are no subscribers right now
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for tunnel event");
        }
    }

    pub fn emit_status(&self, state: SessionState, message: impl Into<String>) {
        self.emit(TunnelEvent::Status {
            connection_id: self.connection_id.clone(),
            state,
            message: message.into(),
        });
    }

    pub fn emit_credentials(&self, info: ConnectionInfo) {
        self.emit(TunnelEvent::Credentials {
            connection_id: self.connection_id.clone(),
            info,
        });
    }

    pub fn emit_disconnected(&self, reason: DisconnectReason) {
        self.emit(TunnelEvent::Disconnected {
            connection_id: self.connection_id.clone(),
            reason,
        });
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        self.emit(TunnelEvent::Error {
            connection_id: self.connection_id.clone(),
            message: message.into(),
        });
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl std::fmt::Debug for TunnelEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventEmitter")
            .field("connection_id", &self.connection_id)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
