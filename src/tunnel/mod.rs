//! Tunnel Module
//!
//! Per-connection session state machine, keepalive and events.

pub mod events;
pub mod keepalive;
pub mod session;
pub mod state;

pub use events::{DisconnectReason, TunnelEvent, TunnelEventEmitter, EVENT_CHANNEL_CAPACITY};
pub use keepalive::KeepaliveHandle;
pub use session::{ConnectionInfo, SessionDeps, TunnelSession, LOCAL_HOST};
pub use state::{classify, Exit, SessionState};
