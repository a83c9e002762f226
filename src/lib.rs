//! rds-tunnel
//!
//! Keeps SSM port-forwarding tunnels to private RDS databases alive across
//! bastion replacement, idle timeouts and dropped sessions. Several tunnels
//! can run side by side, each on a fixed local port.

pub mod aws;
pub mod config;
pub mod control;
pub mod error;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod tunnel;
pub mod wait;

pub use control::{ProjectSummary, TunnelService};
pub use error::TunnelError;
pub use registry::{ActiveConnection, ConnectOptions, ConnectResult, ConnectionRegistry};
pub use tunnel::{ConnectionInfo, SessionState, TunnelEvent};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the fmt subscriber, honouring `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
