//! Tunnel Settings
//!
//! Retry budgets and timer intervals. Every field has a default so a partial
//! (or absent) `settings.json` is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and polling policy for one tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Jump-host replacements attempted after a target-unreachable exit
    pub max_recovery_attempts: u32,
    /// Reconnects attempted after any other unexpected session end
    pub max_reconnect_attempts: u32,
    /// Fixed wait before a reconnect (ms)
    pub reconnect_delay_ms: u64,
    /// Polls for a replacement jump host
    pub replacement_poll_attempts: u32,
    pub replacement_poll_interval_ms: u64,
    /// Polls for SSM agent `Online`
    pub agent_poll_attempts: u32,
    pub agent_poll_interval_ms: u64,
    /// Grace period after the agent reports online (ms)
    pub agent_stabilization_ms: u64,
    /// Keepalive connect interval; must stay below the SSM idle timeout (20 min)
    pub keepalive_interval_ms: u64,
    /// A forwarding session that stayed up this long resets both budgets
    pub stable_session_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 2,
            max_reconnect_attempts: 20,
            reconnect_delay_ms: 5_000,
            replacement_poll_attempts: 20,
            replacement_poll_interval_ms: 15_000,
            agent_poll_attempts: 20,
            agent_poll_interval_ms: 15_000,
            agent_stabilization_ms: 10_000,
            keepalive_interval_ms: 4 * 60 * 1000,
            stable_session_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn replacement_poll_interval(&self) -> Duration {
        Duration::from_millis(self.replacement_poll_interval_ms)
    }

    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.agent_poll_interval_ms)
    }

    pub fn agent_stabilization(&self) -> Duration {
        Duration::from_millis(self.agent_stabilization_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn stable_session(&self) -> Duration {
        Duration::from_millis(self.stable_session_ms)
    }
}

/// Contents of `settings.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelSettings {
    pub retry: RetryPolicy,
    /// Timeout for each control-plane query (ms)
    pub command_timeout_ms: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            command_timeout_ms: 60_000,
        }
    }
}

impl TunnelSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
