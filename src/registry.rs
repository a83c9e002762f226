//! Connection Registry
//!
//! Concurrent tunnels keyed by connection id. Each entry owns one
//! `TunnelSession` running on its own task; the registry only holds the
//! handles needed to observe and cancel it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aws::validate;
use crate::config::ProjectDefinition;
use crate::error::TunnelError;
use crate::tunnel::{
    ConnectionInfo, DisconnectReason, SessionDeps, SessionState, TunnelEvent, TunnelEventEmitter,
    TunnelSession, EVENT_CHANNEL_CAPACITY, LOCAL_HOST,
};

/// Upper bound on waiting for a session to finish tearing down
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Overrides the project's port mapping. Never auto-incremented.
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub connection_id: String,
    pub connection_info: ConnectionInfo,
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConnection {
    pub connection_id: String,
    pub project_key: String,
    pub profile: String,
    pub local_port: u16,
    pub state: SessionState,
    pub instance_id: Option<String>,
    pub rds_endpoint: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct ConnectionEntry {
    project_key: String,
    profile: String,
    local_port: u16,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    instance_id: Option<String>,
    rds_endpoint: Option<String>,
    connected_at: DateTime<Utc>,
}

/// `conn_` plus 8 hex digits
fn new_connection_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("conn_{}", &uuid[..8])
}

/// Whether the port can be bound on loopback right now
fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind((LOCAL_HOST, port)).is_ok()
}

pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, ConnectionEntry>>,
    /// Serializes the check-then-insert of port claims
    claim_lock: parking_lot::Mutex<()>,
    deps: SessionDeps,
    events: broadcast::Sender<TunnelEvent>,
}

impl ConnectionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: Arc::new(DashMap::new()),
            claim_lock: parking_lot::Mutex::new(()),
            deps,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Claim the port for `connection_id`, failing if another entry holds it
    /// or something outside the registry is listening on it.
    fn claim_port(&self, connection_id: &str, entry: ConnectionEntry) -> Result<(), TunnelError> {
        let _guard = self.claim_lock.lock();
        let port = entry.local_port;

        if let Some(holder) = self.connections.iter().find(|e| e.local_port == port) {
            warn!("Port {} already claimed by {}", port, holder.key());
            return Err(TunnelError::PortConflict(port));
        }
        if !port_is_free(port) {
            warn!("Port {} is in use outside the registry", port);
            return Err(TunnelError::PortConflict(port));
        }

        self.connections.insert(connection_id.to_string(), entry);
        Ok(())
    }

    /// Resolve infrastructure and start a supervised tunnel.
    ///
    /// The port is claimed before resolution starts so two concurrent
    /// requests can't both pass the check.
    pub async fn connect(
        &self,
        project_key: &str,
        project: ProjectDefinition,
        profile: &str,
        options: ConnectOptions,
    ) -> Result<ConnectResult, TunnelError> {
        validate::profile(profile)?;
        let local_port = match options.local_port {
            Some(0) => return Err(TunnelError::validation("localPort", "0")),
            Some(port) => port,
            None => project.local_port_for(profile)?,
        };

        let connection_id = new_connection_id();
        let cancel = CancellationToken::new();
        let events = TunnelEventEmitter::new(self.events.clone(), connection_id.clone());
        let mut session = TunnelSession::new(
            profile.to_string(),
            project,
            local_port,
            self.deps.clone(),
            events.clone(),
            cancel.clone(),
        );

        self.claim_port(
            &connection_id,
            ConnectionEntry {
                project_key: project_key.to_string(),
                profile: profile.to_string(),
                local_port,
                cancel: cancel.clone(),
                state: session.state(),
                instance_id: None,
                rds_endpoint: None,
                connected_at: Utc::now(),
            },
        )?;
        info!(
            "[{}] Connecting {} ({}) on localhost:{}",
            connection_id, project_key, profile, local_port
        );

        let info = match session.resolve().await {
            Ok(info) => info,
            Err(e) => {
                self.connections.remove(&connection_id);
                events.emit_error(e.to_string());
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            // Settles the session to Terminated for anyone waiting on it
            let _ = session.run().await;
            self.connections.remove(&connection_id);
            return Err(TunnelError::Cancelled);
        }

        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.instance_id = Some(info.instance_id.clone());
            entry.rds_endpoint = Some(info.rds_endpoint.clone());
        }
        events.emit_credentials(info.clone());

        let connections = self.connections.clone();
        let id = connection_id.clone();
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => events.emit_disconnected(DisconnectReason::Manual),
                Err(e) => {
                    events.emit_error(e.to_string());
                    events.emit_disconnected(DisconnectReason::Error);
                }
            }
            connections.remove(&id);
        });

        Ok(ConnectResult {
            connection_id,
            connection_info: info,
        })
    }

    /// Cancel a session and wait for its teardown. `false` for an unknown id.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let Some((cancel, state)) = self
            .connections
            .get(connection_id)
            .map(|e| (e.cancel.clone(), e.state.clone()))
        else {
            return false;
        };

        info!("[{}] Disconnecting", connection_id);
        cancel.cancel();
        self.await_teardown(connection_id, state).await;
        true
    }

    /// Wait for a cancelled session to settle. The entry (and its port claim)
    /// stays in place if the session is still tearing down at the deadline.
    async fn await_teardown(&self, connection_id: &str, mut state: watch::Receiver<SessionState>) {
        let settled = tokio::time::timeout(DISCONNECT_TIMEOUT, state.wait_for(|s| s.is_terminal()))
            .await
            .is_ok();
        if settled {
            self.connections.remove(connection_id);
        } else {
            warn!(
                "[{}] Session did not stop within {}s, leaving it to finish",
                connection_id,
                DISCONNECT_TIMEOUT.as_secs()
            );
        }
    }

    /// Disconnect everything. Returns how many sessions were stopped.
    pub async fn disconnect_all(&self) -> usize {
        let targets: Vec<(String, watch::Receiver<SessionState>)> = self
            .connections
            .iter()
            .map(|entry| {
                // Cancel first so teardowns overlap
                entry.cancel.cancel();
                (entry.key().clone(), entry.state.clone())
            })
            .collect();
        if targets.is_empty() {
            return 0;
        }
        info!("Disconnecting {} tunnel(s)", targets.len());

        for (id, state) in &targets {
            self.await_teardown(id, state.clone()).await;
        }
        targets.len()
    }

    pub fn status(&self) -> Vec<ActiveConnection> {
        let mut active: Vec<ActiveConnection> = self
            .connections
            .iter()
            .map(|entry| ActiveConnection {
                connection_id: entry.key().clone(),
                project_key: entry.project_key.clone(),
                profile: entry.profile.clone(),
                local_port: entry.local_port,
                state: *entry.state.borrow(),
                instance_id: entry.instance_id.clone(),
                rds_endpoint: entry.rds_endpoint.clone(),
                connected_at: entry.connected_at,
            })
            .collect();
        active.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        active
    }
}
