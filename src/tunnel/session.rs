//! Tunnel Session
//!
//! One tunnel's lifecycle:
//!
//! ```text
//! Resolving -> Forwarding -> { Recovering | Reconnecting } -> Forwarding -> ... -> Terminated
//!                                                                 (Failed from anywhere)
//! ```
//!
//! The local port is fixed when the session is created and never changes;
//! only the jump host and the database endpoint are re-resolved. Every wait
//! is cancellable, and a forwarding process is always torn down before the
//! session moves on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::TunnelEventEmitter;
use super::keepalive;
use super::state::{classify, Exit, SessionState};
use crate::aws::{CommandRunner, InfrastructureResolver};
use crate::config::{ProjectDefinition, RetryPolicy};
use crate::error::TunnelError;
use crate::process::{ForwardRequest, Launcher, SessionOutcome};
use crate::wait::{sleep_or_cancel, Poll};

/// Loopback address the forwarder listens on
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Bound on waiting for a killed process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What a client needs to connect through the tunnel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub rds_endpoint: String,
    pub instance_id: String,
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("rds_endpoint", &self.rds_endpoint)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// Collaborators shared by every session of a registry
#[derive(Clone)]
pub struct SessionDeps {
    pub resolver: InfrastructureResolver,
    pub launcher: Arc<dyn Launcher>,
    pub policy: RetryPolicy,
}

impl SessionDeps {
    pub fn new(runner: Arc<dyn CommandRunner>, launcher: Arc<dyn Launcher>, policy: RetryPolicy) -> Self {
        let agent_poll = Poll::new(policy.agent_poll_attempts, policy.agent_poll_interval());
        Self {
            resolver: InfrastructureResolver::new(runner, agent_poll, policy.agent_stabilization()),
            launcher,
            policy,
        }
    }
}

enum Flow {
    Forward,
    Stop,
}

pub struct TunnelSession {
    profile: String,
    project: ProjectDefinition,
    local_port: u16,
    deps: SessionDeps,
    events: TunnelEventEmitter,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,

    instance_id: String,
    endpoint: String,
    remote_port: u16,
    recovery_attempts: u32,
    reconnect_attempts: u32,
}

impl TunnelSession {
    pub fn new(
        profile: String,
        project: ProjectDefinition,
        local_port: u16,
        deps: SessionDeps,
        events: TunnelEventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let remote_port = project.default_remote_port();
        let (state, _) = watch::channel(SessionState::Resolving);
        Self {
            profile,
            project,
            local_port,
            deps,
            events,
            cancel,
            state,
            instance_id: String::new(),
            endpoint: String::new(),
            remote_port,
            recovery_attempts: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState, message: impl Into<String>) {
        let message = message.into();
        self.state.send_replace(state);
        info!("[{}] {}: {}", self.events.connection_id(), state, message);
        self.events.emit_status(state, message);
    }

    fn fail(&self, err: &TunnelError) {
        error!("[{}] Tunnel failed: {}", self.events.connection_id(), err);
        self.set_state(SessionState::Failed, err.to_string());
    }

    /// Credentials, jump host, endpoint and remote port. Nothing is spawned
    /// here; on error the session is `Failed`.
    pub async fn resolve(&mut self) -> Result<ConnectionInfo, TunnelError> {
        self.set_state(
            SessionState::Resolving,
            format!("Resolving infrastructure for {}", self.profile),
        );
        match self.resolve_all().await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn resolve_all(&mut self) -> Result<ConnectionInfo, TunnelError> {
        let credentials = self
            .deps
            .resolver
            .credentials(&self.profile, &self.project)
            .await?;
        self.resolve_route().await?;

        Ok(ConnectionInfo {
            host: LOCAL_HOST.to_string(),
            port: self.local_port,
            username: credentials.username,
            password: credentials.password,
            database: self.project.database.clone(),
            rds_endpoint: self.endpoint.clone(),
            instance_id: self.instance_id.clone(),
        })
    }

    /// Jump host, endpoint and remote port; the parts that can change
    async fn resolve_route(&mut self) -> Result<(), TunnelError> {
        let resolver = &self.deps.resolver;
        self.instance_id = resolver
            .find_jump_host(&self.profile, &self.project.region, &self.project.bastion_pattern)
            .await?;
        self.endpoint = resolver.database_endpoint(&self.profile, &self.project).await?;
        self.remote_port = resolver.database_port(&self.profile, &self.project).await?;
        debug!(
            "[{}] Route: {} -> {}:{}",
            self.events.connection_id(),
            self.instance_id,
            self.endpoint,
            self.remote_port
        );
        Ok(())
    }

    /// Forward until manually disconnected (`Ok`) or a budget runs out or a
    /// fatal error occurs (`Err`). Call after a successful [`resolve`](Self::resolve).
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let result = self.forward_loop().await;
        match &result {
            Ok(()) => self.set_state(SessionState::Terminated, "Disconnected"),
            Err(e) => self.fail(e),
        }
        result
    }

    async fn forward_loop(&mut self) -> Result<(), TunnelError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.set_state(
                SessionState::Forwarding,
                format!(
                    "Forwarding localhost:{} -> {}:{} via {}",
                    self.local_port, self.endpoint, self.remote_port, self.instance_id
                ),
            );

            let Some(outcome) = self.forward_once().await? else {
                return Ok(());
            };

            if outcome
                .established_for
                .is_some_and(|uptime| uptime >= self.deps.policy.stable_session())
                && (self.recovery_attempts > 0 || self.reconnect_attempts > 0)
            {
                debug!("[{}] Session was stable, resetting retry counters", self.events.connection_id());
                self.recovery_attempts = 0;
                self.reconnect_attempts = 0;
            }

            let flow = match classify(&outcome, self.cancel.is_cancelled()) {
                Exit::Manual => Flow::Stop,
                Exit::TargetUnreachable => self.recover(&outcome).await?,
                Exit::SessionEnded => self.reconnect(&outcome).await?,
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
    }

    /// One forwarding process, from launch to teardown. `None` if the
    /// session was cancelled while it ran.
    async fn forward_once(&mut self) -> Result<Option<SessionOutcome>, TunnelError> {
        let request = ForwardRequest {
            profile: self.profile.clone(),
            region: self.project.region.clone(),
            instance_id: self.instance_id.clone(),
            endpoint: self.endpoint.clone(),
            remote_port: self.remote_port,
            local_port: self.local_port,
        };
        let mut process = self.deps.launcher.launch(&request).await?;

        // Disconnect may have landed while the process was starting
        if self.cancel.is_cancelled() {
            process.kill_tree().await;
            return Ok(None);
        }

        let keepalive = keepalive::start(self.local_port, self.deps.policy.keepalive_interval());
        let announcer = {
            let mut established = process.established();
            let events = self.events.clone();
            let port = self.local_port;
            tokio::spawn(async move {
                if established.wait_for(|up| *up).await.is_ok() {
                    info!("[{}] Tunnel established on localhost:{}", events.connection_id(), port);
                    events.emit_status(
                        SessionState::Forwarding,
                        format!("Tunnel established on localhost:{}", port),
                    );
                }
            })
        };

        let outcome = tokio::select! {
            outcome = process.wait() => Some(outcome),
            _ = self.cancel.cancelled() => None,
        };

        keepalive.stop();
        announcer.abort();
        process.kill_tree().await;
        if outcome.is_none() && tokio::time::timeout(REAP_TIMEOUT, process.wait()).await.is_err() {
            warn!(
                "[{}] Forwarding process {:?} did not exit after teardown",
                self.events.connection_id(),
                process.pid()
            );
        }

        if let Some(ref outcome) = outcome {
            debug!(
                "[{}] Forwarding process {:?} exited with {:?} (established: {})",
                self.events.connection_id(),
                process.pid(),
                outcome.exit_code,
                outcome.established
            );
        }
        Ok(outcome)
    }

    /// Terminate the dead jump host and wait for the auto-scaling group to
    /// bring up a replacement.
    async fn recover(&mut self, outcome: &SessionOutcome) -> Result<Flow, TunnelError> {
        let policy = &self.deps.policy;
        let cause = TunnelError::TargetUnreachable(format!(
            "{}: {}",
            self.instance_id,
            outcome.stderr.trim()
        ));
        if self.recovery_attempts >= policy.max_recovery_attempts {
            return Err(TunnelError::BudgetExhausted {
                budget: "recovery",
                attempts: self.recovery_attempts,
                last: Box::new(cause),
            });
        }
        self.recovery_attempts += 1;
        self.set_state(
            SessionState::Recovering,
            format!(
                "Jump host {} is unreachable, replacing it (attempt {}/{})",
                self.instance_id, self.recovery_attempts, policy.max_recovery_attempts
            ),
        );

        let poll = Poll::new(policy.replacement_poll_attempts, policy.replacement_poll_interval());
        let resolver = &self.deps.resolver;
        resolver
            .terminate_jump_host(&self.profile, &self.instance_id, &self.project.region)
            .await;
        let replacement = resolver
            .wait_for_replacement_jump_host(
                &self.profile,
                &self.instance_id,
                &self.project.region,
                &self.project.bastion_pattern,
                poll,
                &self.cancel,
            )
            .await;

        if self.cancel.is_cancelled() {
            return Ok(Flow::Stop);
        }
        match replacement {
            Some(instance_id) => {
                info!(
                    "[{}] Jump host replaced: {} -> {}",
                    self.events.connection_id(),
                    self.instance_id,
                    instance_id
                );
                self.instance_id = instance_id;
                Ok(Flow::Forward)
            }
            None => Err(TunnelError::Resolution(format!(
                "No replacement for jump host {} after {} attempts",
                self.instance_id, poll.attempts
            ))),
        }
    }

    /// Re-resolve the route, back off, and forward again on the same local port
    async fn reconnect(&mut self, outcome: &SessionOutcome) -> Result<Flow, TunnelError> {
        let mut last = TunnelError::SessionEnded {
            exit_code: outcome.exit_code,
        };
        loop {
            let max = self.deps.policy.max_reconnect_attempts;
            if self.reconnect_attempts >= max {
                return Err(TunnelError::BudgetExhausted {
                    budget: "reconnect",
                    attempts: self.reconnect_attempts,
                    last: Box::new(last),
                });
            }
            self.reconnect_attempts += 1;
            let delay = self.deps.policy.reconnect_delay();
            self.set_state(
                SessionState::Reconnecting,
                format!(
                    "{}; reconnecting in {}s (attempt {}/{})",
                    last,
                    delay.as_secs(),
                    self.reconnect_attempts,
                    max
                ),
            );

            let resolved = self.resolve_route().await;
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Ok(Flow::Stop);
            }
            match resolved {
                Ok(()) => return Ok(Flow::Forward),
                Err(e @ TunnelError::Validation { .. }) => return Err(e),
                Err(e) => {
                    warn!("[{}] Re-resolution failed: {}", self.events.connection_id(), e);
                    last = e;
                }
            }
        }
    }
}
