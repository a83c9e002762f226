//! Scripted `Launcher` for state machine tests.
//!
//! Each launch takes the next script; the last one repeats once the queue
//! drains. An empty queue means every launch hangs until killed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::supervisor::{ForwardRequest, Forwarding, Launcher, SessionOutcome, TARGET_UNREACHABLE_EXIT_CODE};
use crate::error::TunnelError;

#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Exit right away with this outcome
    Exit(SessionOutcome),
    /// Stay up until killed
    Hang,
}

impl Script {
    pub(crate) fn unreachable() -> Self {
        Script::Exit(SessionOutcome {
            exit_code: Some(TARGET_UNREACHABLE_EXIT_CODE),
            stderr: "An error occurred (TargetNotConnected) when calling the StartSession operation".into(),
            established: false,
            established_for: None,
        })
    }

    pub(crate) fn exit(code: i32, stderr: &str) -> Self {
        Script::Exit(SessionOutcome {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        })
    }

    /// Ran established for `uptime` and then ended cleanly
    pub(crate) fn ended_after(uptime: Duration) -> Self {
        Script::Exit(SessionOutcome {
            exit_code: Some(0),
            stderr: String::new(),
            established: true,
            established_for: Some(uptime),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ForwardRequest>>,
    kills: Arc<AtomicUsize>,
    /// Cancelled from inside `launch`, simulating a disconnect racing a spawn
    cancel_on_launch: Mutex<Option<CancellationToken>>,
    /// How long each teardown takes
    kill_delay: Mutex<Duration>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, script: Script) -> &Self {
        self.scripts.lock().push_back(script);
        self
    }

    pub(crate) fn cancel_on_launch(&self, token: CancellationToken) {
        *self.cancel_on_launch.lock() = Some(token);
    }

    pub(crate) fn slow_kill(&self, delay: Duration) {
        *self.kill_delay.lock() = delay;
    }

    pub(crate) fn launches(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().clone()
    }

    fn next_script(&self) -> Script {
        let mut scripts = self.scripts.lock();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or(Script::Hang)
        } else {
            scripts.front().cloned().unwrap_or(Script::Hang)
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, request: &ForwardRequest) -> Result<Box<dyn Forwarding>, TunnelError> {
        request.validate()?;
        self.requests.lock().push(request.clone());
        if let Some(token) = self.cancel_on_launch.lock().take() {
            token.cancel();
        }

        let script = self.next_script();
        let (established_tx, established_rx) = watch::channel(false);
        if let Script::Exit(ref outcome) = script {
            established_tx.send_replace(outcome.established);
        }
        Ok(Box::new(FakeForwarding {
            script,
            killed: false,
            kill: CancellationToken::new(),
            kills: self.kills.clone(),
            kill_delay: *self.kill_delay.lock(),
            _established_tx: established_tx,
            established_rx,
        }))
    }
}

struct FakeForwarding {
    script: Script,
    killed: bool,
    kill: CancellationToken,
    kills: Arc<AtomicUsize>,
    kill_delay: Duration,
    _established_tx: watch::Sender<bool>,
    established_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Forwarding for FakeForwarding {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn established(&self) -> watch::Receiver<bool> {
        self.established_rx.clone()
    }

    async fn wait(&mut self) -> SessionOutcome {
        match &self.script {
            Script::Exit(outcome) => outcome.clone(),
            Script::Hang => {
                self.kill.cancelled().await;
                SessionOutcome::default()
            }
        }
    }

    async fn kill_tree(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if !self.kill_delay.is_zero() {
            tokio::time::sleep(self.kill_delay).await;
        }
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.kill.cancel();
    }
}
