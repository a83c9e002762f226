//! Forwarding Process Supervisor
//!
//! Spawns `aws ssm start-session` port forwarding under `aws-vault`, watches
//! its output for the session-started marker and collects stderr so the exit
//! can be classified. The process tree is torn down with [`tree::kill_tree`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::ProcessRegistry;
use super::tree;
use crate::aws::{aws_vault_command, validate};
use crate::error::TunnelError;

/// Stdout text meaning the local listener is up
pub const ESTABLISHED_MARKERS: &[&str] = &["Waiting for connections", "Starting session with SessionId"];

/// Stderr text meaning the jump host is gone
pub const UNREACHABLE_MARKERS: &[&str] = &["TargetNotConnected", "is not connected"];

/// Exit code the AWS CLI uses for a failed session start
pub const TARGET_UNREACHABLE_EXIT_CODE: i32 = 254;

pub const PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// How long to wait for output readers after the root process exits
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Descendant tracking starts at this interval and doubles up to the max
const TRACK_FIRST: Duration = Duration::from_millis(100);
const TRACK_MAX: Duration = Duration::from_secs(5);

/// Everything needed to start one forwarding session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub profile: String,
    pub region: String,
    pub instance_id: String,
    pub endpoint: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl ForwardRequest {
    pub fn validate(&self) -> Result<(), TunnelError> {
        validate::profile(&self.profile)?;
        validate::region(&self.region)?;
        validate::instance_id(&self.instance_id)?;
        validate::hostname(&self.endpoint)?;
        Ok(())
    }

    /// `aws` arguments for the port-forwarding session
    pub fn ssm_args(&self) -> Vec<String> {
        vec![
            "ssm".into(),
            "start-session".into(),
            "--region".into(),
            self.region.clone(),
            "--target".into(),
            self.instance_id.clone(),
            "--document-name".into(),
            PORT_FORWARD_DOCUMENT.into(),
            "--parameters".into(),
            format!(
                "host={},portNumber={},localPortNumber={}",
                self.endpoint, self.remote_port, self.local_port
            ),
        ]
    }
}

/// What a finished forwarding process looked like from the outside
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub established: bool,
    /// Time between the established marker and exit
    pub established_for: Option<Duration>,
}

impl SessionOutcome {
    /// Exit code 254 *and* one of the known stderr markers
    pub fn target_unreachable(&self) -> bool {
        self.exit_code == Some(TARGET_UNREACHABLE_EXIT_CODE)
            && UNREACHABLE_MARKERS.iter().any(|m| self.stderr.contains(m))
    }
}

pub fn is_established_marker(line: &str) -> bool {
    ESTABLISHED_MARKERS.iter().any(|m| line.contains(m))
}

/// A running forwarding session
#[async_trait]
pub trait Forwarding: Send {
    fn pid(&self) -> Option<u32>;

    /// Flips to `true` once the session-started marker is seen
    fn established(&self) -> watch::Receiver<bool>;

    /// Wait for the root process to exit. Calling again after exit returns
    /// the same exit code.
    async fn wait(&mut self) -> SessionOutcome;

    /// Tear down the whole process tree. Idempotent.
    async fn kill_tree(&mut self);
}

/// Starts forwarding sessions
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &ForwardRequest) -> Result<Box<dyn Forwarding>, TunnelError>;
}

/// Production launcher: `aws-vault exec <profile> -- aws ssm start-session …`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    registry: Arc<ProcessRegistry>,
}

impl ProcessLauncher {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(ProcessRegistry::global())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: &ForwardRequest) -> Result<Box<dyn Forwarding>, TunnelError> {
        request.validate()?;
        info!(
            "Starting port forwarding localhost:{} -> {}:{} via {}",
            request.local_port, request.endpoint, request.remote_port, request.instance_id
        );
        let cmd = aws_vault_command(&request.profile, &request.ssm_args());
        let process = ForwardingProcess::spawn(cmd, self.registry.clone())?;
        Ok(Box::new(process))
    }
}

#[derive(Default)]
struct OutputState {
    stderr: String,
    established_at: Option<Instant>,
}

/// Forwarding subprocess in its own process group
pub struct ForwardingProcess {
    child: Child,
    pid: u32,
    registry: Arc<ProcessRegistry>,
    state: Arc<Mutex<OutputState>>,
    established_rx: watch::Receiver<bool>,
    readers: Vec<JoinHandle<()>>,
    /// Descendants seen while the root was alive
    tracked: Vec<u32>,
    track_every: Duration,
    killed: bool,
}

impl ForwardingProcess {
    /// Spawn `cmd` detached into a new process group and register it
    pub(crate) fn spawn(mut cmd: Command, registry: Arc<ProcessRegistry>) -> Result<Self, TunnelError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| TunnelError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| TunnelError::Spawn("process exited before it could be tracked".into()))?;
        registry.register(pid);
        debug!("Forwarding process started (pid {})", pid);

        let state = Arc::new(Mutex::new(OutputState::default()));
        let (established_tx, established_rx) = watch::channel(false);
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let state = state.clone();
            readers.push(tokio::spawn(read_lines(stdout, move |line| {
                debug!("[forward {}] {}", pid, line);
                if is_established_marker(line) {
                    let mut state = state.lock();
                    if state.established_at.is_none() {
                        state.established_at = Some(Instant::now());
                        established_tx.send_replace(true);
                    }
                }
            })));
        }

        if let Some(stderr) = child.stderr.take() {
            let state = state.clone();
            readers.push(tokio::spawn(read_lines(stderr, move |line| {
                warn!("[forward {}] {}", pid, line);
                let mut state = state.lock();
                state.stderr.push_str(line);
                state.stderr.push('\n');
            })));
        }

        Ok(Self {
            child,
            pid,
            registry,
            state,
            established_rx,
            readers,
            tracked: Vec::new(),
            track_every: TRACK_FIRST,
            killed: false,
        })
    }

    /// Refresh the set of descendants to tear down later
    async fn track_descendants(&mut self) {
        let pid = self.pid;
        let known = self.tracked.clone();
        match tokio::task::spawn_blocking(move || tree::track(pid, &known)).await {
            Ok(tracked) => {
                if tracked.len() != self.tracked.len() {
                    debug!("Forwarding process {} has {} descendant(s)", pid, tracked.len());
                }
                self.registry.track(pid, &tracked);
                self.tracked = tracked;
            }
            Err(e) => debug!("Descendant scan for {} failed: {}", pid, e),
        }
    }

    /// Wait for the root to exit, scanning its descendants meanwhile
    async fn wait_exit(&mut self) -> Option<i32> {
        let mut established = self.established_rx.clone();
        let mut watch_established = !*established.borrow_and_update();
        let status = loop {
            let delay = self.track_every;
            let exited = tokio::select! {
                status = self.child.wait() => Some(status),
                _ = tokio::time::sleep(delay) => None,
                _ = established.changed(), if watch_established => {
                    watch_established = false;
                    None
                }
            };
            if let Some(status) = exited {
                break status;
            }
            self.track_every = (self.track_every * 2).min(TRACK_MAX);
            self.track_descendants().await;
        };

        match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait on forwarding process {}: {}", self.pid, e);
                None
            }
        }
    }
}

async fn read_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading forwarding output: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Forwarding for ForwardingProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn established(&self) -> watch::Receiver<bool> {
        self.established_rx.clone()
    }

    async fn wait(&mut self) -> SessionOutcome {
        let exit_code = self.wait_exit().await;
        let exited_at = Instant::now();

        // Descendants may still hold the pipes open; don't block on them
        for reader in self.readers.drain(..) {
            let _ = tokio::time::timeout(READER_DRAIN, reader).await;
        }

        let state = self.state.lock();
        SessionOutcome {
            exit_code,
            stderr: state.stderr.clone(),
            established: state.established_at.is_some(),
            established_for: state.established_at.map(|at| exited_at.duration_since(at)),
        }
    }

    async fn kill_tree(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        tree::kill_tree(self.pid, &self.tracked).await;
        self.registry.deregister(self.pid);
    }
}

impl Drop for ForwardingProcess {
    fn drop(&mut self) {
        if !self.killed {
            debug!("Dropping live forwarding process {}, killing group", self.pid);
            tree::force_kill_group(self.pid, &self.tracked);
            self.registry.deregister(self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ForwardRequest {
        ForwardRequest {
            profile: "emr-dev".into(),
            region: "us-east-2".into(),
            instance_id: "i-0123456789abcdef0".into(),
            endpoint: "emr.cluster-abc.us-east-2.rds.amazonaws.com".into(),
            remote_port: 5432,
            local_port: 5433,
        }
    }

    #[test]
    fn test_ssm_args() {
        let args = request().ssm_args();
        assert_eq!(&args[..2], &["ssm".to_string(), "start-session".to_string()]);
        assert!(args.contains(&PORT_FORWARD_DOCUMENT.to_string()));
        assert_eq!(
            args.last().unwrap(),
            "host=emr.cluster-abc.us-east-2.rds.amazonaws.com,portNumber=5432,localPortNumber=5433"
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());
        let mut bad = request();
        bad.endpoint = "db,localPortNumber=22".into();
        assert!(matches!(bad.validate(), Err(TunnelError::Validation { field: "hostname", .. })));
    }

    #[test]
    fn test_target_unreachable_needs_code_and_marker() {
        let mut outcome = SessionOutcome {
            exit_code: Some(254),
            stderr: "An error occurred (TargetNotConnected) when calling StartSession".into(),
            ..Default::default()
        };
        assert!(outcome.target_unreachable());

        outcome.stderr = "i-0abc is not connected.".into();
        assert!(outcome.target_unreachable());

        outcome.exit_code = Some(255);
        assert!(!outcome.target_unreachable());

        outcome.exit_code = Some(254);
        outcome.stderr = "AccessDeniedException".into();
        assert!(!outcome.target_unreachable());
    }

    #[test]
    fn test_established_markers() {
        assert!(is_established_marker("Waiting for connections..."));
        assert!(is_established_marker("Starting session with SessionId: emr-0a1b2c"));
        assert!(!is_established_marker("Port 5433 opened for sessionId"));
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_monitor_classifies_exit() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut process = ForwardingProcess::spawn(
            shell(
                "echo 'Starting session with SessionId: abc'; \
                 echo 'Waiting for connections...'; \
                 sleep 0.2; \
                 echo 'An error occurred (TargetNotConnected)' >&2; \
                 exit 254",
            ),
            registry.clone(),
        )
        .unwrap();
        assert!(registry.contains(process.pid));

        let mut established = process.established();
        let outcome = process.wait().await;
        assert!(*established.borrow_and_update());
        assert_eq!(outcome.exit_code, Some(254));
        assert!(outcome.established);
        assert!(outcome.established_for.is_some());
        assert!(outcome.target_unreachable());

        process.kill_tree().await;
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plain_failure_is_not_unreachable() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut process =
            ForwardingProcess::spawn(shell("echo 'ExpiredToken' >&2; exit 255"), registry).unwrap();
        let outcome = process.wait().await;
        assert_eq!(outcome.exit_code, Some(255));
        assert!(!outcome.established);
        assert!(outcome.stderr.contains("ExpiredToken"));
        assert!(!outcome.target_unreachable());
        process.kill_tree().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_twice_is_noop() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut process =
            ForwardingProcess::spawn(shell("sleep 30 & sleep 30 & wait"), registry.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let children = tree::descendants(process.pid);
        assert!(!children.is_empty());

        process.kill_tree().await;
        let started = Instant::now();
        process.kill_tree().await;
        assert!(started.elapsed() < tree::KILL_GRACE);

        let outcome = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap();
        assert_ne!(outcome.exit_code, Some(0));
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let survivors: Vec<u32> = children.into_iter().filter(|pid| tree::is_running(*pid)).collect();
        assert!(survivors.is_empty(), "survivors: {:?}", survivors);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_tree_after_exit_reaches_detached_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("child.pid");
        let registry = Arc::new(ProcessRegistry::new());
        let mut process = ForwardingProcess::spawn(
            shell(&format!(
                "setsid sh -c 'echo $$ > {}; exec sleep 30' & sleep 0.3; exit 1",
                pidfile.display()
            )),
            registry.clone(),
        )
        .unwrap();

        let outcome = process.wait().await;
        assert_eq!(outcome.exit_code, Some(1));
        let child: u32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        assert!(tree::is_running(child));
        assert!(process.tracked.contains(&child));

        process.kill_tree().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!tree::is_running(child), "detached child {} survived", child);
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_kills_group() {
        let registry = Arc::new(ProcessRegistry::new());
        let process = ForwardingProcess::spawn(shell("sleep 30"), registry.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        drop(process);
        assert!(registry.is_empty());
    }
}
