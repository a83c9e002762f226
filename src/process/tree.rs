//! Process tree teardown
//!
//! `aws-vault` spawns `aws`, which spawns `session-manager-plugin`. On macOS
//! the plugin is known to leave the process group it was started in, so a
//! single group signal is not enough. Teardown escalates:
//!
//! 1. SIGTERM the root's process group.
//! 2. SIGTERM every known descendant: those recorded with [`track`] while the
//!    root was alive, plus a snapshot taken before step 1. Once the root
//!    dies its children are reparented and can't be found by walking from it.
//! 3. After a grace period, SIGKILL whatever from steps 1-2 is still alive.
//!
//! Every step tolerates pids that already exited.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};

/// Wait between the graceful and the forced pass
pub const KILL_GRACE: Duration = Duration::from_millis(500);

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
}

fn walk(system: &System, root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(child) {
                found.push(child);
                stack.push(child);
            }
        }
    }
    found
}

/// All live descendants of `root` (not including `root`)
pub fn descendants(root: u32) -> Vec<u32> {
    walk(&process_table(), root)
}

/// Merge the current descendants of `root` into `known`, dropping entries
/// that no longer exist. Pids stay tracked after they are reparented away
/// from `root`, as long as they are alive.
pub fn track(root: u32, known: &[u32]) -> Vec<u32> {
    let system = process_table();
    let mut tracked: Vec<u32> = known
        .iter()
        .copied()
        .filter(|pid| system.process(sysinfo::Pid::from_u32(*pid)).is_some())
        .collect();
    for pid in walk(&system, root) {
        if !tracked.contains(&pid) {
            tracked.push(pid);
        }
    }
    tracked
}

#[cfg(unix)]
fn teardown_set(root: u32, known: &[u32]) -> Vec<u32> {
    let mut pids = descendants(root);
    for &pid in known {
        if pid != root && !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

/// Escalating three-pass teardown of `root`, everything below it and the
/// `known` descendants recorded earlier
#[cfg(unix)]
pub async fn kill_tree(root: u32, known: &[u32]) {
    use nix::sys::signal::Signal;

    let snapshot = teardown_set(root, known);
    tracing::debug!("Tearing down process tree {} ({} descendants)", root, snapshot.len());

    signal_group(root, Signal::SIGTERM);
    signal_pid(root, Signal::SIGTERM);
    for &pid in &snapshot {
        signal_pid(pid, Signal::SIGTERM);
    }

    tokio::time::sleep(KILL_GRACE).await;

    signal_group(root, Signal::SIGKILL);
    for pid in std::iter::once(root).chain(snapshot) {
        if is_alive(pid) {
            tracing::debug!("pid {} survived SIGTERM, sending SIGKILL", pid);
            signal_pid(pid, Signal::SIGKILL);
        }
    }
}

#[cfg(windows)]
pub async fn kill_tree(root: u32, known: &[u32]) {
    // taskkill /T walks the tree itself; reparented pids need their own call
    for pid in std::iter::once(root).chain(known.iter().copied()) {
        let result = tokio::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .await;
        if let Err(e) = result {
            tracing::debug!("taskkill for {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(any(unix, windows)))]
pub async fn kill_tree(_root: u32, _known: &[u32]) {}

/// Synchronous SIGKILL of the whole group; used from `Drop` and the shutdown sweep
#[cfg(unix)]
pub fn force_kill_group(root: u32, known: &[u32]) {
    use nix::sys::signal::Signal;

    for pid in teardown_set(root, known) {
        signal_pid(pid, Signal::SIGKILL);
    }
    signal_group(root, Signal::SIGKILL);
    signal_pid(root, Signal::SIGKILL);
}

#[cfg(windows)]
pub fn force_kill_group(root: u32, known: &[u32]) {
    for pid in std::iter::once(root).chain(known.iter().copied()) {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
}

#[cfg(not(any(unix, windows)))]
pub fn force_kill_group(_root: u32, _known: &[u32]) {}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid as i32), signal) {
        // ESRCH once the group is gone
        tracing::debug!("{:?} to process group {}: {}", signal, pgid, e);
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        tracing::debug!("{:?} to pid {}: {}", signal, pid, e);
    }
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Whether `pid` exists and is not a zombie
#[cfg(test)]
pub(crate) fn is_running(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
}
