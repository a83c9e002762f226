//! Keepalive Driver
//!
//! SSM closes port-forwarding sessions after 20 minutes without traffic.
//! While a tunnel is forwarding, open and immediately drop a TCP connection
//! to the local port on a fixed interval. Connection errors are ignored.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Running keepalive task. Stops on [`KeepaliveHandle::stop`] or drop.
#[derive(Debug)]
pub struct KeepaliveHandle {
    task: JoinHandle<()>,
}

impl KeepaliveHandle {
    /// Stop probing. Consumes the handle, so it runs once.
    pub fn stop(self) {
        // Drop does the work
    }
}

impl Drop for KeepaliveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start probing `127.0.0.1:port` every `interval`
pub fn start(port: u16, interval: Duration) -> KeepaliveHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
                Ok(Ok(stream)) => {
                    trace!("Keepalive connect to port {}", port);
                    drop(stream);
                }
                Ok(Err(e)) => trace!("Keepalive connect to port {} failed: {}", port, e),
                Err(_) => trace!("Keepalive connect to port {} timed out", port),
            }
        }
    });

    KeepaliveHandle { task }
}
