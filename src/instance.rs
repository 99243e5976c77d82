use std::time::Duration;

use tracing::{debug, info, warn};

use crate::process::{SimulatorProcess, WatcherHandle};
use crate::protocol::{self, handshake};
use crate::transport::FramedConnection;

/// Host every locally launched simulator listens on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

const EXIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// One simulator: where it listens, the process backing it (if this crate launched it) and the
/// control connection currently open on it.
///
/// Instances attached with [`InstancePool::add_existing`](crate::InstancePool::add_existing)
/// have no process: killing them only drops the connection.
#[derive(Debug)]
pub struct Instance {
    id: u64,
    host: String,
    port: u16,
    process: Option<SimulatorProcess>,
    watcher: Option<WatcherHandle>,
    connection: Option<FramedConnection>,
    running: bool,
    existing: bool,
    kill_timeout: Duration,
}

impl Instance {
    pub(crate) fn launched(
        id: u64,
        process: SimulatorProcess,
        watcher: Option<WatcherHandle>,
        kill_timeout: Duration,
    ) -> Self {
        Self {
            id,
            host: DEFAULT_HOST.to_string(),
            port: process.port(),
            process: Some(process),
            watcher,
            connection: None,
            running: true,
            existing: false,
            kill_timeout,
        }
    }

    pub(crate) fn existing(id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            process: None,
            watcher: None,
            connection: None,
            running: true,
            existing: true,
            kill_timeout: Duration::ZERO,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True for simulators this crate did not launch.
    pub fn is_existing(&self) -> bool {
        self.existing
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(SimulatorProcess::pid)
    }

    pub fn watcher_pid(&self) -> Option<u32> {
        self.watcher.as_ref().map(WatcherHandle::pid)
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_mut(&mut self) -> Option<&mut FramedConnection> {
        self.connection.as_mut()
    }

    pub(crate) fn set_connection(&mut self, connection: FramedConnection) {
        if let Some(old) = self.connection.replace(connection) {
            old.shutdown();
        }
    }

    /// Close the control connection, if any. The simulator itself keeps running.
    pub fn clean_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            handshake::disconnect(&mut conn);
            conn.shutdown();
            debug!(port = self.port, "connection cleaned");
        }
    }

    /// Stop the simulator: ask it to exit, then kill its process tree and its watcher.
    /// Idempotent.
    pub fn kill(&mut self) {
        if !self.running {
            return;
        }
        self.clean_connection();
        if let Some(mut process) = self.process.take() {
            if !self.request_exit() {
                debug!(port = self.port, "simulator did not acknowledge exit request");
            }
            process.kill(self.kill_timeout);
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.running = false;
        info!(id = self.id, port = self.port, "instance stopped");
    }

    fn request_exit(&self) -> bool {
        let mut conn = match FramedConnection::connect(&self.host, self.port, EXIT_REQUEST_TIMEOUT) {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        let acknowledged = conn
            .send_str(&protocol::greeting())
            .and_then(|_| handshake::request_exit(&mut conn));
        conn.shutdown();
        match acknowledged {
            Ok(ack) => ack,
            Err(e) => {
                warn!(port = self.port, "exit request failed: {e}");
                false
            }
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.kill();
    }
}
