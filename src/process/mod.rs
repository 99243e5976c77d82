//! Simulator process supervision: port placement, launch, watcher, kill.

mod exit_hook;
mod launcher;
mod reaper;
mod watcher;

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::{ControlError, Result};

pub use launcher::{ScriptLauncher, SimulatorLauncher, SimulatorProcess, READY_MARKER};
pub use reaper::{is_alive, kill_tree};
pub use watcher::{
    default_watcher_binary, fork_watcher, spawn_watcher, watch, WatchOutcome, WatcherHandle,
    POLL_INTERVAL, WATCHER_BIN_NAME,
};

/// True if something accepts TCP connections on `port` of the loopback interface.
pub fn is_port_taken(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

/// First port of `start..start + window` nobody listens on and not listed in `reserved`.
#[instrument(skip(reserved))]
pub fn find_free_port(start: u16, window: u16, reserved: &[u16]) -> Result<u16> {
    for offset in 0..window {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if port == 0 || reserved.contains(&port) {
            continue;
        }
        if !is_port_taken(port) {
            debug!(port, "found free port");
            return Ok(port);
        }
    }
    Err(ControlError::NoFreePort { start, window })
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn skips_listening_and_reserved_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        assert!(is_port_taken(taken));

        let err = find_free_port(taken, 1, &[]).unwrap_err();
        assert!(matches!(err, ControlError::NoFreePort { window: 1, .. }));

        // a listening port followed by a reserved one: the window of two is exhausted
        if let Some(next) = taken.checked_add(1) {
            let err = find_free_port(taken, 2, &[next]).unwrap_err();
            assert!(matches!(err, ControlError::NoFreePort { .. }));
        }
    }

    #[test]
    fn empty_window_has_no_port() {
        assert!(find_free_port(9000, 0, &[]).is_err());
    }
}
