//! Error kinds surfaced by the control core.
//!
//! Errors fall in three families and the split drives every retry decision:
//!
//! - **recoverable**: connection faults and protocol deadlines. They are retried by the
//!   [`RetryPolicy`](crate::retry::RetryPolicy) and trigger connection cleaning.
//! - **provisioning**: no port, no capacity, simulator did not start. Propagated at once.
//! - **invariant violations**: the simulator or the caller broke the protocol. Never retried.

use std::time::Duration;

use thiserror::Error;

/// Shorthand used across the crate.
pub type Result<T, E = ControlError> = std::result::Result<T, E>;

/// Every failure the control core can report.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Socket-level failure: refused connection, reset, timeout, short read or a reply that
    /// does not have the expected shape.
    #[error("connection fault: {0}")]
    ConnectionFault(String),

    /// The simulator kept answering "busy" to the mission submission.
    #[error("simulator still busy after {attempts} mission submissions")]
    MissionBusyTimeout { attempts: u32 },

    /// The primary agent never published its integrated server port.
    #[error("integrated server not found after {waited:?}")]
    ServerDiscoveryTimeout { waited: Duration },

    /// Mission started but no observation arrived in time.
    #[error("no first observation after {waited:?}")]
    FirstObservationTimeout { waited: Duration },

    /// Every pool slot is in use.
    #[error("no available instances and pool capacity ({capacity}) reached")]
    PoolExhausted { capacity: usize },

    /// No free TCP port in the probed window.
    #[error("no free port among the {window} ports starting at {start}")]
    NoFreePort { start: u16, window: u16 },

    /// The simulator did not report readiness before the deadline.
    #[error("simulator on port {port} not ready after {waited:?}")]
    LaunchTimeout { port: u16, waited: Duration },

    /// The simulator could not be started at all.
    #[error("simulator launch failed: {0}")]
    LaunchFailed(String),

    /// `done` was reported before any action was taken.
    #[error("episode reported done on its first observation; check the mission configuration")]
    PrematureEpisodeEnd,

    /// The mission document has no `<Mission>` element.
    #[error("invalid mission document: {0}")]
    InvalidMission(String),

    /// `step` was called on a finished episode.
    #[error("attempted to step an episode with done=true; call reset first")]
    EpisodeFinished,

    /// The observation codec rejected what the simulator sent.
    #[error("observation decoding failed: {0:#}")]
    Codec(anyhow::Error),
}

impl ControlError {
    /// Wraps an I/O error with the operation that produced it.
    pub fn connection(context: &str, err: std::io::Error) -> Self {
        ControlError::ConnectionFault(format!("{context}: {err}"))
    }

    /// Faults that may go away on their own: retrying or reconnecting is meaningful.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ControlError::ConnectionFault(_)
                | ControlError::MissionBusyTimeout { .. }
                | ControlError::ServerDiscoveryTimeout { .. }
                | ControlError::FirstObservationTimeout { .. }
        )
    }

    pub fn is_connection_fault(&self) -> bool {
        matches!(self, ControlError::ConnectionFault(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_split() {
        assert!(ControlError::ConnectionFault("reset".into()).is_recoverable());
        assert!(ControlError::MissionBusyTimeout { attempts: 3 }.is_recoverable());
        assert!(!ControlError::PoolExhausted { capacity: 1 }.is_recoverable());
        assert!(!ControlError::PrematureEpisodeEnd.is_recoverable());
        assert!(!ControlError::LaunchFailed("x".into()).is_recoverable());
    }

    #[test]
    fn no_free_port_message_names_window() {
        let err = ControlError::NoFreePort {
            start: 9000,
            window: 10,
        };
        assert_eq!(
            err.to_string(),
            "no free port among the 10 ports starting at 9000"
        );
    }
}
