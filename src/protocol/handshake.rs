use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::{
    greeting, tagged, AgentProtocol, HandshakeState, Token, DISCONNECT, EXIT_NOW, PEEK, STATUS,
};
use crate::error::{ControlError, Result};
use crate::transport::FramedConnection;

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PEEK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First observation of an episode, as returned by `<Peek/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Peeked {
    pub observation: Vec<u8>,
    pub info: String,
}

impl AgentProtocol {
    /// Open a control connection and send the protocol greeting.
    #[instrument(skip(self))]
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<FramedConnection> {
        let mut conn = FramedConnection::connect(host, port, timeout)?;
        conn.send_str(&greeting())?;
        self.state = HandshakeState::Connected;
        self.turn_key.clear();
        debug!("greeting sent");
        Ok(conn)
    }

    /// Submit a mission document followed by its token frame, resubmitting while the
    /// simulator answers busy. `max_attempts` counts submissions, the first one included.
    ///
    /// The turn-key frame following the status word is always consumed; it is only kept when
    /// the mission is accepted.
    #[instrument(skip(self, conn, mission_xml))]
    pub fn submit_mission(
        &mut self,
        conn: &mut FramedConnection,
        mission_xml: &str,
        token_frame: &str,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<()> {
        self.state = HandshakeState::MissionPending;
        for attempt in 1..=max_attempts {
            conn.send_str(mission_xml)?;
            conn.send_str(token_frame)?;
            let status = conn.recv_u32()?;
            let turn_key = conn.recv_string()?;
            if status != 0 {
                self.turn_key = turn_key;
                self.state = HandshakeState::Ready;
                info!(attempt, "mission accepted");
                return Ok(());
            }
            if attempt < max_attempts {
                debug!(attempt, "simulator busy, resubmitting");
                thread::sleep(retry_delay);
            }
        }
        warn!(max_attempts, "simulator stayed busy");
        Err(ControlError::MissionBusyTimeout {
            attempts: max_attempts,
        })
    }

    /// Ask the primary agent's simulator for the port of its integrated server, polling until
    /// it is published or `max_wait` elapses.
    #[instrument(skip(self, conn))]
    pub fn find_server(
        &self,
        conn: &mut FramedConnection,
        token: &Token,
        max_wait: Duration,
    ) -> Result<u16> {
        let deadline = Instant::now() + max_wait;
        let request = tagged("Find", token);
        loop {
            conn.send_str(&request)?;
            let port = conn.recv_u32()?;
            if port != 0 {
                let port = u16::try_from(port).map_err(|_| {
                    ControlError::ConnectionFault(format!("simulator published invalid port {port}"))
                })?;
                info!(port, "integrated server found");
                return Ok(port);
            }
            if Instant::now() >= deadline {
                return Err(ControlError::ServerDiscoveryTimeout { waited: max_wait });
            }
            thread::sleep(FIND_POLL_INTERVAL);
        }
    }

    /// Peek until the mission produces its first observation.
    ///
    /// An episode reported done at this point is a mission configuration problem and is
    /// never retried.
    #[instrument(skip(self, conn))]
    pub fn peek_first_observation(
        &mut self,
        conn: &mut FramedConnection,
        max_wait: Duration,
    ) -> Result<Peeked> {
        let start = Instant::now();
        loop {
            conn.send_str(PEEK)?;
            let observation = conn.recv()?;
            let info = conn.recv_string()?;
            let done = match conn.recv()?.as_slice() {
                [flag] => *flag as i8 == 1,
                other => {
                    return Err(ControlError::ConnectionFault(format!(
                        "expected a 1 byte done flag, got {} bytes",
                        other.len()
                    )))
                }
            };
            if done {
                self.state = HandshakeState::Done;
                return Err(ControlError::PrematureEpisodeEnd);
            }
            if !observation.is_empty() {
                debug!(len = observation.len(), "first observation received");
                return Ok(Peeked { observation, info });
            }
            if start.elapsed() >= max_wait {
                return Err(ControlError::FirstObservationTimeout { waited: max_wait });
            }
            thread::sleep(PEEK_POLL_INTERVAL);
        }
    }

    /// Release the mission resources held for `token`. Returns the simulator's acknowledgement.
    pub fn close_mission(&mut self, conn: &mut FramedConnection, token: &Token) -> Result<bool> {
        conn.send_str(&tagged("Close", token))?;
        let ok = conn.recv_u32()? != 0;
        self.closed();
        Ok(ok)
    }
}

/// Free-form status text of a simulator.
pub fn status(conn: &mut FramedConnection) -> Result<String> {
    conn.send_str(STATUS)?;
    conn.recv_string()
}

/// Ask the simulator to re-initialise its mission state for `token`.
pub fn reinit(conn: &mut FramedConnection, token: &Token) -> Result<bool> {
    conn.send_str(&tagged("Init", token))?;
    Ok(conn.recv_u32()? != 0)
}

/// Ask the simulator process to exit on its own.
pub fn request_exit(conn: &mut FramedConnection) -> Result<bool> {
    conn.send_str(EXIT_NOW)?;
    Ok(conn.recv_u32()? != 0)
}

/// Tell the simulator this connection is going away. Best effort.
pub fn disconnect(conn: &mut FramedConnection) {
    if let Err(e) = conn.send_str(DISCONNECT) {
        debug!("disconnect not delivered: {e}");
    }
}
