use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace};

use super::{AgentProtocol, HandshakeState, StepOptions, QUIT, STEP_SERVER};
use crate::error::{ControlError, Result};
use crate::transport::FramedConnection;

/// Size of the fixed step reply: reward (`f64`), done (`i8`), sent (`i8`), big-endian.
pub const STEP_REPLY_LEN: usize = 10;

/// Outcome of one agent step, taken from the reply that ended the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReply {
    pub observation: Vec<u8>,
    pub reward: f64,
    pub done: bool,
    pub info: Option<String>,
    /// Step messages exchanged before the turn ended.
    pub polls: u32,
}

/// Whether the reply ended the caller's turn.
///
/// With a turn key in the reply the turn ends once the action was sent (`sent != 0`).
/// Without one it ends exactly when `sent == 0`.
pub fn turn_ended(received_key: &str, sent: bool) -> bool {
    if received_key.is_empty() {
        !sent
    } else {
        sent
    }
}

pub(crate) fn step_message(command: &str, options: StepOptions, multi_agent: bool) -> String {
    let tag = if multi_agent { "StepClient" } else { "Step" };
    let code = options.code();
    format!("<{tag}{code}>{command}</{tag}{code} >")
}

fn parse_reply(reply: &[u8]) -> Result<(f64, bool, bool)> {
    let reply: &[u8; STEP_REPLY_LEN] = reply.try_into().map_err(|_| {
        ControlError::ConnectionFault(format!(
            "expected a {STEP_REPLY_LEN} byte step reply, got {} bytes",
            reply.len()
        ))
    })?;
    let mut reward = [0u8; 8];
    reward.copy_from_slice(&reply[..8]);
    let done = reply[8] as i8 == 1;
    let sent = reply[9] as i8 != 0;
    Ok((f64::from_be_bytes(reward), done, sent))
}

impl AgentProtocol {
    /// Send one action and poll with it until the turn is over or the episode ends.
    ///
    /// `multi_agent` selects the client step message; the server tick is advanced separately
    /// with [`step_server`]. A turn still not over after `max_wait` is a connection fault.
    #[instrument(skip(self, conn, command), fields(turn_key = %self.turn_key))]
    pub fn step(
        &mut self,
        conn: &mut FramedConnection,
        command: &str,
        options: StepOptions,
        multi_agent: bool,
        max_wait: Duration,
    ) -> Result<StepReply> {
        match self.state {
            HandshakeState::Ready => {}
            HandshakeState::Done => return Err(ControlError::EpisodeFinished),
            state => {
                return Err(ControlError::ConnectionFault(format!(
                    "no running mission on this connection ({state:?})"
                )))
            }
        }

        let message = step_message(command, options, multi_agent);
        let start = Instant::now();
        let mut polls = 0;
        loop {
            conn.send_str(&message)?;
            if options.turn_key {
                conn.send_str(&self.turn_key)?;
            }
            let observation = conn.recv()?;
            let (reward, done, sent) = parse_reply(&conn.recv()?)?;
            let info = if options.info {
                Some(conn.recv_string()?)
            } else {
                None
            };
            let received = if options.turn_key {
                conn.recv_string()?
            } else {
                String::new()
            };
            polls += 1;

            let ended = turn_ended(&received, sent);
            if !received.is_empty() {
                self.turn_key = received;
            }
            if done {
                self.state = HandshakeState::Done;
            }
            if done || ended {
                return Ok(StepReply {
                    observation,
                    reward,
                    done,
                    info,
                    polls,
                });
            }
            if start.elapsed() >= max_wait {
                return Err(ControlError::ConnectionFault(format!(
                    "turn still not over after {polls} polls"
                )));
            }
            trace!(polls, sent, "turn not over, polling again");
        }
    }

    /// Abandon the running episode. True when the simulator acknowledged.
    pub fn quit(&mut self, conn: &mut FramedConnection) -> Result<bool> {
        conn.send_str(QUIT)?;
        let acknowledged = conn.recv_u32()? != 0;
        if acknowledged {
            self.state = HandshakeState::MissionPending;
            self.turn_key.clear();
        }
        Ok(acknowledged)
    }

    /// Send quit requests until one is acknowledged, at most `max_polls` of them.
    #[instrument(skip(self, conn))]
    pub fn quit_until_acknowledged(
        &mut self,
        conn: &mut FramedConnection,
        max_polls: u32,
        interval: Duration,
    ) -> Result<()> {
        for poll in 1..=max_polls {
            if self.quit(conn)? {
                debug!(poll, "episode abandoned");
                return Ok(());
            }
            thread::sleep(interval);
        }
        Err(ControlError::MissionBusyTimeout {
            attempts: max_polls,
        })
    }
}

/// Advance the integrated server by one tick. Sent to the primary agent only, after every
/// client stepped.
pub fn step_server(conn: &mut FramedConnection) -> Result<()> {
    conn.send_str(STEP_SERVER)
}
