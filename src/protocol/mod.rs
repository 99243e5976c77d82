//! Control protocol spoken with the Malmo mod.
//!
//! One [`AgentProtocol`] exists per agent and tracks where that agent stands in the mission
//! lifecycle, plus the turn key it currently holds:
//!
//! ```text
//! Disconnected -> Connected -> MissionPending -> Ready -> Done -> MissionPending (next episode)
//!                                                              \-> Closed
//! ```
//!
//! Handshake operations live in [`handshake`], per-tick operations in [`step`].

use std::fmt::Display;

pub mod handshake;
pub mod step;

pub use handshake::Peeked;
pub use step::{StepReply, STEP_REPLY_LEN};

/// Protocol version announced in the greeting frame.
pub const MALMO_VERSION: &str = "0.37.0";

pub(crate) const PEEK: &str = "<Peek/>";
pub(crate) const QUIT: &str = "<Quit/>";
pub(crate) const STATUS: &str = "<Status/>";
pub(crate) const DISCONNECT: &str = "<Disconnect/>";
pub(crate) const STEP_SERVER: &str = "<StepServer></StepServer>";
pub(crate) const EXIT_NOW: &str = "<Exit>NOW</Exit>";

pub(crate) fn greeting() -> String {
    format!("<MalmoEnv{MALMO_VERSION}/>")
}

pub(crate) fn tagged(tag: &str, body: impl Display) -> String {
    format!("<{tag}>{body}</{tag}>")
}

/// Lifecycle of one agent's control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Disconnected,
    /// Connection open, greeting sent.
    Connected,
    /// No mission running: waiting for a mission submission.
    MissionPending,
    /// Mission accepted, steps may be sent.
    Ready,
    /// The simulator reported the end of the episode.
    Done,
    Closed,
}

/// What is exchanged on each step, encoded as the digit appended to the step tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    /// The held turn key is sent with the action and a new one comes back with the reply.
    pub turn_key: bool,
    /// The reply carries an info frame.
    pub info: bool,
}

impl StepOptions {
    pub fn code(self) -> u8 {
        match (self.turn_key, self.info) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<StepOptions> {
        let (turn_key, info) = match code {
            0 => (true, true),
            1 => (true, false),
            2 => (false, true),
            3 => (false, false),
            _ => return None,
        };
        Some(StepOptions { turn_key, info })
    }
}

impl Default for StepOptions {
    fn default() -> Self {
        StepOptions {
            turn_key: true,
            info: true,
        }
    }
}

/// Correlates control messages with one agent of one episode: `experiment_uid:role:resets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub experiment_uid: String,
    pub role: usize,
    pub resets: u32,
}

impl Token {
    pub fn new(experiment_uid: impl Into<String>, role: usize, resets: u32) -> Token {
        Token {
            experiment_uid: experiment_uid.into(),
            role,
            resets,
        }
    }

    /// The frame following a mission document: `token:agent_count:synchronous[:seed]`.
    pub fn mission_frame(&self, agent_count: usize, synchronous: bool, seed: Option<u64>) -> String {
        let mut frame = format!("{self}:{agent_count}:{synchronous}");
        if let Some(seed) = seed {
            frame.push_str(&format!(":{seed}"));
        }
        frame
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.experiment_uid, self.role, self.resets)
    }
}

/// Per-agent protocol state: handshake position and held turn key.
#[derive(Debug, Default)]
pub struct AgentProtocol {
    state: HandshakeState,
    turn_key: String,
}

impl AgentProtocol {
    pub fn new() -> AgentProtocol {
        AgentProtocol::default()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The last turn key received from the simulator.
    pub fn turn_key(&self) -> &str {
        &self.turn_key
    }

    /// The connection is gone; a new `connect` is required.
    pub fn disconnected(&mut self) {
        self.state = HandshakeState::Disconnected;
        self.turn_key.clear();
    }

    pub fn closed(&mut self) {
        self.state = HandshakeState::Closed;
        self.turn_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_option_codes() {
        for code in 0..4 {
            assert_eq!(StepOptions::from_code(code).unwrap().code(), code);
        }
        assert_eq!(StepOptions::from_code(4), None);
        assert_eq!(StepOptions::default().code(), 0);
        let info_only = StepOptions::from_code(2).unwrap();
        assert!(!info_only.turn_key && info_only.info);
    }

    #[test]
    fn token_formats() {
        let token = Token::new("3f2a", 1, 7);
        assert_eq!(token.to_string(), "3f2a:1:7");
        assert_eq!(token.mission_frame(2, true, None), "3f2a:1:7:2:true");
        assert_eq!(token.mission_frame(1, true, Some(42)), "3f2a:1:7:1:true:42");
    }

    #[test]
    fn control_frames() {
        assert_eq!(greeting(), "<MalmoEnv0.37.0/>");
        assert_eq!(tagged("Find", "a:1:0"), "<Find>a:1:0</Find>");
    }
}
