//! Module defining the trait that translates between agent-facing values and the wire format

use rand::{rngs::StdRng, Rng};
use serde_json::Value;

/// What an environment implements to drive a session.
///
/// The session only moves opaque strings and bytes: how an action is written as a Malmo
/// command and how an observation is rebuilt from the frame buffer and the info blob is the
/// codec's business.
pub trait EnvCodec {
    /// What is given to `step`, one per agent.
    type Action;
    /// What is returned by `reset` and `step`, one per agent.
    type Observation: Clone;

    /// The Malmo command text for `action`, placed inside the step message.
    fn encode_action(&self, action: &Self::Action) -> String;

    /// Rebuild an observation from the raw frame buffer and the info text sent with it.
    ///
    /// # Error
    /// Returned when the simulator sent something the codec cannot interpret. The session
    /// reports it as [`ControlError::Codec`](crate::ControlError::Codec).
    fn decode_observation(&self, pov: &[u8], info: &str) -> anyhow::Result<Self::Observation>;

    /// A stand-in observation, returned when the episode ends on a connection fault.
    ///
    /// Must only depend on `rng` so that seeded sessions stay reproducible.
    fn sample_observation(&self, rng: &mut StdRng) -> Self::Observation;
}

/// Observation of [`RawCodec`]: the frame buffer as sent and the parsed info blob.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub pov: Vec<u8>,
    /// `Value::Null` when the simulator sent no info.
    pub info: Value,
}

/// Codec passing commands through and keeping observations raw.
#[derive(Debug, Clone, Default)]
pub struct RawCodec {
    pov_len: usize,
}

impl RawCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the random frame buffer of sampled observations, usually width × height × 3.
    pub fn with_pov_len(mut self, len: usize) -> Self {
        self.pov_len = len;
        self
    }
}

impl EnvCodec for RawCodec {
    type Action = String;
    type Observation = RawObservation;

    fn encode_action(&self, action: &String) -> String {
        action.clone()
    }

    fn decode_observation(&self, pov: &[u8], info: &str) -> anyhow::Result<RawObservation> {
        let info = if info.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(info)?
        };
        Ok(RawObservation {
            pov: pov.to_vec(),
            info,
        })
    }

    fn sample_observation(&self, rng: &mut StdRng) -> RawObservation {
        let mut pov = vec![0u8; self.pov_len];
        rng.fill(&mut pov[..]);
        RawObservation {
            pov,
            info: Value::Null,
        }
    }
}
