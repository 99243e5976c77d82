//! # Malmo Env
//!
//! Client-side control core for reinforcement-learning environments backed by Minecraft
//! simulators running the Malmo mod.
//!
//! It provides:
//! - A length-prefixed TCP transport ([`transport`])
//! - Supervision of simulator processes, including a companion watcher process that reaps a
//!   simulator whose parent died ([`process`])
//! - A bounded, thread-safe pool of simulator instances ([`InstancePool`])
//! - The mission handshake and the step/turn protocol ([`protocol`])
//! - A session controller exposing `reset` / `step` / `close` ([`EnvSession`]), with
//!   reconnection and instance replacement on faults
//!
//! Observation decoding and action encoding stay outside of this crate: implement
//! [`EnvCodec`] for your environment, or use [`RawCodec`] to work with raw frame buffers.
//!
//! # Documentation Overview
//!
//! - For the episode lifecycle and the fault policy, see the [`session`] module.
//! - For instance placement, deadlines and retry counts, see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For the wire messages, see the [`protocol`] module.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//! use malmo_env::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_retry(3, Duration::from_secs(5));
//!     let pool = InstancePool::new(config);
//!
//!     let mission = MissionDocument::new(&std::fs::read_to_string("mission.xml")?)?;
//!     let mut env = EnvSession::new(pool, RawCodec::new(), mission, 1);
//!
//!     let first = env.reset()?;
//!     println!("first frame has {} bytes", first[0].pov.len());
//!     loop {
//!         let transition = env.step(&["move 1".to_string()])?;
//!         if let Some(error) = transition.error() {
//!             eprintln!("episode ended on a fault: {error}");
//!         }
//!         if transition.done {
//!             break;
//!         }
//!     }
//!     env.close();
//!     Ok(())
//! }
//! ```
//!
//! # Process Watcher
//!
//! Every launched simulator is guarded by the `malmo-watcher` binary of this crate. It is
//! looked up next to the current executable unless `MALMO_WATCHER_BIN` points to it. Programs
//! shipped without it (the binary of a dependency is never built) get a watcher forked from
//! their own process instead.

pub use anyhow;

pub mod configuration;
pub mod env_interface;
pub mod error;
pub mod instance;
pub mod logger;
pub mod mission;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

pub use configuration::{Configuration, DonePolicy};
pub use env_interface::{EnvCodec, RawCodec, RawObservation};
pub use error::{ControlError, Result};
pub use instance::Instance;
pub use mission::MissionDocument;
pub use pool::{InstanceLease, InstancePool};
pub use session::{AgentStep, EnvSession, Transition};

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use malmo_env::prelude::*;
/// ```
pub mod prelude {
    pub use crate::configuration::{Configuration, DonePolicy};
    pub use crate::env_interface::{EnvCodec, RawCodec, RawObservation};
    pub use crate::error::ControlError;
    pub use crate::mission::MissionDocument;
    pub use crate::pool::InstancePool;
    pub use crate::protocol::StepOptions;
    pub use crate::session::{EnvSession, Transition};
}
