//! The `reset` / `step` / `close` surface of an environment.
//!
//! An [`EnvSession`] owns one pool lease per agent, drives the handshake of every agent on
//! `reset`, fans actions out on `step`, and turns transport faults into a well-defined
//! terminal step instead of an error.
//!
//! Fault handling follows a two-strike rule per agent: the first fault only drops the
//! connection (the next `reset` reconnects to the same simulator), a second fault before any
//! successful `reset` discards the simulator and checks out a fresh one.

use std::thread;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::configuration::{Configuration, DonePolicy};
use crate::env_interface::{EnvCodec, RawCodec};
use crate::error::{ControlError, Result};
use crate::instance::DEFAULT_HOST;
use crate::mission::{HumanInteraction, MissionDocument, ServerEndpoint};
use crate::pool::{InstanceLease, InstancePool};
use crate::protocol::{self, handshake, AgentProtocol, HandshakeState, StepOptions, Token};
use crate::retry::RetryPolicy;
use crate::transport::FramedConnection;

/// Length of one simulator tick, the pace of real-time sessions.
pub const TICK_LENGTH: Duration = Duration::from_millis(50);

/// Info key carrying the fault of a step that ended on a connection fault.
pub const ERROR_KEY: &str = "error";

const QUIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one agent for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStep<O> {
    pub observation: O,
    pub reward: f64,
    pub done: bool,
    /// Empty, unless the step ended on a fault (see [`ERROR_KEY`]).
    pub info: Map<String, Value>,
}

/// Result of one step for every agent, in role order.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<O> {
    pub agents: Vec<AgentStep<O>>,
    /// Episode-level done, derived according to the [`DonePolicy`].
    pub done: bool,
}

impl<O> Transition<O> {
    /// The fault that ended the episode, if any.
    pub fn error(&self) -> Option<&str> {
        self.agents
            .iter()
            .find_map(|agent| agent.info.get(ERROR_KEY)?.as_str())
    }

    /// The primary agent's result. Convenient for single-agent sessions.
    pub fn into_single(self) -> Option<AgentStep<O>> {
        self.agents.into_iter().next()
    }
}

#[derive(Debug, Clone, Copy)]
struct Interactive {
    interaction: HumanInteraction,
    realtime: bool,
}

#[derive(Debug)]
struct AgentSlot<O> {
    role: usize,
    lease: Option<InstanceLease>,
    protocol: AgentProtocol,
    finished: bool,
    had_to_clean: bool,
    last_observation: Option<O>,
}

impl<O> AgentSlot<O> {
    fn new(role: usize) -> Self {
        Self {
            role,
            lease: None,
            protocol: AgentProtocol::new(),
            finished: false,
            had_to_clean: false,
            last_observation: None,
        }
    }
}

/// An environment driving one simulator per agent.
pub struct EnvSession<C: EnvCodec = RawCodec> {
    pool: InstancePool,
    codec: C,
    mission: MissionDocument,
    agents: Vec<AgentSlot<C::Observation>>,
    step_options: StepOptions,
    experiment_uid: String,
    resets: u32,
    done: bool,
    closed: bool,
    seed: Option<u64>,
    rng: StdRng,
    interactive: Option<Interactive>,
    integrated_server: Option<ServerEndpoint>,
    last_tick: Option<Instant>,
}

impl<C: EnvCodec> EnvSession<C> {
    /// A session of `agent_count` agents playing `mission`, with instances from `pool`.
    ///
    /// Nothing is launched or connected before the first [`EnvSession::reset`].
    ///
    /// # Panics
    /// If `agent_count` is zero.
    pub fn new(pool: InstancePool, codec: C, mission: MissionDocument, agent_count: usize) -> Self {
        assert!(agent_count > 0, "a session needs at least one agent");
        Self {
            pool,
            codec,
            mission,
            agents: (0..agent_count).map(AgentSlot::new).collect(),
            step_options: StepOptions::default(),
            experiment_uid: Uuid::new_v4().to_string(),
            resets: 0,
            done: true,
            closed: false,
            seed: None,
            rng: StdRng::from_os_rng(),
            interactive: None,
            integrated_server: None,
            last_tick: None,
        }
    }

    pub fn with_step_options(mut self, options: StepOptions) -> Self {
        self.step_options = options;
        self
    }

    fn config(&self) -> &Configuration {
        self.pool.config()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Episodes started so far, failed start attempts included.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_agent_finished(&self, role: usize) -> bool {
        self.agents.get(role).is_some_and(|slot| slot.finished)
    }

    /// Port of the primary agent's integrated server, once discovered.
    pub fn integrated_server_port(&self) -> Option<u16> {
        self.integrated_server.as_ref().map(|endpoint| endpoint.port)
    }

    /// Port of the simulator checked out by each agent.
    pub fn instance_ports(&self) -> Vec<Option<u16>> {
        self.agents
            .iter()
            .map(|slot| slot.lease.as_ref().map(|lease| lease.instance().port()))
            .collect()
    }

    /// Seed the next episode. The seed is sent with the next mission only.
    pub fn seed(&mut self, seed: u64) {
        self.seed = Some(seed);
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Open the primary agent's world to up to `max_players` humans on `port` from the next
    /// episode on. With `realtime`, steps are paced to one simulator tick.
    pub fn make_interactive(&mut self, port: u16, max_players: u32, realtime: bool) {
        self.interactive = Some(Interactive {
            interaction: HumanInteraction { port, max_players },
            realtime,
        });
    }

    fn token(&self, role: usize) -> Token {
        Token::new(self.experiment_uid.clone(), role, self.resets)
    }

    fn retry_policy(&self) -> RetryPolicy {
        let config = self.config();
        if config.fault_tolerant {
            RetryPolicy::new(config.retry_attempts, config.retry_delay)
        } else {
            RetryPolicy::once()
        }
    }

    /// Start a new episode and return the first observation of every agent.
    ///
    /// A running episode is quit first. Recoverable faults are retried according to the
    /// configuration; a mission reported done before its first observation is not.
    #[instrument(skip(self), fields(resets = self.resets))]
    pub fn reset(&mut self) -> Result<Vec<C::Observation>> {
        let result = self.reset_episode();
        self.seed = None;
        result
    }

    fn reset_episode(&mut self) -> Result<Vec<C::Observation>> {
        self.quit_episode()?;
        self.closed = false;
        let policy = self.retry_policy();
        policy.run(|attempt| {
            debug!(attempt, "starting mission");
            self.start_up()
        })
    }

    /// Quit every agent whose mission is still running.
    fn quit_episode(&mut self) -> Result<()> {
        let max_polls = self.config().max_mission_attempts;
        let tolerant = self.config().fault_tolerant;
        // clients before the primary, which hosts the server
        for idx in (0..self.agents.len()).rev() {
            if self.agents[idx].protocol.state() != HandshakeState::Ready {
                continue;
            }
            let result = self.with_connection(idx, |conn, protocol| {
                protocol.quit_until_acknowledged(conn, max_polls, QUIT_POLL_INTERVAL)
            });
            match result {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    self.handle_fault(idx, &e)?;
                    if !tolerant {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.done = true;
        Ok(())
    }

    fn start_up(&mut self) -> Result<Vec<C::Observation>> {
        self.acquire_missing()?;
        for idx in 0..self.agents.len() {
            let connected = self.ensure_connected(idx);
            self.guard(idx, connected)?;
        }

        self.resets += 1;
        for slot in &mut self.agents {
            slot.finished = false;
        }
        let interaction = self.interactive.map(|i| i.interaction);
        let primary = self
            .mission
            .mission_init(0, &self.experiment_uid, None, interaction);
        let submitted = self.submit(0, &primary);
        self.guard(0, submitted)?;

        if self.agents.len() > 1 {
            let found = self.find_integrated_server();
            let endpoint = self.guard(0, found)?;
            for role in 1..self.agents.len() {
                let xml = self
                    .mission
                    .mission_init(role, &self.experiment_uid, Some(&endpoint), None);
                let submitted = self.submit(role, &xml);
                self.guard(role, submitted)?;
            }
            self.integrated_server = Some(endpoint);
        }

        let mut observations = Vec::with_capacity(self.agents.len());
        for idx in 0..self.agents.len() {
            let peeked = self.peek(idx);
            observations.push(self.guard(idx, peeked)?);
        }

        if self.interactive.is_some() {
            if self.integrated_server.is_none() {
                let found = self.find_integrated_server();
                self.integrated_server = Some(self.guard(0, found)?);
            }
            if let Some(endpoint) = &self.integrated_server {
                warn!(port = endpoint.port, "agent is public, humans may connect");
            }
        }

        self.done = false;
        self.last_tick = None;
        for slot in &mut self.agents {
            slot.had_to_clean = false;
        }
        info!(resets = self.resets, "episode started");
        Ok(observations)
    }

    /// Check out an instance for every agent lacking one, in parallel when several are missing.
    fn acquire_missing(&mut self) -> Result<()> {
        let missing: Vec<usize> = self
            .agents
            .iter()
            .filter(|slot| slot.lease.is_none())
            .map(|slot| slot.role)
            .collect();
        match missing.as_slice() {
            [] => return Ok(()),
            [role] => {
                self.agents[*role].lease = Some(self.pool.acquire()?);
                return Ok(());
            }
            _ => {}
        }

        info!(count = missing.len(), "bringing up instances");
        let pool = &self.pool;
        let leases: Vec<Result<InstanceLease>> = thread::scope(|scope| {
            let workers: Vec<_> = missing
                .iter()
                .map(|_| scope.spawn(move || pool.acquire()))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        Err(ControlError::LaunchFailed(
                            "instance bring-up panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });

        let mut first_err = None;
        for (role, lease) in missing.into_iter().zip(leases) {
            match lease {
                Ok(lease) => self.agents[role].lease = Some(lease),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn with_connection<T>(
        &mut self,
        idx: usize,
        op: impl FnOnce(&mut FramedConnection, &mut AgentProtocol) -> Result<T>,
    ) -> Result<T> {
        let slot = &mut self.agents[idx];
        let lease = slot.lease.as_ref().ok_or_else(|| {
            ControlError::ConnectionFault(format!("agent {idx} has no instance"))
        })?;
        let mut instance = lease.instance();
        let conn = instance.connection_mut().ok_or_else(|| {
            ControlError::ConnectionFault(format!("agent {idx} is not connected"))
        })?;
        op(conn, &mut slot.protocol)
    }

    fn ensure_connected(&mut self, idx: usize) -> Result<()> {
        let timeout = self.config().socket_timeout;
        let slot = &mut self.agents[idx];
        let lease = slot.lease.as_ref().ok_or_else(|| {
            ControlError::ConnectionFault(format!("agent {idx} has no instance"))
        })?;
        let mut instance = lease.instance();
        if instance.has_connection() {
            return Ok(());
        }
        let host = instance.host().to_string();
        let conn = slot.protocol.connect(&host, instance.port(), timeout)?;
        instance.set_connection(conn);
        Ok(())
    }

    fn submit(&mut self, role: usize, mission_xml: &str) -> Result<()> {
        let config = self.config();
        let (attempts, delay) = (config.max_mission_attempts, config.mission_retry_delay);
        let frame = self
            .token(role)
            .mission_frame(self.agents.len(), true, self.seed);
        self.with_connection(role, |conn, protocol| {
            protocol.submit_mission(conn, mission_xml, &frame, attempts, delay)
        })
    }

    /// Ask the primary's simulator for its integrated server, with the token of the first
    /// joining agent (the primary's own token when it plays alone).
    fn find_integrated_server(&mut self) -> Result<ServerEndpoint> {
        let max_wait = self.config().max_wait;
        let token = self.token(usize::from(self.agents.len() > 1));
        let port = self.with_connection(0, |conn, protocol| {
            protocol.find_server(conn, &token, max_wait)
        })?;
        let address = self.agents[0]
            .lease
            .as_ref()
            .map(|lease| lease.instance().host().to_string())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        Ok(ServerEndpoint { address, port })
    }

    fn peek(&mut self, idx: usize) -> Result<C::Observation> {
        let max_wait = self.config().max_wait;
        let peeked = self.with_connection(idx, |conn, protocol| {
            protocol.peek_first_observation(conn, max_wait)
        })?;
        let observation = self
            .codec
            .decode_observation(&peeked.observation, &peeked.info)
            .map_err(ControlError::Codec)?;
        self.agents[idx].last_observation = Some(observation.clone());
        Ok(observation)
    }

    /// Apply the fault policy to recoverable errors of agent `idx`, then pass `result` on.
    fn guard<T>(&mut self, idx: usize, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_recoverable() {
                self.handle_fault(idx, e)?;
            }
        }
        result
    }

    /// Drop the connection of agent `idx`; on a second strike, replace its instance.
    ///
    /// Only fails when a replacement instance cannot be checked out.
    fn handle_fault(&mut self, idx: usize, err: &ControlError) -> Result<()> {
        self.done = true;
        let tolerant = self.config().fault_tolerant;
        let slot = &mut self.agents[idx];
        slot.protocol.disconnected();
        if let Some(lease) = &slot.lease {
            lease.instance().clean_connection();
        }
        if !tolerant {
            error!(role = idx, "{err}");
            return Ok(());
        }
        if !slot.had_to_clean {
            warn!(role = idx, "{err}; connection cleaned");
            slot.had_to_clean = true;
            return Ok(());
        }

        error!(
            role = idx,
            "{err}; connection with simulator cleaned more than once, restarting it"
        );
        if let Some(lease) = slot.lease.take() {
            lease.discard();
        }
        slot.had_to_clean = false;
        slot.lease = Some(self.pool.acquire()?);
        Ok(())
    }

    /// Send one action per agent, in role order, and advance the simulation by one tick.
    ///
    /// A connection fault does not surface as an error in fault-tolerant mode: every agent
    /// gets a sampled observation, zero reward, `done` and an [`ERROR_KEY`] info entry.
    ///
    /// # Panics
    /// If `actions` does not hold exactly one action per agent.
    #[instrument(skip(self, actions), fields(resets = self.resets))]
    pub fn step(&mut self, actions: &[C::Action]) -> Result<Transition<C::Observation>> {
        if self.done {
            return Err(ControlError::EpisodeFinished);
        }
        assert_eq!(
            actions.len(),
            self.agents.len(),
            "one action per agent is required"
        );

        let multi_agent = self.agents.len() > 1;
        let options = self.step_options;
        let max_wait = self.config().max_wait;
        let mut results = Vec::with_capacity(self.agents.len());
        for (idx, action) in actions.iter().enumerate() {
            if self.agents[idx].finished {
                results.push(self.finished_agent_step(idx));
                continue;
            }
            let command = self.codec.encode_action(action);
            let reply = match self.with_connection(idx, |conn, protocol| {
                protocol.step(conn, &command, options, multi_agent, max_wait)
            }) {
                Ok(reply) => reply,
                Err(e) if e.is_connection_fault() => return self.fail_step(idx, e),
                Err(e) => return Err(e),
            };
            let observation = self
                .codec
                .decode_observation(&reply.observation, reply.info.as_deref().unwrap_or_default())
                .map_err(ControlError::Codec)?;
            let slot = &mut self.agents[idx];
            slot.finished |= reply.done;
            slot.last_observation = Some(observation.clone());
            results.push(AgentStep {
                observation,
                reward: reply.reward,
                done: reply.done,
                info: Map::new(),
            });
        }

        if multi_agent {
            match self.with_connection(0, |conn, _| protocol::step::step_server(conn)) {
                Ok(()) => {}
                Err(e) if e.is_connection_fault() => return self.fail_step(0, e),
                Err(e) => return Err(e),
            }
        }
        self.pace();

        let done = match self.config().done_policy {
            DonePolicy::AllAgents => self.agents.iter().all(|slot| slot.finished),
            DonePolicy::PrimaryAgent => self.agents[0].finished,
        };
        self.done = done;
        Ok(Transition {
            agents: results,
            done,
        })
    }

    fn finished_agent_step(&mut self, idx: usize) -> AgentStep<C::Observation> {
        let observation = match &self.agents[idx].last_observation {
            Some(observation) => observation.clone(),
            None => self.codec.sample_observation(&mut self.rng),
        };
        AgentStep {
            observation,
            reward: 0.0,
            done: true,
            info: Map::new(),
        }
    }

    fn fail_step(&mut self, idx: usize, err: ControlError) -> Result<Transition<C::Observation>> {
        if let Err(replace_err) = self.handle_fault(idx, &err) {
            error!(role = idx, "no replacement instance: {replace_err}");
        }
        if !self.config().fault_tolerant {
            return Err(err);
        }

        let message = err.to_string();
        let mut agents = Vec::with_capacity(self.agents.len());
        for _ in 0..self.agents.len() {
            let mut info = Map::new();
            info.insert(ERROR_KEY.to_string(), Value::String(message.clone()));
            agents.push(AgentStep {
                observation: self.codec.sample_observation(&mut self.rng),
                reward: 0.0,
                done: true,
                info,
            });
        }
        for slot in &mut self.agents {
            slot.finished = true;
        }
        self.done = true;
        Ok(Transition { agents, done: true })
    }

    fn pace(&mut self) {
        if !self.interactive.is_some_and(|i| i.realtime) {
            return;
        }
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < TICK_LENGTH {
                thread::sleep(TICK_LENGTH - elapsed);
            }
        }
        self.last_tick = Some(Instant::now());
    }

    fn primary_endpoint(&self) -> Result<(String, u16)> {
        let lease = self.agents[0].lease.as_ref().ok_or_else(|| {
            ControlError::ConnectionFault("no instance checked out yet, call reset first".to_string())
        })?;
        let instance = lease.instance();
        Ok((instance.host().to_string(), instance.port()))
    }

    /// Run `op` on a fresh control connection to the primary agent's simulator.
    fn control_request<T>(&self, op: impl FnOnce(&mut FramedConnection) -> Result<T>) -> Result<T> {
        let (host, port) = self.primary_endpoint()?;
        let mut conn = FramedConnection::connect(&host, port, self.config().socket_timeout)?;
        conn.send_str(&protocol::greeting())?;
        let result = op(&mut conn);
        handshake::disconnect(&mut conn);
        conn.shutdown();
        result
    }

    /// Free-form status text of the primary agent's simulator.
    pub fn status(&self) -> Result<String> {
        self.control_request(handshake::status)
    }

    /// Ask the primary agent's simulator to re-initialise its mission state.
    pub fn reinit(&self) -> Result<bool> {
        let token = self.token(0);
        self.control_request(|conn| handshake::reinit(conn, &token))
    }

    /// Release the mission of every agent and give the instances back.
    ///
    /// Launched instances are killed, instances attached with
    /// [`InstancePool::add_existing`] are returned to the pool. Idempotent; a later
    /// [`EnvSession::reset`] checks out instances again.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for idx in (0..self.agents.len()).rev() {
            let token = self.token(idx);
            let slot = &mut self.agents[idx];
            let Some(lease) = slot.lease.take() else {
                slot.protocol.closed();
                continue;
            };
            let existing = {
                let mut instance = lease.instance();
                if let Some(conn) = instance.connection_mut() {
                    if let Err(e) = slot.protocol.close_mission(conn, &token) {
                        debug!(role = idx, "close not acknowledged: {e}");
                    }
                }
                instance.clean_connection();
                instance.is_existing()
            };
            slot.protocol.closed();
            if existing {
                lease.release();
            } else {
                lease.discard();
            }
        }
        self.done = true;
        self.closed = true;
        info!("session closed");
    }
}

impl<C: EnvCodec> Drop for EnvSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}
