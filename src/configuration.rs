//! Config for instance placement, protocol deadlines and fault tolerance
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Boolean flags are case-insensitive, set them to `"true"` to enable.
//!
//! - `MALMO_BASE_PORT`: First port probed for new instances (default: `9000`)
//! - `MALMO_PORT_WINDOW`: How many ports are probed from the base port (default: `1000`)
//! - `MALMO_MAX_INSTANCES`: Instance pool capacity (default: `10`)
//! - `MALMO_MANAGED`: Launch simulators on demand when the pool has none free (default: `true`)
//! - `MALMO_FAULT_TOLERANT`: Reconnect and replace instances on faults (default: `true`)
//! - `MALMO_LOG`: Enable logging to a file (default: `false`)
//! - `MALMO_MINECRAFT_DIR`: Directory holding `launchClient.sh` (default: `./Malmo/Minecraft`)
//! - `MALMO_MINECRAFT_OUTPUT_LOGDIR`: Where simulator output is copied (default: `.`)
//! - `MALMO_WATCHER_BIN`: Path to the `malmo-watcher` binary (default: next to the current
//!   executable)
//! - `MALMO_SOCKET_TIMEOUT_SECS`: Read/write timeout of control connections (default: `240`)
//! - `MALMO_DONE_POLICY`: `all` or `primary`, see [`DonePolicy`] (default: `all`)

use std::{env, path::PathBuf, time::Duration};

/// How the episode-level `done` flag is derived from the agents of a multi-agent mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DonePolicy {
    /// The episode ends once every agent reported done.
    #[default]
    AllAgents,
    /// The episode ends as soon as the primary agent (role 0) reported done.
    PrimaryAgent,
}

/// Configuration for the instance pool and the session controller.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) base_port: u16,
    pub(crate) port_window: u16,
    pub(crate) max_instances: usize,
    pub(crate) managed: bool,
    pub(crate) fault_tolerant: bool,
    pub(crate) log: bool,
    pub(crate) minecraft_dir: PathBuf,
    pub(crate) output_log_dir: PathBuf,
    pub(crate) watcher_binary: Option<PathBuf>,
    pub(crate) spawn_watcher: bool,
    pub(crate) socket_timeout: Duration,
    pub(crate) launch_timeout: Duration,
    pub(crate) kill_timeout: Duration,
    pub(crate) max_mission_attempts: u32,
    pub(crate) mission_retry_delay: Duration,
    pub(crate) max_wait: Duration,
    pub(crate) retry_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) done_policy: DonePolicy,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - New instances are placed on the first free port in `9000..10000`.
    /// - At most 10 instances live at the same time, launched on demand.
    /// - Sessions are fault tolerant (reconnect, then replace the instance).
    /// - Logging to file is disabled.
    /// - A watcher process guards every spawned simulator.
    /// - Control connections time out after 4 minutes of silence.
    /// - A busy simulator is asked 80 times, one second apart, before giving up.
    /// - Operations are retried 20 times, 10 seconds apart.
    pub fn new() -> Self {
        Self {
            base_port: 9000,
            port_window: 1000,
            max_instances: 10,
            managed: true,
            fault_tolerant: true,
            log: false,
            minecraft_dir: PathBuf::from("Malmo").join("Minecraft"),
            output_log_dir: PathBuf::from("."),
            watcher_binary: None,
            spawn_watcher: true,
            socket_timeout: Duration::from_secs(240),
            launch_timeout: Duration::from_secs(600),
            kill_timeout: Duration::from_secs(5),
            max_mission_attempts: 80,
            mission_retry_delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(600),
            retry_attempts: 20,
            retry_delay: Duration::from_secs(10),
            done_policy: DonePolicy::AllAgents,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Any unset or unparsable
    /// value keeps its default.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.trim().parse().ok()
        }

        let default = Self::new();
        let done_policy = match env::var("MALMO_DONE_POLICY") {
            Ok(val) if val.eq_ignore_ascii_case("primary") => DonePolicy::PrimaryAgent,
            _ => DonePolicy::AllAgents,
        };

        Self {
            base_port: parse("MALMO_BASE_PORT").unwrap_or(default.base_port),
            port_window: parse("MALMO_PORT_WINDOW").unwrap_or(default.port_window),
            max_instances: parse("MALMO_MAX_INSTANCES").unwrap_or(default.max_instances),
            managed: get_env_flag("MALMO_MANAGED", true),
            fault_tolerant: get_env_flag("MALMO_FAULT_TOLERANT", true),
            log: get_env_flag("MALMO_LOG", false),
            minecraft_dir: env::var_os("MALMO_MINECRAFT_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.minecraft_dir),
            output_log_dir: env::var_os("MALMO_MINECRAFT_OUTPUT_LOGDIR")
                .map(PathBuf::from)
                .unwrap_or(default.output_log_dir),
            watcher_binary: env::var_os("MALMO_WATCHER_BIN").map(PathBuf::from),
            socket_timeout: parse("MALMO_SOCKET_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.socket_timeout),
            done_policy,
            ..default
        }
    }

    /// Set the first port probed for new instances and the size of the probed window.
    pub fn with_port_range(mut self, base_port: u16, window: u16) -> Self {
        self.base_port = base_port;
        self.port_window = window;
        self
    }

    /// Set the instance pool capacity.
    pub fn with_max_instances(mut self, value: usize) -> Self {
        self.max_instances = value;
        self
    }

    /// Enable or disable launching simulators on demand.
    ///
    /// An unmanaged pool only serves instances added with
    /// [`InstancePool::add_existing`](crate::pool::InstancePool::add_existing) or
    /// [`InstancePool::allocate`](crate::pool::InstancePool::allocate).
    pub fn with_managed(mut self, value: bool) -> Self {
        self.managed = value;
        self
    }

    /// Enable or disable reconnection and instance replacement after faults.
    ///
    /// When disabled (strict mode), faults surface to the caller immediately.
    pub fn with_fault_tolerant(mut self, value: bool) -> Self {
        self.fault_tolerant = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Directory containing the simulator launch script.
    pub fn with_minecraft_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.minecraft_dir = dir.into();
        self
    }

    /// Directory under which `logs/minecraft_proc_<port>.log` files are written.
    pub fn with_output_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_log_dir = dir.into();
        self
    }

    /// Explicit path of the `malmo-watcher` companion binary.
    pub fn with_watcher_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.watcher_binary = Some(path.into());
        self
    }

    /// Enable or disable the companion watcher process of spawned simulators.
    pub fn with_spawn_watcher(mut self, value: bool) -> Self {
        self.spawn_watcher = value;
        self
    }

    /// Read/write timeout applied once to every control connection.
    pub fn with_socket_timeout(mut self, duration: Duration) -> Self {
        self.socket_timeout = duration;
        self
    }

    /// How long a freshly spawned simulator may take to report readiness.
    pub fn with_launch_timeout(mut self, duration: Duration) -> Self {
        self.launch_timeout = duration;
        self
    }

    /// Grace period between SIGTERM and SIGKILL when killing a simulator.
    pub fn with_kill_timeout(mut self, duration: Duration) -> Self {
        self.kill_timeout = duration;
        self
    }

    /// Number of mission submissions tolerated while the simulator answers "busy", and the
    /// pause between two of them.
    pub fn with_mission_attempts(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_mission_attempts = attempts.max(1);
        self.mission_retry_delay = delay;
        self
    }

    /// Deadline for server discovery and the first observation.
    pub fn with_max_wait(mut self, duration: Duration) -> Self {
        self.max_wait = duration;
        self
    }

    /// Attempts and pause of the generic retry policy wrapping `reset`.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// How the episode `done` flag is derived in multi-agent missions.
    pub fn with_done_policy(mut self, policy: DonePolicy) -> Self {
        self.done_policy = policy;
        self
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_fault_tolerant(&self) -> bool {
        self.fault_tolerant
    }

    pub fn done_policy(&self) -> DonePolicy {
        self.done_policy
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
