//! Bounded set of simulator instances shared by sessions.
//!
//! The checkout table is the only state shared between sessions. One mutex covers the whole
//! "find an unlocked instance and lock it" step, and capacity is reserved under that same
//! mutex before a new simulator is spawned outside of it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{ControlError, Result};
use crate::instance::{Instance, DEFAULT_HOST};
use crate::logger::init_logger;
use crate::process::{
    default_watcher_binary, find_free_port, fork_watcher, is_port_taken, spawn_watcher,
    ScriptLauncher, SimulatorLauncher, WatcherHandle,
};

/// Instances are shared between the pool (which can kill them) and the lease holder.
pub type SharedInstance = Arc<Mutex<Instance>>;

pub(crate) fn lock_instance(instance: &SharedInstance) -> MutexGuard<'_, Instance> {
    instance.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct PoolEntry {
    id: u64,
    port: u16,
    locked: bool,
    instance: SharedInstance,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    /// Ports of simulators being spawned right now; they count against capacity.
    spawning: Vec<u16>,
    /// Slots reserved while their port is probed outside the lock.
    probing: usize,
    next_id: u64,
}

impl PoolState {
    fn live(&self) -> usize {
        self.entries.len() + self.spawning.len() + self.probing
    }

    fn is_port_reserved(&self, port: u16) -> bool {
        self.spawning.contains(&port) || self.entries.iter().any(|e| e.port == port)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug)]
struct PoolInner {
    config: Configuration,
    launcher: Box<dyn SimulatorLauncher>,
    state: Mutex<PoolState>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let entries = std::mem::take(
            &mut self
                .state
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .entries,
        );
        kill_entries(entries);
    }
}

/// Handle on a pool of simulator instances. Cloning the handle shares the pool.
///
/// Every instance still in the pool is killed when the last handle (and the last lease) is
/// dropped.
#[derive(Debug, Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl InstancePool {
    /// A pool launching simulators with the stock launch script of `config`.
    pub fn new(config: Configuration) -> Self {
        let launcher = ScriptLauncher::from_config(&config);
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: Configuration, launcher: impl SimulatorLauncher + 'static) -> Self {
        if config.log {
            if let Err(e) = init_logger() {
                warn!("file logging not enabled: {e:#}");
            }
        }
        Self {
            inner: Arc::new(PoolInner {
                config,
                launcher: Box::new(launcher),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_instances
    }

    /// Instances in the pool, checked out or not.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instances not checked out.
    pub fn available(&self) -> usize {
        self.state().entries.iter().filter(|e| !e.locked).count()
    }

    /// Ports of the instances in the pool.
    pub fn ports(&self) -> Vec<u16> {
        self.state().entries.iter().map(|e| e.port).collect()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(&self, id: u64, instance: SharedInstance) -> InstanceLease {
        InstanceLease {
            pool: self.clone(),
            id,
            instance,
            released: false,
        }
    }

    /// Check out an unlocked instance, spawning a new one if none is free and capacity allows.
    ///
    /// Unmanaged pools never spawn: they only hand out instances added with
    /// [`InstancePool::add_existing`] or [`InstancePool::allocate`].
    #[instrument(skip(self))]
    pub fn acquire(&self) -> Result<InstanceLease> {
        {
            let mut state = self.state();
            if let Some(entry) = state.entries.iter_mut().find(|e| !e.locked) {
                entry.locked = true;
                debug!(id = entry.id, port = entry.port, "reusing instance");
                let (id, instance) = (entry.id, entry.instance.clone());
                return Ok(self.lease(id, instance));
            }
            if !self.inner.config.managed {
                warn!("no available instances and the pool is not managed");
                return Err(ControlError::PoolExhausted {
                    capacity: self.capacity(),
                });
            }
        }
        let (id, instance) = self.spawn_entry(true)?;
        Ok(self.lease(id, instance))
    }

    /// Launch `count` simulators in parallel and keep them in the pool, unlocked, for later
    /// [`InstancePool::acquire`] calls. Every launch is attempted; the first failure is
    /// returned.
    #[instrument(skip(self))]
    pub fn allocate(&self, count: usize) -> Result<()> {
        let launched: Vec<Result<()>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..count)
                .map(|_| scope.spawn(|| self.spawn_entry(false).map(|_| ())))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        Err(ControlError::LaunchFailed(
                            "instance launch panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });
        info!(count, live = self.len(), "pool allocated");
        launched.into_iter().collect()
    }

    /// Take a capacity slot and a port for a new simulator.
    ///
    /// The slot is reserved under the mutex, the port is probed outside of it and then
    /// checked again against the ports other threads reserved meanwhile.
    fn reserve_port(&self) -> Result<(u64, u16)> {
        let mut taken = {
            let mut state = self.state();
            if state.live() >= self.capacity() {
                return Err(ControlError::PoolExhausted {
                    capacity: self.capacity(),
                });
            }
            state.probing += 1;
            let mut taken: Vec<u16> = state.entries.iter().map(|e| e.port).collect();
            taken.extend_from_slice(&state.spawning);
            taken
        };

        let config = &self.inner.config;
        loop {
            let probed = find_free_port(config.base_port, config.port_window, &taken);
            let mut state = self.state();
            match probed {
                Ok(port) if state.is_port_reserved(port) => {
                    drop(state);
                    debug!(port, "port reserved concurrently, probing again");
                    taken.push(port);
                }
                Ok(port) => {
                    state.probing -= 1;
                    state.spawning.push(port);
                    return Ok((state.next_id(), port));
                }
                Err(e) => {
                    state.probing -= 1;
                    return Err(e);
                }
            }
        }
    }

    /// Launch a simulator in a reserved slot and add it to the pool.
    fn spawn_entry(&self, locked: bool) -> Result<(u64, SharedInstance)> {
        let (id, port) = self.reserve_port()?;
        let launched = self.launch_instance(id, port);

        let mut state = self.state();
        if let Some(pos) = state.spawning.iter().position(|p| *p == port) {
            state.spawning.swap_remove(pos);
        }
        let instance = Arc::new(Mutex::new(launched?));
        state.entries.push(PoolEntry {
            id,
            port,
            locked,
            instance: instance.clone(),
        });
        info!(id, port, live = state.entries.len(), "instance added to pool");
        Ok((id, instance))
    }

    fn launch_instance(&self, id: u64, port: u16) -> Result<Instance> {
        let config = &self.inner.config;
        let mut process = self.inner.launcher.launch(port)?;
        let watcher = if config.spawn_watcher {
            match self.guard_with_watcher(process.pid()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    error!(port, "simulator left unguarded, killing it: {e}");
                    process.kill(config.kill_timeout);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Instance::launched(id, process, watcher, config.kill_timeout))
    }

    /// Start the watcher of a simulator: the `malmo-watcher` binary when one is configured
    /// or found next to the executable, else a watcher forked from this process.
    fn guard_with_watcher(&self, child_pid: u32) -> Result<WatcherHandle> {
        let config = &self.inner.config;
        let parent_pid = std::process::id();
        match config.watcher_binary.clone().or_else(default_watcher_binary) {
            Some(binary) => spawn_watcher(&binary, parent_pid, child_pid),
            None => {
                debug!(child_pid, "no watcher binary found, forking the watcher");
                fork_watcher(parent_pid, child_pid, config.kill_timeout)
            }
        }
    }

    /// Add a simulator started by someone else, listening on `port` of the loopback interface.
    /// It joins the pool unlocked and is never killed, only disconnected.
    #[instrument(skip(self))]
    pub fn add_existing(&self, port: u16) -> Result<()> {
        if !is_port_taken(port) {
            return Err(ControlError::LaunchFailed(format!(
                "no simulator listening on port {port}"
            )));
        }
        let mut state = self.state();
        if state.live() >= self.capacity() {
            return Err(ControlError::PoolExhausted {
                capacity: self.capacity(),
            });
        }
        let id = state.next_id();
        state.entries.push(PoolEntry {
            id,
            port,
            locked: false,
            instance: Arc::new(Mutex::new(Instance::existing(id, DEFAULT_HOST, port))),
        });
        info!(id, port, "existing instance added to pool");
        Ok(())
    }

    /// Return a checked-out instance to the pool.
    pub fn release(&self, lease: InstanceLease) {
        lease.release();
    }

    /// Kill a checked-out instance and remove it from the pool.
    pub fn discard(&self, lease: InstanceLease) {
        lease.discard();
    }

    fn unlock(&self, id: u64) {
        if let Some(entry) = self.state().entries.iter_mut().find(|e| e.id == id) {
            entry.locked = false;
            debug!(id, port = entry.port, "instance released");
        }
    }

    fn remove(&self, id: u64) -> Option<PoolEntry> {
        let mut state = self.state();
        let pos = state.entries.iter().position(|e| e.id == id)?;
        Some(state.entries.remove(pos))
    }

    /// Kill every instance of the pool, checked out or not.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let entries = std::mem::take(&mut self.state().entries);
        info!(count = entries.len(), "shutting down instance pool");
        kill_entries(entries);
    }
}

fn kill_entries(entries: Vec<PoolEntry>) {
    for entry in entries {
        lock_instance(&entry.instance).kill();
    }
}

/// Exclusive use of one pool instance. The instance goes back to the pool on drop.
#[derive(Debug)]
pub struct InstanceLease {
    pool: InstancePool,
    id: u64,
    instance: SharedInstance,
    released: bool,
}

impl InstanceLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance(&self) -> MutexGuard<'_, Instance> {
        lock_instance(&self.instance)
    }

    pub fn shared(&self) -> SharedInstance {
        self.instance.clone()
    }

    /// Unlock the instance so another session can check it out.
    pub fn release(mut self) {
        self.released = true;
        self.pool.unlock(self.id);
    }

    /// Kill the instance and remove it from the pool.
    pub fn discard(mut self) {
        self.released = true;
        self.pool.remove(self.id);
        self.instance().kill();
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.unlock(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn config(capacity: usize) -> Configuration {
        Configuration::new()
            .with_max_instances(capacity)
            .with_spawn_watcher(false)
    }

    #[test]
    fn existing_instances_are_checked_out_exclusively() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = InstancePool::with_launcher(config(1), ScriptLauncher::new("false"));
        pool.add_existing(port).unwrap();
        assert_eq!(pool.available(), 1);

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.instance().port(), port);
        assert_eq!(pool.available(), 0);
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, ControlError::PoolExhausted { capacity: 1 }));

        pool.release(lease);
        let again = pool.acquire().unwrap();
        assert_eq!(again.instance().port(), port);
        drop(again);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn nothing_listening_is_rejected() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let pool = InstancePool::with_launcher(config(1), ScriptLauncher::new("false"));
        assert!(matches!(
            pool.add_existing(port),
            Err(ControlError::LaunchFailed(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn discarded_instance_leaves_the_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = InstancePool::with_launcher(config(2), ScriptLauncher::new("false"));
        pool.add_existing(port).unwrap();

        let lease = pool.acquire().unwrap();
        let shared = lease.shared();
        pool.discard(lease);
        assert!(pool.is_empty());
        assert!(!lock_instance(&shared).is_running());
    }

    #[test]
    fn unmanaged_pool_never_spawns() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // a launcher that would succeed if it were ever called
        let pool = InstancePool::with_launcher(
            config(2).with_managed(false),
            ScriptLauncher::new("sh").with_args(["-c", "echo 'CLIENT enter state: DORMANT'", "sh"]),
        );
        assert!(matches!(
            pool.acquire(),
            Err(ControlError::PoolExhausted { capacity: 2 })
        ));

        pool.add_existing(port).unwrap();
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.instance().port(), port);
        assert!(matches!(pool.acquire(), Err(ControlError::PoolExhausted { .. })));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn reserved_ports_are_never_handed_out_twice() {
        let pool = InstancePool::with_launcher(
            config(2).with_port_range(43700, 50),
            ScriptLauncher::new("false"),
        );
        let (first_id, first) = pool.reserve_port().unwrap();
        let (second_id, second) = pool.reserve_port().unwrap();
        assert_ne!(first, second);
        assert_ne!(first_id, second_id);
        assert!(matches!(
            pool.reserve_port(),
            Err(ControlError::PoolExhausted { capacity: 2 })
        ));
        let state = pool.state();
        assert_eq!(state.probing, 0);
        assert_eq!(state.spawning.len(), 2);
    }

    #[cfg(unix)]
    fn sleeping_launcher() -> ScriptLauncher {
        ScriptLauncher::new("sh")
            .with_args(["-c", "echo 'CLIENT enter state: DORMANT'; exec sleep 30", "sh"])
            .with_launch_timeout(std::time::Duration::from_secs(5))
    }

    #[cfg(unix)]
    #[test]
    fn allocate_prelaunches_unlocked_instances() {
        let pool = InstancePool::with_launcher(
            config(3)
                .with_managed(false)
                .with_port_range(43300, 100)
                .with_kill_timeout(std::time::Duration::from_millis(300)),
            sleeping_launcher(),
        );
        pool.allocate(2).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available(), 2);
        let mut ports = pool.ports();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 2);

        // allocated instances are served even though the pool is not managed
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(pool.acquire().is_err());

        // one slot left: the second launch of this batch has no capacity
        drop((first, second));
        assert!(matches!(
            pool.allocate(2),
            Err(ControlError::PoolExhausted { capacity: 3 })
        ));
        assert_eq!(pool.len(), 3);
        pool.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn simulator_without_watcher_is_not_kept() {
        let pool = InstancePool::with_launcher(
            config(1)
                .with_spawn_watcher(true)
                .with_watcher_binary("/nonexistent/malmo-watcher")
                .with_port_range(43500, 100)
                .with_kill_timeout(std::time::Duration::from_millis(300)),
            sleeping_launcher(),
        );
        assert!(matches!(pool.acquire(), Err(ControlError::LaunchFailed(_))));
        assert!(pool.is_empty());
        // the reserved slot was given back
        assert!(matches!(pool.acquire(), Err(ControlError::LaunchFailed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn failed_launch_frees_reserved_capacity() {
        let launcher = ScriptLauncher::new("sh")
            .with_args(["-c", "exit 1", "sh"])
            .with_launch_timeout(std::time::Duration::from_secs(5));
        let pool = InstancePool::with_launcher(
            config(1).with_port_range(43100, 50),
            launcher,
        );
        assert!(matches!(pool.acquire(), Err(ControlError::LaunchFailed(_))));
        assert!(matches!(pool.acquire(), Err(ControlError::LaunchFailed(_))));
        assert!(pool.is_empty());
    }
}
