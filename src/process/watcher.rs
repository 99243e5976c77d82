//! Companion process guaranteeing that a simulator never outlives the program that spawned it.
//!
//! The watcher is a separate OS process so it survives the death of its parent, including
//! deaths no exit hook can observe (SIGKILL, OOM killer). It is the `malmo-watcher` binary
//! when one is available, otherwise a copy of the current process forked by
//! [`fork_watcher`]. Either way it only polls two PIDs:
//!
//! - parent gone: kill the simulator and its descendants, then exit;
//! - simulator gone: exit quietly.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::reaper::{is_alive, kill_tree};
use crate::error::{ControlError, Result};

/// How often the watcher checks both PIDs.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File name of the watcher binary.
pub const WATCHER_BIN_NAME: &str = "malmo-watcher";

/// Why [`watch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The parent died and the child tree was reaped.
    ParentGone,
    /// The child exited on its own; nothing to do.
    ChildGone,
}

/// Poll `parent_pid` and `child_pid` until one of them disappears.
pub fn watch(
    parent_pid: u32,
    child_pid: u32,
    poll_interval: Duration,
    kill_timeout: Duration,
) -> WatchOutcome {
    info!(parent_pid, child_pid, "process watcher started");
    loop {
        if !is_alive(parent_pid) {
            info!("parent is not running, terminating the child");
            kill_tree(child_pid, kill_timeout);
            return WatchOutcome::ParentGone;
        }
        if !is_alive(child_pid) {
            info!("child is not running anymore, watcher can exit");
            return WatchOutcome::ChildGone;
        }
        std::thread::sleep(poll_interval);
    }
}

#[derive(Debug)]
enum Guard {
    Binary(Child),
    #[cfg(unix)]
    Forked(libc::pid_t),
}

/// Handle on a running watcher process. The watcher is stopped on drop.
#[derive(Debug)]
pub struct WatcherHandle {
    guard: Guard,
    stopped: bool,
}

impl WatcherHandle {
    pub fn pid(&self) -> u32 {
        match &self.guard {
            Guard::Binary(child) => child.id(),
            #[cfg(unix)]
            Guard::Forked(pid) => *pid as u32,
        }
    }

    /// True if the watcher runs in a forked copy of this process rather than the binary.
    pub fn is_forked(&self) -> bool {
        !matches!(self.guard, Guard::Binary(_))
    }

    /// True once the watcher process is gone, by itself or through [`WatcherHandle::stop`].
    pub fn has_exited(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        match &mut self.guard {
            Guard::Binary(child) => !matches!(child.try_wait(), Ok(None)),
            #[cfg(unix)]
            Guard::Forked(pid) => {
                let mut status = 0;
                // SAFETY: `pid` is a child of this process that only this handle waits for.
                let reaped = unsafe { libc::waitpid(*pid, &mut status, libc::WNOHANG) };
                if reaped != 0 {
                    self.stopped = true;
                }
                reaped != 0
            }
        }
    }

    /// Stop the watcher. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        match &mut self.guard {
            Guard::Binary(child) => {
                if let Err(e) = child.kill() {
                    debug!("watcher already exited: {e}");
                }
                let _ = child.wait();
            }
            #[cfg(unix)]
            Guard::Forked(pid) => {
                let mut status = 0;
                // SAFETY: signalling and reaping our own child.
                unsafe {
                    libc::kill(*pid, libc::SIGKILL);
                    libc::waitpid(*pid, &mut status, 0);
                }
            }
        }
        self.stopped = true;
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where the watcher binary is expected when no explicit path is configured: next to the
/// current executable, or one directory up (test harnesses run from `target/<profile>/deps`).
pub fn default_watcher_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let name = format!("{WATCHER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);
    let dir = exe.parent()?;
    [Some(dir.join(&name)), dir.parent().map(|up| up.join(&name))]
        .into_iter()
        .flatten()
        .find(|candidate| candidate.is_file())
}

/// Launch `binary` watching `parent_pid` and `child_pid`.
///
/// The watcher gets its own process group so a Ctrl-C aimed at the parent does not take the
/// watcher down with it.
#[instrument]
pub fn spawn_watcher(binary: &Path, parent_pid: u32, child_pid: u32) -> Result<WatcherHandle> {
    let mut cmd = Command::new(binary);
    cmd.arg(parent_pid.to_string())
        .arg(child_pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|e| {
        warn!("could not start watcher: {e}");
        ControlError::LaunchFailed(format!(
            "could not start process watcher '{}': {e}",
            binary.display()
        ))
    })?;
    debug!(watcher_pid = child.id(), "watcher launched");
    Ok(WatcherHandle {
        guard: Guard::Binary(child),
        stopped: false,
    })
}

/// Fork a watcher from the current process, for programs shipped without the
/// `malmo-watcher` binary.
///
/// The forked copy closes every inherited descriptor, moves to its own process group and then
/// only polls with `kill(pid, 0)`. When the parent is gone it sends SIGTERM to the child's
/// process group, then SIGKILL once `kill_timeout` elapsed.
#[cfg(unix)]
#[instrument]
pub fn fork_watcher(parent_pid: u32, child_pid: u32, kill_timeout: Duration) -> Result<WatcherHandle> {
    let parent = parent_pid as libc::pid_t;
    let child = child_pid as libc::pid_t;
    let poll = timespec(POLL_INTERVAL);
    let kill_polls = (kill_timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1) as u32;
    // SAFETY: sysconf has no preconditions.
    let max_fd = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(65_536) as libc::c_int,
        _ => 1024,
    };
    // SAFETY: getpid has no preconditions.
    let forker = unsafe { libc::getpid() };

    // SAFETY: the forked child only calls async-signal-safe functions on values computed
    // before the fork, and never returns.
    match unsafe { libc::fork() } {
        -1 => Err(ControlError::LaunchFailed(format!(
            "could not fork process watcher: {}",
            std::io::Error::last_os_error()
        ))),
        0 => unsafe { watch_forked(parent, forker, child, poll, kill_polls, max_fd) },
        pid => {
            debug!(watcher_pid = pid, "watcher forked");
            Ok(WatcherHandle {
                guard: Guard::Forked(pid),
                stopped: false,
            })
        }
    }
}

#[cfg(not(unix))]
pub fn fork_watcher(_parent_pid: u32, child_pid: u32, _kill_timeout: Duration) -> Result<WatcherHandle> {
    Err(ControlError::LaunchFailed(format!(
        "no {WATCHER_BIN_NAME} binary available to guard simulator {child_pid}"
    )))
}

#[cfg(unix)]
fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

#[cfg(unix)]
fn exists(pid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks that `pid` can be signalled.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Body of a forked watcher.
///
/// # Safety
/// Must only run in the child of a `fork`.
#[cfg(unix)]
unsafe fn watch_forked(
    parent: libc::pid_t,
    forker: libc::pid_t,
    child: libc::pid_t,
    poll: libc::timespec,
    kill_polls: u32,
    max_fd: libc::c_int,
) -> ! {
    for fd in 3..max_fd {
        libc::close(fd);
    }
    libc::setpgid(0, 0);

    loop {
        let parent_gone = !exists(parent) || (parent == forker && libc::getppid() != forker);
        if parent_gone {
            break;
        }
        if !exists(child) {
            libc::_exit(0);
        }
        libc::nanosleep(&poll, std::ptr::null_mut());
    }

    libc::kill(-child, libc::SIGTERM);
    libc::kill(child, libc::SIGTERM);
    for _ in 0..kill_polls {
        if !exists(child) {
            libc::_exit(0);
        }
        libc::nanosleep(&poll, std::ptr::null_mut());
    }
    libc::kill(-child, libc::SIGKILL);
    libc::kill(child, libc::SIGKILL);
    libc::_exit(0)
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Command;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn child_exit_ends_the_watch() {
        let parent = std::process::id();
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let outcome = watch(parent, pid, Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(outcome, WatchOutcome::ChildGone);
    }

    fn sleep_in_own_group() -> std::process::Child {
        use std::os::unix::process::CommandExt;
        Command::new("sleep").arg("30").process_group(0).spawn().unwrap()
    }

    fn wait_exit(child: &mut std::process::Child, max: Duration) -> bool {
        let deadline = Instant::now() + max;
        while Instant::now() < deadline {
            if child.try_wait().unwrap().is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn forked_watcher_reaps_orphaned_child() {
        let mut parent = Command::new("sleep").arg("30").spawn().unwrap();
        let mut child = sleep_in_own_group();
        let mut watcher =
            fork_watcher(parent.id(), child.id(), Duration::from_millis(300)).unwrap();
        assert!(watcher.is_forked());

        thread::sleep(Duration::from_millis(300));
        assert!(!watcher.has_exited());

        parent.kill().unwrap();
        parent.wait().unwrap();
        assert!(wait_exit(&mut child, Duration::from_secs(5)), "child survived its parent");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !watcher.has_exited() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(watcher.has_exited());
    }

    #[test]
    fn forked_watcher_stops_on_drop() {
        let mut child = sleep_in_own_group();
        let watcher =
            fork_watcher(std::process::id(), child.id(), Duration::from_millis(300)).unwrap();
        let pid = watcher.pid();
        assert!(is_alive(pid));

        drop(watcher);
        assert!(!is_alive(pid));
        // the watched process is left alone
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn parent_death_reaps_the_child() {
        let mut parent = Command::new("sleep").arg("30").spawn().unwrap();
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (parent_pid, child_pid) = (parent.id(), child.id());

        let watcher = thread::spawn(move || {
            watch(parent_pid, child_pid, POLL_INTERVAL, Duration::from_secs(1))
        });

        parent.kill().unwrap();
        parent.wait().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut exited = None;
        while exited.is_none() && Instant::now() < deadline {
            exited = child.try_wait().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(exited.is_some(), "child survived its parent");
        assert_eq!(watcher.join().unwrap(), WatchOutcome::ParentGone);
    }
}
