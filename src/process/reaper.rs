use std::collections::HashMap;
use std::time::{Duration, Instant};

use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

fn is_running(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// True while `pid` exists and is neither a zombie nor dead.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some_and(is_running)
}

/// Every process below `root`, parents before their children.
fn descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut ordered = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if *kid != root && !ordered.contains(kid) {
                    ordered.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
    }
    ordered
}

fn wait_until_gone(sys: &mut System, targets: &[Pid], max_duration: Duration) -> bool {
    let deadline = Instant::now() + max_duration;
    loop {
        sys.refresh_processes(ProcessesToUpdate::Some(targets), true);
        let alive = targets
            .iter()
            .filter(|pid| sys.process(**pid).is_some_and(is_running))
            .count();
        if alive == 0 {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20).min(max_duration / 10 + Duration::from_millis(1)));
    }
}

/// Terminate `pid` and all of its descendants.
///
/// Children are signalled before their parents with SIGTERM; whatever survives
/// `max_duration` gets SIGKILL. Killing a process that is already gone is a no-op.
/// Returns false if something survived SIGKILL as well.
pub fn kill_tree(pid: u32, max_duration: Duration) -> bool {
    let root = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    if !sys.process(root).is_some_and(is_running) {
        debug!(pid, "process already gone");
        return true;
    }

    let mut targets = descendants(&sys, root);
    targets.reverse();
    targets.push(root);
    info!(pid, tree = targets.len(), "terminating process tree");

    for target in &targets {
        if let Some(process) = sys.process(*target) {
            if process.kill_with(Signal::Term).is_none() {
                // SIGTERM unsupported on this platform
                process.kill();
            }
        }
    }
    if wait_until_gone(&mut sys, &targets, max_duration) {
        return true;
    }

    for target in &targets {
        if let Some(process) = sys.process(*target) {
            if is_running(process) {
                warn!(pid = target.as_u32(), "process survived SIGTERM; trying SIGKILL");
                process.kill();
            }
        }
    }
    let gone = wait_until_gone(&mut sys, &targets, max_duration);
    if !gone {
        warn!(pid, "process tree survived SIGKILL; giving up");
    }
    gone
}
