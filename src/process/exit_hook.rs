//! Last-resort cleanup of simulators still registered when the program exits normally.
//!
//! Pools kill their instances on drop, and watchers cover abrupt deaths. This list covers the
//! gap of leaked pools (`std::mem::forget`, statics, `std::process::exit` from deep inside
//! the program).

use std::sync::{Mutex, Once};
#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
use super::reaper::kill_tree;

static LIVE: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static INSTALL: Once = Once::new();

pub(crate) fn register(pid: u32) {
    INSTALL.call_once(install);
    LIVE.lock().unwrap_or_else(|e| e.into_inner()).push(pid);
}

pub(crate) fn unregister(pid: u32) {
    LIVE.lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|p| *p != pid);
}

#[cfg(test)]
pub(crate) fn is_registered(pid: u32) -> bool {
    LIVE.lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&pid)
}

#[cfg(unix)]
fn install() {
    // SAFETY: `reap_registered` is a plain `extern "C" fn()` that never unwinds.
    unsafe {
        libc::atexit(reap_registered);
    }
}

#[cfg(not(unix))]
fn install() {}

#[cfg(unix)]
extern "C" fn reap_registered() {
    let _ = std::panic::catch_unwind(|| {
        let pids = std::mem::take(&mut *LIVE.lock().unwrap_or_else(|e| e.into_inner()));
        for pid in pids {
            kill_tree(pid, Duration::from_millis(500));
        }
    });
}
