//! Watches a simulator on behalf of the process that launched it.
//!
//! Usage: `malmo-watcher <parent_pid> <child_pid>`

use std::{env, time::Duration};

use anyhow::{bail, Context};

use malmo_env::{logger, process};

fn main() -> anyhow::Result<()> {
    let mut args = env::args();
    let _ = args.next(); // Skip binary name

    let (Some(parent), Some(child)) = (args.next(), args.next()) else {
        bail!("usage: malmo-watcher <parent_pid> <child_pid>");
    };
    let parent_pid: u32 = parent
        .parse()
        .with_context(|| format!("invalid parent pid '{parent}'"))?;
    let child_pid: u32 = child
        .parse()
        .with_context(|| format!("invalid child pid '{child}'"))?;

    if env::var("MALMO_LOG").is_ok_and(|val| val.eq_ignore_ascii_case("true")) {
        logger::init_logger()?;
    }

    process::watch(
        parent_pid,
        child_pid,
        process::POLL_INTERVAL,
        Duration::from_secs(5),
    );
    Ok(())
}
