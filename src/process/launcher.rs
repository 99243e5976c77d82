use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::exit_hook;
use super::reaper::kill_tree;
use crate::configuration::Configuration;
use crate::error::{ControlError, Result};

/// Line printed by the simulator once it accepts control connections.
pub const READY_MARKER: &str = "CLIENT enter state: DORMANT";

/// Starts simulators. The pool goes through this seam whenever it needs a new instance.
pub trait SimulatorLauncher: Send + Sync + std::fmt::Debug {
    /// Start a simulator listening on `port` and block until it is ready.
    fn launch(&self, port: u16) -> Result<SimulatorProcess>;
}

/// A running simulator child process.
///
/// The process tree is killed on drop.
#[derive(Debug)]
pub struct SimulatorProcess {
    child: Child,
    port: u16,
    killed: bool,
    output: Option<JoinHandle<()>>,
}

impl SimulatorProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True once the process has exited (or was killed).
    pub fn has_exited(&mut self) -> bool {
        self.killed || !matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process and its descendants: SIGTERM, then SIGKILL after `max_duration`.
    /// Idempotent.
    pub fn kill(&mut self, max_duration: Duration) {
        if self.killed {
            return;
        }
        let pid = self.pid();
        kill_tree(pid, max_duration);
        let _ = self.child.kill();
        let _ = self.child.wait();
        exit_hook::unregister(pid);
        // the output thread ends by itself once the pipes close
        self.output.take();
        self.killed = true;
        info!(pid, port = self.port, "simulator process killed");
    }
}

impl Drop for SimulatorProcess {
    fn drop(&mut self) {
        self.kill(Duration::from_secs(1));
    }
}

/// Launches the simulator through its launch script: `<program> <args..> -port <port> -env`.
///
/// Output of the simulator (stdout and stderr) is scanned for [`READY_MARKER`]. Once ready,
/// the output keeps being drained to `<output_log_dir>/logs/minecraft_proc_<port>.log`.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    ready_marker: String,
    launch_timeout: Duration,
    kill_timeout: Duration,
    output_log_dir: Option<PathBuf>,
}

impl ScriptLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            ready_marker: READY_MARKER.to_string(),
            launch_timeout: Duration::from_secs(600),
            kill_timeout: Duration::from_secs(5),
            output_log_dir: None,
        }
    }

    /// The stock `launchClient` script of the Malmo Minecraft directory.
    pub fn from_config(config: &Configuration) -> Self {
        let script = if cfg!(windows) {
            "launchClient.bat"
        } else {
            "launchClient.sh"
        };
        Self {
            cwd: Some(config.minecraft_dir.clone()),
            launch_timeout: config.launch_timeout,
            kill_timeout: config.kill_timeout,
            output_log_dir: Some(config.output_log_dir.clone()),
            ..Self::new(config.minecraft_dir.join(script))
        }
    }

    /// Arguments placed before `-port <port> -env`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn with_launch_timeout(mut self, duration: Duration) -> Self {
        self.launch_timeout = duration;
        self
    }

    pub fn with_output_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_log_dir = Some(dir.into());
        self
    }
}

impl SimulatorLauncher for ScriptLauncher {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    fn launch(&self, port: u16) -> Result<SimulatorProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-port")
            .arg(port.to_string())
            .arg("-env")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            // own process group, so the whole tree can be signalled and Ctrl-C stays with us
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(?cmd, "starting simulator process");
        let mut child = cmd.spawn().map_err(|e| {
            ControlError::LaunchFailed(format!(
                "could not start '{}': {e}",
                self.program.display()
            ))
        })?;
        exit_hook::register(child.id());

        let (tx, rx) = mpsc::channel();
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx);
        }

        let mut process = SimulatorProcess {
            child,
            port,
            killed: false,
            output: None,
        };

        let deadline = Instant::now() + self.launch_timeout;
        let mut early_lines = vec![];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    debug!(port, "{line}");
                    if let Some(msg) = check_for_launch_errors(&line) {
                        process.kill(self.kill_timeout);
                        return Err(ControlError::LaunchFailed(msg.to_string()));
                    }
                    let ready = line.contains(&self.ready_marker);
                    early_lines.push(line);
                    if ready {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    error!(port, "simulator did not become ready in time");
                    process.kill(self.kill_timeout);
                    return Err(ControlError::LaunchTimeout {
                        port,
                        waited: self.launch_timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    process.kill(self.kill_timeout);
                    return Err(ControlError::LaunchFailed(
                        "simulator process finished unexpectedly".to_string(),
                    ));
                }
            }
        }

        info!(port, pid = process.pid(), "simulator process ready");
        process.output = Some(spawn_output_logger(
            rx,
            early_lines,
            self.output_log_dir.clone(),
            port,
        ));
        Ok(process)
    }
}

fn forward_lines(stream: impl Read + Send + 'static, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn check_for_launch_errors(line: &str) -> Option<&'static str> {
    if line.contains("at org.lwjgl.opengl.Display.<clinit>") {
        return Some(
            "no X server, monitor or virtual monitor detected; run headless simulators under a \
             software renderer such as `xvfb-run`, or check the DISPLAY variable",
        );
    }
    None
}

fn open_log_file(dir: Option<PathBuf>, port: u16) -> Option<File> {
    let dir = dir?.join("logs");
    let path = dir.join(format!("minecraft_proc_{port}.log"));
    let file = fs::create_dir_all(&dir).and_then(|_| File::create(&path));
    match file {
        Ok(file) => {
            info!("logging output of simulator to {}", path.display());
            Some(file)
        }
        Err(e) => {
            warn!("could not create simulator log file {}: {e}", path.display());
            None
        }
    }
}

fn spawn_output_logger(
    rx: Receiver<String>,
    early_lines: Vec<String>,
    dir: Option<PathBuf>,
    port: u16,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut file = open_log_file(dir, port);
        let mut write = |line: &str| {
            if let Some(f) = file.as_mut() {
                let _ = writeln!(f, "{line}");
            }
        };
        for line in &early_lines {
            write(line);
        }
        for line in rx {
            if (line.contains("STDERR") || line.contains("ERROR")) && !line.contains("hitResult") {
                error!(port, "{line}");
            } else if line.contains("LOGTOPY") {
                info!(port, "{line}");
            }
            write(&line);
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ScriptLauncher {
        ScriptLauncher::new("sh").with_args(["-c", script, "sh"])
    }

    #[test]
    fn waits_for_ready_marker_then_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = shell(
            "echo booting; echo 'CLIENT enter state: DORMANT'; echo 'LOGTOPY hello'; sleep 30",
        )
        .with_launch_timeout(Duration::from_secs(5))
        .with_output_log_dir(dir.path());

        let mut process = launcher.launch(9123).unwrap();
        assert!(!process.has_exited());
        assert!(exit_hook::is_registered(process.pid()));

        let log = dir.path().join("logs").join("minecraft_proc_9123.log");
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut content = String::new();
        while !content.contains("LOGTOPY") && Instant::now() < deadline {
            content = fs::read_to_string(&log).unwrap_or_default();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(content.contains("booting"), "{content}");
        assert!(content.contains("LOGTOPY hello"), "{content}");

        let pid = process.pid();
        process.kill(Duration::from_secs(1));
        assert!(process.has_exited());
        assert!(!exit_hook::is_registered(pid));
        // second kill is a no-op
        process.kill(Duration::from_secs(1));
    }

    #[test]
    fn silent_simulator_times_out() {
        let launcher = shell("sleep 30").with_launch_timeout(Duration::from_millis(300));
        let err = launcher.launch(9124).unwrap_err();
        assert!(
            matches!(err, ControlError::LaunchTimeout { port: 9124, .. }),
            "{err}"
        );
    }

    #[test]
    fn early_exit_is_a_launch_failure() {
        let launcher = shell("echo crashing; exit 3").with_launch_timeout(Duration::from_secs(5));
        let err = launcher.launch(9125).unwrap_err();
        assert!(matches!(err, ControlError::LaunchFailed(_)), "{err}");
    }

    #[test]
    fn missing_display_is_reported() {
        let launcher = shell("echo '    at org.lwjgl.opengl.Display.<clinit>(Display.java:138)'; sleep 30")
            .with_launch_timeout(Duration::from_secs(5));
        let err = launcher.launch(9126).unwrap_err();
        assert!(err.to_string().contains("X server"), "{err}");
    }
}
