//! In-process stand-in for a Malmo simulator, scripted per test.

use std::collections::VecDeque;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use malmo_env::transport::FramedConnection;

/// Reply to one step message.
#[derive(Debug, Clone)]
pub struct StepScript {
    pub reward: f64,
    pub done: bool,
    pub sent: bool,
    pub turn_key: String,
}

impl StepScript {
    pub fn new(reward: f64, done: bool, sent: bool) -> Self {
        Self {
            reward,
            done,
            sent,
            turn_key: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Script {
    /// Mission submissions answered busy before one is accepted (`u32::MAX`: always busy).
    pub busy_replies: u32,
    pub ack_turn_key: String,
    /// Peeks answered with an empty observation before the real one.
    pub empty_peeks: u32,
    pub done_on_peek: bool,
    pub observation: Vec<u8>,
    pub info: String,
    pub steps: VecDeque<StepScript>,
    pub default_step: StepScript,
    pub integrated_port: u32,
    /// Close the connection instead of answering this step (1-based, over the simulator's life).
    pub drop_on_step: Option<u32>,
    /// After dropping, close every new connection right away.
    pub broken_after_drop: bool,
    pub status: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            busy_replies: 0,
            ack_turn_key: String::new(),
            empty_peeks: 0,
            done_on_peek: false,
            observation: b"frame".to_vec(),
            info: "{}".to_string(),
            steps: VecDeque::new(),
            default_step: StepScript::new(0.0, false, false),
            integrated_port: 25565,
            drop_on_step: None,
            broken_after_drop: false,
            status: "ready".to_string(),
        }
    }
}

/// Everything the simulator was told.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub connections: u32,
    pub missions: Vec<String>,
    pub mission_tokens: Vec<String>,
    pub step_messages: Vec<String>,
    pub turn_keys: Vec<String>,
    pub server_steps: u32,
    pub quits: u32,
    pub finds: Vec<String>,
    pub closes: Vec<String>,
    pub inits: Vec<String>,
}

#[derive(Debug)]
struct Shared {
    script: Script,
    recorded: Recorded,
    steps_seen: u32,
    broken: bool,
}

pub struct FakeSimulator {
    port: u16,
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeSimulator {
    pub fn start(script: Script) -> FakeSimulator {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Mutex::new(Shared {
            script,
            recorded: Recorded::default(),
            steps_seen: 0,
            broken: false,
        }));

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = accept_shared.clone();
                thread::spawn(move || serve(stream, shared));
            }
        });
        FakeSimulator { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn recorded(&self) -> Recorded {
        lock(&self.shared).recorded.clone()
    }
}

fn serve(stream: TcpStream, shared: Arc<Mutex<Shared>>) {
    let Ok(mut conn) = FramedConnection::from_stream(stream, Some(Duration::from_secs(30))) else {
        return;
    };
    if lock(&shared).broken {
        conn.shutdown();
        return;
    }
    // port probes connect and leave without a greeting
    match conn.recv_string() {
        Ok(greeting) if greeting.starts_with("<MalmoEnv") => {}
        _ => return,
    }
    lock(&shared).recorded.connections += 1;

    while let Ok(msg) = conn.recv_string() {
        match handle(&mut conn, &msg, &shared) {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
    }
    conn.shutdown();
}

fn step_code(msg: &str) -> Option<u8> {
    let rest = msg
        .strip_prefix("<StepClient")
        .or_else(|| msg.strip_prefix("<Step"))?;
    let digit = rest.chars().next()?.to_digit(10)?;
    Some(digit as u8)
}

fn tag_body<'a>(msg: &'a str, tag: &str) -> Option<&'a str> {
    msg.strip_prefix(&format!("<{tag}>"))?
        .strip_suffix(&format!("</{tag}>"))
}

fn step_reply(step: &StepScript) -> Vec<u8> {
    let mut bytes = step.reward.to_be_bytes().to_vec();
    bytes.push(step.done as u8);
    bytes.push(step.sent as u8);
    bytes
}

/// Answer one control message. `Ok(false)` ends the connection.
fn handle(conn: &mut FramedConnection, msg: &str, shared: &Mutex<Shared>) -> malmo_env::Result<bool> {
    if msg.starts_with("<MissionInit") {
        let token = conn.recv_string()?;
        let (status, key) = {
            let mut s = lock(shared);
            s.recorded.missions.push(msg.to_string());
            s.recorded.mission_tokens.push(token);
            if s.script.busy_replies > 0 {
                if s.script.busy_replies != u32::MAX {
                    s.script.busy_replies -= 1;
                }
                (0u32, String::new())
            } else {
                (1u32, s.script.ack_turn_key.clone())
            }
        };
        conn.send(&status.to_be_bytes())?;
        conn.send_str(&key)?;
    } else if msg == "<Peek/>" {
        let (obs, info, done) = {
            let mut s = lock(shared);
            if s.script.empty_peeks > 0 {
                s.script.empty_peeks -= 1;
                (vec![], String::new(), false)
            } else {
                (
                    s.script.observation.clone(),
                    s.script.info.clone(),
                    s.script.done_on_peek,
                )
            }
        };
        conn.send(&obs)?;
        conn.send_str(&info)?;
        conn.send(&[done as u8])?;
    } else if let Some(code) = step_code(msg) {
        let with_turn_key = code < 2;
        let with_info = code == 0 || code == 2;
        let key = if with_turn_key {
            Some(conn.recv_string()?)
        } else {
            None
        };
        let reply = {
            let mut s = lock(shared);
            s.steps_seen += 1;
            s.recorded.step_messages.push(msg.to_string());
            if let Some(key) = key {
                s.recorded.turn_keys.push(key);
            }
            if s.script.drop_on_step == Some(s.steps_seen) {
                s.broken = s.script.broken_after_drop;
                None
            } else {
                let step = s
                    .script
                    .steps
                    .pop_front()
                    .unwrap_or_else(|| s.script.default_step.clone());
                Some((step, s.script.observation.clone(), s.script.info.clone()))
            }
        };
        let Some((step, obs, info)) = reply else {
            return Ok(false);
        };
        conn.send(&obs)?;
        conn.send(&step_reply(&step))?;
        if with_info {
            conn.send_str(&info)?;
        }
        if with_turn_key {
            conn.send_str(&step.turn_key)?;
        }
    } else if msg.starts_with("<StepServer>") {
        lock(shared).recorded.server_steps += 1;
    } else if msg == "<Quit/>" {
        lock(shared).recorded.quits += 1;
        conn.send(&1u32.to_be_bytes())?;
    } else if let Some(token) = tag_body(msg, "Find") {
        let port = {
            let mut s = lock(shared);
            s.recorded.finds.push(token.to_string());
            s.script.integrated_port
        };
        conn.send(&port.to_be_bytes())?;
    } else if let Some(token) = tag_body(msg, "Close") {
        lock(shared).recorded.closes.push(token.to_string());
        conn.send(&1u32.to_be_bytes())?;
    } else if let Some(token) = tag_body(msg, "Init") {
        lock(shared).recorded.inits.push(token.to_string());
        conn.send(&1u32.to_be_bytes())?;
    } else if msg == "<Status/>" {
        let status = lock(shared).script.status.clone();
        conn.send_str(&status)?;
    } else if msg == "<Exit>NOW</Exit>" {
        conn.send(&1u32.to_be_bytes())?;
    } else {
        // <Disconnect/> and anything unknown end the connection
        return Ok(false);
    }
    Ok(true)
}
