use crate::availability::ReachabilityProbe;
use crate::channel::privilege::PrivilegeMode;
use crate::channel::{
    Channel, CommandError, CommandRunner, ConnectError, Connector, ExecOutput, RemoteSession,
    TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Reply {
    pub stdout: String,
    pub exit_status: i32,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self::with_status(stdout, 0)
    }

    pub fn exit(code: i32) -> Self {
        Self::with_status("", code)
    }

    pub fn with_status(stdout: &str, code: i32) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_status: code,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = Arc<dyn Fn(&str, Option<&str>) -> Reply + Send + Sync>;

fn handler(f: impl Fn(&str, Option<&str>) -> Reply + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

pub struct FakeSession {
    handler: Handler,
    alive: Arc<AtomicBool>,
    commands: Arc<Mutex<Vec<String>>>,
    counters: Option<Arc<Counters>>,
}

impl FakeSession {
    pub fn new(handler: impl Fn(&str, Option<&str>) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: self::handler(handler),
            alive: Arc::new(AtomicBool::new(true)),
            commands: Arc::new(Mutex::new(Vec::new())),
            counters: None,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&str>,
        _timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Other("connection reset".to_string()));
        }
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_string());
        let reply = (self.handler)(command, stdin);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ExecOutput {
            stdout: reply.stdout,
            exit_status: reply.exit_status,
        })
    }

    async fn close(&mut self) {
        if let Some(counters) = &self.counters {
            counters.closed.fetch_add(1, Ordering::SeqCst);
            counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Opens [`FakeSession`]s that log in as root and answer the liveness canary.
/// Everything else goes to the supplied handler.
pub struct FakeConnector {
    handler: Handler,
    counters: Arc<Counters>,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
    fail_opens: AtomicBool,
}

impl FakeConnector {
    pub fn new(handler: impl Fn(&str, Option<&str>) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: self::handler(handler),
            counters: Arc::new(Counters::default()),
            sessions: Mutex::new(Vec::new()),
            fail_opens: AtomicBool::new(false),
        }
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Breaks every session opened so far, as if the NAS dropped them.
    pub fn kill_sessions(&self) {
        for alive in self.sessions.lock().expect("sessions lock").iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, ConnectError> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport(TransportError::Other(
                "connection refused".to_string(),
            )));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);

        let inner = self.handler.clone();
        let handler = handler(move |cmd, stdin| {
            if cmd == "id -u" {
                return Reply::ok("0");
            }
            if let Some(rest) = cmd.strip_prefix("echo ") {
                return Reply::ok(rest);
            }
            inner(cmd, stdin)
        });
        let alive = Arc::new(AtomicBool::new(true));
        self.sessions
            .lock()
            .expect("sessions lock")
            .push(alive.clone());
        Ok(Box::new(FakeSession {
            handler,
            alive,
            commands: Arc::new(Mutex::new(Vec::new())),
            counters: Some(self.counters.clone()),
        }))
    }
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Output(String),
    Status(String, i32),
    Slow(Duration, String),
    Exit(i32),
    Timeout,
    Panic,
}

/// A [`CommandRunner`] answering from a command table. Unknown commands exit 127.
#[derive(Default)]
pub struct ScriptedRunner {
    table: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, stdout: &str) -> &Self {
        self.script(command, Scripted::Output(stdout.to_string()))
    }

    pub fn script(&self, command: &str, reply: Scripted) -> &Self {
        self.table
            .lock()
            .expect("table lock")
            .insert(command.to_string(), reply);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl ScriptedRunner {
    async fn answer(&self, command: &str) -> Result<ExecOutput, CommandError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(command.to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CommandError::Transport(TransportError::Other(
                "host unreachable".to_string(),
            )));
        }
        let reply = self.table.lock().expect("table lock").get(command).cloned();
        let (stdout, exit_status) = match reply {
            Some(Scripted::Output(out)) => (out, 0),
            Some(Scripted::Status(out, code)) => (out, code),
            Some(Scripted::Slow(delay, out)) => {
                tokio::time::sleep(delay).await;
                (out, 0)
            }
            Some(Scripted::Exit(code)) => (String::new(), code),
            Some(Scripted::Timeout) => {
                return Err(CommandError::Timeout(Duration::from_secs(10)))
            }
            Some(Scripted::Panic) => panic!("scripted panic for {command}"),
            None => (String::new(), 127),
        };
        Ok(ExecOutput {
            stdout: stdout.trim().to_string(),
            exit_status,
        })
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<String, CommandError> {
        let out = self.answer(command).await?;
        match out.exit_status {
            0 => Ok(out.stdout),
            code => Err(CommandError::Exit { code }),
        }
    }

    async fn run_once(&self, command: &str) -> Result<String, CommandError> {
        self.run(command).await
    }

    async fn run_status(&self, command: &str) -> Result<ExecOutput, CommandError> {
        self.answer(command).await
    }
}

#[async_trait]
impl Channel for ScriptedRunner {
    async fn connect(&self) -> Result<PrivilegeMode, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport(TransportError::Other(
                "host unreachable".to_string(),
            )));
        }
        Ok(PrivilegeMode::Root)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn runner(&self) -> &dyn CommandRunner {
        self
    }
}

pub struct FakeProbe {
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn reachable(&self, _host: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}
