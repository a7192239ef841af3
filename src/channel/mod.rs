pub mod privilege;
pub mod ssh;

use async_trait::async_trait;
use privilege::{Credentials, PrivilegeMode};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;

pub(crate) const CANARY_TOKEN: &str = "nasmond-canary";

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_status: i32,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(std::io::Error),
    #[error("ssh error: {0}")]
    Ssh(ssh2::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}

impl From<ssh2::Error> for TransportError {
    fn from(err: ssh2::Error) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => Self::Timeout,
            _ => Self::Ssh(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("ssh handshake failed: {0}")]
    Handshake(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("no session slot became free within {0:?}")]
    PoolExhausted(Duration),
    #[error("command channel is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command exited with status {code}")]
    Exit { code: i32 },
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("no session available: {0}")]
    Connect(#[from] ConnectError),
}

#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, ConnectError>;
}

/// Runs a command on the NAS with administrative rights and returns trimmed stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String, CommandError>;

    /// Like `run` but never retried. For commands with side effects.
    async fn run_once(&self, command: &str) -> Result<String, CommandError>;

    /// For tools whose exit status carries data: any exit status is returned
    /// alongside stdout instead of failing the command.
    async fn run_status(&self, command: &str) -> Result<ExecOutput, CommandError>;
}

#[async_trait]
pub trait Channel: CommandRunner {
    /// Makes sure at least one working session exists and reports its privilege mode.
    async fn connect(&self) -> Result<PrivilegeMode, ConnectError>;

    async fn disconnect(&self);

    fn runner(&self) -> &dyn CommandRunner;
}

#[derive(Debug, Clone)]
pub struct ChannelPolicy {
    pub max_connections: usize,
    pub canary_timeout: Duration,
    pub command_timeout: Duration,
    pub elevation_timeout: Duration,
    pub attempts: u32,
    pub benign_exit_codes: Vec<i32>,
    pub slot_wait: Duration,
}

impl ChannelPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_connections: cfg.max_connections,
            canary_timeout: Duration::from_secs(cfg.channel.canary_timeout_secs),
            command_timeout: Duration::from_secs(cfg.channel.command_timeout_secs),
            elevation_timeout: Duration::from_secs(cfg.channel.elevation_timeout_secs),
            attempts: cfg.channel.command_attempts,
            benign_exit_codes: cfg.channel.benign_exit_codes.clone(),
            slot_wait: Duration::from_secs(cfg.channel.slot_wait_secs),
        }
    }
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            max_connections: 5,
            canary_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
            elevation_timeout: Duration::from_secs(10),
            attempts: 2,
            benign_exit_codes: vec![4, 32],
            slot_wait: Duration::from_secs(30),
        }
    }
}

struct PooledSession {
    id: u64,
    session: Box<dyn RemoteSession>,
    privilege: PrivilegeMode,
}

struct Lease {
    pooled: PooledSession,
    _permit: OwnedSemaphorePermit,
}

pub struct CommandChannel {
    host: String,
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    policy: ChannelPolicy,
    idle: Mutex<Vec<PooledSession>>,
    permits: Arc<Semaphore>,
    live: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl CommandChannel {
    pub fn new(
        host: impl Into<String>,
        connector: Arc<dyn Connector>,
        credentials: Credentials,
        policy: ChannelPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_connections));
        Self {
            host: host.into(),
            connector,
            credentials,
            policy,
            idle: Mutex::new(Vec::new()),
            permits,
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        let idle = self.idle_sessions();
        self.close_idle().await;
        info!(
            host = %self.host,
            closed = idle,
            still_busy = self.live_sessions(),
            "command channel shut down"
        );
    }

    /// Closes every idle session. Sessions currently borrowed are closed or
    /// pooled again when their command finishes.
    async fn close_idle(&self) {
        let drained: Vec<PooledSession> = self.idle_guard().drain(..).collect();
        if !drained.is_empty() {
            debug!(host = %self.host, sessions = drained.len(), "closing idle sessions");
        }
        for pooled in drained {
            self.discard(pooled).await;
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle_sessions(&self) -> usize {
        self.idle_guard().len()
    }

    fn idle_guard(&self) -> MutexGuard<'_, Vec<PooledSession>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn checkout(&self) -> Result<Lease, ConnectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        let permit = tokio::time::timeout(
            self.policy.slot_wait,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| ConnectError::PoolExhausted(self.policy.slot_wait))?
        .map_err(|_| ConnectError::Closed)?;

        loop {
            let candidate = self.idle_guard().pop();
            if let Some(mut pooled) = candidate {
                if self.canary(&mut pooled).await {
                    return Ok(Lease {
                        pooled,
                        _permit: permit,
                    });
                }
                debug!(host = %self.host, session = pooled.id, "session failed liveness check");
                self.discard(pooled).await;
                continue;
            }

            let max = self.policy.max_connections;
            let reserved = self
                .live
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok();
            if !reserved {
                // A session was checked in between the pop and the reservation.
                tokio::task::yield_now().await;
                continue;
            }

            return match self.open_session().await {
                Ok(pooled) => Ok(Lease {
                    pooled,
                    _permit: permit,
                }),
                Err(err) => {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    Err(err)
                }
            };
        }
    }

    async fn open_session(&self) -> Result<PooledSession, ConnectError> {
        let mut session = self.connector.open().await?;
        let privilege = privilege::determine(
            session.as_mut(),
            &self.credentials,
            self.policy.elevation_timeout,
        )
        .await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!(
            host = %self.host,
            session = id,
            mode = privilege.label(),
            "ssh session established"
        );
        Ok(PooledSession {
            id,
            session,
            privilege,
        })
    }

    async fn canary(&self, pooled: &mut PooledSession) -> bool {
        let command = format!("echo {CANARY_TOKEN}");
        let timeout = self.policy.canary_timeout;
        match tokio::time::timeout(timeout, pooled.session.exec(&command, None, timeout)).await {
            Ok(Ok(out)) => out.exit_status == 0 && out.stdout.trim() == CANARY_TOKEN,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    async fn checkin(&self, lease: Lease) {
        let Lease { pooled, _permit } = lease;
        if self.closed.load(Ordering::SeqCst) {
            self.discard(pooled).await;
            return;
        }
        let overflow = {
            let mut idle = self.idle_guard();
            if idle.len() < self.policy.max_connections {
                idle.push(pooled);
                None
            } else {
                Some(pooled)
            }
        };
        if let Some(pooled) = overflow {
            self.discard(pooled).await;
        }
    }

    async fn discard(&self, mut pooled: PooledSession) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        pooled.session.close().await;
        debug!(host = %self.host, session = pooled.id, "session closed");
    }

    /// One command on one borrowed session. Timeouts and transport errors
    /// always discard the session, as does a failing exit status unless
    /// `any_status` is set.
    async fn attempt(&self, command: &str, any_status: bool) -> Result<ExecOutput, CommandError> {
        let mut lease = self.checkout().await?;
        let wrapped = privilege::wrap(lease.pooled.privilege, &self.credentials, command);
        let timeout = self.policy.command_timeout;
        let result = tokio::time::timeout(
            timeout,
            lease
                .pooled
                .session
                .exec(&wrapped.line, wrapped.stdin.as_deref(), timeout),
        )
        .await;

        let outcome = match result {
            Ok(Ok(out)) if out.exit_status == 0 || any_status => Ok(out),
            Ok(Ok(out)) if self.policy.benign_exit_codes.contains(&out.exit_status) => {
                debug!(command, code = out.exit_status, "benign exit status, no data");
                Ok(ExecOutput {
                    stdout: String::new(),
                    exit_status: out.exit_status,
                })
            }
            Ok(Ok(out)) => Err(CommandError::Exit {
                code: out.exit_status,
            }),
            Ok(Err(TransportError::Timeout)) | Err(_) => Err(CommandError::Timeout(timeout)),
            Ok(Err(err)) => Err(CommandError::Transport(err)),
        };

        match outcome {
            Ok(out) => {
                self.checkin(lease).await;
                Ok(ExecOutput {
                    stdout: out.stdout.trim().to_string(),
                    exit_status: out.exit_status,
                })
            }
            Err(err) => {
                let Lease { pooled, _permit } = lease;
                self.discard(pooled).await;
                Err(err)
            }
        }
    }

    async fn attempt_with_retries(
        &self,
        command: &str,
        any_status: bool,
    ) -> Result<ExecOutput, CommandError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(command, any_status).await {
                Ok(out) => return Ok(out),
                Err(err @ CommandError::Connect(ConnectError::Closed)) => return Err(err),
                Err(err) if attempt >= attempts => {
                    warn!(host = %self.host, command, attempt, error = %err, "command failed");
                    return Err(err);
                }
                Err(err) => {
                    debug!(host = %self.host, command, attempt, error = %err, "command failed, retrying on a fresh session");
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl CommandRunner for CommandChannel {
    async fn run(&self, command: &str) -> Result<String, CommandError> {
        self.attempt_with_retries(command, false)
            .await
            .map(|out| out.stdout)
    }

    async fn run_once(&self, command: &str) -> Result<String, CommandError> {
        match self.attempt(command, false).await {
            Ok(out) => Ok(out.stdout),
            Err(err) => {
                warn!(host = %self.host, command, error = %err, "command failed, not retried");
                Err(err)
            }
        }
    }

    async fn run_status(&self, command: &str) -> Result<ExecOutput, CommandError> {
        self.attempt_with_retries(command, true).await
    }
}

#[async_trait]
impl Channel for CommandChannel {
    async fn connect(&self) -> Result<PrivilegeMode, ConnectError> {
        let lease = self.checkout().await?;
        let mode = lease.pooled.privilege;
        self.checkin(lease).await;
        Ok(mode)
    }

    async fn disconnect(&self) {
        self.close_idle().await;
    }

    fn runner(&self) -> &dyn CommandRunner {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeConnector, Reply};

    fn channel(connector: Arc<FakeConnector>, max: usize) -> CommandChannel {
        CommandChannel::new(
            "nas.test",
            connector,
            Credentials::default(),
            ChannelPolicy {
                max_connections: max,
                ..ChannelPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn runs_command_and_reuses_session() {
        let connector = Arc::new(FakeConnector::new(|cmd, _| match cmd {
            "uptime" => Reply::ok("  up 3 days \n"),
            _ => Reply::exit(1),
        }));
        let ch = channel(connector.clone(), 3);

        assert_eq!(ch.run("uptime").await.expect("run"), "up 3 days");
        assert_eq!(ch.run("uptime").await.expect("run"), "up 3 days");
        assert_eq!(connector.opened(), 1);
        assert_eq!(ch.live_sessions(), 1);
        assert_eq!(ch.idle_sessions(), 1);
    }

    #[tokio::test]
    async fn benign_exit_returns_empty_and_keeps_session() {
        let connector = Arc::new(FakeConnector::new(|cmd, _| match cmd {
            "smartctl -i /dev/sdb" => Reply::with_status("partial", 4),
            _ => Reply::ok("fine"),
        }));
        let ch = channel(connector.clone(), 3);

        assert_eq!(ch.run("smartctl -i /dev/sdb").await.expect("benign"), "");
        assert_eq!(ch.run("echo again").await.expect("run"), "again");
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_discards_session_and_retries_within_budget() {
        let connector = Arc::new(FakeConnector::new(|cmd, _| match cmd {
            "hang" => Reply::ok("late").delayed(Duration::from_secs(60)),
            _ => Reply::ok(""),
        }));
        let ch = channel(connector.clone(), 3);

        let err = ch.run("hang").await.expect_err("must time out");
        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.closed(), 2);
        assert_eq!(ch.live_sessions(), 0);
    }

    #[tokio::test]
    async fn failing_exit_status_is_an_error_after_retries() {
        let connector = Arc::new(FakeConnector::new(|_, _| Reply::exit(2)));
        let ch = channel(connector.clone(), 3);

        let err = ch.run("false").await.expect_err("must fail");
        assert!(matches!(err, CommandError::Exit { code: 2 }));
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_does_not_retry_a_timeout() {
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = issued.clone();
        let connector = Arc::new(FakeConnector::new(move |cmd, _| match cmd {
            "reboot" => {
                counter.fetch_add(1, Ordering::SeqCst);
                Reply::ok("").delayed(Duration::from_secs(60))
            }
            _ => Reply::ok(""),
        }));
        let ch = channel(connector.clone(), 3);

        let err = ch.run_once("reboot").await.expect_err("must time out");
        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(issued.load(Ordering::SeqCst), 1);
        assert_eq!(connector.opened(), 1);
        assert_eq!(ch.live_sessions(), 0);
    }

    #[tokio::test]
    async fn run_status_returns_output_with_any_exit_status() {
        let connector = Arc::new(FakeConnector::new(|cmd, _| match cmd {
            "smartctl -H /dev/sda" => Reply::with_status("result: FAILED!\n", 8),
            _ => Reply::ok("x"),
        }));
        let ch = channel(connector.clone(), 3);

        let out = ch.run_status("smartctl -H /dev/sda").await.expect("status");
        assert_eq!(out.exit_status, 8);
        assert_eq!(out.stdout, "result: FAILED!");
        assert_eq!(ch.run("again").await.expect("run"), "x");
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.closed(), 0);
    }

    #[tokio::test]
    async fn dead_idle_session_is_replaced() {
        let connector = Arc::new(FakeConnector::new(|_, _| Reply::ok("x")));
        let ch = channel(connector.clone(), 3);

        ch.connect().await.expect("connect");
        connector.kill_sessions();
        assert_eq!(ch.run("anything").await.expect("run"), "x");
        assert_eq!(connector.opened(), 2);
        assert_eq!(ch.live_sessions(), 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_after_retries() {
        let connector = Arc::new(FakeConnector::new(|_, _| Reply::ok("x")));
        connector.fail_opens(true);
        let ch = channel(connector.clone(), 3);

        let err = ch.run("anything").await.expect_err("no session");
        assert!(matches!(err, CommandError::Connect(_)));
        assert_eq!(ch.live_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_load_never_exceeds_ceiling() {
        let connector = Arc::new(FakeConnector::new(|_, _| {
            Reply::ok("done").delayed(Duration::from_millis(20))
        }));
        let ch = Arc::new(channel(connector.clone(), 2));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let ch = ch.clone();
            tasks.push(tokio::spawn(async move { ch.run("work").await }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("join").expect("run"), "done");
        }

        assert!(connector.peak_live() <= 2, "peak {}", connector.peak_live());
        assert!(ch.live_sessions() <= 2);
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_commands() {
        let connector = Arc::new(FakeConnector::new(|_, _| Reply::ok("x")));
        let ch = channel(connector.clone(), 3);
        ch.connect().await.expect("connect");

        ch.shutdown().await;
        assert_eq!(connector.live(), 0);
        let err = ch.run("anything").await.expect_err("closed");
        assert!(matches!(err, CommandError::Connect(ConnectError::Closed)));
    }
}
