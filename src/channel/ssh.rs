use super::{ConnectError, Connector, ExecOutput, RemoteSession, TransportError};
use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: Option<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password,
            connect_timeout,
        }
    }

    fn connect_blocking(&self) -> Result<Session, ConnectError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(TransportError::from)?
            .next()
            .ok_or_else(|| {
                TransportError::Other(format!("{} did not resolve to an address", self.host))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(TransportError::from)?;

        let mut session = Session::new().map_err(TransportError::from)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.connect_timeout));
        session
            .handshake()
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        match &self.password {
            Some(password) => session.userauth_password(&self.username, password),
            None => session.userauth_agent(&self.username),
        }
        .map_err(|e| ConnectError::Auth(e.to_string()))?;

        if !session.authenticated() {
            return Err(ConnectError::Auth("server rejected credentials".to_string()));
        }
        Ok(session)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let connector = self.clone();
        let session = tokio::task::spawn_blocking(move || connector.connect_blocking())
            .await
            .map_err(|e| TransportError::Other(format!("connect task failed: {e}")))??;
        debug!(host = %self.host, port = self.port, "ssh transport authenticated");
        Ok(Box::new(SshSession {
            inner: Arc::new(Mutex::new(session)),
        }))
    }
}

struct SshSession {
    inner: Arc<Mutex<Session>>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        let inner = self.inner.clone();
        let command = command.to_string();
        let stdin = stdin.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let session = inner
                .lock()
                .map_err(|_| TransportError::Other("ssh session lock poisoned".to_string()))?;
            exec_blocking(&session, &command, stdin.as_deref(), timeout)
        })
        .await
        .map_err(|e| TransportError::Other(format!("exec task failed: {e}")))?
    }

    async fn close(&mut self) {
        let inner = self.inner.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(session) = inner.lock() {
                let _ = session.disconnect(None, "closing", None);
            }
        })
        .await;
    }
}

fn exec_blocking(
    session: &Session,
    command: &str,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<ExecOutput, TransportError> {
    session.set_timeout(millis(timeout));
    let mut channel = session.channel_session()?;
    // Unread stderr would fill the window and stall the stdout read.
    channel.handle_extended_data(ExtendedData::Ignore)?;
    channel.exec(command)?;
    if let Some(input) = stdin {
        channel.write_all(input.as_bytes())?;
    }
    channel.send_eof()?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    channel.wait_close()?;
    let exit_status = channel.exit_status()?;
    if exit_status != 0 {
        debug!(exit_status, "remote command exited non-zero");
    }
    Ok(ExecOutput {
        stdout,
        exit_status,
    })
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}
