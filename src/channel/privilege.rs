use super::{RemoteSession, TransportError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Login,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    Root,
    SudoWithPassword(Credential),
    SudoNoPassword,
    Unprivileged,
}

impl PrivilegeMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::SudoWithPassword(Credential::Login) => "sudo-login-password",
            Self::SudoWithPassword(Credential::Root) => "sudo-root-password",
            Self::SudoNoPassword => "sudo-nopasswd",
            Self::Unprivileged => "unprivileged",
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub root_password: Option<String>,
}

impl Credentials {
    fn secret(&self, which: Credential) -> Option<&str> {
        match which {
            Credential::Login => self.password.as_deref(),
            Credential::Root => self.root_password.as_deref(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("root_password", &self.root_password.as_ref().map(|_| "***"))
            .finish()
    }
}

pub struct Wrapped {
    pub line: String,
    pub stdin: Option<String>,
}

/// Wraps `command` for the session's privilege mode. Commands go through
/// `sh -c` so that pipes and redirections run elevated as a whole.
pub fn wrap(mode: PrivilegeMode, credentials: &Credentials, command: &str) -> Wrapped {
    match mode {
        PrivilegeMode::Root | PrivilegeMode::Unprivileged => Wrapped {
            line: command.to_string(),
            stdin: None,
        },
        PrivilegeMode::SudoNoPassword => Wrapped {
            line: format!("sudo -n sh -c {}", shell_quote(command)),
            stdin: None,
        },
        PrivilegeMode::SudoWithPassword(which) => match credentials.secret(which) {
            Some(secret) => Wrapped {
                line: format!("sudo -S -p '' sh -c {}", shell_quote(command)),
                stdin: Some(format!("{secret}\n")),
            },
            None => Wrapped {
                line: command.to_string(),
                stdin: None,
            },
        },
    }
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Decides how commands on a freshly authenticated session get administrative
/// rights. Runs once per session.
pub async fn determine(
    session: &mut dyn RemoteSession,
    credentials: &Credentials,
    timeout: Duration,
) -> PrivilegeMode {
    if probe_uid(session, "id -u", None, timeout).await == Some(0) {
        debug!("session user is root");
        return PrivilegeMode::Root;
    }

    for which in [Credential::Login, Credential::Root] {
        let Some(secret) = credentials.secret(which) else {
            continue;
        };
        let stdin = format!("{secret}\n");
        if probe_uid(session, "sudo -S -p '' id -u", Some(&stdin), timeout).await == Some(0) {
            let mode = PrivilegeMode::SudoWithPassword(which);
            info!(mode = mode.label(), "elevation verified");
            return mode;
        }
    }

    if probe_uid(session, "sudo -n id -u", None, timeout).await == Some(0) {
        info!(mode = "sudo-nopasswd", "elevation verified");
        return PrivilegeMode::SudoNoPassword;
    }

    let fallback = if credentials.root_password.is_some() {
        PrivilegeMode::SudoWithPassword(Credential::Root)
    } else if credentials.password.is_some() {
        PrivilegeMode::SudoWithPassword(Credential::Login)
    } else {
        PrivilegeMode::Unprivileged
    };
    info!(mode = fallback.label(), "elevation not verified, using fallback mode");
    fallback
}

async fn probe_uid(
    session: &mut dyn RemoteSession,
    command: &str,
    stdin: Option<&str>,
    timeout: Duration,
) -> Option<u32> {
    let result = tokio::time::timeout(timeout, session.exec(command, stdin, timeout)).await;
    match result {
        Ok(Ok(out)) if out.exit_status == 0 => out.stdout.trim().parse().ok(),
        Ok(Ok(_)) => None,
        Ok(Err(err)) => {
            debug!(command, error = %err, "identity probe failed");
            None
        }
        Err(_) => {
            debug!(command, error = %TransportError::Timeout, "identity probe failed");
            None
        }
    }
}
