use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::privilege::shell_quote;
use crate::channel::{CommandError, CommandRunner};
use crate::metrics::Metrics;
use crate::state::{ContainerState, HostStatus, SnapshotStore, VmState};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("{0} control is disabled")]
    CapabilityDisabled(&'static str),
    #[error("`{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: CommandError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Shutdown,
    Reboot,
}

impl VmAction {
    fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
        }
    }

    /// The state shown until the next poll cycle reports the real one.
    fn expected_state(&self) -> VmState {
        match self {
            Self::Start => VmState::Running,
            Self::Shutdown => VmState::ShutOff,
            Self::Reboot => VmState::Rebooting,
        }
    }
}

impl FromStr for VmAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "shutdown" => Ok(Self::Shutdown),
            "reboot" => Ok(Self::Reboot),
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    fn expected_state(&self) -> ContainerState {
        match self {
            Self::Start => ContainerState::Running,
            Self::Stop => ContainerState::Exited,
            Self::Restart => ContainerState::Restarting,
        }
    }
}

impl FromStr for ContainerAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Issues exactly one command per action, then patches the published
/// snapshot optimistically. The next poll cycle overwrites the guess.
pub struct ControlGateway {
    runner: Arc<dyn CommandRunner>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    docker_enabled: bool,
}

impl ControlGateway {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
        docker_enabled: bool,
    ) -> Self {
        Self {
            runner,
            store,
            metrics,
            docker_enabled,
        }
    }

    async fn execute(&self, action: &str, command: String) -> Result<(), ControlError> {
        info!(action, command = %command, "running control action");
        match self.runner.run_once(&command).await {
            Ok(_) => {
                self.metrics.inc_control_action(action, "ok");
                Ok(())
            }
            Err(source) => {
                warn!(action, error = %source, "control action failed");
                self.metrics.inc_control_action(action, "error");
                Err(ControlError::Command { command, source })
            }
        }
    }

    pub async fn reboot(&self) -> Result<(), ControlError> {
        self.execute("reboot", "reboot".to_string()).await?;
        self.store
            .update(|s| s.status = HostStatus::Rebooting)
            .await;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.execute("shutdown", "shutdown -h now".to_string())
            .await?;
        self.store.update(|s| s.status = HostStatus::Off).await;
        Ok(())
    }

    pub async fn control_vm(&self, name: &str, action: &str) -> Result<(), ControlError> {
        let action: VmAction = action.parse()?;
        let command = format!("virsh {} {}", action.verb(), shell_quote(name));
        self.execute(&format!("vm_{action}"), command).await?;
        self.store
            .update(|s| {
                for vm in s.vms.iter_mut().filter(|vm| vm.name == name) {
                    vm.state = action.expected_state();
                }
            })
            .await;
        Ok(())
    }

    pub async fn control_container(&self, name: &str, action: &str) -> Result<(), ControlError> {
        if !self.docker_enabled {
            return Err(ControlError::CapabilityDisabled("container"));
        }
        let action: ContainerAction = action.parse()?;
        let command = format!("docker {} {}", action.verb(), shell_quote(name));
        self.execute(&format!("container_{action}"), command)
            .await?;
        self.store
            .update(|s| {
                for c in s.containers.iter_mut().filter(|c| c.name == name) {
                    c.state = action.expected_state();
                }
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::privilege::Credentials;
    use crate::channel::{ChannelPolicy, CommandChannel};
    use crate::state::{ContainerRecord, SystemSnapshot, VmRecord};
    use crate::testutil::{FakeConnector, Reply, Scripted, ScriptedRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn gateway(docker: bool) -> (ControlGateway, Arc<ScriptedRunner>, Arc<SnapshotStore>) {
        let runner = Arc::new(ScriptedRunner::new());
        let mut snapshot = SystemSnapshot::offline_default(None, 0);
        snapshot.status = HostStatus::On;
        snapshot.vms.push(VmRecord {
            id: "1".to_string(),
            name: "vm1".to_string(),
            title: "vm1".to_string(),
            state: VmState::Running,
        });
        snapshot.containers.push(ContainerRecord {
            id: "abc".to_string(),
            name: "plex".to_string(),
            title: "Plex".to_string(),
            image: "plexinc/pms-docker".to_string(),
            state: ContainerState::Running,
        });
        let store = Arc::new(SnapshotStore::new(snapshot));
        let metrics = Metrics::new().expect("metrics");
        let gw = ControlGateway::new(runner.clone(), store.clone(), metrics, docker);
        (gw, runner, store)
    }

    #[tokio::test]
    async fn vm_reboot_is_one_command_and_optimistic() {
        let (gw, runner, store) = gateway(false).await;
        runner.respond("virsh reboot 'vm1'", "Domain 'vm1' is being rebooted");

        gw.control_vm("vm1", "reboot").await.expect("reboot vm");
        assert_eq!(runner.calls(), vec!["virsh reboot 'vm1'".to_string()]);
        assert_eq!(store.current().await.vms[0].state, VmState::Rebooting);
    }

    #[tokio::test]
    async fn unknown_action_issues_nothing() {
        let (gw, runner, store) = gateway(true).await;

        assert!(matches!(
            gw.control_vm("vm1", "destroy").await,
            Err(ControlError::UnknownAction(_))
        ));
        assert!(matches!(
            gw.control_container("plex", "kill").await,
            Err(ControlError::UnknownAction(_))
        ));
        assert!(runner.calls().is_empty());
        assert_eq!(store.current().await.vms[0].state, VmState::Running);
    }

    #[tokio::test]
    async fn failed_command_is_surfaced_and_state_untouched() {
        let (gw, runner, store) = gateway(true).await;
        runner.script("docker stop 'plex'", Scripted::Exit(1));

        let err = gw
            .control_container("plex", "stop")
            .await
            .expect_err("docker stop fails");
        assert!(matches!(err, ControlError::Command { .. }));
        assert_eq!(
            store.current().await.containers[0].state,
            ContainerState::Running
        );
    }

    #[tokio::test]
    async fn containers_need_docker_enabled() {
        let (gw, runner, _store) = gateway(false).await;
        assert!(matches!(
            gw.control_container("plex", "start").await,
            Err(ControlError::CapabilityDisabled(_))
        ));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn host_power_actions_update_status() {
        let (gw, runner, store) = gateway(false).await;
        runner.respond("reboot", "");
        runner.respond("shutdown -h now", "");

        gw.reboot().await.expect("reboot");
        assert_eq!(store.current().await.status, HostStatus::Rebooting);
        gw.shutdown().await.expect("shutdown");
        assert_eq!(store.current().await.status, HostStatus::Off);
    }

    #[tokio::test]
    async fn names_are_shell_quoted() {
        let (gw, runner, _store) = gateway(true).await;
        runner.respond("docker restart 'odd'\\''name'", "");
        gw.control_container("odd'name", "restart")
            .await
            .expect("restart");
        assert_eq!(runner.calls(), vec!["docker restart 'odd'\\''name'".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_restart_is_issued_once() {
        let issued = Arc::new(AtomicUsize::new(0));
        let counter = issued.clone();
        let connector = Arc::new(FakeConnector::new(move |cmd, _| match cmd {
            "docker restart 'plex'" => {
                counter.fetch_add(1, Ordering::SeqCst);
                Reply::ok("plex").delayed(Duration::from_secs(12))
            }
            _ => Reply::ok(""),
        }));
        let channel = Arc::new(CommandChannel::new(
            "nas.test",
            connector,
            Credentials::default(),
            ChannelPolicy::default(),
        ));
        let (_, _, store) = gateway(true).await;
        let gw = ControlGateway::new(channel, store.clone(), Metrics::new().expect("metrics"), true);

        let err = gw
            .control_container("plex", "restart")
            .await
            .expect_err("restart outlives the command timeout");
        assert!(matches!(
            err,
            ControlError::Command {
                source: CommandError::Timeout(_),
                ..
            }
        ));
        assert_eq!(issued.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.current().await.containers[0].state,
            ContainerState::Running
        );
    }
}
