use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn reachable(&self, host: &str) -> bool;
}

pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn reachable(&self, host: &str) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let child = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", wait.as_str(), host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                warn!(host, error = %err, "failed to run ping");
                false
            }
            Err(_) => false,
        }
    }
}

pub fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Online,
    Offline,
}

pub struct HostAvailabilityMonitor {
    host: String,
    probe: Arc<dyn ReachabilityProbe>,
    retry_interval: Duration,
    state: Mutex<Availability>,
    recovered: Notify,
    retry_loop: Mutex<Option<JoinHandle<()>>>,
    loops_started: AtomicUsize,
}

impl HostAvailabilityMonitor {
    pub fn new(
        host: impl Into<String>,
        probe: Arc<dyn ReachabilityProbe>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            probe,
            retry_interval,
            state: Mutex::new(Availability::Unknown),
            recovered: Notify::new(),
            retry_loop: Mutex::new(None),
            loops_started: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> Availability {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: Availability) {
        let prev = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if prev != next {
            info!(host = %self.host, from = ?prev, to = ?next, "availability changed");
        }
    }

    /// Probes once and records the result. Loopback hosts never hit the network.
    pub async fn probe(&self) -> bool {
        let reachable = is_loopback(&self.host) || self.probe.reachable(&self.host).await;
        self.set_state(if reachable {
            Availability::Online
        } else {
            Availability::Offline
        });
        reachable
    }

    pub fn mark_offline(&self) {
        self.set_state(Availability::Offline);
    }

    pub fn arm_retry_loop(self: &Arc<Self>) {
        let mut slot = self.retry_loop.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(host = %self.host, "retry loop already running");
            return;
        }
        self.loops_started.fetch_add(1, Ordering::SeqCst);
        debug!(host = %self.host, interval = ?self.retry_interval, "starting offline retry loop");
        let monitor = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { monitor.retry_until_reachable().await }));
    }

    async fn retry_until_reachable(&self) {
        loop {
            tokio::time::sleep(self.retry_interval).await;
            if self.probe().await {
                info!(host = %self.host, "host reachable again, resuming polling");
                self.recovered.notify_one();
                return;
            }
            debug!(host = %self.host, "host still unreachable");
        }
    }

    pub async fn recovered(&self) {
        self.recovered.notified().await;
    }

    pub fn retry_loop_active(&self) -> bool {
        self.retry_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn retry_loops_started(&self) -> usize {
        self.loops_started.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self
            .retry_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
