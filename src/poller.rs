use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::availability::{Availability, HostAvailabilityMonitor};
use crate::channel::{Channel, CommandRunner, ConnectError};
use crate::collectors::disk::DiskCollector;
use crate::collectors::docker::DockerCollector;
use crate::collectors::system::SystemCollector;
use crate::collectors::ups::UpsCollector;
use crate::collectors::vm::VmCollector;
use crate::collectors::Collector;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::{now_unix, HostStatus, SnapshotStore, SystemSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped,
    Offline,
    Online,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

pub struct Collectors {
    pub system: SystemCollector,
    pub disk: DiskCollector,
    pub ups: UpsCollector,
    pub vm: VmCollector,
    pub docker: Option<DockerCollector>,
}

impl Collectors {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            system: SystemCollector,
            disk: DiskCollector::new(&cfg.ignore_disks, cfg.cache_timeout()),
            ups: UpsCollector,
            vm: VmCollector,
            docker: cfg.enable_docker.then_some(DockerCollector),
        }
    }
}

pub struct SnapshotAggregator {
    channel: Arc<dyn Channel>,
    monitor: Arc<HostAvailabilityMonitor>,
    store: Arc<SnapshotStore>,
    collectors: Collectors,
    metrics: Arc<Metrics>,
    mac: Option<String>,
    cycle: Mutex<()>,
}

impl SnapshotAggregator {
    pub fn new(
        channel: Arc<dyn Channel>,
        monitor: Arc<HostAvailabilityMonitor>,
        store: Arc<SnapshotStore>,
        collectors: Collectors,
        metrics: Arc<Metrics>,
        mac: Option<String>,
    ) -> Self {
        Self {
            channel,
            monitor,
            store,
            collectors,
            metrics,
            mac,
            cycle: Mutex::new(()),
        }
    }

    /// Runs one poll cycle unless one is already in flight. Always leaves a
    /// well-formed snapshot in the store.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_running) = self.cycle.try_lock() else {
            debug!("poll cycle already in flight, skipping");
            self.metrics.inc_poll_cycle(CycleOutcome::Skipped.label());
            return CycleOutcome::Skipped;
        };

        let outcome = if !self.monitor.probe().await {
            info!("nas unreachable, publishing offline snapshot");
            self.go_offline().await;
            CycleOutcome::Offline
        } else {
            match AssertUnwindSafe(self.collect_online()).catch_unwind().await {
                Ok(Ok(snapshot)) => {
                    self.store.publish(snapshot).await;
                    CycleOutcome::Online
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "nas reachable but no session could be opened");
                    self.go_offline().await;
                    CycleOutcome::Offline
                }
                Err(_) => {
                    error!("poll cycle panicked, downgrading to offline snapshot");
                    self.go_offline().await;
                    CycleOutcome::Offline
                }
            }
        };
        self.metrics.inc_poll_cycle(outcome.label());
        outcome
    }

    async fn go_offline(&self) {
        self.store
            .publish(SystemSnapshot::offline_default(self.mac.clone(), now_unix()))
            .await;
        self.monitor.mark_offline();
        self.monitor.arm_retry_loop();
        self.channel.disconnect().await;
    }

    async fn collect_online(&self) -> Result<SystemSnapshot, ConnectError> {
        let privilege = self.channel.connect().await?;
        debug!(privilege = privilege.label(), "command channel ready");
        let runner = self.channel.runner();

        let containers = async {
            match &self.collectors.docker {
                Some(docker) => self.section(docker, runner).await.unwrap_or_default(),
                None => Vec::new(),
            }
        };
        let (system, disks, ups, vms, containers) = tokio::join!(
            self.section(&self.collectors.system, runner),
            self.section(&self.collectors.disk, runner),
            self.section(&self.collectors.ups, runner),
            self.section(&self.collectors.vm, runner),
            containers,
        );

        Ok(SystemSnapshot {
            status: HostStatus::On,
            system: system.unwrap_or_default(),
            disks: disks.unwrap_or_default(),
            ups: ups.unwrap_or_default(),
            vms: vms.unwrap_or_default(),
            containers,
            mac: self.mac.clone(),
            timestamp_unix: now_unix(),
        })
    }

    async fn section<C: Collector>(
        &self,
        collector: &C,
        runner: &dyn CommandRunner,
    ) -> Option<C::Record> {
        match collector.collect(runner).await {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(collector = collector.name(), error = %err, "collector failed");
                self.metrics.inc_collect_error(collector.name());
                None
            }
        }
    }

    /// Refreshes only the UPS section of the current snapshot. Does nothing
    /// while the host is not known to be online.
    pub async fn refresh_ups(&self) -> bool {
        if self.monitor.state() != Availability::Online || self.monitor.retry_loop_active() {
            return false;
        }
        let Some(ups) = self
            .section(&self.collectors.ups, self.channel.runner())
            .await
        else {
            return false;
        };
        let mut applied = false;
        self.store
            .update(|snapshot| {
                if snapshot.status == HostStatus::On {
                    snapshot.ups = ups;
                    applied = true;
                }
            })
            .await;
        applied
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("poll loop stopping");
                    break;
                }
                _ = self.monitor.recovered() => {
                    info!("nas is back, polling immediately");
                    self.run_cycle().await;
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if self.monitor.retry_loop_active() {
                        debug!("nas offline, waiting for the retry loop");
                        continue;
                    }
                    let outcome = self.run_cycle().await;
                    debug!(outcome = outcome.label(), "poll cycle finished");
                }
            }
        }
    }

    pub async fn run_ups(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the full cycle already covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("ups loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if self.refresh_ups().await {
                        debug!("ups section refreshed");
                    }
                }
            }
        }
    }
}
