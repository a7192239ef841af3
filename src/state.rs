use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    On,
    Off,
    Rebooting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Idle,
    Sleeping,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskHealth {
    Good,
    Failing,
    Error,
    Warning,
    Critical,
    Unknown,
    Unavailable,
    DetectionFailed,
}

impl DiskHealth {
    /// Maps the verdict printed by `smartctl -H`.
    pub fn from_smart_verdict(raw: &str) -> Self {
        match raw.trim().trim_end_matches('!').trim_end().to_uppercase().as_str() {
            "PASSED" | "PASS" | "OK" | "GOOD" => Self::Good,
            "FAILED" | "FAIL" => Self::Failing,
            "ERROR" => Self::Error,
            "WARNING" => Self::Warning,
            "CRITICAL" => Self::Critical,
            "NOT AVAILABLE" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSource {
    Fresh,
    Cached,
    FallbackAfterFailure,
    NotChecked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskDetails {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub capacity: Option<String>,
    pub health: DiskHealth,
    pub temperature_celsius: Option<f64>,
    pub power_on_hours: Option<f64>,
    pub attributes: BTreeMap<String, String>,
}

impl DiskDetails {
    pub fn unknown(health: DiskHealth) -> Self {
        Self {
            model: None,
            serial: None,
            capacity: None,
            health,
            temperature_celsius: None,
            power_on_hours: None,
            attributes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskRecord {
    pub device: String,
    pub activity: ActivityState,
    pub source: DetailSource,
    #[serde(flatten)]
    pub details: DiskDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeUsage {
    pub filesystem: String,
    pub size: String,
    pub used: String,
    pub available: String,
    pub use_percent: Option<f64>,
    pub size_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemVitals {
    pub uptime_seconds: u64,
    pub uptime: String,
    pub cpu_temperature_celsius: Option<f64>,
    pub motherboard_temperature_celsius: Option<f64>,
    pub memory_total_bytes: Option<u64>,
    pub memory_used_bytes: Option<u64>,
    pub memory_available_bytes: Option<u64>,
    pub volumes: BTreeMap<String, VolumeUsage>,
}

impl Default for SystemVitals {
    fn default() -> Self {
        Self {
            uptime_seconds: 0,
            uptime: "unknown".to_string(),
            cpu_temperature_celsius: None,
            motherboard_temperature_celsius: None,
            memory_total_bytes: None,
            memory_used_bytes: None,
            memory_available_bytes: None,
            volumes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsStatus {
    Online,
    OnBattery,
    LowBattery,
    HighBattery,
    ReplaceBattery,
    Charging,
    Discharging,
    Bypass,
    Calibrating,
    Off,
    Overload,
    Trimming,
    Boosting,
    ForcedShutdown,
    Alarm,
    Unknown,
}

impl UpsStatus {
    /// Maps a NUT `ups.status` value such as `OL CHRG` or `OB LB`.
    /// Flags are checked in severity order so that `OB LB` reports the low battery.
    pub fn from_nut_flags(raw: &str) -> Self {
        const PRIORITY: &[(&str, UpsStatus)] = &[
            ("FSD", UpsStatus::ForcedShutdown),
            ("OVER", UpsStatus::Overload),
            ("LB", UpsStatus::LowBattery),
            ("RB", UpsStatus::ReplaceBattery),
            ("OB", UpsStatus::OnBattery),
            ("BYPASS", UpsStatus::Bypass),
            ("CAL", UpsStatus::Calibrating),
            ("OFF", UpsStatus::Off),
            ("OL", UpsStatus::Online),
            ("CHRG", UpsStatus::Charging),
            ("DISCHRG", UpsStatus::Discharging),
            ("TRIM", UpsStatus::Trimming),
            ("BOOST", UpsStatus::Boosting),
            ("HB", UpsStatus::HighBattery),
            ("ALARM", UpsStatus::Alarm),
        ];
        let flags: Vec<String> = raw.split_whitespace().map(|f| f.to_uppercase()).collect();
        PRIORITY
            .iter()
            .find(|(flag, _)| flags.iter().any(|f| f == flag))
            .map(|(_, status)| *status)
            .unwrap_or(UpsStatus::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsSource {
    Nut,
    UsbProbe,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsRecord {
    pub status: UpsStatus,
    pub battery_percent: Option<f64>,
    pub runtime_remaining_secs: Option<u64>,
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,
    pub load_percent: Option<f64>,
    pub model: Option<String>,
    pub source: UpsSource,
}

impl Default for UpsRecord {
    fn default() -> Self {
        Self {
            status: UpsStatus::Unknown,
            battery_percent: None,
            runtime_remaining_secs: None,
            input_voltage: None,
            output_voltage: None,
            load_percent: None,
            model: None,
            source: UpsSource::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    Suspended,
    Rebooting,
    Unknown,
}

impl VmState {
    /// Parses the state column of `virsh list --all`.
    pub fn from_virsh(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Idle,
            "paused" => Self::Paused,
            "in shutdown" => Self::InShutdown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::Suspended,
            "rebooting" => Self::Rebooting,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub title: String,
    pub state: VmState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Parses the `State` field of `docker ps --format '{{json .}}'`.
    pub fn from_docker(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub title: String,
    pub image: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub status: HostStatus,
    pub system: SystemVitals,
    pub disks: Vec<DiskRecord>,
    pub ups: UpsRecord,
    pub vms: Vec<VmRecord>,
    pub containers: Vec<ContainerRecord>,
    pub mac: Option<String>,
    pub timestamp_unix: i64,
}

impl SystemSnapshot {
    pub fn offline_default(mac: Option<String>, timestamp_unix: i64) -> Self {
        Self {
            status: HostStatus::Off,
            system: SystemVitals::default(),
            disks: Vec::new(),
            ups: UpsRecord::default(),
            vms: Vec::new(),
            containers: Vec::new(),
            mac,
            timestamp_unix,
        }
    }
}

pub struct SnapshotStore {
    current: RwLock<Arc<SystemSnapshot>>,
    tx: watch::Sender<Arc<SystemSnapshot>>,
}

impl SnapshotStore {
    pub fn new(initial: SystemSnapshot) -> Self {
        let initial = Arc::new(initial);
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            current: RwLock::new(initial),
            tx,
        }
    }

    pub async fn current(&self) -> Arc<SystemSnapshot> {
        self.current.read().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemSnapshot>> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, snapshot: SystemSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.current.write().await;
        *guard = snapshot.clone();
        // Sent under the guard so subscribers see publications in store order.
        self.tx.send_replace(snapshot);
    }

    /// Applies `patch` to a copy of the current snapshot and publishes the result.
    pub async fn update<F>(&self, patch: F)
    where
        F: FnOnce(&mut SystemSnapshot),
    {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        patch(&mut next);
        let next = Arc::new(next);
        *guard = next.clone();
        self.tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_default_is_idempotent() {
        let a = SystemSnapshot::offline_default(Some("00:11:22:33:44:55".to_string()), 42);
        let b = SystemSnapshot::offline_default(Some("00:11:22:33:44:55".to_string()), 42);
        assert_eq!(a, b);
        assert_eq!(a.status, HostStatus::Off);
        assert!(a.disks.is_empty());
        assert_eq!(a.ups.status, UpsStatus::Unknown);
        assert_eq!(a.system.uptime, "unknown");
    }

    #[test]
    fn smart_verdicts_map_to_health() {
        assert_eq!(DiskHealth::from_smart_verdict("PASSED"), DiskHealth::Good);
        assert_eq!(DiskHealth::from_smart_verdict(" ok "), DiskHealth::Good);
        assert_eq!(DiskHealth::from_smart_verdict("FAILED!"), DiskHealth::Failing);
        assert_eq!(DiskHealth::from_smart_verdict("FAILED"), DiskHealth::Failing);
        assert_eq!(
            DiskHealth::from_smart_verdict("Not Available"),
            DiskHealth::Unavailable
        );
        assert_eq!(DiskHealth::from_smart_verdict("degraded"), DiskHealth::Unknown);
    }

    #[test]
    fn nut_flags_prefer_most_severe() {
        assert_eq!(UpsStatus::from_nut_flags("OL CHRG"), UpsStatus::Online);
        assert_eq!(UpsStatus::from_nut_flags("OB DISCHRG"), UpsStatus::OnBattery);
        assert_eq!(UpsStatus::from_nut_flags("OB LB"), UpsStatus::LowBattery);
        assert_eq!(UpsStatus::from_nut_flags("FSD OB LB"), UpsStatus::ForcedShutdown);
        assert_eq!(UpsStatus::from_nut_flags("OLD"), UpsStatus::Unknown);
        assert_eq!(UpsStatus::from_nut_flags(""), UpsStatus::Unknown);
    }

    #[test]
    fn virsh_states_parse() {
        assert_eq!(VmState::from_virsh("running"), VmState::Running);
        assert_eq!(VmState::from_virsh("shut off"), VmState::ShutOff);
        assert_eq!(VmState::from_virsh("weird"), VmState::Unknown);
    }

    #[tokio::test]
    async fn store_update_notifies_subscribers() {
        let store = SnapshotStore::new(SystemSnapshot::offline_default(None, 0));
        let mut rx = store.subscribe();
        store
            .update(|s| {
                s.status = HostStatus::Rebooting;
            })
            .await;
        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow().status, HostStatus::Rebooting);
        assert_eq!(store.current().await.status, HostStatus::Rebooting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribers_end_on_the_stored_snapshot() {
        let store = Arc::new(SnapshotStore::new(SystemSnapshot::offline_default(None, 0)));
        let rx = store.subscribe();

        let mut tasks = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store
                        .publish(SystemSnapshot::offline_default(None, i))
                        .await;
                } else {
                    store.update(|s| s.status = HostStatus::Rebooting).await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let current = store.current().await;
        assert!(Arc::ptr_eq(&current, &rx.borrow()));
    }
}
