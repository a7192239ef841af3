use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::extract::{first_match, parse_number, PatternChain, TextExtractor};
use super::{run, run_optional, Collector, CollectorError};
use crate::cache::{Liveness, LivenessProbe, Refresh, ResourceCache};
use crate::channel::{CommandError, CommandRunner};
use crate::state::{ActivityState, DetailSource, DiskDetails, DiskHealth, DiskRecord};

/// Busy-time growth (ms) between two samples that counts as activity.
const BUSY_THRESHOLD_MS: u64 = 100;

/// smartctl exit bits 0-2 mean the query itself failed. Higher bits report
/// disk conditions and come with normal output.
const SMARTCTL_FATAL_BITS: i32 = 0b111;

const DISK_TYPES: &[&str] = &["disk", "nvme"];

lazy_static! {
    static ref MODEL: PatternChain = PatternChain::new(&[
        r"^Device Model:\s*(.+)$",
        r"^Model Number:\s*(.+)$",
        r"^Product:\s*(.+)$",
        r"^Model Family:\s*(.+)$",
    ]);
    static ref SERIAL: PatternChain = PatternChain::new(&[r"^Serial Number:\s*(.+)$"]);
    static ref CAPACITY: PatternChain = PatternChain::new(&[
        r"^User Capacity:.*\[([^\]]+)\]",
        r"^Total NVM Capacity:.*\[([^\]]+)\]",
        r"^Namespace 1 Size/Capacity:.*\[([^\]]+)\]",
        r"^User Capacity:\s*([^\[]+)",
    ]);
    static ref HEALTH: PatternChain = PatternChain::new(&[
        r"SMART overall-health self-assessment test result:\s*(.+)$",
        r"SMART Health Status:\s*(.+)$",
    ]);
    static ref TEMPERATURE: PatternChain = PatternChain::new(&[
        r"^\s*194\s+Temperature_Celsius(?:\s+\S+){7}\s+(\d+)",
        r"^Temperature:\s*(\d+)\s*Celsius",
        r"^Composite:\s*\+?(\d+(?:\.\d+)?)\s*°?C",
        r"^Current (?:Drive )?Temperature:\s*(\d+)",
        r"^\s*190\s+Airflow_Temperature_Cel(?:\s+\S+){7}\s+(\d+)",
        r"Temperature_Celsius(?:\s+\S+){7}\s+(\d+)",
    ]);
    static ref TEMPERATURE_RANGE: Regex =
        Regex::new(r"(?im)^\s*194\s+Temperature_Celsius.*\(Min/Max\s+(\d+)/(\d+)\)")
            .expect("valid temperature range pattern");
    static ref POWER_ON_ATTRIBUTE: Regex =
        Regex::new(r"(?im)^\s*9\s+Power_On_Hours(?:\s+\S+){7}\s+(\d+)(?:h\+(\d+)m)?")
            .expect("valid power-on pattern");
    static ref POWER_ON_FALLBACK: PatternChain = PatternChain::new(&[
        r"^Power On Hours:\s*([\d,]+)",
        r"Power on time\s*:\s*(\d+)\s*hours",
    ]);
}

/// Reads power-on hours from attribute 9, accepting both the plain raw value
/// and the `12345h+06m+07.890s` form some drives report.
struct PowerOnHours;

impl TextExtractor for PowerOnHours {
    fn extract(&self, text: &str) -> Option<String> {
        let caps = POWER_ON_ATTRIBUTE.captures(text)?;
        let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
        let minutes: f64 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0.0);
        Some(format!("{:.1}", hours + minutes / 60.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCounters {
    pub read_ios: u64,
    pub write_ios: u64,
    pub in_flight: u64,
    pub io_ticks: u64,
}

impl IoCounters {
    pub fn parse(raw: &str) -> Option<Self> {
        let fields: Vec<u64> = raw
            .split_whitespace()
            .map(|f| f.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        if fields.len() < 10 {
            return None;
        }
        Some(Self {
            read_ios: fields[0],
            write_ios: fields[4],
            in_flight: fields[8],
            io_ticks: fields[9],
        })
    }

    fn busier_than(&self, previous: &Self) -> bool {
        self.read_ios.saturating_sub(previous.read_ios) > 0
            || self.write_ios.saturating_sub(previous.write_ios) > 0
            || self.io_ticks.saturating_sub(previous.io_ticks) > BUSY_THRESHOLD_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerState {
    Active,
    Standby,
    Unknown,
}

/// Asks the drive for its power state without waking it.
async fn power_state(runner: &dyn CommandRunner, device: &str) -> PowerState {
    let state = run_optional(
        runner,
        &format!("cat /sys/block/{device}/device/state 2>/dev/null || echo unknown"),
    )
    .await
    .unwrap_or_default()
    .trim()
    .to_lowercase();
    if state == "standby" || state == "sleep" {
        return PowerState::Standby;
    }

    let hdparm = run_optional(
        runner,
        &format!("hdparm -C /dev/{device} 2>/dev/null || echo unknown"),
    )
    .await
    .unwrap_or_default()
    .to_lowercase();
    if hdparm.contains("standby") || hdparm.contains("sleeping") {
        PowerState::Standby
    } else if hdparm.contains("active/idle") || state == "running" || state == "active" {
        PowerState::Active
    } else {
        PowerState::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskObservation {
    pub activity: ActivityState,
    pub live: bool,
}

impl Liveness for DiskObservation {
    fn is_live(&self) -> bool {
        self.live
    }
}

/// Disk liveness from I/O counter deltas between poll cycles, falling back
/// to the reported power state when nothing moved.
#[derive(Default)]
pub struct IoActivityProbe {
    last: HashMap<String, IoCounters>,
    sampled: HashSet<String>,
}

#[async_trait]
impl LivenessProbe<String> for IoActivityProbe {
    type Observation = DiskObservation;

    async fn observe(&mut self, device: &String, runner: &dyn CommandRunner) -> DiskObservation {
        let first = self.sampled.insert(device.clone());
        let counters = run_optional(
            runner,
            &format!("cat /sys/block/{device}/stat 2>/dev/null || true"),
        )
        .await
        .and_then(|raw| IoCounters::parse(&raw));

        let Some(current) = counters else {
            debug!(device = %device, "i/o counters unavailable, using power state");
            return match power_state(runner, device).await {
                PowerState::Standby => DiskObservation {
                    activity: ActivityState::Sleeping,
                    live: false,
                },
                PowerState::Active => DiskObservation {
                    activity: ActivityState::Unknown,
                    live: true,
                },
                PowerState::Unknown => DiskObservation {
                    activity: ActivityState::Unknown,
                    live: first,
                },
            };
        };

        let previous = self.last.insert(device.clone(), current);
        if current.in_flight > 0 || previous.is_some_and(|prev| current.busier_than(&prev)) {
            return DiskObservation {
                activity: ActivityState::Active,
                live: true,
            };
        }

        let activity = match power_state(runner, device).await {
            PowerState::Standby => ActivityState::Sleeping,
            _ => ActivityState::Idle,
        };
        DiskObservation {
            activity,
            live: previous.is_none(),
        }
    }
}

pub fn parse_block_devices(listing: &str, ignore: &HashSet<String>) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let kind = parts.next()?;
            if !DISK_TYPES.contains(&kind) {
                debug!(device = name, kind, "skipping non-disk device");
                return None;
            }
            if ignore.contains(name) {
                debug!(device = name, "skipping ignored disk");
                return None;
            }
            Some(name.to_string())
        })
        .collect()
}

pub fn parse_smart_details(info: &str, health: Option<&str>, attributes: Option<&str>) -> DiskDetails {
    let health = health
        .and_then(|out| HEALTH.extract(out))
        .map(|verdict| DiskHealth::from_smart_verdict(&verdict))
        .unwrap_or(DiskHealth::Unknown);
    let mut details = DiskDetails {
        model: MODEL.extract(info),
        serial: SERIAL.extract(info),
        capacity: CAPACITY.extract(info),
        ..DiskDetails::unknown(health)
    };

    let Some(attrs) = attributes else {
        return details;
    };
    details.temperature_celsius = TEMPERATURE.extract_with(attrs, parse_number);
    details.power_on_hours = first_match(&[&PowerOnHours, &*POWER_ON_FALLBACK], attrs)
        .and_then(|raw| parse_number(&raw.replace(',', "")));

    let mut extra = BTreeMap::new();
    if let Some(caps) = TEMPERATURE_RANGE.captures(attrs) {
        extra.insert("min_temperature_celsius".to_string(), caps[1].to_string());
        extra.insert("max_temperature_celsius".to_string(), caps[2].to_string());
    }
    details.attributes = extra;
    details
}

async fn smartctl(runner: &dyn CommandRunner, flag: &str, path: &str) -> Result<String, CollectorError> {
    let command = format!("smartctl {flag} {path}");
    let out = match runner.run_status(&command).await {
        Ok(out) => out,
        Err(source) => return Err(CollectorError::Command { command, source }),
    };
    if out.exit_status & SMARTCTL_FATAL_BITS != 0 {
        return Err(CollectorError::Command {
            command,
            source: CommandError::Exit {
                code: out.exit_status,
            },
        });
    }
    if out.exit_status != 0 {
        debug!(command = %command, status = out.exit_status, "smartctl reported disk conditions");
    }
    Ok(out.stdout)
}

async fn fetch_details(runner: &dyn CommandRunner, device: &str) -> Result<DiskDetails, CollectorError> {
    let path = format!("/dev/{device}");
    let info = smartctl(runner, "-i", &path).await?;
    if info.trim().is_empty() {
        return Err(CollectorError::Parse {
            command: format!("smartctl -i {path}"),
            detail: "empty output".to_string(),
        });
    }
    let (health, attributes) = tokio::join!(
        smartctl(runner, "-H", &path),
        smartctl(runner, "-A", &path),
    );
    let optional = |out: Result<String, CollectorError>| match out {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "optional smartctl query failed");
            None
        }
    };
    let (health, attributes) = (optional(health), optional(attributes));
    Ok(parse_smart_details(&info, health.as_deref(), attributes.as_deref()))
}

pub struct DiskCollector {
    ignore: HashSet<String>,
    cache: Mutex<ResourceCache<String, DiskDetails, IoActivityProbe>>,
}

impl DiskCollector {
    pub fn new(ignore: &[String], cache_timeout: Duration) -> Self {
        Self {
            ignore: ignore.iter().cloned().collect(),
            cache: Mutex::new(ResourceCache::new(cache_timeout, IoActivityProbe::default())),
        }
    }
}

#[async_trait]
impl Collector for DiskCollector {
    type Record = Vec<DiskRecord>;

    fn name(&self) -> &'static str {
        "disk"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<Vec<DiskRecord>, CollectorError> {
        let listing = run(runner, "lsblk -dno NAME,TYPE").await?;
        let devices = parse_block_devices(&listing, &self.ignore);

        let mut cache = self.cache.lock().await;
        let now = Instant::now();

        let mut observed = Vec::with_capacity(devices.len());
        for device in devices {
            let observation = cache.observe_resource(&device, runner).await;
            observed.push((device, observation));
        }

        let inactive: HashSet<String> = observed
            .iter()
            .filter(|(_, obs)| !obs.live)
            .map(|(device, _)| device.clone())
            .collect();
        let evicted = cache.evict_expired(now, |device| inactive.contains(device));
        if evicted > 0 {
            debug!(evicted, "expired disk details evicted");
        }

        let mut records = Vec::with_capacity(observed.len());
        for (device, observation) in observed {
            let refresh = cache
                .refresh(&device, observation.live, now, || fetch_details(runner, &device))
                .await;
            let (source, details) = match refresh {
                Refresh::Fresh(details) => (DetailSource::Fresh, details),
                Refresh::Cached(details) => (DetailSource::Cached, details),
                Refresh::Fallback(details) => (DetailSource::FallbackAfterFailure, details),
                Refresh::Failed => (
                    DetailSource::FallbackAfterFailure,
                    DiskDetails::unknown(DiskHealth::DetectionFailed),
                ),
                Refresh::NotChecked => (
                    DetailSource::NotChecked,
                    DiskDetails::unknown(DiskHealth::Unknown),
                ),
            };
            debug!(device = %device, activity = ?observation.activity, source = ?source, "disk processed");
            records.push(DiskRecord {
                device,
                activity: observation.activity,
                source,
                details,
            });
        }

        info!(disks = records.len(), "disk scan complete");
        Ok(records)
    }
}
