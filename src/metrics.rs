use crate::state::{
    now_unix, ActivityState, ContainerState, DiskHealth, HostStatus, SystemSnapshot, UpsStatus,
    VmState,
};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub nas_host_status: GaugeVec,
    pub nas_uptime_seconds: Gauge,
    pub nas_cpu_temperature_celsius: Gauge,
    pub nas_motherboard_temperature_celsius: Gauge,
    pub nas_memory_total_bytes: Gauge,
    pub nas_memory_used_bytes: Gauge,
    pub nas_memory_available_bytes: Gauge,
    pub nas_volume_size_bytes: GaugeVec,
    pub nas_volume_used_bytes: GaugeVec,
    pub nas_volume_usage_percent: GaugeVec,
    pub nas_disk_count: Gauge,
    pub nas_disk_temperature_celsius: GaugeVec,
    pub nas_disk_healthy: GaugeVec,
    pub nas_disk_active: GaugeVec,
    pub nas_disk_power_on_hours: GaugeVec,
    pub nas_ups_battery_percent: Gauge,
    pub nas_ups_load_percent: Gauge,
    pub nas_ups_input_voltage: Gauge,
    pub nas_ups_output_voltage: Gauge,
    pub nas_ups_runtime_seconds: Gauge,
    pub nas_ups_on_battery: Gauge,
    pub nas_vm_running: GaugeVec,
    pub nas_container_running: GaugeVec,
    pub nas_last_snapshot_timestamp_seconds: Gauge,
    pub nasmond_uptime_seconds: Gauge,
    pub nasmond_scrape_count_total: Counter,
    pub nasmond_poll_cycles_total: CounterVec,
    pub nasmond_collect_errors_total: CounterVec,
    pub nasmond_control_actions_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let nas_host_status = GaugeVec::new(
            opts!(
                "nas_host_status",
                "1 for the current host status (on, off, rebooting), 0 otherwise"
            ),
            &["status"],
        )?;
        let nas_uptime_seconds =
            Gauge::with_opts(opts!("nas_uptime_seconds", "NAS uptime in seconds"))?;
        let nas_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "nas_cpu_temperature_celsius",
            "CPU temperature in Celsius (NaN when unknown)"
        ))?;
        let nas_motherboard_temperature_celsius = Gauge::with_opts(opts!(
            "nas_motherboard_temperature_celsius",
            "Motherboard temperature in Celsius (NaN when unknown)"
        ))?;
        let nas_memory_total_bytes =
            Gauge::with_opts(opts!("nas_memory_total_bytes", "Total memory in bytes"))?;
        let nas_memory_used_bytes =
            Gauge::with_opts(opts!("nas_memory_used_bytes", "Used memory in bytes"))?;
        let nas_memory_available_bytes = Gauge::with_opts(opts!(
            "nas_memory_available_bytes",
            "Available memory in bytes"
        ))?;
        let nas_volume_size_bytes = GaugeVec::new(
            opts!("nas_volume_size_bytes", "Volume size in bytes by mount"),
            &["mount"],
        )?;
        let nas_volume_used_bytes = GaugeVec::new(
            opts!("nas_volume_used_bytes", "Volume used bytes by mount"),
            &["mount"],
        )?;
        let nas_volume_usage_percent = GaugeVec::new(
            opts!("nas_volume_usage_percent", "Volume usage in percent by mount"),
            &["mount"],
        )?;
        let nas_disk_count =
            Gauge::with_opts(opts!("nas_disk_count", "Number of monitored disks"))?;
        let nas_disk_temperature_celsius = GaugeVec::new(
            opts!(
                "nas_disk_temperature_celsius",
                "Disk temperature in Celsius by device"
            ),
            &["device"],
        )?;
        let nas_disk_healthy = GaugeVec::new(
            opts!(
                "nas_disk_healthy",
                "1 when the S.M.A.R.T. verdict is good, 0 otherwise"
            ),
            &["device", "health"],
        )?;
        let nas_disk_active = GaugeVec::new(
            opts!("nas_disk_active", "1 for the current disk activity state"),
            &["device", "activity"],
        )?;
        let nas_disk_power_on_hours = GaugeVec::new(
            opts!("nas_disk_power_on_hours", "Disk power-on hours by device"),
            &["device"],
        )?;
        let nas_ups_battery_percent = Gauge::with_opts(opts!(
            "nas_ups_battery_percent",
            "UPS battery charge in percent (NaN when unknown)"
        ))?;
        let nas_ups_load_percent = Gauge::with_opts(opts!(
            "nas_ups_load_percent",
            "UPS load in percent (NaN when unknown)"
        ))?;
        let nas_ups_input_voltage = Gauge::with_opts(opts!(
            "nas_ups_input_voltage",
            "UPS input voltage (NaN when unknown)"
        ))?;
        let nas_ups_output_voltage = Gauge::with_opts(opts!(
            "nas_ups_output_voltage",
            "UPS output voltage (NaN when unknown)"
        ))?;
        let nas_ups_runtime_seconds = Gauge::with_opts(opts!(
            "nas_ups_runtime_seconds",
            "UPS estimated runtime on battery in seconds (NaN when unknown)"
        ))?;
        let nas_ups_on_battery = Gauge::with_opts(opts!(
            "nas_ups_on_battery",
            "1 when the UPS runs on battery"
        ))?;
        let nas_vm_running = GaugeVec::new(
            opts!("nas_vm_running", "1 when the virtual machine is running"),
            &["name", "title"],
        )?;
        let nas_container_running = GaugeVec::new(
            opts!("nas_container_running", "1 when the container is running"),
            &["name", "image"],
        )?;
        let nas_last_snapshot_timestamp_seconds = Gauge::with_opts(opts!(
            "nas_last_snapshot_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;
        let nasmond_uptime_seconds = Gauge::with_opts(opts!(
            "nasmond_uptime_seconds",
            "Daemon uptime in seconds"
        ))?;
        let nasmond_scrape_count_total = Counter::with_opts(opts!(
            "nasmond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let nasmond_poll_cycles_total = CounterVec::new(
            opts!(
                "nasmond_poll_cycles_total",
                "Poll cycles by outcome (online, offline, skipped)"
            ),
            &["outcome"],
        )?;
        let nasmond_collect_errors_total = CounterVec::new(
            opts!(
                "nasmond_collect_errors_total",
                "Collector failures that degraded a snapshot section"
            ),
            &["collector"],
        )?;
        let nasmond_control_actions_total = CounterVec::new(
            opts!(
                "nasmond_control_actions_total",
                "Control actions by action and result"
            ),
            &["action", "result"],
        )?;

        register(&registry, &nas_host_status)?;
        register(&registry, &nas_uptime_seconds)?;
        register(&registry, &nas_cpu_temperature_celsius)?;
        register(&registry, &nas_motherboard_temperature_celsius)?;
        register(&registry, &nas_memory_total_bytes)?;
        register(&registry, &nas_memory_used_bytes)?;
        register(&registry, &nas_memory_available_bytes)?;
        register(&registry, &nas_volume_size_bytes)?;
        register(&registry, &nas_volume_used_bytes)?;
        register(&registry, &nas_volume_usage_percent)?;
        register(&registry, &nas_disk_count)?;
        register(&registry, &nas_disk_temperature_celsius)?;
        register(&registry, &nas_disk_healthy)?;
        register(&registry, &nas_disk_active)?;
        register(&registry, &nas_disk_power_on_hours)?;
        register(&registry, &nas_ups_battery_percent)?;
        register(&registry, &nas_ups_load_percent)?;
        register(&registry, &nas_ups_input_voltage)?;
        register(&registry, &nas_ups_output_voltage)?;
        register(&registry, &nas_ups_runtime_seconds)?;
        register(&registry, &nas_ups_on_battery)?;
        register(&registry, &nas_vm_running)?;
        register(&registry, &nas_container_running)?;
        register(&registry, &nas_last_snapshot_timestamp_seconds)?;
        register(&registry, &nasmond_uptime_seconds)?;
        register(&registry, &nasmond_scrape_count_total)?;
        register(&registry, &nasmond_poll_cycles_total)?;
        register(&registry, &nasmond_collect_errors_total)?;
        register(&registry, &nasmond_control_actions_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            nas_host_status,
            nas_uptime_seconds,
            nas_cpu_temperature_celsius,
            nas_motherboard_temperature_celsius,
            nas_memory_total_bytes,
            nas_memory_used_bytes,
            nas_memory_available_bytes,
            nas_volume_size_bytes,
            nas_volume_used_bytes,
            nas_volume_usage_percent,
            nas_disk_count,
            nas_disk_temperature_celsius,
            nas_disk_healthy,
            nas_disk_active,
            nas_disk_power_on_hours,
            nas_ups_battery_percent,
            nas_ups_load_percent,
            nas_ups_input_voltage,
            nas_ups_output_voltage,
            nas_ups_runtime_seconds,
            nas_ups_on_battery,
            nas_vm_running,
            nas_container_running,
            nas_last_snapshot_timestamp_seconds,
            nasmond_uptime_seconds,
            nasmond_scrape_count_total,
            nasmond_poll_cycles_total,
            nasmond_collect_errors_total,
            nasmond_control_actions_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &SystemSnapshot) {
        self.nas_host_status.reset();
        for status in [HostStatus::On, HostStatus::Off, HostStatus::Rebooting] {
            self.nas_host_status
                .with_label_values(&[host_status_label(status)])
                .set(if status == snapshot.status { 1.0 } else { 0.0 });
        }
        self.nas_last_snapshot_timestamp_seconds
            .set(snapshot.timestamp_unix as f64);

        let system = &snapshot.system;
        self.nas_uptime_seconds.set(system.uptime_seconds as f64);
        self.nas_cpu_temperature_celsius
            .set(or_nan(system.cpu_temperature_celsius));
        self.nas_motherboard_temperature_celsius
            .set(or_nan(system.motherboard_temperature_celsius));
        self.nas_memory_total_bytes
            .set(system.memory_total_bytes.unwrap_or(0) as f64);
        self.nas_memory_used_bytes
            .set(system.memory_used_bytes.unwrap_or(0) as f64);
        self.nas_memory_available_bytes
            .set(system.memory_available_bytes.unwrap_or(0) as f64);

        self.nas_volume_size_bytes.reset();
        self.nas_volume_used_bytes.reset();
        self.nas_volume_usage_percent.reset();
        self.nas_disk_temperature_celsius.reset();
        self.nas_disk_healthy.reset();
        self.nas_disk_active.reset();
        self.nas_disk_power_on_hours.reset();
        self.nas_vm_running.reset();
        self.nas_container_running.reset();

        for (mount, volume) in &system.volumes {
            if let Some(size) = volume.size_bytes {
                self.nas_volume_size_bytes
                    .with_label_values(&[mount])
                    .set(size as f64);
            }
            if let Some(used) = volume.used_bytes {
                self.nas_volume_used_bytes
                    .with_label_values(&[mount])
                    .set(used as f64);
            }
            if let Some(pct) = volume.use_percent {
                self.nas_volume_usage_percent
                    .with_label_values(&[mount])
                    .set(pct);
            }
        }

        self.nas_disk_count.set(snapshot.disks.len() as f64);
        for d in &snapshot.disks {
            if let Some(t) = d.details.temperature_celsius {
                self.nas_disk_temperature_celsius
                    .with_label_values(&[&d.device])
                    .set(t);
            }
            if let Some(h) = d.details.power_on_hours {
                self.nas_disk_power_on_hours
                    .with_label_values(&[&d.device])
                    .set(h);
            }
            let health = label_of(&d.details.health);
            self.nas_disk_healthy
                .with_label_values(&[&d.device, &health])
                .set(if d.details.health == DiskHealth::Good {
                    1.0
                } else {
                    0.0
                });
            let activity = label_of(&d.activity);
            self.nas_disk_active
                .with_label_values(&[&d.device, &activity])
                .set(if d.activity == ActivityState::Active {
                    1.0
                } else {
                    0.0
                });
        }

        let ups = &snapshot.ups;
        self.nas_ups_battery_percent.set(or_nan(ups.battery_percent));
        self.nas_ups_load_percent.set(or_nan(ups.load_percent));
        self.nas_ups_input_voltage.set(or_nan(ups.input_voltage));
        self.nas_ups_output_voltage.set(or_nan(ups.output_voltage));
        self.nas_ups_runtime_seconds
            .set(or_nan(ups.runtime_remaining_secs.map(|s| s as f64)));
        let on_battery = matches!(
            ups.status,
            UpsStatus::OnBattery | UpsStatus::LowBattery | UpsStatus::Discharging
        );
        self.nas_ups_on_battery
            .set(if on_battery { 1.0 } else { 0.0 });

        for vm in &snapshot.vms {
            self.nas_vm_running
                .with_label_values(&[&vm.name, &vm.title])
                .set(if vm.state == VmState::Running { 1.0 } else { 0.0 });
        }
        for c in &snapshot.containers {
            self.nas_container_running
                .with_label_values(&[&c.name, &c.image])
                .set(if c.state == ContainerState::Running {
                    1.0
                } else {
                    0.0
                });
        }

        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.nasmond_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.nasmond_scrape_count_total.inc();
    }

    pub fn inc_poll_cycle(&self, outcome: &str) {
        self.nasmond_poll_cycles_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.nasmond_collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn inc_control_action(&self, action: &str, result: &str) {
        self.nasmond_control_actions_total
            .with_label_values(&[action, result])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn or_nan(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

fn host_status_label(status: HostStatus) -> &'static str {
    match status {
        HostStatus::On => "on",
        HostStatus::Off => "off",
        HostStatus::Rebooting => "rebooting",
    }
}

/// The snake_case serde name of a state enum, used as a label value.
fn label_of<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
