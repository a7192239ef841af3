use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::extract::{first_match, parse_number, TextExtractor};
use super::{run, run_optional, Collector, CollectorError};
use crate::channel::CommandRunner;
use crate::state::{SystemVitals, VolumeUsage};

lazy_static! {
    static ref SENSOR_READING: Regex =
        Regex::new(r"\+(\d+(?:\.\d+)?)\s*°C").expect("valid sensor reading pattern");
}

/// Picks the first `sensors` line containing one of `keywords` (and none of
/// `excludes`) whose reading falls inside `range`.
struct SensorLine {
    keywords: &'static [&'static str],
    excludes: &'static [&'static str],
    range: (f64, f64),
}

impl TextExtractor for SensorLine {
    fn extract(&self, text: &str) -> Option<String> {
        text.lines().find_map(|line| {
            let lower = line.to_lowercase();
            if !self.keywords.iter().any(|k| lower.contains(k))
                || self.excludes.iter().any(|x| lower.contains(x))
            {
                return None;
            }
            let value = parse_number(SENSOR_READING.captures(line)?.get(1)?.as_str())?;
            (value > self.range.0 && value < self.range.1).then(|| value.to_string())
        })
    }
}

const CPU_AMD: SensorLine = SensorLine {
    keywords: &["tctl", "tdie", "k10temp"],
    excludes: &[],
    range: (0.0, 150.0),
};
const CPU_INTEL: SensorLine = SensorLine {
    keywords: &["package id", "core 0", "coretemp"],
    excludes: &["fan"],
    range: (0.0, 150.0),
};
const CPU_GENERIC: SensorLine = SensorLine {
    keywords: &["cpu", "processor"],
    excludes: &["fan"],
    range: (0.0, 150.0),
};
const BOARD: SensorLine = SensorLine {
    keywords: &[
        "motherboard", "mobo", "mb", "system", "chipset", "ambient", "temp1:", "temp2:",
        "temp3:", "systin",
    ],
    excludes: &["cpu", "core", "package", "processor", "tctl", "tdie", "fan", "rpm"],
    range: (14.9, 70.1),
};

pub fn cpu_temperature(sensors: &str) -> Option<f64> {
    first_match(&[&CPU_AMD, &CPU_INTEL, &CPU_GENERIC], sensors).and_then(|v| parse_number(&v))
}

pub fn board_temperature(sensors: &str) -> Option<f64> {
    BOARD.extract(sensors).and_then(|v| parse_number(&v))
}

pub fn parse_uptime(raw: &str) -> Option<u64> {
    let secs = parse_number(raw.split_whitespace().next()?)?;
    (secs >= 0.0).then(|| secs as u64)
}

pub fn format_uptime(seconds: u64) -> String {
    let minutes = (seconds / 60).max(1) * 60;
    humantime::format_duration(Duration::from_secs(minutes)).to_string()
}

pub fn parse_memory(raw: &str) -> Option<(u64, u64, u64)> {
    let row = raw.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let cols: Vec<&str> = row.split_whitespace().collect();
    if cols.len() < 7 {
        return None;
    }
    Some((cols[1].parse().ok()?, cols[2].parse().ok()?, cols[6].parse().ok()?))
}

fn human_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["", "K", "M", "G", "T"] {
        if value < 1024.0 {
            return format!("{value:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}P")
}

/// Parses `df` rows for `/vol*` mount points. `bytes` selects `df -B 1`
/// output; otherwise the sizes are kept as printed by `df -h`.
pub fn parse_volumes(raw: &str, bytes: bool) -> BTreeMap<String, VolumeUsage> {
    let mut volumes = BTreeMap::new();
    for line in raw.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            continue;
        }
        let mount = cols[cols.len() - 1];
        if !mount.starts_with("/vol") {
            continue;
        }
        let use_percent = parse_number(cols[4].trim_end_matches('%'));
        let usage = if bytes {
            let parsed: Option<Vec<u64>> = cols[1..4].iter().map(|c| c.parse().ok()).collect();
            let Some(sizes) = parsed else {
                debug!(line, "skipping unparseable df row");
                continue;
            };
            VolumeUsage {
                filesystem: cols[0].to_string(),
                size: human_bytes(sizes[0]),
                used: human_bytes(sizes[1]),
                available: human_bytes(sizes[2]),
                use_percent,
                size_bytes: Some(sizes[0]),
                used_bytes: Some(sizes[1]),
                available_bytes: Some(sizes[2]),
            }
        } else {
            VolumeUsage {
                filesystem: cols[0].to_string(),
                size: cols[1].to_string(),
                used: cols[2].to_string(),
                available: cols[3].to_string(),
                use_percent,
                size_bytes: None,
                used_bytes: None,
                available_bytes: None,
            }
        };
        volumes.insert(mount.to_string(), usage);
    }
    volumes
}

#[derive(Default)]
pub struct SystemCollector;

impl SystemCollector {
    async fn volumes(runner: &dyn CommandRunner) -> BTreeMap<String, VolumeUsage> {
        if let Some(out) = run_optional(runner, "df -B 1 /vol* 2>/dev/null || true").await {
            let volumes = parse_volumes(&out, true);
            if !volumes.is_empty() {
                return volumes;
            }
        }
        run_optional(runner, "df -h /vol* 2>/dev/null || true")
            .await
            .map(|out| parse_volumes(&out, false))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Collector for SystemCollector {
    type Record = SystemVitals;

    fn name(&self) -> &'static str {
        "system"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<SystemVitals, CollectorError> {
        let (uptime, sensors, memory, volumes) = tokio::join!(
            run(runner, "cat /proc/uptime"),
            run_optional(runner, "sensors 2>/dev/null || true"),
            run_optional(runner, "free -b"),
            Self::volumes(runner),
        );

        let mut vitals = SystemVitals {
            volumes,
            ..SystemVitals::default()
        };
        if let Some(seconds) = parse_uptime(&uptime?) {
            vitals.uptime_seconds = seconds;
            vitals.uptime = format_uptime(seconds);
        }
        if let Some(sensors) = sensors {
            vitals.cpu_temperature_celsius = cpu_temperature(&sensors);
            vitals.motherboard_temperature_celsius = board_temperature(&sensors);
            if vitals.cpu_temperature_celsius.is_none() {
                debug!("no cpu temperature in sensors output");
            }
        }
        if let Some((total, used, available)) = memory.as_deref().and_then(parse_memory) {
            vitals.memory_total_bytes = Some(total);
            vitals.memory_used_bytes = Some(used);
            vitals.memory_available_bytes = Some(available);
        }
        Ok(vitals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedRunner;

    const SENSORS: &str = "\
k10temp-pci-00c3
Adapter: PCI adapter
Tctl:         +52.5°C

nct6798-isa-0290
Adapter: ISA adapter
SYSTIN:                 +34.0°C  (high = +80.0°C, hyst = +75.0°C)
CPUTIN:                 +40.5°C  (high = +80.0°C, hyst = +75.0°C)
fan1:                  812 RPM  (min =    0 RPM)
";

    const FREE: &str = "\
               total        used        free      shared  buff/cache   available
Mem:     16663572480  3170918400  9437184000    10485760  4055470080 13120094208
Swap:     2147479552           0  2147479552
";

    const DF_BYTES: &str = "\
Filesystem       1B-blocks          Used     Available Use% Mounted on
/dev/md0     3936818806784 1968409403392 1968409403392  50% /vol1
tmpfs            1048576             0       1048576   0% /run
";

    #[test]
    fn sensors_heuristics_pick_cpu_and_board() {
        assert_eq!(cpu_temperature(SENSORS), Some(52.5));
        assert_eq!(board_temperature(SENSORS), Some(34.0));
        assert_eq!(cpu_temperature("nothing useful"), None);
    }

    #[test]
    fn intel_package_temperature() {
        let out = "coretemp-isa-0000\nPackage id 0:  +45.0°C  (high = +80.0°C)\nCore 0: +43.0°C\n";
        assert_eq!(cpu_temperature(out), Some(45.0));
    }

    #[test]
    fn uptime_is_humanised_to_minutes() {
        assert_eq!(parse_uptime("273720.41 1000.00"), Some(273720));
        assert_eq!(format_uptime(273720), "3days 4h 2m");
        assert_eq!(format_uptime(5), "1m");
    }

    #[test]
    fn memory_and_volumes_parse() {
        assert_eq!(
            parse_memory(FREE),
            Some((16663572480, 3170918400, 13120094208))
        );
        let vols = parse_volumes(DF_BYTES, true);
        assert_eq!(vols.len(), 1);
        let vol1 = &vols["/vol1"];
        assert_eq!(vol1.use_percent, Some(50.0));
        assert_eq!(vol1.size_bytes, Some(3936818806784));
        assert_eq!(vol1.size, "3.6T");
    }

    #[test]
    fn human_readable_df_fallback() {
        let out = "Filesystem Size Used Avail Use% Mounted on\n/dev/md1 1.8T 900G 900G 50% /vol2\n";
        let vols = parse_volumes(out, false);
        assert_eq!(vols["/vol2"].size, "1.8T");
        assert_eq!(vols["/vol2"].size_bytes, None);
    }

    #[tokio::test]
    async fn collect_degrades_optional_fields() {
        let runner = ScriptedRunner::new();
        runner.respond("cat /proc/uptime", "120.5 100.0");
        runner.respond("free -b", FREE);

        let vitals = SystemCollector.collect(&runner).await.expect("collect");
        assert_eq!(vitals.uptime_seconds, 120);
        assert_eq!(vitals.uptime, "2m");
        assert_eq!(vitals.memory_total_bytes, Some(16663572480));
        assert_eq!(vitals.cpu_temperature_celsius, None);
        assert!(vitals.volumes.is_empty());
    }

    #[tokio::test]
    async fn missing_uptime_fails_the_section() {
        let runner = ScriptedRunner::new();
        assert!(SystemCollector.collect(&runner).await.is_err());
    }
}
