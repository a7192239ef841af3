use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::debug;

use super::extract::{leading_number, PatternChain, TextExtractor};
use super::{run, run_optional, Collector, CollectorError};
use crate::channel::privilege::shell_quote;
use crate::channel::CommandRunner;
use crate::state::{UpsRecord, UpsSource, UpsStatus};

lazy_static! {
    static ref USB_MODEL: PatternChain = PatternChain::new(&[r"ID\s+\w+:\w+\s+(.+)$"]);
}

/// Parses `upsc <name>` key/value output.
pub fn parse_nut(raw: &str) -> UpsRecord {
    let data: HashMap<&str, &str> = raw
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();
    let number = |key: &str| data.get(key).and_then(|v| leading_number(v));

    UpsRecord {
        status: data
            .get("ups.status")
            .map(|s| UpsStatus::from_nut_flags(s))
            .unwrap_or(UpsStatus::Unknown),
        battery_percent: number("battery.charge"),
        runtime_remaining_secs: number("battery.runtime").map(|s| s.max(0.0) as u64),
        input_voltage: number("input.voltage"),
        output_voltage: number("output.voltage"),
        load_percent: number("ups.load"),
        model: data
            .get("ups.model")
            .or_else(|| data.get("device.model"))
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string()),
        source: UpsSource::Nut,
    }
}

#[derive(Default)]
pub struct UpsCollector;

impl UpsCollector {
    async fn from_nut(runner: &dyn CommandRunner) -> Option<UpsRecord> {
        let listing = run_optional(runner, "upsc -l 2>/dev/null || true").await?;
        let name = listing.lines().map(str::trim).find(|l| !l.is_empty())?;
        debug!(ups = name, "nut ups found");
        match run(runner, &format!("upsc {} 2>/dev/null", shell_quote(name))).await {
            Ok(details) => Some(parse_nut(&details)),
            Err(err) => {
                debug!(ups = name, error = %err, "upsc query failed");
                None
            }
        }
    }

    /// Best-effort detection without NUT: USB listing, UPS daemon state and
    /// the kernel power-supply capacity.
    async fn from_probes(runner: &dyn CommandRunner) -> UpsRecord {
        let (usb, service, capacity) = tokio::join!(
            run_optional(runner, "lsusb 2>/dev/null | grep -i ups || true"),
            run_optional(
                runner,
                "systemctl status nut-server apcupsd 2>/dev/null | grep -i 'active (running)' || true"
            ),
            run_optional(runner, "cat /sys/class/power_supply/*/capacity 2>/dev/null || true"),
        );

        let mut record = UpsRecord::default();
        if let Some(usb) = usb {
            record.source = UpsSource::UsbProbe;
            record.model = USB_MODEL.extract(&usb);
        }
        if service.is_some_and(|s| s.to_lowercase().contains("active (running)")) {
            record.status = UpsStatus::Online;
        }
        record.battery_percent = capacity
            .as_deref()
            .and_then(|c| c.lines().next())
            .and_then(|c| c.trim().parse::<u8>().ok())
            .map(f64::from);
        record
    }
}

#[async_trait]
impl Collector for UpsCollector {
    type Record = UpsRecord;

    fn name(&self) -> &'static str {
        "ups"
    }

    async fn collect(&self, runner: &dyn CommandRunner) -> Result<UpsRecord, CollectorError> {
        if let Some(record) = Self::from_nut(runner).await {
            return Ok(record);
        }
        debug!("nut unavailable, probing for a ups");
        Ok(Self::from_probes(runner).await)
    }
}
