//! CSV session log: one file per logging session, one row per snapshot.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::rotation::{rotate_logs, RotationPolicy};
use super::MetricsSnapshot;
use crate::config::{LOG_FILE_EXTENSION, LOG_FILE_PREFIX};
use crate::error::ShaperError;
use crate::settings::ShapingConfig;

/// Column names, written once at the top of an empty file.
pub const HEADER: [&str; 22] = [
    "ts_utc",
    "elapsed_s",
    "flows_active",
    "bytes_up_s",
    "bytes_down_s",
    "pkts_up_s",
    "pkts_down_s",
    "rtt_ms_mean",
    "rtt_ms_p95",
    "jitter_ms",
    "loss_pct",
    "lat_ms",
    "jit_ms",
    "loss_pct_cfg",
    "bw_up_kbps",
    "bw_down_kbps",
    "target_pkg",
    "notes",
    "shaping_enabled",
    "logging_enabled",
    "wifi_rssi_dbm",
    "link_speed_mbps",
];

/// `netlog_<yyyyMMdd_HHmmss>.csv` for the given local time.
pub fn log_file_name(time: DateTime<Local>) -> String {
    format!(
        "{LOG_FILE_PREFIX}{}.{LOG_FILE_EXTENSION}",
        time.format("%Y%m%d_%H%M%S")
    )
}

/// An open session log. Every row is flushed as soon as it is written.
pub struct CsvLog {
    path: PathBuf,
    writer: csv::Writer<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for CsvLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvLog").field("path", &self.path).finish_non_exhaustive()
    }
}

impl CsvLog {
    /// Rotate `dir`, then open (or append to) a new timestamped log inside it.
    pub fn open(dir: &Path, policy: &RotationPolicy) -> Result<Self, ShaperError> {
        fs::create_dir_all(dir)?;
        if let Err(e) = rotate_logs(dir, policy) {
            tracing::warn!("Log rotation failed in {}: {e}", dir.display());
        }

        let path = dir.join(log_file_name(Local::now()));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;

        let mut log = Self::from_writer(path, Box::new(file));
        if is_empty {
            log.writer.write_record(HEADER)?;
            log.writer.flush()?;
        }
        tracing::info!("Logging metrics to {}", log.path.display());
        Ok(log)
    }

    /// Log over an arbitrary writer. No header is written.
    pub fn from_writer(path: PathBuf, writer: Box<dyn Write + Send>) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        Self { path, writer }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row for `snapshot` under `config`.
    pub fn append(&mut self, snapshot: &MetricsSnapshot, config: &ShapingConfig) -> Result<(), ShaperError> {
        self.writer.write_record(format_row(snapshot, config))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), ShaperError> {
        self.writer.flush()?;
        Ok(())
    }
}

fn format_row(snapshot: &MetricsSnapshot, config: &ShapingConfig) -> [String; 22] {
    let probe = &snapshot.probe;
    [
        snapshot.timestamp_ms.to_string(),
        snapshot.elapsed_secs.to_string(),
        snapshot.flows_active.to_string(),
        snapshot.bytes_up_per_sec.to_string(),
        snapshot.bytes_down_per_sec.to_string(),
        snapshot.packets_up_per_sec.to_string(),
        snapshot.packets_down_per_sec.to_string(),
        metric(probe.rtt_mean_ms),
        metric(probe.rtt_p95_ms),
        metric(probe.jitter_ms),
        metric(probe.loss_percent),
        config.latency_ms.to_string(),
        config.jitter_ms.to_string(),
        decimal(config.packet_loss_percent),
        config.bandwidth_up_kbps.to_string(),
        config.bandwidth_down_kbps.to_string(),
        config.target_package.replace(',', " "),
        config.notes.replace(',', " "),
        flag(config.shaping_enabled),
        flag(config.logging_enabled),
        optional(snapshot.signal_strength_dbm),
        optional(snapshot.link_speed_mbps),
    ]
}

/// Undefined metrics are written as `NaN`.
fn metric(value: Option<f64>) -> String {
    decimal(value.unwrap_or(f64::NAN))
}

/// Floats always keep a fractional part (`40.0`, not `40`).
fn decimal<T: std::fmt::Debug>(value: T) -> String {
    format!("{value:?}")
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
