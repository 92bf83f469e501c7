//! Telemetry: probe metrics, per-interval snapshots and the CSV session log.
//!
//! - [`MetricsAggregator`]: 1 s snapshot ticker plus the logging on/off observer
//! - [`csv_log`]: one CSV file per logging session
//! - [`rotation`]: bounds the log directory by file count and total size

pub mod aggregator;
pub mod csv_log;
pub mod rotation;

use std::time::Duration;

use serde::Serialize;

use crate::core::traffic::TrafficTotals;

pub use aggregator::MetricsAggregator;
pub use csv_log::CsvLog;
pub use rotation::{rotate_logs, RotationPolicy};

/// Rolling path statistics published by the prober.
///
/// `None` means undefined: no sample yet, or the last probe failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeMetrics {
    pub rtt_mean_ms: Option<f64>,
    pub rtt_p95_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_percent: Option<f64>,
}

/// Optional radio/link readings supplied by the host.
pub trait LinkQuality: Send + Sync {
    fn signal_strength_dbm(&self) -> Option<i32>;
    fn link_speed_mbps(&self) -> Option<u32>;
}

/// Link-quality source for hosts without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinkQuality;

impl LinkQuality for NoLinkQuality {
    fn signal_strength_dbm(&self) -> Option<i32> {
        None
    }

    fn link_speed_mbps(&self) -> Option<u32> {
        None
    }
}

/// One aggregation tick. Never mutated after publication.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Wall-clock time, ms since the Unix epoch.
    pub timestamp_ms: i64,
    pub elapsed_secs: u64,
    /// No flow tracking exists; always 0.
    pub flows_active: u32,
    pub bytes_up_per_sec: u64,
    pub bytes_down_per_sec: u64,
    pub packets_up_per_sec: u64,
    pub packets_down_per_sec: u64,
    pub signal_strength_dbm: Option<i32>,
    pub link_speed_mbps: Option<u32>,
    #[serde(flatten)]
    pub probe: ProbeMetrics,
}

impl MetricsSnapshot {
    /// Build a snapshot from counters drained over `interval`.
    pub fn new(
        timestamp_ms: i64,
        elapsed: Duration,
        totals: TrafficTotals,
        interval: Duration,
        probe: ProbeMetrics,
        link: &dyn LinkQuality,
    ) -> Self {
        Self {
            timestamp_ms,
            elapsed_secs: elapsed.as_secs(),
            flows_active: 0,
            bytes_up_per_sec: per_second(totals.bytes_up, interval),
            bytes_down_per_sec: per_second(totals.bytes_down, interval),
            packets_up_per_sec: per_second(totals.packets_up, interval),
            packets_down_per_sec: per_second(totals.packets_down, interval),
            signal_strength_dbm: link.signal_strength_dbm(),
            link_speed_mbps: link.link_speed_mbps(),
            probe,
        }
    }
}

fn per_second(count: u64, interval: Duration) -> u64 {
    let millis = interval.as_millis();
    if millis == 0 {
        return count;
    }
    (u128::from(count) * 1_000 / millis) as u64
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a byte rate in a compact human-readable form.
pub fn format_rate_compact(bytes_per_sec: u64) -> String {
    let bps = bytes_per_sec as f64;
    if bps < 1024.0 {
        format!("{:.0} B/s", bps)
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.2} MB/s", bps / (1024.0 * 1024.0))
    }
}
