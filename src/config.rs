//! Centralized runtime constants for NetShaper.
//!
//! All tunable intervals, thresholds, and counts are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.

/// Interval at which the metrics aggregator reads counters and emits a snapshot (seconds).
pub const STATS_INTERVAL_SECS: u64 = 1;

/// Interval between two reachability probes (milliseconds).
pub const PROBE_INTERVAL_MS: u64 = 500;

/// Upper bound on a single reachability probe (milliseconds).
pub const PROBE_TIMEOUT_MS: u64 = 1_000;

/// Number of successful RTT samples kept in the probe sliding window.
pub const PROBE_WINDOW_SIZE: usize = 20;

/// TCP port used by the default reachability probe.
pub const PROBE_TCP_PORT: u16 = 443;

/// Token bucket capacity, expressed as seconds of the configured rate.
pub const BURST_WINDOW_SECS: f64 = 1.5;

/// Maximum number of CSV log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum combined size of all CSV log files (bytes).
pub const MAX_LOG_TOTAL_BYTES: u64 = 100 * 1024 * 1024;

/// File name prefix shared by every CSV log file.
pub const LOG_FILE_PREFIX: &str = "netlog_";

/// File extension of CSV log files.
pub const LOG_FILE_EXTENSION: &str = "csv";

/// Back-off after a capture receive error before reading again (milliseconds).
pub const CAPTURE_RETRY_DELAY_MS: u64 = 100;

/// Bandwidth used when nothing else is configured (kbps).
pub const DEFAULT_BANDWIDTH_KBPS: u32 = 10_000;

/// Reserved bandwidth value meaning "no ceiling".
pub const UNLIMITED_KBPS: u32 = u32::MAX;

/// Probe target used when the configured host is blank.
pub const DEFAULT_PROBE_HOST: &str = "8.8.8.8";

/// Capture selector used when the configured one is blank.
pub const DEFAULT_TARGET_PACKAGE: &str = "quest.eleven.forfunlabs";
