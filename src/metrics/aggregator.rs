//! Periodic metrics aggregation.
//!
//! Two loops share one [`MetricsAggregator`]:
//! - a ticker that drains the packet counters once per interval, merges the
//!   latest probe metrics, publishes a [`MetricsSnapshot`] and appends it to
//!   the session log
//! - a config observer that opens a new session log when logging is switched
//!   on and closes it when switched off
//!
//! File work (directory creation, rotation, open, append, flush) runs on the
//! blocking pool; the async loops only await its completion. Log failures are
//! logged and otherwise ignored. While `logging_enabled` stays on, a log that
//! failed to open is retried on every tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use super::csv_log::CsvLog;
use super::rotation::RotationPolicy;
use super::{format_rate_compact, now_ms, LinkQuality, MetricsSnapshot, ProbeMetrics};
use crate::core::traffic::PacketCounters;
use crate::services::ShutdownListener;
use crate::settings::SettingsStore;

/// The session log and everything needed to (re)open it. Only touched from
/// the blocking pool, apart from the cached `path`.
struct LogSlot {
    dir: PathBuf,
    rotation: RotationPolicy,
    settings: SettingsStore,
    current: Mutex<Option<CsvLog>>,
    path: RwLock<Option<PathBuf>>,
}

impl LogSlot {
    fn open_locked(&self, current: &mut Option<CsvLog>) {
        if current.is_some() {
            return;
        }
        match CsvLog::open(&self.dir, &self.rotation) {
            Ok(opened) => {
                *self.path.write() = Some(opened.path().to_path_buf());
                *current = Some(opened);
            }
            Err(e) => tracing::warn!("Failed to open metrics log in {}: {e}", self.dir.display()),
        }
    }

    fn open(&self) {
        self.open_locked(&mut self.current.lock());
    }

    fn close(&self) {
        let Some(mut log) = self.current.lock().take() else {
            return;
        };
        *self.path.write() = None;
        if let Err(e) = log.flush() {
            tracing::debug!("Final flush of {} failed: {e}", log.path().display());
        }
        tracing::info!("Closed metrics log {}", log.path().display());
    }

    /// Write one row, reopening first if logging is on but no log is open.
    fn append(&self, snapshot: &MetricsSnapshot) {
        let mut current = self.current.lock();
        let config = self.settings.read();
        if config.logging_enabled {
            self.open_locked(&mut current);
        }
        let Some(log) = current.as_mut() else {
            return;
        };
        if let Err(e) = log.append(snapshot, &config) {
            tracing::warn!("Failed to append metrics row to {}: {e}", log.path().display());
        }
    }
}

pub struct MetricsAggregator {
    counters: Arc<PacketCounters>,
    settings: SettingsStore,
    probe: watch::Receiver<ProbeMetrics>,
    link_quality: Arc<dyn LinkQuality>,
    snapshots: watch::Sender<MetricsSnapshot>,
    log: Arc<LogSlot>,
    interval: Duration,
    started: Instant,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("log_dir", &self.log.dir)
            .field("interval", &self.interval)
            .field("log_path", &self.log_path())
            .finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    pub fn new(
        counters: Arc<PacketCounters>,
        settings: SettingsStore,
        probe: watch::Receiver<ProbeMetrics>,
        link_quality: Arc<dyn LinkQuality>,
        log_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        let (snapshots, _) = watch::channel(MetricsSnapshot::default());
        let log = Arc::new(LogSlot {
            dir: log_dir,
            rotation: RotationPolicy::default(),
            settings: settings.clone(),
            current: Mutex::new(None),
            path: RwLock::new(None),
        });
        Self {
            counters,
            settings,
            probe,
            link_quality,
            snapshots,
            log,
            interval,
            started: Instant::now(),
        }
    }

    /// Override the retention limits applied when a log is opened.
    ///
    /// Must be called before the aggregator is shared.
    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        if let Some(slot) = Arc::get_mut(&mut self.log) {
            slot.rotation = rotation;
        }
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log.dir
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> MetricsSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Path of the open session log, if logging is active.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.path.read().clone()
    }

    pub fn is_logging(&self) -> bool {
        self.log.path.read().is_some()
    }

    /// Drain the counters into a new snapshot, publish it and log it.
    pub async fn emit_snapshot(&self) -> MetricsSnapshot {
        let totals = self.counters.take();
        let probe = *self.probe.borrow();
        let snapshot = MetricsSnapshot::new(
            now_ms(),
            self.started.elapsed(),
            totals,
            self.interval,
            probe,
            self.link_quality.as_ref(),
        );
        self.snapshots.send_replace(snapshot.clone());

        let row = snapshot.clone();
        self.with_log(move |log| log.append(&row)).await;
        snapshot
    }

    /// Open a new session log unless one is already open.
    pub async fn open_log(&self) {
        self.with_log(LogSlot::open).await;
    }

    /// Flush and release the session log, if any.
    pub async fn close_log(&self) {
        self.with_log(LogSlot::close).await;
    }

    /// Open or close the session log to match `logging_enabled`.
    pub async fn sync_logging(&self, logging_enabled: bool) {
        match (logging_enabled, self.is_logging()) {
            (true, false) => self.open_log().await,
            (false, true) => self.close_log().await,
            _ => {}
        }
    }

    async fn with_log<F>(&self, work: F)
    where
        F: FnOnce(&LogSlot) + Send + 'static,
    {
        let slot = Arc::clone(&self.log);
        if let Err(e) = tokio::task::spawn_blocking(move || work(&slot)).await {
            tracing::warn!("Metrics log worker failed: {e}");
        }
    }

    /// Follow `logging_enabled` until shutdown.
    pub async fn run_config_observer(self: Arc<Self>, mut shutdown: ShutdownListener) {
        let mut changes = self.settings.subscribe();
        let enabled = changes.borrow_and_update().logging_enabled;
        self.sync_logging(enabled).await;

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let enabled = changes.borrow_and_update().logging_enabled;
                    self.sync_logging(enabled).await;
                }
            }
        }
    }

    /// Emit one snapshot per interval until shutdown. The first snapshot is
    /// emitted one full interval after start.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {
                    let snapshot = self.emit_snapshot().await;
                    tracing::debug!(
                        "Tick {}s: \u{2191} {} \u{2193} {} rtt={:?}",
                        snapshot.elapsed_secs,
                        format_rate_compact(snapshot.bytes_up_per_sec),
                        format_rate_compact(snapshot.bytes_down_per_sec),
                        snapshot.probe.rtt_mean_ms,
                    );
                }
            }
        }
    }
}
