//! Live-reconfigurable impairment settings.
//!
//! - [`ShapingConfig`] — immutable configuration snapshot, replaced wholesale on update
//! - [`PresetProfile`] — named bundles of impairment values
//! - [`SettingsStore`] — shared, observable, versioned holder of the current config
//!
//! The store is copy-on-write: readers get an `Arc<ShapingConfig>` and never
//! observe a partially-updated value. Observers subscribe to a `tokio::sync::watch`
//! channel and always see the latest value.

mod preset;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{
    DEFAULT_BANDWIDTH_KBPS, DEFAULT_PROBE_HOST, DEFAULT_TARGET_PACKAGE, UNLIMITED_KBPS,
};

pub use preset::PresetProfile;

/// Complete impairment and logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    pub shaping_enabled: bool,
    pub logging_enabled: bool,
    pub latency_ms: u32,
    pub jitter_ms: u32,
    /// Drop probability in percent, `0.0..=100.0`.
    pub packet_loss_percent: f32,
    /// Upload ceiling in kbps, or [`UNLIMITED_KBPS`].
    pub bandwidth_up_kbps: u32,
    /// Download ceiling in kbps, or [`UNLIMITED_KBPS`].
    pub bandwidth_down_kbps: u32,
    /// Host name or IP address the prober measures against.
    pub probe_host: String,
    /// Opaque selector handed to the capture backend.
    pub target_package: String,
    pub notes: String,
    pub preset: PresetProfile,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            shaping_enabled: false,
            logging_enabled: true,
            latency_ms: 0,
            jitter_ms: 0,
            packet_loss_percent: 0.0,
            bandwidth_up_kbps: DEFAULT_BANDWIDTH_KBPS,
            bandwidth_down_kbps: DEFAULT_BANDWIDTH_KBPS,
            probe_host: DEFAULT_PROBE_HOST.to_string(),
            target_package: DEFAULT_TARGET_PACKAGE.to_string(),
            notes: String::new(),
            preset: PresetProfile::None,
        }
    }
}

impl ShapingConfig {
    /// Clamp loss into `[0, 100]` and map a zero bandwidth to the unlimited sentinel.
    pub fn normalized(mut self) -> Self {
        self.packet_loss_percent = if self.packet_loss_percent.is_nan() {
            0.0
        } else {
            self.packet_loss_percent.clamp(0.0, 100.0)
        };
        if self.bandwidth_up_kbps == 0 {
            self.bandwidth_up_kbps = UNLIMITED_KBPS;
        }
        if self.bandwidth_down_kbps == 0 {
            self.bandwidth_down_kbps = UNLIMITED_KBPS;
        }
        self
    }

    /// Copy of `self` with the preset's five shaping fields applied.
    ///
    /// Shaping is force-enabled unless the preset is `None`, in which case the
    /// current enabled flag is kept.
    pub fn with_preset(&self, preset: PresetProfile) -> Self {
        Self {
            latency_ms: preset.latency_ms(),
            jitter_ms: preset.jitter_ms(),
            packet_loss_percent: preset.loss_percent(),
            bandwidth_up_kbps: preset.bandwidth_up_kbps(),
            bandwidth_down_kbps: preset.bandwidth_down_kbps(),
            preset,
            shaping_enabled: preset != PresetProfile::None || self.shaping_enabled,
            ..self.clone()
        }
    }

    /// Probe host with blank values replaced by [`DEFAULT_PROBE_HOST`].
    pub fn effective_probe_host(&self) -> &str {
        let host = self.probe_host.trim();
        if host.is_empty() {
            DEFAULT_PROBE_HOST
        } else {
            host
        }
    }

    /// Capture selector with blank values replaced by [`DEFAULT_TARGET_PACKAGE`].
    pub fn effective_target_package(&self) -> &str {
        let target = self.target_package.trim();
        if target.is_empty() {
            DEFAULT_TARGET_PACKAGE
        } else {
            target
        }
    }
}

/// Shared holder of the current [`ShapingConfig`].
///
/// Cloning is cheap; all clones observe the same value.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    tx: watch::Sender<Arc<ShapingConfig>>,
    version: AtomicU64,
    /// Serializes read-modify-write cycles; readers never take it.
    writer: Mutex<()>,
}

impl SettingsStore {
    pub fn new(initial: ShapingConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial.normalized()));
        Self {
            inner: Arc::new(StoreInner {
                tx,
                version: AtomicU64::new(0),
                writer: Mutex::new(()),
            }),
        }
    }

    /// Latest configuration.
    pub fn read(&self) -> Arc<ShapingConfig> {
        Arc::clone(&self.inner.tx.borrow())
    }

    /// Atomically replace the configuration with `transform(current)`.
    ///
    /// Concurrent callers are serialized; the last writer wins. Returns the
    /// value that was stored.
    ///
    /// `transform` runs outside the channel lock, so it may read the store or
    /// borrow a subscriber. It must not call `update`, `set` or
    /// `apply_preset` on the same store.
    pub fn update<F>(&self, transform: F) -> Arc<ShapingConfig>
    where
        F: FnOnce(&ShapingConfig) -> ShapingConfig,
    {
        let _writer = self.inner.writer.lock();
        let current = self.read();
        let next = Arc::new(transform(&current).normalized());
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.tx.send_replace(Arc::clone(&next));
        next
    }

    /// Replace the configuration wholesale.
    pub fn set(&self, config: ShapingConfig) -> Arc<ShapingConfig> {
        self.update(move |_| config)
    }

    /// Apply a preset to the current configuration.
    pub fn apply_preset(&self, preset: PresetProfile) -> Arc<ShapingConfig> {
        let applied = self.update(|current| current.with_preset(preset));
        tracing::info!("Applied preset '{preset}'");
        applied
    }

    /// Number of updates applied since construction.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Observe every change. The receiver starts with the current value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ShapingConfig>> {
        self.inner.tx.subscribe()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(ShapingConfig::default())
    }
}
