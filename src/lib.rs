//! Network impairment engine.
//!
//! Sits between an application's traffic and the real network and injects
//! configurable latency, jitter, packet loss and bandwidth ceilings, while
//! probing the live path and logging per-second telemetry to CSV.
//!
//! The host process supplies packet capture through [`capture::CaptureBackend`]
//! and drives the engine through [`SettingsStore`]:
//!
//! ```no_run
//! # async fn demo() -> Result<(), netshaper_lib::ShaperError> {
//! use netshaper_lib::capture::channel::ChannelBackend;
//! use netshaper_lib::{Engine, EngineOptions, PresetProfile, SettingsStore};
//!
//! let settings = SettingsStore::default();
//! let (backend, _handle) = ChannelBackend::new(1_024);
//! let engine = Engine::start(settings.clone(), &backend, EngineOptions::new("logs"))?;
//! settings.apply_preset(PresetProfile::HighPing);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod services;
pub mod settings;

pub use error::ShaperError;
pub use metrics::{MetricsSnapshot, ProbeMetrics};
pub use services::{Engine, EngineOptions, ShutdownListener, ShutdownSignal};
pub use settings::{PresetProfile, SettingsStore, ShapingConfig};

/// Install the global tracing subscriber and a panic hook that logs panics.
///
/// Filter comes from `RUST_LOG`, defaulting to `netshaper=info`. Calling this
/// more than once, or after the host installed its own subscriber, is a no-op
/// apart from the panic hook.
pub fn init_tracing() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in netshaper: {info}");
        default_hook(info);
    }));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netshaper=info".into()),
        )
        .try_init();
}
