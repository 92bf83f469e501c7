//! End-to-end engine tests over the in-memory capture backend.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use netshaper_lib::capture::channel::{ChannelBackend, ChannelHandle};
use netshaper_lib::capture::{CaptureBackend, CaptureSession, Direction, Packet};
use netshaper_lib::config::{DEFAULT_PROBE_HOST, DEFAULT_TARGET_PACKAGE};
use netshaper_lib::core::ReachabilityProbe;
use netshaper_lib::{Engine, EngineOptions, PresetProfile, SettingsStore, ShapingConfig};

/// Resolves every host and answers after a fixed delay.
#[derive(Default)]
struct FakeProbe {
    resolved: Mutex<Vec<String>>,
}

impl FakeProbe {
    fn resolved(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn resolve(&self, host: &str) -> io::Result<SocketAddr> {
        self.resolved.lock().push(host.to_string());
        Ok(SocketAddr::from(([127, 0, 0, 1], 443)))
    }

    async fn probe(&self, _addr: SocketAddr, _timeout: Duration) -> bool {
        tokio::time::sleep(Duration::from_millis(25)).await;
        true
    }
}

struct RefusingBackend;

impl CaptureBackend for RefusingBackend {
    fn open(&self, target: &str) -> anyhow::Result<CaptureSession> {
        anyhow::bail!("tunnel permission denied for {target}")
    }
}

struct Harness {
    engine: Engine,
    settings: SettingsStore,
    handle: ChannelHandle,
    backend: ChannelBackend,
    probe: Arc<FakeProbe>,
    dir: tempfile::TempDir,
}

fn start(config: ShapingConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(FakeProbe::default());
    let settings = SettingsStore::new(config);
    let (backend, handle) = ChannelBackend::new(64);
    let mut options = EngineOptions::new(dir.path());
    options.probe = probe.clone();
    options.seed = Some(42);

    let engine = Engine::start(settings.clone(), &backend, options).unwrap();
    Harness {
        engine,
        settings,
        handle,
        backend,
        probe,
        dir,
    }
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect()
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

fn quiet() -> ShapingConfig {
    ShapingConfig {
        logging_enabled: false,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_disabled_shaping_passes_packets_through() {
    let mut h = start(quiet());

    for i in 0..5u8 {
        h.handle
            .packets
            .send(Packet::new(vec![i; 200], Direction::Upstream))
            .await
            .unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(h.handle.forwarded.recv().await.unwrap(), vec![i; 200]);
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let metrics = h.engine.latest_metrics();
    assert_eq!(metrics.bytes_up_per_sec, 1_000);
    assert_eq!(metrics.packets_up_per_sec, 5);
    assert_eq!(metrics.flows_active, 0);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_loss_drops_but_still_counts() {
    let mut h = start(ShapingConfig {
        shaping_enabled: true,
        packet_loss_percent: 100.0,
        ..quiet()
    });

    for _ in 0..4 {
        h.handle
            .packets
            .send(Packet::new(vec![0; 300], Direction::Downstream))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert!(h.handle.forwarded.try_recv().is_err());
    let metrics = h.engine.latest_metrics();
    assert_eq!(metrics.bytes_down_per_sec, 1_200);
    assert_eq!(metrics.packets_down_per_sec, 4);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_preset_applies_latency_to_live_traffic() {
    let mut h = start(quiet());
    h.settings.apply_preset(PresetProfile::HighPing);
    assert!(h.settings.read().shaping_enabled);

    let sent = tokio::time::Instant::now();
    h.handle
        .packets
        .send(Packet::new(vec![1; 100], Direction::Upstream))
        .await
        .unwrap();
    h.handle.forwarded.recv().await.unwrap();

    // High Ping: 120 ms +/- 20 ms of delay
    let elapsed = sent.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(140), "{elapsed:?}");

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_csv_rows_written_each_tick() {
    let h = start(ShapingConfig::default());

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    h.engine.shutdown().await;

    let files = log_files(h.dir.path());
    assert_eq!(files.len(), 1);
    let text = fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("ts_utc,elapsed_s,flows_active,"));
    for row in &lines[1..] {
        assert_eq!(row.split(',').count(), 22, "{row}");
    }
    // Probe answers in 25 ms, so RTT columns are defined by the first tick.
    let first: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(first[7], "25.0");
    assert_eq!(first[10], "0.0");
    assert_eq!(first[13], "0.0");
}

#[tokio::test(start_paused = true)]
async fn test_disabling_logging_closes_file_and_keeps_rows() {
    let h = start(ShapingConfig::default());

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let path = h.engine.aggregator().log_path().unwrap();
    assert_eq!(line_count(&path), 3);

    h.settings.update(|c| ShapingConfig {
        logging_enabled: false,
        ..c.clone()
    });
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    assert!(h.engine.aggregator().log_path().is_none());
    assert_eq!(line_count(&path), 3);
    // The ticker is still alive.
    assert!(h.engine.latest_metrics().elapsed_secs >= 4);

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_capture_surfaces_error_and_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(FakeProbe::default());
    let mut options = EngineOptions::new(dir.path());
    options.probe = probe.clone();

    let err = Engine::start(SettingsStore::default(), &RefusingBackend, options).unwrap_err();
    assert_eq!(err.kind(), "Capture");
    assert!(err.to_string().contains("permission denied"));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(probe.resolved().is_empty());
    assert!(log_files(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_probe_host_change_restarts_prober_once() {
    let h = start(quiet());
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.settings.update(|c| ShapingConfig {
        probe_host: "1.1.1.1".into(),
        ..c.clone()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.settings.update(|c| ShapingConfig {
        latency_ms: 10,
        ..c.clone()
    });
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(
        h.probe.resolved(),
        vec![DEFAULT_PROBE_HOST.to_string(), "1.1.1.1".to_string()]
    );
    let metrics = h.engine.latest_metrics();
    let rtt = metrics.probe.rtt_mean_ms.unwrap();
    assert!((rtt - 25.0).abs() < 1e-9, "{rtt}");

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_blank_target_uses_default_selector() {
    let h = start(ShapingConfig {
        target_package: "   ".into(),
        ..quiet()
    });
    assert_eq!(h.backend.opened_target().as_deref(), Some(DEFAULT_TARGET_PACKAGE));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_long_delay() {
    let mut h = start(ShapingConfig {
        shaping_enabled: true,
        latency_ms: 600_000,
        ..quiet()
    });
    h.handle
        .packets
        .send(Packet::new(vec![1; 10], Direction::Upstream))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let before = tokio::time::Instant::now();
    h.engine.shutdown().await;
    assert!(before.elapsed() < Duration::from_secs(1));
    assert!(h.handle.forwarded.try_recv().is_err());
}
