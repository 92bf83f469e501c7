//! Engine lifecycle management.
//!
//! [`Engine`] owns every background task spawned for one impairment session,
//! starting them in dependency order and providing clean shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::intake::run_intake_loop;
use crate::capture::CaptureBackend;
use crate::config::{
    DEFAULT_TARGET_PACKAGE, PROBE_INTERVAL_MS, PROBE_TIMEOUT_MS, PROBE_WINDOW_SIZE, STATS_INTERVAL_SECS,
};
use crate::core::prober::{run_probe_supervisor, ProbeSupervisor, ProberOptions, ReachabilityProbe, TcpConnectProbe};
use crate::core::shaper::Shaper;
use crate::core::traffic::PacketCounters;
use crate::error::ShaperError;
use crate::metrics::{LinkQuality, MetricsAggregator, MetricsSnapshot, NoLinkQuality, ProbeMetrics, RotationPolicy};
use crate::settings::SettingsStore;

// ---- Cancellation ----

/// Owner side of a cancellation flag shared by a group of tasks.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Ask every listener to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Task side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown is triggered or the signal is dropped.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

// ---- Engine ----

/// Host-supplied collaborators and timings.
#[derive(Clone)]
pub struct EngineOptions {
    /// Directory that receives CSV session logs.
    pub log_dir: PathBuf,
    pub stats_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub link_quality: Arc<dyn LinkQuality>,
    pub rotation: RotationPolicy,
    /// Seed for loss and jitter draws; entropy when `None`.
    pub seed: Option<u64>,
}

impl EngineOptions {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            stats_interval: Duration::from_secs(STATS_INTERVAL_SECS),
            probe_interval: Duration::from_millis(PROBE_INTERVAL_MS),
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            probe: Arc::new(TcpConnectProbe::default()),
            link_quality: Arc::new(NoLinkQuality),
            rotation: RotationPolicy::default(),
            seed: None,
        }
    }

    fn prober_options(&self) -> ProberOptions {
        ProberOptions {
            interval: self.probe_interval,
            timeout: self.probe_timeout,
            window: PROBE_WINDOW_SIZE,
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("log_dir", &self.log_dir)
            .field("stats_interval", &self.stats_interval)
            .field("probe_interval", &self.probe_interval)
            .field("probe_timeout", &self.probe_timeout)
            .field("rotation", &self.rotation)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// A running impairment session.
///
/// Tasks are started in dependency order:
/// 1. Metrics config observer (opens the log if logging is already on)
/// 2. Metrics ticker (1 s snapshots)
/// 3. Probe supervisor (starts the prober, restarts it on host change)
/// 4. Shaper config observer (rebuilds limiters on bandwidth change)
/// 5. Packet intake loop
#[derive(Debug)]
pub struct Engine {
    settings: SettingsStore,
    shaper: Arc<Shaper>,
    counters: Arc<PacketCounters>,
    aggregator: Arc<MetricsAggregator>,
    shutdown: ShutdownSignal,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Engine {
    /// Open the capture for the configured target and start every task.
    ///
    /// The capture is opened before anything is spawned; if the backend
    /// refuses, the error is returned and nothing is left running.
    pub fn start(
        settings: SettingsStore,
        backend: &dyn CaptureBackend,
        options: EngineOptions,
    ) -> Result<Self, ShaperError> {
        let initial = settings.read();
        let target = initial.effective_target_package();
        let session = backend.open(target).map_err(|e| {
            tracing::error!("Capture for '{target}' failed to start: {e:#}");
            ShaperError::from(e)
        })?;
        tracing::info!("Capture opened for '{target}'");
        if initial.target_package.trim().is_empty() {
            tracing::debug!("Blank target selector, using {DEFAULT_TARGET_PACKAGE}");
        }

        let shaper = Arc::new(match options.seed {
            Some(seed) => Shaper::with_seed(&initial, seed),
            None => Shaper::new(&initial),
        });
        let counters = Arc::new(PacketCounters::new());
        let (probe_tx, probe_rx) = watch::channel(ProbeMetrics::default());
        let aggregator = Arc::new(
            MetricsAggregator::new(
                Arc::clone(&counters),
                settings.clone(),
                probe_rx,
                Arc::clone(&options.link_quality),
                options.log_dir.clone(),
                options.stats_interval,
            )
            .with_rotation(options.rotation),
        );
        let supervisor = ProbeSupervisor::new(
            Arc::clone(&options.probe),
            options.prober_options(),
            Arc::new(probe_tx),
        );

        let shutdown = ShutdownSignal::new();
        let mut tasks = Vec::with_capacity(5);

        // 1. Logging observer, before the first tick so an enabled log catches it.
        tasks.push((
            "metrics-logging",
            tokio::spawn(Arc::clone(&aggregator).run_config_observer(shutdown.listener())),
        ));

        // 2. Snapshot ticker.
        tasks.push((
            "metrics-ticker",
            tokio::spawn(Arc::clone(&aggregator).run_ticker(shutdown.listener())),
        ));

        // 3. Prober, via its restart supervisor.
        tasks.push((
            "probe-supervisor",
            tokio::spawn(run_probe_supervisor(supervisor, settings.clone(), shutdown.listener())),
        ));

        // 4. Limiter rebuilds.
        tasks.push((
            "shaper-config",
            tokio::spawn(run_shaper_config_observer(
                Arc::clone(&shaper),
                settings.clone(),
                shutdown.listener(),
            )),
        ));

        // 5. Packet path.
        tasks.push((
            "packet-intake",
            tokio::spawn(run_intake_loop(
                session.source,
                session.sink,
                Arc::clone(&shaper),
                settings.clone(),
                Arc::clone(&counters),
                shutdown.listener(),
            )),
        ));

        tracing::info!("Impairment engine started");
        Ok(Self {
            settings,
            shaper,
            counters,
            aggregator,
            shutdown,
            tasks,
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn shaper(&self) -> &Arc<Shaper> {
        &self.shaper
    }

    pub fn counters(&self) -> &Arc<PacketCounters> {
        &self.counters
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    pub fn latest_metrics(&self) -> MetricsSnapshot {
        self.aggregator.latest()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.aggregator.subscribe()
    }

    /// Cancel every task, wait for each to finish, then release the log.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!("Task {name} exited abnormally: {e}");
            }
        }
        self.aggregator.close_log().await;
        tracing::info!("Impairment engine stopped");
    }
}

/// Rebuild the shaper's limiters whenever bandwidth settings change.
pub async fn run_shaper_config_observer(
    shaper: Arc<Shaper>,
    settings: SettingsStore,
    mut shutdown: ShutdownListener,
) {
    let mut changes = settings.subscribe();
    let initial = Arc::clone(&changes.borrow_and_update());
    shaper.reconfigure(&initial);

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let config = Arc::clone(&changes.borrow_and_update());
                shaper.reconfigure(&config);
            }
        }
    }
}
