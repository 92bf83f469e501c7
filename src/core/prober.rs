//! Active path probing.
//!
//! A [`Prober`] measures reachability of one target host every
//! [`PROBE_INTERVAL_MS`] and publishes rolling [`ProbeMetrics`]:
//! - mean, p95 and jitter over a sliding window of the last
//!   [`PROBE_WINDOW_SIZE`] successful round-trip times
//! - loss percent, cumulative over the prober's whole lifetime
//!
//! Jitter is the mean absolute difference between adjacent values of the
//! *sorted* window, not between consecutive-in-time samples.
//!
//! [`ProbeSupervisor`] owns the running prober and replaces it (fresh window
//! and counters) whenever the configured probe host changes.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{PROBE_INTERVAL_MS, PROBE_TCP_PORT, PROBE_TIMEOUT_MS, PROBE_WINDOW_SIZE};
use crate::metrics::ProbeMetrics;
use crate::services::{ShutdownListener, ShutdownSignal};
use crate::settings::{SettingsStore, ShapingConfig};

// ---- Window statistics ----

/// Sliding RTT window plus lifetime attempt/success counters.
#[derive(Debug, Clone)]
pub struct ProbeWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    attempts: u64,
    successes: u64,
}

impl ProbeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            attempts: 0,
            successes: 0,
        }
    }

    /// Push a successful RTT, evicting the oldest sample when full.
    pub fn record_success(&mut self, rtt_ms: f64) -> ProbeMetrics {
        self.attempts += 1;
        self.successes += 1;
        self.samples.push_back(rtt_ms);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        ProbeMetrics {
            rtt_mean_ms: mean(&sorted),
            rtt_p95_ms: p95(&sorted),
            jitter_ms: sorted_jitter(&sorted),
            loss_percent: Some(self.loss_percent()),
        }
    }

    /// Count a failed attempt. Only loss is defined for a failed tick.
    pub fn record_failure(&mut self) -> ProbeMetrics {
        self.attempts += 1;
        ProbeMetrics {
            loss_percent: Some(self.loss_percent()),
            ..ProbeMetrics::default()
        }
    }

    /// `(1 - successes / attempts) * 100`, or 0 before the first attempt.
    pub fn loss_percent(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (1.0 - self.successes as f64 / self.attempts as f64) * 100.0
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in arrival order, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Sample at `max(n - 1, floor(0.95 * n))` of an ascending slice.
fn p95(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let index = (n - 1).max((n as f64 * 0.95) as usize).min(n - 1);
    Some(sorted[index])
}

/// Mean absolute difference between neighbours of an ascending slice.
fn sorted_jitter(sorted: &[f64]) -> Option<f64> {
    if sorted.len() < 2 {
        return None;
    }
    let diffs: Vec<f64> = sorted.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    mean(&diffs)
}

// ---- Reachability ----

/// One way of checking whether a host answers.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Resolve `host` to the address subsequent probes will use.
    async fn resolve(&self, host: &str) -> io::Result<SocketAddr>;

    /// Whether `addr` answered within `timeout`.
    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Measures a TCP handshake. A refused connection still proves the host is up.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectProbe {
    port: u16,
}

impl TcpConnectProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(PROBE_TCP_PORT)
    }
}

#[async_trait]
impl ReachabilityProbe for TcpConnectProbe {
    async fn resolve(&self, host: &str) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((host, self.port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
    }

    async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => e.kind() == io::ErrorKind::ConnectionRefused,
            Err(_elapsed) => false,
        }
    }
}

// ---- Probe task ----

/// Timing parameters of a prober.
#[derive(Debug, Clone, Copy)]
pub struct ProberOptions {
    pub interval: Duration,
    pub timeout: Duration,
    pub window: usize,
}

impl Default for ProberOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(PROBE_INTERVAL_MS),
            timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            window: PROBE_WINDOW_SIZE,
        }
    }
}

/// A running probe loop against one host.
#[derive(Debug)]
pub struct Prober {
    host: String,
    shutdown: ShutdownSignal,
    worker: JoinHandle<()>,
}

impl Prober {
    /// Spawn a probe loop against `host`, publishing into `metrics`.
    pub fn start(
        host: String,
        probe: Arc<dyn ReachabilityProbe>,
        options: ProberOptions,
        metrics: Arc<watch::Sender<ProbeMetrics>>,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let listener = shutdown.listener();
        let worker = tokio::spawn(run_probe_loop(host.clone(), probe, options, metrics, listener));
        tracing::info!("Prober started against {host}");
        Self {
            host,
            shutdown,
            worker,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Cancel the loop, aborting any in-flight probe, and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.trigger();
        if let Err(e) = self.worker.await {
            tracing::debug!("Prober worker for {} exited with error: {e}", self.host);
        }
        tracing::info!("Prober stopped for {}", self.host);
    }
}

async fn run_probe_loop(
    host: String,
    probe: Arc<dyn ReachabilityProbe>,
    options: ProberOptions,
    metrics: Arc<watch::Sender<ProbeMetrics>>,
    mut shutdown: ShutdownListener,
) {
    let mut window = ProbeWindow::new(options.window);
    let mut address: Option<SocketAddr> = None;
    let mut resolve_failures = 0u64;

    loop {
        let attempt = async {
            if address.is_none() {
                let resolved = tokio::time::timeout(options.timeout, probe.resolve(&host))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lookup took longer than {:?}", options.timeout),
                        ))
                    });
                match resolved {
                    Ok(addr) => {
                        tracing::debug!("Probe target {host} resolved to {addr}");
                        address = Some(addr);
                    }
                    Err(e) => {
                        resolve_failures += 1;
                        if resolve_failures == 1 {
                            tracing::warn!("Failed to resolve probe target {host}: {e}");
                        }
                    }
                }
            }
            let Some(addr) = address else {
                return None;
            };
            let started = Instant::now();
            probe
                .probe(addr, options.timeout)
                .await
                .then(|| started.elapsed().as_secs_f64() * 1_000.0)
        };

        let rtt_ms = tokio::select! {
            _ = shutdown.requested() => break,
            rtt_ms = attempt => rtt_ms,
        };

        let update = match rtt_ms {
            Some(rtt) => window.record_success(rtt),
            None => window.record_failure(),
        };
        metrics.send_replace(update);

        tokio::select! {
            _ = shutdown.requested() => break,
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

// ---- Restart on target change ----

/// Keeps exactly one [`Prober`] running against the configured host.
pub struct ProbeSupervisor {
    probe: Arc<dyn ReachabilityProbe>,
    options: ProberOptions,
    metrics: Arc<watch::Sender<ProbeMetrics>>,
    current: Option<Prober>,
}

impl std::fmt::Debug for ProbeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSupervisor")
            .field("options", &self.options)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl ProbeSupervisor {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        options: ProberOptions,
        metrics: Arc<watch::Sender<ProbeMetrics>>,
    ) -> Self {
        Self {
            probe,
            options,
            metrics,
            current: None,
        }
    }

    /// Host of the running prober, if any.
    pub fn current_host(&self) -> Option<&str> {
        self.current.as_ref().map(Prober::host)
    }

    /// Restart the prober if the effective probe host changed. Returns whether
    /// a new prober was started.
    pub async fn apply(&mut self, config: &ShapingConfig) -> bool {
        let host = config.effective_probe_host();
        if self.current_host() == Some(host) {
            return false;
        }
        if let Some(previous) = self.current.take() {
            previous.stop().await;
        }
        self.current = Some(Prober::start(
            host.to_string(),
            Arc::clone(&self.probe),
            self.options,
            Arc::clone(&self.metrics),
        ));
        true
    }

    pub async fn stop(&mut self) {
        if let Some(prober) = self.current.take() {
            prober.stop().await;
        }
    }
}

/// Drive `supervisor` from settings changes until shutdown.
pub async fn run_probe_supervisor(
    mut supervisor: ProbeSupervisor,
    settings: SettingsStore,
    mut shutdown: ShutdownListener,
) {
    let mut changes = settings.subscribe();
    let initial = Arc::clone(&changes.borrow_and_update());
    supervisor.apply(&initial).await;

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let config = Arc::clone(&changes.borrow_and_update());
                supervisor.apply(&config).await;
            }
        }
    }

    supervisor.stop().await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::DEFAULT_PROBE_HOST;

    #[track_caller]
    fn assert_close(actual: Option<f64>, expected: f64) {
        match actual {
            Some(value) => assert!((value - expected).abs() < 1e-9, "{value} != {expected}"),
            None => panic!("expected {expected}, got None"),
        }
    }

    // ---- ProbeWindow ----

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = ProbeWindow::new(PROBE_WINDOW_SIZE);
        for i in 0..100 {
            window.record_success(f64::from(i));
            assert!(window.len() <= 20);
        }
        assert_eq!(window.len(), 20);
    }

    #[test]
    fn test_after_25_probes_only_latest_20_count() {
        let mut window = ProbeWindow::new(20);
        let mut last = ProbeMetrics::default();
        for rtt in 1..=25 {
            last = window.record_success(f64::from(rtt));
        }
        let kept: Vec<f64> = window.samples().collect();
        assert_eq!(kept, (6..=25).map(f64::from).collect::<Vec<_>>());
        assert_close(last.rtt_mean_ms, 15.5);
        assert_close(last.rtt_p95_ms, 25.0);
        assert_close(last.jitter_ms, 1.0);
        assert_close(last.loss_percent, 0.0);
    }

    #[test]
    fn test_jitter_uses_sorted_window() {
        let mut window = ProbeWindow::new(20);
        window.record_success(10.0);
        window.record_success(30.0);
        let metrics = window.record_success(20.0);
        // sorted [10, 20, 30] -> |10|, |10|; time order would give 15
        assert_close(metrics.jitter_ms, 10.0);
        assert_close(metrics.rtt_mean_ms, 20.0);
    }

    #[test]
    fn test_single_sample_has_no_jitter() {
        let mut window = ProbeWindow::new(20);
        let metrics = window.record_success(42.0);
        assert_eq!(metrics.rtt_mean_ms, Some(42.0));
        assert_eq!(metrics.rtt_p95_ms, Some(42.0));
        assert_eq!(metrics.jitter_ms, None);
    }

    #[test]
    fn test_p95_index_formula() {
        assert_eq!(p95(&[]), None);
        assert_eq!(p95(&[3.0]), Some(3.0));
        assert_eq!(p95(&[1.0, 2.0, 3.0, 4.0]), Some(4.0));
        let twenty: Vec<f64> = (1..=20).map(f64::from).collect();
        assert_eq!(p95(&twenty), Some(20.0));
    }

    #[test]
    fn test_failure_reports_only_cumulative_loss() {
        let mut window = ProbeWindow::new(20);
        for _ in 0..3 {
            window.record_success(5.0);
        }
        let failed = window.record_failure();
        assert_eq!(failed.rtt_mean_ms, None);
        assert_eq!(failed.rtt_p95_ms, None);
        assert_eq!(failed.jitter_ms, None);
        assert_close(failed.loss_percent, 25.0);
        assert_eq!(window.len(), 3);

        let recovered = window.record_success(5.0);
        assert_close(recovered.rtt_mean_ms, 5.0);
        assert_close(recovered.loss_percent, 20.0);
    }

    #[test]
    fn test_loss_is_not_windowed() {
        let mut window = ProbeWindow::new(2);
        window.record_failure();
        for _ in 0..9 {
            window.record_success(1.0);
        }
        assert_close(Some(window.loss_percent()), 10.0);
    }

    // ---- Prober task ----

    struct FakeProbe {
        rtt: Duration,
        unreachable: HashSet<&'static str>,
        unresolvable: HashSet<&'static str>,
        stalled: HashSet<&'static str>,
        resolved: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(rtt_ms: u64) -> Self {
            Self {
                rtt: Duration::from_millis(rtt_ms),
                unreachable: HashSet::new(),
                unresolvable: HashSet::new(),
                stalled: HashSet::new(),
                resolved: Mutex::new(Vec::new()),
            }
        }

        fn resolved(&self) -> Vec<String> {
            self.resolved.lock().clone()
        }
    }

    fn addr_for(host: &str) -> SocketAddr {
        let last = host.len() as u8;
        SocketAddr::from(([10, 0, 0, last], 443))
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn resolve(&self, host: &str) -> io::Result<SocketAddr> {
            if self.unresolvable.contains(host) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain"));
            }
            if self.stalled.contains(host) {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            self.resolved.lock().push(host.to_string());
            Ok(addr_for(host))
        }

        async fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
            let down = self.unreachable.iter().any(|h| addr_for(h) == addr);
            if down {
                tokio::time::sleep(timeout).await;
                return false;
            }
            tokio::time::sleep(self.rtt).await;
            true
        }
    }

    fn metrics_channel() -> (Arc<watch::Sender<ProbeMetrics>>, watch::Receiver<ProbeMetrics>) {
        let (tx, rx) = watch::channel(ProbeMetrics::default());
        (Arc::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_prober_publishes_rtt_statistics() {
        let probe = Arc::new(FakeProbe::new(30));
        let (tx, rx) = metrics_channel();
        let prober = Prober::start("probe.test".into(), probe.clone(), ProberOptions::default(), tx);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let metrics = *rx.borrow();
        assert_close(metrics.rtt_mean_ms, 30.0);
        assert_close(metrics.rtt_p95_ms, 30.0);
        assert_close(metrics.jitter_ms, 0.0);
        assert_close(metrics.loss_percent, 0.0);

        prober.stop().await;
        // resolved once, reused afterwards
        assert_eq!(probe.resolved(), vec!["probe.test".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_host_reports_full_loss() {
        let mut fake = FakeProbe::new(30);
        fake.unresolvable.insert("nowhere.invalid");
        let (tx, rx) = metrics_channel();
        let prober = Prober::start("nowhere.invalid".into(), Arc::new(fake), ProberOptions::default(), tx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let metrics = *rx.borrow();
        assert_eq!(metrics.rtt_mean_ms, None);
        assert_close(metrics.loss_percent, 100.0);
        prober.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_lookup_times_out_and_counts_as_loss() {
        let mut fake = FakeProbe::new(30);
        fake.stalled.insert("hung-dns.test");
        let (tx, mut rx) = metrics_channel();
        let prober = Prober::start("hung-dns.test".into(), Arc::new(fake), ProberOptions::default(), tx);

        // 1 s lookup timeout + 500 ms pause per attempt
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(rx.has_changed().unwrap());
        assert_close(rx.borrow_and_update().loss_percent, 100.0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.has_changed().unwrap());
        let metrics = *rx.borrow();
        assert_eq!(metrics.rtt_mean_ms, None);
        assert_close(metrics.loss_percent, 100.0);
        prober.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_loss() {
        let mut fake = FakeProbe::new(30);
        fake.unreachable.insert("down.test");
        let (tx, rx) = metrics_channel();
        let prober = Prober::start("down.test".into(), Arc::new(fake), ProberOptions::default(), tx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_close(rx.borrow().loss_percent, 100.0);
        assert_eq!(rx.borrow().jitter_ms, None);
        prober.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_in_flight_probe() {
        let mut fake = FakeProbe::new(30);
        fake.unreachable.insert("slow.test");
        let (tx, _rx) = metrics_channel();
        let options = ProberOptions {
            timeout: Duration::from_secs(3_600),
            ..ProberOptions::default()
        };
        let prober = Prober::start("slow.test".into(), Arc::new(fake), options, tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        prober.stop().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // ---- Supervisor ----

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_only_on_host_change() {
        let probe = Arc::new(FakeProbe::new(10));
        let (tx, _rx) = metrics_channel();
        let mut supervisor = ProbeSupervisor::new(probe.clone(), ProberOptions::default(), tx);

        let config = ShapingConfig {
            probe_host: "a.test".into(),
            ..Default::default()
        };
        assert!(supervisor.apply(&config).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let same_host = ShapingConfig {
            latency_ms: 90,
            ..config.clone()
        };
        assert!(!supervisor.apply(&same_host).await);
        assert_eq!(supervisor.current_host(), Some("a.test"));

        let moved = ShapingConfig {
            probe_host: "bb.test".into(),
            ..config
        };
        assert!(supervisor.apply(&moved).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.current_host(), Some("bb.test"));

        supervisor.stop().await;
        assert_eq!(supervisor.current_host(), None);
        assert_eq!(probe.resolved(), vec!["a.test".to_string(), "bb.test".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_host_probes_default_target() {
        let probe = Arc::new(FakeProbe::new(10));
        let (tx, _rx) = metrics_channel();
        let mut supervisor = ProbeSupervisor::new(probe, ProberOptions::default(), tx);
        let config = ShapingConfig {
            probe_host: String::new(),
            ..Default::default()
        };
        supervisor.apply(&config).await;
        assert_eq!(supervisor.current_host(), Some(DEFAULT_PROBE_HOST));
        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_follows_settings_until_shutdown() {
        let probe = Arc::new(FakeProbe::new(10));
        let (tx, _rx) = metrics_channel();
        let supervisor = ProbeSupervisor::new(probe.clone(), ProberOptions::default(), tx);
        let settings = SettingsStore::default();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(run_probe_supervisor(
            supervisor,
            settings.clone(),
            shutdown.listener(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        settings.update(|c| ShapingConfig {
            probe_host: "1.1.1.1".into(),
            ..c.clone()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        settings.update(|c| ShapingConfig {
            notes: "unrelated edit".into(),
            ..c.clone()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        task.await.unwrap();
        assert_eq!(
            probe.resolved(),
            vec![DEFAULT_PROBE_HOST.to_string(), "1.1.1.1".to_string()]
        );
    }
}
