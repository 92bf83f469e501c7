//! Per-packet impairment pipeline.
//!
//! For every packet, in order: bypass when shaping is off, roll for loss,
//! sleep for latency ± jitter, sleep for the direction's token-bucket wait,
//! then forward. The two sleeps run sequentially: a limiter wait is only valid
//! for the tokens measured at the instant it was computed.
//!
//! Packets are not re-serialized after their individual delays, so output can
//! be reordered relative to arrival, as on a real jittery link.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capture::{Direction, Packet, PacketSink};
use crate::core::rate_limiter::TokenBucket;
use crate::settings::ShapingConfig;

/// Outcome of shaping one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Drop,
}

#[derive(Debug)]
struct Limiters {
    upstream: Arc<TokenBucket>,
    downstream: Arc<TokenBucket>,
}

impl Limiters {
    fn from_config(config: &ShapingConfig) -> Self {
        Self {
            upstream: Arc::new(TokenBucket::new(config.bandwidth_up_kbps)),
            downstream: Arc::new(TokenBucket::new(config.bandwidth_down_kbps)),
        }
    }
}

/// Applies loss, delay and bandwidth limits to packets.
#[derive(Debug)]
pub struct Shaper {
    limiters: RwLock<Limiters>,
    rng: Mutex<StdRng>,
}

impl Shaper {
    pub fn new(config: &ShapingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic shaper for reproducible runs.
    pub fn with_seed(config: &ShapingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ShapingConfig, rng: StdRng) -> Self {
        Self {
            limiters: RwLock::new(Limiters::from_config(config)),
            rng: Mutex::new(rng),
        }
    }

    /// Rebuild both limiters if either bandwidth changed. Returns whether a
    /// rebuild happened; other config edits keep the current bucket state.
    pub fn reconfigure(&self, config: &ShapingConfig) -> bool {
        let mut limiters = self.limiters.write();
        if limiters.upstream.kbps() == config.bandwidth_up_kbps
            && limiters.downstream.kbps() == config.bandwidth_down_kbps
        {
            return false;
        }
        *limiters = Limiters::from_config(config);
        tracing::info!(
            "Rate limiters rebuilt: up={} kbps, down={} kbps",
            config.bandwidth_up_kbps,
            config.bandwidth_down_kbps
        );
        true
    }

    /// The limiter currently governing `direction`.
    pub fn limiter(&self, direction: Direction) -> Arc<TokenBucket> {
        let limiters = self.limiters.read();
        match direction {
            Direction::Upstream => Arc::clone(&limiters.upstream),
            Direction::Downstream => Arc::clone(&limiters.downstream),
        }
    }

    /// Roll a uniform value in `[0, 100)` and report whether it falls under
    /// `loss_percent`.
    pub fn roll_loss(&self, loss_percent: f32) -> bool {
        if loss_percent <= 0.0 {
            return false;
        }
        self.rng.lock().gen_range(0.0..100.0) < f64::from(loss_percent)
    }

    /// Draw this packet's artificial delay.
    pub fn draw_delay(&self, config: &ShapingConfig) -> Duration {
        let ms = compute_delay_ms(config.latency_ms, config.jitter_ms, &mut *self.rng.lock());
        Duration::from_millis(ms)
    }

    /// Decide the packet's fate, suspending for delay and rate-limit wait
    /// before returning [`Verdict::Forward`].
    pub async fn shape(&self, length: usize, direction: Direction, config: &ShapingConfig) -> Verdict {
        if !config.shaping_enabled {
            return Verdict::Forward;
        }

        if self.roll_loss(config.packet_loss_percent) {
            return Verdict::Drop;
        }

        let delay = self.draw_delay(config);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let wait = self.limiter(direction).admit(length);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        Verdict::Forward
    }

    /// Shape `packet` and hand it to `sink` unless it was dropped.
    pub async fn process(
        &self,
        packet: &Packet,
        config: &ShapingConfig,
        sink: &dyn PacketSink,
    ) -> Verdict {
        let verdict = self.shape(packet.len(), packet.direction, config).await;
        if verdict == Verdict::Forward {
            if let Err(e) = sink.forward(&packet.data).await {
                tracing::warn!("Failed to forward {} byte packet: {e}", packet.len());
            }
        } else {
            tracing::trace!("Dropped {} byte {:?} packet", packet.len(), packet.direction);
        }
        verdict
    }
}

/// `max(0, latency + U)` where `U` is uniform in `[-jitter, +jitter]` (or 0 without jitter).
pub fn compute_delay_ms<R: Rng>(latency_ms: u32, jitter_ms: u32, rng: &mut R) -> u64 {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        let bound = i64::from(jitter_ms);
        rng.gen_range(-bound..=bound)
    };
    (i64::from(latency_ms) + jitter).max(0) as u64
}
