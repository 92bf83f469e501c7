//! Token Bucket rate limiter for per-direction bandwidth control.
//!
//! Each direction gets its own bucket. Capacity is [`BURST_WINDOW_SECS`] worth
//! of the configured rate; tokens (bytes) refill continuously from elapsed
//! time. A bucket is never patched in place: a bandwidth change builds a new
//! [`TokenBucket`] and the old state is discarded.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{BURST_WINDOW_SECS, UNLIMITED_KBPS};

/// Mutable bucket fields. Only touched under the owning limiter's lock.
#[derive(Debug)]
struct BucketState {
    available_tokens: f64,
    last_refill: Instant,
}

/// Admission controller answering "how long must I wait before sending N bytes".
#[derive(Debug)]
pub struct TokenBucket {
    kbps: u32,
    capacity_bytes: f64,
    refill_bytes_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Build a full bucket for `kbps`. [`UNLIMITED_KBPS`] (or 0) disables limiting.
    pub fn new(kbps: u32) -> Self {
        let (capacity_bytes, refill_bytes_per_sec) = if is_unlimited(kbps) {
            (f64::INFINITY, f64::INFINITY)
        } else {
            let rate = f64::from(kbps) / 8.0;
            (rate * BURST_WINDOW_SECS, rate)
        };
        Self {
            kbps,
            capacity_bytes,
            refill_bytes_per_sec,
            state: Mutex::new(BucketState {
                available_tokens: capacity_bytes,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn kbps(&self) -> u32 {
        self.kbps
    }

    pub fn is_unlimited(&self) -> bool {
        is_unlimited(self.kbps)
    }

    /// Bucket size in bytes (`kbps / 8 * 1.5`). Infinite when unlimited.
    pub fn capacity_bytes(&self) -> f64 {
        self.capacity_bytes
    }

    /// Tokens currently in the bucket, without refilling.
    pub fn available_tokens(&self) -> f64 {
        self.state.lock().available_tokens
    }

    /// Charge `bytes` against the bucket and return how long the caller must
    /// wait before sending. Zero means "send now".
    ///
    /// When the bucket cannot cover the request, the deficit is converted to a
    /// wait at the refill rate and the bucket is emptied.
    pub fn admit(&self, bytes: usize) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.available_tokens = (state.available_tokens + elapsed * self.refill_bytes_per_sec)
            .min(self.capacity_bytes);

        let bytes = bytes as f64;
        if state.available_tokens >= bytes {
            state.available_tokens -= bytes;
            return Duration::ZERO;
        }

        let deficit = bytes - state.available_tokens;
        state.available_tokens = 0.0;
        Duration::from_secs_f64((deficit / self.refill_bytes_per_sec).max(0.0))
    }
}

fn is_unlimited(kbps: u32) -> bool {
    kbps == UNLIMITED_KBPS || kbps == 0
}
