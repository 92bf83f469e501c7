//! Per-direction traffic accounting using atomics for lock-free concurrent access.
//!
//! The packet path increments byte and packet counters; the metrics aggregator
//! swaps them back to zero once per interval. Each counter is moved with a
//! single atomic swap, so an increment racing with a reset lands either in the
//! interval being read or in the next one, never in both and never lost.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::capture::Direction;

/// Counter values drained by one [`PacketCounters::take`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficTotals {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub packets_up: u64,
    pub packets_down: u64,
}

impl TrafficTotals {
    pub fn packets(&self) -> u64 {
        self.packets_up + self.packets_down
    }
}

/// Thread-safe byte and packet counters for both directions.
#[derive(Debug, Default)]
pub struct PacketCounters {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    packets_up: AtomicU64,
    packets_down: AtomicU64,
}

impl PacketCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one packet of `length` bytes. Called from the packet path.
    pub fn record_packet(&self, direction: Direction, length: usize) {
        let (bytes, packets) = match direction {
            Direction::Upstream => (&self.bytes_up, &self.packets_up),
            Direction::Downstream => (&self.bytes_down, &self.packets_down),
        };
        bytes.fetch_add(length as u64, Ordering::Relaxed);
        packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter and reset it to zero.
    pub fn take(&self) -> TrafficTotals {
        TrafficTotals {
            bytes_up: self.bytes_up.swap(0, Ordering::AcqRel),
            bytes_down: self.bytes_down.swap(0, Ordering::AcqRel),
            packets_up: self.packets_up.swap(0, Ordering::AcqRel),
            packets_down: self.packets_down.swap(0, Ordering::AcqRel),
        }
    }

    /// Current values, without resetting.
    pub fn peek(&self) -> TrafficTotals {
        TrafficTotals {
            bytes_up: self.bytes_up.load(Ordering::Acquire),
            bytes_down: self.bytes_down.load(Ordering::Acquire),
            packets_up: self.packets_up.load(Ordering::Acquire),
            packets_down: self.packets_down.load(Ordering::Acquire),
        }
    }
}
