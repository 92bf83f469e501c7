//! Core logic: traffic accounting, rate limiting, impairment, probing.
//!
//! - [`PacketCounters`]: per-direction byte/packet counters with atomic read-and-reset
//! - [`TokenBucket`]: per-direction bandwidth limiter
//! - [`Shaper`]: loss, latency/jitter and rate-limit pipeline for one packet
//! - [`prober`]: TCP reachability probing with windowed RTT statistics

pub mod prober;
pub mod rate_limiter;
pub mod shaper;
pub mod traffic;

pub use prober::{ProbeSupervisor, Prober, ProberOptions, ReachabilityProbe, TcpConnectProbe};
pub use rate_limiter::TokenBucket;
pub use shaper::{Shaper, Verdict};
pub use traffic::{PacketCounters, TrafficTotals};
