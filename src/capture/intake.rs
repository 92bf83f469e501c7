//! Packet intake loop: capture → counters → shaper → sink.

use std::sync::Arc;
use std::time::Duration;

use super::{PacketSink, PacketSource};
use crate::config::CAPTURE_RETRY_DELAY_MS;
use crate::core::shaper::{Shaper, Verdict};
use crate::core::traffic::PacketCounters;
use crate::services::ShutdownListener;
use crate::settings::SettingsStore;

/// Pull packets from `source` until it closes or shutdown is requested.
///
/// Every packet is counted before shaping, so dropped packets still appear in
/// throughput figures. Receive errors are logged and retried after a short
/// pause. Shutdown also abandons a packet that is mid-delay.
pub async fn run_intake_loop(
    mut source: Box<dyn PacketSource>,
    sink: Arc<dyn PacketSink>,
    shaper: Arc<Shaper>,
    settings: SettingsStore,
    counters: Arc<PacketCounters>,
    mut shutdown: ShutdownListener,
) {
    tracing::info!("Packet intake loop started");
    let mut forwarded = 0u64;
    let mut dropped = 0u64;

    loop {
        let received = tokio::select! {
            _ = shutdown.requested() => break,
            received = source.recv() => received,
        };

        let packet = match received {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                tracing::info!("Packet source closed");
                break;
            }
            Err(e) => {
                tracing::warn!("Packet receive failed: {e}");
                tokio::select! {
                    _ = shutdown.requested() => break,
                    _ = tokio::time::sleep(Duration::from_millis(CAPTURE_RETRY_DELAY_MS)) => continue,
                }
            }
        };

        counters.record_packet(packet.direction, packet.len());
        let config = settings.read();

        let verdict = tokio::select! {
            _ = shutdown.requested() => break,
            verdict = shaper.process(&packet, &config, sink.as_ref()) => verdict,
        };
        match verdict {
            Verdict::Forward => forwarded += 1,
            Verdict::Drop => dropped += 1,
        }
    }

    tracing::info!("Packet intake loop stopped: {forwarded} forwarded, {dropped} dropped");
}
