//! Packet capture interfaces and the packet intake loop.
//!
//! Acquiring packets from the OS (tunnel device, routing, per-app selection) and
//! re-injecting them is done by a host-provided [`CaptureBackend`]. This module
//! defines the contract the engine consumes:
//! - [`PacketSource`]: delivers `(buffer, direction)` for every captured packet
//! - [`PacketSink`]: accepts shaped packets for delivery to the real network
//! - [`channel`]: an in-memory backend built on tokio channels
//! - [`intake`]: the loop feeding every captured packet through the shaper

pub mod channel;
pub mod intake;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Traffic direction, as classified by the capture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device → network.
    Upstream,
    /// Network → device.
    Downstream,
}

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub direction: Direction,
}

impl Packet {
    pub fn new(data: Vec<u8>, direction: Direction) -> Self {
        Self { data, direction }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stream of captured packets.
#[async_trait]
pub trait PacketSource: Send {
    /// Next packet, or `Ok(None)` once the source is closed.
    async fn recv(&mut self) -> std::io::Result<Option<Packet>>;
}

/// Destination for packets that survived shaping.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn forward(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// An opened capture: where packets come from and where they go.
pub struct CaptureSession {
    pub source: Box<dyn PacketSource>,
    pub sink: Arc<dyn PacketSink>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession").finish_non_exhaustive()
    }
}

/// Host-provided packet capture.
///
/// `open` must either return a fully working session or fail without leaving
/// anything running; the engine starts no task until it succeeds.
pub trait CaptureBackend: Send + Sync {
    /// Start capturing traffic selected by `target` (an opaque selector such
    /// as an application package name).
    fn open(&self, target: &str) -> anyhow::Result<CaptureSession>;
}
