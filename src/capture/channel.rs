//! In-memory capture backend.
//!
//! Packets are injected through a [`ChannelHandle`] and shaped packets come
//! back out of it. Used to embed the engine behind an existing packet pump and
//! to drive it in tests.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CaptureBackend, CaptureSession, Packet, PacketSink, PacketSource};

/// Producer/consumer ends held by the embedding code.
#[derive(Debug)]
pub struct ChannelHandle {
    /// Inject captured packets here.
    pub packets: mpsc::Sender<Packet>,
    /// Packets forwarded by the shaper arrive here.
    pub forwarded: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Capture backend over tokio channels. Can be opened once.
#[derive(Debug)]
pub struct ChannelBackend {
    session: Mutex<Option<(mpsc::Receiver<Packet>, mpsc::UnboundedSender<Vec<u8>>)>>,
    opened_target: Mutex<Option<String>>,
}

impl ChannelBackend {
    /// Create a backend whose intake queue holds up to `capacity` packets.
    pub fn new(capacity: usize) -> (Self, ChannelHandle) {
        let (packet_tx, packet_rx) = mpsc::channel(capacity);
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let backend = Self {
            session: Mutex::new(Some((packet_rx, forward_tx))),
            opened_target: Mutex::new(None),
        };
        let handle = ChannelHandle {
            packets: packet_tx,
            forwarded: forward_rx,
        };
        (backend, handle)
    }

    /// Selector passed to the successful `open` call, if any.
    pub fn opened_target(&self) -> Option<String> {
        self.opened_target.lock().clone()
    }
}

impl CaptureBackend for ChannelBackend {
    fn open(&self, target: &str) -> anyhow::Result<CaptureSession> {
        let Some((packets, forwarded)) = self.session.lock().take() else {
            anyhow::bail!("channel capture for '{target}' was already opened");
        };
        *self.opened_target.lock() = Some(target.to_string());
        Ok(CaptureSession {
            source: Box::new(ChannelSource { rx: packets }),
            sink: Arc::new(ChannelSink { tx: forwarded }),
        })
    }
}

struct ChannelSource {
    rx: mpsc::Receiver<Packet>,
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn recv(&mut self) -> io::Result<Option<Packet>> {
        Ok(self.rx.recv().await)
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl PacketSink for ChannelSink {
    async fn forward(&self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "forward receiver dropped"))
    }
}
