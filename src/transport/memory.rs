use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use super::{error, Transport, TransportError};
use crate::event::Envelope;

/// How the next writes of a [`MemoryTransport`] fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// writes succeed
    None,
    /// writes report the client went away
    Disconnect,
    /// writes report a transport fault
    Fault,
}

#[derive(Debug, Default)]
struct Controls {
    refuse_handshake: AtomicBool,
    write_failure: AtomicU8,
    write_delay_ms: AtomicU64,
    ping_fails: AtomicBool,
    pings: AtomicUsize,
    closed: AtomicBool,
}

/// In-process transport, frames go to the paired [`MemoryPeer`].
///
/// Useful to drive the connection manager without sockets, e.g. in request layer tests.
#[derive(Debug)]
pub struct MemoryTransport {
    frames: mpsc::UnboundedSender<String>,
    controls: Arc<Controls>,
}

/// Test side of a [`MemoryTransport`]: reads frames and scripts failures
#[derive(Debug)]
pub struct MemoryPeer {
    frames: mpsc::UnboundedReceiver<String>,
    controls: Arc<Controls>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair
    pub fn pair() -> (Self, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controls = Arc::new(Controls::default());

        (
            Self {
                frames: tx,
                controls: controls.clone(),
            },
            MemoryPeer {
                frames: rx,
                controls,
            },
        )
    }
}

impl MemoryPeer {
    /// Make the handshake fail
    pub fn refuse_handshake(&self) {
        self.controls.refuse_handshake.store(true, Ordering::SeqCst);
    }

    /// Script how following writes fail
    pub fn fail_writes(&self, failure: WriteFailure) {
        let code = match failure {
            WriteFailure::None => 0,
            WriteFailure::Disconnect => 1,
            WriteFailure::Fault => 2,
        };
        self.controls.write_failure.store(code, Ordering::SeqCst);
    }

    /// Make every following write take `delay`
    pub fn delay_writes(&self, delay: std::time::Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.controls.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Make liveness probes fail
    pub fn fail_pings(&self, fail: bool) {
        self.controls.ping_fails.store(fail, Ordering::SeqCst);
    }

    /// Number of liveness probes received
    pub fn pings(&self) -> usize {
        self.controls.pings.load(Ordering::SeqCst)
    }

    /// Whether the transport was closed
    pub fn is_closed(&self) -> bool {
        self.controls.closed.load(Ordering::SeqCst)
    }

    /// Take all frames written so far
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Take all frames written so far, decoded as envelopes
    pub fn drain_envelopes(&mut self) -> Vec<Envelope> {
        self.drain()
            .iter()
            .filter_map(|frame| Envelope::decode(frame).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn accept(&mut self) -> Result<(), TransportError> {
        if self.controls.refuse_handshake.load(Ordering::SeqCst) {
            return error::Fault {
                message: "handshake refused",
            }
            .fail();
        }
        Ok(())
    }

    async fn send_text(&mut self, frame: String) -> Result<(), TransportError> {
        if self.controls.closed.load(Ordering::SeqCst) {
            return error::InvalidState { state: "closed" }.fail();
        }

        let delay = self.controls.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        match self.controls.write_failure.load(Ordering::SeqCst) {
            1 => error::Disconnected.fail(),
            2 => error::Fault {
                message: "scripted write failure",
            }
            .fail(),
            _ => self
                .frames
                .send(frame)
                .map_err(|_| error::Disconnected.build()),
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.controls.pings.fetch_add(1, Ordering::SeqCst);
        if self.controls.ping_fails.load(Ordering::SeqCst) {
            return error::Fault {
                message: "scripted ping failure",
            }
            .fail();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.controls.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
