//! In-memory transport backed by an unbounded channel.
//!
//! Used by exchange tests to observe exactly which frames a connection was
//! sent and how it was closed, without a socket in the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_protocol::Frame;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, TransportError};

/// Create a connected sink/receiver pair.
#[must_use]
pub fn pair() -> (Arc<ChannelSink>, ChannelReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Mutex::new(None));
    let open = Arc::new(AtomicBool::new(true));
    (
        Arc::new(ChannelSink {
            tx,
            open: Arc::clone(&open),
            closed: Arc::clone(&closed),
        }),
        ChannelReceiver { rx, open, closed },
    )
}

/// The sink half handed to the exchange.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            *self.closed.lock() = Some((code, reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// The observer half kept by the test.
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    open: Arc<AtomicBool>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl ChannelReceiver {
    /// Pop the next delivered frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next delivered frame.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Drain everything delivered so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Whether the sink half is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The close code and reason, once closed.
    #[must_use]
    pub fn close_info(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }
}
