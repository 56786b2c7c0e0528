//! Transport abstraction for the exchange.
//!
//! The exchange never touches a socket. It writes outbound frames through
//! a [`FrameSink`], a non-blocking seam: adapters queue the frame and a
//! writer task owned by the transport drains the queue, so frame handlers
//! never suspend. Inbound frames are pushed into the exchange by the
//! transport's read loop.

use std::fmt;

use switchboard_protocol::{Frame, ProtocolError};
use thiserror::Error;

/// Close codes used when the exchange tears a connection down.
pub mod close_codes {
    /// Normal teardown (client requested, call-side teardown).
    pub const NORMAL: u16 = 4000;
    /// Heartbeat timeout eviction.
    pub const TIMEOUT: u16 = 4001;
    /// Agent went to sleep.
    pub const SLEEP: u16 = 4002;
    /// Exchange shutting down.
    pub const SHUTDOWN: u16 = 4003;
    /// Connection reconfigured out from under the session.
    pub const RECONFIGURED: u16 = 4004;
    /// Peer side dropped first.
    pub const PEER_DISCONNECTED: u16 = 4005;
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("connection closed")]
    Closed,

    /// Failed to queue or write an outbound frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// WebSocket or TCP handshake failure.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound seam between the exchange and one transport session.
///
/// `send` must not block: implementations queue the frame for a writer
/// task. Frames queued on one sink are delivered in queue order.
pub trait FrameSink: Send + Sync {
    /// Queue a frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the queue is gone.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the session with a status code and textual reason.
    ///
    /// Idempotent; later `send` calls fail with [`TransportError::Closed`].
    fn close(&self, code: u16, reason: &str);

    /// Whether the session can still accept frames.
    fn is_open(&self) -> bool;
}

impl fmt::Debug for dyn FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("open", &self.is_open())
            .finish()
    }
}
