//! Outbound WebSocket link.
//!
//! Used by the federation peer to dial a parent exchange. The link owns a
//! reader and a writer task around a tokio-tungstenite stream; the writer
//! drains an unbounded queue so the [`FrameSink`] half never blocks, and
//! the reader decodes JSON text frames into an inbound channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use switchboard_protocol::{codec, Frame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
};
use tracing::{debug, warn};

use crate::traits::{FrameSink, TransportError};

enum Outbound {
    Frame(Frame),
    Close(u16, String),
}

/// A connected outbound link: a sink half for the exchange and an inbound
/// frame stream for the splice loop.
pub struct WsLink {
    sink: Arc<WsSink>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

impl WsLink {
    /// Dial `url` and complete the WebSocket handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        debug!(url = %url, "WebSocket link established");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    Outbound::Frame(frame) => {
                        let text = match codec::encode(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "dropping unencodable outbound frame");
                                continue;
                            }
                        };
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close(code, reason) => {
                        let _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match codec::decode(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "ignoring undecodable peer frame"),
                    },
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data)
                        .map_err(|_| ())
                        .and_then(|text| codec::decode(text).map_err(|_| ()))
                    {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(()) => debug!("ignoring undecodable binary peer frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            // in_tx drops here; the splice loop sees the stream end.
        });

        Ok(Self {
            sink: Arc::new(WsSink { tx: out_tx, open }),
            incoming: in_rx,
        })
    }

    /// The sink half, cloneable into the exchange.
    #[must_use]
    pub fn sink(&self) -> Arc<WsSink> {
        Arc::clone(&self.sink)
    }

    /// Next inbound frame, or `None` once the socket has closed.
    pub async fn next(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }
}

/// Outbound half of a [`WsLink`].
pub struct WsSink {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl FrameSink for WsSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(code, reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
