//! Connection handlers for the exchange server.
//!
//! One task pair per WebSocket: the read loop decodes JSON text frames
//! and pushes them into the exchange, a writer task drains the
//! connection's sink queue back onto the socket. The exchange itself
//! never suspends; everything async lives here.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_core::{DisconnectReason, Exchange};
use switchboard_protocol::{codec, Frame, ProtocolError};
use switchboard_transport::{FrameSink, TransportError};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};

/// WebSocket close code for protocol violations (malformed JSON).
const PROTOCOL_ERROR_CLOSE: u16 = 1002;

/// Shared server state.
pub struct AppState {
    pub exchange: Arc<Exchange>,
    pub config: Config,
}

/// Run the HTTP/WebSocket server until `ctrl-c`.
///
/// # Errors
///
/// Returns an error if the server fails to bind or serve.
pub async fn run_server(config: Config, exchange: Arc<Exchange>) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState { exchange, config });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("switchboard listening on {addr}");
    info!("WebSocket endpoint: ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.exchange.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "registered": stats.registered,
        "calls": stats.active_calls,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum SinkCmd {
    Frame(Frame),
    Close(u16, String),
}

/// Outbound seam for one WebSocket session: queues frames for the writer
/// task so the exchange never blocks on the socket.
struct SocketSink {
    tx: mpsc::UnboundedSender<SinkCmd>,
    open: AtomicBool,
}

impl FrameSink for SocketSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(SinkCmd::Frame(frame))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(SinkCmd::Close(code, reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Bridge one WebSocket to the exchange.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SinkCmd>();

    let sink = Arc::new(SocketSink {
        tx: cmd_tx,
        open: AtomicBool::new(true),
    });
    let sink_dyn: Arc<dyn FrameSink> = Arc::clone(&sink) as Arc<dyn FrameSink>;
    let session = state.exchange.attach(sink_dyn);
    debug!(session = %session, "WebSocket attached");

    let writer = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SinkCmd::Frame(frame) => {
                    let text = match codec::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "dropping unencodable frame");
                            continue;
                        }
                    };
                    metrics::record_frame("outbound", frame.type_name());
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SinkCmd::Close(code, reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if !handle_text(&state, session, &sink, &text) {
                    break;
                }
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let text = text.to_owned();
                    if !handle_text(&state, session, &sink, &text) {
                        break;
                    }
                }
                Err(_) => {
                    metrics::record_error("malformed_frame");
                    sink.close(PROTOCOL_ERROR_CLOSE, "frame is not UTF-8");
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(session = %session, "received close frame");
                break;
            }
            Ok(_) => {} // ping/pong handled by axum
            Err(e) => {
                debug!(session = %session, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // Idempotent: a no-op when the exchange already tore the session down.
    state
        .exchange
        .disconnect(session, DisconnectReason::PeerDisconnected);
    writer.abort();
    debug!(session = %session, "WebSocket detached");
}

/// Decode one text frame and route it. Returns `false` when the
/// connection must close (malformed JSON per the transport contract).
fn handle_text(state: &Arc<AppState>, session: switchboard_core::SessionId, sink: &Arc<SocketSink>, text: &str) -> bool {
    match codec::decode(text) {
        Ok(frame) => {
            metrics::record_frame("inbound", frame.type_name());
            state.exchange.handle_frame(session, frame);
            true
        }
        Err(ProtocolError::Malformed(e)) => {
            metrics::record_error("malformed_frame");
            debug!(session = %session, error = %e, "malformed JSON, closing");
            sink.close(PROTOCOL_ERROR_CLOSE, "malformed JSON");
            false
        }
        Err(ProtocolError::FrameTooLarge(size)) => {
            metrics::record_error("frame_too_large");
            debug!(session = %session, size, "oversized frame, closing");
            sink.close(PROTOCOL_ERROR_CLOSE, "frame too large");
            false
        }
        Err(ProtocolError::MissingType) => {
            let _ = sink.send(Frame::invalid_payload(
                "UNKNOWN",
                "frame has no string `type` field",
            ));
            true
        }
        Err(ProtocolError::UnknownType(t)) => {
            metrics::record_error("unknown_type");
            let _ = sink.send(Frame::invalid_payload(
                "UNKNOWN",
                format!("unknown frame type `{t}`"),
            ));
            true
        }
        Err(ProtocolError::InvalidPayload { context, detail }) => {
            metrics::record_error("invalid_payload");
            let _ = sink.send(Frame::invalid_payload(context, detail));
            true
        }
        Err(ProtocolError::Encode(_)) => true,
    }
}
