//! Federation peer: an outbound link splicing this exchange under a
//! parent.
//!
//! The link is an ordinary client WebSocket. Locally it appears as a
//! synthetic connection whose transport forwards outbound frames to the
//! peer socket, with `REGISTERED_PBX` and `ERROR` suppressed to prevent
//! feedback loops. A synthetic inbound `REGISTER_PBX` installs the
//! parent's routes so unknown dials forward upward, and an outbound
//! `REGISTER_PBX` announces our own routes to the parent. The link
//! reconnects with a fixed delay until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_core::{DisconnectReason, Exchange};
use switchboard_protocol::Frame;
use switchboard_transport::{close_codes, FrameSink, TransportError, WsLink};

use crate::config::FederationConfig;

/// Wraps the peer-socket sink, dropping the frame types that would loop
/// straight back into the parent's dispatcher.
pub struct SuppressingSink {
    inner: Arc<dyn FrameSink>,
}

impl SuppressingSink {
    #[must_use]
    pub fn new(inner: Arc<dyn FrameSink>) -> Self {
        Self { inner }
    }
}

impl FrameSink for SuppressingSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        match frame {
            Frame::RegisteredPbx { .. } | Frame::Error { .. } => {
                debug!(frame = frame.type_name(), "suppressed outbound peer frame");
                Ok(())
            }
            frame => self.inner.send(frame),
        }
    }

    fn close(&self, code: u16, reason: &str) {
        self.inner.close(code, reason);
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

/// The host part of a peer URL, used as the synthetic downstream domain.
fn peer_domain(url: &str) -> String {
    let stripped = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host_port = stripped.split(['/', '?']).next().unwrap_or(stripped);
    host_port
        .rsplit_once(':')
        .map_or(host_port, |(host, _)| host)
        .to_string()
}

/// Spawn the federation link task. The returned sender stops it: send
/// `true` to cancel reconnects and close the link cleanly.
pub fn spawn(exchange: Arc<Exchange>, config: FederationConfig) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run(exchange, config, shutdown_rx));
    (handle, shutdown_tx)
}

async fn run(exchange: Arc<Exchange>, config: FederationConfig, mut shutdown: watch::Receiver<bool>) {
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);
    let peer_id = peer_domain(&config.peer_url);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match WsLink::connect(&config.peer_url).await {
            Ok(link) => {
                info!(url = %config.peer_url, "federation link established");
                run_link(&exchange, &config, &peer_id, link, &mut shutdown).await;
                info!(url = %config.peer_url, "federation link closed");
            }
            Err(e) => {
                warn!(url = %config.peer_url, error = %e, "federation connect failed");
            }
        }

        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn run_link(
    exchange: &Arc<Exchange>,
    config: &FederationConfig,
    peer_id: &str,
    mut link: WsLink,
    shutdown: &mut watch::Receiver<bool>,
) {
    let raw = link.sink();
    let session = exchange.attach(Arc::new(SuppressingSink::new(raw.clone())));

    // The local side treats the peer as a downstream announcing the
    // routes it serves.
    exchange.handle_frame(
        session,
        Frame::RegisterPbx {
            domain: peer_id.to_string(),
            routes: config.parent_routes.clone(),
            endpoint: Some(config.peer_url.clone()),
            auth: None,
        },
    );

    // Announce ourselves to the parent.
    if let Err(e) = raw.send(Frame::RegisterPbx {
        domain: config.local_domain.clone(),
        routes: config.announce_routes.clone(),
        endpoint: Some("internal".to_string()),
        auth: config.auth_token.clone(),
    }) {
        warn!(error = %e, "failed to announce to parent");
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(config.heartbeat_interval_ms.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = link.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    // Parent-side acknowledgments never re-enter dispatch.
                    Frame::RegisteredPbx { .. }
                    | Frame::RegisterPbxFailed { .. }
                    | Frame::RegisterFailed { .. }
                    | Frame::HeartbeatAck { .. } => {
                        debug!(frame = frame.type_name(), "ignored peer acknowledgment");
                    }
                    frame => exchange.handle_frame(session, frame),
                }
            }
            _ = heartbeat.tick() => {
                let _ = raw.send(Frame::Heartbeat);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    raw.close(close_codes::SHUTDOWN, "shutdown");
                    break;
                }
            }
        }
    }

    exchange.disconnect(session, DisconnectReason::PeerDisconnected);
}
