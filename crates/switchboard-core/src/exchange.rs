//! The exchange: frame dispatch, the call state machine, wake-on-ring,
//! auto-sleep, liveness sweeping, and federation routing.
//!
//! All shared state lives behind one mutex that is held for the entirety
//! of each frame or timer handler, so no two handlers ever observe an
//! intermediate state. Handlers never suspend: outbound frames go through
//! non-blocking sinks, and the only async collaborator (the wake
//! executor) is fired onto the runtime with its failure posted back as an
//! internal event. Timers are spawned tasks that re-enter through the
//! same lock and validate an epoch or the record's continued existence
//! before acting.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_protocol::{
    validate_address, AutoSleepSpec, BusyReason, ErrorReason, Frame, PresenceQuerySpec,
    RegisterFailReason, WakeHandlerSpec,
};
use switchboard_transport::FrameSink;

use crate::broadcast::{BroadcastSession, BroadcastTable};
use crate::calls::{Call, CallId, CallState, CallTable};
use crate::connection::{
    AutoSleep, Concurrency, Connection, DisconnectReason, PeerInfo, SessionId, Status,
};
use crate::presence::{run_query, PresenceQuery};
use crate::ratelimit::DialRateLimiter;
use crate::registry::ConnectionRegistry;
use crate::routes::RouteTable;
use crate::wake::{PendingWakeCall, WakeExecutor, WakeHandler, WakeProfile, WakeStore};

/// Exchange configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// How long a call may ring before timing out.
    pub ringing_timeout: Duration,
    /// Recommended client heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Connections silent longer than this are evicted by the sweeper.
    pub heartbeat_timeout: Duration,
    /// Dial attempts allowed per window; 0 disables limiting.
    pub dial_max_attempts: u32,
    /// Dial rate window.
    pub dial_window: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ringing_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            dial_max_attempts: 100,
            dial_window: Duration::from_secs(60),
        }
    }
}

/// Counters for the metrics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStats {
    pub connections: usize,
    pub registered: usize,
    pub active_calls: usize,
    pub broadcast_sessions: usize,
    pub pending_wake_calls: usize,
    pub wake_profiles: usize,
}

struct State {
    registry: ConnectionRegistry,
    calls: CallTable,
    broadcasts: BroadcastTable,
    wake: WakeStore,
    routes: RouteTable,
}

impl State {
    fn send_to(&self, session: SessionId, frame: Frame) {
        if let Some(conn) = self.registry.by_session(session) {
            conn.send(frame);
        }
    }
}

struct RegisterFields {
    address: String,
    metadata: Option<serde_json::Value>,
    concurrency: Option<String>,
    max_listeners: Option<i64>,
    max_sessions: Option<i64>,
    pool_size: Option<i64>,
    mode: Option<String>,
    wake_handler: Option<WakeHandlerSpec>,
}

/// The message-routing exchange.
pub struct Exchange {
    state: Mutex<State>,
    config: ExchangeConfig,
    wake_exec: Arc<dyn WakeExecutor>,
    /// Handle to ourselves for the timer tasks we spawn.
    self_ref: Weak<Exchange>,
}

impl Exchange {
    /// Create an exchange with the given configuration and wake executor.
    #[must_use]
    pub fn new(config: ExchangeConfig, wake_exec: Arc<dyn WakeExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(State {
                registry: ConnectionRegistry::new(),
                calls: CallTable::new(),
                broadcasts: BroadcastTable::new(),
                wake: WakeStore::new(),
                routes: RouteTable::new(),
            }),
            config,
            wake_exec,
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Snapshot of table sizes.
    #[must_use]
    pub fn stats(&self) -> ExchangeStats {
        let st = self.state.lock();
        ExchangeStats {
            connections: st.registry.len(),
            registered: st.registry.registered_count(),
            active_calls: st.calls.len(),
            broadcast_sessions: st.broadcasts.len(),
            pending_wake_calls: st.wake.total_pending(),
            wake_profiles: st.wake.profile_count(),
        }
    }

    /// Track a new transport session.
    pub fn attach(&self, sink: Arc<dyn FrameSink>) -> SessionId {
        let session = Uuid::new_v4();
        let limiter = DialRateLimiter::new(self.config.dial_max_attempts, self.config.dial_window);
        let mut st = self.state.lock();
        st.registry.insert(Connection::new(session, sink, limiter));
        debug!(session = %session, "connection attached");
        session
    }

    /// Dispatch one inbound frame for `session`.
    pub fn handle_frame(&self, session: SessionId, frame: Frame) {
        match frame {
            Frame::Register {
                address,
                metadata,
                concurrency,
                max_listeners,
                max_sessions,
                pool_size,
                mode,
                wake_handler,
                auth: _,
            } => self.on_register(
                session,
                RegisterFields {
                    address,
                    metadata,
                    concurrency,
                    max_listeners,
                    max_sessions,
                    pool_size,
                    mode,
                    wake_handler,
                },
            ),
            Frame::Unregister => self.on_unregister(session),
            Frame::Status { status, auto_sleep } => self.on_status(session, &status, auto_sleep),
            Frame::Heartbeat => self.on_heartbeat(session),
            Frame::Dial { to, metadata } => self.on_dial(session, to, metadata),
            Frame::Answer { call_id } => self.on_answer(session, &call_id),
            Frame::Hangup {
                call_id, reason, ..
            } => self.on_hangup(session, &call_id, reason),
            Frame::Msg {
                call_id,
                data,
                content_type,
                ..
            } => self.on_msg(session, &call_id, data, content_type),
            Frame::Presence { query } => self.on_presence(session, query),
            Frame::SleepAck => self.on_sleep_ack(session),
            Frame::RegisterPbx {
                domain,
                routes,
                endpoint,
                auth: _,
            } => self.on_register_pbx(session, domain, routes, endpoint),
            other => {
                let st = self.state.lock();
                st.send_to(
                    session,
                    Frame::invalid_payload(
                        other.type_name(),
                        "frame type is not accepted by the exchange",
                    ),
                );
            }
        }
    }

    // =====================================================================
    // Address lifecycle
    // =====================================================================

    fn on_register(&self, session: SessionId, fields: RegisterFields) {
        let mut st = self.state.lock();
        if st.registry.by_session(session).is_none() {
            return;
        }

        if let Err(detail) = validate_address(&fields.address) {
            debug!(session = %session, address = %fields.address, detail, "invalid address");
            st.send_to(
                session,
                Frame::RegisterFailed {
                    reason: RegisterFailReason::InvalidAddress,
                },
            );
            return;
        }

        let concurrency = match parse_concurrency(
            fields.concurrency.as_deref(),
            fields.max_listeners,
            fields.max_sessions.or(fields.pool_size),
        ) {
            Ok(c) => c,
            Err(detail) => {
                st.send_to(session, Frame::invalid_payload("REGISTER", detail));
                return;
            }
        };

        let wants_wake = match fields.mode.as_deref() {
            None | Some("none") => false,
            Some("wake_on_ring") => true,
            Some(other) => {
                st.send_to(
                    session,
                    Frame::invalid_payload("REGISTER", format!("unknown mode `{other}`")),
                );
                return;
            }
        };

        let supplied_handler = match fields.wake_handler {
            Some(spec) => match validate_wake_handler(&spec) {
                Ok(handler) => Some(handler),
                Err(detail) => {
                    st.send_to(session, Frame::invalid_payload("REGISTER", detail));
                    return;
                }
            },
            None => None,
        };

        // A stored profile is always cleared when its address is re-bound;
        // it is reinstated onto the connection when the frame supplies no
        // handler of its own.
        let stored = st.wake.take_profile(&fields.address);
        let wake_handler = match (supplied_handler, stored) {
            (Some(handler), _) => Some(handler),
            (None, Some(profile)) => Some(profile.handler),
            (None, None) if wants_wake => {
                st.send_to(
                    session,
                    Frame::invalid_payload(
                        "REGISTER",
                        "mode wake_on_ring requires a wake_handler",
                    ),
                );
                return;
            }
            (None, None) => None,
        };

        if st.registry.bind_address(session, &fields.address).is_err() {
            debug!(session = %session, address = %fields.address, "address in use");
            st.send_to(
                session,
                Frame::RegisterFailed {
                    reason: RegisterFailReason::AddressInUse,
                },
            );
            return;
        }

        // Re-registering away from broadcast tears the shared session down.
        if matches!(concurrency, Concurrency::Broadcast { .. }) {
            if let Some(bs) = st.broadcasts.for_broadcaster_mut(session) {
                bs.broadcaster_address = fields.address.clone();
            }
        } else if let Some(bs) = st.broadcasts.for_broadcaster(session) {
            let call_id = bs.call_id;
            self.teardown_broadcast(&mut st, call_id, "reconfigured");
        }

        if let Some(conn) = st.registry.by_session_mut(session) {
            conn.metadata = fields.metadata;
            conn.concurrency = concurrency;
            conn.wake_handler = wake_handler;
            conn.send(Frame::Registered {
                address: fields.address.clone(),
                session_id: session.to_string(),
            });
        }

        info!(session = %session, address = %fields.address, concurrency = concurrency.label(), "registered");

        self.drain_pending_wakes(&mut st, session, &fields.address);
        self.refresh_idle(&mut st, session);
    }

    /// Start queued wake calls against a newly eligible registration, one
    /// per admission slot; the remainder stays queued.
    fn drain_pending_wakes(&self, st: &mut State, session: SessionId, address: &str) {
        loop {
            let accepts = match st.registry.by_session(session) {
                Some(conn) => !conn.at_capacity(),
                None => false,
            };
            if !accepts {
                break;
            }
            let Some(pending) = st.wake.dequeue(address) else {
                break;
            };
            // Filtered dequeue: a departed caller fails silently and the
            // next entry gets its chance.
            if st.registry.by_session(pending.caller).is_none() {
                debug!(call_id = %pending.call_id, "pending wake dropped: caller_unavailable");
                continue;
            }

            let caller = pending.caller;
            let call_id = pending.call_id;
            debug!(call_id = %call_id, callee = %address, "starting queued wake call");

            let is_broadcast = st
                .registry
                .by_session(session)
                .is_some_and(|c| matches!(c.concurrency, Concurrency::Broadcast { .. }));
            if is_broadcast {
                self.join_broadcast(st, caller, pending.caller_address, session, pending.metadata);
                if let Some(conn) = st.registry.by_session_mut(caller) {
                    conn.pending_wake.remove(&call_id);
                }
            } else {
                self.start_call(
                    st,
                    caller,
                    pending.caller_address,
                    session,
                    pending.metadata,
                    Some(call_id),
                );
            }
        }
    }

    fn on_unregister(&self, session: SessionId) {
        {
            let mut st = self.state.lock();
            self.persist_wake_profile(&mut st, session);
        }
        self.disconnect(session, DisconnectReason::ClientRequested);
    }

    fn on_status(&self, session: SessionId, status: &str, spec: Option<AutoSleepSpec>) {
        let mut st = self.state.lock();

        let Ok(parsed) = status.parse::<Status>() else {
            st.send_to(
                session,
                Frame::invalid_payload("STATUS", format!("unknown status `{status}`")),
            );
            return;
        };

        let auto_sleep = match spec {
            Some(spec) => {
                if !spec.idle_timeout_seconds.is_finite() || spec.idle_timeout_seconds < 0.0 {
                    st.send_to(
                        session,
                        Frame::invalid_payload(
                            "STATUS",
                            "auto_sleep.idle_timeout_seconds must be non-negative",
                        ),
                    );
                    return;
                }
                Some(AutoSleep {
                    idle_timeout: Duration::from_secs_f64(spec.idle_timeout_seconds),
                    wake_on_ring: spec.wake_on_ring,
                })
            }
            None => None,
        };

        let Some(conn) = st.registry.by_session_mut(session) else {
            return;
        };
        conn.set_manual_status(parsed);
        if auto_sleep.is_some() {
            conn.auto_sleep = auto_sleep;
        }
        self.refresh_idle(&mut st, session);
    }

    fn on_heartbeat(&self, session: SessionId) {
        let mut st = self.state.lock();
        let Some(conn) = st.registry.by_session_mut(session) else {
            return;
        };
        conn.last_heartbeat = Instant::now();
        conn.send(Frame::HeartbeatAck {
            timestamp: now_millis(),
        });
        self.refresh_idle(&mut st, session);
    }

    fn on_sleep_ack(&self, session: SessionId) {
        let persisted = {
            let mut st = self.state.lock();
            let configured = st
                .registry
                .by_session(session)
                .is_some_and(|c| c.wake_on_ring() && c.address.is_some());
            if configured {
                self.persist_wake_profile(&mut st, session);
                true
            } else {
                st.send_to(
                    session,
                    Frame::invalid_payload("SLEEP_ACK", "wake_on_ring is not configured"),
                );
                false
            }
        };
        if persisted {
            self.disconnect(session, DisconnectReason::Sleep);
        }
    }

    /// Store the connection's wake profile so a later dial can revive it.
    fn persist_wake_profile(&self, st: &mut State, session: SessionId) {
        if let Some(conn) = st.registry.by_session(session) {
            if let (Some(address), Some(handler)) = (conn.address.clone(), conn.wake_handler.clone())
            {
                debug!(address = %address, "persisting wake profile");
                st.wake.store_profile(WakeProfile { address, handler });
            }
        }
    }

    // =====================================================================
    // Calls
    // =====================================================================

    fn on_dial(&self, session: SessionId, to: String, metadata: Option<serde_json::Value>) {
        let mut st = self.state.lock();

        let Some(conn) = st.registry.by_session_mut(session) else {
            return;
        };
        if !conn.dial_limiter.check(Instant::now()) {
            warn!(session = %session, "dial rate limited");
            conn.send(Frame::error(
                ErrorReason::RateLimited,
                "DIAL",
                "dial rate exceeded",
            ));
            return;
        }
        let Some(caller_address) = conn.address.clone() else {
            conn.send(Frame::error(
                ErrorReason::NotRegistered,
                "DIAL",
                "DIAL requires a registered address",
            ));
            return;
        };

        if to == caller_address {
            conn.send(Frame::busy(to, BusyReason::AlreadyInCall));
            return;
        }

        let Some(callee_sid) = st.registry.session_for(&to) else {
            // Sleeping agent with a stored profile, then a federated
            // route, then nobody at all.
            if st.wake.profile(&to).is_some() {
                self.begin_wake(&mut st, session, caller_address, to, metadata);
            } else if let Some(peer) = st.routes.lookup(&to) {
                debug!(to = %to, peer = %peer, "forwarding dial to federation peer");
                st.send_to(peer, Frame::Dial { to, metadata });
            } else {
                st.send_to(session, Frame::busy(to, BusyReason::NoSuchAddress));
            }
            return;
        };

        let (manual, concurrency, active) = {
            let Some(callee) = st.registry.by_session(callee_sid) else {
                st.send_to(session, Frame::busy(to, BusyReason::NoSuchAddress));
                return;
            };
            (
                callee.manual_status(),
                callee.concurrency,
                callee.active_calls.len(),
            )
        };

        match manual {
            Status::Dnd => {
                st.send_to(session, Frame::busy(to, BusyReason::Dnd));
                return;
            }
            Status::Away => {
                st.send_to(session, Frame::busy(to, BusyReason::Away));
                return;
            }
            Status::Busy => {
                st.send_to(session, Frame::busy(to, BusyReason::Busy));
                return;
            }
            Status::Available => {}
        }

        match concurrency {
            Concurrency::Single => {
                if active > 0 {
                    st.send_to(session, Frame::busy(to, BusyReason::AlreadyInCall));
                } else {
                    self.start_call(&mut st, session, caller_address, callee_sid, metadata, None);
                }
            }
            Concurrency::Broadcast { .. } => {
                self.join_broadcast(&mut st, session, caller_address, callee_sid, metadata);
            }
            Concurrency::Parallel { max_sessions } => {
                if max_sessions.is_some_and(|cap| active >= cap) {
                    st.send_to(session, Frame::busy(to, BusyReason::MaxSessionsReached));
                } else {
                    self.start_call(&mut st, session, caller_address, callee_sid, metadata, None);
                }
            }
        }
    }

    /// Shared call-start primitive: create the ringing record, mark both
    /// parties, emit RING, arm the ring timer.
    fn start_call(
        &self,
        st: &mut State,
        caller: SessionId,
        caller_address: String,
        callee: SessionId,
        metadata: Option<serde_json::Value>,
        reuse_id: Option<CallId>,
    ) {
        let Some(callee_address) = st
            .registry
            .by_session(callee)
            .and_then(|c| c.address.clone())
        else {
            return;
        };

        let call_id = reuse_id.unwrap_or_else(Uuid::new_v4);
        st.calls.insert(Call::new(
            call_id,
            caller,
            callee,
            caller_address.clone(),
            callee_address,
            metadata.clone(),
        ));

        if let Some(conn) = st.registry.by_session_mut(caller) {
            conn.pending_wake.remove(&call_id);
            conn.active_calls.insert(call_id);
            conn.bump_idle_epoch();
        }
        if let Some(conn) = st.registry.by_session_mut(callee) {
            conn.active_calls.insert(call_id);
            conn.bump_idle_epoch();
            conn.send(Frame::ring(caller_address, call_id.to_string(), metadata));
        }

        debug!(call_id = %call_id, "call ringing");
        self.arm_ring_timer(call_id);
    }

    fn on_answer(&self, session: SessionId, call_id: &str) {
        // Unknown ids, wrong senders, and non-ringing calls are all
        // idempotent no-ops.
        let Ok(call_id) = call_id.parse::<Uuid>() else {
            return;
        };
        let mut st = self.state.lock();

        let (caller, callee_address) = {
            let Some(call) = st.calls.get_mut(call_id) else {
                return;
            };
            if call.callee != session || call.state != CallState::Ringing {
                return;
            }
            call.connect();
            (call.caller, call.callee_address.clone())
        };

        debug!(call_id = %call_id, "call connected");
        st.send_to(caller, Frame::connected(call_id.to_string(), callee_address));
    }

    fn on_hangup(&self, session: SessionId, call_id: &str, reason: Option<String>) {
        let Ok(call_id) = call_id.parse::<Uuid>() else {
            return;
        };
        let reason = reason.unwrap_or_else(|| "normal".to_string());
        let mut st = self.state.lock();

        // Point-to-point table first, broadcast second.
        if let Some(call) = st.calls.get(call_id) {
            if !call.is_participant(session) {
                return;
            }
            self.end_call(&mut st, call_id, &reason, Some(session));
            return;
        }

        let (is_broadcaster, is_listener) = {
            let Some(bs) = st.broadcasts.get(call_id) else {
                return;
            };
            (bs.broadcaster == session, bs.has_listener(session))
        };
        if is_broadcaster {
            self.teardown_broadcast(&mut st, call_id, &reason);
        } else if is_listener {
            self.remove_listener(&mut st, call_id, session, &reason, true);
        }
    }

    /// End a point-to-point call, notifying every participant except
    /// `skip` (the party who initiated or already knows).
    fn end_call(&self, st: &mut State, call_id: CallId, reason: &str, skip: Option<SessionId>) {
        let Some(mut call) = st.calls.remove(call_id) else {
            return;
        };
        call.end(reason);

        for party in [call.caller, call.callee] {
            if let Some(conn) = st.registry.by_session_mut(party) {
                conn.active_calls.remove(&call_id);
                if Some(party) != skip {
                    conn.send(Frame::hangup(call_id.to_string(), reason));
                }
            }
            self.refresh_idle(st, party);
        }
        debug!(call_id = %call_id, reason, "call ended");
    }

    fn on_msg(
        &self,
        session: SessionId,
        call_id: &str,
        data: serde_json::Value,
        content_type: Option<String>,
    ) {
        let mut st = self.state.lock();

        let content_type = content_type.unwrap_or_else(|| "text".to_string());
        if !matches!(content_type.as_str(), "text" | "json" | "binary") {
            st.send_to(
                session,
                Frame::invalid_payload("MSG", format!("unknown content_type `{content_type}`")),
            );
            return;
        }

        let Ok(call_id) = call_id.parse::<Uuid>() else {
            return;
        };
        let Some(from) = st
            .registry
            .by_session(session)
            .and_then(|c| c.address.clone())
        else {
            return;
        };

        if let Some(call) = st.calls.get(call_id) {
            if call.state != CallState::Connected || !call.is_participant(session) {
                return;
            }
            if let Some(peer) = call.other_party(session) {
                st.send_to(
                    peer,
                    Frame::msg(call_id.to_string(), from, data, content_type),
                );
            }
            return;
        }

        let Some(bs) = st.broadcasts.get(call_id) else {
            return;
        };
        if bs.broadcaster == session {
            // Best-effort fan-out; a dead listener must not block the rest,
            // which Connection::send already guarantees.
            let listeners: Vec<SessionId> = bs.listener_sessions().collect();
            for listener in listeners {
                st.send_to(
                    listener,
                    Frame::msg(call_id.to_string(), from.clone(), data.clone(), content_type.clone()),
                );
            }
        } else if bs.has_listener(session) {
            let broadcaster = bs.broadcaster;
            st.send_to(
                broadcaster,
                Frame::msg(call_id.to_string(), from, data, content_type),
            );
        }
    }

    // =====================================================================
    // Broadcast sessions
    // =====================================================================

    /// Admit `caller` into the callee's broadcast session, creating it
    /// lazily on first join.
    fn join_broadcast(
        &self,
        st: &mut State,
        caller: SessionId,
        caller_address: String,
        broadcaster: SessionId,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(broadcaster_address) = st
            .registry
            .by_session(broadcaster)
            .and_then(|c| c.address.clone())
        else {
            return;
        };
        let max_listeners = match st.registry.by_session(broadcaster).map(|c| c.concurrency) {
            Some(Concurrency::Broadcast { max_listeners }) => max_listeners,
            _ => return,
        };

        let call_id = match st.broadcasts.for_broadcaster(broadcaster) {
            Some(bs) => bs.call_id,
            None => {
                let call_id = st.broadcasts.create(BroadcastSession::new(
                    broadcaster,
                    broadcaster_address.clone(),
                    metadata.clone(),
                ));
                if let Some(conn) = st.registry.by_session_mut(broadcaster) {
                    conn.active_calls.insert(call_id);
                    conn.bump_idle_epoch();
                }
                debug!(call_id = %call_id, broadcaster = %broadcaster_address, "broadcast session created");
                call_id
            }
        };

        let (already_joined, full) = {
            let Some(bs) = st.broadcasts.get(call_id) else {
                return;
            };
            (bs.has_listener(caller), bs.is_full(max_listeners))
        };
        if already_joined {
            // Idempotent rejoin.
            st.send_to(
                caller,
                Frame::connected(call_id.to_string(), broadcaster_address),
            );
            return;
        }
        if full {
            st.send_to(
                caller,
                Frame::busy(broadcaster_address, BusyReason::MaxListenersReached),
            );
            return;
        }
        if let Some(bs) = st.broadcasts.get_mut(call_id) {
            bs.add_listener(caller, caller_address.clone());
        }

        if let Some(conn) = st.registry.by_session_mut(caller) {
            conn.active_calls.insert(call_id);
            conn.bump_idle_epoch();
            conn.send(Frame::connected(call_id.to_string(), broadcaster_address));
        }
        st.send_to(
            broadcaster,
            Frame::ring(caller_address, call_id.to_string(), metadata),
        );
    }

    /// Remove one listener; tears the session down if the set empties.
    fn remove_listener(
        &self,
        st: &mut State,
        call_id: CallId,
        listener: SessionId,
        reason: &str,
        notify_listener: bool,
    ) {
        let Some(bs) = st.broadcasts.get_mut(call_id) else {
            return;
        };
        let Some(listener_address) = bs.remove_listener(listener) else {
            return;
        };
        let broadcaster = bs.broadcaster;
        let empty = bs.is_empty();

        if let Some(conn) = st.registry.by_session_mut(listener) {
            conn.active_calls.remove(&call_id);
            if notify_listener {
                conn.send(Frame::hangup(call_id.to_string(), reason));
            }
        }
        st.send_to(
            broadcaster,
            Frame::Hangup {
                call_id: call_id.to_string(),
                reason: Some(reason.to_string()),
                from: Some(listener_address),
            },
        );
        self.refresh_idle(st, listener);

        if empty {
            st.broadcasts.remove(call_id);
            if let Some(conn) = st.registry.by_session_mut(broadcaster) {
                conn.active_calls.remove(&call_id);
            }
            self.refresh_idle(st, broadcaster);
            debug!(call_id = %call_id, "broadcast session empty, torn down");
        }
    }

    /// Destroy a broadcast session, hanging up every listener.
    fn teardown_broadcast(&self, st: &mut State, call_id: CallId, reason: &str) {
        let Some(bs) = st.broadcasts.remove(call_id) else {
            return;
        };
        for listener in bs.listener_sessions() {
            if let Some(conn) = st.registry.by_session_mut(listener) {
                conn.active_calls.remove(&call_id);
                conn.send(Frame::hangup(call_id.to_string(), reason));
            }
            self.refresh_idle(st, listener);
        }
        if let Some(conn) = st.registry.by_session_mut(bs.broadcaster) {
            conn.active_calls.remove(&call_id);
        }
        self.refresh_idle(st, bs.broadcaster);
        debug!(call_id = %call_id, reason, "broadcast session destroyed");
    }

    // =====================================================================
    // Wake-on-ring
    // =====================================================================

    /// Queue a dial behind a sleeping address and fire the wake executor.
    fn begin_wake(
        &self,
        st: &mut State,
        caller: SessionId,
        caller_address: String,
        callee_address: String,
        metadata: Option<serde_json::Value>,
    ) {
        let Some(profile) = st.wake.profile(&callee_address).cloned() else {
            return;
        };
        let call_id = Uuid::new_v4();
        let timeout = profile.handler.timeout();

        st.wake.enqueue(PendingWakeCall {
            call_id,
            caller,
            caller_address,
            callee_address: callee_address.clone(),
            metadata,
        });
        if let Some(conn) = st.registry.by_session_mut(caller) {
            conn.pending_wake.insert(call_id);
            conn.bump_idle_epoch();
        }
        info!(call_id = %call_id, callee = %callee_address, "wake requested");

        let exec = Arc::clone(&self.wake_exec);
        let Some(exchange) = self.self_ref.upgrade() else {
            return;
        };
        let exec_address = callee_address.clone();
        tokio::spawn(async move {
            if let Err(e) = exec.wake(&profile).await {
                warn!(address = %exec_address, error = %e, "wake executor failed");
                exchange.on_wake_failed(&exec_address, call_id);
            }
        });

        let Some(exchange) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            exchange.on_wake_timeout(&callee_address, call_id);
        });
    }

    /// Fail a still-pending wake call back to its caller.
    fn fail_pending_wake(&self, address: &str, call_id: CallId, reason: BusyReason) {
        let mut st = self.state.lock();
        let Some(pending) = st.wake.remove_call(address, call_id) else {
            return;
        };
        debug!(call_id = %call_id, callee = %address, reason = ?reason, "pending wake failed");
        if let Some(conn) = st.registry.by_session_mut(pending.caller) {
            conn.pending_wake.remove(&call_id);
            conn.send(Frame::busy(address, reason));
        }
        self.refresh_idle(&mut st, pending.caller);
    }

    fn on_wake_timeout(&self, address: &str, call_id: CallId) {
        self.fail_pending_wake(address, call_id, BusyReason::Timeout);
    }

    fn on_wake_failed(&self, address: &str, call_id: CallId) {
        self.fail_pending_wake(address, call_id, BusyReason::WakeFailed);
    }

    // =====================================================================
    // Presence
    // =====================================================================

    fn on_presence(&self, session: SessionId, query: Option<PresenceQuerySpec>) {
        let st = self.state.lock();

        let registered = st
            .registry
            .by_session(session)
            .is_some_and(|c| c.address.is_some());
        if !registered {
            st.send_to(
                session,
                Frame::error(
                    ErrorReason::NotRegistered,
                    "PRESENCE",
                    "PRESENCE requires a registered address",
                ),
            );
            return;
        }

        let query = match PresenceQuery::from_spec(query.unwrap_or_default()) {
            Ok(query) => query,
            Err(detail) => {
                st.send_to(session, Frame::invalid_payload("PRESENCE", detail));
                return;
            }
        };

        let addresses = run_query(&query, st.registry.iter(), session);
        st.send_to(session, Frame::PresenceResult { addresses });
    }

    // =====================================================================
    // Federation
    // =====================================================================

    fn on_register_pbx(
        &self,
        session: SessionId,
        domain: String,
        routes: Vec<String>,
        endpoint: Option<String>,
    ) {
        let mut st = self.state.lock();

        if domain.is_empty() || routes.iter().any(String::is_empty) {
            st.send_to(
                session,
                Frame::RegisterPbxFailed {
                    reason: "invalid_payload".to_string(),
                },
            );
            return;
        }

        st.routes.install(session, &routes);
        if let Some(conn) = st.registry.by_session_mut(session) {
            conn.peer = Some(PeerInfo {
                domain: domain.clone(),
                endpoint,
            });
            conn.send(Frame::RegisteredPbx {
                domain: domain.clone(),
            });
        }
        info!(session = %session, domain = %domain, routes = routes.len(), "peer exchange registered");
    }

    // =====================================================================
    // Timers and liveness
    // =====================================================================

    fn arm_ring_timer(&self, call_id: CallId) {
        let Some(exchange) = self.self_ref.upgrade() else {
            return;
        };
        let timeout = self.config.ringing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            exchange.on_ring_timeout(call_id);
        });
    }

    fn on_ring_timeout(&self, call_id: CallId) {
        let mut st = self.state.lock();
        let (caller, callee, callee_address) = match st.calls.get(call_id) {
            Some(call) if call.state == CallState::Ringing => {
                (call.caller, call.callee, call.callee_address.clone())
            }
            _ => return,
        };

        st.calls.remove(call_id);
        debug!(call_id = %call_id, "ring timeout");

        if let Some(conn) = st.registry.by_session_mut(caller) {
            conn.active_calls.remove(&call_id);
            conn.send(Frame::busy(callee_address, BusyReason::Timeout));
        }
        if let Some(conn) = st.registry.by_session_mut(callee) {
            conn.active_calls.remove(&call_id);
            conn.send(Frame::hangup(call_id.to_string(), "timeout"));
        }
        self.refresh_idle(&mut st, caller);
        self.refresh_idle(&mut st, callee);
    }

    /// Invalidate any armed idle timer and re-arm when the connection is
    /// auto-sleep eligible. Called on every activity.
    fn refresh_idle(&self, st: &mut State, session: SessionId) {
        let Some(conn) = st.registry.by_session_mut(session) else {
            return;
        };
        let epoch = conn.bump_idle_epoch();
        if !conn.idle_eligible() {
            return;
        }
        let Some(auto_sleep) = conn.auto_sleep else {
            return;
        };

        let Some(exchange) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(auto_sleep.idle_timeout).await;
            exchange.on_idle_timeout(session, epoch);
        });
    }

    fn on_idle_timeout(&self, session: SessionId, epoch: u64) {
        let mut st = self.state.lock();
        let Some(conn) = st.registry.by_session_mut(session) else {
            return;
        };
        if conn.idle_epoch != epoch || conn.sleep_pending || !conn.idle_eligible() {
            return;
        }
        let Some(auto_sleep) = conn.auto_sleep else {
            return;
        };

        let grace = sleep_grace(auto_sleep.idle_timeout);
        conn.sleep_pending = true;
        conn.send(Frame::SleepPending {
            reason: "idle_timeout".to_string(),
            seconds_until_sleep: grace.as_secs_f64(),
        });
        debug!(session = %session, grace_ms = grace.as_millis() as u64, "sleep pending");

        let Some(exchange) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            exchange.on_sleep_deadline(session, epoch);
        });
    }

    fn on_sleep_deadline(&self, session: SessionId, epoch: u64) {
        let proceed = {
            let mut st = self.state.lock();
            let valid = st.registry.by_session(session).is_some_and(|conn| {
                conn.idle_epoch == epoch && conn.sleep_pending && conn.idle_eligible()
            });
            if valid {
                self.persist_wake_profile(&mut st, session);
            }
            valid
        };
        if proceed {
            self.disconnect(session, DisconnectReason::Sleep);
        }
    }

    /// One liveness pass: evict every connection whose last heartbeat is
    /// older than the timeout. Returns the number evicted.
    pub fn sweep_once(&self) -> usize {
        let stale: Vec<SessionId> = {
            let st = self.state.lock();
            st.registry
                .iter()
                .filter(|conn| conn.last_heartbeat.elapsed() > self.config.heartbeat_timeout)
                .map(|conn| conn.session_id)
                .collect()
        };
        for session in &stale {
            info!(session = %session, "heartbeat timeout, evicting");
            self.disconnect(*session, DisconnectReason::Timeout);
        }
        stale.len()
    }

    /// Run the heartbeat sweeper until aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let exchange = self.self_ref.upgrade();
        let period = self.config.heartbeat_interval.max(Duration::from_secs(5));
        tokio::spawn(async move {
            let Some(exchange) = exchange else { return };
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                exchange.sweep_once();
            }
        })
    }

    // =====================================================================
    // Disconnect
    // =====================================================================

    /// Tear a connection down, in order: timers, wake persistence,
    /// registry and route removal, call teardown, pending-wake failure,
    /// transport close.
    pub fn disconnect(&self, session: SessionId, reason: DisconnectReason) {
        let mut st = self.state.lock();
        let Some(mut conn) = st.registry.remove(session) else {
            return;
        };

        conn.bump_idle_epoch();
        conn.dial_limiter.reset();

        if reason == DisconnectReason::Timeout {
            if let (Some(address), Some(handler)) = (conn.address.clone(), conn.wake_handler.clone())
            {
                debug!(address = %address, "persisting wake profile on timeout");
                st.wake.store_profile(WakeProfile { address, handler });
            }
        }

        st.routes.remove_session(session);

        for call_id in conn.active_calls.iter().copied().collect::<Vec<_>>() {
            if st.calls.contains(call_id) {
                self.end_call(&mut st, call_id, reason.as_str(), Some(session));
                continue;
            }
            let is_broadcaster = match st.broadcasts.get(call_id) {
                Some(bs) => bs.broadcaster == session,
                None => continue,
            };
            if is_broadcaster {
                self.teardown_broadcast(&mut st, call_id, reason.as_str());
            } else {
                self.remove_listener(&mut st, call_id, session, reason.as_str(), false);
            }
        }

        let failed = st.wake.remove_by_caller(session);
        if !failed.is_empty() {
            debug!(session = %session, count = failed.len(), "dropped pending wake calls");
        }

        conn.close(reason.close_code(), reason.as_str());
        info!(session = %session, address = ?conn.address, reason = reason.as_str(), "disconnected");
    }

    /// Disconnect every connection; used on process shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<SessionId> = {
            let st = self.state.lock();
            st.registry.iter().map(|c| c.session_id).collect()
        };
        for session in sessions {
            self.disconnect(session, DisconnectReason::Shutdown);
        }
    }
}

/// Grace period between the SLEEP_PENDING warning and the sleep itself:
/// a tenth of the idle timeout, clamped to [200ms, 5s].
fn sleep_grace(idle_timeout: Duration) -> Duration {
    Duration::from_secs_f64((idle_timeout.as_secs_f64() / 10.0).clamp(0.2, 5.0))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn parse_concurrency(
    kind: Option<&str>,
    max_listeners: Option<i64>,
    max_sessions: Option<i64>,
) -> Result<Concurrency, String> {
    let kind = kind.unwrap_or("single");
    match kind {
        "single" => {
            if max_listeners.is_some() {
                Err("max_listeners requires broadcast concurrency".to_string())
            } else if max_sessions.is_some() {
                Err("max_sessions requires parallel concurrency".to_string())
            } else {
                Ok(Concurrency::Single)
            }
        }
        "broadcast" => {
            if max_sessions.is_some() {
                Err("max_sessions requires parallel concurrency".to_string())
            } else {
                Ok(Concurrency::Broadcast {
                    max_listeners: validate_cap(max_listeners, "max_listeners")?,
                })
            }
        }
        "parallel" => {
            if max_listeners.is_some() {
                Err("max_listeners requires broadcast concurrency".to_string())
            } else {
                Ok(Concurrency::Parallel {
                    max_sessions: validate_cap(max_sessions, "max_sessions")?,
                })
            }
        }
        other => Err(format!("unknown concurrency `{other}`")),
    }
}

fn validate_cap(value: Option<i64>, name: &str) -> Result<Option<usize>, String> {
    match value {
        None => Ok(None),
        Some(n) if n > 0 => Ok(Some(n as usize)),
        Some(_) => Err(format!("{name} must be a positive integer")),
    }
}

fn validate_wake_handler(spec: &WakeHandlerSpec) -> Result<WakeHandler, String> {
    let timeout = match spec.timeout_seconds {
        Some(t) if t.is_finite() && t > 0.0 => Duration::from_secs_f64(t),
        _ => return Err("wake_handler.timeout_seconds must be a positive number".to_string()),
    };

    match spec.kind.as_str() {
        "webhook" => match spec.url.as_deref() {
            Some(url) if !url.is_empty() => Ok(WakeHandler::Webhook {
                url: url.to_string(),
                timeout,
            }),
            _ => Err("webhook wake_handler requires a non-empty url".to_string()),
        },
        "spawn" => match &spec.command {
            Some(command) if !command.is_empty() && command.iter().all(|c| !c.is_empty()) => {
                Ok(WakeHandler::Spawn {
                    command: command.clone(),
                    timeout,
                })
            }
            _ => Err("spawn wake_handler requires a non-empty command array".to_string()),
        },
        other => Err(format!("unknown wake_handler kind `{other}`")),
    }
}
