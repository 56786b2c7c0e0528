//! # switchboard-core
//!
//! The routing core of the Switchboard exchange.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Exchange** - serialized frame dispatch and the call state machine
//! - **ConnectionRegistry** - session and address indexes
//! - **CallTable / BroadcastTable** - point-to-point and fan-out call state
//! - **WakeStore** - wake-on-ring profiles and pending dial queues
//! - **Presence** - reachability queries over the registry
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌───────────────┐
//! │ Transport │────▶│  Exchange  │────▶│   Registry    │
//! └───────────┘     └────────────┘     └───────────────┘
//!                      │      │
//!                      ▼      ▼
//!               ┌────────┐ ┌───────────┐
//!               │ Calls  │ │ WakeStore │
//!               └────────┘ └───────────┘
//! ```
//!
//! Every inbound frame and timer callback is handled under one lock, so
//! no two handlers observe an intermediate state.

pub mod broadcast;
pub mod calls;
pub mod connection;
pub mod exchange;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod routes;
pub mod wake;

pub use broadcast::{BroadcastSession, BroadcastTable};
pub use calls::{Call, CallId, CallState, CallTable};
pub use connection::{
    AutoSleep, Concurrency, Connection, DisconnectReason, PeerInfo, SessionId, Status,
};
pub use exchange::{Exchange, ExchangeConfig, ExchangeStats};
pub use presence::{haversine_km, GeoFilter, PresenceQuery};
pub use ratelimit::DialRateLimiter;
pub use registry::ConnectionRegistry;
pub use routes::{pattern_matches, RouteTable};
pub use wake::{
    NoopWakeExecutor, PendingWakeCall, WakeError, WakeExecutor, WakeHandler, WakeProfile,
    WakeStore,
};
