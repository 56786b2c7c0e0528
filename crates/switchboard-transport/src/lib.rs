//! # switchboard-transport
//!
//! Transport seam for the Switchboard exchange.
//!
//! The exchange is transport-agnostic: it writes outbound frames through
//! the non-blocking [`FrameSink`] trait and receives inbound frames from
//! whatever read loop owns the socket. This crate provides the trait, an
//! in-memory channel transport for tests, and the outbound WebSocket link
//! used by federation.

pub mod channel;
pub mod traits;
pub mod websocket;

pub use channel::{pair, ChannelReceiver, ChannelSink};
pub use traits::{close_codes, FrameSink, TransportError};
pub use websocket::{WsLink, WsSink};
