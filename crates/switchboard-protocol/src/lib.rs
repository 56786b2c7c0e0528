//! # switchboard-protocol
//!
//! Wire protocol definitions for the Switchboard message-routing exchange.
//!
//! This crate defines the JSON frame vocabulary exchanged between agents
//! and the exchange, the codec, and address syntax.
//!
//! ## Frame Types
//!
//! - `REGISTER` / `UNREGISTER` / `STATUS` - address lifecycle
//! - `DIAL` / `ANSWER` / `HANGUP` / `MSG` - calls
//! - `PRESENCE` - reachability queries
//! - `HEARTBEAT` / `SLEEP_ACK` - liveness and wake-on-ring
//! - `REGISTER_PBX` - federation
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, Frame};
//!
//! let frame = Frame::dial("operator@exchange.test", None);
//! let text = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod address;
pub mod codec;
pub mod frames;

pub use address::{address_domain, validate_address, MAX_ADDRESS_LENGTH};
pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    AutoSleepSpec, BusyReason, ErrorReason, Frame, NearSpec, PresenceEntry, PresenceQuerySpec,
    RegisterFailReason, WakeHandlerSpec,
};
