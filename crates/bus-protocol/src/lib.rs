//! # bus-protocol
//!
//! Wire protocol definitions for the Ferrobus message bus.
//!
//! This crate defines everything that crosses the socket between a client
//! and the broker: the authentication handshake that precedes framing, the
//! message model, and the length-prefixed codec.
//!
//! ## Modules
//!
//! - `auth` - NUL / `AUTH` / `BEGIN` handshake state machine
//! - `message` - Message kinds, arguments and builders
//! - `codec` - Length-prefixed MessagePack framing
//! - `names` - Well-known names, paths and reply codes of the bus
//!
//! ## Example
//!
//! ```rust
//! use bus_protocol::{codec, Message};
//!
//! let call = Message::method_call("org.freedesktop.DBus", "/org/freedesktop/DBus", "Hello")
//!     .with_serial(1);
//!
//! let encoded = codec::encode(&call).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.member, "Hello");
//! ```

pub mod auth;
pub mod codec;
pub mod message;
pub mod names;

pub use auth::{AuthState, AuthStatus, HandshakeError, ServerAuth};
pub use codec::{decode, decode_from, encode, MessageCodec, ProtocolError};
pub use message::{Arg, Message, MessageKind};
