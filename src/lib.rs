//! A D-Bus connection library: transports, queues, reply tracking and
//! message dispatch.
//!
//! The central type is [`Connection`], a long-lived state machine that
//! owns the transport descriptors, frames messages, runs the
//! authentication handshake, correlates method calls with their replies,
//! fires per-call timeouts and routes inbound messages through filters,
//! matches and the built-in peer interface. It performs non-blocking I/O
//! and integrates with an external event loop through
//! [`Connection::get_fd`], [`Connection::get_events`] and
//! [`Connection::get_timeout`], or through [`AsyncConnection`] when the
//! `tokio` feature is enabled.
//!
//! Marshalling of message bodies, the object/vtable layer and the match
//! expression language are deliberately out of scope: bodies are opaque
//! byte slices, object dispatch is a single hook
//! ([`Connection::set_object_handler`]) and matches take a compiled
//! predicate.

#[macro_use]
mod macros;

#[doc(inline)]
pub use self::address::Address;
mod address;

#[doc(inline)]
pub use self::connection::{BusState, Connection};
mod connection;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::filter::{FilterHandle, MatchHandle};
mod filter;

#[doc(inline)]
pub use self::memfd::MemfdCache;
mod memfd;

#[doc(inline)]
pub use self::message::{Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::protocol::{AttachFlags, Endianness, Events, Flags};
pub mod protocol;

mod queue;

mod reply;

mod sasl;

#[cfg(test)]
mod testutil;

mod transport;

#[doc(inline)]
pub use self::utils::Id128;
mod utils;

mod wire;

#[cfg(feature = "tokio")]
#[doc(inline)]
pub use self::event::AsyncConnection;
#[cfg(feature = "tokio")]
mod event;
