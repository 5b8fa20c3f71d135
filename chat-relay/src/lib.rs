//! Directed-message chat relay over TCP.
//!
//! Clients connect, register a display name, and exchange point-to-point
//! messages addressed by the identifier the relay assigns them. The relay
//! tells everyone when a peer joins or leaves. All state lives in memory for
//! the lifetime of the process.
//!
//! - [`codec`] frames tagged string lists on the wire (length-prefixed, explicit
//!   field count) and plugs into `tokio_util::codec`.
//! - [`message`] maps frames to the typed protocol messages.
//! - [`registry`] is the shared, mutex-guarded set of registered clients.
//! - [`handler`] runs one client's session: ordered reads, a serialized writer.
//! - [`relay`] binds the listener, runs the accept loop, and publishes
//!   [`relay::RelayEvent`]s.
//! - [`cli`] and [`client`] provide the command-line relay and a terminal
//!   client for it.

pub mod cli;
pub mod client;
pub mod codec;
pub mod handler;
pub mod message;
pub mod registry;
pub mod relay;
