//! Bridge between a terminal multiplexer and one remote client.
//!
//! The client speaks newline-delimited JSON over a Unix socket. Each host
//! session gets a capture coprocess whose raw output is forwarded to the
//! client, and client commands are relayed back into the host.

pub mod bridge;
pub mod client;
pub mod config;
pub mod coprocess;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod janitor;
pub mod monitors;
pub mod protocol;
pub mod registry;
pub mod screen;
pub mod server;

#[cfg(test)]
mod test_helpers;
