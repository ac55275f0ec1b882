//! trove server library
//!
//! Serves a trove index over a Unix socket speaking newline-delimited JSON
//! (see `trove_types::protocol`).

pub mod connection;
pub mod constants;
pub mod outbound;
pub mod server;

pub use connection::Shared;
pub use outbound::OutboundQueue;
pub use server::TroveServer;
