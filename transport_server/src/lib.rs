//! `transport_server`
//!
//! Server side of the transport:
//! - One listener worker accepts TCP streams and receives UDP datagrams
//! - `stable_threads` processor workers reassemble length-framed messages
//! - Every observation is published as a `TransportEvent`
//!
//! Channels:
//! - Stable (TCP): reliable, ordered, `u32` length prefix
//! - Unstable (UDP): 16-byte sequenced header, loss accounting per peer

pub mod connection;
pub mod server;
pub mod table;

pub use server::Server;
