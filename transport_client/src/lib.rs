//! `transport_client`
//!
//! Peers for the transport server:
//! - `StableClient`: reliable, length-framed messages over TCP
//! - `UnstableClient`: sequenced datagrams with loss accounting over UDP

pub mod client;

pub use client::{StableClient, UnstableClient};
