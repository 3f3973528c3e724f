//! `transport_shared`
//!
//! Pieces used by both the server and the clients.
//!
//! Design goals:
//! - Wire formats are fixed-size, explicit and big-endian.
//! - Sequencing/loss state is plain data owned by one task, no locks.
//! - Setup errors are `anyhow`; per-peer protocol errors are typed.
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod event;
pub mod packet;
pub mod pool;
pub mod unstable;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::packet::*;
    pub use crate::pool::*;
    pub use crate::unstable::*;
}
