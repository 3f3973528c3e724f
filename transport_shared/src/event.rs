//! Upward notifications from the transport.
//!
//! The server publishes `TransportEvent`s into an `EventSink` supplied by the
//! embedding application.
//! - Channel sink: forward into a tokio mpsc channel.
//! - `EventQueue`: buffer and drain from a polling loop (or a test).
//! - `NullSink`: discard.

use std::{net::SocketAddr, sync::Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::packet::UnstablePacketHeader;

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A stream connection was accepted and assigned to a processor.
    StableConnected { addr: SocketAddr },
    /// A complete stable frame arrived.
    StableMessage { addr: SocketAddr, payload: Bytes },
    /// A stream connection was closed and reaped.
    StableDisconnected { addr: SocketAddr },
    /// A valid datagram arrived.
    UnstableMessage {
        addr: SocketAddr,
        header: UnstablePacketHeader,
        payload: Bytes,
        /// Peer datagrams charged as lost so far.
        lost_receive_packets: u64,
        /// Our datagrams the peer never acknowledged so far.
        lost_sent_packets: u64,
    },
}

/// Receiver of transport events. Called from worker tasks; must not block.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: TransportEvent);
}

impl EventSink for mpsc::UnboundedSender<TransportEvent> {
    fn publish(&self, event: TransportEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: TransportEvent) {}
}

/// Buffered event queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<Vec<TransportEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an event into the queue.
    pub fn push(&self, event: TransportEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    /// Drains all queued events.
    pub fn drain(&self) -> Vec<TransportEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for EventQueue {
    fn publish(&self, event: TransportEvent) {
        self.push(event);
    }
}
