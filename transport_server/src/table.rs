//! Per-processor connection tables.
//!
//! Every processor owns one table. The listener touches a table only to read
//! its size and to insert a freshly accepted connection; everything else
//! (readiness, stepping, reaping) happens on the owning processor.

use std::{
    collections::HashMap,
    future::poll_fn,
    net::SocketAddr,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    task::Poll,
    time::Duration,
};

use tokio::{net::TcpStream, sync::Notify};
use tracing::trace;
use transport_shared::event::{EventSink, TransportEvent};

use crate::connection::{ConnectionId, StableConnection, StableStream, StepOutcome};

/// Independently locked shard of stable connections.
pub struct ConnectionTable<S = TcpStream> {
    connections: RwLock<HashMap<ConnectionId, StableConnection<S>>>,
    inserted: Notify,
}

impl<S: StableStream> Default for ConnectionTable<S> {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            inserted: Notify::new(),
        }
    }
}

impl<S: StableStream> ConnectionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, StableConnection<S>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, StableConnection<S>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections currently held, closed ones included until reaped.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a connection and wakes the owning processor.
    pub fn insert(&self, connection: StableConnection<S>) -> ConnectionId {
        let id = connection.id();
        self.write().insert(id, connection);
        self.inserted.notify_one();
        id
    }

    /// Waits until at least one open connection is readable.
    ///
    /// Returns early with an empty set on timeout, on insert, or when there is
    /// nothing open to wait on.
    pub async fn wait_ready(&self, timeout: Duration) -> Vec<ConnectionId> {
        let snapshot: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(id, conn)| (*id, conn.stream().clone()))
            .collect();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let readiness = poll_fn(|cx| {
            let ready: Vec<ConnectionId> = snapshot
                .iter()
                .filter(|(_, stream)| stream.poll_read_ready(cx).is_ready())
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        });

        tokio::select! {
            biased;
            ready = readiness => ready,
            _ = self.inserted.notified() => Vec::new(),
            _ = tokio::time::sleep(timeout) => Vec::new(),
        }
    }

    /// Drops every closed connection and returns their addresses.
    pub fn reap_closed(&self) -> Vec<SocketAddr> {
        let mut connections = self.write();
        let mut reaped = Vec::new();
        connections.retain(|_, conn| {
            if conn.is_closed() {
                reaped.push(conn.address());
                false
            } else {
                true
            }
        });
        reaped
    }

    /// Advances each listed connection by one step, publishing completed
    /// frames. Returns how many frames completed.
    pub fn process_ready(&self, ready: &[ConnectionId], sink: &dyn EventSink) -> usize {
        let mut connections = self.write();
        let mut messages = 0;
        for id in ready {
            let Some(conn) = connections.get_mut(id) else {
                continue;
            };
            if conn.is_closed() {
                continue;
            }
            match conn.process() {
                StepOutcome::Message(payload) => {
                    trace!(addr = %conn.address(), len = payload.len(), "Stable message");
                    messages += 1;
                    sink.publish(TransportEvent::StableMessage {
                        addr: conn.address(),
                        payload,
                    });
                }
                StepOutcome::HeaderComplete { data_size } => {
                    trace!(addr = %conn.address(), data_size, "Stable header");
                }
                StepOutcome::Pending | StepOutcome::Closed(_) => {}
            }
        }
        messages
    }

    /// Removes every connection regardless of state.
    pub fn close_all(&self) -> Vec<SocketAddr> {
        self.write()
            .drain()
            .map(|(_, conn)| conn.address())
            .collect()
    }
}
