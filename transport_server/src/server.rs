//! Server implementation.
//!
//! One listener worker owns both listening sockets:
//! - TCP: accepted streams become `StableConnection`s handed to the
//!   least-loaded processor table.
//! - UDP: each datagram is validated, fed to its peer's sequence controller
//!   and published. Replies queued through `Server::send_unstable` go out on
//!   the same socket, stamped by that peer's controller.
//!
//! `stable_threads` processor workers each own one `ConnectionTable` and
//! drive the read state machines of its connections.
//!
//! Every loop checks the shared running flag once per iteration and never
//! waits longer than `poll_timeout`, so `stop()` returns within about one
//! timeout.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    sync::mpsc,
};
use tracing::{debug, info, trace, warn};
use transport_shared::{
    config::TransportConfig,
    event::{EventSink, TransportEvent},
    packet::{decode_datagram, encode_datagram, UnstablePacketHeader},
    pool::{PoolKind, WorkerPool},
    unstable::UnstableConnectionController,
};

use crate::{connection::StableConnection, table::ConnectionTable};

const LISTEN_BACKLOG: u32 = 1024;

/// Transport server.
pub struct Server {
    cfg: TransportConfig,
    sink: Arc<dyn EventSink>,
    running: Arc<AtomicBool>,
    workers: WorkerPool,
    tables: Vec<Arc<ConnectionTable>>,
    stable_addr: Option<SocketAddr>,
    unstable_addr: Option<SocketAddr>,
    outgoing: Option<mpsc::UnboundedSender<OutgoingDatagram>>,
}

impl Server {
    /// Creates a stopped server. Nothing is bound until `start`.
    pub fn new(cfg: TransportConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            cfg,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            workers: WorkerPool::new(),
            tables: Vec::new(),
            stable_addr: None,
            unstable_addr: None,
            outgoing: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bound stream address while running.
    pub fn stable_addr(&self) -> Option<SocketAddr> {
        self.stable_addr
    }

    /// Bound datagram address while running.
    pub fn unstable_addr(&self) -> Option<SocketAddr> {
        self.unstable_addr
    }

    /// Stream connections currently held across all processor tables.
    pub fn connection_count(&self) -> usize {
        self.tables.iter().map(|table| table.len()).sum()
    }

    /// Connections held by each processor table, in worker order.
    pub fn table_sizes(&self) -> Vec<usize> {
        self.tables.iter().map(|table| table.len()).collect()
    }

    fn max_unstable_payload(&self) -> usize {
        self.cfg
            .max_unstable_packet_size
            .saturating_sub(UnstablePacketHeader::SIZE)
    }

    /// Queues `payload` for the datagram peer at `addr`.
    ///
    /// The listener stamps it with the next header from that peer's
    /// controller, which tells the peer which of its datagrams arrived.
    pub fn send_unstable(&self, addr: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
        let Some(outgoing) = self.outgoing.as_ref().filter(|_| self.is_running()) else {
            bail!("server is not running");
        };
        if payload.len() > self.max_unstable_payload() {
            bail!(
                "payload of {} bytes exceeds datagram limit {}",
                payload.len(),
                self.max_unstable_payload()
            );
        }
        outgoing
            .send(OutgoingDatagram {
                addr,
                payload: Bytes::copy_from_slice(payload),
            })
            .map_err(|_| anyhow!("listener has stopped"))
    }

    /// Live listener and processor workers.
    pub fn worker_count(&self) -> usize {
        self.workers.total_workers()
    }

    /// Binds both sockets and launches the listener and `stable_threads`
    /// processors. On any failure nothing stays bound or running.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        &mut self,
        udp_port: u16,
        tcp_port: u16,
        stable_threads: usize,
    ) -> anyhow::Result<()> {
        if self.is_running() {
            bail!("server already running");
        }
        if stable_threads == 0 {
            bail!("at least one stable processor is required");
        }

        if let Err(e) = self.launch(udp_port, tcp_port, stable_threads) {
            self.rollback().await;
            return Err(e);
        }
        Ok(())
    }

    /// `start` with ports and processor count taken from the config.
    pub async fn start_from_config(&mut self) -> anyhow::Result<()> {
        let (udp_port, tcp_port, threads) =
            (self.cfg.udp_port, self.cfg.tcp_port, self.cfg.stable_threads);
        self.start(udp_port, tcp_port, threads).await
    }

    fn launch(
        &mut self,
        udp_port: u16,
        tcp_port: u16,
        stable_threads: usize,
    ) -> anyhow::Result<()> {
        let udp_bind = SocketAddr::new(self.cfg.bind_ip, udp_port);
        let udp = bind_unstable(udp_bind).with_context(|| format!("udp bind {udp_bind}"))?;
        let tcp_bind = SocketAddr::new(self.cfg.bind_ip, tcp_port);
        let tcp = bind_stable(tcp_bind).with_context(|| format!("tcp bind {tcp_bind}"))?;

        let unstable_addr = udp.local_addr().context("udp local_addr")?;
        let stable_addr = tcp.local_addr().context("tcp local_addr")?;

        self.tables = (0..stable_threads)
            .map(|_| Arc::new(ConnectionTable::new()))
            .collect();
        self.workers.start_pool(PoolKind::Listener, 1)?;
        self.workers
            .start_pool(PoolKind::StableProcessor, stable_threads)?;
        self.running.store(true, Ordering::Release);

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let listener = Listener {
            cfg: self.cfg.clone(),
            udp,
            tcp,
            tables: self.tables.clone(),
            running: self.running.clone(),
            sink: self.sink.clone(),
            peers: HashMap::new(),
            outgoing: outgoing_rx,
        };
        self.workers.push(PoolKind::Listener, listener.run())?;

        for (worker, table) in self.tables.iter().enumerate() {
            let processor = Processor {
                worker,
                table: table.clone(),
                running: self.running.clone(),
                sink: self.sink.clone(),
                poll_timeout: self.cfg.poll_timeout(),
                idle_sleep: self.cfg.idle_sleep(),
            };
            self.workers
                .push(PoolKind::StableProcessor, processor.run())?;
        }

        self.stable_addr = Some(stable_addr);
        self.unstable_addr = Some(unstable_addr);
        self.outgoing = Some(outgoing_tx);
        info!(%stable_addr, %unstable_addr, stable_threads, "Server started");
        Ok(())
    }

    async fn rollback(&mut self) {
        self.running.store(false, Ordering::Release);
        for kind in [PoolKind::Listener, PoolKind::StableProcessor] {
            if self.workers.worker_count(kind).is_none() {
                continue;
            }
            if let Err(e) = self.workers.stop_pool(kind).await {
                warn!(%kind, error = %e, "Failed to stop worker pool");
            }
        }
        self.tables.clear();
        self.stable_addr = None;
        self.unstable_addr = None;
        self.outgoing = None;
    }

    /// Signals every worker to exit, waits for them, and releases sockets and
    /// tables.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if !self.is_running() {
            bail!("server is not running");
        }
        self.running.store(false, Ordering::Release);

        self.workers.join_pool(PoolKind::Listener).await?;
        self.workers.join_pool(PoolKind::StableProcessor).await?;

        self.tables.clear();
        self.stable_addr = None;
        self.unstable_addr = None;
        self.outgoing = None;
        info!("Server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Dropping the pool aborts any worker still alive.
        self.running.store(false, Ordering::Release);
    }
}

fn bind_unstable(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

fn bind_stable(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Datagram handed from `Server::send_unstable` to the listener.
struct OutgoingDatagram {
    addr: SocketAddr,
    payload: Bytes,
}

/// Datagram peer session owned by the listener.
struct UnstablePeer {
    controller: UnstableConnectionController,
    last_seen: Instant,
}

impl UnstablePeer {
    fn session(peers: &mut HashMap<SocketAddr, UnstablePeer>, addr: SocketAddr) -> &mut Self {
        peers.entry(addr).or_insert_with(|| {
            debug!(%addr, "Unstable peer session started");
            UnstablePeer {
                controller: UnstableConnectionController::new(),
                last_seen: Instant::now(),
            }
        })
    }
}

/// Accept and datagram loop.
struct Listener {
    cfg: TransportConfig,
    udp: UdpSocket,
    tcp: TcpListener,
    tables: Vec<Arc<ConnectionTable>>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
    peers: HashMap<SocketAddr, UnstablePeer>,
    outgoing: mpsc::UnboundedReceiver<OutgoingDatagram>,
}

impl Listener {
    async fn run(mut self) {
        let poll_timeout = self.cfg.poll_timeout();
        // One spare byte detects datagrams the kernel had to truncate.
        let mut buf = vec![0u8; self.cfg.max_unstable_packet_size + 1];
        let mut last_sweep = Instant::now();
        debug!("Listener started");

        while self.running.load(Ordering::Acquire) {
            tokio::select! {
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, addr)) => self.assign(stream, addr),
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
                received = self.udp.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from),
                    Err(e) => debug!(error = %e, "UDP receive failed"),
                },
                Some(outgoing) = self.outgoing.recv() => self.send_datagram(outgoing).await,
                _ = tokio::time::sleep(poll_timeout) => {}
            }

            if last_sweep.elapsed() >= poll_timeout {
                self.expire_peers();
                last_sweep = Instant::now();
            }
        }
        debug!(peers = self.peers.len(), "Listener stopped");
    }

    fn assign(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        // Sizes are read one lock at a time; a concurrent reap may make the
        // pick momentarily non-minimal, which is harmless.
        let Some((worker, table)) = self
            .tables
            .iter()
            .enumerate()
            .min_by_key(|(_, table)| table.len())
        else {
            return;
        };

        self.sink.publish(TransportEvent::StableConnected { addr });
        table.insert(StableConnection::new(
            addr,
            stream,
            self.cfg.max_stable_packet_size,
        ));
        info!(%addr, worker, "Stable connection accepted");
    }

    fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() > self.cfg.max_unstable_packet_size {
            warn!(
                %from,
                len = datagram.len(),
                max = self.cfg.max_unstable_packet_size,
                "Dropping oversized datagram"
            );
            return;
        }
        let max_payload = self
            .cfg
            .max_unstable_packet_size
            .saturating_sub(UnstablePacketHeader::SIZE);
        let (header, payload) = match decode_datagram(datagram, max_payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(%from, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        let peer = UnstablePeer::session(&mut self.peers, from);
        peer.last_seen = Instant::now();
        peer.controller.proceed_received_packet_header(&header);

        self.sink.publish(TransportEvent::UnstableMessage {
            addr: from,
            header,
            payload: Bytes::copy_from_slice(payload),
            lost_receive_packets: peer.controller.lost_receive_packets(),
            lost_sent_packets: peer.controller.lost_sent_packets(),
        });
    }

    async fn send_datagram(&mut self, outgoing: OutgoingDatagram) {
        let OutgoingDatagram { addr, payload } = outgoing;
        let header = UnstablePeer::session(&mut self.peers, addr)
            .controller
            .get_next_packet_header();
        let datagram = match encode_datagram(header, &payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(%addr, error = %e, "Dropping outgoing datagram");
                return;
            }
        };
        match self.udp.send_to(&datagram, addr).await {
            Ok(_) => trace!(%addr, packet_index = header.packet_index, "Datagram sent"),
            Err(e) => debug!(%addr, error = %e, "UDP send failed"),
        }
    }

    fn expire_peers(&mut self) {
        let timeout = self.cfg.unstable_peer_timeout();
        self.peers.retain(|addr, peer| {
            let alive = peer.last_seen.elapsed() < timeout;
            if !alive {
                debug!(
                    %addr,
                    lost_receive = peer.controller.lost_receive_packets(),
                    lost_sent = peer.controller.lost_sent_packets(),
                    "Unstable peer session expired"
                );
            }
            alive
        });
    }
}

/// Readiness loop over one connection table.
struct Processor {
    worker: usize,
    table: Arc<ConnectionTable>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
    poll_timeout: Duration,
    idle_sleep: Duration,
}

impl Processor {
    async fn run(self) {
        debug!(worker = self.worker, "Stable processor started");

        while self.running.load(Ordering::Acquire) {
            for addr in self.table.reap_closed() {
                info!(%addr, worker = self.worker, "Stable connection closed");
                self.sink
                    .publish(TransportEvent::StableDisconnected { addr });
            }

            let ready = self.table.wait_ready(self.poll_timeout).await;
            if ready.is_empty() {
                if self.table.is_empty() {
                    tokio::time::sleep(self.idle_sleep).await;
                }
                continue;
            }
            self.table.process_ready(&ready, self.sink.as_ref());
        }

        for addr in self.table.close_all() {
            self.sink
                .publish(TransportEvent::StableDisconnected { addr });
        }
        debug!(worker = self.worker, "Stable processor stopped");
    }
}
