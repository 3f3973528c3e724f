//! Client side of both channels.
//!
//! - `StableClient`: TCP stream, one length-prefixed frame per message.
//! - `UnstableClient`: connected UDP socket with its own sequence controller,
//!   so acknowledgement data flows back to the peer on every send.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, trace};
use transport_shared::{
    config::{DEFAULT_MAX_STABLE_PACKET_SIZE, DEFAULT_MAX_UNSTABLE_PACKET_SIZE},
    packet::{
        decode_datagram, encode_datagram, encode_stable_frame, StablePacketHeader,
        UnstablePacketHeader,
    },
    unstable::UnstableConnectionController,
};

/// Length-framed stream client.
pub struct StableClient {
    stream: TcpStream,
    max_packet_size: u32,
}

impl StableClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("set_nodelay")?;
        debug!(server = %addr, "Stable channel connected");
        Ok(Self {
            stream,
            max_packet_size: DEFAULT_MAX_STABLE_PACKET_SIZE,
        })
    }

    /// Largest frame `recv` accepts.
    pub fn with_max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Sends one frame.
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let frame = encode_stable_frame(payload)?;
        self.stream.write_all(&frame).await.context("tcp write")?;
        trace!(len = payload.len(), "Stable frame sent");
        Ok(())
    }

    /// Writes raw bytes with no framing, for exercising a peer's parser.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await.context("tcp write")?;
        Ok(())
    }

    /// Reads one frame.
    pub async fn recv(&mut self) -> anyhow::Result<Bytes> {
        let mut header = [0u8; StablePacketHeader::SIZE];
        self.stream
            .read_exact(&mut header)
            .await
            .context("tcp read header")?;
        let header = StablePacketHeader::parse(&header)?;
        if header.data_size > self.max_packet_size {
            bail!(
                "frame of {} bytes exceeds limit {}",
                header.data_size,
                self.max_packet_size
            );
        }
        let mut payload = vec![0u8; header.data_size as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        Ok(Bytes::from(payload))
    }

    /// Half-closes the write side; the peer sees end of stream.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.stream.shutdown().await.context("tcp shutdown")?;
        Ok(())
    }
}

/// Sequenced datagram client.
pub struct UnstableClient {
    socket: UdpSocket,
    peer: SocketAddr,
    controller: UnstableConnectionController,
    max_packet_size: usize,
}

impl UnstableClient {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self {
            socket,
            peer,
            controller: UnstableConnectionController::new(),
            max_packet_size: DEFAULT_MAX_UNSTABLE_PACKET_SIZE,
        })
    }

    /// Largest datagram, header included, `send` and `recv_timeout` allow.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn controller(&self) -> &UnstableConnectionController {
        &self.controller
    }

    fn max_payload(&self) -> usize {
        self.max_packet_size
            .saturating_sub(UnstablePacketHeader::SIZE)
    }

    /// Sends `payload` under the next packet index and returns the header
    /// that went out.
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<UnstablePacketHeader> {
        if payload.len() > self.max_payload() {
            bail!(
                "payload of {} bytes exceeds datagram limit {}",
                payload.len(),
                self.max_payload()
            );
        }
        let mut header = self.controller.get_next_packet_header();
        let datagram = encode_datagram(header, payload)?;
        header.data_size = payload.len() as u16;
        self.socket.send(&datagram).await.context("udp send")?;
        trace!(packet_index = header.packet_index, len = payload.len(), "Datagram sent");
        Ok(header)
    }

    /// Consumes the next packet index without sending anything.
    pub fn skip(&mut self) -> UnstablePacketHeader {
        self.controller.get_next_packet_header()
    }

    /// Sends arbitrary bytes, bypassing the controller.
    pub async fn send_raw(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send(datagram).await.context("udp send")?;
        Ok(())
    }

    /// Receives one datagram within `timeout` and records its header.
    ///
    /// Returns `Ok(None)` on timeout. Malformed datagrams are errors.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<Option<(UnstablePacketHeader, Bytes)>> {
        let mut buf = vec![0u8; self.max_packet_size + 1];
        let n = match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(received) => received.context("udp recv")?,
            Err(_) => return Ok(None),
        };
        if n > self.max_packet_size {
            bail!("datagram exceeds limit {}", self.max_packet_size);
        }
        let (header, payload) = decode_datagram(&buf[..n], self.max_payload())?;
        self.controller.proceed_received_packet_header(&header);
        Ok(Some((header, Bytes::copy_from_slice(payload))))
    }

    pub fn lost_receive_packets(&self) -> u64 {
        self.controller.lost_receive_packets()
    }

    pub fn lost_sent_packets(&self) -> u64 {
        self.controller.lost_sent_packets()
    }
}
