//! Stable (stream) connection.
//!
//! A connection alternates between waiting for a 4-byte length prefix and
//! waiting for the body it declares:
//!
//! ```text
//! Initial --header complete--> ReadingBody --body complete--> Initial
//!    \                              \
//!     +---- close / EOF / oversized / I/O error ----> closed
//! ```
//!
//! Each `process` call performs at most one non-blocking read, so a partial
//! header or body simply stays buffered until the next readiness cycle.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use transport_shared::{error::ProtocolError, packet::StablePacketHeader};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an accepted stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Non-blocking byte source behind a stable connection.
pub trait StableStream: Send + Sync + 'static {
    /// Reads what is available without waiting; `WouldBlock` when nothing is.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Registers interest in read readiness.
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl StableStream for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }
}

/// Position in the frame being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the length prefix.
    Initial,
    /// Waiting for `header.data_size` body bytes.
    ReadingBody,
}

/// Why a connection left service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Local,
    /// The peer shut down its side (zero-byte read).
    PeerDisconnected,
    /// The peer violated framing.
    Protocol(ProtocolError),
    /// The socket reported an error.
    Io(io::ErrorKind),
}

/// Result of one `process` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived, or only part of a header/body.
    Pending,
    /// A length prefix was decoded; the body comes next.
    HeaderComplete { data_size: u32 },
    /// A full frame body.
    Message(Bytes),
    /// The connection closed during this step.
    Closed(CloseReason),
}

/// One accepted stream connection and its framing state.
pub struct StableConnection<S = TcpStream> {
    id: ConnectionId,
    address: SocketAddr,
    stream: Arc<S>,
    buffer: BytesMut,
    header: StablePacketHeader,
    state: ReadState,
    closed: bool,
    max_packet_size: u32,
}

impl<S: StableStream> StableConnection<S> {
    pub fn new(address: SocketAddr, stream: S, max_packet_size: u32) -> Self {
        Self {
            id: ConnectionId::new_unique(),
            address,
            stream: Arc::new(stream),
            buffer: BytesMut::with_capacity(StablePacketHeader::SIZE),
            header: StablePacketHeader::default(),
            state: ReadState::Initial,
            closed: false,
            max_packet_size,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Last decoded length prefix.
    pub fn header(&self) -> StablePacketHeader {
        self.header
    }

    /// Bytes of the current header or body buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stream(&self) -> &Arc<S> {
        &self.stream
    }

    /// Marks the connection closed. The owning processor drops the socket
    /// when it next reaps its table.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Advances the read state machine by one step.
    pub fn process(&mut self) -> StepOutcome {
        if self.closed {
            return StepOutcome::Closed(CloseReason::Local);
        }
        match self.state {
            ReadState::Initial => self.read_header(),
            ReadState::ReadingBody => self.read_body(),
        }
    }

    fn read_header(&mut self) -> StepOutcome {
        let want = StablePacketHeader::SIZE - self.buffer.len();
        if let Err(reason) = self.read_some(want) {
            return self.fail(reason);
        }
        if self.buffer.len() < StablePacketHeader::SIZE {
            return StepOutcome::Pending;
        }

        let header = match StablePacketHeader::parse(&self.buffer) {
            Ok(header) => header,
            Err(e) => return self.fail(CloseReason::Protocol(e)),
        };
        if header.data_size > self.max_packet_size {
            return self.fail(CloseReason::Protocol(ProtocolError::Oversized {
                size: header.data_size as usize,
                max: self.max_packet_size as usize,
            }));
        }

        self.header = header;
        self.buffer.clear();
        self.state = ReadState::ReadingBody;
        StepOutcome::HeaderComplete {
            data_size: header.data_size,
        }
    }

    fn read_body(&mut self) -> StepOutcome {
        let size = self.header.data_size as usize;
        if self.buffer.len() < size {
            if let Err(reason) = self.read_some(size - self.buffer.len()) {
                return self.fail(reason);
            }
            if self.buffer.len() < size {
                return StepOutcome::Pending;
            }
        }

        let payload = self.buffer.split().freeze();
        self.header = StablePacketHeader::default();
        self.state = ReadState::Initial;
        StepOutcome::Message(payload)
    }

    /// One non-blocking read of at most `want` bytes appended to the buffer.
    fn read_some(&mut self, want: usize) -> Result<(), CloseReason> {
        let start = self.buffer.len();
        self.buffer.resize(start + want, 0);
        let result = self.stream.try_read(&mut self.buffer[start..]);
        match result {
            Ok(0) => {
                self.buffer.truncate(start);
                Err(CloseReason::PeerDisconnected)
            }
            Ok(n) => {
                self.buffer.truncate(start + n);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.buffer.truncate(start);
                Ok(())
            }
            Err(e) => {
                self.buffer.truncate(start);
                Err(CloseReason::Io(e.kind()))
            }
        }
    }

    fn fail(&mut self, reason: CloseReason) -> StepOutcome {
        match &reason {
            CloseReason::PeerDisconnected | CloseReason::Local => {
                debug!(addr = %self.address, "Stable connection closed by peer");
            }
            CloseReason::Protocol(e) => {
                warn!(addr = %self.address, error = %e, "Stable connection protocol violation");
            }
            CloseReason::Io(kind) => {
                warn!(addr = %self.address, ?kind, "Stable connection I/O error");
            }
        }
        self.closed = true;
        self.buffer.clear();
        StepOutcome::Closed(reason)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Mutex};
    use transport_shared::packet::encode_stable_frame;

    /// Scripted in-memory stream.
    #[derive(Default)]
    pub(crate) struct ScriptedStream {
        script: Mutex<VecDeque<ScriptedRead>>,
        reads: AtomicU64,
    }

    pub(crate) enum ScriptedRead {
        Data(Vec<u8>),
        WouldBlock,
        Eof,
        Error(io::ErrorKind),
    }

    impl ScriptedStream {
        pub(crate) fn new(script: impl IntoIterator<Item = ScriptedRead>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                reads: AtomicU64::new(0),
            }
        }

        fn reads(&self) -> u64 {
            self.reads.load(Ordering::SeqCst)
        }

        fn remaining_bytes(&self) -> usize {
            self.script
                .lock()
                .unwrap()
                .iter()
                .map(|r| match r {
                    ScriptedRead::Data(d) => d.len(),
                    _ => 0,
                })
                .sum()
        }
    }

    impl StableStream for ScriptedStream {
        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                None | Some(ScriptedRead::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(ScriptedRead::Eof) => Ok(0),
                Some(ScriptedRead::Error(kind)) => Err(kind.into()),
                Some(ScriptedRead::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        script.push_front(ScriptedRead::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn poll_read_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if self.script.lock().unwrap().is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(Ok(()))
            }
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn connection(script: Vec<ScriptedRead>, max: u32) -> StableConnection<ScriptedStream> {
        StableConnection::new(addr(), ScriptedStream::new(script), max)
    }

    #[test]
    fn fragmented_frame_is_reassembled_once() {
        let frame = encode_stable_frame(b"hello world").unwrap();
        let mut script = Vec::new();
        for byte in frame.iter() {
            script.push(ScriptedRead::Data(vec![*byte]));
            script.push(ScriptedRead::WouldBlock);
        }
        let mut conn = connection(script, 1024);

        let mut messages = Vec::new();
        let mut header_seen = false;
        for _ in 0..100 {
            match conn.process() {
                StepOutcome::Pending => {
                    if !header_seen {
                        assert_eq!(conn.state(), ReadState::Initial);
                    }
                }
                StepOutcome::HeaderComplete { data_size } => {
                    assert!(!header_seen);
                    header_seen = true;
                    assert_eq!(data_size, 11);
                    assert_eq!(conn.state(), ReadState::ReadingBody);
                    assert_eq!(conn.buffered(), 0);
                }
                StepOutcome::Message(payload) => messages.push(payload),
                StepOutcome::Closed(reason) => panic!("unexpected close: {reason:?}"),
            }
        }

        assert_eq!(messages, vec![Bytes::from_static(b"hello world")]);
        assert_eq!(conn.state(), ReadState::Initial);
        assert!(!conn.is_closed());
    }

    #[test]
    fn back_to_back_frames_in_one_chunk() {
        let mut bytes = encode_stable_frame(b"one").unwrap().to_vec();
        bytes.extend_from_slice(&encode_stable_frame(b"two").unwrap());
        let mut conn = connection(vec![ScriptedRead::Data(bytes)], 1024);

        let outcomes: Vec<StepOutcome> = (0..5).map(|_| conn.process()).collect();
        assert_eq!(
            outcomes,
            vec![
                StepOutcome::HeaderComplete { data_size: 3 },
                StepOutcome::Message(Bytes::from_static(b"one")),
                StepOutcome::HeaderComplete { data_size: 3 },
                StepOutcome::Message(Bytes::from_static(b"two")),
                StepOutcome::Pending,
            ]
        );
    }

    #[test]
    fn oversized_header_closes_without_reading_body() {
        let mut header = BytesMut::new();
        StablePacketHeader { data_size: 101 }.write(&mut header);
        let stream_script = vec![
            ScriptedRead::Data(header.to_vec()),
            ScriptedRead::Data(vec![0u8; 101]),
        ];
        let mut conn = connection(stream_script, 100);

        let outcome = conn.process();
        assert_eq!(
            outcome,
            StepOutcome::Closed(CloseReason::Protocol(ProtocolError::Oversized {
                size: 101,
                max: 100
            }))
        );
        assert!(conn.is_closed());
        assert_eq!(conn.stream().reads(), 1);
        assert_eq!(conn.stream().remaining_bytes(), 101);

        assert_eq!(conn.process(), StepOutcome::Closed(CloseReason::Local));
        assert_eq!(conn.stream().reads(), 1);
    }

    #[test]
    fn zero_byte_read_means_peer_disconnected() {
        let mut conn = connection(
            vec![ScriptedRead::Data(vec![0, 0]), ScriptedRead::Eof],
            1024,
        );
        assert_eq!(conn.process(), StepOutcome::Pending);
        assert_eq!(conn.buffered(), 2);
        assert_eq!(
            conn.process(),
            StepOutcome::Closed(CloseReason::PeerDisconnected)
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn socket_error_closes() {
        let mut conn = connection(
            vec![ScriptedRead::Error(io::ErrorKind::ConnectionReset)],
            1024,
        );
        assert_eq!(
            conn.process(),
            StepOutcome::Closed(CloseReason::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn empty_frame_completes_without_reading() {
        let mut conn = connection(vec![ScriptedRead::Data(vec![0, 0, 0, 0])], 1024);
        assert_eq!(
            conn.process(),
            StepOutcome::HeaderComplete { data_size: 0 }
        );
        assert_eq!(conn.process(), StepOutcome::Message(Bytes::new()));
        assert_eq!(conn.stream().reads(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut conn = connection(Vec::new(), 1024);
        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.address(), addr());
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = connection(Vec::new(), 1);
        let b = connection(Vec::new(), 1);
        assert_ne!(a.id(), b.id());
    }
}
