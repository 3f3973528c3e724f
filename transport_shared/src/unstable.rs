//! Sequencing and loss accounting for the datagram channel.
//!
//! Each side numbers its datagrams from 0. Every outgoing header tells the
//! peer which of *its* recent datagrams arrived (a 32-slot bitmap anchored at
//! the highest index seen), and every incoming header tells us the same about
//! ours. Nothing is retransmitted; the bitmaps only feed two loss counters.
//!
//! Loss charging: a contiguous run of missing indices is charged as a whole
//! once its newest member reaches the oldest slot of the window, i.e. when
//! `highest >= newest_missing + 31`. Late arrivals that fill part of a run
//! before then split the run and are never charged.
//!
//! Indices are assumed not to wrap within a session.

use std::collections::VecDeque;

use crate::packet::{UnstablePacketHeader, UNSTABLE_MAGIC};

/// Number of slots in the acknowledgement bitmap.
pub const WINDOW_SLOTS: u16 = 32;

/// Inclusive range of indices never seen and not yet charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MissingRun {
    first: u16,
    last: u16,
}

impl MissingRun {
    fn len(&self) -> u64 {
        u64::from(self.last - self.first) + 1
    }
}

/// Sliding receive window over one direction's sequence numbers.
#[derive(Debug, Clone, Default)]
pub struct SequenceWindow {
    latest: Option<u16>,
    bits: u32,
    runs: VecDeque<MissingRun>,
    lost: u64,
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest index recorded so far.
    pub fn latest(&self) -> Option<u16> {
        self.latest
    }

    /// Slot `k` is set when index `latest - k` was recorded.
    pub fn bitfield(&self) -> u32 {
        self.bits
    }

    /// Indices charged as lost so far.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Marks `index` as seen.
    ///
    /// Duplicates are no-ops; indices older than the window are ignored.
    pub fn record(&mut self, index: u16) {
        match self.latest {
            None => {
                if index > 0 {
                    self.runs.push_back(MissingRun {
                        first: 0,
                        last: index - 1,
                    });
                }
                self.latest = Some(index);
                self.bits = 1;
            }
            Some(latest) if index > latest => {
                let advance = index - latest;
                if advance > 1 {
                    self.runs.push_back(MissingRun {
                        first: latest + 1,
                        last: index - 1,
                    });
                }
                self.bits = if advance >= WINDOW_SLOTS {
                    1
                } else {
                    (self.bits << advance) | 1
                };
                self.latest = Some(index);
            }
            Some(latest) => {
                let slot = latest - index;
                if slot < WINDOW_SLOTS {
                    self.bits |= 1 << slot;
                    self.fill(index);
                }
            }
        }
        self.charge_expired_runs();
    }

    fn fill(&mut self, index: u16) {
        let Some(pos) = self
            .runs
            .iter()
            .position(|run| run.first <= index && index <= run.last)
        else {
            return;
        };
        let run = self.runs[pos];
        match (index == run.first, index == run.last) {
            (true, true) => {
                self.runs.remove(pos);
            }
            (true, false) => self.runs[pos].first = index + 1,
            (false, true) => self.runs[pos].last = index - 1,
            (false, false) => {
                self.runs[pos].last = index - 1;
                self.runs.insert(
                    pos + 1,
                    MissingRun {
                        first: index + 1,
                        last: run.last,
                    },
                );
            }
        }
    }

    fn charge_expired_runs(&mut self) {
        let Some(latest) = self.latest else {
            return;
        };
        while let Some(run) = self.runs.front() {
            if u32::from(run.last) + u32::from(WINDOW_SLOTS - 1) > u32::from(latest) {
                break;
            }
            self.lost += run.len();
            self.runs.pop_front();
        }
    }
}

/// Per-peer sequencing and loss state for the datagram channel.
///
/// Not synchronized: exactly one task owns a controller at a time.
#[derive(Debug, Clone, Default)]
pub struct UnstableConnectionController {
    next_packet_index: u16,
    /// Peer's datagrams we received.
    received: SequenceWindow,
    /// Our datagrams the peer reported as received.
    acknowledged: SequenceWindow,
}

impl UnstableConnectionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an incoming header.
    ///
    /// The packet index feeds the receive window. Acknowledgement data for
    /// our own sends, when present, feeds the sent-side window; claims about
    /// indices we never sent are ignored.
    pub fn proceed_received_packet_header(&mut self, header: &UnstablePacketHeader) -> bool {
        self.received.record(header.packet_index);

        if header.has_ack_data() {
            let last = header.last_received_packet_index;
            for slot in (0..WINDOW_SLOTS).rev() {
                if header.remote_receive_bitfield & (1 << slot) == 0 || slot > last {
                    continue;
                }
                let index = last - slot;
                if index < self.next_packet_index {
                    self.acknowledged.record(index);
                }
            }
        }
        true
    }

    /// Header for the next outgoing datagram.
    ///
    /// `data_size` is left at zero for the caller to fill in.
    pub fn get_next_packet_header(&mut self) -> UnstablePacketHeader {
        let packet_index = self.next_packet_index;
        self.next_packet_index = self.next_packet_index.wrapping_add(1);
        UnstablePacketHeader {
            magic: UNSTABLE_MAGIC,
            packet_index,
            data_size: 0,
            last_received_packet_index: self.received.latest().unwrap_or(0),
            remote_receive_bitfield: self.received.bitfield(),
            remote_ack_bitfield: self.acknowledged.bitfield(),
        }
    }

    /// Peer datagrams that never arrived.
    pub fn lost_receive_packets(&self) -> u64 {
        self.received.lost()
    }

    /// Our datagrams the peer never acknowledged.
    pub fn lost_sent_packets(&self) -> u64 {
        self.acknowledged.lost()
    }

    /// Index the next call to `get_next_packet_header` will use.
    pub fn next_packet_index(&self) -> u16 {
        self.next_packet_index
    }

    pub fn last_received_packet_index(&self) -> Option<u16> {
        self.received.latest()
    }
}
