//! Wire headers for both channels.
//!
//! Both headers are fixed-size and big-endian. Callers buffer `SIZE` bytes
//! before calling `parse`; anything shorter is a framing error.
//!
//! Unstable header layout (16 bytes):
//!
//! ```text
//! 0      2             4           6                     8
//! +------+-------------+-----------+---------------------+
//! | magic| packet_index| data_size | last_received_index |
//! +------+-------------+-----------+---------------------+
//! | remote_receive_bitfield (u32) | remote_ack_bitfield (u32) |
//! +-------------------------------+---------------------------+
//! ```
//!
//! Stable header layout (4 bytes): `data_size` as u32.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Sentinel opening every datagram.
pub const UNSTABLE_MAGIC: u16 = 0xDDFF;

/// Header prepended to every datagram.
///
/// The last three fields carry acknowledgement state for the reverse
/// direction; a header built by hand for a single send leaves them zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnstablePacketHeader {
    pub magic: u16,
    pub packet_index: u16,
    pub data_size: u16,
    pub last_received_packet_index: u16,
    pub remote_receive_bitfield: u32,
    pub remote_ack_bitfield: u32,
}

impl UnstablePacketHeader {
    pub const SIZE: usize = 16;

    /// Plain header for `packet_index` carrying no acknowledgement data.
    pub fn new(packet_index: u16, data_size: u16) -> Self {
        Self {
            magic: UNSTABLE_MAGIC,
            packet_index,
            data_size,
            ..Default::default()
        }
    }

    pub fn parse(mut bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            magic: bytes.get_u16(),
            packet_index: bytes.get_u16(),
            data_size: bytes.get_u16(),
            last_received_packet_index: bytes.get_u16(),
            remote_receive_bitfield: bytes.get_u32(),
            remote_ack_bitfield: bytes.get_u32(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u16(self.magic);
        buf.put_u16(self.packet_index);
        buf.put_u16(self.data_size);
        buf.put_u16(self.last_received_packet_index);
        buf.put_u32(self.remote_receive_bitfield);
        buf.put_u32(self.remote_ack_bitfield);
    }

    /// True when the header carries acknowledgement data for our sends.
    ///
    /// A peer always has bit 0 set once it has received anything, so an all
    /// zero bitfield means "nothing to report".
    pub fn has_ack_data(&self) -> bool {
        self.remote_receive_bitfield != 0
    }
}

/// Length prefix of one stable frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StablePacketHeader {
    pub data_size: u32,
}

impl StablePacketHeader {
    pub const SIZE: usize = 4;

    pub fn parse(mut bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            data_size: bytes.get_u32(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32(self.data_size);
    }
}

/// Builds one stable frame: length prefix followed by `payload`.
///
/// Fails with `Oversized` when the length does not fit the `u32` prefix.
pub fn encode_stable_frame(payload: &[u8]) -> ProtocolResult<Bytes> {
    let data_size = u32::try_from(payload.len()).map_err(|_| ProtocolError::Oversized {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(StablePacketHeader::SIZE + payload.len());
    StablePacketHeader { data_size }.write(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Builds one datagram: `header` followed by `payload`.
///
/// `header.data_size` is overwritten with the payload length, which must fit
/// its `u16` field.
pub fn encode_datagram(
    mut header: UnstablePacketHeader,
    payload: &[u8],
) -> ProtocolResult<Bytes> {
    header.data_size = u16::try_from(payload.len()).map_err(|_| ProtocolError::Oversized {
        size: payload.len(),
        max: u16::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(UnstablePacketHeader::SIZE + payload.len());
    header.write(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Splits a received datagram into its header and payload.
///
/// Rejects wrong magic, a declared size above `max_payload`, and a declared
/// size that does not match the bytes present.
pub fn decode_datagram(
    datagram: &[u8],
    max_payload: usize,
) -> ProtocolResult<(UnstablePacketHeader, &[u8])> {
    let header = UnstablePacketHeader::parse(datagram)?;
    if header.magic != UNSTABLE_MAGIC {
        return Err(ProtocolError::BadMagic {
            expected: UNSTABLE_MAGIC,
            got: header.magic,
        });
    }
    let declared = header.data_size as usize;
    if declared > max_payload {
        return Err(ProtocolError::Oversized {
            size: declared,
            max: max_payload,
        });
    }
    let body = &datagram[UnstablePacketHeader::SIZE..];
    if body.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            available: body.len(),
        });
    }
    Ok((header, body))
}
