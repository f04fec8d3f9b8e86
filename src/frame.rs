//! Wire frame and codec.
//!
//! One frame is exactly one UDP datagram payload. Binary layout (all fields
//! big-endian):
//!
//! ```text
//! +--------+--------+-------+-------------+----------+-- payload_len --+
//! |  seq   |  ack   | flags | payload_len | checksum |     payload     |
//! |  (4B)  |  (4B)  | (1B)  |    (2B)     |   (4B)   |                 |
//! +--------+--------+-------+-------------+----------+-----------------+
//! ```
//!
//! The checksum is CRC-32 over the canonical header image (checksum field
//! excluded, flags normalized) followed by the payload. The codec is the one
//! choke point where integrity is enforced: a frame that fails verification
//! never reaches the upper layers.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TautError};

/// Fixed header length in octets.
pub const HEADER_LEN: usize = 15;
/// Reference MTU for this transport: one frame never exceeds this.
pub const MTU: usize = 1024;
/// Maximum payload per frame.
pub const PAYLOAD_MAX: usize = MTU - HEADER_LEN;

/// Flags carried in the frame header.
///
/// Any combination is permitted. Bits 4-7 are reserved: zero on emit,
/// ignored (masked off) on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const NONE: Self = Self(0x00);
    pub const SYN: Self = Self(0x01);
    pub const ACK: Self = Self(0x02);
    pub const FIN: Self = Self(0x04);
    pub const DATA: Self = Self(0x08);

    const VALID_MASK: u8 = 0x0F;

    pub fn contains(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    fn normalized(self) -> u8 {
        self.0 & Self::VALID_MASK
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (flag, name) in [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::DATA, "DATA"),
        ] {
            if self.contains(flag) {
                if wrote {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                wrote = true;
            }
        }
        if !wrote {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// A single protocol unit, carried in one UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender's sequence number for this frame.
    pub seq: u32,
    /// Next expected sequence number from the peer (meaningful when ACK set).
    pub ack: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(seq: u32, payload: Bytes) -> Self {
        Self {
            seq,
            ack: 0,
            flags: FrameFlags::DATA,
            payload,
        }
    }

    /// A DATA segment that also carries end-of-stream.
    pub fn data_fin(seq: u32, payload: Bytes) -> Self {
        Self {
            seq,
            ack: 0,
            flags: FrameFlags::DATA | FrameFlags::FIN,
            payload,
        }
    }

    pub fn ack(seq: u32, ack: u32) -> Self {
        Self {
            seq,
            ack,
            flags: FrameFlags::ACK,
            payload: Bytes::new(),
        }
    }

    pub fn syn(seq: u32) -> Self {
        Self {
            seq,
            ack: 0,
            flags: FrameFlags::SYN,
            payload: Bytes::new(),
        }
    }

    pub fn syn_ack(seq: u32, ack: u32) -> Self {
        Self {
            seq,
            ack,
            flags: FrameFlags::SYN | FrameFlags::ACK,
            payload: Bytes::new(),
        }
    }

    pub fn fin(seq: u32) -> Self {
        Self {
            seq,
            ack: 0,
            flags: FrameFlags::FIN,
            payload: Bytes::new(),
        }
    }

    pub fn fin_ack(seq: u32, ack: u32) -> Self {
        Self {
            seq,
            ack,
            flags: FrameFlags::FIN | FrameFlags::ACK,
            payload: Bytes::new(),
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(FrameFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(FrameFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(FrameFlags::FIN)
    }

    pub fn is_data(&self) -> bool {
        self.flags.contains(FrameFlags::DATA)
    }

    /// CRC-32 over the canonical header image and the payload.
    pub fn checksum(&self) -> u32 {
        let mut hdr = [0u8; HEADER_LEN - 4];
        hdr[0..4].copy_from_slice(&self.seq.to_be_bytes());
        hdr[4..8].copy_from_slice(&self.ack.to_be_bytes());
        hdr[8] = self.flags.normalized();
        hdr[9..11].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&hdr);
        hasher.update(&self.payload);
        hasher.finalize()
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        self.encode_inner(self.checksum())
    }

    /// Serialize with a bogus checksum so the peer's decoder rejects the
    /// frame. Test-only corruption hook; the junk word comes from the
    /// caller's seeded RNG.
    pub fn encode_corrupted(&self, junk: u32) -> Result<Bytes> {
        let real = self.checksum();
        // The RNG may land on the real sum; force a mismatch.
        let junk = if junk == real { junk ^ 1 } else { junk };
        self.encode_inner(junk)
    }

    fn encode_inner(&self, checksum: u32) -> Result<Bytes> {
        if self.payload.len() > PAYLOAD_MAX {
            return Err(TautError::PayloadTooLarge {
                size: self.payload.len(),
                max: PAYLOAD_MAX,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.flags.normalized());
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(checksum);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse and verify one datagram payload.
    pub fn decode(data: &[u8]) -> Result<Frame> {
        if data.len() < HEADER_LEN {
            return Err(TautError::FrameTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut hdr = &data[..HEADER_LEN];
        let seq = hdr.get_u32();
        let ack = hdr.get_u32();
        let flags = FrameFlags(hdr.get_u8() & FrameFlags::VALID_MASK);
        let payload_len = hdr.get_u16() as usize;
        let checksum = hdr.get_u32();

        let body = &data[HEADER_LEN..];
        if body.len() < payload_len {
            return Err(TautError::FrameTooShort {
                expected: HEADER_LEN + payload_len,
                actual: data.len(),
            });
        }
        if body.len() > payload_len {
            tracing::warn!(
                declared = payload_len,
                trailing = body.len() - payload_len,
                "discarding trailing octets after declared payload"
            );
        }
        let payload = Bytes::copy_from_slice(&body[..payload_len]);

        let frame = Frame {
            seq,
            ack,
            flags,
            payload,
        };
        let computed = frame.checksum();
        if computed != checksum {
            return Err(TautError::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }
        Ok(frame)
    }
}
