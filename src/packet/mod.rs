// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C1: packet codec.
//!
//! A single parse step produces a tagged [`Packet`] rather than scattering
//! pointer casts over the wire bytes the way the reference implementation
//! does; `kind` records which on-wire shape the packet arrived in so
//! [`Packet::encode`] can round-trip it.

pub mod crc;
pub mod header;
pub mod scramble;

use header::{
    CompressedHeader, FullHeader, PacketFlags, ShortHeader, COMPRESSED_HEADER_LEN,
    FULL_HEADER_LEN, SHORT_HEADER_LEN,
};
use num_enum::{IntoPrimitive, TryFromPrimitiveError};

use crate::error::PacketError;

/// Maximum size, including header, of a single framed radio packet.
pub const MAX_PACKET_TOTAL_SIZE: usize = 2048;

/// Number of distinct logical streams, including the compressed-header
/// pseudo-stream.
pub const MAX_RADIO_STREAMS: usize = 8;

/// The fixed set of logical streams multiplexed in `stream_packet_idx`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive)]
#[repr(u32)]
pub enum StreamId {
    Control = 0,
    Telemetry = 1,
    VideoData = 2,
    VideoRetransmit = 3,
    Audio = 4,
    Ping = 5,
    Data = 6,
    /// Pseudo-stream used by every compressed-header packet.
    Compressed = 7,
}

impl StreamId {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Control,
            1 => Self::Telemetry,
            2 => Self::VideoData,
            3 => Self::VideoRetransmit,
            4 => Self::Audio,
            5 => Self::Ping,
            6 => Self::Data,
            _ => Self::Compressed,
        }
    }
}

/// Packet types referenced directly by the radio link layer. Payload-level
/// types beyond these are opaque to this crate and pass through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    RubyPingClock = 1,
    RubyPingClockReply = 2,
    RubyPairingRequest = 3,
    TestRadioLink = 4,
    SikConfig = 5,
    Telemetry = 10,
    VideoData = 11,
    VideoRetransmitRequest = 12,
    Data = 13,
    Control = 14,
    Audio = 15,
    Rc = 16,
}

impl PacketType {
    /// Pings, retransmit requests, and control traffic take the high-priority
    /// RX queue; everything else takes the regular queue.
    pub fn is_high_priority(self) -> bool {
        matches!(
            self,
            Self::RubyPingClock
                | Self::RubyPingClockReply
                | Self::RubyPairingRequest
                | Self::VideoRetransmitRequest
                | Self::Control
                | Self::Rc
        )
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::try_from(raw).ok()
    }
}

/// Which on-wire shape a decoded [`Packet`] arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderKind {
    Full(FullHeader),
    Compressed(CompressedHeader),
}

/// A fully decoded packet: header fields plus the byte range of its payload
/// within the buffer it was parsed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: HeaderKind,
    pub packet_type: u8,
    pub stream_id: u32,
    pub packet_index: u32,
    pub vehicle_id_src: u32,
    pub vehicle_id_dest: u32,
    pub total_length: usize,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn is_compressed(&self) -> bool {
        matches!(self.kind, HeaderKind::Compressed(_))
    }

    pub fn retransmit(&self) -> bool {
        match self.kind {
            HeaderKind::Full(h) => h.packet_flags.contains(PacketFlags::RETRANSMIT),
            HeaderKind::Compressed(h) => h.packet_flags.contains(PacketFlags::RETRANSMIT),
        }
    }

    pub fn radio_link_packet_index(&self) -> u16 {
        match self.kind {
            HeaderKind::Full(h) => h.radio_link_packet_index,
            HeaderKind::Compressed(_) => 0,
        }
    }
}

/// Decides whether `buf` holds a compressed header rather than a full one.
///
/// There is no framing byte ahead of either shape (`SPEC_FULL.md` §6):
/// `packet_flags` lives at offset 1 in a compressed header but offset 4 in
/// a full one, so a single fixed-offset bit peek can't serve both. This
/// reads the compressed shape's own module bits at its own offset, then
/// additionally requires the compressed interpretation's `total_length` to
/// be in bounds before accepting it. A full header's CRC32 bytes can, by
/// chance, set the same module bits at offset 1, but coincidentally also
/// producing an in-bounds length at offset 15..17 is far less likely, and
/// the CRC check every caller performs after this catches anything that
/// still slips through.
pub fn is_compressed_header(buf: &[u8]) -> bool {
    if buf.len() < COMPRESSED_HEADER_LEN {
        return false;
    }
    let flags = PacketFlags::from_bits_truncate(buf[1] as u32);
    if !flags.is_compressed() {
        return false;
    }
    let total_length = u16::from_le_bytes([buf[15], buf[16]]) as usize;
    (COMPRESSED_HEADER_LEN..=buf.len()).contains(&total_length)
}

/// Decodes one packet (full or compressed header) from the front of `buf`.
///
/// `scramble_key`, if present, is applied to the CRC-covered range before
/// the CRC is checked, undoing the XOR applied by [`frame_out`] when the
/// `ENCRYPTED` bit was set.
pub fn frame_in(buf: &[u8], scramble_key: Option<&[u8]>) -> Result<Packet, PacketError> {
    if buf.len() < 2 {
        return Err(PacketError::Truncated {
            need: 2,
            got: buf.len(),
        });
    }

    if is_compressed_header(buf) {
        frame_in_compressed(buf, scramble_key)
    } else {
        frame_in_full(buf, scramble_key)
    }
}

fn unscramble_if_needed(buf: &mut [u8], range: std::ops::Range<usize>, key: Option<&[u8]>, encrypted: bool) {
    if !encrypted {
        return;
    }
    if let Some(key) = key {
        if let Some(slice) = buf.get_mut(range) {
            scramble::xor_scramble(slice, key);
        }
    }
}

fn frame_in_full(buf: &[u8], scramble_key: Option<&[u8]>) -> Result<Packet, PacketError> {
    if buf.len() < FULL_HEADER_LEN {
        return Err(PacketError::Truncated {
            need: FULL_HEADER_LEN,
            got: buf.len(),
        });
    }
    let header = FullHeader::decode(buf).ok_or(PacketError::Truncated {
        need: FULL_HEADER_LEN,
        got: buf.len(),
    })?;

    let module = (header.packet_flags & PacketFlags::MODULE_MASK).bits();
    if module == 0b10 || module == 0b11 {
        return Err(PacketError::UnknownModule(module));
    }

    let total_length = header.total_length as usize;
    if total_length > buf.len() {
        return Err(PacketError::LengthMismatch {
            declared: total_length,
            available: buf.len(),
        });
    }

    let mut scratch = buf[..total_length].to_vec();
    let encrypted = header.packet_flags.contains(PacketFlags::ENCRYPTED);
    unscramble_if_needed(&mut scratch, header.crc_range(), scramble_key, encrypted);

    let computed = crc::crc32(&scratch[header.crc_range()]);
    if !crc::crc32_eq(computed, header.crc32) {
        return Err(PacketError::CrcMismatch);
    }

    PacketType::from_raw(header.packet_type).ok_or(PacketError::UnknownPacketType(header.packet_type))?;

    Ok(Packet {
        kind: HeaderKind::Full(header),
        packet_type: header.packet_type,
        stream_id: header.stream_id(),
        packet_index: header.packet_index(),
        vehicle_id_src: header.vehicle_id_src,
        vehicle_id_dest: header.vehicle_id_dest,
        total_length,
        payload: scratch[FULL_HEADER_LEN..total_length].to_vec(),
    })
}

fn frame_in_compressed(buf: &[u8], scramble_key: Option<&[u8]>) -> Result<Packet, PacketError> {
    if buf.len() < COMPRESSED_HEADER_LEN {
        return Err(PacketError::Truncated {
            need: COMPRESSED_HEADER_LEN,
            got: buf.len(),
        });
    }
    let header = CompressedHeader::decode(buf).ok_or(PacketError::Truncated {
        need: COMPRESSED_HEADER_LEN,
        got: buf.len(),
    })?;

    let total_length = header.total_length as usize;
    if total_length > buf.len() {
        return Err(PacketError::LengthMismatch {
            declared: total_length,
            available: buf.len(),
        });
    }

    let mut scratch = buf[..total_length].to_vec();
    let encrypted = header.packet_flags.contains(PacketFlags::ENCRYPTED);
    unscramble_if_needed(&mut scratch, header.crc_range(), scramble_key, encrypted);

    let computed = crc::crc8(&scratch[header.crc_range()]);
    if computed != header.crc8 {
        return Err(PacketError::CrcMismatch);
    }

    PacketType::from_raw(header.packet_type).ok_or(PacketError::UnknownPacketType(header.packet_type))?;

    Ok(Packet {
        kind: HeaderKind::Compressed(header),
        packet_type: header.packet_type,
        stream_id: header.stream_id(),
        packet_index: header.packet_index(),
        vehicle_id_src: header.vehicle_id_src,
        vehicle_id_dest: header.vehicle_id_dest,
        total_length,
        payload: scratch[COMPRESSED_HEADER_LEN..total_length].to_vec(),
    })
}

/// Populates CRC (and scrambles, if `encrypted`) for an outbound buffer
/// already holding a complete header + payload at `buf[..total_length]`.
/// The caller has already set stream id, packet type, and destination id.
pub fn frame_out(buf: &mut [u8], scramble_key: Option<&[u8]>) -> Result<(), PacketError> {
    if is_compressed_header(buf) {
        frame_out_compressed(buf, scramble_key)
    } else {
        frame_out_full(buf, scramble_key)
    }
}

fn frame_out_full(buf: &mut [u8], scramble_key: Option<&[u8]>) -> Result<(), PacketError> {
    let mut header = FullHeader::decode(buf).ok_or(PacketError::Truncated {
        need: FULL_HEADER_LEN,
        got: buf.len(),
    })?;
    let range = header.crc_range();
    let total_length = header.total_length as usize;
    if total_length > buf.len() {
        return Err(PacketError::LengthMismatch {
            declared: total_length,
            available: buf.len(),
        });
    }
    header.crc32 = crc::crc32(&buf[range.clone()]);
    header.encode(buf);

    let encrypted = header.packet_flags.contains(PacketFlags::ENCRYPTED);
    unscramble_if_needed(buf, range, scramble_key, encrypted);
    Ok(())
}

fn frame_out_compressed(buf: &mut [u8], scramble_key: Option<&[u8]>) -> Result<(), PacketError> {
    let mut header = CompressedHeader::decode(buf).ok_or(PacketError::Truncated {
        need: COMPRESSED_HEADER_LEN,
        got: buf.len(),
    })?;
    let range = header.crc_range();
    let total_length = header.total_length as usize;
    if total_length > buf.len() {
        return Err(PacketError::LengthMismatch {
            declared: total_length,
            available: buf.len(),
        });
    }
    header.crc8 = crc::crc8(&buf[range.clone()]);
    header.encode(buf);

    let encrypted = header.packet_flags.contains(PacketFlags::ENCRYPTED);
    unscramble_if_needed(buf, range, scramble_key, encrypted);
    Ok(())
}

/// Walks consecutive packets packed back-to-back in a single radio frame.
pub fn iter_chained(buf: &[u8]) -> ChainedIter<'_> {
    ChainedIter { remaining: buf }
}

pub struct ChainedIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for ChainedIter<'a> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        match frame_in(self.remaining, None) {
            Ok(packet) => {
                let consumed = packet.total_length.max(1).min(self.remaining.len());
                self.remaining = &self.remaining[consumed..];
                Some(Ok(packet))
            }
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}

/// Reassembles full/compressed packets fragmented across short (serial)
/// packets. One instance is owned per radio interface; a `START_PACKET`
/// marker always resets it, as does an out-of-sequence `packet_id`.
pub struct ShortPacketReassembler {
    scratch: Vec<u8>,
    last_packet_id: Option<u8>,
    known_vehicle_id: Option<u32>,
}

impl Default for ShortPacketReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ShortPacketReassembler {
    pub fn new() -> Self {
        Self {
            scratch: Vec::with_capacity(MAX_PACKET_TOTAL_SIZE),
            last_packet_id: None,
            known_vehicle_id: None,
        }
    }

    pub fn known_vehicle_id(&self) -> Option<u32> {
        self.known_vehicle_id
    }

    fn reset(&mut self) {
        self.scratch.clear();
        self.last_packet_id = None;
    }

    /// Feeds one short packet's worth of bytes (header + fragment) into the
    /// reassembler. Returns `Some(packet)` once enough bytes have
    /// accumulated to match the inner header's declared `total_length` and
    /// its CRC validates.
    pub fn feed(&mut self, short_buf: &[u8]) -> Result<Option<Packet>, PacketError> {
        let header = ShortHeader::decode(short_buf).ok_or(PacketError::Truncated {
            need: SHORT_HEADER_LEN,
            got: short_buf.len(),
        })?;
        let data_len = header.data_length as usize;
        if short_buf.len() < SHORT_HEADER_LEN + data_len {
            return Err(PacketError::Truncated {
                need: SHORT_HEADER_LEN + data_len,
                got: short_buf.len(),
            });
        }
        let fragment = &short_buf[SHORT_HEADER_LEN..SHORT_HEADER_LEN + data_len];

        if header.is_start() {
            self.reset();
        } else {
            let expected = self.last_packet_id.map(|p| p.wrapping_add(1));
            if expected != Some(header.packet_id) {
                self.reset();
                return Err(PacketError::SequenceGap);
            }
        }
        self.last_packet_id = Some(header.packet_id);

        if self.scratch.len() + fragment.len() > MAX_PACKET_TOTAL_SIZE * 2 - 255 {
            self.reset();
            return Err(PacketError::Truncated {
                need: 0,
                got: MAX_PACKET_TOTAL_SIZE * 2,
            });
        }
        self.scratch.extend_from_slice(fragment);

        let declared_len = match self.scratch.len() {
            _ if is_compressed_header(&self.scratch) => {
                CompressedHeader::decode(&self.scratch).map(|h| h.total_length as usize)
            }
            n if n >= FULL_HEADER_LEN => FullHeader::decode(&self.scratch).map(|h| h.total_length as usize),
            _ => return Ok(None),
        };

        let Some(declared_len) = declared_len else {
            return Ok(None);
        };
        if self.scratch.len() < declared_len {
            return Ok(None);
        }

        let packet = frame_in(&self.scratch[..declared_len], None)?;
        self.known_vehicle_id = Some(packet.vehicle_id_src);
        self.scratch.drain(..declared_len);
        Ok(Some(packet))
    }
}

/// Error conversion helper for callers matching on raw packet type bytes
/// that may not be one of the types this crate understands by name.
impl From<TryFromPrimitiveError<PacketType>> for PacketError {
    fn from(e: TryFromPrimitiveError<PacketType>) -> Self {
        PacketError::UnknownPacketType(e.number)
    }
}
