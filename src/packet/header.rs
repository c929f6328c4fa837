// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! On-wire header layouts (full, compressed, short/serial).
//!
//! All multi-byte integers are little-endian. See `SPEC_FULL.md` §6 for the
//! exact byte offsets this module encodes/decodes; there is no framing byte
//! ahead of either header; the two shapes are told apart by `packet_flags`'s
//! module bits, read from each shape's own offset (see
//! [`super::is_compressed_header`]).

use bitflags::bitflags;

/// Size in bytes of the full packet header, CRC included.
pub const FULL_HEADER_LEN: usize = 25;
/// Size in bytes of the compressed packet header, CRC included.
pub const COMPRESSED_HEADER_LEN: usize = 17;
/// Size in bytes of a short (serial) packet header.
pub const SHORT_HEADER_LEN: usize = 3;

/// High bits of `stream_packet_idx` hold the stream id.
pub const STREAM_INDEX_SHIFT: u32 = 24;
/// Low 24 bits of `stream_packet_idx` hold the monotonic per-stream index.
pub const STREAM_PACKET_IDX_MASK: u32 = 0x00FF_FFFF;

/// Start-of-frame marker for a short (serial) packet.
pub const SHORT_START_PACKET: u8 = 0xA5;
/// Continuation marker for a short (serial) packet.
pub const SHORT_CONTINUATION: u8 = 0x5A;

bitflags! {
    /// Flags carried in a full or compressed header's `packet_flags` byte(s).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// Module id occupies the low two bits; `COMPRESSED_HEADER` is one value of it.
        const MODULE_MASK          = 0b0000_0011;
        const COMPRESSED_HEADER    = 0b0000_0001;
        const ENCRYPTED            = 0b0000_0100;
        const RETRANSMIT           = 0b0000_1000;
        const HEADERS_ONLY_CRC     = 0b0001_0000;
        const HIGH_PRIORITY_HINT   = 0b0010_0000;
    }
}

impl PacketFlags {
    pub fn is_compressed(self) -> bool {
        (self & Self::MODULE_MASK) == Self::COMPRESSED_HEADER
    }
}

/// A decoded full packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullHeader {
    pub crc32: u32,
    pub packet_flags: PacketFlags,
    pub packet_type: u8,
    pub stream_packet_idx: u32,
    pub vehicle_id_src: u32,
    pub vehicle_id_dest: u32,
    pub radio_link_packet_index: u16,
    pub total_length: u16,
}

impl FullHeader {
    pub fn stream_id(&self) -> u32 {
        self.stream_packet_idx >> STREAM_INDEX_SHIFT
    }

    pub fn packet_index(&self) -> u32 {
        self.stream_packet_idx & STREAM_PACKET_IDX_MASK
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FULL_HEADER_LEN {
            return None;
        }
        Some(Self {
            crc32: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            packet_flags: PacketFlags::from_bits_truncate(u32::from_le_bytes(
                buf[4..8].try_into().ok()?,
            )),
            packet_type: buf[8],
            stream_packet_idx: u32::from_le_bytes(buf[9..13].try_into().ok()?),
            vehicle_id_src: u32::from_le_bytes(buf[13..17].try_into().ok()?),
            vehicle_id_dest: u32::from_le_bytes(buf[17..21].try_into().ok()?),
            radio_link_packet_index: u16::from_le_bytes(buf[21..23].try_into().ok()?),
            total_length: u16::from_le_bytes(buf[23..25].try_into().ok()?),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= FULL_HEADER_LEN);
        out[0..4].copy_from_slice(&self.crc32.to_le_bytes());
        out[4..8].copy_from_slice(&self.packet_flags.bits().to_le_bytes());
        out[8] = self.packet_type;
        out[9..13].copy_from_slice(&self.stream_packet_idx.to_le_bytes());
        out[13..17].copy_from_slice(&self.vehicle_id_src.to_le_bytes());
        out[17..21].copy_from_slice(&self.vehicle_id_dest.to_le_bytes());
        out[21..23].copy_from_slice(&self.radio_link_packet_index.to_le_bytes());
        out[23..25].copy_from_slice(&self.total_length.to_le_bytes());
    }

    /// Byte range covered by the CRC, per the `HEADERS_ONLY_CRC` flag.
    pub fn crc_range(&self) -> std::ops::Range<usize> {
        if self.packet_flags.contains(PacketFlags::HEADERS_ONLY_CRC) {
            4..FULL_HEADER_LEN
        } else {
            4..self.total_length as usize
        }
    }
}

/// A decoded compressed packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedHeader {
    pub crc8: u8,
    pub packet_flags: PacketFlags,
    pub packet_type: u8,
    pub stream_packet_idx: u32,
    pub vehicle_id_src: u32,
    pub vehicle_id_dest: u32,
    pub total_length: u16,
}

impl CompressedHeader {
    pub fn stream_id(&self) -> u32 {
        self.stream_packet_idx >> STREAM_INDEX_SHIFT
    }

    pub fn packet_index(&self) -> u32 {
        self.stream_packet_idx & STREAM_PACKET_IDX_MASK
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < COMPRESSED_HEADER_LEN {
            return None;
        }
        Some(Self {
            crc8: buf[0],
            packet_flags: PacketFlags::from_bits_truncate(buf[1] as u32),
            packet_type: buf[2],
            stream_packet_idx: u32::from_le_bytes(buf[3..7].try_into().ok()?),
            vehicle_id_src: u32::from_le_bytes(buf[7..11].try_into().ok()?),
            vehicle_id_dest: u32::from_le_bytes(buf[11..15].try_into().ok()?),
            total_length: u16::from_le_bytes(buf[15..17].try_into().ok()?),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= COMPRESSED_HEADER_LEN);
        out[0] = self.crc8;
        out[1] = self.packet_flags.bits() as u8;
        out[2] = self.packet_type;
        out[3..7].copy_from_slice(&self.stream_packet_idx.to_le_bytes());
        out[7..11].copy_from_slice(&self.vehicle_id_src.to_le_bytes());
        out[11..15].copy_from_slice(&self.vehicle_id_dest.to_le_bytes());
        out[15..17].copy_from_slice(&self.total_length.to_le_bytes());
    }

    pub fn crc_range(&self) -> std::ops::Range<usize> {
        1..self.total_length as usize
    }
}

/// A decoded short (serial) packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShortHeader {
    pub start_header: u8,
    pub packet_id: u8,
    pub data_length: u8,
}

impl ShortHeader {
    pub fn is_start(&self) -> bool {
        self.start_header == SHORT_START_PACKET
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SHORT_HEADER_LEN {
            return None;
        }
        let start_header = buf[0];
        if start_header != SHORT_START_PACKET && start_header != SHORT_CONTINUATION {
            return None;
        }
        Some(Self {
            start_header,
            packet_id: buf[1],
            data_length: buf[2],
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= SHORT_HEADER_LEN);
        out[0] = self.start_header;
        out[1] = self.packet_id;
        out[2] = self.data_length;
    }
}
