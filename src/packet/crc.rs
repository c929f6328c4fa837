// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! CRC computation for the full and compressed packet headers.
//!
//! Full headers carry a 32-bit CRC but only the low 24 bits are ever
//! compared; compressed headers carry an 8-bit CRC.

use crc::{Crc, CRC_32_ISO_HDLC, CRC_8_SMBUS};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

const CRC24_MASK: u32 = 0x00FF_FFFF;

/// Computes the 32-bit CRC of `data`, as stored in a full packet header.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Compares two stored CRC32 values the way the wire format does: only the
/// low 24 bits matter.
pub fn crc32_eq(computed: u32, stored: u32) -> bool {
    (computed & CRC24_MASK) == (stored & CRC24_MASK)
}

/// Computes the 8-bit CRC of `data`, as stored in a compressed packet header.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}
