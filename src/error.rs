// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error kinds for each fallible subsystem of the radio link layer.
//!
//! Malformed packets and duplicates are not represented here: both are
//! swallowed inside the Rx engine and only ever surface as counters.

use std::io;

/// Errors produced while framing, deframing or reassembling a packet (C1/C3).
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("unknown module flag {0:#x}")]
    UnknownModule(u32),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("short-packet sequence gap, resetting reassembly scratch")]
    SequenceGap,
}

/// Errors surfaced by a [`crate::interface::RadioInterface`] (C3).
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("radio interface {0} is broken")]
    Broken(String),

    #[error("radio interface {0} is paused")]
    Paused(String),

    #[error("radio interface {0} could not be opened")]
    NotOpen(String),

    #[error("radio interface {0} write overloaded, exceeding its allowed air rate")]
    Overloaded(String),

    #[error("I/O error on radio interface: {0}")]
    Io(String),
}

impl From<io::Error> for InterfaceError {
    fn from(e: io::Error) -> Self {
        InterfaceError::Io(e.to_string())
    }
}

/// Errors produced while loading the configuration surface (C9/A3).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no radio interfaces enumerated")]
    NoInterfaces,

    #[error("local radio link {0} has no interfaces assigned and is not disabled")]
    EmptyLink(usize),
}
