// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Serial SiK radio interface.
//!
//! SiK radios present a plain byte stream; this crate never sees whole
//! frames arrive atomically the way it does on the Wi-Fi path; instead it
//! reads whatever bytes are available and hands them to the caller, which
//! feeds them through `packet::ShortPacketReassembler` one short-header
//! chunk at a time. `send` similarly just writes bytes; the caller is
//! responsible for having already split its frame into
//! `header::SHORT_HEADER_LEN`-prefixed chunks no larger than the radio's
//! configured air packet size.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::{InterfaceId, InterfaceKind, InterfaceState, RadioInterface};
use crate::error::InterfaceError;

/// SiK firmware's default maximum air packet size in bytes; this bounds how
/// much a single `send` call should write before the caller should start a
/// new short-packet chain.
pub const SIK_MAX_AIR_PACKET_SIZE: usize = 64;

pub struct SerialInterface {
    id: InterfaceId,
    device: String,
    state: InterfaceState,
    air_rate_bps: u32,
    port: Box<dyn SerialPort>,
    read_buf: [u8; 256],
}

impl SerialInterface {
    pub fn open(id: InterfaceId, device: &str, baud: u32, air_rate_bps: u32) -> Result<Self, InterfaceError> {
        let port = serialport::new(device, baud)
            .timeout(Duration::from_millis(5))
            .open()
            .map_err(|e| InterfaceError::Io(e.to_string()))?;

        Ok(Self {
            id,
            device: device.to_string(),
            state: InterfaceState::Up,
            air_rate_bps,
            port,
            read_buf: [0u8; 256],
        })
    }

    /// Reopens the underlying serial port after a fatal write error, the
    /// way the reference SiK driver reinitializes on a `-2` write failure
    /// (see `SPEC_FULL.md` §4.6).
    pub fn reinit(&mut self, baud: u32) -> Result<(), InterfaceError> {
        let port = serialport::new(self.device.as_str(), baud)
            .timeout(Duration::from_millis(5))
            .open()
            .map_err(|e| InterfaceError::Io(e.to_string()))?;
        self.port = port;
        self.state = InterfaceState::Up;
        Ok(())
    }
}

impl RadioInterface for SerialInterface {
    fn id(&self) -> InterfaceId {
        self.id
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Serial
    }

    fn mtu(&self) -> usize {
        SIK_MAX_AIR_PACKET_SIZE
    }

    fn nominal_data_rate_bps(&self) -> u32 {
        self.air_rate_bps
    }

    fn state(&self) -> InterfaceState {
        self.state
    }

    fn pause(&mut self) {
        self.state = InterfaceState::Paused;
    }

    fn resume(&mut self) {
        if self.state != InterfaceState::Broken {
            self.state = InterfaceState::Up;
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), InterfaceError> {
        if self.state != InterfaceState::Up {
            return Err(InterfaceError::Paused(self.device.clone()));
        }
        match self.port.write_all(frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = InterfaceState::Broken;
                Err(InterfaceError::Io(e.to_string()))
            }
        }
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, InterfaceError> {
        if self.state != InterfaceState::Up {
            return Ok(None);
        }
        match self.port.read(&mut self.read_buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(self.read_buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => {
                self.state = InterfaceState::Broken;
                Err(InterfaceError::Io(e.to_string()))
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}
