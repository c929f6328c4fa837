// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wi-Fi monitor-mode radio interface.
//!
//! Frames are carried as raw 802.11 data frames over an interface already
//! switched into monitor mode by external tooling (see `SPEC_FULL.md` §4.9
//! and `r_initradio`, out of scope for this crate). This module only
//! strips/prepends the radiotap and 802.11 headers around the payload this
//! crate's packet codec (C1) understands; it does not configure the NIC.

use std::io;
use std::time::Duration;

use pnet_datalink::{self as datalink, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface as PnetInterface};
use radiotap::Radiotap;

use super::{InterfaceId, InterfaceKind, InterfaceState, RadioInterface};
use crate::error::InterfaceError;

/// Fixed 802.11 data-frame header this crate writes on transmit: frame
/// control (data, no retry), duration, three fixed MAC addresses, and a
/// sequence field the NIC firmware overwrites. 24 bytes, no QoS field.
const DOT11_HEADER_LEN: usize = 24;

/// Locally administered, non-broadcast MAC prefix used for all three
/// address fields; the payload's own vehicle ids carry real identity.
const RUBY_MAC_PREFIX: [u8; 3] = [0x02, 0x13, 0x37];

pub struct WifiInterface {
    id: InterfaceId,
    name: String,
    state: InterfaceState,
    data_rate_bps: u32,
    mtu: usize,
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
}

impl WifiInterface {
    /// Opens `name` (already in monitor mode) for raw 802.11 frame
    /// capture/injection at the given negotiated data rate.
    pub fn open(id: InterfaceId, name: &str, data_rate_bps: u32) -> Result<Self, InterfaceError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i: &PnetInterface| i.name == name)
            .ok_or_else(|| InterfaceError::NotOpen(name.to_string()))?;

        let channel = datalink::channel(&iface, Default::default())
            .map_err(|e| InterfaceError::Io(e.to_string()))?;

        let (tx, rx) = match channel {
            Channel::Ethernet(tx, rx) => (tx, rx),
            _ => return Err(InterfaceError::NotOpen(name.to_string())),
        };

        Ok(Self {
            id,
            name: name.to_string(),
            state: InterfaceState::Up,
            data_rate_bps,
            mtu: 1450,
            tx,
            rx,
        })
    }

    fn dot11_header(&self) -> [u8; DOT11_HEADER_LEN] {
        let mut hdr = [0u8; DOT11_HEADER_LEN];
        hdr[0] = 0x08; // frame control: data frame
        hdr[1] = 0x00;
        hdr[4..7].copy_from_slice(&RUBY_MAC_PREFIX);
        hdr[10..13].copy_from_slice(&RUBY_MAC_PREFIX);
        hdr[16..19].copy_from_slice(&RUBY_MAC_PREFIX);
        hdr
    }
}

impl RadioInterface for WifiInterface {
    fn id(&self) -> InterfaceId {
        self.id
    }

    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Wifi
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn nominal_data_rate_bps(&self) -> u32 {
        self.data_rate_bps
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
            return Err(InterfaceError::Paused(self.name.clone()));
        }
        if frame.len() > self.mtu {
            return Err(InterfaceError::Overloaded(self.name.clone()));
        }

        let mut wire = Vec::with_capacity(DOT11_HEADER_LEN + frame.len());
        wire.extend_from_slice(&self.dot11_header());
        wire.extend_from_slice(frame);

        match self.tx.send_to(&wire, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.state = InterfaceState::Broken;
                Err(InterfaceError::Io(e.to_string()))
            }
            None => {
                self.state = InterfaceState::Broken;
                Err(InterfaceError::Broken(self.name.clone()))
            }
        }
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, InterfaceError> {
        if self.state != InterfaceState::Up {
            return Ok(None);
        }
        match self.rx.next() {
            Ok(raw) => {
                let Some((payload_offset, radiotap_len)) = parse_radiotap_len(raw) else {
                    return Ok(None);
                };
                let dot11 = &raw[radiotap_len..];
                if dot11.len() <= payload_offset {
                    return Ok(None);
                }
                Ok(Some(dot11[DOT11_HEADER_LEN.min(dot11.len())..].to_vec()))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => {
                self.state = InterfaceState::Broken;
                Err(InterfaceError::Io(e.to_string()))
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(2)
    }
}

/// Returns `(0, radiotap_header_len)` if `raw` starts with a well-formed
/// radiotap header; the payload offset is always 0 relative to the slice
/// that follows the radiotap header (the 802.11 header comes immediately
/// after it).
fn parse_radiotap_len(raw: &[u8]) -> Option<(usize, usize)> {
    let radiotap = Radiotap::from_bytes(raw).ok()?;
    Some((0, radiotap.header.length))
}
