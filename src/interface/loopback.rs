// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-memory loopback/test radio interface.
//!
//! Shaped after the teacher's `drivers::net::loopback::LoopbackDriver`: a
//! `VecDeque` of already-framed buffers stands in for the NIC ring. Two
//! instances can be wired together with [`pair`] to build a two-interface
//! diversity receiver in a unit or integration test without any real Wi-Fi
//! or serial hardware; loss and duplication for the scenarios in
//! `SPEC_FULL.md` §8 are driven by the test itself deciding, per packet,
//! which paired interfaces to send it on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{InterfaceId, InterfaceKind, InterfaceState, RadioInterface};
use crate::error::InterfaceError;

type Ring = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// A loopback radio interface: frames sent on one end of a [`pair`] appear
/// on the other end's `try_recv`, unmodified and in order.
pub struct LoopbackInterface {
    id: InterfaceId,
    kind: InterfaceKind,
    state: InterfaceState,
    data_rate_bps: u32,
    mtu: usize,
    outbox: Ring,
    inbox: Ring,
    /// Test-only hook: set by [`Self::fail_next_recv`] to make exactly one
    /// future `try_recv` call return a fatal error, as a real transport
    /// would on a read failure, without tearing down the pair.
    fail_next_recv: Arc<AtomicBool>,
}

impl LoopbackInterface {
    /// Builds two interfaces wired to each other: frames sent on `a`
    /// arrive on `b` and vice versa.
    pub fn pair(id_a: InterfaceId, id_b: InterfaceId, data_rate_bps: u32) -> (Self, Self) {
        Self::pair_with_kind(id_a, id_b, data_rate_bps, InterfaceKind::Wifi, crate::packet::MAX_PACKET_TOTAL_SIZE)
    }

    /// Like [`pair`], but reports `InterfaceKind::Serial` and a small MTU so
    /// it exercises the TX engine's serial fragmentation/overload path
    /// (`SPEC_FULL.md` §4.6) without real SiK hardware.
    pub fn serial_pair(id_a: InterfaceId, id_b: InterfaceId, air_rate_bps: u32) -> (Self, Self) {
        Self::pair_with_kind(id_a, id_b, air_rate_bps, InterfaceKind::Serial, super::serial::SIK_MAX_AIR_PACKET_SIZE)
    }

    fn pair_with_kind(id_a: InterfaceId, id_b: InterfaceId, data_rate_bps: u32, kind: InterfaceKind, mtu: usize) -> (Self, Self) {
        let ring_a = Arc::new(Mutex::new(VecDeque::new()));
        let ring_b = Arc::new(Mutex::new(VecDeque::new()));
        let a = Self {
            id: id_a,
            kind,
            state: InterfaceState::Up,
            data_rate_bps,
            mtu,
            outbox: ring_b.clone(),
            inbox: ring_a.clone(),
            fail_next_recv: Arc::new(AtomicBool::new(false)),
        };
        let b = Self {
            id: id_b,
            kind,
            state: InterfaceState::Up,
            data_rate_bps,
            mtu,
            outbox: ring_a,
            inbox: ring_b,
            fail_next_recv: Arc::new(AtomicBool::new(false)),
        };
        (a, b)
    }

    /// A standalone loopback that immediately echoes whatever it is sent
    /// back to its own `try_recv`, useful for single-interface framing
    /// round-trip tests.
    pub fn echo(id: InterfaceId, data_rate_bps: u32) -> Self {
        let ring = Arc::new(Mutex::new(VecDeque::new()));
        Self {
            id,
            kind: InterfaceKind::Wifi,
            state: InterfaceState::Up,
            data_rate_bps,
            mtu: crate::packet::MAX_PACKET_TOTAL_SIZE,
            outbox: ring.clone(),
            inbox: ring,
            fail_next_recv: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Arms [`Self::fail_next_recv`]'s one-shot error for the next
    /// `try_recv` call on this instance, simulating a transport read
    /// failure (e.g. the reference's `select` returning -1) without
    /// otherwise disturbing the pair.
    pub fn fail_next_recv(&self) {
        self.fail_next_recv.store(true, Ordering::SeqCst);
    }
}

impl RadioInterface for LoopbackInterface {
    fn id(&self) -> InterfaceId {
        self.id
    }

    fn kind(&self) -> InterfaceKind {
        self.kind
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
            return Err(InterfaceError::Paused(format!("loopback{}", self.id.0)));
        }
        self.outbox.lock().unwrap().push_back(frame.to_vec());
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, InterfaceError> {
        if self.fail_next_recv.swap(false, Ordering::SeqCst) {
            return Err(InterfaceError::Broken(format!("loopback{}", self.id.0)));
        }
        if self.state != InterfaceState::Up {
            return Ok(None);
        }
        Ok(self.inbox.lock().unwrap().pop_front())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_frames_in_order() {
        let (mut a, mut b) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        assert_eq!(b.try_recv().unwrap().unwrap(), b"one");
        assert_eq!(b.try_recv().unwrap().unwrap(), b"two");
        assert!(a.try_recv().unwrap().is_none());
    }

    #[test]
    fn paused_interface_yields_nothing() {
        let (mut a, mut b) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        a.send(b"hello").unwrap();
        b.pause();
        assert!(b.try_recv().unwrap().is_none());
    }
}
