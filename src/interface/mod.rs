// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C3: radio interface abstraction.
//!
//! [`RadioInterface`] generalizes the teacher's `NetworkInterface` trait
//! (`src/drivers/net/mod.rs`) from a single NIC shape to the two concrete
//! transports a local radio link is built from: a Wi-Fi card in monitor
//! mode and a serial SiK modem. The RX engine (C4) and TX engine (C6) only
//! ever talk to this trait; they never know which transport backs a given
//! interface.

pub mod loopback;
pub mod serial;
pub mod wifi;

use std::time::Duration;

use enum_dispatch::enum_dispatch;

use crate::error::InterfaceError;
use loopback::LoopbackInterface;
use serial::SerialInterface;
use wifi::WifiInterface;

/// Stable identifier for one physical radio interface, assigned at startup
/// and never reused while the process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub usize);

/// The two transports a local radio link can be built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    Wifi,
    Serial,
}

/// Administrative state of an interface, independent of the underlying
/// transport's own link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceState {
    Up,
    /// Paused by the RX engine (e.g. while renegotiating); frames are
    /// neither sent nor delivered, but the interface is not torn down.
    Paused,
    /// The transport reported a fatal error; the interface must be
    /// reopened before it can be used again.
    Broken,
}

/// A single physical transport carrying framed radio packets.
///
/// Implementors do not frame or defragment packets themselves (that is
/// `packet::frame_in`/`frame_out` and `packet::ShortPacketReassembler`'s
/// job in C1); they move opaque byte frames in and out and report their
/// own link-layer characteristics (MTU, nominal data rate) to C5/C6.
#[enum_dispatch]
pub trait RadioInterface: Send {
    fn id(&self) -> InterfaceId;

    fn kind(&self) -> InterfaceKind;

    /// Largest single frame this interface can carry without internal
    /// fragmentation (serial interfaces fragment above this in C1/C3; Wi-Fi
    /// interfaces reject frames larger than this outright).
    fn mtu(&self) -> usize;

    /// Nominal link data rate in bits per second, used by the TX selector
    /// (C5) for datarate negotiation and by the TX engine (C6) for serial
    /// overload throttling. For Wi-Fi interfaces this tracks the currently
    /// negotiated 802.11 rate; for serial interfaces it is the configured
    /// baud-derived air rate.
    fn nominal_data_rate_bps(&self) -> u32;

    fn state(&self) -> InterfaceState;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Sends one already-framed packet (or packet chain) on the wire.
    /// Returns `Err(InterfaceError::Broken)` on a fatal write error; the
    /// caller (C6) is responsible for reinitializing the transport.
    fn send(&mut self, frame: &[u8]) -> Result<(), InterfaceError>;

    /// Non-blocking receive of one raw frame, if one is waiting. Returns
    /// `Ok(None)` rather than blocking when nothing is available; the RX
    /// engine (C4) drives this in a poll loop bounded by its own timeout.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, InterfaceError>;

    /// Upper bound the RX engine should wait before polling this interface
    /// again when it last returned `Ok(None)`.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }
}

/// The concrete transports the RX/TX engines hold, dispatched statically
/// through [`enum_dispatch`] instead of `Box<dyn RadioInterface>`: every
/// radio stack instance is small and known at startup (interface
/// enumeration happens once), so a closed enum avoids the vtable
/// indirection on the hot per-packet path.
#[enum_dispatch(RadioInterface)]
pub enum AnyInterface {
    Wifi(WifiInterface),
    Serial(SerialInterface),
    /// In-memory loopback used by unit and integration tests; see
    /// [`loopback::LoopbackInterface`].
    Loopback(LoopbackInterface),
}
