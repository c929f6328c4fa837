// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wiring: the single shared `RadioStack` value that owns every interface,
//! queue, and engine a `vehicle`/`controller` binary needs, and the worker
//! thread each binary spawns around it.
//!
//! Mirrors the role of the teacher's `runtime_glue` module: one value built
//! once in `main`, then handed out as shared references to whichever
//! threads need it. This crate has no scheduler of its own, so "spawning a
//! worker" here just means `std::thread::spawn` around a `&'static` (or
//! scoped) reference into this struct.

use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use crate::adaptive::{AdaptiveVideoController, CaptureCommand, CaptureProtocol};
use crate::config::Model;
use crate::error::InterfaceError;
use crate::interface::loopback::LoopbackInterface;
use crate::interface::serial::SerialInterface;
use crate::interface::wifi::WifiInterface;
use crate::interface::{AnyInterface, InterfaceId, RadioInterface};
use crate::queue::RxQueues;
use crate::rx::RxEngine;
use crate::stats::RadioStatsHub;
use crate::tx::TxEngine;

/// Everything one process needs to run the radio link layer: the opened
/// interfaces, the two engines built on top of them, and the statistics hub
/// they share. Holds no thread handles itself; `run_rx_worker`/`run_tx` are
/// meant to be called from threads the binary spawns and owns.
pub struct RadioStack {
    pub model: Model,
    interfaces: Vec<Mutex<AnyInterface>>,
    pub queues: RxQueues,
    pub radio_stats: RadioStatsHub,
    pub negotiating: AtomicBool,
    scramble_key: Option<Vec<u8>>,
}

impl RadioStack {
    /// Opens every enabled interface named in `model` and builds the shared
    /// statistics hub and RX queues. `scramble_key` is `None` when
    /// `model.developer_flags.disable_scrambling` is set.
    ///
    /// `model.radio_interfaces[i].index` is the `InterfaceId` every other
    /// component (the TX selector, the statistics hub) uses to refer to
    /// this interface, so the opened-interface vector is indexed by that
    /// field rather than by enumeration order: a disabled interface still
    /// occupies its slot, filled with a permanently paused loopback
    /// placeholder, so a later-declared enabled interface keeps its own
    /// configured index.
    pub fn open(model: Model, scramble_key: Option<Vec<u8>>) -> Result<Self, InterfaceError> {
        let slot_count = model.radio_interfaces.iter().map(|c| c.index + 1).max().unwrap_or(0);
        let mut interfaces: Vec<Option<Mutex<AnyInterface>>> = (0..slot_count).map(|_| None).collect();

        for cfg in &model.radio_interfaces {
            let any = if !cfg.is_enabled() {
                let mut placeholder = LoopbackInterface::echo(cfg.id(), cfg.current_data_rate_bps.unsigned_abs());
                placeholder.pause();
                AnyInterface::Loopback(placeholder)
            } else if cfg.driver_family.is_serial() {
                let baud = cfg.current_data_rate_bps.unsigned_abs();
                SerialInterface::open(cfg.id(), &cfg.name, baud, baud).map(AnyInterface::Serial)?
            } else {
                WifiInterface::open(cfg.id(), &cfg.name, cfg.current_data_rate_bps as u32).map(AnyInterface::Wifi)?
            };
            interfaces[cfg.index] = Some(Mutex::new(any));
        }

        let interfaces: Vec<Mutex<AnyInterface>> = interfaces
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    let mut placeholder = LoopbackInterface::echo(InterfaceId(idx), 0);
                    placeholder.pause();
                    Mutex::new(AnyInterface::Loopback(placeholder))
                })
            })
            .collect();

        let radio_stats = RadioStatsHub::new(interfaces.len(), model.radio_links.len());
        let queues = RxQueues::default();
        let effective_key = if model.developer_flags.disable_scrambling { None } else { scramble_key };

        Ok(Self {
            model,
            interfaces,
            queues,
            radio_stats,
            negotiating: AtomicBool::new(false),
            scramble_key: effective_key,
        })
    }

    /// Builds an `RxEngine` borrowing this stack's interfaces, queues, and
    /// statistics hub. Intended to be run to completion inside a dedicated
    /// thread via `RxEngine::run`.
    pub fn rx_engine(&self) -> RxEngine<'_> {
        RxEngine::new(
            &self.interfaces,
            &self.queues,
            &self.radio_stats,
            self.scramble_key.clone(),
            self.model.process_priorities.rx_thread_priority,
        )
    }

    /// Builds a `TxEngine` borrowing this stack's interfaces and statistics
    /// hub, gated by `negotiating` (shared with the adaptive controller on
    /// the vehicle side; always `false` on a pure controller build).
    pub fn tx_engine(&self) -> TxEngine<'_> {
        TxEngine::new(&self.interfaces, &self.radio_stats, self.scramble_key.clone(), &self.negotiating)
    }

    /// Vehicle-side only: builds the adaptive video controller, sharing this
    /// stack's negotiation flag so a negotiation in progress also mutes the
    /// adaptive controller's periodic tick.
    pub fn adaptive_controller(&self, protocol: CaptureProtocol, capture_tx: crossbeam_channel::Sender<CaptureCommand>) -> AdaptiveVideoController {
        AdaptiveVideoController::new(protocol, capture_tx)
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// All interface ids this stack opened, for supervisor-level reporting.
    pub fn interface_ids(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        (0..self.interfaces.len()).map(InterfaceId)
    }
}
