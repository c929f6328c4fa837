// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Vehicle-side radio link daemon.
//!
//! Opens the radio interfaces named in a model file, runs the RX engine on
//! its own thread, and drives the TX engine and adaptive video controller
//! from the main thread. The capture program itself (raspivid / majestic)
//! is an external process this crate only ever talks to through
//! [`ruby_link::adaptive::CaptureCommand`]; spawning and supervising that
//! process is out of scope here.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{info, warn};

use ruby_link::adaptive::CaptureProtocol;
use ruby_link::config::load_model;
use ruby_link::packet::{PacketType, StreamId};
use ruby_link::tx::{PacketSpec, TxRequest};
use ruby_link::RadioStack;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CaptureProtocolArg {
    Raspivid,
    Majestic,
}

impl From<CaptureProtocolArg> for CaptureProtocol {
    fn from(v: CaptureProtocolArg) -> Self {
        match v {
            CaptureProtocolArg::Raspivid => CaptureProtocol::CsiVeyeRaspivid,
            CaptureProtocolArg::Majestic => CaptureProtocol::OpenIpcMajestic,
        }
    }
}

/// Runs the Ruby radio link layer on the vehicle side.
#[derive(Parser, Debug)]
#[command(name = "ruby-vehicle", version, about)]
struct Args {
    /// Path to the TOML model file describing this vehicle's radio links.
    #[arg(long)]
    config: PathBuf,

    /// This vehicle's id, stamped as `vehicle_id_src` on every outbound packet.
    #[arg(long, default_value_t = 1)]
    vehicle_id: u32,

    /// The ground controller's id, stamped as `vehicle_id_dest`.
    #[arg(long, default_value_t = 0)]
    controller_id: u32,

    /// Which capture program is producing video on this vehicle.
    #[arg(long, value_enum, default_value_t = CaptureProtocolArg::Majestic)]
    capture_protocol: CaptureProtocolArg,
}

const TELEMETRY_INTERVAL: Duration = Duration::from_millis(100);
const ADAPTIVE_TICK_INTERVAL: Duration = Duration::from_millis(10);

fn main() {
    ruby_link::logging::init();
    let args = Args::parse();

    let model = match load_model(&args.config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to load model from {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let scramble_key = if model.developer_flags.disable_scrambling {
        None
    } else {
        Some((0..16).map(|_| rand::random::<u8>()).collect::<Vec<u8>>())
    };

    let stack = match RadioStack::open(model, scramble_key) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open radio interfaces: {e}");
            std::process::exit(1);
        }
    };
    info!("vehicle {}: opened {} radio interface(s)", args.vehicle_id, stack.interface_count());

    let (capture_tx, capture_rx) = crossbeam_channel::unbounded();
    let adaptive = stack.adaptive_controller(args.capture_protocol.into(), capture_tx);

    std::thread::scope(|scope| {
        scope.spawn(|| stack.rx_engine().run());

        scope.spawn(|| {
            for cmd in capture_rx.iter() {
                info!("capture command: {cmd:?}");
            }
        });

        run_router(&stack, &adaptive, args.vehicle_id, args.controller_id);
    });
}

fn run_router(stack: &RadioStack, adaptive: &ruby_link::adaptive::AdaptiveVideoController, vehicle_id: u32, controller_id: u32) {
    let tx = stack.tx_engine();
    let controller_settings = ruby_link::config::ControllerSettings::default();
    let mut last_telemetry = Instant::now();
    let mut last_adaptive_tick = Instant::now();

    loop {
        if let Some(packet) = stack.queues.pop_next(ADAPTIVE_TICK_INTERVAL) {
            handle_inbound(&tx, &stack.model, &controller_settings, vehicle_id, controller_id, packet);
        }

        let now = Instant::now();
        if now.duration_since(last_adaptive_tick) >= ADAPTIVE_TICK_INTERVAL {
            adaptive.periodic_tick(now);
            last_adaptive_tick = now;
        }

        if now.duration_since(last_telemetry) >= TELEMETRY_INTERVAL {
            send_telemetry(&tx, &stack.model, &controller_settings, vehicle_id, controller_id);
            last_telemetry = now;
        }
    }
}

fn handle_inbound(
    tx: &ruby_link::tx::TxEngine<'_>,
    model: &ruby_link::config::Model,
    controller_settings: &ruby_link::config::ControllerSettings,
    vehicle_id: u32,
    controller_id: u32,
    packet: ruby_link::packet::Packet,
) {
    match PacketType::from_raw(packet.packet_type) {
        Some(PacketType::RubyPingClock) => {
            let mut request = TxRequest::default();
            request.packets.push(PacketSpec {
                packet_type: PacketType::RubyPingClockReply,
                stream_id: StreamId::Ping,
                vehicle_id_src: vehicle_id,
                vehicle_id_dest: controller_id,
                payload: packet.payload,
                compressed: false,
                explicit_stream_index: Some(packet.packet_index),
            });
            tx.send(model, controller_settings, request);
        }
        Some(other) => {
            info!("vehicle: received {other:?} ({} bytes)", packet.payload.len());
        }
        None => warn!("vehicle: received unknown packet type {}", packet.packet_type),
    }
}

fn send_telemetry(
    tx: &ruby_link::tx::TxEngine<'_>,
    model: &ruby_link::config::Model,
    controller_settings: &ruby_link::config::ControllerSettings,
    vehicle_id: u32,
    controller_id: u32,
) {
    let mut request = TxRequest::default();
    request.packets.push(PacketSpec {
        packet_type: PacketType::Telemetry,
        stream_id: StreamId::Telemetry,
        vehicle_id_src: vehicle_id,
        vehicle_id_dest: controller_id,
        payload: Vec::new(),
        compressed: true,
        explicit_stream_index: None,
    });
    tx.send(model, controller_settings, request);
}
