// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ground-controller-side radio link daemon.
//!
//! Mirrors `vehicle.rs`'s shape: one RX worker thread, one main-thread
//! router. The controller additionally drives the ping clock (it always
//! initiates pings, never replies to one) and is the side that owns
//! [`ruby_link::config::ControllerSettings`] for real, rather than the
//! vehicle's all-defaults stand-in.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{info, warn};

use ruby_link::config::{load_model, ControllerSettings};
use ruby_link::packet::{PacketType, StreamId};
use ruby_link::tx::{PacketSpec, TxRequest};
use ruby_link::RadioStack;

/// Runs the Ruby radio link layer on the ground controller side.
#[derive(Parser, Debug)]
#[command(name = "ruby-controller", version, about)]
struct Args {
    /// Path to the TOML model file describing the vehicle's radio links.
    #[arg(long)]
    config: PathBuf,

    /// Path to the controller-side settings file (card flags, preferred TX
    /// index). Loaded as plain TOML; absence means every card defaults to
    /// no preference and no link-lost override.
    #[arg(long)]
    controller_settings: Option<PathBuf>,

    /// This controller's id, stamped as `vehicle_id_src` on every outbound packet.
    #[arg(long, default_value_t = 0)]
    controller_id: u32,

    /// The vehicle's id, stamped as `vehicle_id_dest`.
    #[arg(long, default_value_t = 1)]
    vehicle_id: u32,

    /// Ping interval in milliseconds.
    #[arg(long, default_value_t = 250)]
    ping_interval_ms: u64,
}

const LINK_LOST_TIMEOUT: Duration = Duration::from_secs(2);
const POP_TIMEOUT: Duration = Duration::from_millis(10);

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

    let controller_settings = match &args.controller_settings {
        Some(path) => match std::fs::read_to_string(path).and_then(|s| {
            toml::from_str::<ControllerSettings>(&s).map_err(|e| std::io::Error::other(e.to_string()))
        }) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("failed to load controller settings from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ControllerSettings::default(),
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
    info!("controller {}: opened {} radio interface(s)", args.controller_id, stack.interface_count());

    std::thread::scope(|scope| {
        scope.spawn(|| stack.rx_engine().run());
        run_router(&stack, &controller_settings, &args);
    });
}

fn run_router(stack: &RadioStack, controller_settings: &ControllerSettings, args: &Args) {
    let tx = stack.tx_engine();
    let ping_interval = Duration::from_millis(args.ping_interval_ms);
    let mut last_ping = Instant::now();
    let mut last_ping_sent_at: Option<Instant> = None;
    let mut ping_seq: u32 = 0;
    let mut last_downlink_activity = Instant::now();

    loop {
        if let Some(packet) = stack.queues.pop_next(POP_TIMEOUT) {
            last_downlink_activity = Instant::now();
            handle_inbound(&stack.radio_stats, packet, &mut last_ping_sent_at);
        }

        let now = Instant::now();
        let link_lost = now.duration_since(last_downlink_activity) > LINK_LOST_TIMEOUT;
        stack.radio_stats.link_lost.store(link_lost, Ordering::Relaxed);
        if link_lost {
            warn!("controller: no downlink traffic in over {LINK_LOST_TIMEOUT:?}, marking link lost");
        }

        if now.duration_since(last_ping) >= ping_interval {
            send_ping(&tx, &stack.model, controller_settings, args, ping_seq, link_lost);
            last_ping_sent_at = Some(now);
            last_ping = now;
            ping_seq = ping_seq.wrapping_add(1);
        }
    }
}

fn handle_inbound(radio_stats: &ruby_link::stats::RadioStatsHub, packet: ruby_link::packet::Packet, last_ping_sent_at: &mut Option<Instant>) {
    match PacketType::from_raw(packet.packet_type) {
        Some(PacketType::RubyPingClockReply) => {
            if let Some(sent_at) = last_ping_sent_at.take() {
                let rtt_ms = sent_at.elapsed().as_millis() as u32;
                radio_stats.downlink_ping_rtt_ms.store(rtt_ms, Ordering::Relaxed);
                info!("controller: ping RTT {rtt_ms}ms");
            }
        }
        Some(other) => {
            info!("controller: received {other:?} ({} bytes)", packet.payload.len());
        }
        None => warn!("controller: received unknown packet type {}", packet.packet_type),
    }
}

fn send_ping(
    tx: &ruby_link::tx::TxEngine<'_>,
    model: &ruby_link::config::Model,
    controller_settings: &ControllerSettings,
    args: &Args,
    seq: u32,
    link_lost: bool,
) {
    let mut request = TxRequest::default();
    request.packets.push(PacketSpec {
        packet_type: PacketType::RubyPingClock,
        stream_id: StreamId::Ping,
        vehicle_id_src: args.controller_id,
        vehicle_id_dest: args.vehicle_id,
        payload: Vec::new(),
        compressed: false,
        explicit_stream_index: Some(seq),
    });
    let mut link_lost_settings = controller_settings.clone();
    link_lost_settings.link_to_vehicle_lost = link_lost;
    tx.send(model, &link_lost_settings, request);
}
