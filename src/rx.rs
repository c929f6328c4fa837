// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C4: the RX engine.
//!
//! One worker loops over every open-for-read, non-paused, non-broken
//! interface, drains it, frames raw bytes through C1, consults the
//! duplicate detector (C2), updates statistics (C7), and pushes the
//! decoded packet onto one of the two priority queues. See `SPEC_FULL.md`
//! §4.4 for the exact cadence and overrun-detection rules this module
//! implements.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::duplicate::DuplicateDetector;
use crate::interface::{AnyInterface, InterfaceId, InterfaceState, RadioInterface};
use crate::packet::header::{ShortHeader, SHORT_HEADER_LEN};
use crate::packet::{self, PacketType, ShortPacketReassembler};
use crate::queue::RxQueues;
use crate::stats::{AlarmThrottle, IndexGap, RadioStatsHub};

/// Readiness-poll timeout per loop iteration (Data Model invariant: exactly
/// one worker reads from any given interface handle at a time, so this is
/// also the maximum latency before a newly un-paused interface is noticed).
pub const READINESS_TIMEOUT: Duration = Duration::from_millis(20);
/// Read bursts drained per interface per loop iteration.
pub const MAX_BURSTS_PER_INTERFACE: usize = 3;
/// Default loop-iteration overrun threshold.
pub const DEFAULT_LOOP_TIMEOUT_INTERVAL: Duration = Duration::from_millis(15);
/// Cadence (in loop iterations) for stats aggregation and pending
/// thread-priority changes.
const STATS_CADENCE_ITERATIONS: u64 = 10;
/// A serial resync buffer that grows this large without ever finding a
/// valid short-packet header is almost certainly not aligned to a frame
/// boundary any more; the oldest bytes are discarded rather than retried
/// forever.
const SERIAL_RESYNC_DISCARD_THRESHOLD: usize = 400;
/// How many trailing bytes survive a resync discard.
const SERIAL_RESYNC_RETAIN_BYTES: usize = 256;
/// Cadence for queue-depth peak logging.
const QUEUE_PEAK_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Queue-depth peak counters reset every 10th peak-log tick.
const QUEUE_PEAK_RESET_TICKS: u32 = 10;
/// How long a tracked vehicle may go silent before "no packets received" is
/// logged again.
const VEHICLE_SILENCE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Applies a requested OS thread priority to the calling (RX worker)
/// thread. Actually raising a thread's scheduling priority is a
/// platform-specific syscall, so this crate only defines the seam; a real
/// deployment supplies an implementation, the same way [`crate::interface`]
/// only defines `RadioInterface` and leaves the hardware specifics to each
/// transport.
pub trait ThreadPriorityApplier: Send + Sync {
    fn apply(&self, priority: i32);
}

/// Applier used when the caller doesn't supply one: logs the request
/// without touching scheduling policy.
#[derive(Default)]
pub struct LoggingPriorityApplier;

impl ThreadPriorityApplier for LoggingPriorityApplier {
    fn apply(&self, priority: i32) {
        info!("rx engine: thread priority change to {priority} requested (no applier configured)");
    }
}

/// Aggregate counters exposed to the supervisor layer.
#[derive(Default)]
pub struct RxEngineStats {
    pub max_loop_overrun_ms: AtomicU32,
    pub slow_loops: AtomicU64,
    pub high_priority_queue_peak: AtomicUsize,
    pub regular_queue_peak: AtomicUsize,
    pub loop_iterations: AtomicU64,
}

struct PerInterfaceState {
    /// Counting pause: excluded from the readiness set whenever this is
    /// > 0. Kept separate from the interface's own [`InterfaceState`],
    /// which reflects the transport's administrative/broken state instead.
    paused: AtomicU32,
    broken: AtomicBool,
    reassembler: Mutex<ShortPacketReassembler>,
    /// Raw serial bytes not yet aligned to a short-packet header boundary.
    /// Distinct from `reassembler`'s scratch, which only ever holds bytes
    /// already known to belong to a validated short-packet fragment.
    serial_resync: Mutex<Vec<u8>>,
    /// Bytes skipped since the last time a valid short-packet header was
    /// found at the front of `serial_resync`.
    serial_resync_bad_run: AtomicUsize,
    last_vehicle_seen_at: Mutex<Option<Instant>>,
    silence_log_throttle: AlarmThrottle,
}

impl Default for PerInterfaceState {
    fn default() -> Self {
        Self {
            paused: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            reassembler: Mutex::new(ShortPacketReassembler::new()),
            serial_resync: Mutex::new(Vec::new()),
            serial_resync_bad_run: AtomicUsize::new(0),
            last_vehicle_seen_at: Mutex::new(None),
            silence_log_throttle: AlarmThrottle::new(VEHICLE_SILENCE_LOG_INTERVAL),
        }
    }
}

/// The C4 worker. Owns no interfaces itself (they live in the caller's
/// `Vec<Mutex<AnyInterface>>`, shared with the TX engine for the serial
/// write path) but owns everything else needed to turn raw bytes into
/// queued packets: the duplicate detector, per-interface reassembly
/// scratch, and the aggregate loop/queue statistics.
pub struct RxEngine<'a> {
    interfaces: &'a [Mutex<AnyInterface>],
    queues: &'a RxQueues,
    radio_stats: &'a RadioStatsHub,
    scramble_key: Option<Vec<u8>>,
    dedup: Mutex<DuplicateDetector>,
    per_interface: Vec<PerInterfaceState>,
    quit: AtomicBool,
    loop_timeout_interval: Duration,
    stats: RxEngineStats,
    queue_peak_reset_countdown: AtomicU32,
    /// Priority the model currently asks for; may change at runtime.
    requested_priority: AtomicI32,
    /// Priority last handed to `priority_applier`; compared against
    /// `requested_priority` at the stats cadence so a change is applied
    /// exactly once.
    last_applied_priority: AtomicI32,
    priority_applier: Box<dyn ThreadPriorityApplier>,
}

impl<'a> RxEngine<'a> {
    pub fn new(
        interfaces: &'a [Mutex<AnyInterface>],
        queues: &'a RxQueues,
        radio_stats: &'a RadioStatsHub,
        scramble_key: Option<Vec<u8>>,
        initial_thread_priority: i32,
    ) -> Self {
        Self::with_priority_applier(
            interfaces,
            queues,
            radio_stats,
            scramble_key,
            initial_thread_priority,
            Box::new(LoggingPriorityApplier),
        )
    }

    pub fn with_priority_applier(
        interfaces: &'a [Mutex<AnyInterface>],
        queues: &'a RxQueues,
        radio_stats: &'a RadioStatsHub,
        scramble_key: Option<Vec<u8>>,
        initial_thread_priority: i32,
        priority_applier: Box<dyn ThreadPriorityApplier>,
    ) -> Self {
        let per_interface = (0..interfaces.len()).map(|_| PerInterfaceState::default()).collect();
        priority_applier.apply(initial_thread_priority);
        Self {
            interfaces,
            queues,
            radio_stats,
            scramble_key,
            dedup: Mutex::new(DuplicateDetector::default()),
            per_interface,
            quit: AtomicBool::new(false),
            loop_timeout_interval: DEFAULT_LOOP_TIMEOUT_INTERVAL,
            stats: RxEngineStats::default(),
            queue_peak_reset_countdown: AtomicU32::new(QUEUE_PEAK_RESET_TICKS),
            requested_priority: AtomicI32::new(initial_thread_priority),
            last_applied_priority: AtomicI32::new(initial_thread_priority),
            priority_applier,
        }
    }

    /// Requests a new RX worker thread priority, applied at the next
    /// stats-cadence tick (`SPEC_FULL.md` §4.4) rather than immediately.
    pub fn set_requested_priority(&self, priority: i32) {
        self.requested_priority.store(priority, Ordering::Relaxed);
    }

    fn apply_pending_priority(&self) {
        let requested = self.requested_priority.load(Ordering::Relaxed);
        let last = self.last_applied_priority.load(Ordering::Relaxed);
        if requested != last {
            info!("rx engine: new thread priority must be set, from {last} to {requested}");
            self.priority_applier.apply(requested);
            self.last_applied_priority.store(requested, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &RxEngineStats {
        &self.stats
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Increments interface `id`'s pause counter; it is excluded from the
    /// readiness set while the counter is > 0. Matches any number of
    /// outstanding pause/resume pairs from independent callers.
    pub fn pause(&self, id: InterfaceId) {
        if let Some(state) = self.per_interface.get(id.0) {
            state.paused.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn resume(&self, id: InterfaceId) {
        if let Some(state) = self.per_interface.get(id.0) {
            state.paused.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1))).ok();
        }
    }

    fn is_paused(&self, id: InterfaceId) -> bool {
        self.per_interface
            .get(id.0)
            .map(|s| s.paused.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    pub fn is_broken(&self, id: InterfaceId) -> bool {
        self.per_interface
            .get(id.0)
            .map(|s| s.broken.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn mark_broken(&self, id: InterfaceId) {
        if let Some(state) = self.per_interface.get(id.0) {
            state.broken.store(true, Ordering::SeqCst);
        }
    }

    /// `true` if any tracked interface is currently broken; the supervisor
    /// polls this to decide whether to restart the radio stack.
    pub fn any_interface_broken(&self) -> bool {
        self.per_interface.iter().any(|s| s.broken.load(Ordering::SeqCst))
    }

    /// Clears every interface's broken flag, re-including them in the
    /// readiness set from the next loop iteration onward. The transport
    /// itself (e.g. reopening a serial port) is the caller's job.
    pub fn reset_broken_state(&self) {
        for state in &self.per_interface {
            state.broken.store(false, Ordering::SeqCst);
        }
    }

    fn readiness_set(&self) -> Vec<usize> {
        (0..self.interfaces.len())
            .filter(|&i| {
                let id = InterfaceId(i);
                if self.is_broken(id) || self.is_paused(id) {
                    return false;
                }
                let iface = self.interfaces[i].lock().unwrap();
                iface.state() == InterfaceState::Up
            })
            .collect()
    }

    /// Runs one loop iteration: rebuilds the readiness set, drains each
    /// ready interface up to [`MAX_BURSTS_PER_INTERFACE`] times, and
    /// returns the number of packets enqueued. Exposed separately from
    /// [`Self::run`] so tests can single-step the loop deterministically.
    pub fn run_once(&self) -> usize {
        let start = Instant::now();
        let mut enqueued = 0;

        for idx in self.readiness_set() {
            for _ in 0..MAX_BURSTS_PER_INTERFACE {
                let raw = {
                    let mut iface = self.interfaces[idx].lock().unwrap();
                    match iface.try_recv() {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => break,
                        Err(_) => {
                            self.mark_broken(InterfaceId(idx));
                            break;
                        }
                    }
                };
                enqueued += self.ingest(InterfaceId(idx), &raw);
            }
        }

        self.stats.loop_iterations.fetch_add(1, Ordering::Relaxed);
        let iteration = self.stats.loop_iterations.load(Ordering::Relaxed);

        let elapsed = start.elapsed();
        if elapsed > self.loop_timeout_interval {
            self.stats.slow_loops.fetch_add(1, Ordering::Relaxed);
            let ms = elapsed.as_millis() as u32;
            self.stats
                .max_loop_overrun_ms
                .fetch_max(ms, Ordering::Relaxed);
            warn!("rx loop iteration overran {:?} (budget {:?})", elapsed, self.loop_timeout_interval);
        }

        if iteration % STATS_CADENCE_ITERATIONS == 0 {
            self.log_vehicle_stats();
            self.apply_pending_priority();
        }

        self.update_queue_peaks();

        enqueued
    }

    /// Frames `raw` (which may be one or more chained or short packets),
    /// feeding serial interfaces through reassembly first, and enqueues
    /// every complete packet. Returns the number of packets enqueued.
    fn ingest(&self, interface: InterfaceId, raw: &[u8]) -> usize {
        let kind = self.interfaces[interface.0].lock().unwrap().kind();
        let mut count = 0;

        match kind {
            crate::interface::InterfaceKind::Serial => {
                count += self.ingest_serial(interface, raw);
            }
            crate::interface::InterfaceKind::Wifi => {
                for decoded in packet::iter_chained(raw) {
                    match decoded {
                        Ok(p) => {
                            self.deliver(interface, p);
                            count += 1;
                        }
                        Err(_) => {
                            self.radio_stats.set_bad_data_on_current_rx_interval(interface);
                        }
                    }
                }
            }
        }
        count
    }

    /// Feeds freshly read serial bytes through resync (skipping bytes until
    /// a short-packet header boundary is found) and then through
    /// reassembly. `SPEC_FULL.md` §4.3: a resync run of
    /// [`SERIAL_RESYNC_DISCARD_THRESHOLD`] bytes without ever finding a
    /// valid header discards everything but the last
    /// [`SERIAL_RESYNC_RETAIN_BYTES`] and counts as bad data.
    fn ingest_serial(&self, interface: InterfaceId, raw: &[u8]) -> usize {
        let state = &self.per_interface[interface.0];
        let mut resync = state.serial_resync.lock().unwrap();
        resync.extend_from_slice(raw);
        let mut count = 0;

        loop {
            if resync.len() < SHORT_HEADER_LEN {
                break;
            }
            match ShortHeader::decode(&resync) {
                Some(header) => {
                    let total = SHORT_HEADER_LEN + header.data_length as usize;
                    if resync.len() < total {
                        break; // wait for the rest of this short packet
                    }
                    state.serial_resync_bad_run.store(0, Ordering::Relaxed);
                    let frame: Vec<u8> = resync.drain(..total).collect();

                    let mut reassembler = state.reassembler.lock().unwrap();
                    match reassembler.feed(&frame) {
                        Ok(Some(p)) => {
                            drop(reassembler);
                            self.deliver(interface, p);
                            count += 1;
                        }
                        Ok(None) => {}
                        Err(_) => {
                            self.radio_stats.set_bad_data_on_current_rx_interval(interface);
                        }
                    }
                }
                None => {
                    resync.remove(0);
                    let bad_run = state.serial_resync_bad_run.fetch_add(1, Ordering::Relaxed) + 1;
                    if bad_run >= SERIAL_RESYNC_DISCARD_THRESHOLD {
                        let keep_from = resync.len().saturating_sub(SERIAL_RESYNC_RETAIN_BYTES);
                        resync.drain(..keep_from);
                        state.serial_resync_bad_run.store(0, Ordering::Relaxed);
                        self.radio_stats.set_bad_data_on_current_rx_interval(interface);
                    }
                }
            }
        }
        count
    }

    /// Runs a decoded packet through dedup, statistics, gap detection, and
    /// queue classification.
    fn deliver(&self, interface: InterfaceId, p: crate::packet::Packet) {
        let now = Instant::now();
        self.radio_stats.on_new_radio_packet_received(interface, p.total_length);

        let is_duplicate = self.dedup.lock().unwrap().is_duplicate(
            interface.0,
            p.vehicle_id_src,
            p.stream_id,
            p.packet_index,
            now,
        );
        if is_duplicate {
            if let Some(entry) = self.radio_stats.interface(interface) {
                entry.stats.record_duplicate();
            }
            return;
        }

        let gap = self.radio_stats.with_vehicle(p.vehicle_id_src, |vehicle| {
            *self.per_interface[interface.0].last_vehicle_seen_at.lock().unwrap() = Some(now);
            let gap = vehicle.observe_index(interface, p.radio_link_packet_index());
            match gap {
                IndexGap::First | IndexGap::InOrder => vehicle.total_good += 1,
                IndexGap::Forward(n) => {
                    vehicle.total_good += 1;
                    vehicle.total_lost += n as u64;
                }
                IndexGap::Backward => vehicle.total_bad += 1,
            }
            gap
        });

        let quality = match gap {
            IndexGap::Backward => 0,
            IndexGap::Forward(_) => 60,
            _ => 100,
        };
        self.radio_stats.on_unique_packet_received(interface, quality);

        let high_priority = PacketType::from_raw(p.packet_type)
            .map(|t| t.is_high_priority())
            .unwrap_or(false);

        let dropped = if high_priority {
            self.queues.high_priority.push(p)
        } else {
            self.queues.regular.push(p)
        };
        if dropped {
            debug!("rx queue full, dropped oldest entry for interface {}", interface.0);
        }
    }

    fn update_queue_peaks(&self) {
        let hp = self.queues.high_priority.len();
        let reg = self.queues.regular.len();
        self.stats.high_priority_queue_peak.fetch_max(hp, Ordering::Relaxed);
        self.stats.regular_queue_peak.fetch_max(reg, Ordering::Relaxed);
    }

    fn log_vehicle_stats(&self) {
        let count = self.radio_stats.tracked_vehicle_count();
        debug!("rx engine: {count} vehicle(s) tracked");

        let now = Instant::now();
        for (idx, state) in self.per_interface.iter().enumerate() {
            let last_seen = *state.last_vehicle_seen_at.lock().unwrap();
            let silent = match last_seen {
                Some(t) => now.duration_since(t) >= VEHICLE_SILENCE_LOG_INTERVAL,
                None => false,
            };
            if silent && state.silence_log_throttle.should_fire(now) {
                info!("interface {idx}: no packets received in over {VEHICLE_SILENCE_LOG_INTERVAL:?}");
            }
        }
    }

    /// Blocks for up to [`READINESS_TIMEOUT`] and then runs one iteration,
    /// repeating until [`Self::request_quit`] is called. Intended to be
    /// the body of the dedicated RX worker thread.
    pub fn run(&self) {
        let mut peak_log_due = Instant::now() + QUEUE_PEAK_LOG_INTERVAL;
        info!("rx engine starting over {} interface(s)", self.interfaces.len());
        while !self.should_quit() {
            self.run_once();
            if Instant::now() >= peak_log_due {
                let hp = self.stats.high_priority_queue_peak.load(Ordering::Relaxed);
                let reg = self.stats.regular_queue_peak.load(Ordering::Relaxed);
                info!("rx queue peaks: high_priority={hp} regular={reg}");
                peak_log_due = Instant::now() + QUEUE_PEAK_LOG_INTERVAL;

                let remaining = self.queue_peak_reset_countdown.fetch_sub(1, Ordering::Relaxed);
                if remaining <= 1 {
                    self.stats.high_priority_queue_peak.store(0, Ordering::Relaxed);
                    self.stats.regular_queue_peak.store(0, Ordering::Relaxed);
                    self.queue_peak_reset_countdown.store(QUEUE_PEAK_RESET_TICKS, Ordering::Relaxed);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        info!("rx engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::loopback::LoopbackInterface;
    use crate::packet::header::{FullHeader, PacketFlags, FULL_HEADER_LEN};
    use crate::packet::{frame_out, StreamId};

    fn telemetry_frame(idx: u32, radio_link_idx: u16) -> Vec<u8> {
        let payload = b"hi";
        let total_length = (FULL_HEADER_LEN + payload.len()) as u16;
        let mut buf = vec![0u8; total_length as usize];
        let header = FullHeader {
            crc32: 0,
            packet_flags: PacketFlags::empty(),
            packet_type: PacketType::Telemetry as u8,
            stream_packet_idx: ((StreamId::Telemetry as u32) << 24) | idx,
            vehicle_id_src: 42,
            vehicle_id_dest: 1,
            radio_link_packet_index: radio_link_idx,
            total_length,
        };
        header.encode(&mut buf);
        buf[FULL_HEADER_LEN..].copy_from_slice(payload);
        frame_out(&mut buf, None).unwrap();
        buf
    }

    fn ping_frame(idx: u32) -> Vec<u8> {
        let total_length = FULL_HEADER_LEN as u16;
        let mut buf = vec![0u8; total_length as usize];
        let header = FullHeader {
            crc32: 0,
            packet_flags: PacketFlags::empty(),
            packet_type: PacketType::RubyPingClock as u8,
            stream_packet_idx: ((StreamId::Ping as u32) << 24) | idx,
            vehicle_id_src: 42,
            vehicle_id_dest: 1,
            radio_link_packet_index: 0,
            total_length,
        };
        header.encode(&mut buf);
        frame_out(&mut buf, None).unwrap();
        buf
    }

    #[test]
    fn single_interface_happy_path() {
        let (mut sender, receiver) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        for i in 0..1000u32 {
            sender.send(&telemetry_frame(i, i as u16)).unwrap();
        }
        for _ in 0..10 {
            engine.run_once();
        }

        assert_eq!(queues.regular.len() + queues.regular.dropped_count() as usize, 1000);
        assert!(!engine.any_interface_broken());
    }

    #[test]
    fn pinging_packets_take_high_priority_queue() {
        let (mut sender, receiver) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        sender.send(&telemetry_frame(0, 0)).unwrap();
        sender.send(&ping_frame(0)).unwrap();
        engine.run_once();

        assert_eq!(queues.high_priority.len(), 1);
        assert_eq!(queues.regular.len(), 1);
    }

    #[test]
    fn diversity_dedup_drops_second_copy() {
        let (mut a, receiver_a) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(10), 1_000_000);
        let (mut b, receiver_b) = LoopbackInterface::pair(InterfaceId(1), InterfaceId(11), 1_000_000);
        let interfaces = vec![
            Mutex::new(AnyInterface::Loopback(receiver_a)),
            Mutex::new(AnyInterface::Loopback(receiver_b)),
        ];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        let frame = telemetry_frame(7, 7);
        a.send(&frame).unwrap();
        b.send(&frame).unwrap();
        engine.run_once();

        assert_eq!(queues.regular.len(), 1);
    }

    #[test]
    fn pause_excludes_interface_from_readiness() {
        let (mut sender, receiver) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        engine.pause(InterfaceId(0));
        sender.send(&telemetry_frame(0, 0)).unwrap();
        engine.run_once();
        assert_eq!(queues.regular.len(), 0);

        engine.resume(InterfaceId(0));
        engine.run_once();
        assert_eq!(queues.regular.len(), 1);
    }

    #[test]
    fn corrupt_body_is_dropped_and_counted_as_bad_data() {
        let (mut sender, receiver) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        let mut frame = telemetry_frame(0, 0);
        *frame.last_mut().unwrap() ^= 0xFF;
        sender.send(&frame).unwrap();
        engine.run_once();

        assert_eq!(queues.regular.len(), 0);
        assert_eq!(stats.interface(InterfaceId(0)).unwrap().stats.rx_dropped_crc.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn serial_resync_discards_prefix_after_sustained_garbage() {
        let (mut sender, receiver) = LoopbackInterface::serial_pair(InterfaceId(0), InterfaceId(1), 56_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let engine = RxEngine::new(&interfaces, &queues, &stats, None, 0);

        // Neither 0x00 nor 0xFF is a valid short-packet start/continuation
        // byte, so every byte of this run fails resync and none of it is a
        // genuine header the reassembler could still be waiting on.
        sender.send(&vec![0x00u8; 500]).unwrap();
        for _ in 0..5 {
            engine.run_once();
        }

        assert_eq!(queues.regular.len() + queues.high_priority.len(), 0);
        assert!(
            engine.per_interface[0].serial_resync.lock().unwrap().len() <= SERIAL_RESYNC_RETAIN_BYTES,
            "resync buffer should have been trimmed to the retained tail"
        );
        assert!(stats.interface(InterfaceId(0)).unwrap().stats.rx_dropped_crc.load(Ordering::Relaxed) >= 1);

        // A genuine short packet sent right after still frames correctly,
        // proving resync recovered rather than wedging on the garbage.
        let frame = telemetry_frame(0, 0);
        let mut short = vec![0u8; SHORT_HEADER_LEN + frame.len()];
        let header = crate::packet::header::ShortHeader {
            start_header: crate::packet::header::SHORT_START_PACKET,
            packet_id: 0,
            data_length: frame.len() as u8,
        };
        header.encode(&mut short);
        short[SHORT_HEADER_LEN..].copy_from_slice(&frame);
        sender.send(&short).unwrap();
        engine.run_once();

        assert_eq!(queues.regular.len(), 1);
    }

    #[derive(Default)]
    struct RecordingPriorityApplier {
        applied: Mutex<Vec<i32>>,
    }

    impl ThreadPriorityApplier for RecordingPriorityApplier {
        fn apply(&self, priority: i32) {
            self.applied.lock().unwrap().push(priority);
        }
    }

    #[test]
    fn pending_priority_is_applied_only_at_the_stats_cadence() {
        let (_sender, receiver) = LoopbackInterface::pair(InterfaceId(0), InterfaceId(1), 1_000_000);
        let interfaces = vec![Mutex::new(AnyInterface::Loopback(receiver))];
        let queues = RxQueues::new(150, 2_000);
        let stats = RadioStatsHub::new(interfaces.len(), 1);
        let applier = std::sync::Arc::new(RecordingPriorityApplier::default());
        let engine = RxEngine::with_priority_applier(
            &interfaces,
            &queues,
            &stats,
            None,
            5,
            Box::new(ArcApplier(applier.clone())),
        );
        // The initial priority is applied once up front, outside the loop.
        assert_eq!(*applier.applied.lock().unwrap(), vec![5]);

        engine.set_requested_priority(9);
        for _ in 0..(STATS_CADENCE_ITERATIONS - 1) {
            engine.run_once();
        }
        // Not yet at a cadence tick: still just the initial apply.
        assert_eq!(*applier.applied.lock().unwrap(), vec![5]);

        engine.run_once();
        assert_eq!(*applier.applied.lock().unwrap(), vec![5, 9]);

        // A second cadence tick with no further change applies nothing new.
        for _ in 0..STATS_CADENCE_ITERATIONS {
            engine.run_once();
        }
        assert_eq!(*applier.applied.lock().unwrap(), vec![5, 9]);
    }

    struct ArcApplier(std::sync::Arc<RecordingPriorityApplier>);

    impl ThreadPriorityApplier for ArcApplier {
        fn apply(&self, priority: i32) {
            self.0.apply(priority);
        }
    }
}
