// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C7: rolling radio statistics.
//!
//! Every counter here is mutated from exactly one thread (the RX worker for
//! RX counters, the TX worker for TX counters); readers (the adaptive
//! controller, CLI status output) only ever load atomically. This mirrors
//! the single-writer discipline `SPEC_FULL.md` §4.7 calls for instead of
//! wrapping every counter in a mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::interface::InterfaceId;
use crate::packet::MAX_RADIO_STREAMS;

const ORD: Ordering = Ordering::Relaxed;

/// Rolling window length for the RX-quality history ring used by the
/// adaptive controller (C8) to smooth over single-sample noise.
pub const RX_QUALITY_HISTORY_LEN: usize = 20;

/// At most this many distinct source vehicles are tracked concurrently; the
/// first free slot is allocated on first sighting, the last slot is reused
/// once all are taken (Data Model §3, "Vehicle Rx state").
pub const MAX_CONCURRENT_VEHICLES: usize = 4;

/// Per-interface counters, one instance owned by the RX/TX engines per
/// physical [`crate::interface::InterfaceId`].
pub struct InterfaceStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_dropped_duplicate: AtomicU64,
    pub rx_dropped_crc: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_dropped_overload: AtomicU64,
    /// Last-observed RSSI in dBm, or `i32::MIN` if never set.
    rssi_dbm: AtomicI32,
}

impl Default for InterfaceStats {
    fn default() -> Self {
        Self {
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_dropped_duplicate: AtomicU64::new(0),
            rx_dropped_crc: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_dropped_overload: AtomicU64::new(0),
            rssi_dbm: AtomicI32::new(i32::MIN),
        }
    }
}

impl InterfaceStats {
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, ORD);
        self.rx_bytes.fetch_add(bytes as u64, ORD);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, ORD);
        self.tx_bytes.fetch_add(bytes as u64, ORD);
    }

    pub fn record_duplicate(&self) {
        self.rx_dropped_duplicate.fetch_add(1, ORD);
    }

    pub fn record_crc_failure(&self) {
        self.rx_dropped_crc.fetch_add(1, ORD);
    }

    pub fn record_tx_overload(&self) {
        self.tx_dropped_overload.fetch_add(1, ORD);
    }

    pub fn set_rssi_dbm(&self, rssi: i32) {
        self.rssi_dbm.store(rssi, ORD);
    }

    pub fn rssi_dbm(&self) -> Option<i32> {
        match self.rssi_dbm.load(ORD) {
            i32::MIN => None,
            v => Some(v),
        }
    }
}

impl std::fmt::Debug for InterfaceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceStats")
            .field("rx_packets", &self.rx_packets.load(ORD))
            .field("rx_bytes", &self.rx_bytes.load(ORD))
            .field("rx_dropped_duplicate", &self.rx_dropped_duplicate.load(ORD))
            .field("rx_dropped_crc", &self.rx_dropped_crc.load(ORD))
            .field("tx_packets", &self.tx_packets.load(ORD))
            .field("tx_bytes", &self.tx_bytes.load(ORD))
            .field("tx_dropped_overload", &self.tx_dropped_overload.load(ORD))
            .field("rssi_dbm", &self.rssi_dbm())
            .finish()
    }
}

/// Per-stream counters: sequence-gap tracking feeds both quality reporting
/// and the video retransmit-request path.
#[derive(Default)]
pub struct StreamStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub sequence_gaps: AtomicU64,
    last_packet_index: AtomicU32,
    has_last: std::sync::atomic::AtomicBool,
}

impl StreamStats {
    pub fn record(&self, packet_index: u32, bytes: usize) {
        self.packets.fetch_add(1, ORD);
        self.bytes.fetch_add(bytes as u64, ORD);

        if self.has_last.load(ORD) {
            let expected = self.last_packet_index.load(ORD).wrapping_add(1);
            if packet_index != expected && packet_index > expected {
                self.sequence_gaps.fetch_add(1, ORD);
            }
        } else {
            self.has_last.store(true, ORD);
        }
        self.last_packet_index.store(packet_index, ORD);
    }
}

/// A fixed-length ring of recent RX-quality samples (0-100), used to smooth
/// the adaptive controller's bitrate decisions per `SPEC_FULL.md` §4.8.
pub struct QualityHistory {
    samples: std::sync::Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl Default for QualityHistory {
    fn default() -> Self {
        Self::new(RX_QUALITY_HISTORY_LEN)
    }
}

impl QualityHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, quality_percent: u8) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(quality_percent.min(100));
    }

    /// Average of the current window, or `None` if no samples yet.
    pub fn average(&self) -> Option<u8> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let sum: u32 = samples.iter().map(|&s| s as u32).sum();
        Some((sum / samples.len() as u32) as u8)
    }
}

/// Tracks the time of the last occurrence of a rate-limited log/alarm so
/// repeated conditions (e.g. serial overload) don't flood the log. Mirrors
/// the 20-second alarm throttle in `SPEC_FULL.md` §4.6.
pub struct AlarmThrottle {
    last_fired: std::sync::Mutex<Option<Instant>>,
    interval: Duration,
}

impl AlarmThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_fired: std::sync::Mutex::new(None),
            interval,
        }
    }

    /// Returns `true` if the alarm should fire now, recording the firing
    /// time so the next call within `interval` returns `false`.
    pub fn should_fire(&self, now: Instant) -> bool {
        let mut last = self.last_fired.lock().unwrap();
        match *last {
            Some(t) if now.duration_since(t) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Per-vehicle counters (Data Model §3, "Vehicle Rx state"). Owned
/// exclusively by the RX worker; not wrapped in atomics because the whole
/// struct is behind the hub's single vehicle-table mutex.
#[derive(Default)]
pub struct VehicleRxState {
    pub vehicle_id: Option<u32>,
    pub total_good: u64,
    pub total_bad: u64,
    pub total_lost: u64,
    pub temp_good: u32,
    pub temp_bad: u32,
    pub temp_lost: u32,
    pub min_packets_per_sec: u32,
    pub max_packets_per_sec: u32,
    /// Last radio-link packet index seen per interface, for gap detection.
    last_radio_link_index: Vec<Option<u16>>,
}

impl VehicleRxState {
    fn for_vehicle(vehicle_id: u32) -> Self {
        Self {
            vehicle_id: Some(vehicle_id),
            ..Default::default()
        }
    }

    /// Compares `radio_link_packet_index` for `interface` against the last
    /// value seen on that interface and classifies the gap. A strict
    /// decrease is only ever reported as `Backward`; per the resolved open
    /// question in `SPEC_FULL.md` §9, this crate never treats it as a peer
    /// restart signal.
    pub fn observe_index(&mut self, interface: InterfaceId, index: u16) -> IndexGap {
        if self.last_radio_link_index.len() <= interface.0 {
            self.last_radio_link_index.resize(interface.0 + 1, None);
        }
        let slot = &mut self.last_radio_link_index[interface.0];
        let gap = match *slot {
            None => IndexGap::First,
            Some(last) if index == last.wrapping_add(1) => IndexGap::InOrder,
            Some(last) if index > last.wrapping_add(1) => IndexGap::Forward((index - last - 1) as u32),
            Some(_) => IndexGap::Backward,
        };
        *slot = Some(index);
        gap
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexGap {
    First,
    InOrder,
    Forward(u32),
    Backward,
}

/// A one-second tumbling byte-rate window, reset wholesale once it has been
/// open for a full second rather than decayed continuously. Mirrors the
/// overload-throttle window the TX engine keeps per serial interface.
struct RollingByteRate {
    window_start: Mutex<Instant>,
    bytes: AtomicU64,
    bytes_per_sec: AtomicU64,
}

impl RollingByteRate {
    fn new(now: Instant) -> Self {
        Self {
            window_start: Mutex::new(now),
            bytes: AtomicU64::new(0),
            bytes_per_sec: AtomicU64::new(0),
        }
    }

    fn record(&self, bytes: usize, now: Instant) {
        let mut start = self.window_start.lock().unwrap();
        if now.duration_since(*start).as_secs() >= 1 {
            self.bytes_per_sec.store(self.bytes.swap(0, ORD), ORD);
            *start = now;
        }
        self.bytes.fetch_add(bytes as u64, ORD);
    }

    /// Bitrate of the last completed one-second window, in bits/sec.
    fn bits_per_sec(&self) -> u64 {
        self.bytes_per_sec.load(ORD) * 8
    }
}

/// Per-local-link statistics: which interface last carried TX traffic, and
/// per-stream TX packet counts and bitrate (Data Model §3, "Radio
/// statistics").
pub struct LinkStats {
    last_tx_interface: Mutex<Option<InterfaceId>>,
    stream_tx_packets: [AtomicU64; MAX_RADIO_STREAMS],
    stream_tx_rate: Vec<RollingByteRate>,
}

impl Default for LinkStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            last_tx_interface: Mutex::new(None),
            stream_tx_packets: Default::default(),
            stream_tx_rate: (0..MAX_RADIO_STREAMS).map(|_| RollingByteRate::new(now)).collect(),
        }
    }
}

impl LinkStats {
    pub fn set_tx_card_for_link(&self, interface: InterfaceId) {
        *self.last_tx_interface.lock().unwrap() = Some(interface);
    }

    pub fn last_tx_interface(&self) -> Option<InterfaceId> {
        *self.last_tx_interface.lock().unwrap()
    }

    pub fn on_packet_sent_for_stream(&self, stream_id: usize, bytes: usize, now: Instant) {
        if let Some(counter) = self.stream_tx_packets.get(stream_id) {
            counter.fetch_add(1, ORD);
        }
        if let Some(rate) = self.stream_tx_rate.get(stream_id) {
            rate.record(bytes, now);
        }
    }

    /// Bitrate of `stream_id` over the last completed one-second window.
    pub fn stream_bitrate_bps(&self, stream_id: usize) -> u64 {
        self.stream_tx_rate.get(stream_id).map(|r| r.bits_per_sec()).unwrap_or(0)
    }
}

/// One cache-line-padded entry per physical interface: RX/TX byte/packet
/// counters plus the rolling RX-quality history C8 reads from. Padding
/// matters here because the RX worker and the TX writer thread each touch a
/// different interface's entry constantly and must not false-share a line.
pub struct InterfaceEntry {
    pub stats: InterfaceStats,
    pub quality_history: QualityHistory,
    last_tx_rate_bps: AtomicI32,
    /// Throttles `ALARM_ID_RADIO_LINK_DATA_OVERLOAD` to at most once per
    /// 20s per interface (`SPEC_FULL.md` §4.6).
    overload_alarm: AlarmThrottle,
}

impl Default for InterfaceEntry {
    fn default() -> Self {
        Self {
            stats: InterfaceStats::default(),
            quality_history: QualityHistory::default(),
            last_tx_rate_bps: AtomicI32::new(0),
            overload_alarm: AlarmThrottle::new(Duration::from_secs(20)),
        }
    }
}

impl InterfaceEntry {
    /// Quality relative to other interfaces on the same link, 0-100,
    /// derived from the rolling RX-quality average. Used by C5 pass 2.
    pub fn rx_relative_quality(&self) -> u8 {
        self.quality_history.average().unwrap_or(0)
    }

    pub fn set_tx_radio_datarate_for_packet(&self, rate_bps: i32) {
        self.last_tx_rate_bps.store(rate_bps, ORD);
    }

    pub fn last_tx_rate_bps(&self) -> i32 {
        self.last_tx_rate_bps.load(ORD)
    }

    /// `true` at most once per 20s window; records the firing time.
    pub fn should_raise_overload_alarm(&self, now: Instant) -> bool {
        self.overload_alarm.should_fire(now)
    }
}

/// Central statistics hub (C7): one per radio stack, shared by the RX
/// worker, the TX writer, and the adaptive controller. All mutation paths
/// mirror the named operations in `SPEC_FULL.md` §4.7.
pub struct RadioStatsHub {
    pub interfaces: Vec<CachePadded<InterfaceEntry>>,
    pub links: Vec<LinkStats>,
    vehicles: Mutex<Vec<VehicleRxState>>,
    pub uplink_ping_rtt_ms: AtomicU32,
    pub downlink_ping_rtt_ms: AtomicU32,
    pub link_lost: AtomicBool,
    pub rx_air_gap_max_ms: AtomicU32,
}

impl RadioStatsHub {
    pub fn new(interface_count: usize, link_count: usize) -> Self {
        Self {
            interfaces: (0..interface_count)
                .map(|_| CachePadded::new(InterfaceEntry::default()))
                .collect(),
            links: (0..link_count).map(|_| LinkStats::default()).collect(),
            vehicles: Mutex::new(Vec::with_capacity(MAX_CONCURRENT_VEHICLES)),
            uplink_ping_rtt_ms: AtomicU32::new(0),
            downlink_ping_rtt_ms: AtomicU32::new(0),
            link_lost: AtomicBool::new(false),
            rx_air_gap_max_ms: AtomicU32::new(0),
        }
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&InterfaceEntry> {
        self.interfaces.get(id.0).map(|e| &**e)
    }

    pub fn link(&self, id: usize) -> Option<&LinkStats> {
        self.links.get(id)
    }

    pub fn on_packet_sent_on_interface(&self, interface: InterfaceId, bytes: usize) {
        if let Some(entry) = self.interface(interface) {
            entry.stats.record_tx(bytes);
        }
    }

    pub fn on_packet_sent_on_link(&self, link_id: usize, stream_id: usize, size: usize, count: u32) {
        if let Some(link) = self.link(link_id) {
            let now = Instant::now();
            for _ in 0..count {
                link.on_packet_sent_for_stream(stream_id, size, now);
            }
        }
    }

    pub fn on_new_radio_packet_received(&self, interface: InterfaceId, bytes: usize) {
        if let Some(entry) = self.interface(interface) {
            entry.stats.record_rx(bytes);
        }
    }

    pub fn on_unique_packet_received(&self, interface: InterfaceId, quality_percent: u8) {
        if let Some(entry) = self.interface(interface) {
            entry.quality_history.push(quality_percent);
        }
    }

    pub fn set_bad_data_on_current_rx_interval(&self, interface: InterfaceId) {
        if let Some(entry) = self.interface(interface) {
            entry.stats.record_crc_failure();
            entry.quality_history.push(0);
        }
    }

    pub fn set_tx_radio_datarate_for_packet(&self, interface: InterfaceId, rate_bps: i32) {
        if let Some(entry) = self.interface(interface) {
            entry.set_tx_radio_datarate_for_packet(rate_bps);
        }
    }

    pub fn set_tx_card_for_link(&self, link_id: usize, interface: InterfaceId) {
        if let Some(link) = self.link(link_id) {
            link.set_tx_card_for_link(interface);
        }
    }

    /// Raises `ALARM_ID_RADIO_LINK_DATA_OVERLOAD` for `interface`, at most
    /// once per 20-second overload window per interface (`SPEC_FULL.md`
    /// §4.6).
    pub fn should_raise_overload_alarm(&self, interface: InterfaceId, now: Instant) -> bool {
        self.interface(interface)
            .map(|e| e.should_raise_overload_alarm(now))
            .unwrap_or(true)
    }

    /// Looks up (or allocates) the [`VehicleRxState`] slot for
    /// `vehicle_id` and runs `f` against it. The first free slot is used on
    /// first sighting; once all `MAX_CONCURRENT_VEHICLES` slots are taken,
    /// the *last* slot is reused for a newly seen vehicle, matching the
    /// reference's fixed-table allocation policy.
    pub fn with_vehicle<R>(&self, vehicle_id: u32, f: impl FnOnce(&mut VehicleRxState) -> R) -> R {
        let mut vehicles = self.vehicles.lock().unwrap();
        if let Some(existing) = vehicles.iter_mut().find(|v| v.vehicle_id == Some(vehicle_id)) {
            return f(existing);
        }
        if vehicles.len() < MAX_CONCURRENT_VEHICLES {
            vehicles.push(VehicleRxState::for_vehicle(vehicle_id));
            let last = vehicles.last_mut().unwrap();
            return f(last);
        }
        let last = vehicles.last_mut().unwrap();
        *last = VehicleRxState::for_vehicle(vehicle_id);
        f(last)
    }

    pub fn tracked_vehicle_count(&self) -> usize {
        self.vehicles.lock().unwrap().len()
    }
}
