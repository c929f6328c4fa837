// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C5: TX interface and datarate selection.
//!
//! Two independent decisions feed the TX engine (C6) for every local radio
//! link on every send: which physical interface carries the link's traffic
//! ([`TxSelector::assign_all`]) and what data rate the Wi-Fi header should
//! advertise for the next packet ([`compute_packet_uplink_datarate`]). Both
//! are pure functions of the current [`Model`]/[`ControllerSettings`]/
//! [`RadioStatsHub`] snapshot; neither mutates anything itself.

use std::sync::OnceLock;

use log::info;

use crate::config::{
    ControllerSettings, DriverFamily, LocalRadioLinkConfig, Model, UplinkDatarateType, VideoProfile,
};
use crate::interface::InterfaceId;
use crate::stats::RadioStatsHub;

/// Sentinel meaning "no data rate has been selected yet"; distinct from any
/// real legacy rate (always positive) or MCS index (always negative).
pub const DATARATE_UNSET: i32 = i32::MIN;

/// Lowest legacy 802.11 bitrate this crate will ever select, in bits per
/// second.
const LOWEST_LEGACY_RATE_BPS: i32 = 1_000_000;
/// Lowest MCS index this crate will ever select for an interface that
/// reports its rate as an MCS index rather than a legacy bitrate.
const LOWEST_MCS_INDEX: i32 = -1;

fn lowest_allowed_rate(family: DriverFamily) -> i32 {
    if family.is_serial() {
        56_000
    } else if family == DriverFamily::AtherosRalink {
        LOWEST_MCS_INDEX
    } else {
        LOWEST_LEGACY_RATE_BPS
    }
}

/// Orders two encoded data rates by how slow they are. Positive values are
/// legacy bitrates in bits per second; negative values are MCS indices.
/// Every MCS index is treated as slower than every legacy rate (the two
/// encodings are not otherwise comparable, and this crate only ever uses
/// the ordering to decide whether a profile override should *lower* the
/// selected rate).
fn rate_rank(rate_bps: i32) -> i64 {
    if rate_bps < 0 {
        -100_000_000i64 + rate_bps as i64
    } else {
        rate_bps as i64
    }
}

/// `true` if `a` is the slower of the two rates by the "real data rate"
/// ordering (every MCS index is slower than every legacy bitrate). Shared
/// with the adaptive controller's (C8) radio-datarate hysteresis, which
/// applies the identical comparison when deciding whether a newly requested
/// rate counts as an increase or a decrease.
pub(crate) fn is_slower(a: i32, b: i32) -> bool {
    rate_rank(a) < rate_rank(b)
}

/// Picks the best TX interface for each enabled, non-relay, TX-capable
/// local radio link, per `SPEC_FULL.md` §4.5: controller-preferred
/// interface first, falling back to whichever candidate has the best
/// recent RX quality. Logs the whole assignment exactly once, the first
/// time it runs after startup.
pub struct TxSelector {
    logged_once: OnceLock<()>,
}

impl Default for TxSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl TxSelector {
    pub fn new() -> Self {
        Self {
            logged_once: OnceLock::new(),
        }
    }

    /// Returns the chosen TX interface for `link`, or `None` if the link is
    /// a relay, cannot transmit, or has no eligible candidate interface.
    pub fn best_tx_interface(&self, model: &Model, controller: &ControllerSettings, stats: &RadioStatsHub, link: &LocalRadioLinkConfig) -> Option<InterfaceId> {
        if link.is_disabled() || link.is_relay() || !link.can_tx() {
            return None;
        }

        let candidates: Vec<_> = model
            .interfaces_for_link(link.id)
            .filter(|iface| {
                iface.is_enabled()
                    && iface
                        .capabilities
                        .contains(crate::config::InterfaceCapabilities::TX_CAPABLE)
                    && iface
                        .capabilities
                        .contains(crate::config::InterfaceCapabilities::MAY_USE_FOR_DATA)
            })
            .collect();

        // Pass 1: lowest positive controller-preferred index wins; ties keep
        // the first one found in ascending interface-index order.
        let mut preferred: Option<(InterfaceId, u32)> = None;
        for iface in &candidates {
            let pref = controller.card(iface.index).preferred_tx_index;
            if pref == 0 {
                continue;
            }
            if preferred.map_or(true, |(_, best)| pref < best) {
                preferred = Some((iface.id(), pref));
            }
        }
        if let Some((id, _)) = preferred {
            return Some(id);
        }

        // Pass 2: best recent RX quality; ties keep the first one found.
        let mut best: Option<(InterfaceId, u8)> = None;
        for iface in &candidates {
            let quality = stats.interface(iface.id()).map(|e| e.rx_relative_quality()).unwrap_or(0);
            if best.map_or(true, |(_, q)| quality > q) {
                best = Some((iface.id(), quality));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Computes and (on the first call only) logs the whole link -> interface
    /// assignment for every link in `model`.
    pub fn assign_all(&self, model: &Model, controller: &ControllerSettings, stats: &RadioStatsHub) -> Vec<(usize, Option<InterfaceId>)> {
        let assignment: Vec<_> = model
            .radio_links
            .iter()
            .map(|link| (link.id, self.best_tx_interface(model, controller, stats, link)))
            .collect();

        if self.logged_once.set(()).is_ok() {
            info!("tx interface assignment: {assignment:?}");
        }
        assignment
    }
}

/// Computes the data rate (legacy bps, positive, or MCS index, negative) to
/// advertise for the next packet sent on `link`, per `SPEC_FULL.md` §4.5.
///
/// `user_selected_profile`/`streaming_profile` are the user's chosen video
/// profile and whatever profile the vehicle is actually streaming mid
/// adaptive-change, respectively; either may be absent (no video profiles
/// configured, or the vehicle is not currently streaming).
#[allow(clippy::too_many_arguments)]
pub fn compute_packet_uplink_datarate(
    link: &LocalRadioLinkConfig,
    family: DriverFamily,
    user_selected_profile: Option<&VideoProfile>,
    streaming_profile: Option<&VideoProfile>,
    negotiating: bool,
    link_lost: bool,
    is_pairing_request: bool,
) -> i32 {
    // A negotiation in progress short-circuits every other rule, including
    // the Atheros/Ralink verbatim pass-through below.
    if negotiating {
        return lowest_allowed_rate(family);
    }

    if family.skips_dynamic_datarate() {
        return policy_rate(link, user_selected_profile, streaming_profile);
    }

    if is_pairing_request || link_lost {
        return lowest_allowed_rate(family);
    }

    policy_rate(link, user_selected_profile, streaming_profile)
}

fn policy_rate(link: &LocalRadioLinkConfig, user_selected_profile: Option<&VideoProfile>, streaming_profile: Option<&VideoProfile>) -> i32 {
    match link.uplink_datarate_type {
        UplinkDatarateType::Fixed => link.uplink_datarate_data_bps,
        UplinkDatarateType::SameAsAdaptiveVideo => {
            let mut rate = link.link_datarate_video_bps;
            for profile in [user_selected_profile, streaming_profile].into_iter().flatten() {
                if profile.radio_datarate_video_bps != 0 && is_slower(profile.radio_datarate_video_bps, rate) {
                    rate = profile.radio_datarate_video_bps;
                }
            }
            rate
        }
        UplinkDatarateType::Lowest => {
            if link.link_datarate_video_bps != 0 {
                link.link_datarate_data_bps
            } else {
                DATARATE_UNSET
            }
        }
    }
}
