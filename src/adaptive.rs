// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C8: adaptive video controller.
//!
//! Runs only on the vehicle side. Tracks which [`VideoProfileId`] the
//! controller has most recently asked for, pushes bitrate/keyframe/IP
//! quantization updates to whichever capture program is running, and drives
//! a hysteresis-gated adaptive radio data rate that the TX selector (C5)
//! reads back through [`AdaptiveVideoController::streaming_profile_id`].

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::config::{Model, VideoProfile, VideoProfileId};
use crate::tx::selector::is_slower;

/// A newly requested radio data rate is applied immediately if it is faster
/// than (or equal to) the one currently in effect. A slower rate is stashed
/// and only applied once it has stayed the best known choice for this long,
/// so a brief profile flap does not visibly stutter the video link.
pub const DEFAULT_LOWER_VIDEO_RADIO_DATARATE_AFTER_MS: u64 = 2_000;

const BITRATE_UNSET: u32 = 0;
const IP_QUANTIZATION_UNSET: i32 = i32::MIN;
const RADIO_DATARATE_UNSET: i32 = i32::MIN;

/// Which userspace capture program is producing video on this vehicle.
/// Determines both the unit the keyframe command is expressed in and
/// whether IP quantization is a meaningful knob at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureProtocol {
    /// `raspivid`-family CSI/Veye capture: keyframe interval is a frame
    /// count, no IP quantization knob exists.
    CsiVeyeRaspivid,
    /// OpenIPC `majestic`: keyframe interval is a GOP length in seconds,
    /// plus a separate IP quantization delta.
    OpenIpcMajestic,
}

/// One command pushed to the active capture program. The adaptive
/// controller only ever enqueues these; a separate process-control
/// collaborator (out of scope for this crate) is responsible for actually
/// writing them to the capture program's control socket or config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureCommand {
    SetBitrateBps(u32),
    SetIpQuantizationDelta(i32),
    SetKeyframeFrameCount(u32),
    SetKeyframeGopSeconds(u32),
}

struct PendingRate {
    rate_bps: i32,
    apply_at: Instant,
}

/// Per-vehicle adaptive video state. One instance lives for the lifetime of
/// the radio stack; `on_profile_request` is called whenever the controller
/// (re)selects a profile, `on_camera_frame` once per encoded frame, and
/// `periodic_tick` on a steady ~10ms cadence from the router thread.
pub struct AdaptiveVideoController {
    protocol: CaptureProtocol,
    capture_tx: Sender<CaptureCommand>,

    /// `None` until the controller has asked for a profile at least once.
    last_requested_profile: Mutex<Option<VideoProfileId>>,

    /// Keyframe interval currently in effect, and the one queued to take
    /// over at the next frame boundary outside an I-frame. `0` means
    /// nothing is pending.
    current_kf_ms: AtomicU32,
    pending_kf_ms: AtomicU32,

    /// The adaptive radio data rate actually in effect right now (as
    /// opposed to the link's static configuration). `RADIO_DATARATE_UNSET`
    /// means the adaptive override is not active and C5 should fall back to
    /// its own formula.
    applied_adaptive_radio_data_rate: AtomicI32,
    pending_adaptive_radio_data_rate: Mutex<Option<PendingRate>>,

    last_applied_video_bitrate: AtomicU32,
    last_ip_quantization_set: AtomicI32,

    negotiating: AtomicBool,
}

impl AdaptiveVideoController {
    pub fn new(protocol: CaptureProtocol, capture_tx: Sender<CaptureCommand>) -> Self {
        Self {
            protocol,
            capture_tx,
            last_requested_profile: Mutex::new(None),
            current_kf_ms: AtomicU32::new(0),
            pending_kf_ms: AtomicU32::new(0),
            applied_adaptive_radio_data_rate: AtomicI32::new(RADIO_DATARATE_UNSET),
            pending_adaptive_radio_data_rate: Mutex::new(None),
            last_applied_video_bitrate: AtomicU32::new(BITRATE_UNSET),
            last_ip_quantization_set: AtomicI32::new(IP_QUANTIZATION_UNSET),
            negotiating: AtomicBool::new(false),
        }
    }

    /// Shared with the TX engine (C6), which must not send anything while
    /// negotiation is in progress.
    pub fn negotiating_flag(&self) -> &AtomicBool {
        &self.negotiating
    }

    /// The profile the vehicle is actually streaming right now, as opposed
    /// to `model.user_selected_video_profile` which is what the controller
    /// asked for. C5's `SameAsAdaptiveVideo` policy reads this to find the
    /// profile-specific radio rate override currently in force.
    pub fn streaming_profile_id(&self) -> Option<VideoProfileId> {
        *self.last_requested_profile.lock().unwrap()
    }

    /// Called whenever the controller (re)selects a video profile.
    /// Refreshes the bitrate/IP-quantization/keyframe state and recomputes
    /// the adaptive radio data rate. Returns the list of capture commands
    /// that were enqueued, for logging/testing.
    pub fn on_profile_request(&self, model: &Model, requested: VideoProfileId, now: Instant) -> Vec<CaptureCommand> {
        if self.negotiating.load(Ordering::Acquire) {
            return Vec::new();
        }
        let Some(profile) = model.video_profile(requested) else {
            return Vec::new();
        };
        let mut sent = Vec::new();

        *self.last_requested_profile.lock().unwrap() = Some(requested);

        if profile.initial_keyframe_ms != 0 {
            self.pending_kf_ms.store(profile.initial_keyframe_ms, Ordering::Release);
        }

        if self.last_applied_video_bitrate.swap(profile.fixed_bitrate_bps, Ordering::AcqRel) != profile.fixed_bitrate_bps {
            let cmd = CaptureCommand::SetBitrateBps(profile.fixed_bitrate_bps);
            let _ = self.capture_tx.send(cmd.clone());
            sent.push(cmd);
        }

        if self.protocol == CaptureProtocol::OpenIpcMajestic
            && self.last_ip_quantization_set.swap(profile.ip_quantization_delta, Ordering::AcqRel)
                != profile.ip_quantization_delta
        {
            let cmd = CaptureCommand::SetIpQuantizationDelta(profile.ip_quantization_delta);
            let _ = self.capture_tx.send(cmd.clone());
            sent.push(cmd);
        }

        self.update_adaptive_radio_rate(model, requested, profile, now);
        sent
    }

    fn update_adaptive_radio_rate(&self, model: &Model, requested: VideoProfileId, profile: &VideoProfile, now: Instant) {
        if requested == model.user_selected_video_profile {
            // Back to the user's own choice: the adaptive override stands
            // down and C5 falls back to its normal formula.
            *self.pending_adaptive_radio_data_rate.lock().unwrap() = None;
            self.applied_adaptive_radio_data_rate.store(RADIO_DATARATE_UNSET, Ordering::Release);
            return;
        }
        if profile.radio_datarate_video_bps == 0 {
            return;
        }
        let new_rate = profile.radio_datarate_video_bps;
        let current = self.applied_adaptive_radio_data_rate.load(Ordering::Acquire);

        if current == RADIO_DATARATE_UNSET || !is_slower(new_rate, current) {
            self.applied_adaptive_radio_data_rate.store(new_rate, Ordering::Release);
            *self.pending_adaptive_radio_data_rate.lock().unwrap() = None;
        } else {
            *self.pending_adaptive_radio_data_rate.lock().unwrap() = Some(PendingRate {
                rate_bps: new_rate,
                apply_at: now + Duration::from_millis(DEFAULT_LOWER_VIDEO_RADIO_DATARATE_AFTER_MS),
            });
        }
    }

    /// The adaptive radio data rate currently in force, if the adaptive
    /// controller has an active override; `None` lets C5 fall back to its
    /// own formula.
    pub fn active_radio_datarate_override(&self) -> Option<i32> {
        match self.applied_adaptive_radio_data_rate.load(Ordering::Acquire) {
            RADIO_DATARATE_UNSET => None,
            rate => Some(rate),
        }
    }

    /// Called once per encoded camera frame. `end_of_frame` marks the last
    /// NAL of the current frame; `inside_i_frame` is true while that frame
    /// is itself an I-frame. A pending keyframe interval change only
    /// commits on a non-I-frame boundary, so it never interrupts a GOP
    /// already in flight. Returns the command sent, if any.
    pub fn on_camera_frame(&self, profile: &VideoProfile, end_of_frame: bool, inside_i_frame: bool) -> Option<CaptureCommand> {
        if !end_of_frame || inside_i_frame {
            return None;
        }
        let pending = self.pending_kf_ms.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return None;
        }
        self.current_kf_ms.store(pending, Ordering::Release);
        let cmd = match self.protocol {
            CaptureProtocol::CsiVeyeRaspivid => {
                let frames = (profile.fps as u64 * pending as u64 / 1000).max(1) as u32;
                CaptureCommand::SetKeyframeFrameCount(frames)
            }
            CaptureProtocol::OpenIpcMajestic => {
                let seconds = (pending / 1000).max(1);
                CaptureCommand::SetKeyframeGopSeconds(seconds)
            }
        };
        let _ = self.capture_tx.send(cmd.clone());
        Some(cmd)
    }

    /// Called on a steady ~10ms cadence by the router thread. Applies an
    /// overdue pending adaptive radio rate. A no-op for the entire tick
    /// while negotiation is in progress: touching the pending rate mid
    /// negotiation could race the link renegotiating out from under it.
    pub fn periodic_tick(&self, now: Instant) {
        if self.negotiating.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.pending_adaptive_radio_data_rate.lock().unwrap();
        if let Some(p) = pending.as_ref() {
            if now >= p.apply_at {
                self.applied_adaptive_radio_data_rate.store(p.rate_bps, Ordering::Release);
                *pending = None;
            }
        }
    }

    /// Called when the capture program process has been restarted (crash,
    /// manual bounce, or stream reinitialization). The new process starts
    /// at its own defaults, so the next profile request must push the
    /// bitrate/quantization state again rather than skip it as a no-op.
    pub fn on_capture_restarted(&self) {
        self.last_applied_video_bitrate.store(BITRATE_UNSET, Ordering::Release);
        self.last_ip_quantization_set.store(IP_QUANTIZATION_UNSET, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeveloperFlags, LinkCapabilities, LocalRadioLinkConfig, UplinkDatarateType};

    fn model_with_profiles(user_selected: VideoProfileId, profiles: Vec<VideoProfile>) -> Model {
        Model {
            version: crate::config::MODEL_VERSION,
            radio_links: vec![LocalRadioLinkConfig {
                id: 0,
                vehicle_radio_link_id: 0,
                capabilities: LinkCapabilities::CAN_TX | LinkCapabilities::CAN_RX,
                link_datarate_video_bps: 18_000_000,
                link_datarate_data_bps: 2_000_000,
                uplink_datarate_type: UplinkDatarateType::Lowest,
                uplink_datarate_data_bps: 1_000_000,
                serial_packet_size: None,
            }],
            radio_interfaces: vec![],
            video_profiles: profiles,
            user_selected_video_profile: user_selected,
            developer_flags: DeveloperFlags::default(),
            process_priorities: Default::default(),
        }
    }

    fn hq() -> VideoProfile {
        VideoProfile {
            id: VideoProfileId::Hq,
            width: 1920,
            height: 1080,
            fps: 60,
            initial_keyframe_ms: 1000,
            fixed_bitrate_bps: 8_000_000,
            ip_quantization_delta: 0,
            radio_datarate_video_bps: 18_000_000,
            retransmit_window_ms: 200,
        }
    }

    fn mq() -> VideoProfile {
        VideoProfile {
            id: VideoProfileId::Mq,
            width: 1280,
            height: 720,
            fps: 30,
            initial_keyframe_ms: 500,
            fixed_bitrate_bps: 4_000_000,
            ip_quantization_delta: 4,
            radio_datarate_video_bps: 6_000_000,
            retransmit_window_ms: 200,
        }
    }

    fn controller() -> (AdaptiveVideoController, crossbeam_channel::Receiver<CaptureCommand>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (AdaptiveVideoController::new(CaptureProtocol::OpenIpcMajestic, tx), rx)
    }

    #[test]
    fn profile_request_sets_pending_keyframe_and_pushes_bitrate() {
        let (ctrl, rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![hq(), mq()]);
        let sent = ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());

        assert_eq!(ctrl.pending_kf_ms.load(Ordering::Acquire), 500);
        assert!(sent.contains(&CaptureCommand::SetBitrateBps(4_000_000)));
        assert!(sent.contains(&CaptureCommand::SetIpQuantizationDelta(4)));
        assert_eq!(rx.try_recv().unwrap(), CaptureCommand::SetBitrateBps(4_000_000));
    }

    #[test]
    fn repeated_request_for_same_profile_does_not_resend_unchanged_bitrate() {
        let (ctrl, _rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![hq(), mq()]);
        ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());
        let sent = ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());
        assert!(!sent.iter().any(|c| matches!(c, CaptureCommand::SetBitrateBps(_))));
    }

    #[test]
    fn faster_radio_rate_applies_immediately_slower_one_is_deferred() {
        let (ctrl, _rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![hq(), mq()]);
        let t0 = Instant::now();

        // Drop from HQ (18Mbps) to MQ (6Mbps): a decrease, must be deferred.
        ctrl.on_profile_request(&model, VideoProfileId::Mq, t0);
        assert_eq!(ctrl.active_radio_datarate_override(), None);

        ctrl.periodic_tick(t0 + Duration::from_millis(100));
        assert_eq!(ctrl.active_radio_datarate_override(), None, "too early to commit");

        ctrl.periodic_tick(t0 + Duration::from_millis(DEFAULT_LOWER_VIDEO_RADIO_DATARATE_AFTER_MS + 1));
        assert_eq!(ctrl.active_radio_datarate_override(), Some(6_000_000));
    }

    #[test]
    fn hysteresis_never_lowers_rate_within_the_window_on_flapping_requests() {
        let (ctrl, _rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![hq(), mq()]);
        let t0 = Instant::now();

        // vehicle streaming HQ-ish (not the user selection, so the override
        // engages) at the HQ rate already.
        ctrl.on_profile_request(&model, VideoProfileId::Lq, t0);
        ctrl.applied_adaptive_radio_data_rate.store(18_000_000, Ordering::Release);

        // Flap down to MQ then immediately back to a rate-compatible
        // profile within the hysteresis window: the deferred drop must
        // never have taken effect.
        ctrl.update_adaptive_radio_rate(&model, VideoProfileId::Mq, &mq(), t0 + Duration::from_millis(10));
        ctrl.update_adaptive_radio_rate(&model, VideoProfileId::Lq, &hq(), t0 + Duration::from_millis(20));
        ctrl.periodic_tick(t0 + Duration::from_millis(30));

        assert_eq!(ctrl.active_radio_datarate_override(), Some(18_000_000));
    }

    #[test]
    fn keyframe_commits_only_at_end_of_frame_outside_an_i_frame() {
        let (ctrl, rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![mq()]);
        ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());

        assert!(ctrl.on_camera_frame(&mq(), false, false).is_none());
        assert!(ctrl.on_camera_frame(&mq(), true, true).is_none());
        assert_eq!(ctrl.pending_kf_ms.load(Ordering::Acquire), 500, "still pending");

        let cmd = ctrl.on_camera_frame(&mq(), true, false).unwrap();
        assert_eq!(cmd, CaptureCommand::SetKeyframeGopSeconds(1));
        assert_eq!(ctrl.current_kf_ms.load(Ordering::Acquire), 500);
        assert_eq!(rx.try_recv().unwrap(), CaptureCommand::SetBitrateBps(4_000_000));
        assert_eq!(rx.try_recv().unwrap(), CaptureCommand::SetKeyframeGopSeconds(1));
    }

    #[test]
    fn capture_restart_resets_bitrate_and_quantization_trackers() {
        let (ctrl, _rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![mq()]);
        ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());
        ctrl.on_capture_restarted();

        let sent = ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());
        assert!(sent.contains(&CaptureCommand::SetBitrateBps(4_000_000)));
        assert!(sent.contains(&CaptureCommand::SetIpQuantizationDelta(4)));
    }

    #[test]
    fn negotiating_makes_profile_request_and_periodic_tick_no_ops() {
        let (ctrl, rx) = controller();
        let model = model_with_profiles(VideoProfileId::Hq, vec![hq(), mq()]);
        ctrl.negotiating_flag().store(true, Ordering::Release);

        let sent = ctrl.on_profile_request(&model, VideoProfileId::Mq, Instant::now());
        assert!(sent.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(ctrl.streaming_profile_id(), None);
    }
}
