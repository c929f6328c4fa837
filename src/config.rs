// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C9: configuration surface.
//!
//! [`Model`] is the persistent description of the vehicle a controller
//! talks to (radio links, radio interfaces, video profiles); it is loaded
//! once at startup by [`load_model`] and treated as read-only by every
//! other component in this crate. [`ControllerSettings`] is the parallel,
//! controller-side-only view (per-card flags, preferred TX index) read by
//! the TX selector (C5). Versioned persistence and migration between
//! versions are out of scope for this crate (see `SPEC_FULL.md` §1); this
//! module only reads the post-migration view.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::interface::InterfaceId;

/// Current on-disk schema version this crate understands. A file declaring
/// any other version is rejected rather than guessed at; migration is an
/// out-of-scope collaborator's job.
pub const MODEL_VERSION: u32 = 1;

/// Hardware family a physical radio interface belongs to. Drives both the
/// TX datarate floor (C5) and which capture/pairing rate rules apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverFamily {
    /// Atheros/Ralink-family Wi-Fi chipsets: the configured link rate is
    /// used verbatim, with no dynamic adjustment from C5.
    AtherosRalink,
    Rtl88xx,
    SerialSik,
    OtherWifi,
}

impl DriverFamily {
    /// Atheros/Ralink interfaces skip C5's uplink/lost-link clamps
    /// entirely; see `SPEC_FULL.md` §4.5.
    pub fn skips_dynamic_datarate(self) -> bool {
        matches!(self, Self::AtherosRalink)
    }

    pub fn is_serial(self) -> bool {
        matches!(self, Self::SerialSik)
    }
}

bitflags::bitflags! {
    /// Capability flags carried by one [`RadioInterfaceConfig`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterfaceCapabilities: u8 {
        const DISABLED          = 0b0000_0001;
        const MAY_TX            = 0b0000_0010;
        const MAY_USE_FOR_DATA  = 0b0000_0100;
        const RELAY_ONLY        = 0b0000_1000;
        const TX_CAPABLE        = 0b0001_0000;
    }
}

/// Persisted attributes of one physical radio adapter (Data Model §3,
/// "Radio interface"). Mutable runtime attributes (broken flag, rx-timeout
/// counter, open handles) live on the [`crate::interface::RadioInterface`]
/// instance, not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RadioInterfaceConfig {
    pub index: usize,
    pub name: String,
    pub mac: Option<String>,
    pub usb_path: Option<String>,
    pub driver_family: DriverFamily,
    pub capabilities: InterfaceCapabilities,
    pub current_frequency_mhz: u32,
    pub current_data_rate_bps: i32,
    /// The local radio link this interface is assigned to. Every enabled
    /// interface must be assigned to exactly one link (Data Model
    /// invariant); checked by [`Model::validate`].
    pub local_radio_link_id: usize,
}

impl RadioInterfaceConfig {
    pub fn id(&self) -> InterfaceId {
        InterfaceId(self.index)
    }

    pub fn is_enabled(&self) -> bool {
        !self.capabilities.contains(InterfaceCapabilities::DISABLED)
    }
}

bitflags::bitflags! {
    /// Capability flags carried by one [`LocalRadioLinkConfig`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LinkCapabilities: u8 {
        const CAN_TX    = 0b0000_0001;
        const CAN_RX    = 0b0000_0010;
        const RELAY     = 0b0000_0100;
        const DISABLED  = 0b0000_1000;
    }
}

/// Uplink data-rate policy for a local radio link, per `SPEC_FULL.md` §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkDatarateType {
    Fixed,
    SameAsAdaptiveVideo,
    Lowest,
}

impl Default for UplinkDatarateType {
    fn default() -> Self {
        Self::Lowest
    }
}

/// A logical link on this node, mapped 1:1 to a vehicle radio link id on
/// the peer (Data Model §3, "Local radio link").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalRadioLinkConfig {
    pub id: usize,
    pub vehicle_radio_link_id: u32,
    pub capabilities: LinkCapabilities,
    pub link_datarate_video_bps: i32,
    pub link_datarate_data_bps: i32,
    pub uplink_datarate_type: UplinkDatarateType,
    pub uplink_datarate_data_bps: i32,
    /// `Some(n)` if this link is backed by a serial SiK radio with air
    /// packet size `n`; `None` for a Wi-Fi-only link.
    pub serial_packet_size: Option<usize>,
}

impl LocalRadioLinkConfig {
    pub fn is_disabled(&self) -> bool {
        self.capabilities.contains(LinkCapabilities::DISABLED)
    }

    pub fn is_relay(&self) -> bool {
        self.capabilities.contains(LinkCapabilities::RELAY)
    }

    pub fn can_tx(&self) -> bool {
        self.capabilities.contains(LinkCapabilities::CAN_TX)
    }
}

/// The fixed small set of video-link quality tiers the adaptive controller
/// (C8) switches between.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VideoProfileId {
    Hq,
    Mq,
    Lq,
}

/// Per-profile encoder/radio parameters (Data Model §3, "Video link
/// profile").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoProfile {
    pub id: VideoProfileId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub initial_keyframe_ms: u32,
    pub fixed_bitrate_bps: u32,
    pub ip_quantization_delta: i32,
    /// 0 means "no profile-specific override"; see
    /// `compute_packet_uplink_datarate` in `tx::selector`.
    pub radio_datarate_video_bps: i32,
    pub retransmit_window_ms: u32,
}

/// The persistent description of the vehicle a controller talks to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Model {
    pub version: u32,
    pub radio_links: Vec<LocalRadioLinkConfig>,
    pub radio_interfaces: Vec<RadioInterfaceConfig>,
    pub video_profiles: Vec<VideoProfile>,
    /// Which profile id the user has selected (as opposed to whichever
    /// profile the vehicle may currently be streaming mid-adaptive-change).
    pub user_selected_video_profile: VideoProfileId,
    pub developer_flags: DeveloperFlags,
    pub process_priorities: ProcessPriorities,
}

/// Requested OS scheduling priority for this crate's worker threads (Data
/// Model §3, "process priorities"). `0` means "leave the thread at
/// whatever priority it already has"; the RX/TX engines only ever compare
/// against the value last applied, so changing this at runtime is enough to
/// trigger a re-apply at the next stats-cadence tick.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ProcessPriorities {
    pub rx_thread_priority: i32,
    pub tx_thread_priority: i32,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DeveloperFlags {
    pub log_packet_details: bool,
    pub disable_scrambling: bool,
}

impl Model {
    pub fn video_profile(&self, id: VideoProfileId) -> Option<&VideoProfile> {
        self.video_profiles.iter().find(|p| p.id == id)
    }

    pub fn link(&self, id: usize) -> Option<&LocalRadioLinkConfig> {
        self.radio_links.iter().find(|l| l.id == id)
    }

    pub fn interfaces_for_link(&self, link_id: usize) -> impl Iterator<Item = &RadioInterfaceConfig> {
        self.radio_interfaces
            .iter()
            .filter(move |i| i.local_radio_link_id == link_id)
    }

    /// Checks the Data Model invariant that every enabled interface is
    /// assigned to exactly one local radio link, and that link is not
    /// itself disabled unless it genuinely owns no interfaces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radio_interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        for link in &self.radio_links {
            if link.is_disabled() {
                continue;
            }
            if self.interfaces_for_link(link.id).next().is_none() {
                return Err(ConfigError::EmptyLink(link.id));
            }
        }
        Ok(())
    }
}

/// Per-card flags the controller maintains about a physical interface,
/// independent of the vehicle-side [`RadioInterfaceConfig`] (Data Model §3,
/// "Controller card flags"). Read by the TX selector's first pass.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ControllerCardFlags {
    pub disabled: bool,
    pub can_tx: bool,
    pub can_rx: bool,
    pub can_use_for_data: bool,
    pub used_for_relay: bool,
    /// 0 = no preference; otherwise lower wins (C5 pass 1).
    pub preferred_tx_index: u32,
}

/// The controller-side parallel configuration surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub card_flags: Vec<ControllerCardFlags>,
    /// `true` while the controller considers the radio link to the vehicle
    /// lost (heartbeat timeout); clamps C5's datarate selection to the
    /// lowest allowed rate.
    pub link_to_vehicle_lost: bool,
}

impl ControllerSettings {
    pub fn card(&self, index: usize) -> ControllerCardFlags {
        self.card_flags.get(index).copied().unwrap_or_default()
    }
}

/// Loads and validates a [`Model`] from a TOML file on disk.
pub fn load_model(path: &Path) -> Result<Model, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let model: Model = toml::from_str(&text)?;
    model.validate()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> Model {
        Model {
            version: MODEL_VERSION,
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
            radio_interfaces: vec![RadioInterfaceConfig {
                index: 0,
                name: "wlan0".into(),
                mac: None,
                usb_path: None,
                driver_family: DriverFamily::Rtl88xx,
                capabilities: InterfaceCapabilities::MAY_TX
                    | InterfaceCapabilities::MAY_USE_FOR_DATA
                    | InterfaceCapabilities::TX_CAPABLE,
                current_frequency_mhz: 5805,
                current_data_rate_bps: 18_000_000,
                local_radio_link_id: 0,
            }],
            video_profiles: vec![],
            user_selected_video_profile: VideoProfileId::Hq,
            developer_flags: DeveloperFlags::default(),
            process_priorities: ProcessPriorities::default(),
        }
    }

    #[test]
    fn valid_model_passes() {
        assert!(sample_model().validate().is_ok());
    }

    #[test]
    fn disabled_link_with_no_interfaces_is_fine() {
        let mut model = sample_model();
        model.radio_links.push(LocalRadioLinkConfig {
            id: 1,
            vehicle_radio_link_id: 1,
            capabilities: LinkCapabilities::DISABLED,
            link_datarate_video_bps: 0,
            link_datarate_data_bps: 0,
            uplink_datarate_type: UplinkDatarateType::Lowest,
            uplink_datarate_data_bps: 0,
            serial_packet_size: None,
        });
        assert!(model.validate().is_ok());
    }

    #[test]
    fn enabled_link_with_no_interfaces_is_rejected() {
        let mut model = sample_model();
        model.radio_links.push(LocalRadioLinkConfig {
            id: 1,
            vehicle_radio_link_id: 1,
            capabilities: LinkCapabilities::CAN_TX,
            link_datarate_video_bps: 0,
            link_datarate_data_bps: 0,
            uplink_datarate_type: UplinkDatarateType::Lowest,
            uplink_datarate_data_bps: 0,
            serial_packet_size: None,
        });
        assert!(matches!(model.validate(), Err(ConfigError::EmptyLink(1))));
    }

    #[test]
    fn no_interfaces_is_rejected() {
        let mut model = sample_model();
        model.radio_interfaces.clear();
        assert!(matches!(model.validate(), Err(ConfigError::NoInterfaces)));
    }
}
