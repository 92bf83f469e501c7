//! Named impairment presets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_BANDWIDTH_KBPS;
use crate::error::ShaperError;

/// A fixed bundle of latency, jitter, loss and bandwidth values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresetProfile {
    #[default]
    None,
    HighPing,
    JitteryWifi,
    PacketLoss,
    LowBandwidth,
}

impl PresetProfile {
    /// Every preset, in display order.
    pub const ALL: [PresetProfile; 5] = [
        PresetProfile::None,
        PresetProfile::HighPing,
        PresetProfile::JitteryWifi,
        PresetProfile::PacketLoss,
        PresetProfile::LowBandwidth,
    ];

    pub fn latency_ms(self) -> u32 {
        match self {
            PresetProfile::None => 0,
            PresetProfile::HighPing => 120,
            PresetProfile::JitteryWifi => 40,
            PresetProfile::PacketLoss => 40,
            PresetProfile::LowBandwidth => 20,
        }
    }

    pub fn jitter_ms(self) -> u32 {
        match self {
            PresetProfile::None => 0,
            PresetProfile::HighPing => 20,
            PresetProfile::JitteryWifi => 60,
            PresetProfile::PacketLoss => 10,
            PresetProfile::LowBandwidth => 10,
        }
    }

    pub fn loss_percent(self) -> f32 {
        match self {
            PresetProfile::None | PresetProfile::HighPing | PresetProfile::LowBandwidth => 0.0,
            PresetProfile::JitteryWifi => 1.0,
            PresetProfile::PacketLoss => 3.0,
        }
    }

    pub fn bandwidth_up_kbps(self) -> u32 {
        match self {
            PresetProfile::LowBandwidth => 512,
            _ => DEFAULT_BANDWIDTH_KBPS,
        }
    }

    pub fn bandwidth_down_kbps(self) -> u32 {
        match self {
            PresetProfile::LowBandwidth => 1024,
            _ => DEFAULT_BANDWIDTH_KBPS,
        }
    }

    /// Human-facing name, as shown by settings surfaces.
    pub fn display_name(self) -> &'static str {
        match self {
            PresetProfile::None => "None",
            PresetProfile::HighPing => "High Ping",
            PresetProfile::JitteryWifi => "Jittery Wi-Fi",
            PresetProfile::PacketLoss => "Packet Loss",
            PresetProfile::LowBandwidth => "Low BW",
        }
    }

    /// Lenient lookup by display name. Unknown names map to [`PresetProfile::None`].
    pub fn from_display_name(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl fmt::Display for PresetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Strict lookup by display name.
impl FromStr for PresetProfile {
    type Err = ShaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.display_name() == s)
            .ok_or_else(|| ShaperError::InvalidInput(format!("unknown preset '{s}'")))
    }
}
