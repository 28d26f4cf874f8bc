//! Mixer domain types shared between the bridge and the server.
//!
//! Track, device, and parameter indices are the DAW's ordinal positions as of
//! the attach that produced them. Structure (names, ranges, ordering) is
//! immutable for the life of an attach; only parameter values move.

use serde::{Deserialize, Serialize};

/// Identifies one parameter by (track, device, parameter) indices.
///
/// The parameter index is the *effective* id: the DAW's two placeholder
/// entries at the head of every device parameter list are already shimmed
/// away by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub track: u32,
    pub device: u32,
    pub param: u32,
}

impl ParamKey {
    pub fn new(track: u32, device: u32, param: u32) -> Self {
        Self {
            track,
            device,
            param,
        }
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.track, self.device, self.param)
    }
}

/// A single knob on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub param_id: u32,
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    /// Textual rendering from the DAW (e.g. "-12 dB"), when fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// A device on a track, with its ordered parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: u32,
    pub name: String,
    pub class_name: String,
    pub parameters: Vec<Parameter>,
}

/// A track with its ordered device list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u32,
    pub name: String,
    pub devices: Vec<Device>,
}

/// An immutable view of the whole mixer tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixerSnapshot {
    pub tracks: Vec<Track>,
}

impl MixerSnapshot {
    pub fn track(&self, track: u32) -> Option<&Track> {
        self.tracks.get(track as usize)
    }

    pub fn device(&self, track: u32, device: u32) -> Option<&Device> {
        self.track(track)?.devices.get(device as usize)
    }

    pub fn parameter(&self, key: ParamKey) -> Option<&Parameter> {
        self.device(key.track, key.device)?
            .parameters
            .get(key.param as usize)
    }

    /// Total parameter count across all tracks and devices.
    pub fn parameter_count(&self) -> usize {
        self.tracks
            .iter()
            .flat_map(|t| &t.devices)
            .map(|d| d.parameters.len())
            .sum()
    }
}

/// Result of a parameter set: the DAW's textual rendering before and after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOutcome {
    pub device_name: String,
    pub parameter_name: String,
    pub from: String,
    pub to: String,
}

/// One inbound value-listen push from the DAW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterUpdate {
    pub key: ParamKey,
    pub value: f32,
}
