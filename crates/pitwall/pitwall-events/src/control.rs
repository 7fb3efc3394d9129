// Payloads written by the external client into command channels. Each type
// has a compiled-in layout version; the producer refuses any message whose
// declared version differs.

use crate::payload::NAME_LEN;
use bytemuck::{Pod, Zeroable};

pub const HW_CONTROL_LAYOUT_VERSION: u32 = 1;
pub const WEATHER_CONTROL_LAYOUT_VERSION: u32 = 1;
pub const RULES_CONTROL_LAYOUT_VERSION: u32 = 1;
pub const PLUGIN_CONTROL_LAYOUT_VERSION: u32 = 1;

/// Request to set one named hardware control (e.g. "PitRequest") on the player vehicle.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct HwControl {
    pub control_name: [u8; NAME_LEN],
    pub value: f64,
}

impl Default for HwControl {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WeatherControl {
    pub raining: f64,
    pub cloudiness: f64,
    pub ambient_temp_k: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct RulesControl {
    pub safety_car_active: i64,
    pub yellow_flag_state: i64,
    pub message: [u8; NAME_LEN],
}

impl Default for RulesControl {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Runtime requests addressed to the bridge itself.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PluginControl {
    /// Channels to enable, one bit per `ChannelKind`. Enable only; zero bits are ignored.
    pub request_enable_mask: u32,
    pub _reserved: u32,
}
