// Payloads published by the producer. POD -> plain old data, fixed-size,
// `repr(C)` without padding so they can be copied byte-for-byte in and out
// of a mapping and zero is always a valid value.

use bytemuck::{Pod, Zeroable};

/// Maximum number of vehicles carried by one telemetry frame.
pub const MAX_MAPPED_VEHICLES: usize = 128;

/// Length of fixed-size name fields.
pub const NAME_LEN: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One vehicle's per-tick telemetry, delivered by the host one vehicle at a time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VehicleTelemetry {
    pub id: i64,
    /// Time since the previous update of this vehicle (seconds)
    pub delta_time: f64,
    /// Session elapsed time (seconds)
    pub elapsed_time: f64,
    pub lap_number: i64,
    pub lap_start_et: f64,
    pub pos: Vec3,
    pub local_vel: Vec3,
    pub local_accel: Vec3,
    pub gear: i64,
    pub engine_rpm: f64,
    pub engine_water_temp: f64,
    pub fuel: f64,
    pub unfiltered_throttle: f64,
    pub unfiltered_brake: f64,
    pub unfiltered_steering: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ScoringInfo {
    pub track_name: [u8; NAME_LEN],
    /// Current session (0 = testday, 1-4 = practice, 5-8 = qual, 9 = warmup, 10-13 = race)
    pub session: i64,
    pub current_et: f64,
    pub end_et: f64,
    pub max_laps: i64,
    /// Population reported by the host; the telemetry frame expects this many vehicles.
    pub num_vehicles: i64,
    pub game_phase: i64,
    pub ambient_temp: f64,
    pub track_temp: f64,
}

impl Default for ScoringInfo {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RulesInfo {
    pub current_et: f64,
    pub safety_car_active: i64,
    pub safety_car_laps: i64,
    pub yellow_flag_state: i64,
    pub num_participants: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WeatherInfo {
    pub et: f64,
    /// 0.0-1.0
    pub raining: f64,
    pub cloudiness: f64,
    pub ambient_temp_k: f64,
    pub wind_max_speed: f64,
}

/// Bridge status, always published.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ExtendedInfo {
    pub version: [u8; 16],
    pub unsubscribed_mask: u32,
    pub subscribed_mask: u32,
    pub frames_closed: u64,
    pub scoring_updates: u64,
    /// Channels whose regions were created successfully
    pub available_mask: u32,
    /// Command channels currently polled
    pub command_enabled_mask: u32,
    /// Command channels disabled after a layout mismatch
    pub layout_mismatch_mask: u32,
    pub entities_dropped: u32,
}

/// Copy `s` into a fixed, nul-padded field, truncating if needed.
pub fn write_name(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let n = s.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Read a nul-padded field written by [`write_name`].
pub fn read_name(src: &[u8]) -> &str {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}
