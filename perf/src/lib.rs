use pitwall_events::{Vec3, VehicleTelemetry};
use std::path::PathBuf;

/// Scratch region directory, unique per label and process.
pub fn temp_shm_dir(label: &str) -> PathBuf {
    let pid = std::process::id();
    let dir = std::env::temp_dir().join(format!("pitwall_bench_{label}_{pid}"));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

pub fn make_test_vehicle(id: i64, elapsed_time: f64) -> VehicleTelemetry {
    VehicleTelemetry {
        id,
        delta_time: 0.01,
        elapsed_time,
        lap_number: 3,
        lap_start_et: 120.5,
        pos: Vec3 {
            x: 512.25,
            y: 3.5,
            z: -88.0,
        },
        gear: 5,
        engine_rpm: 9_450.0,
        engine_water_temp: 88.5,
        fuel: 42.0,
        unfiltered_throttle: 0.93,
        ..Default::default()
    }
}
