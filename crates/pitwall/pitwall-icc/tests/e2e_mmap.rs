//! End-to-end two-process test over real mappings.
//!
//! The same test executable is spawned twice with a role in the environment:
//!
//! ```text
//! [Writer]  --[create]--[publish snapshots + frames...]--[linger]--[drop]
//!                 |            |     |     |
//!                 v            v     v     v
//! [Reader]  -----[open]-------[sample concurrently...]------[validate]
//! ```
//!
//! Every snapshot the writer publishes has all fields equal, and every frame
//! carries one lap number in all of its vehicles. The reader checks that any
//! sample not flagged as torn is internally consistent, which is the whole
//! promise of the versioned protocol.
//!
//! ```bash
//! cargo test -p pitwall-icc --test e2e_mmap -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "PITWALL_E2E_ROLE";
const ENV_DIR: &str = "PITWALL_E2E_DIR";
const ROLE_WRITER: &str = "writer";
const ROLE_READER: &str = "reader";

const WEATHER: &str = "$E2E_Weather$";
const TELEMETRY: &str = "$E2E_Telemetry$";

const UPDATE_COUNT: u64 = 50_000;
const VEHICLES: usize = 4;
const CAPACITY: usize = 8;

const WRITER_BATCH_SIZE: u64 = 100;
const WRITER_BATCH_DELAY_US: u64 = 50;
/// Keep the regions alive after the last write so a late reader can attach.
const WRITER_LINGER: Duration = Duration::from_millis(300);

fn test_dir() -> PathBuf {
    env::temp_dir().join(format!("pitwall_e2e_{}", std::process::id()))
}

fn run_writer(dir: &Path) {
    use pitwall_events::{VehicleTelemetry, WeatherInfo};
    use pitwall_icc::{EntityUpdate, FrameAggregator, TickHeuristic, VersionedSnapshot};

    log!("[WRITER] dir: {}", dir.display());
    let mut weather = VersionedSnapshot::<WeatherInfo>::create(dir, WEATHER)
        .expect("writer: failed to create weather snapshot");
    let mut frames =
        FrameAggregator::<VehicleTelemetry>::create(dir, TELEMETRY, CAPACITY, TickHeuristic::default())
            .expect("writer: failed to create telemetry frame");
    frames.set_expected_count(Some(VEHICLES));

    let start = Instant::now();
    for i in 0..UPDATE_COUNT {
        let v = i as f64;
        weather.publish(&WeatherInfo {
            et: v,
            raining: v,
            cloudiness: v,
            ambient_temp_k: v,
            wind_max_speed: v,
        });

        for id in 0..VEHICLES as i64 {
            frames.on_entity_update(EntityUpdate {
                entity_id: id,
                timestamp: v * 0.01,
                payload: VehicleTelemetry {
                    id,
                    elapsed_time: v * 0.01,
                    lap_number: i as i64,
                    ..Default::default()
                },
            });
        }

        if (i + 1) % WRITER_BATCH_SIZE == 0 {
            std::thread::sleep(Duration::from_micros(WRITER_BATCH_DELAY_US));
        }
    }

    log!(
        "[WRITER] {UPDATE_COUNT} updates, {} frames in {:?}",
        frames.frames_closed(),
        start.elapsed()
    );
    assert_eq!(frames.frames_closed(), UPDATE_COUNT);
    assert_eq!(weather.version(), (UPDATE_COUNT as u32, UPDATE_COUNT as u32));

    std::thread::sleep(WRITER_LINGER);
}

fn run_reader(dir: &Path) {
    use pitwall_events::{VehicleTelemetry, WeatherInfo};
    use pitwall_icc::{FrameReader, SnapshotReader};

    let open_deadline = Instant::now() + Duration::from_secs(5);
    let (weather, frames) = loop {
        let opened = SnapshotReader::<WeatherInfo>::open(dir, WEATHER).and_then(|w| {
            FrameReader::<VehicleTelemetry>::open(dir, TELEMETRY, CAPACITY).map(|f| (w, f))
        });
        match opened {
            Ok(pair) => break pair,
            Err(_) if Instant::now() < open_deadline => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("[READER] failed to open regions: {e}"),
        }
    };
    log!("[READER] regions opened");

    let mut clean = 0u64;
    let mut torn = 0u64;
    let mut last_version = 0u32;
    let mut last_change = Instant::now();
    let mut buf = Vec::with_capacity(CAPACITY);
    let deadline = Instant::now() + Duration::from_secs(10);

    while Instant::now() < deadline {
        let (w, w_torn) = weather.read_snapshot();
        if w_torn {
            torn += 1;
        } else {
            clean += 1;
            assert!(
                w.raining == w.et && w.cloudiness == w.et && w.ambient_temp_k == w.et && w.wind_max_speed == w.et,
                "untorn weather snapshot is inconsistent: {w:?}"
            );
        }

        let sample = frames.read_frame(&mut buf);
        if sample.torn {
            torn += 1;
        } else if sample.entity_count > 0 {
            clean += 1;
            assert_eq!(sample.entity_count, VEHICLES);
            let lap = buf[0].lap_number;
            assert!(
                buf.iter().all(|v| v.lap_number == lap),
                "untorn frame mixes ticks: {:?}",
                buf.iter().map(|v| v.lap_number).collect::<Vec<_>>()
            );
            let ids: Vec<i64> = buf.iter().map(|v| v.id).collect();
            assert_eq!(ids, (0..VEHICLES as i64).collect::<Vec<_>>());
        }

        let (begin, _) = weather.version();
        if begin != last_version {
            assert!(begin > last_version, "version went backwards");
            last_version = begin;
            last_change = Instant::now();
        } else if clean > 0 && last_change.elapsed() > Duration::from_millis(100) {
            break;
        }
        std::hint::spin_loop();
    }

    log!("[READER] clean samples: {clean}, torn samples: {torn}, last version: {last_version}");
    assert!(clean > 0, "reader never saw a consistent sample");
}

#[test]
fn e2e_two_process_snapshot_and_frames() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let dir = PathBuf::from(env::var(ENV_DIR).expect("PITWALL_E2E_DIR not set"));
        match role.as_str() {
            ROLE_WRITER => run_writer(&dir),
            ROLE_READER => run_reader(&dir),
            other => panic!("unknown role: {other}"),
        }
        return;
    }

    let dir = test_dir();
    std::fs::create_dir_all(&dir).expect("failed to create test dir");
    let exe = env::current_exe().expect("failed to get current executable path");

    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_snapshot_and_frames")
            .env(ENV_ROLE, role)
            .env(ENV_DIR, &dir)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to spawn child process")
    };

    let mut writer = spawn(ROLE_WRITER);
    std::thread::sleep(Duration::from_millis(5));
    let mut reader = spawn(ROLE_READER);

    let writer_status = writer.wait().expect("failed to wait for writer");
    let reader_status = reader.wait().expect("failed to wait for reader");

    let _ = std::fs::remove_dir_all(&dir);

    assert!(writer_status.success(), "writer failed: {writer_status}");
    assert!(reader_status.success(), "reader failed: {reader_status}");
}
