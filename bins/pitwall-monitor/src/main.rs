//! Reader process for a running bridge.
//!
//! ```text
//! pitwall-monitor [config.toml] watch          sample channels, report once a second
//! pitwall-monitor [config.toml] rain <0..1>    send a weather override
//! pitwall-monitor [config.toml] enable <mask>  ask the bridge to subscribe channels
//! ```

use anyhow::{Context, bail};
use pitwall_config::{BridgeConfig, ConsistencyMode};
use pitwall_events::{
    ChannelKind, ExtendedInfo, PLUGIN_CONTROL_LAYOUT_VERSION, PluginControl, ScoringInfo,
    VehicleTelemetry, WEATHER_CONTROL_LAYOUT_VERSION, WeatherControl, WeatherInfo, read_name,
};
use pitwall_icc::{CommandWriter, FlipReader, FrameReader, RegionNamer, SnapshotReader};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

enum Scoring {
    Versioned(SnapshotReader<ScoringInfo>),
    DoubleBuffered(FlipReader<ScoringInfo>),
}

impl Scoring {
    fn open(dir: &Path, name: &str, mode: ConsistencyMode) -> anyhow::Result<Self> {
        Ok(match mode {
            ConsistencyMode::Versioned => Self::Versioned(SnapshotReader::open(dir, name)?),
            ConsistencyMode::DoubleBuffered => Self::DoubleBuffered(FlipReader::open(dir, name)?),
        })
    }

    /// `None` when the copy was torn or the mutex was busy.
    fn sample(&self) -> Option<ScoringInfo> {
        match self {
            Self::Versioned(r) => match r.read_snapshot() {
                (info, false) => Some(info),
                (_, true) => None,
            },
            Self::DoubleBuffered(r) => r.read(Duration::from_millis(1)),
        }
    }
}

fn namer(config: &BridgeConfig, pid: Option<u32>) -> RegionNamer {
    let namer = RegionNamer::new(config.app_name.as_str()).global(config.global_namespace);
    match pid {
        Some(pid) => namer.with_pid(pid),
        None => namer,
    }
}

fn watch(config: &BridgeConfig, namer: &RegionNamer) -> anyhow::Result<()> {
    let dir = config.shm_dir();
    let extended =
        SnapshotReader::<ExtendedInfo>::open(dir, &namer.name(ChannelKind::Extended.as_str()))
            .context("bridge not running?")?;
    let frames = FrameReader::<VehicleTelemetry>::open(
        dir,
        &namer.name(ChannelKind::Telemetry.as_str()),
        config.entity_capacity,
    )?;
    let scoring = Scoring::open(
        dir,
        &namer.name(ChannelKind::Scoring.as_str()),
        config.consistency,
    )?;
    let weather =
        SnapshotReader::<WeatherInfo>::open(dir, &namer.name(ChannelKind::Weather.as_str()))?;

    let mut buf = Vec::with_capacity(config.entity_capacity);
    let mut samples: u64 = 0;
    let mut torn: u64 = 0;
    let mut last_frame = 0u32;
    let mut new_frames: u64 = 0;
    let mut last = Instant::now();

    loop {
        let sample = frames.read_frame(&mut buf);
        samples += 1;
        if sample.torn {
            torn += 1;
        } else {
            let (begin, _) = frames.version();
            if begin != last_frame {
                new_frames += 1;
                last_frame = begin;
            }
        }

        if last.elapsed() >= Duration::from_secs(1) {
            let (status, _) = extended.read_snapshot();
            let (weather, _) = weather.read_snapshot();
            let leader = buf.first().map(|v| (v.id, v.lap_number));
            match scoring.sample() {
                Some(s) => tracing::info!(track = read_name(&s.track_name), vehicles = s.num_vehicles, "scoring"),
                None => tracing::debug!("scoring sample torn or busy"),
            }
            tracing::info!(
                bridge = read_name(&status.version),
                subscribed_mask = status.subscribed_mask,
                frames_closed = status.frames_closed,
                entities_dropped = status.entities_dropped,
                layout_mismatch_mask = status.layout_mismatch_mask,
                "status"
            );
            tracing::info!(
                new_frames,
                samples,
                torn,
                entities = buf.len(),
                ?leader,
                raining = weather.raining,
                "telemetry"
            );
            samples = 0;
            torn = 0;
            new_frames = 0;
            last = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(2));
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, rest) = match args.first() {
        Some(path) if path.ends_with(".toml") => (BridgeConfig::load(path.as_str())?, &args[1..]),
        _ => (BridgeConfig::default(), &args[..]),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let pid = std::env::var("PITWALL_PID")
        .ok()
        .map(|p| p.parse::<u32>())
        .transpose()
        .context("PITWALL_PID must be a process id")?;
    let namer = namer(&config, pid);
    let dir = config.shm_dir();

    match rest {
        [] => watch(&config, &namer),
        [cmd] if cmd == "watch" => watch(&config, &namer),
        [cmd, value] if cmd == "rain" => {
            let raining: f64 = value.parse().context("rain takes a number")?;
            let (current, _) =
                SnapshotReader::<WeatherInfo>::open(dir, &namer.name(ChannelKind::Weather.as_str()))?
                    .read_snapshot();
            let mut writer = CommandWriter::<WeatherControl>::open(
                dir,
                &namer.name(ChannelKind::WeatherControl.as_str()),
            )
            .context("weather control input disabled?")?;
            writer.send(
                WEATHER_CONTROL_LAYOUT_VERSION,
                &WeatherControl {
                    raining: raining.clamp(0.0, 1.0),
                    cloudiness: current.cloudiness.max(raining),
                    ambient_temp_k: current.ambient_temp_k,
                },
            );
            tracing::info!(raining, "weather override sent");
            Ok(())
        }
        [cmd, mask] if cmd == "enable" => {
            let mask = match mask.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => mask.parse(),
            }
            .context("enable takes a channel mask")?;
            let mut writer = CommandWriter::<PluginControl>::open(
                dir,
                &namer.name(ChannelKind::PluginControl.as_str()),
            )?;
            writer.send(
                PLUGIN_CONTROL_LAYOUT_VERSION,
                &PluginControl {
                    request_enable_mask: mask,
                    ..Default::default()
                },
            );
            tracing::info!(mask, "enable request sent");
            Ok(())
        }
        other => bail!("unknown command {other:?}"),
    }
}
