//! Synthetic host: drives the bridge the way a simulator's plugin callbacks
//! would, one vehicle at a time, with scoring, rules and weather updates
//! interleaved.
//!
//! Usage: `pitwall [config.toml] [ticks]`. Without `ticks` it runs until killed.

use anyhow::Context;
use pitwall_bridge::{ChannelRegistry, Commands};
use pitwall_config::BridgeConfig;
use pitwall_events::{
    RulesInfo, ScoringInfo, Vec3, VehicleTelemetry, WeatherInfo, read_name, write_name,
};
use pitwall_icc::EntityUpdate;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const VEHICLES: i64 = 20;
const TICK: Duration = Duration::from_millis(10);
const SCORING_EVERY: u64 = 20;
const SLOW_EVERY: u64 = 100;

struct Session {
    tick: u64,
    weather: WeatherInfo,
    rules: RulesInfo,
}

impl Session {
    fn elapsed(&self) -> f64 {
        self.tick as f64 * TICK.as_secs_f64()
    }

    fn vehicle(&self, id: i64) -> VehicleTelemetry {
        let et = self.elapsed();
        let angle = et * 0.1 + id as f64 * 0.3;
        VehicleTelemetry {
            id,
            delta_time: TICK.as_secs_f64(),
            elapsed_time: et,
            lap_number: (angle / std::f64::consts::TAU) as i64,
            pos: Vec3 {
                x: angle.cos() * 800.0,
                y: 0.0,
                z: angle.sin() * 800.0,
            },
            gear: 4,
            engine_rpm: 9000.0 + 500.0 * (et + id as f64).sin(),
            fuel: (100.0 - et * 0.05).max(0.0),
            unfiltered_throttle: 1.0,
            ..Default::default()
        }
    }

    fn scoring(&self) -> ScoringInfo {
        let mut info = ScoringInfo {
            session: 10,
            current_et: self.elapsed(),
            end_et: 3600.0,
            num_vehicles: VEHICLES,
            game_phase: 5,
            ambient_temp: self.weather.ambient_temp_k - 273.15,
            track_temp: self.weather.ambient_temp_k - 263.15,
            ..Default::default()
        };
        write_name(&mut info.track_name, "Synthetic Oval");
        info
    }

    fn apply(&mut self, commands: &Commands) {
        if let Some(hw) = commands.hw_control {
            tracing::info!(control = read_name(&hw.control_name), value = hw.value, "hardware control");
        }
        if let Some(w) = commands.weather_control {
            self.weather.raining = w.raining;
            self.weather.cloudiness = w.cloudiness;
            self.weather.ambient_temp_k = w.ambient_temp_k;
            tracing::info!(raining = w.raining, "weather override");
        }
        if let Some(r) = commands.rules_control {
            self.rules.safety_car_active = r.safety_car_active;
            self.rules.yellow_flag_state = r.yellow_flag_state;
            tracing::info!(message = read_name(&r.message), "rules override");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => BridgeConfig::load(path.as_str()).with_context(|| format!("loading {path}"))?,
        None => BridgeConfig::default(),
    };
    let ticks = args
        .next()
        .map(|t| t.parse::<u64>())
        .transpose()
        .context("ticks must be a number")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(dir = %config.shm_dir, app = %config.app_name, "starting bridge");
    let mut registry = ChannelRegistry::new(config);
    registry.init_channels();

    let mut session = Session {
        tick: 0,
        weather: WeatherInfo {
            ambient_temp_k: 295.0,
            cloudiness: 0.2,
            ..Default::default()
        },
        rules: RulesInfo {
            num_participants: VEHICLES,
            ..Default::default()
        },
    };

    let mut last = Instant::now();
    let mut updates: u64 = 0;

    while ticks.is_none_or(|n| session.tick < n) {
        let started = Instant::now();

        if session.tick % SCORING_EVERY == 0 {
            registry.on_scoring(&session.scoring());
        }
        for id in 0..VEHICLES {
            registry.on_entity_update(EntityUpdate {
                entity_id: id,
                timestamp: session.elapsed(),
                payload: session.vehicle(id),
            });
            updates += 1;
        }
        if session.tick % SLOW_EVERY == 0 {
            session.weather.et = session.elapsed();
            session.rules.current_et = session.elapsed();
            registry.on_weather(&session.weather);
            registry.on_rules(&session.rules);
        }

        let commands = registry.poll_commands();
        session.apply(&commands);
        registry.publish_extended();

        if last.elapsed() >= Duration::from_secs(1) {
            let status = registry.status();
            tracing::info!(
                updates,
                frames = status.frames_closed,
                subscribed_mask = status.subscribed_mask,
                "entity updates/s"
            );
            updates = 0;
            last = Instant::now();
        }

        session.tick += 1;
        if let Some(rest) = TICK.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    registry.flush_telemetry();
    registry.shutdown();
    tracing::info!(ticks = session.tick, "session ended");
    Ok(())
}
