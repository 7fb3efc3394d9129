//! Owns every channel the bridge publishes and applies the subscription mask.
//!
//! Channels are created once at startup whether or not they are subscribed,
//! so subscribing later never has to map anything. Only kinds disabled in the
//! configuration, and kinds whose mapping failed, stay unavailable.

use crate::cadence::{PollCadence, PolledCommand};
use crate::error::SubscriptionError;
use bytemuck::Pod;
use pitwall_config::{BridgeConfig, ConsistencyMode};
use pitwall_events::{
    ChannelKind, ExtendedInfo, HW_CONTROL_LAYOUT_VERSION, HwControl, PLUGIN_CONTROL_LAYOUT_VERSION,
    PluginControl, RULES_CONTROL_LAYOUT_VERSION, RulesControl, RulesInfo, ScoringInfo,
    SubscriptionMask, VehicleTelemetry, WEATHER_CONTROL_LAYOUT_VERSION, WeatherControl,
    WeatherInfo, write_name,
};
use pitwall_icc::{
    CommandChannel, DoubleBufferChannel, EntityUpdate, FlipConfig, FrameAggregator,
    ManagedChannel, Publish, RegionNamer, TickHeuristic, VersionedSnapshot,
};
use pitwall_mmap::MappingError;
use std::path::PathBuf;

/// Commands delivered by one [`ChannelRegistry::poll_commands`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Commands {
    pub hw_control: Option<HwControl>,
    pub weather_control: Option<WeatherControl>,
    pub rules_control: Option<RulesControl>,
}

impl Commands {
    pub fn is_empty(&self) -> bool {
        self.hw_control.is_none() && self.weather_control.is_none() && self.rules_control.is_none()
    }
}

#[derive(Default)]
struct CommandInputs {
    hw: Option<PolledCommand<HwControl>>,
    weather: Option<PolledCommand<WeatherControl>>,
    rules: Option<PolledCommand<RulesControl>>,
    plugin: Option<PolledCommand<PluginControl>>,
}

pub struct ChannelRegistry {
    config: BridgeConfig,
    dir: PathBuf,
    namer: RegionNamer,

    subscribed: SubscriptionMask,
    available: SubscriptionMask,

    extended: Option<VersionedSnapshot<ExtendedInfo>>,
    telemetry: Option<FrameAggregator<VehicleTelemetry>>,
    scoring: Option<Box<dyn Publish<ScoringInfo>>>,
    rules: Option<Box<dyn Publish<RulesInfo>>>,
    weather: Option<VersionedSnapshot<WeatherInfo>>,
    commands: CommandInputs,

    scoring_updates: u64,
    last_status: Option<ExtendedInfo>,
}

impl ChannelRegistry {
    /// Builds an empty registry. Nothing is mapped until
    /// [`init_channels`](Self::init_channels).
    pub fn new(config: BridgeConfig) -> Self {
        let mut namer = RegionNamer::new(config.app_name.as_str()).global(config.global_namespace);
        if config.dedicated_server {
            namer = namer.with_pid(std::process::id());
        }

        let unsubscribed = SubscriptionMask::from_bits(config.unsubscribed_mask);
        let mut subscribed = SubscriptionMask::empty();
        for kind in ChannelKind::ALL {
            if is_statically_disabled(&config, kind) {
                continue;
            }
            let dependency_off = kind.dependency().is_some_and(|dep| !subscribed.contains(dep));
            if kind.is_always_on() || !(unsubscribed.contains(kind) || dependency_off) {
                subscribed.insert(kind);
            }
        }

        Self {
            dir: PathBuf::from(&config.shm_dir),
            config,
            namer,
            subscribed,
            available: SubscriptionMask::empty(),
            extended: None,
            telemetry: None,
            scoring: None,
            rules: None,
            weather: None,
            commands: CommandInputs::default(),
            scoring_updates: 0,
            last_status: None,
        }
    }

    /// Creates every channel in dependency order and publishes the first
    /// status record.
    pub fn init_channels(&mut self) {
        for kind in ChannelKind::ALL {
            self.init_channel(kind);
        }
        self.publish_extended();
    }

    /// Creates one channel regardless of its subscription state. Returns
    /// whether the channel is available afterwards.
    pub fn init_channel(&mut self, kind: ChannelKind) -> bool {
        if self.available.contains(kind) {
            return true;
        }
        if is_statically_disabled(&self.config, kind) {
            tracing::info!(channel = kind.as_str(), "disabled by configuration");
            return false;
        }

        let name = self.region_name(kind);
        match self.create_channel(kind, &name) {
            Ok(()) => {
                self.available.insert(kind);
                tracing::info!(
                    channel = kind.as_str(),
                    region = %name,
                    subscribed = self.subscribed.contains(kind),
                    "channel created"
                );
                true
            }
            Err(e) => {
                self.subscribed.remove(kind);
                tracing::warn!(
                    channel = kind.as_str(),
                    region = %name,
                    error = %e,
                    "failed to create channel; unavailable for this session"
                );
                false
            }
        }
    }

    fn create_channel(&mut self, kind: ChannelKind, name: &str) -> Result<(), MappingError> {
        let dir = self.dir.as_path();
        let cadence = || {
            PollCadence::new(
                self.config.command_boost_ticks,
                self.config.command_baseline_interval,
            )
        };

        match kind {
            ChannelKind::Extended => {
                self.extended = Some(VersionedSnapshot::create(dir, name)?);
            }
            ChannelKind::Telemetry => {
                self.telemetry = Some(FrameAggregator::create(
                    dir,
                    name,
                    self.config.entity_capacity,
                    TickHeuristic::from_millis(self.config.tick_length_ms),
                )?);
            }
            ChannelKind::Scoring => self.scoring = Some(self.publisher(name)?),
            ChannelKind::Rules => self.rules = Some(self.publisher(name)?),
            ChannelKind::Weather => {
                self.weather = Some(VersionedSnapshot::create(dir, name)?);
            }
            ChannelKind::HwControl => {
                let channel = CommandChannel::create(dir, name, HW_CONTROL_LAYOUT_VERSION)?;
                self.commands.hw = Some(PolledCommand::new(channel, cadence()));
            }
            ChannelKind::WeatherControl => {
                let channel = CommandChannel::create(dir, name, WEATHER_CONTROL_LAYOUT_VERSION)?;
                self.commands.weather = Some(PolledCommand::new(channel, cadence()));
            }
            ChannelKind::RulesControl => {
                let channel = CommandChannel::create(dir, name, RULES_CONTROL_LAYOUT_VERSION)?;
                self.commands.rules = Some(PolledCommand::new(channel, cadence()));
            }
            ChannelKind::PluginControl => {
                let channel = CommandChannel::create(dir, name, PLUGIN_CONTROL_LAYOUT_VERSION)?;
                self.commands.plugin = Some(PolledCommand::new(channel, cadence()));
            }
        }
        Ok(())
    }

    /// Whole-value channel in the configured consistency mode.
    fn publisher<T: Pod>(&self, name: &str) -> Result<Box<dyn Publish<T>>, MappingError> {
        let channel: Box<dyn Publish<T>> = match self.config.consistency {
            ConsistencyMode::Versioned => Box::new(VersionedSnapshot::<T>::create(&self.dir, name)?),
            ConsistencyMode::DoubleBuffered => {
                let flip = FlipConfig {
                    blocking: self.config.flip_blocking,
                    lock_timeout: self.config.flip_lock_timeout(),
                    max_retries: self.config.max_flip_retries,
                };
                Box::new(DoubleBufferChannel::<T>::create(&self.dir, name, flip)?)
            }
        };
        Ok(channel)
    }

    /// Subscribe or unsubscribe one channel.
    ///
    /// Unsubscribing flushes zeroed state into the channel and also
    /// unsubscribes the command channels that depend on it.
    pub fn set_subscribed(
        &mut self,
        kind: ChannelKind,
        enabled: bool,
    ) -> Result<(), SubscriptionError> {
        if kind.is_always_on() {
            if enabled {
                return Ok(());
            }
            tracing::warn!(channel = kind.as_str(), "refusing to unsubscribe an always-on channel");
            return Err(SubscriptionError::AlwaysOn(kind));
        }
        if !self.available.contains(kind) {
            tracing::warn!(channel = kind.as_str(), enabled, "channel unavailable");
            return Err(SubscriptionError::Unavailable(kind));
        }
        if self.subscribed.contains(kind) == enabled {
            return Ok(());
        }

        if enabled {
            if let Some(dependency) = kind.dependency().filter(|d| !self.subscribed.contains(*d)) {
                tracing::warn!(
                    channel = kind.as_str(),
                    dependency = dependency.as_str(),
                    "refusing to subscribe while dependency is unsubscribed"
                );
                return Err(SubscriptionError::DependencyDisabled { kind, dependency });
            }
            self.subscribed.insert(kind);
            tracing::info!(channel = kind.as_str(), "subscribed");
        } else {
            self.subscribed.remove(kind);
            self.reset_channel(kind);
            tracing::info!(channel = kind.as_str(), "unsubscribed");

            for dependent in ChannelKind::ALL {
                if dependent.dependency() == Some(kind) && self.subscribed.contains(dependent) {
                    self.subscribed.remove(dependent);
                    tracing::info!(
                        channel = dependent.as_str(),
                        dependency = kind.as_str(),
                        "unsubscribed with its dependency"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn on_entity_update(&mut self, update: EntityUpdate<VehicleTelemetry>) {
        if !self.subscribed.contains(ChannelKind::Telemetry) {
            return;
        }
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.on_entity_update(update);
        }
    }

    /// Publishes scoring and hands its vehicle count to the telemetry
    /// aggregator as the expected frame population.
    pub fn on_scoring(&mut self, info: &ScoringInfo) {
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.set_expected_count(usize::try_from(info.num_vehicles).ok());
        }
        self.scoring_updates += 1;

        if !self.subscribed.contains(ChannelKind::Scoring) {
            return;
        }
        if let Some(scoring) = self.scoring.as_mut() {
            scoring.publish(info);
        }
    }

    pub fn on_rules(&mut self, info: &RulesInfo) {
        if !self.subscribed.contains(ChannelKind::Rules) {
            return;
        }
        if let Some(rules) = self.rules.as_mut() {
            rules.publish(info);
        }
    }

    pub fn on_weather(&mut self, info: &WeatherInfo) {
        if !self.subscribed.contains(ChannelKind::Weather) {
            return;
        }
        if let Some(weather) = self.weather.as_mut() {
            weather.publish(info);
        }
    }

    /// Close the telemetry frame in assembly, e.g. at session end.
    pub fn flush_telemetry(&mut self) -> bool {
        self.telemetry.as_mut().is_some_and(|t| t.flush())
    }

    /// Runs one tick: retries deferred scoring and rules flips, then every
    /// subscribed command channel's cadence, then plugin-control requests.
    pub fn poll_commands(&mut self) -> Commands {
        self.retry_pending_publishes();

        let subscribed = self.subscribed;
        let active = |kind: ChannelKind| subscribed.contains(kind);

        let mut out = Commands::default();
        if active(ChannelKind::HwControl) {
            out.hw_control = self.commands.hw.as_mut().and_then(PolledCommand::tick);
        }
        if active(ChannelKind::WeatherControl) {
            out.weather_control = self.commands.weather.as_mut().and_then(PolledCommand::tick);
        }
        if active(ChannelKind::RulesControl) {
            out.rules_control = self.commands.rules.as_mut().and_then(PolledCommand::tick);
        }

        let plugin = if active(ChannelKind::PluginControl) {
            self.commands.plugin.as_mut().and_then(PolledCommand::tick)
        } else {
            None
        };
        if let Some(request) = plugin {
            self.apply_plugin_control(&request);
        }

        out
    }

    fn retry_pending_publishes(&mut self) {
        if let Some(scoring) = self.scoring.as_mut() {
            scoring.retry_pending();
        }
        if let Some(rules) = self.rules.as_mut() {
            rules.retry_pending();
        }
    }

    /// Enable-only: clear bits never unsubscribe anything.
    fn apply_plugin_control(&mut self, request: &PluginControl) {
        let requested = SubscriptionMask::from_bits(request.request_enable_mask);
        tracing::info!(mask = requested.bits(), "plugin control request");

        // Dependencies come first in ALL, so a request naming both succeeds
        for kind in requested.kinds() {
            if self.subscribed.contains(kind) {
                continue;
            }
            if let Err(e) = self.set_subscribed(kind, true) {
                tracing::warn!(channel = kind.as_str(), error = %e, "plugin control request refused");
            }
        }
    }

    /// Current bridge status.
    pub fn status(&self) -> ExtendedInfo {
        let mut info = ExtendedInfo {
            unsubscribed_mask: self.available.bits() & !self.subscribed.bits(),
            subscribed_mask: self.subscribed.bits(),
            frames_closed: self.telemetry.as_ref().map_or(0, |t| t.frames_closed()),
            scoring_updates: self.scoring_updates,
            available_mask: self.available.bits(),
            command_enabled_mask: 0,
            layout_mismatch_mask: 0,
            entities_dropped: self
                .telemetry
                .as_ref()
                .map_or(0, |t| u32::try_from(t.entities_dropped()).unwrap_or(u32::MAX)),
            ..Default::default()
        };
        write_name(&mut info.version, env!("CARGO_PKG_VERSION"));

        let command_states = [
            (ChannelKind::HwControl, self.commands.hw.as_ref().map(PolledCommand::is_disabled)),
            (
                ChannelKind::WeatherControl,
                self.commands.weather.as_ref().map(PolledCommand::is_disabled),
            ),
            (ChannelKind::RulesControl, self.commands.rules.as_ref().map(PolledCommand::is_disabled)),
            (
                ChannelKind::PluginControl,
                self.commands.plugin.as_ref().map(PolledCommand::is_disabled),
            ),
        ];
        for (kind, disabled) in command_states {
            match disabled {
                Some(true) => info.layout_mismatch_mask |= kind.bit(),
                Some(false) if self.subscribed.contains(kind) => {
                    info.command_enabled_mask |= kind.bit()
                }
                _ => {}
            }
        }
        info
    }

    /// Publishes the status record if it changed since the last call.
    pub fn publish_extended(&mut self) -> bool {
        let status = self.status();
        if self.last_status == Some(status) {
            return false;
        }
        let Some(extended) = self.extended.as_mut() else {
            return false;
        };
        extended.publish(&status);
        self.last_status = Some(status);
        true
    }

    /// Flushes zeroed state into every channel, then releases them, last
    /// created first.
    pub fn shutdown(&mut self) {
        self.flush_telemetry();
        for kind in ChannelKind::ALL.into_iter().rev() {
            if !self.available.contains(kind) {
                continue;
            }
            self.reset_channel(kind);
            self.release_channel(kind);
            self.available.remove(kind);
            self.subscribed.remove(kind);
            tracing::info!(channel = kind.as_str(), "channel released");
        }
        self.last_status = None;
    }

    fn reset_channel(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Extended => reset(self.extended.as_mut()),
            ChannelKind::Telemetry => reset(self.telemetry.as_mut()),
            ChannelKind::Scoring => {
                if let Some(c) = self.scoring.as_mut() {
                    c.reset();
                }
            }
            ChannelKind::Rules => {
                if let Some(c) = self.rules.as_mut() {
                    c.reset();
                }
            }
            ChannelKind::Weather => reset(self.weather.as_mut()),
            ChannelKind::HwControl => reset(self.commands.hw.as_mut().map(|c| c.channel_mut())),
            ChannelKind::WeatherControl => {
                reset(self.commands.weather.as_mut().map(|c| c.channel_mut()))
            }
            ChannelKind::RulesControl => {
                reset(self.commands.rules.as_mut().map(|c| c.channel_mut()))
            }
            ChannelKind::PluginControl => {
                reset(self.commands.plugin.as_mut().map(|c| c.channel_mut()))
            }
        }
    }

    fn release_channel(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Extended => self.extended = None,
            ChannelKind::Telemetry => self.telemetry = None,
            ChannelKind::Scoring => self.scoring = None,
            ChannelKind::Rules => self.rules = None,
            ChannelKind::Weather => self.weather = None,
            ChannelKind::HwControl => self.commands.hw = None,
            ChannelKind::WeatherControl => self.commands.weather = None,
            ChannelKind::RulesControl => self.commands.rules = None,
            ChannelKind::PluginControl => self.commands.plugin = None,
        }
    }

    pub fn region_name(&self, kind: ChannelKind) -> String {
        self.namer.name(kind.as_str())
    }

    pub fn is_subscribed(&self, kind: ChannelKind) -> bool {
        self.subscribed.contains(kind)
    }

    pub fn is_available(&self, kind: ChannelKind) -> bool {
        self.available.contains(kind)
    }

    pub fn subscribed_mask(&self) -> SubscriptionMask {
        self.subscribed
    }

    pub fn available_mask(&self) -> SubscriptionMask {
        self.available
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        if self.available != SubscriptionMask::empty() {
            self.shutdown();
        }
    }
}

fn reset<C: ManagedChannel>(channel: Option<&mut C>) {
    if let Some(c) = channel {
        c.reset();
    }
}

/// Command inputs switched off in the configuration are never created.
fn is_statically_disabled(config: &BridgeConfig, kind: ChannelKind) -> bool {
    match kind {
        ChannelKind::HwControl => !config.enable_hw_control_input,
        ChannelKind::WeatherControl => !config.enable_weather_control_input,
        ChannelKind::RulesControl => !config.enable_rules_control_input,
        ChannelKind::PluginControl => !config.enable_plugin_control,
        _ => false,
    }
}
