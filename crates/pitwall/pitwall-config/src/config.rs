use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// How whole-value channels (scoring, rules) are published.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Single buffer, readers detect tears.
    #[default]
    Versioned,
    /// Two buffers flipped under an advisory mutex.
    DoubleBuffered,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "defaults::app_name")]
    pub app_name: String,
    /// Directory holding the region and lock files.
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Suffix region names with the producer pid.
    #[serde(default)]
    pub dedicated_server: bool,
    #[serde(default)]
    pub global_namespace: bool,
    /// Channel kinds (by bit) left unsubscribed at startup.
    #[serde(default)]
    pub unsubscribed_mask: u32,

    #[serde(default)]
    pub consistency: ConsistencyMode,
    #[serde(default)]
    pub flip_blocking: bool,
    #[serde(default = "defaults::flip_lock_timeout_ms")]
    pub flip_lock_timeout_ms: u64,
    #[serde(default = "defaults::max_flip_retries")]
    pub max_flip_retries: u32,

    #[serde(default = "defaults::tick_length_ms")]
    pub tick_length_ms: f64,
    #[serde(default = "defaults::entity_capacity")]
    pub entity_capacity: usize,

    #[serde(default)]
    pub enable_hw_control_input: bool,
    #[serde(default)]
    pub enable_weather_control_input: bool,
    #[serde(default)]
    pub enable_rules_control_input: bool,
    #[serde(default = "defaults::enable_plugin_control")]
    pub enable_plugin_control: bool,

    /// Ticks polled back to back after a command arrives.
    #[serde(default = "defaults::command_boost_ticks")]
    pub command_boost_ticks: u32,
    /// Poll every Nth tick outside a boost window.
    #[serde(default = "defaults::command_baseline_interval")]
    pub command_baseline_interval: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn app_name() -> String {
        "Pitwall".into()
    }

    pub fn shm_dir() -> String {
        "/dev/shm".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn flip_lock_timeout_ms() -> u64 {
        20
    }

    pub fn max_flip_retries() -> u32 {
        10
    }

    pub fn tick_length_ms() -> f64 {
        20.0
    }

    pub fn entity_capacity() -> usize {
        128
    }

    pub fn enable_plugin_control() -> bool {
        true
    }

    pub fn command_boost_ticks() -> u32 {
        50
    }

    pub fn command_baseline_interval() -> u32 {
        5
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_name: defaults::app_name(),
            shm_dir: defaults::shm_dir(),
            log_level: defaults::log_level(),
            dedicated_server: false,
            global_namespace: false,
            unsubscribed_mask: 0,
            consistency: ConsistencyMode::default(),
            flip_blocking: false,
            flip_lock_timeout_ms: defaults::flip_lock_timeout_ms(),
            max_flip_retries: defaults::max_flip_retries(),
            tick_length_ms: defaults::tick_length_ms(),
            entity_capacity: defaults::entity_capacity(),
            enable_hw_control_input: false,
            enable_weather_control_input: false,
            enable_rules_control_input: false,
            enable_plugin_control: defaults::enable_plugin_control(),
            command_boost_ticks: defaults::command_boost_ticks(),
            command_baseline_interval: defaults::command_baseline_interval(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BridgeConfig = toml::from_str(&toml_to_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() || self.app_name.contains(['/', '$']) {
            return Err(ConfigError::Invalid(format!(
                "app_name '{}' must be non-empty and free of '/' and '$'",
                self.app_name
            )));
        }
        if !(self.tick_length_ms.is_finite() && self.tick_length_ms > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tick_length_ms must be positive, got {}",
                self.tick_length_ms
            )));
        }
        if self.entity_capacity == 0 {
            return Err(ConfigError::Invalid("entity_capacity must be at least 1".into()));
        }
        if self.max_flip_retries == 0 {
            return Err(ConfigError::Invalid("max_flip_retries must be at least 1".into()));
        }
        if self.command_baseline_interval == 0 {
            return Err(ConfigError::Invalid(
                "command_baseline_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn flip_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_lock_timeout_ms)
    }

    pub fn shm_dir(&self) -> &Path {
        Path::new(&self.shm_dir)
    }
}
