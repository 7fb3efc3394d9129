mod config;

pub use config::{BridgeConfig, ConfigError, ConsistencyMode};
