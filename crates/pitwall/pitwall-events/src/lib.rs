pub mod channel;
pub mod control;
pub mod payload;

pub use channel::{ChannelKind, SubscriptionMask};
pub use control::{
    HW_CONTROL_LAYOUT_VERSION, HwControl, PLUGIN_CONTROL_LAYOUT_VERSION, PluginControl,
    RULES_CONTROL_LAYOUT_VERSION, RulesControl, WEATHER_CONTROL_LAYOUT_VERSION, WeatherControl,
};
pub use payload::{
    ExtendedInfo, MAX_MAPPED_VEHICLES, NAME_LEN, RulesInfo, ScoringInfo, Vec3, VehicleTelemetry,
    WeatherInfo, read_name, write_name,
};
