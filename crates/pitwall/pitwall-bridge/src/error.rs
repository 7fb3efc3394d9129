use pitwall_events::ChannelKind;

/// Refused subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("{} is always on", .0.as_str())]
    AlwaysOn(ChannelKind),

    #[error("{} is unavailable (disabled by configuration or not mapped)", .0.as_str())]
    Unavailable(ChannelKind),

    #[error("{} needs {} subscribed first", .kind.as_str(), .dependency.as_str())]
    DependencyDisabled {
        kind: ChannelKind,
        dependency: ChannelKind,
    },
}
