// ChannelKind is consistent and stable across all processes: the bit
// position of each kind is part of the wire format (masks in the extended
// channel and the plugin-control command).

/// Logical channel published (or consumed) by the bridge.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Telemetry = 0,
    Scoring = 1,
    Rules = 2,
    Weather = 3,
    Extended = 4,
    HwControl = 5,
    WeatherControl = 6,
    RulesControl = 7,
    PluginControl = 8,
}

impl ChannelKind {
    /// Creation order. Every kind comes after the kind it depends on, so
    /// shutdown walks this list backwards.
    pub const ALL: [ChannelKind; 9] = [
        ChannelKind::Extended,
        ChannelKind::Telemetry,
        ChannelKind::Scoring,
        ChannelKind::Rules,
        ChannelKind::Weather,
        ChannelKind::HwControl,
        ChannelKind::WeatherControl,
        ChannelKind::RulesControl,
        ChannelKind::PluginControl,
    ];

    #[inline]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Telemetry => "Telemetry",
            ChannelKind::Scoring => "Scoring",
            ChannelKind::Rules => "Rules",
            ChannelKind::Weather => "Weather",
            ChannelKind::Extended => "Extended",
            ChannelKind::HwControl => "HWControl",
            ChannelKind::WeatherControl => "WeatherControl",
            ChannelKind::RulesControl => "RulesControl",
            ChannelKind::PluginControl => "PluginControl",
        }
    }

    /// The data channel a command channel feeds back into.
    pub const fn dependency(self) -> Option<ChannelKind> {
        match self {
            ChannelKind::HwControl => Some(ChannelKind::Telemetry),
            ChannelKind::WeatherControl => Some(ChannelKind::Weather),
            ChannelKind::RulesControl => Some(ChannelKind::Rules),
            _ => None,
        }
    }

    /// Always-on kinds ignore the unsubscribe mask.
    pub const fn is_always_on(self) -> bool {
        matches!(self, ChannelKind::Extended | ChannelKind::PluginControl)
    }
}

/// One bit per [`ChannelKind`].
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SubscriptionMask(u32);

impl SubscriptionMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        ChannelKind::ALL
            .iter()
            .fold(Self::empty(), |mask, kind| mask.with(*kind))
    }

    /// Bits that do not name a kind are dropped.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::all().0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, kind: ChannelKind) -> bool {
        self.0 & kind.bit() != 0
    }

    #[inline]
    pub const fn with(self, kind: ChannelKind) -> Self {
        Self(self.0 | kind.bit())
    }

    #[inline]
    pub fn insert(&mut self, kind: ChannelKind) {
        self.0 |= kind.bit();
    }

    #[inline]
    pub fn remove(&mut self, kind: ChannelKind) {
        self.0 &= !kind.bit();
    }

    pub fn kinds(self) -> impl Iterator<Item = ChannelKind> {
        ChannelKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_are_created_first() {
        for (i, kind) in ChannelKind::ALL.iter().enumerate() {
            if let Some(dep) = kind.dependency() {
                let dep_pos = ChannelKind::ALL.iter().position(|k| *k == dep).unwrap();
                assert!(dep_pos < i, "{kind:?} created before {dep:?}");
            }
        }
    }

    #[test]
    fn bits_are_distinct() {
        let mask = SubscriptionMask::all();
        assert_eq!(mask.bits().count_ones() as usize, ChannelKind::ALL.len());
    }

    #[test]
    fn from_bits_drops_unknown_bits() {
        let mask = SubscriptionMask::from_bits(0xFFFF_FFFF);
        assert_eq!(mask, SubscriptionMask::all());
    }

    #[test]
    fn insert_remove_contains() {
        let mut mask = SubscriptionMask::empty();
        mask.insert(ChannelKind::Weather);
        assert!(mask.contains(ChannelKind::Weather));
        assert!(!mask.contains(ChannelKind::Rules));
        mask.remove(ChannelKind::Weather);
        assert_eq!(mask, SubscriptionMask::empty());
    }
}
