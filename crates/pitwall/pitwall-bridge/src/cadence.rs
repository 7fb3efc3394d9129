//! Adaptive polling of command channels.
//!
//! Commands tend to arrive in bursts. After a delivery the channel is polled
//! on every tick for a boost window; otherwise only every Nth tick.

use bytemuck::Pod;
use pitwall_icc::{CommandChannel, ManagedChannel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollCadence {
    boost_ticks: u32,
    baseline_interval: u32,
    boost_remaining: u32,
    tick: u64,
}

impl PollCadence {
    /// `baseline_interval` of 0 is treated as 1 (poll every tick).
    pub fn new(boost_ticks: u32, baseline_interval: u32) -> Self {
        Self {
            boost_ticks,
            baseline_interval: baseline_interval.max(1),
            boost_remaining: 0,
            tick: 0,
        }
    }

    /// Advance one tick and report whether to poll on it.
    pub fn should_poll(&mut self) -> bool {
        self.tick += 1;
        if self.boost_remaining > 0 {
            self.boost_remaining -= 1;
            return true;
        }
        self.tick % self.baseline_interval as u64 == 0
    }

    /// Open a boost window after a value arrived.
    pub fn on_delivery(&mut self) {
        self.boost_remaining = self.boost_ticks;
    }

    pub fn is_boosted(&self) -> bool {
        self.boost_remaining > 0
    }
}

/// A command channel together with its poll cadence.
pub struct PolledCommand<T: Pod> {
    channel: CommandChannel<T>,
    cadence: PollCadence,
}

impl<T: Pod> PolledCommand<T> {
    pub fn new(channel: CommandChannel<T>, cadence: PollCadence) -> Self {
        Self { channel, cadence }
    }

    /// Called once per producer tick.
    pub fn tick(&mut self) -> Option<T> {
        if !self.cadence.should_poll() {
            return None;
        }
        let value = self.channel.poll()?;
        self.cadence.on_delivery();
        tracing::debug!(channel = %self.channel.name(), "command received");
        Some(value)
    }

    pub fn channel_mut(&mut self) -> &mut CommandChannel<T> {
        &mut self.channel
    }

    pub fn is_disabled(&self) -> bool {
        self.channel.is_disabled()
    }
}
