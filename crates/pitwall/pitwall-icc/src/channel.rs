//! Operations shared by every channel kind.
//!
//! Channels are composed around a region rather than derived from a common
//! header type; these traits carry only what an owner needs to drive them
//! uniformly.

/// Lifecycle hooks used by an owner that manages many channels.
pub trait ManagedChannel {
    /// Region name this channel was created under.
    fn name(&self) -> &str;

    /// Flush zeroed state into the channel so readers see it emptied.
    fn reset(&mut self);
}

/// A producer-side channel that publishes whole values of `T`.
pub trait Publish<T>: ManagedChannel {
    fn publish(&mut self, value: &T);

    /// Finish a publish that an earlier call had to defer. Called once per
    /// tick by the owner; channels that never defer do nothing.
    fn retry_pending(&mut self) {}
}
