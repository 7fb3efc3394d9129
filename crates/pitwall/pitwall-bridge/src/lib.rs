//! The producer-side bridge: every channel kind wired to its protocol.

mod cadence;
mod error;
mod registry;

pub use cadence::{PollCadence, PolledCommand};
pub use error::SubscriptionError;
pub use registry::{ChannelRegistry, Commands};
