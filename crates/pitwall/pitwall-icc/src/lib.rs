//! Shared-memory channel protocols between one producer and external readers.
//!
//! - [`VersionedSnapshot`]: lock-free single buffer with tear detection.
//! - [`DoubleBufferChannel`]: two buffers flipped under an advisory mutex.
//! - [`CommandChannel`]: client-to-producer messages applied at most once.
//! - [`FrameAggregator`]: per-entity updates assembled into per-tick frames.

mod aggregate;
mod channel;
mod command;
mod double_buffer;
mod naming;
pub mod shm_layout;
mod snapshot;

pub use aggregate::{
    EntityUpdate, FrameAggregator, FrameReader, FrameSample, SlotMask, TickHeuristic, slot,
};
pub use channel::{ManagedChannel, Publish};
pub use command::{CommandChannel, CommandWriter};
pub use double_buffer::{
    DoubleBufferChannel, FlipConfig, FlipOutcome, FlipReader, buffer_names, mutex_name,
};
pub use naming::{GLOBAL_NAMESPACE_PREFIX, RegionNamer};
pub use snapshot::{SnapshotReader, SnapshotRegion, SnapshotView, VersionedSnapshot};
