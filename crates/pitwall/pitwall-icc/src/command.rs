//! Command channels: one external client writes, the producer polls.
//!
//! The region is a versioned snapshot whose payload starts with the layout
//! version the client compiled against. The producer remembers the last
//! `begin` counter it consumed, so every completed client write is delivered
//! at most once no matter how often `poll` runs.

use crate::channel::ManagedChannel;
use crate::shm_layout::{COMMAND_PAYLOAD_OFFSET, PAYLOAD_OFFSET, bytes_for_command};
use crate::snapshot::SnapshotRegion;
use bytemuck::Pod;
use pitwall_mmap::MappingError;
use std::marker::PhantomData;
use std::path::Path;

/// Producer side of a command channel.
pub struct CommandChannel<T: Pod> {
    region: SnapshotRegion,
    supported_layout_version: u32,
    /// `begin` counter of the last write consumed (or skipped).
    last_seen_version: u32,
    /// One-way: set on the first layout mismatch, never cleared.
    disabled: bool,
    _pd: PhantomData<T>,
}

impl<T: Pod> CommandChannel<T> {
    /// Creates the region zero-filled. Messages declaring any layout version
    /// other than `supported_layout_version` disable the channel.
    pub fn create(
        dir: &Path,
        name: &str,
        supported_layout_version: u32,
    ) -> Result<Self, MappingError> {
        let payload_len = bytes_for_command::<T>() - PAYLOAD_OFFSET;
        let region = SnapshotRegion::create(dir, name, payload_len)?;
        let (begin, _) = region.version();
        Ok(Self {
            region,
            supported_layout_version,
            last_seen_version: begin,
            disabled: false,
            _pd: PhantomData,
        })
    }

    /// Returns the newest client write if it has not been delivered yet.
    ///
    /// A write still in flight, or one overwritten while it was being copied,
    /// is left for a later poll.
    pub fn poll(&mut self) -> Option<T> {
        if self.disabled {
            return None;
        }

        let header = self.region.header();
        let start = header.read_begin();
        if start.begin() == self.last_seen_version {
            return None;
        }

        let layout_version = self.region.read_at::<u32>(0);
        let payload = self.region.read_at::<T>(COMMAND_PAYLOAD_OFFSET);
        if self.region.header().is_torn(start) {
            tracing::trace!(channel = %self.region.name(), "command write in flight; retrying next poll");
            return None;
        }

        self.last_seen_version = start.begin();

        if layout_version != self.supported_layout_version {
            self.disabled = true;
            tracing::error!(
                channel = %self.region.name(),
                received = layout_version,
                supported = self.supported_layout_version,
                "command layout version mismatch; channel disabled for this session"
            );
            return None;
        }

        Some(payload)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn supported_layout_version(&self) -> u32 {
        self.supported_layout_version
    }

    pub fn last_seen_version(&self) -> u32 {
        self.last_seen_version
    }
}

impl<T: Pod> ManagedChannel for CommandChannel<T> {
    fn name(&self) -> &str {
        self.region.name()
    }

    /// Zero the message. The write this causes is marked as seen so the
    /// producer does not deliver it to itself.
    fn reset(&mut self) {
        self.region.begin_update();
        self.region.zero_payload();
        self.region.end_update();
        self.last_seen_version = self.region.version().0;
    }
}

/// Client side of a command channel. Only one writer per channel.
pub struct CommandWriter<T: Pod> {
    region: SnapshotRegion,
    _pd: PhantomData<T>,
}

impl<T: Pod> CommandWriter<T> {
    /// Opens a command region created by the producer.
    pub fn open(dir: &Path, name: &str) -> Result<Self, MappingError> {
        let payload_len = bytes_for_command::<T>() - PAYLOAD_OFFSET;
        Ok(Self {
            region: SnapshotRegion::open(dir, name, payload_len)?,
            _pd: PhantomData,
        })
    }

    #[inline]
    pub fn begin_update(&mut self) {
        self.region.begin_update();
    }

    #[inline]
    pub fn end_update(&mut self) {
        self.region.end_update();
    }

    /// Write the message body without touching the version header.
    pub fn write(&mut self, layout_version: u32, value: &T) {
        self.region.write_at(0, bytemuck::bytes_of(&layout_version));
        self.region.write_at(COMMAND_PAYLOAD_OFFSET, bytemuck::bytes_of(value));
    }

    /// One complete write: the producer will see it once.
    pub fn send(&mut self, layout_version: u32, value: &T) {
        self.begin_update();
        self.write(layout_version, value);
        self.end_update();
    }

    pub fn version(&self) -> (u32, u32) {
        self.region.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Cmd {
        value: f64,
    }

    const NAME: &str = "$Test_Cmd$";

    fn pair(dir: &Path, version: u32) -> (CommandChannel<Cmd>, CommandWriter<Cmd>) {
        let chan = CommandChannel::<Cmd>::create(dir, NAME, version).unwrap();
        let writer = CommandWriter::<Cmd>::open(dir, NAME).unwrap();
        (chan, writer)
    }

    #[test]
    fn fresh_channel_delivers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, _writer) = pair(dir.path(), 1);
        assert_eq!(chan.poll(), None);
    }

    #[test]
    fn each_write_is_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, mut writer) = pair(dir.path(), 1);

        writer.send(1, &Cmd { value: 2.5 });
        assert_eq!(chan.poll(), Some(Cmd { value: 2.5 }));
        assert_eq!(chan.poll(), None);

        writer.send(1, &Cmd { value: 2.5 });
        assert_eq!(chan.poll(), Some(Cmd { value: 2.5 }), "same value, new write");
    }

    #[test]
    fn many_payload_writes_in_one_version_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, mut writer) = pair(dir.path(), 1);

        writer.begin_update();
        for k in 0..5 {
            writer.write(1, &Cmd { value: k as f64 });
        }
        writer.end_update();

        let delivered: Vec<Cmd> = (0..8).filter_map(|_| chan.poll()).collect();
        assert_eq!(delivered, vec![Cmd { value: 4.0 }]);
    }

    #[test]
    fn in_flight_write_waits_for_close() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, mut writer) = pair(dir.path(), 1);

        writer.begin_update();
        writer.write(1, &Cmd { value: 1.0 });
        assert_eq!(chan.poll(), None);

        writer.end_update();
        assert_eq!(chan.poll(), Some(Cmd { value: 1.0 }));
    }

    #[test]
    fn layout_mismatch_disables_for_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, mut writer) = pair(dir.path(), 1);

        writer.send(2, &Cmd { value: 1.0 });
        assert_eq!(chan.poll(), None);
        assert!(chan.is_disabled());

        writer.send(1, &Cmd { value: 3.0 });
        for _ in 0..4 {
            assert_eq!(chan.poll(), None);
        }
    }

    #[test]
    fn reset_is_not_delivered_to_the_producer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut chan, mut writer) = pair(dir.path(), 1);

        writer.send(1, &Cmd { value: 7.0 });
        chan.reset();
        assert_eq!(chan.poll(), None);
        assert_eq!(writer.version(), (2, 2));
    }
}
