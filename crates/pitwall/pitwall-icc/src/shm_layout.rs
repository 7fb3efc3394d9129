//! Shared memory layout definitions.
//!
//! Every region starts at a page-aligned address. Headers hold only `u32`
//! fields and payloads follow at 4-byte alignment, so payloads are copied
//! byte-wise rather than referenced in place.
//!
//! # Versioned snapshot
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ begin (u32)  │ end (u32)    │ payload: T                   │
//! │ offset 0     │ offset 4     │ offset 8                     │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! # Command channel
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────┬─────────────────┐
//! │ begin (u32)  │ end (u32)    │ layout_version u32 │ payload: T      │
//! │ offset 0     │ offset 4     │ offset 8           │ offset 12       │
//! └──────────────┴──────────────┴────────────────────┴─────────────────┘
//! ```
//!
//! # Aggregated frame
//!
//! ```text
//! ┌───────┬─────┬───────────────────────┬──────────────┬─────────────────────┐
//! │ begin │ end │ bytes_updated_hint u32│ count (u32)  │ entities: [E; CAP]  │
//! │ 0     │ 4   │ 8                     │ 12           │ 16                  │
//! └───────┴─────┴───────────────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! # Double buffer (one region per buffer)
//!
//! ```text
//! ┌─────────────────────────┬────────────────────────┐
//! │ is_current_read (u32)   │ payload: T             │
//! │ offset 0                │ offset 4               │
//! └─────────────────────────┴────────────────────────┘
//! ```

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering, fence};

/// Begin/end counter pair preceding every versioned payload.
///
/// Steady state: `begin == end`. While a write is in flight: `begin == end + 1`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct VersionHeader {
    pub begin: AtomicU32,
    pub end: AtomicU32,
}

/// Counter values found out of step when an update started or finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Desync {
    pub begin: u32,
    pub end: u32,
}

impl VersionHeader {
    /// Writer side: open an update.
    ///
    /// A header left mid-write (`begin != end`) is healed first by forcing
    /// `end = begin`; the stale values are returned so the caller can log them.
    #[inline]
    pub fn begin_update(&self) -> Option<Desync> {
        let begin = self.begin.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);

        let desync = if begin != end {
            self.end.store(begin, Ordering::Relaxed);
            Some(Desync { begin, end })
        } else {
            None
        };

        self.begin.store(begin.wrapping_add(1), Ordering::Relaxed);
        // Payload stores must not become visible before the new `begin`
        fence(Ordering::Release);
        desync
    }

    /// Writer side: close an update. An unmatched close is healed by forcing
    /// `begin = end`.
    #[inline]
    pub fn end_update(&self) -> Option<Desync> {
        let end = self.end.load(Ordering::Relaxed).wrapping_add(1);
        self.end.store(end, Ordering::Release);

        let begin = self.begin.load(Ordering::Relaxed);
        if begin != end {
            self.begin.store(end, Ordering::Release);
            return Some(Desync { begin, end });
        }
        None
    }

    /// Reader side: first half of a sample, taken before copying the payload.
    #[inline]
    pub fn read_begin(&self) -> SampleStart {
        let begin = self.begin.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        SampleStart {
            begin,
            settled: begin == end,
        }
    }

    /// Reader side: second half of a sample. `true` when the copy made since
    /// `start` may be torn: a write was in flight when it started, one is in
    /// flight now, or one started in between.
    #[inline]
    pub fn is_torn(&self, start: SampleStart) -> bool {
        fence(Ordering::Acquire);
        let begin = self.begin.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        !start.settled || start.begin != begin || begin != end
    }

    #[inline]
    pub fn load(&self) -> (u32, u32) {
        (
            self.begin.load(Ordering::Acquire),
            self.end.load(Ordering::Acquire),
        )
    }
}

/// Counters observed when a reader started copying.
#[derive(Clone, Copy, Debug)]
pub struct SampleStart {
    begin: u32,
    settled: bool,
}

impl SampleStart {
    #[inline]
    pub fn begin(&self) -> u32 {
        self.begin
    }
}

/// Fixed header at the start of an aggregated frame payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    /// Payload offset just past the last written entity; readers need not
    /// look beyond it.
    pub bytes_updated_hint: u32,
    pub entity_count: u32,
}

pub const HEADER_SIZE: usize = size_of::<VersionHeader>();

/// Payload offset from the start of a versioned region.
pub const PAYLOAD_OFFSET: usize = HEADER_SIZE;

/// Command payload offset, relative to [`PAYLOAD_OFFSET`].
pub const COMMAND_PAYLOAD_OFFSET: usize = size_of::<u32>();

/// Entity array offset, relative to [`PAYLOAD_OFFSET`].
pub const FRAME_ENTITIES_OFFSET: usize = size_of::<FrameHeader>();

/// Double-buffer payload offset from the start of each buffer region.
pub const FLIP_PAYLOAD_OFFSET: usize = size_of::<u32>();

pub fn bytes_for_snapshot<T: Pod>() -> usize {
    PAYLOAD_OFFSET + size_of::<T>()
}

pub fn bytes_for_command<T: Pod>() -> usize {
    PAYLOAD_OFFSET + COMMAND_PAYLOAD_OFFSET + size_of::<T>()
}

pub fn bytes_for_frame<E: Pod>(capacity: usize) -> usize {
    PAYLOAD_OFFSET + FRAME_ENTITIES_OFFSET + capacity * size_of::<E>()
}

pub fn bytes_for_flip_buffer<T: Pod>() -> usize {
    FLIP_PAYLOAD_OFFSET + size_of::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_offsets_are_fixed() {
        assert_eq!(HEADER_SIZE, 8);
        assert_eq!(PAYLOAD_OFFSET + COMMAND_PAYLOAD_OFFSET, 12);
        assert_eq!(PAYLOAD_OFFSET + FRAME_ENTITIES_OFFSET, 16);
        assert_eq!(bytes_for_snapshot::<u64>(), 16);
        assert_eq!(bytes_for_frame::<u64>(4), 16 + 32);
        assert_eq!(bytes_for_flip_buffer::<u64>(), 12);
    }

    #[test]
    fn cycles_keep_counters_equal() {
        let h = VersionHeader::default();
        for n in 1..=5u32 {
            assert_eq!(h.begin_update(), None);
            assert_eq!(h.load(), (n, n - 1));
            assert_eq!(h.end_update(), None);
            assert_eq!(h.load(), (n, n));
        }
    }

    #[test]
    fn counters_wrap() {
        let h = VersionHeader::default();
        h.begin.store(u32::MAX, Ordering::Relaxed);
        h.end.store(u32::MAX, Ordering::Relaxed);
        h.begin_update();
        h.end_update();
        assert_eq!(h.load(), (0, 0));
    }

    #[test]
    fn unmatched_begin_is_healed_on_next_begin() {
        let h = VersionHeader::default();
        h.begin.store(7, Ordering::Relaxed);
        h.end.store(3, Ordering::Relaxed);

        assert_eq!(h.begin_update(), Some(Desync { begin: 7, end: 3 }));
        assert_eq!(h.load(), (8, 7));
        assert_eq!(h.end_update(), None);
        assert_eq!(h.load(), (8, 8));
    }

    #[test]
    fn unmatched_end_is_healed() {
        let h = VersionHeader::default();
        h.begin.store(4, Ordering::Relaxed);
        h.end.store(4, Ordering::Relaxed);

        assert_eq!(h.end_update(), Some(Desync { begin: 4, end: 5 }));
        assert_eq!(h.load(), (5, 5));
    }

    #[test]
    fn torn_only_while_write_in_flight() {
        let h = VersionHeader::default();
        let first = h.read_begin();
        assert!(!h.is_torn(first));

        h.begin_update();
        let first = h.read_begin();
        assert!(h.is_torn(first));

        h.end_update();
        assert!(h.is_torn(first), "sample started while a write was in flight");
        let first = h.read_begin();
        assert!(!h.is_torn(first));

        h.begin_update();
        h.end_update();
        assert!(h.is_torn(first), "a full write happened during the sample");
    }
}
