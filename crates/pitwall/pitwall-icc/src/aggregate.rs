//! Frame aggregation: per-entity updates in, one multi-entity frame per tick out.
//!
//! The host hands the producer one entity at a time with no explicit
//! "tick done" signal. A frame closes when any of these happens:
//! - the event timestamp moves further than one tick from the frame's first
//!   event,
//! - an entity slot repeats (the next tick has started),
//! - the collected count reaches the expected population.
//!
//! Closing writes the entity count and payloads inside one begin/end bracket,
//! so readers see whole frames or a torn flag.

use crate::channel::ManagedChannel;
use crate::shm_layout::{FRAME_ENTITIES_OFFSET, FrameHeader, PAYLOAD_OFFSET, bytes_for_frame};
use crate::snapshot::{SnapshotRegion, SnapshotView};
use bytemuck::Pod;
use pitwall_mmap::MappingError;
use std::mem::size_of;
use std::path::Path;
use std::time::Duration;

/// Tick-boundary rule based on event timestamps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickHeuristic {
    /// Seconds
    tick_length: f64,
}

impl TickHeuristic {
    pub fn new(tick_length: Duration) -> Self {
        Self {
            tick_length: tick_length.as_secs_f64(),
        }
    }

    pub fn from_millis(ms: f64) -> Self {
        Self {
            tick_length: ms / 1000.0,
        }
    }

    pub fn tick_length_secs(&self) -> f64 {
        self.tick_length
    }

    /// `true` if an event at `timestamp` cannot belong to a frame whose first
    /// event was at `reference`. Timestamps are seconds.
    #[inline]
    pub fn starts_new_tick(&self, reference: f64, timestamp: f64) -> bool {
        (timestamp - reference).abs() > self.tick_length
    }
}

impl Default for TickHeuristic {
    fn default() -> Self {
        Self::from_millis(20.0)
    }
}

/// Slot of an entity in a frame of `capacity` entries. Negative ids share slot 0.
#[inline]
pub fn slot(entity_id: i64, capacity: usize) -> usize {
    (entity_id.max(0) as u64 % capacity as u64) as usize
}

/// Fixed-size bitset over entity slots.
#[derive(Clone, Debug)]
pub struct SlotMask {
    words: Vec<u64>,
}

impl SlotMask {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    #[inline]
    pub fn contains(&self, slot: usize) -> bool {
        self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    pub fn insert(&mut self, slot: usize) {
        self.words[slot / 64] |= 1 << (slot % 64);
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

/// One host callback: an entity's payload at a simulation timestamp.
#[derive(Clone, Copy, Debug)]
pub struct EntityUpdate<E> {
    pub entity_id: i64,
    /// Seconds
    pub timestamp: f64,
    pub payload: E,
}

pub struct FrameAggregator<E: Pod> {
    region: SnapshotRegion,
    capacity: usize,
    heuristic: TickHeuristic,
    expected_count: Option<usize>,

    // Assembly state, reset per frame
    open: bool,
    reference_ts: f64,
    seen: SlotMask,
    collected: Vec<E>,
    overflow_logged: bool,

    frames_closed: u64,
    entities_dropped: u64,
}

impl<E: Pod> FrameAggregator<E> {
    /// Creates the frame region sized for `capacity` entities (at least one).
    pub fn create(
        dir: &Path,
        name: &str,
        capacity: usize,
        heuristic: TickHeuristic,
    ) -> Result<Self, MappingError> {
        let capacity = capacity.max(1);
        let payload_len = bytes_for_frame::<E>(capacity) - PAYLOAD_OFFSET;
        let region = SnapshotRegion::create(dir, name, payload_len)?;

        Ok(Self {
            region,
            capacity,
            heuristic,
            expected_count: None,
            open: false,
            reference_ts: 0.0,
            seen: SlotMask::new(capacity),
            collected: Vec::with_capacity(capacity),
            overflow_logged: false,
            frames_closed: 0,
            entities_dropped: 0,
        })
    }

    /// Population to close frames at. `None` or `Some(0)` leaves closing to
    /// the timestamp and repeated-slot rules.
    pub fn set_expected_count(&mut self, expected: Option<usize>) {
        self.expected_count = expected.filter(|n| *n > 0);
    }

    pub fn expected_count(&self) -> Option<usize> {
        self.expected_count
    }

    pub fn on_entity_update(&mut self, update: EntityUpdate<E>) {
        if !self.open || self.heuristic.starts_new_tick(self.reference_ts, update.timestamp) {
            self.close_frame();
            self.open_frame(update.timestamp);
        }

        let slot = slot(update.entity_id, self.capacity);
        if self.seen.contains(slot) {
            tracing::trace!(entity_id = update.entity_id, slot, "slot repeated; next tick");
            self.close_frame();
            self.open_frame(update.timestamp);
        }

        if self.collected.len() >= self.capacity {
            self.entities_dropped += 1;
            if !self.overflow_logged {
                self.overflow_logged = true;
                tracing::error!(
                    channel = %self.region.name(),
                    capacity = self.capacity,
                    entity_id = update.entity_id,
                    "frame full; dropping entities until the frame closes"
                );
            }
            return;
        }

        self.seen.insert(slot);
        self.collected.push(update.payload);

        if self.expected_count.is_some_and(|n| self.collected.len() >= n) {
            self.close_frame();
        }
    }

    /// Close the open frame now, if any. Returns whether a frame was written.
    pub fn flush(&mut self) -> bool {
        self.close_frame()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn frames_closed(&self) -> u64 {
        self.frames_closed
    }

    pub fn entities_dropped(&self) -> u64 {
        self.entities_dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn version(&self) -> (u32, u32) {
        self.region.version()
    }

    fn open_frame(&mut self, timestamp: f64) {
        self.open = true;
        self.reference_ts = timestamp;
        self.seen.clear();
        self.collected.clear();
        self.overflow_logged = false;
    }

    fn close_frame(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;

        let count = self.collected.len();
        let header = FrameHeader {
            bytes_updated_hint: (FRAME_ENTITIES_OFFSET + count * size_of::<E>()) as u32,
            entity_count: count as u32,
        };

        self.region.begin_update();
        self.region.write_at(0, bytemuck::bytes_of(&header));
        self.region
            .write_at(FRAME_ENTITIES_OFFSET, bytemuck::cast_slice(&self.collected));
        self.region.end_update();

        self.frames_closed += 1;
        tracing::trace!(
            channel = %self.region.name(),
            entities = count,
            frames = self.frames_closed,
            "frame closed"
        );

        self.collected.clear();
        self.seen.clear();
        true
    }
}

impl<E: Pod> ManagedChannel for FrameAggregator<E> {
    fn name(&self) -> &str {
        self.region.name()
    }

    /// Drop the frame in assembly and publish an empty one.
    fn reset(&mut self) {
        self.open = false;
        self.collected.clear();
        self.seen.clear();
        self.region.begin_update();
        self.region.zero_payload();
        self.region.end_update();
    }
}

/// One sample of a frame taken by [`FrameReader::read_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSample {
    pub entity_count: usize,
    pub bytes_updated_hint: u32,
    pub torn: bool,
}

pub struct FrameReader<E: Pod> {
    view: SnapshotView,
    capacity: usize,
    _pd: std::marker::PhantomData<E>,
}

impl<E: Pod> FrameReader<E> {
    /// `capacity` must match the producer's.
    pub fn open(dir: &Path, name: &str, capacity: usize) -> Result<Self, MappingError> {
        let capacity = capacity.max(1);
        let payload_len = bytes_for_frame::<E>(capacity) - PAYLOAD_OFFSET;
        Ok(Self {
            view: SnapshotView::open(dir, name, payload_len)?,
            capacity,
            _pd: std::marker::PhantomData,
        })
    }

    /// Copy the latest frame into `out`, replacing its contents.
    pub fn read_frame(&self, out: &mut Vec<E>) -> FrameSample {
        let header = self.view.header();
        let start = header.read_begin();

        let frame = self.view.read_at::<FrameHeader>(0);
        let count = (frame.entity_count as usize).min(self.capacity);
        out.clear();
        out.resize(count, E::zeroed());
        self.view.read_slice_at(FRAME_ENTITIES_OFFSET, out.as_mut_slice());

        FrameSample {
            entity_count: count,
            bytes_updated_hint: frame.bytes_updated_hint,
            torn: header.is_torn(start),
        }
    }

    pub fn version(&self) -> (u32, u32) {
        self.view.header().load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Car {
        id: i64,
        speed: f64,
    }

    const NAME: &str = "$Test_Frame$";

    fn car(id: i64, ts: f64) -> EntityUpdate<Car> {
        EntityUpdate {
            entity_id: id,
            timestamp: ts,
            payload: Car {
                id,
                speed: id as f64 * 10.0,
            },
        }
    }

    fn setup(dir: &Path, capacity: usize) -> (FrameAggregator<Car>, FrameReader<Car>) {
        let agg =
            FrameAggregator::<Car>::create(dir, NAME, capacity, TickHeuristic::default()).unwrap();
        let reader = FrameReader::<Car>::open(dir, NAME, capacity).unwrap();
        (agg, reader)
    }

    fn ids(frame: &[Car]) -> Vec<i64> {
        frame.iter().map(|c| c.id).collect()
    }

    #[test]
    fn heuristic_uses_absolute_delta() {
        let h = TickHeuristic::from_millis(20.0);
        assert!(!h.starts_new_tick(1.0, 1.015));
        assert!(h.starts_new_tick(1.0, 1.025));
        assert!(h.starts_new_tick(1.0, 0.5), "time went backwards");
        assert_eq!(TickHeuristic::new(Duration::from_millis(20)), h);
    }

    #[test]
    fn slots_wrap_and_clamp_negative_ids() {
        assert_eq!(slot(3, 128), 3);
        assert_eq!(slot(130, 128), 2);
        assert_eq!(slot(-5, 128), 0);

        let mut mask = SlotMask::new(130);
        mask.insert(129);
        assert!(mask.contains(129));
        assert!(!mask.contains(1));
        mask.clear();
        assert!(!mask.contains(129));
    }

    #[test]
    fn expected_count_closes_frame_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 8);
        agg.set_expected_count(Some(3));

        for id in [1, 2, 3] {
            agg.on_entity_update(car(id, 1.0));
        }

        assert!(!agg.is_open());
        assert_eq!(agg.frames_closed(), 1);

        let mut frame = Vec::new();
        let sample = reader.read_frame(&mut frame);
        assert!(!sample.torn);
        assert_eq!(sample.entity_count, 3);
        assert_eq!(
            sample.bytes_updated_hint as usize,
            FRAME_ENTITIES_OFFSET + 3 * size_of::<Car>()
        );
        assert_eq!(ids(&frame), vec![1, 2, 3]);
        assert_eq!(reader.version(), (1, 1));
    }

    #[test]
    fn repeated_id_starts_the_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 8);

        for id in [1, 2, 1] {
            agg.on_entity_update(car(id, 1.0));
        }

        assert_eq!(agg.frames_closed(), 1);
        assert!(agg.is_open());

        let mut frame = Vec::new();
        reader.read_frame(&mut frame);
        assert_eq!(ids(&frame), vec![1, 2]);

        assert!(agg.flush());
        reader.read_frame(&mut frame);
        assert_eq!(ids(&frame), vec![1]);
        assert!(!agg.flush());
    }

    #[test]
    fn timestamp_jump_closes_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 8);

        agg.on_entity_update(car(1, 1.000));
        agg.on_entity_update(car(2, 1.010));
        agg.on_entity_update(car(3, 1.050));

        assert_eq!(agg.frames_closed(), 1);
        let mut frame = Vec::new();
        reader.read_frame(&mut frame);
        assert_eq!(ids(&frame), vec![1, 2]);
    }

    #[test]
    fn full_frame_closes_on_the_next_repeated_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 2);

        for id in [1, 2, 1, 2] {
            agg.on_entity_update(car(id, 1.0));
        }
        assert_eq!(agg.entities_dropped(), 0);
        assert_eq!(agg.frames_closed(), 1);

        let mut frame = Vec::new();
        let sample = reader.read_frame(&mut frame);
        assert_eq!(sample.entity_count, 2);
        assert_eq!(ids(&frame), vec![1, 2]);
    }

    #[test]
    fn full_frames_within_one_tick_length_are_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 2);

        for (id, ts) in [(1, 1.000), (2, 1.000), (1, 1.010), (2, 1.010), (1, 1.020)] {
            agg.on_entity_update(car(id, ts));
        }
        assert_eq!(agg.frames_closed(), 2);
        assert_eq!(agg.entities_dropped(), 0);
        assert!(agg.is_open());

        let mut frame = Vec::new();
        let sample = reader.read_frame(&mut frame);
        assert_eq!(sample.entity_count, 2);
        assert_eq!(ids(&frame), vec![1, 2]);

        assert!(agg.flush());
        let sample = reader.read_frame(&mut frame);
        assert_eq!(sample.entity_count, 1);
        assert_eq!(ids(&frame), vec![1]);
    }

    #[test]
    fn zero_expected_count_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, _reader) = setup(dir.path(), 4);
        agg.set_expected_count(Some(0));
        assert_eq!(agg.expected_count(), None);

        agg.on_entity_update(car(1, 1.0));
        assert!(agg.is_open());
    }

    #[test]
    fn reset_publishes_an_empty_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut agg, reader) = setup(dir.path(), 4);
        agg.set_expected_count(Some(2));
        agg.on_entity_update(car(1, 1.0));
        agg.on_entity_update(car(2, 1.0));
        agg.on_entity_update(car(3, 1.1));

        agg.reset();
        assert!(!agg.is_open());

        let mut frame = vec![Car::default(); 3];
        let sample = reader.read_frame(&mut frame);
        assert_eq!(sample.entity_count, 0);
        assert!(frame.is_empty());
    }
}
