//! Versioned single-buffer snapshots.
//!
//! The producer writes in place between `begin_update` and `end_update`;
//! readers never block it and instead use the version header to tell whether
//! the copy they took may be torn.
//!
//! # Thread Safety
//! - `SnapshotRegion` / `VersionedSnapshot` are single-writer: one producer
//!   thread per region.
//! - `SnapshotReader` may live in any number of processes.

use crate::channel::{ManagedChannel, Publish};
use crate::shm_layout::{PAYLOAD_OFFSET, SampleStart, VersionHeader, bytes_for_snapshot};
use bytemuck::Pod;
use pitwall_mmap::{MappingError, MmapRegion, MmapRegionMut, region_path};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr;

/// Untyped writable region: a version header followed by `payload_len` bytes.
///
/// Typed channels (`VersionedSnapshot`, `CommandChannel`, `FrameAggregator`)
/// are thin layouts over this.
pub struct SnapshotRegion {
    /// Owns the mmap lifetime; kept alive but not directly accessed after init.
    _mm: MmapRegionMut,
    base: *mut u8,
    payload_len: usize,
    name: String,
}

impl SnapshotRegion {
    /// Create the named region zero-filled (producer side).
    pub fn create(dir: &Path, name: &str, payload_len: usize) -> Result<Self, MappingError> {
        let mm = MmapRegionMut::create_rw(region_path(dir, name), PAYLOAD_OFFSET + payload_len)?;
        Ok(Self::from_mapping(mm, name, payload_len))
    }

    /// Open a region created by another process for writing (command client side).
    pub fn open(dir: &Path, name: &str, payload_len: usize) -> Result<Self, MappingError> {
        let mm = MmapRegionMut::open_rw(region_path(dir, name), PAYLOAD_OFFSET + payload_len)?;
        Ok(Self::from_mapping(mm, name, payload_len))
    }

    fn from_mapping(mut mm: MmapRegionMut, name: &str, payload_len: usize) -> Self {
        let base = mm.as_mut_ptr();
        Self {
            _mm: mm,
            base,
            payload_len,
            name: name.to_string(),
        }
    }

    #[inline(always)]
    pub fn header(&self) -> &VersionHeader {
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long
        unsafe { &*(self.base as *const VersionHeader) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn version(&self) -> (u32, u32) {
        self.header().load()
    }

    pub fn begin_update(&mut self) {
        if let Some(d) = self.header().begin_update() {
            tracing::warn!(
                channel = %self.name,
                begin = d.begin,
                end = d.end,
                "version desync at begin_update (previous update never closed); forcing end = begin"
            );
        }
    }

    pub fn end_update(&mut self) {
        if let Some(d) = self.header().end_update() {
            tracing::warn!(
                channel = %self.name,
                begin = d.begin,
                end = d.end,
                "version desync at end_update (update closed without opening); forcing begin = end"
            );
        }
    }

    /// Copy `bytes` into the payload at `offset`. Call between
    /// `begin_update` and `end_update`.
    ///
    /// # Panics
    /// Panics if the write would run past the payload.
    #[inline]
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.payload_len,
            "write past end of region '{}'",
            self.name
        );
        // SAFETY: bounds checked above; single writer per region
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(PAYLOAD_OFFSET + offset),
                bytes.len(),
            )
        };
    }

    /// Copy a `T` out of the payload at `offset`.
    #[inline]
    pub fn read_at<T: Pod>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.payload_len);
        // SAFETY: bounds checked above; T is Pod so any bytes are a valid value
        unsafe { copy_out(self.base.add(PAYLOAD_OFFSET + offset)) }
    }

    /// Zero the whole payload. Call between `begin_update` and `end_update`.
    pub fn zero_payload(&mut self) {
        // SAFETY: the payload spans exactly payload_len bytes after the header
        unsafe { ptr::write_bytes(self.base.add(PAYLOAD_OFFSET), 0, self.payload_len) };
    }
}

/// Read-only mapping of a versioned region.
pub struct SnapshotView {
    _mm: MmapRegion,
    base: *const u8,
    payload_len: usize,
}

impl SnapshotView {
    pub fn open(dir: &Path, name: &str, payload_len: usize) -> Result<Self, MappingError> {
        let mm = MmapRegion::open_ro(region_path(dir, name), PAYLOAD_OFFSET + payload_len)?;
        let base = mm.as_ptr();
        Ok(Self {
            _mm: mm,
            base,
            payload_len,
        })
    }

    #[inline(always)]
    pub fn header(&self) -> &VersionHeader {
        // SAFETY: see SnapshotRegion::header; atomics only ever loaded here
        unsafe { &*(self.base as *const VersionHeader) }
    }

    #[inline]
    pub fn read_at<T: Pod>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.payload_len);
        // SAFETY: bounds checked above
        unsafe { copy_out(self.base.add(PAYLOAD_OFFSET + offset)) }
    }

    /// Copy `out.len()` values of `T` starting at payload `offset`.
    #[inline]
    pub fn read_slice_at<T: Pod>(&self, offset: usize, out: &mut [T]) {
        let bytes = bytemuck::cast_slice_mut::<T, u8>(out);
        assert!(offset + bytes.len() <= self.payload_len);
        // SAFETY: bounds checked above; destination is a distinct local buffer
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.add(PAYLOAD_OFFSET + offset),
                bytes.as_mut_ptr(),
                bytes.len(),
            )
        };
    }
}

/// Byte-wise copy out of shared memory; the source may be unaligned.
///
/// # Safety
/// `src` must be valid for `size_of::<T>()` bytes.
#[inline(always)]
unsafe fn copy_out<T: Pod>(src: *const u8) -> T {
    let mut out = T::zeroed();
    unsafe {
        ptr::copy_nonoverlapping(
            src,
            bytemuck::bytes_of_mut(&mut out).as_mut_ptr(),
            size_of::<T>(),
        )
    };
    out
}

/// The producer side of a versioned snapshot of `T`.
pub struct VersionedSnapshot<T: Pod> {
    region: SnapshotRegion,
    _pd: PhantomData<T>,
}

impl<T: Pod> VersionedSnapshot<T> {
    /// Creates the named region sized `header + size_of::<T>()`, zero-filled.
    ///
    /// # Errors
    /// A channel that fails here stays unavailable for the session; callers
    /// do not retry.
    pub fn create(dir: &Path, name: &str) -> Result<Self, MappingError> {
        Ok(Self {
            region: SnapshotRegion::create(dir, name, size_of::<T>())?,
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

    /// Overwrite the payload without touching the version header.
    #[inline]
    pub fn write(&mut self, value: &T) {
        self.region.write_at(0, bytemuck::bytes_of(value));
    }

    /// Write `value` inside its own begin/end bracket.
    #[inline]
    pub fn publish(&mut self, value: &T) {
        self.begin_update();
        self.write(value);
        self.end_update();
    }

    /// Reset to `initial`, or to all zeroes.
    pub fn clear(&mut self, initial: Option<&T>) {
        self.begin_update();
        match initial {
            Some(value) => self.write(value),
            None => self.region.zero_payload(),
        }
        self.end_update();
    }

    pub fn version(&self) -> (u32, u32) {
        self.region.version()
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    #[cfg(test)]
    pub(crate) fn header(&self) -> &VersionHeader {
        self.region.header()
    }
}

impl<T: Pod> ManagedChannel for VersionedSnapshot<T> {
    fn name(&self) -> &str {
        self.region.name()
    }

    fn reset(&mut self) {
        self.clear(None);
    }
}

impl<T: Pod> Publish<T> for VersionedSnapshot<T> {
    fn publish(&mut self, value: &T) {
        VersionedSnapshot::publish(self, value);
    }
}

/// The reader side of a versioned snapshot.
pub struct SnapshotReader<T: Pod> {
    view: SnapshotView,
    _pd: PhantomData<T>,
}

impl<T: Pod> SnapshotReader<T> {
    /// Opens a region created by [`VersionedSnapshot::create`].
    ///
    /// # Errors
    /// Fails if the region does not exist or is smaller than `T`.
    pub fn open(dir: &Path, name: &str) -> Result<Self, MappingError> {
        Ok(Self {
            view: SnapshotView::open(dir, name, bytes_for_snapshot::<T>() - PAYLOAD_OFFSET)?,
            _pd: PhantomData,
        })
    }

    /// Copy the payload and report whether the copy may be torn.
    ///
    /// The copy is never retried; callers decide whether to discard it.
    #[inline]
    pub fn read_snapshot(&self) -> (T, bool) {
        let start: SampleStart = self.view.header().read_begin();
        let value = self.view.read_at::<T>(0);
        (value, self.view.header().is_torn(start))
    }

    pub fn version(&self) -> (u32, u32) {
        self.view.header().load()
    }
}
