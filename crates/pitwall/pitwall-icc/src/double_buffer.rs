//! Two-buffer "flip" channel guarded by a named advisory mutex.
//!
//! Kept for readers that want a whole buffer that is guaranteed consistent
//! rather than a tear-detectable one. The producer writes the buffer that is
//! not currently published, then flips the roles under the mutex. Readers
//! take the same mutex and copy whichever buffer is flagged as current.
//!
//! # Flip modes
//! - **Blocking**: wait up to `lock_timeout`; on expiry the flip proceeds
//!   without the lock.
//! - **Non-blocking**: zero-wait attempt. A busy mutex defers the flip; after
//!   `max_retries` consecutive deferrals the pending flip is abandoned and
//!   that data is never published.

use crate::channel::{ManagedChannel, Publish};
use crate::shm_layout::{FLIP_PAYLOAD_OFFSET, bytes_for_flip_buffer};
use bytemuck::Pod;
use pitwall_mmap::{AdvisoryLock, MappingError, MmapRegion, MmapRegionMut, region_path};
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlipConfig {
    /// Mode used by [`Publish::publish`].
    pub blocking: bool,
    pub lock_timeout: Duration,
    pub max_retries: u32,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            blocking: false,
            lock_timeout: Duration::from_millis(20),
            max_retries: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipOutcome {
    /// Roles swapped while holding the mutex.
    Flipped,
    /// Blocking wait expired; roles swapped without the mutex.
    FlippedUnlocked,
    /// Mutex busy; the flip is pending and may be retried.
    Deferred,
    /// Retry budget exhausted; the pending flip was dropped.
    Abandoned,
}

pub fn buffer_names(name: &str) -> [String; 2] {
    [format!("{name}Buffer1"), format!("{name}Buffer2")]
}

pub fn mutex_name(name: &str) -> String {
    format!("{name}Mutex")
}

/// One mapped buffer: `is_current_read` flag followed by the payload.
struct FlipBuffer {
    _mm: MmapRegionMut,
    base: *mut u8,
}

impl FlipBuffer {
    fn create<T: Pod>(dir: &Path, name: &str) -> Result<Self, MappingError> {
        let mut mm = MmapRegionMut::create_rw(region_path(dir, name), bytes_for_flip_buffer::<T>())?;
        let base = mm.as_mut_ptr();
        Ok(Self { _mm: mm, base })
    }

    #[inline(always)]
    fn flag(&self) -> &AtomicU32 {
        // SAFETY: page-aligned mapping at least 4 bytes long
        unsafe { &*(self.base as *const AtomicU32) }
    }

    fn is_current_read(&self) -> bool {
        self.flag().load(Ordering::Acquire) != 0
    }

    fn set_current_read(&self, current: bool) {
        self.flag().store(current as u32, Ordering::Release);
    }

    fn write<T: Pod>(&mut self, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        // SAFETY: the region is sized FLIP_PAYLOAD_OFFSET + size_of::<T>()
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(FLIP_PAYLOAD_OFFSET), bytes.len())
        };
    }

    fn zero<T: Pod>(&mut self) {
        // SAFETY: as in `write`
        unsafe { ptr::write_bytes(self.base.add(FLIP_PAYLOAD_OFFSET), 0, size_of::<T>()) };
    }
}

/// Buffer A and B plus which of them readers currently see.
struct Roles {
    bufs: [FlipBuffer; 2],
    read: usize,
}

impl Roles {
    /// Both buffers claiming the same role is corruption: reset to A = read.
    fn heal(&mut self, name: &str) {
        let a = self.bufs[0].is_current_read();
        let b = self.bufs[1].is_current_read();
        if a == b {
            tracing::error!(
                channel = %name,
                current_read = a,
                "both buffers report the same role; forcing buffer 1 = read, buffer 2 = write"
            );
            self.bufs[0].set_current_read(true);
            self.bufs[1].set_current_read(false);
            self.read = 0;
        }
    }

    fn swap(&mut self) {
        let write = 1 - self.read;
        self.bufs[self.read].set_current_read(false);
        self.bufs[write].set_current_read(true);
        self.read = write;
    }

    #[inline]
    fn write_buffer(&mut self) -> &mut FlipBuffer {
        &mut self.bufs[1 - self.read]
    }
}

#[derive(Debug, Default)]
struct RetryState {
    pending: bool,
    retries: u32,
}

impl RetryState {
    fn defer(&mut self, max_retries: u32, name: &str) -> FlipOutcome {
        self.retries += 1;
        if self.retries >= max_retries {
            tracing::debug!(channel = %name, retries = self.retries, "flip abandoned");
            *self = Self::default();
            return FlipOutcome::Abandoned;
        }
        self.pending = true;
        FlipOutcome::Deferred
    }
}

/// The producer side of a double-buffered channel.
pub struct DoubleBufferChannel<T: Pod> {
    name: String,
    lock: AdvisoryLock,
    roles: Roles,
    retry: RetryState,
    config: FlipConfig,
    _pd: PhantomData<T>,
}

impl<T: Pod> DoubleBufferChannel<T> {
    /// Maps both buffers and creates the mutex. Any failure fails the whole
    /// channel; whatever was already created is released on return.
    pub fn create(dir: &Path, name: &str, config: FlipConfig) -> Result<Self, MappingError> {
        let [a_name, b_name] = buffer_names(name);
        let a = FlipBuffer::create::<T>(dir, &a_name)?;
        let b = FlipBuffer::create::<T>(dir, &b_name)?;
        let lock = AdvisoryLock::create(region_path(dir, &mutex_name(name)))?;

        a.set_current_read(true);
        b.set_current_read(false);

        Ok(Self {
            name: name.to_string(),
            lock,
            roles: Roles {
                bufs: [a, b],
                read: 0,
            },
            retry: RetryState::default(),
            config,
            _pd: PhantomData,
        })
    }

    /// Overwrite the buffer readers are not looking at.
    #[inline]
    pub fn write(&mut self, value: &T) {
        self.roles.write_buffer().write(value);
    }

    /// Publish the write buffer by swapping roles.
    pub fn flip(&mut self, blocking: bool) -> FlipOutcome {
        let guard = if blocking {
            match self.lock.lock_timeout(self.config.lock_timeout) {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    tracing::warn!(
                        channel = %self.name,
                        timeout_ms = self.config.lock_timeout.as_millis() as u64,
                        "flip mutex wait timed out; flipping without it"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(channel = %self.name, error = %e, "flip mutex failed; flipping without it");
                    None
                }
            }
        } else {
            match self.lock.try_lock() {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => return self.retry.defer(self.config.max_retries, &self.name),
                Err(e) => {
                    tracing::warn!(channel = %self.name, error = %e, "flip mutex failed");
                    return self.retry.defer(self.config.max_retries, &self.name);
                }
            }
        };

        self.roles.heal(&self.name);
        self.roles.swap();
        self.retry = RetryState::default();

        match guard {
            Some(_) => FlipOutcome::Flipped,
            None => FlipOutcome::FlippedUnlocked,
        }
    }

    pub fn has_pending_flip(&self) -> bool {
        self.retry.pending
    }

    /// Retry a deferred flip without new data.
    pub fn retry_pending_flip(&mut self) -> Option<FlipOutcome> {
        self.retry.pending.then(|| self.flip(false))
    }

    pub fn retries(&self) -> u32 {
        self.retry.retries
    }

    /// Index (0 = buffer 1) of the buffer readers currently see.
    pub fn read_index(&self) -> usize {
        self.roles.read
    }

    pub fn config(&self) -> &FlipConfig {
        &self.config
    }

    #[cfg(test)]
    fn corrupt_flags(&self, a: bool, b: bool) {
        self.roles.bufs[0].set_current_read(a);
        self.roles.bufs[1].set_current_read(b);
    }
}

impl<T: Pod> ManagedChannel for DoubleBufferChannel<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        let _guard = self.lock.lock_timeout(self.config.lock_timeout).ok().flatten();
        for buf in self.roles.bufs.iter_mut() {
            buf.zero::<T>();
        }
        self.retry = RetryState::default();
    }
}

impl<T: Pod> Publish<T> for DoubleBufferChannel<T> {
    fn publish(&mut self, value: &T) {
        self.write(value);
        match self.flip(self.config.blocking) {
            FlipOutcome::Abandoned => {
                tracing::debug!(channel = %self.name, "update not published; readers held the mutex")
            }
            outcome => tracing::trace!(channel = %self.name, ?outcome, "flip"),
        }
    }

    fn retry_pending(&mut self) {
        match self.retry_pending_flip() {
            None => {}
            Some(FlipOutcome::Abandoned) => {
                tracing::debug!(channel = %self.name, "deferred flip abandoned; readers held the mutex")
            }
            Some(outcome) => tracing::trace!(channel = %self.name, ?outcome, "deferred flip retried"),
        }
    }
}

/// The reader side of a double-buffered channel.
pub struct FlipReader<T: Pod> {
    bufs: [MmapRegion; 2],
    lock: AdvisoryLock,
    _pd: PhantomData<T>,
}

impl<T: Pod> FlipReader<T> {
    pub fn open(dir: &Path, name: &str) -> Result<Self, MappingError> {
        let [a_name, b_name] = buffer_names(name);
        let size = bytes_for_flip_buffer::<T>();
        Ok(Self {
            bufs: [
                MmapRegion::open_ro(region_path(dir, &a_name), size)?,
                MmapRegion::open_ro(region_path(dir, &b_name), size)?,
            ],
            lock: AdvisoryLock::open(region_path(dir, &mutex_name(name)))?,
            _pd: PhantomData,
        })
    }

    /// Copy the current read buffer while holding the mutex. `None` if the
    /// mutex could not be taken within `timeout`.
    pub fn read(&self, timeout: Duration) -> Option<T> {
        let _guard = self.lock.lock_timeout(timeout).ok().flatten()?;

        let current = |mm: &MmapRegion| {
            // SAFETY: page-aligned mapping validated to be large enough in `open`
            unsafe { &*(mm.as_ptr() as *const AtomicU32) }.load(Ordering::Acquire) != 0
        };
        let src = if current(&self.bufs[1]) && !current(&self.bufs[0]) {
            &self.bufs[1]
        } else {
            &self.bufs[0]
        };

        let mut out = T::zeroed();
        // SAFETY: see above; destination is a local value
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr().add(FLIP_PAYLOAD_OFFSET),
                bytemuck::bytes_of_mut(&mut out).as_mut_ptr(),
                size_of::<T>(),
            )
        };
        Some(out)
    }

    /// Hold the mutex, as a reader does while copying.
    pub fn hold(&self) -> Option<pitwall_mmap::LockGuard<'_>> {
        self.lock.try_lock().ok().flatten()
    }
}
