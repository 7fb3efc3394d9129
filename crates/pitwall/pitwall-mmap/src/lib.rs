mod lock;

pub use lock::{AdvisoryLock, LockGuard};

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("failed to create region '{path}'")]
    CreateFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to map region '{path}'")]
    MapFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("region '{path}' is {actual} bytes, expected at least {expected}")]
    TooSmall {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to create lock '{path}'")]
    LockFailed {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Region names may carry a namespace marker with a backslash (`Global\...`);
/// neither separator is allowed inside a single file name.
pub fn region_path<P: AsRef<Path>>(dir: P, name: &str) -> PathBuf {
    let file_name: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    dir.as_ref().join(file_name)
}

pub struct MmapRegionMut {
    _file: File,
    mmap: MmapMut,
    path: PathBuf,
    /// Set for the side that created the region.
    unlink_on_drop: bool,
}

pub struct MmapRegion {
    _file: File,
    mmap: Mmap,
}

impl MmapRegionMut {
    /// Create (or truncate) the region file to `size_bytes` zeroed bytes and map it read-write.
    ///
    /// The file is removed again when the returned value is dropped.
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: usize) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let create_failed = |source| MappingError::CreateFailed {
            path: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(create_failed)?;

        if let Err(source) = file.set_len(size_bytes as u64) {
            let _ = fs::remove_file(path);
            return Err(create_failed(source));
        }

        let mmap = match unsafe { MmapMut::map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(source) => {
                let _ = fs::remove_file(path);
                return Err(MappingError::MapFailed {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        Ok(Self {
            _file: file,
            mmap,
            path: path.to_path_buf(),
            unlink_on_drop: true,
        })
    }

    /// Open an existing region read-write. The file is left in place on drop.
    pub fn open_rw<P: AsRef<Path>>(path: P, min_size: usize) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MappingError::CreateFailed {
                path: path.display().to_string(),
                source,
            })?;

        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| MappingError::MapFailed {
            path: path.display().to_string(),
            source,
        })?;
        check_len(path, mmap.len(), min_size)?;

        Ok(Self {
            _file: file,
            mmap,
            path: path.to_path_buf(),
            unlink_on_drop: false,
        })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl Drop for MmapRegionMut {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl MmapRegion {
    /// Open an existing region and map it read-only
    pub fn open_ro<P: AsRef<Path>>(path: P, min_size: usize) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| MappingError::CreateFailed {
            path: path.display().to_string(),
            source,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| MappingError::MapFailed {
            path: path.display().to_string(),
            source,
        })?;
        check_len(path, mmap.len(), min_size)?;

        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

fn check_len(path: &Path, actual: usize, expected: usize) -> Result<(), MappingError> {
    if actual < expected {
        return Err(MappingError::TooSmall {
            path: path.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_path_flattens_namespace_marker() {
        let path = region_path("/dev/shm", "Global\\$Pitwall_Telemetry$");
        assert_eq!(path, Path::new("/dev/shm/Global_$Pitwall_Telemetry$"));
    }

    #[test]
    fn created_region_is_zeroed_and_shared_with_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let mut rw = MmapRegionMut::create_rw(&path, 64).unwrap();
        assert_eq!(rw.len(), 64);

        let ro = MmapRegion::open_ro(&path, 64).unwrap();
        assert_eq!(unsafe { *ro.as_ptr().add(10) }, 0);

        unsafe { *rw.as_mut_ptr().add(10) = 0x5A };
        assert_eq!(unsafe { *ro.as_ptr().add(10) }, 0x5A);
    }

    #[test]
    fn creator_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let rw = MmapRegionMut::create_rw(&path, 16).unwrap();
        let client = MmapRegionMut::open_rw(&path, 16).unwrap();
        drop(client);
        assert!(path.exists());

        drop(rw);
        assert!(!path.exists());
    }

    #[test]
    fn open_rejects_short_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let _rw = MmapRegionMut::create_rw(&path, 16).unwrap();

        match MmapRegion::open_ro(&path, 32) {
            Err(MappingError::TooSmall { expected, actual, .. }) => {
                assert_eq!((expected, actual), (32, 16));
            }
            other => panic!("expected TooSmall, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_region_is_create_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = MmapRegion::open_ro(dir.path().join("absent"), 8).err().unwrap();
        assert!(matches!(err, MappingError::CreateFailed { .. }));
    }
}
