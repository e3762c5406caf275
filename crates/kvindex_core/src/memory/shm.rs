//! # Shared Memory Segments
//!
//! Key-addressed memory that outlives the process.
//!
//! A segment is a file named after its key inside a shared memory
//! directory (normally `/dev/shm`, which is RAM backed). Opening an
//! existing key yields the bytes a previous process left behind; a
//! missing key is created zero-filled and reported as such.
//!
//! This module requires unsafe code to map segments.
//! The single unsafe block is documented at its call site.

#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

/// Directory in which shared memory segments live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShmDir {
    /// Root directory.
    root: PathBuf,
}

impl ShmDir {
    /// Creates a handle on a shared memory directory.
    ///
    /// The directory is created lazily, when the first segment is.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file backing the segment with `key`.
    #[must_use]
    pub fn segment_path(&self, key: u32) -> PathBuf {
        self.root.join(format!("kvindex-{key:08x}"))
    }

    /// Whether a segment with `key` exists.
    #[must_use]
    pub fn exists(&self, key: u32) -> bool {
        self.segment_path(key).exists()
    }

    /// Opens the segment with `key`, creating it when it does not exist.
    ///
    /// Returns the segment and whether this call created it. An existing
    /// segment must have exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be opened or created, or if an existing
    /// segment has a different size.
    pub fn open_or_create(&self, key: u32, size: u64) -> io::Result<(ShmSegment, bool)> {
        let path = self.segment_path(key);

        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => {
                let actual = file.metadata()?.len();
                if actual != size {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        format!("segment {key:#x} is {actual} bytes, expected {size}"),
                    ));
                }
                Ok((ShmSegment { key, file, size }, false))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.root)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                file.set_len(size)?;
                Ok((ShmSegment { key, file, size }, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Creates the segment with `key` zero-filled, replacing whatever a
    /// previous process left under that key, whatever its size.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be created or sized.
    pub fn create_fresh(&self, key: u32, size: u64) -> io::Result<ShmSegment> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.segment_path(key))?;
        file.set_len(size)?;
        Ok(ShmSegment { key, file, size })
    }

    /// Removes the segment with `key`. Missing segments are not an error.
    ///
    /// # Errors
    ///
    /// Fails if the segment exists but cannot be removed.
    pub fn remove(&self, key: u32) -> io::Result<()> {
        match fs::remove_file(self.segment_path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// An opened, not yet attached, shared memory segment.
#[derive(Debug)]
pub struct ShmSegment {
    key: u32,
    file: File,
    size: u64,
}

impl ShmSegment {
    /// Returns the persistence key.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> u32 {
        self.key
    }

    /// Returns the segment size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Maps the segment into the process address space.
    ///
    /// # Errors
    ///
    /// Fails if the segment cannot be mapped.
    pub fn attach(&self) -> io::Result<MmapMut> {
        let len = usize::try_from(self.size)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "segment too large to map"))?;

        // SAFETY: the file was sized to `len` when it was opened or created
        // and segment files are only ever written through mappings. Another
        // process truncating the file would be a violation of the same
        // contract System V shared memory relies on.
        unsafe { MmapOptions::new().len(len).map_mut(&self.file) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::temp_shm_dir;

    #[test]
    fn test_create_then_open() {
        let dir = temp_shm_dir("open");

        let (segment, created) = dir.open_or_create(0x42, 4096).unwrap();
        assert!(created);
        {
            let mut map = segment.attach().unwrap();
            assert!(map.iter().all(|b| *b == 0));
            map[100] = 7;
            map.flush().unwrap();
        }
        drop(segment);

        let (segment, created) = dir.open_or_create(0x42, 4096).unwrap();
        assert!(!created);
        assert_eq!(segment.attach().unwrap()[100], 7);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let dir = temp_shm_dir("size");

        dir.open_or_create(1, 4096).unwrap();
        let err = dir.open_or_create(1, 8192).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[test]
    fn test_create_fresh_replaces_any_size() {
        let dir = temp_shm_dir("fresh");

        let (segment, _) = dir.open_or_create(3, 8192).unwrap();
        segment.attach().unwrap()[10] = 9;
        drop(segment);

        let segment = dir.create_fresh(3, 4096).unwrap();
        assert_eq!(segment.size(), 4096);
        assert!(segment.attach().unwrap().iter().all(|b| *b == 0));
        drop(segment);

        let (segment, created) = dir.open_or_create(3, 4096).unwrap();
        assert!(!created);
        assert_eq!(segment.size(), 4096);

        std::fs::remove_dir_all(dir.root()).ok();
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = temp_shm_dir("remove");
        assert!(dir.remove(9).is_ok());

        dir.open_or_create(9, 64).unwrap();
        assert!(dir.exists(9));
        dir.remove(9).unwrap();
        assert!(!dir.exists(9));

        std::fs::remove_dir_all(dir.root()).ok();
    }
}
