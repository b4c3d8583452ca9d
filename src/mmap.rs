//! Memory-mapped file wrappers.
//!
//! `MmapFile` is a shared read-write mapping used for the control block,
//! the NV segment ring, and the MDS write buffers. Those regions are
//! mutated through raw pointers under the engine's ownership protocol
//! (one exclusive mutator per region at a time), so the wrapper exposes
//! pointer access from `&self` and checked copy helpers rather than
//! slices. `MmapRo` is the read-only mapping the cursor uses for sealed
//! disk segments.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapRaw};

use crate::{Error, Result};

pub struct MmapFile {
    raw: MmapRaw,
    len: usize,
}

// SAFETY: the mapping is shared memory; concurrent access is governed by
// the callers' ownership protocol, exactly as it would be for any other
// aliased region behind raw pointers.
unsafe impl Send for MmapFile {}
unsafe impl Sync for MmapFile {}

impl MmapFile {
    /// Creates (or truncates) a file of `len` bytes and maps it read-write.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::map_sized(file, len)
    }

    /// Creates a new file, failing if it already exists.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::map_sized(file, len)
    }

    fn map_sized(file: File, len: usize) -> Result<Self> {
        file.set_len(len as u64)?;
        let raw = MmapRaw::map_raw(&file)?;
        file.sync_all()?;
        Ok(Self { raw, len })
    }

    /// Maps an existing file read-write at its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let raw = MmapRaw::map_raw(&file)?;
        Ok(Self { raw, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.raw.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    /// Bounds-checked pointer into the mapping.
    pub fn range(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("mmap range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("mmap range out of bounds"));
        }
        // SAFETY: offset is within the mapping per the check above.
        Ok(unsafe { self.raw.as_mut_ptr().add(offset) })
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.range(offset, buf.len())?;
        // SAFETY: `src` is valid for `buf.len()` bytes per `range`.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.range(offset, data.len())?;
        // SAFETY: `dst` is valid for `data.len()` bytes per `range`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.raw.flush()?;
        Ok(())
    }

    /// Best-effort page pinning; failure is ignored by callers.
    pub fn lock(&self) -> Result<()> {
        let ret = unsafe { libc::mlock(self.raw.as_ptr() as *const libc::c_void, self.len) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Best-effort transparent huge page advice for large segment maps.
    #[cfg(target_os = "linux")]
    pub fn advise_hugepage(&self) {
        unsafe {
            libc::madvise(
                self.raw.as_mut_ptr() as *mut libc::c_void,
                self.len,
                libc::MADV_HUGEPAGE,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn advise_hugepage(&self) {}
}

/// Read-only mapping of a sealed disk segment.
pub struct MmapRo {
    map: Mmap,
}

impl MmapRo {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: sealed segments are immutable once synced; the mapping
        // never observes concurrent mutation.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::MmapFile;
    use tempfile::tempdir;

    #[test]
    fn create_write_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("map.bin");

        let map = MmapFile::create(&path, 4096).expect("create");
        map.write_at(100, b"hello").expect("write");
        map.sync().expect("sync");
        drop(map);

        let map = MmapFile::open(&path).expect("open");
        assert_eq!(map.len(), 4096);
        let mut buf = [0u8; 5];
        map.read_into(100, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
        assert!(map.range(4093, 4).is_err());
    }
}
