//! NVDIMM segment ring slots and sealed disk segments.
//!
//! A slot is state-exclusive at every instant: writable by the flusher
//! until `fsync_requested`, then owned by the fsyncer until
//! `fsync_completed`, then recyclable by the flusher once it wins the
//! `nv_reader_pins` CAS against cursors.

use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::layout;
use crate::mmap::{MmapFile, MmapRo};
use crate::{Error, Result};

/// `nv_reader_pins` value the flusher holds while recycling a slot.
pub(crate) const PIN_EXCLUSIVE: i32 = -1;

pub(crate) struct NvSegment {
    map: MmapFile,
    pub(crate) dsid: AtomicU64,
    pub(crate) written_bytes: AtomicU64,
    pub(crate) fsync_requested: AtomicU32,
    pub(crate) fsync_completed: AtomicU32,
    pub(crate) fsync_error: AtomicI32,
    pub(crate) nv_reader_pins: AtomicI32,
}

impl NvSegment {
    pub(crate) fn create(nv_root: &Path, slot: u32, segment_size: u64) -> Result<Self> {
        let path = layout::nv_segment_path(nv_root, slot);
        let map = MmapFile::create(&path, segment_size as usize)?;
        Ok(Self::around(map))
    }

    pub(crate) fn open(nv_root: &Path, slot: u32, segment_size: u64) -> Result<Self> {
        let path = layout::nv_segment_path(nv_root, slot);
        let map = MmapFile::open(&path)?;
        if map.len() != segment_size as usize {
            return Err(Error::Corrupt("nv segment size mismatch"));
        }
        Ok(Self::around(map))
    }

    fn around(map: MmapFile) -> Self {
        map.advise_hugepage();
        let _ = map.lock(); // best-effort; plain pages work too
        Self {
            map,
            dsid: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            fsync_requested: AtomicU32::new(0),
            fsync_completed: AtomicU32::new(0),
            fsync_error: AtomicI32::new(0),
            nv_reader_pins: AtomicI32::new(0),
        }
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Cursor-side pin. Spins past the flusher's exclusive sentinel, then
    /// re-checks the dsid: recycling may have won the race, in which case
    /// the pin is dropped and the caller falls back to the disk copy.
    pub(crate) fn try_pin(&self, dsid: u64) -> bool {
        loop {
            let pins = self.nv_reader_pins.load(Ordering::Acquire);
            if pins < 0 {
                std::thread::yield_now();
                continue;
            }
            if self
                .nv_reader_pins
                .compare_exchange_weak(pins, pins + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.dsid.load(Ordering::Acquire) == dsid {
                    return true;
                }
                self.unpin();
                return false;
            }
        }
    }

    pub(crate) fn unpin(&self) {
        let prev = self.nv_reader_pins.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0);
    }
}

pub(crate) fn slot_for_dsid(dsid: u64, segment_count: u32) -> usize {
    debug_assert!(dsid >= 1);
    ((dsid - 1) % segment_count as u64) as usize
}

/// Lists the dsids of sealed segments present under `disk_root`, sorted.
pub(crate) fn discover_disk_segments(disk_root: &Path) -> Result<Vec<u64>> {
    let mut dsids = Vec::new();
    for entry in std::fs::read_dir(disk_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(dsid) = layout::parse_disk_segment_filename(name) {
            dsids.push(dsid);
        }
    }
    dsids.sort_unstable();
    Ok(dsids)
}

/// Maps a sealed on-disk segment read-only for a cursor.
pub(crate) fn map_disk_segment(disk_root: &Path, dsid: u64, segment_size: u64) -> Result<MmapRo> {
    let map = MmapRo::open(&layout::disk_segment_path(disk_root, dsid))?;
    if map.len() != segment_size as usize {
        return Err(Error::Corrupt("disk segment size mismatch"));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pin_follows_dsid() {
        let dir = tempdir().expect("tempdir");
        let segment = NvSegment::create(dir.path(), 0, 4096).expect("create");
        segment.dsid.store(3, Ordering::Release);

        assert!(segment.try_pin(3));
        assert_eq!(segment.nv_reader_pins.load(Ordering::Relaxed), 1);
        segment.unpin();

        // A recycled slot no longer carries the wanted dsid.
        assert!(!segment.try_pin(2));
        assert_eq!(segment.nv_reader_pins.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn discovery_ignores_foreign_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(crate::layout::disk_segment_path(dir.path(), 2), b"x").expect("seg 2");
        std::fs::write(crate::layout::disk_segment_path(dir.path(), 1), b"x").expect("seg 1");
        std::fs::write(dir.path().join("mds-pagefile-0"), b"x").expect("pagefile");
        std::fs::write(dir.path().join("nvwal_ds_junk"), b"x").expect("junk");
        let dsids = discover_disk_segments(dir.path()).expect("discover");
        assert_eq!(dsids, vec![1, 2]);
    }

    #[test]
    fn slot_mapping_is_dense() {
        assert_eq!(slot_for_dsid(1, 2), 0);
        assert_eq!(slot_for_dsid(2, 2), 1);
        assert_eq!(slot_for_dsid(3, 2), 0);
        assert_eq!(slot_for_dsid(7, 4), 2);
    }
}
