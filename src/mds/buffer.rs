//! MDS NVDIMM write buffers.
//!
//! One durable page-sized buffer per page file. The flusher is the sole
//! mutator. A buffered page is evicted (appended to its page file) only
//! when the next page is needed, and the buffer's `page_no` is bumped
//! only after the eviction synced; that ordering is the linearization
//! point both for crashes and for optimistic readers, who re-read
//! `page_no` after copying a record to detect recycling.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::InitMode;
use crate::layout;
use crate::mmap::MmapFile;
use crate::pmem;
use crate::{Error, Result};

use super::io::{MdsIo, PageFile};
use super::{PageGeometry, EPOCH_RECORD_SIZE, PAGEFILE_COUNT};

pub(crate) struct NvBuffer {
    map: MmapFile,
    /// Global page number held; 0 = empty. Monotonic while the engine
    /// runs, which is what optimistic readers rely on.
    pub(crate) page_no: AtomicU64,
    dirty: AtomicBool,
}

impl NvBuffer {
    pub(crate) fn write_record(&self, offset: usize, record: &[u8; EPOCH_RECORD_SIZE]) -> Result<()> {
        let dst = self.map.range(offset * EPOCH_RECORD_SIZE, EPOCH_RECORD_SIZE)?;
        // SAFETY: dst is a bounds-checked region of the live mapping.
        unsafe { pmem::persist_copy(dst, record.as_ptr(), EPOCH_RECORD_SIZE) };
        Ok(())
    }

    pub(crate) fn read_record(&self, offset: usize) -> Result<[u8; EPOCH_RECORD_SIZE]> {
        let mut out = [0u8; EPOCH_RECORD_SIZE];
        self.map.read_into(offset * EPOCH_RECORD_SIZE, &mut out)?;
        Ok(out)
    }

    fn copy_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; self.map.len()];
        self.map
            .read_into(0, &mut page)
            .expect("buffer-sized read cannot be out of bounds");
        page
    }
}

pub(crate) struct BufferManager {
    buffers: Vec<NvBuffer>,
    page_size: u64,
}

impl BufferManager {
    pub(crate) fn init(mode: InitMode, nv_root: &Path, page_size: u64) -> Result<(Self, bool)> {
        let existing = (0..PAGEFILE_COUNT)
            .filter(|i| layout::mds_buffer_path(nv_root, *i).exists())
            .count() as u32;

        if mode != InitMode::CreateTruncate && existing == PAGEFILE_COUNT {
            let buffers = (0..PAGEFILE_COUNT)
                .map(|i| Self::open_buffer(nv_root, i, page_size))
                .collect::<Result<Vec<_>>>()?;
            return Ok((Self { buffers, page_size }, true));
        }
        if mode != InitMode::Restart && (mode == InitMode::CreateTruncate || existing == 0) {
            let buffers = (0..PAGEFILE_COUNT)
                .map(|i| Self::create_buffer(nv_root, i, page_size))
                .collect::<Result<Vec<_>>>()?;
            layout::fsync_dir(nv_root)?;
            return Ok((Self { buffers, page_size }, false));
        }
        Err(Error::CorruptMetadata("metadata nvram buffers are incomplete"))
    }

    fn create_buffer(nv_root: &Path, slot: u32, page_size: u64) -> Result<NvBuffer> {
        let map = MmapFile::create(&layout::mds_buffer_path(nv_root, slot), page_size as usize)?;
        // SAFETY: zeroing the whole freshly created mapping.
        unsafe { pmem::persist_zero(map.as_mut_ptr(), page_size as usize) };
        map.sync()?;
        Ok(NvBuffer {
            map,
            page_no: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    fn open_buffer(nv_root: &Path, slot: u32, page_size: u64) -> Result<NvBuffer> {
        let map = MmapFile::open(&layout::mds_buffer_path(nv_root, slot))?;
        if map.len() != page_size as usize {
            return Err(Error::CorruptMetadata("nvram buffer size mismatch"));
        }
        Ok(NvBuffer {
            map,
            page_no: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    pub(crate) fn buffer(&self, file_no: u32) -> &NvBuffer {
        &self.buffers[file_no as usize]
    }

    /// Claims the buffer for `page_no`. An empty buffer adopts the page,
    /// the held page is reused, and the next page recycles the buffer
    /// only once it is clean. Anything else is out-of-sequence use by
    /// the single writer and fails hard.
    pub(crate) fn alloc_page(&self, file_no: u32, page_no: u64) -> Result<&NvBuffer> {
        debug_assert!(page_no >= 1);
        let buffer = self.buffer(file_no);
        let held = buffer.page_no.load(Ordering::Acquire);
        if held == 0 {
            buffer.page_no.store(page_no, Ordering::Release);
            buffer.dirty.store(true, Ordering::Relaxed);
            return Ok(buffer);
        }
        if page_no == held {
            buffer.dirty.store(true, Ordering::Relaxed);
            Ok(buffer)
        } else if page_no == held + 1 {
            if buffer.dirty.load(Ordering::Relaxed) {
                return Err(Error::NoBuffers);
            }
            buffer.page_no.store(page_no, Ordering::Release);
            buffer.dirty.store(true, Ordering::Relaxed);
            Ok(buffer)
        } else {
            panic!("metadata page {page_no} requested while buffering {held}");
        }
    }

    /// Restart path: claim the page whose records are still sitting in
    /// the (durable) buffer content.
    pub(crate) fn adopt(&self, file_no: u32, page_no: u64) {
        let buffer = self.buffer(file_no);
        debug_assert_eq!(buffer.page_no.load(Ordering::Acquire), 0);
        buffer.page_no.store(page_no, Ordering::Release);
        buffer.dirty.store(true, Ordering::Relaxed);
    }

    /// Writes every dirty buffer to its page slot on disk and marks it
    /// clean. Always invoked before `paged_mds_epoch` advances.
    pub(crate) fn writeback(&self, io: &MdsIo, geo: &PageGeometry) -> Result<()> {
        for (file_no, buffer) in self.buffers.iter().enumerate() {
            if !buffer.dirty.load(Ordering::Relaxed) {
                continue;
            }
            let page_no = buffer.page_no.load(Ordering::Acquire);
            debug_assert!(page_no >= 1);
            let page = buffer.copy_page();
            io.file(file_no as u32)
                .write_page_at(geo.file_page_index(page_no), &page)?;
            buffer.dirty.store(false, Ordering::Relaxed);
            log::debug!("paged out metadata page {page_no}");
        }
        Ok(())
    }

    /// Destructive reload of a page from disk, for rollback. Cannot run
    /// concurrently with optimistic readers.
    pub(crate) fn read_page(
        &self,
        file_no: u32,
        file: &PageFile,
        page_no: u64,
        geo: &PageGeometry,
    ) -> Result<&NvBuffer> {
        let buffer = self.buffer(file_no);
        let mut page = vec![0u8; self.page_size as usize];
        file.pread(&mut page, geo.file_page_index(page_no) * self.page_size)?;
        let dst = buffer.map.range(0, page.len())?;
        // SAFETY: dst spans the buffer mapping; the page was sized to it.
        unsafe { pmem::persist_copy(dst, page.as_ptr(), page.len()) };
        buffer.page_no.store(page_no, Ordering::Release);
        buffer.dirty.store(true, Ordering::Relaxed);
        Ok(buffer)
    }
}
