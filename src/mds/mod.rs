//! Metadata store: the page-indexed epoch catalogue.
//!
//! Every concluded epoch gets one fixed-size record mapping it to its
//! byte range across segments. Records live at deterministic offsets:
//! with `K` records per page, epoch `e` sits on 1-based page
//! `(e-1)/K + 1` at offset `(e-1) % K`, so page `p` holds epochs
//! `[(p-1)K+1, pK]` and lookup is pure arithmetic. Records are first
//! persisted into an NVDIMM write buffer (one per page file) and paged
//! out to disk when the next page is needed.
//!
//! The flusher is the only record writer. Readers observe the NV buffer
//! optimistically and detect recycling through the buffer's page number,
//! which increases monotonically while the engine runs.

mod buffer;
mod io;
mod iterator;

pub(crate) use iterator::EpochIterator;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{Config, InitMode};
use crate::control::ControlFile;
use crate::epoch::Epoch;
use crate::{Error, Result};

use buffer::BufferManager;
use io::MdsIo;

/// Record size; must match the NVDIMM failure-atomic unit.
pub const EPOCH_RECORD_SIZE: usize = 64;

/// Page file slots. The machinery loops over the slot array; a single
/// slot keeps consecutive pages in one file, which the buffer recycling
/// policy depends on.
pub const PAGEFILE_COUNT: u32 = 1;

/// Records fetched per page-file read on the iterator's refill path.
pub(crate) const READ_PREFETCH: usize = 8;

/// One epoch's byte range. `(from_seg_id, from_offset)` is the first
/// byte of the epoch, `(to_seg_id, to_off)` the first byte after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochMetadata {
    pub epoch_id: u64,
    pub from_seg_id: u64,
    pub from_offset: u64,
    pub to_seg_id: u64,
    pub to_off: u64,
    pub user_metadata_0: u64,
    pub user_metadata_1: u64,
}

impl EpochMetadata {
    pub(crate) fn to_bytes(self) -> [u8; EPOCH_RECORD_SIZE] {
        let mut buf = [0u8; EPOCH_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.epoch_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.from_seg_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.from_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.to_seg_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.to_off.to_le_bytes());
        buf[40..48].copy_from_slice(&self.user_metadata_0.to_le_bytes());
        buf[48..56].copy_from_slice(&self.user_metadata_1.to_le_bytes());
        // Bytes 56..64 reserved.
        buf
    }

    pub(crate) fn from_bytes(bytes: &[u8; EPOCH_RECORD_SIZE]) -> Self {
        let word = |at: usize| u64::from_le_bytes(bytes[at..at + 8].try_into().expect("record slice"));
        Self {
            epoch_id: word(0),
            from_seg_id: word(8),
            from_offset: word(16),
            to_seg_id: word(24),
            to_off: word(32),
            user_metadata_0: word(40),
            user_metadata_1: word(48),
        }
    }

    pub fn user_metadata(&self, metadata_id: usize) -> u64 {
        match metadata_id {
            1 => self.user_metadata_1,
            _ => self.user_metadata_0,
        }
    }
}

/// Deterministic epoch -> (file, page, offset) addressing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageGeometry {
    page_size: u64,
    epochs_per_page: u64,
}

impl PageGeometry {
    pub(crate) fn new(page_size: u64) -> Self {
        Self {
            page_size,
            epochs_per_page: page_size / EPOCH_RECORD_SIZE as u64,
        }
    }

    pub(crate) fn epochs_per_page(&self) -> u64 {
        self.epochs_per_page
    }

    /// 1-based global page number holding `epoch`.
    pub(crate) fn page_no(&self, epoch: Epoch) -> u64 {
        debug_assert!(epoch.is_valid());
        (epoch.raw() - 1) / self.epochs_per_page + 1
    }

    /// Record slot within the page.
    pub(crate) fn page_offset(&self, epoch: Epoch) -> u64 {
        (epoch.raw() - 1) % self.epochs_per_page
    }

    pub(crate) fn file_no(&self, epoch: Epoch) -> u32 {
        ((self.page_no(epoch) - 1) % PAGEFILE_COUNT as u64) as u32
    }

    /// 0-based page index within the owning page file.
    pub(crate) fn file_page_index(&self, page_no: u64) -> u64 {
        (page_no - 1) / PAGEFILE_COUNT as u64
    }

    pub(crate) fn file_offset(&self, epoch: Epoch) -> u64 {
        self.file_page_index(self.page_no(epoch)) * self.page_size
            + self.page_offset(epoch) * EPOCH_RECORD_SIZE as u64
    }

    pub(crate) fn last_epoch_on_page(&self, page_no: u64) -> u64 {
        page_no * self.epochs_per_page
    }
}

pub(crate) struct Mds {
    pub(crate) io: MdsIo,
    pub(crate) bufmgr: BufferManager,
    pub(crate) geo: PageGeometry,
    latest_epoch: AtomicU64,
}

impl Mds {
    /// Opens or creates the page files and NV buffers. Returns whether
    /// existing state was reopened; the caller runs `recover` in that
    /// case once the control block is available.
    pub(crate) fn init(mode: InitMode, config: &Config) -> Result<(Self, bool)> {
        let geo = PageGeometry::new(config.mds_page_size);
        let (io, io_restarted) = MdsIo::init(mode, &config.disk_root, config.mds_page_size)?;
        let (bufmgr, buf_restarted) = BufferManager::init(mode, &config.nv_root, config.mds_page_size)?;
        if io_restarted != buf_restarted {
            return Err(Error::CorruptMetadata("metadata store files are incomplete"));
        }
        let mds = Self {
            io,
            bufmgr,
            geo,
            latest_epoch: AtomicU64::new(0),
        };
        Ok((mds, io_restarted))
    }

    /// Reconciles on-media state after a restart.
    pub(crate) fn recover(&self, control: &ControlFile) -> Result<()> {
        let durable = control.durable_epoch();
        let paged = control.paged_mds_epoch();
        if durable.raw() < paged.raw() {
            // Crash mid-rollback; finish it.
            log::info!("mds recovery: replaying rollback to epoch {durable}");
            self.rollback_to_epoch(durable, control)?;
        } else if durable.is_valid() {
            let page_no = self.geo.page_no(durable);
            let paged_pages = paged.raw() / self.geo.epochs_per_page();
            if page_no > paged_pages {
                // The newest page never went to disk; its records are
                // still sitting in the durable NV buffer.
                self.bufmgr.adopt(self.geo.file_no(durable), page_no);
            }
        }
        self.set_latest(durable);
        Ok(())
    }

    pub(crate) fn latest_epoch(&self) -> Epoch {
        Epoch::new(self.latest_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn set_latest(&self, epoch: Epoch) {
        self.latest_epoch.store(epoch.raw(), Ordering::Release);
    }

    /// Writes the record and durably advances the control block's
    /// durable epoch to it.
    pub(crate) fn write_epoch(&self, meta: &EpochMetadata, control: &ControlFile) -> Result<()> {
        self.write_record(meta, control)?;
        control.set_durable_epoch(Epoch::new(meta.epoch_id));
        Ok(())
    }

    /// Persists the record into its buffered page. A full buffer triggers
    /// writeback, a durable paged-epoch bump, and one retry; the second
    /// failure propagates.
    pub(crate) fn write_record(&self, meta: &EpochMetadata, control: &ControlFile) -> Result<()> {
        let epoch = Epoch::new(meta.epoch_id);
        debug_assert!(epoch.is_valid());
        let file_no = self.geo.file_no(epoch);
        let page_no = self.geo.page_no(epoch);

        let buffer = match self.bufmgr.alloc_page(file_no, page_no) {
            Err(Error::NoBuffers) => {
                self.writeback()?;
                control.set_paged_mds_epoch(control.durable_epoch());
                self.bufmgr.alloc_page(file_no, page_no)?
            }
            other => other?,
        };
        buffer.write_record(self.geo.page_offset(epoch) as usize, &meta.to_bytes())?;
        self.set_latest(epoch);
        Ok(())
    }

    /// Pages out every dirty buffer; immediately repeating it is a no-op.
    pub(crate) fn writeback(&self) -> Result<()> {
        self.bufmgr.writeback(&self.io, &self.geo)
    }

    /// Winds the catalogue back so no epoch after `epoch` is visible.
    /// Not safe concurrently with optimistic readers.
    pub(crate) fn rollback_to_epoch(&self, epoch: Epoch, control: &ControlFile) -> Result<()> {
        debug_assert!(epoch.is_valid());
        control.set_durable_epoch(epoch);

        if epoch.raw() < control.paged_mds_epoch().raw() {
            let file_no = self.geo.file_no(epoch);
            let page_no = self.geo.page_no(epoch);
            let file = self.io.file(file_no);
            self.bufmgr.read_page(file_no, file, page_no, &self.geo)?;
            let retained_pages = self.geo.file_page_index(page_no);
            file.truncate_pages(retained_pages)?;
            control.set_paged_mds_epoch(Epoch::new(retained_pages * self.geo.epochs_per_page()));
        }

        if epoch.raw() < self.latest_epoch.load(Ordering::Acquire) {
            self.set_latest(epoch);
        }
        Ok(())
    }

    pub(crate) fn iter(&self, begin: Epoch, end_exclusive: Epoch) -> Result<EpochIterator<'_>> {
        EpochIterator::new(self, begin, end_exclusive)
    }

    pub(crate) fn read_one(&self, epoch: Epoch) -> Result<EpochMetadata> {
        debug_assert!(epoch.is_valid());
        let iter = self.iter(epoch, epoch.next())?;
        if iter.done() {
            return Err(Error::CorruptMetadata("epoch record missing"));
        }
        Ok(*iter.current())
    }

    /// Lowest epoch in `[1, latest]` whose chosen user-metadata word
    /// satisfies `predicate`. The predicate must be monotone for the
    /// result to be meaningful; the engine does not verify it.
    pub(crate) fn find_metadata_lower_bound(
        &self,
        metadata_id: usize,
        predicate: impl Fn(u64) -> bool,
    ) -> Result<Option<EpochMetadata>> {
        let mut low = 1u64;
        let mut high = self.latest_epoch.load(Ordering::Acquire);
        let mut found = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let meta = self.read_one(Epoch::new(mid))?;
            if predicate(meta.user_metadata(metadata_id)) {
                found = Some(meta);
                high = mid - 1;
            } else {
                low = mid + 1;
            }
        }
        Ok(found)
    }

    /// Highest epoch in `[1, latest]` satisfying `predicate`.
    pub(crate) fn find_metadata_upper_bound(
        &self,
        metadata_id: usize,
        predicate: impl Fn(u64) -> bool,
    ) -> Result<Option<EpochMetadata>> {
        let mut low = 1u64;
        let mut high = self.latest_epoch.load(Ordering::Acquire);
        let mut found = None;
        while low <= high {
            let mid = low + (high - low) / 2;
            let meta = self.read_one(Epoch::new(mid))?;
            if predicate(meta.user_metadata(metadata_id)) {
                found = Some(meta);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        Ok(found)
    }
}

const _: () = assert!(std::mem::size_of::<EpochMetadata>() <= EPOCH_RECORD_SIZE);
