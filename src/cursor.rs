//! Epoch-range log cursor.
//!
//! A cursor walks `[begin, end]` and exposes one contiguous slice per
//! position; epochs spanning several segments yield one slice per
//! segment. Bytes come straight from the NV segment (pinned against
//! recycling) while the segment is still NVDIMM-resident, or from a
//! read-only mapping of the sealed disk copy once the fsyncer has moved
//! it.

use crate::epoch::{Epoch, INVALID_EPOCH};
use crate::mds::EpochMetadata;
use crate::mmap::MmapRo;
use crate::segment::{map_disk_segment, slot_for_dsid};
use crate::wal::WalShared;
use crate::{Error, Result};

/// Epoch metadata records fetched ahead of the read position.
pub(crate) const CURSOR_EPOCH_PREFETCH: usize = 16;

enum SegmentHold {
    None,
    Nv { slot: usize },
    Disk { _map: MmapRo },
}

pub struct LogCursor<'a> {
    shared: &'a WalShared,
    /// Inclusive upper bound of the requested range.
    end: Epoch,
    current_epoch: Epoch,
    cur_meta: EpochMetadata,
    cur_dsid: u64,
    hold: SegmentHold,
    data_ptr: *const u8,
    data_len: usize,
    fetched: Vec<EpochMetadata>,
    fetched_from: Epoch,
}

impl<'a> LogCursor<'a> {
    pub(crate) fn open(shared: &'a WalShared, begin: Epoch, end: Epoch) -> Result<Self> {
        if !begin.is_valid() || !end.equal_or_after(begin) {
            return Err(Error::Config("invalid cursor epoch range"));
        }
        let mut cursor = Self {
            shared,
            end,
            current_epoch: INVALID_EPOCH,
            cur_meta: EpochMetadata::default(),
            cur_dsid: 0,
            hold: SegmentHold::None,
            data_ptr: std::ptr::null(),
            data_len: 0,
            fetched: Vec::new(),
            fetched_from: INVALID_EPOCH,
        };
        cursor.position_epoch(begin)?;
        Ok(cursor)
    }

    /// Valid while positioned on readable bytes.
    pub fn is_valid(&self) -> bool {
        self.current_epoch.is_valid() && !self.data_ptr.is_null()
    }

    pub fn current_epoch(&self) -> Epoch {
        if self.is_valid() {
            self.current_epoch
        } else {
            INVALID_EPOCH
        }
    }

    /// The bytes at the current position; empty when invalid.
    pub fn data(&self) -> &[u8] {
        if !self.is_valid() {
            return &[];
        }
        // SAFETY: the pointer targets a held mapping (NV pin or disk map)
        // that lives until the cursor moves or closes.
        unsafe { std::slice::from_raw_parts(self.data_ptr, self.data_len) }
    }

    /// Advances to the next slice: the epoch's next segment, or the first
    /// slice of the next epoch. Invalidates past the end of the range.
    pub fn next(&mut self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        // Remaining segments of the current epoch first.
        while self.cur_dsid < self.cur_meta.to_seg_id {
            let dsid = self.cur_dsid + 1;
            let len = if dsid == self.cur_meta.to_seg_id {
                self.cur_meta.to_off
            } else {
                self.shared.config.segment_size
            };
            self.cur_dsid = dsid;
            if len == 0 {
                // An epoch ending exactly at a segment boundary records
                // its end as offset 0 of the following segment.
                continue;
            }
            let base = self.open_segment(dsid)?;
            self.data_ptr = base;
            self.data_len = len as usize;
            return Ok(());
        }
        self.position_epoch(self.current_epoch.next())
    }

    pub fn close(mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn in_range(&self, epoch: Epoch) -> bool {
        !epoch.after(self.end) && !epoch.after(self.shared.durable())
    }

    /// Positions at the first non-empty slice at or after `epoch`,
    /// or invalidates at the range end.
    fn position_epoch(&mut self, mut epoch: Epoch) -> Result<()> {
        loop {
            if !self.in_range(epoch) {
                self.release();
                self.current_epoch = INVALID_EPOCH;
                return Ok(());
            }
            let meta = self.metadata_for(epoch)?;
            self.current_epoch = epoch;
            self.cur_meta = meta;

            let first_len = if meta.from_seg_id == meta.to_seg_id {
                meta.to_off - meta.from_offset
            } else {
                self.shared.config.segment_size - meta.from_offset
            };
            if first_len == 0 {
                // Zero-byte epoch; skip to the following one.
                epoch = epoch.next();
                continue;
            }
            self.cur_dsid = meta.from_seg_id;
            let base = self.open_segment(meta.from_seg_id)?;
            // SAFETY: from_offset lies inside the segment.
            self.data_ptr = unsafe { base.add(meta.from_offset as usize) };
            self.data_len = first_len as usize;
            return Ok(());
        }
    }

    fn metadata_for(&mut self, epoch: Epoch) -> Result<EpochMetadata> {
        if self.fetched_from.is_valid() {
            let idx = epoch.raw().wrapping_sub(self.fetched_from.raw()) as usize;
            if idx < self.fetched.len() {
                return Ok(self.fetched[idx]);
            }
        }
        self.fetch_metadata(epoch)?;
        self.fetched
            .first()
            .copied()
            .ok_or(Error::CorruptMetadata("epoch record missing"))
    }

    /// Refills the prefetch window, never reaching past the durable
    /// epoch or the requested range.
    fn fetch_metadata(&mut self, from: Epoch) -> Result<()> {
        let durable = self.shared.durable();
        let mut to = from.advance(CURSOR_EPOCH_PREFETCH as u64 - 1);
        if to.after(self.end) {
            to = self.end;
        }
        if to.after(durable) {
            to = durable;
        }
        self.fetched.clear();
        self.fetched_from = INVALID_EPOCH;
        if from.after(to) {
            return Ok(());
        }
        let mut iter = self.shared.mds.iter(from, to.next())?;
        while !iter.done() {
            self.fetched.push(*iter.current());
            iter.advance()?;
        }
        self.fetched_from = from;
        Ok(())
    }

    /// Releases the current segment and materialises `dsid`, returning
    /// its base address.
    fn open_segment(&mut self, dsid: u64) -> Result<*const u8> {
        self.release();
        let shared = self.shared;
        if dsid > shared.control.last_synced_dsid() {
            let slot = slot_for_dsid(dsid, shared.config.segment_count());
            let segment = &shared.segments[slot];
            if segment.try_pin(dsid) {
                self.hold = SegmentHold::Nv { slot };
                return Ok(segment.base_ptr() as *const u8);
            }
            // Recycled while we looked; the disk copy exists by now.
        }
        let map = map_disk_segment(&shared.config.disk_root, dsid, shared.config.segment_size)?;
        let base = map.as_ptr();
        self.hold = SegmentHold::Disk { _map: map };
        Ok(base)
    }

    fn release(&mut self) {
        if let SegmentHold::Nv { slot } = std::mem::replace(&mut self.hold, SegmentHold::None) {
            self.shared.segments[slot].unpin();
        }
        self.data_ptr = std::ptr::null();
        self.data_len = 0;
    }
}

impl Drop for LogCursor<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
