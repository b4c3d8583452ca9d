//! Epoch metadata iteration.
//!
//! The read path is optimistic: if the wanted page is currently held in
//! the NV write buffer, the record is copied out and the buffer's page
//! number is re-read to prove the copy untorn. Otherwise records come
//! from a small prefetch cache refilled with positioned reads from the
//! page file, never across a page boundary.

use std::sync::atomic::Ordering;

use crate::epoch::{Epoch, INVALID_EPOCH};
use crate::{Error, Result};

use super::{EpochMetadata, Mds, EPOCH_RECORD_SIZE, READ_PREFETCH};

pub(crate) struct EpochIterator<'a> {
    mds: &'a Mds,
    cur: Epoch,
    /// Exclusive upper bound.
    end: Epoch,
    cache: Vec<EpochMetadata>,
    cache_first: Epoch,
}

impl<'a> EpochIterator<'a> {
    pub(crate) fn new(mds: &'a Mds, begin: Epoch, end_exclusive: Epoch) -> Result<Self> {
        if !begin.is_valid() || begin.after(end_exclusive) {
            return Err(Error::Config("invalid epoch iteration range"));
        }
        let mut iter = Self {
            mds,
            cur: begin,
            end: end_exclusive,
            cache: Vec::new(),
            cache_first: INVALID_EPOCH,
        };
        if !iter.done() {
            iter.prefetch()?;
        }
        Ok(iter)
    }

    pub(crate) fn done(&self) -> bool {
        !self.end.after(self.cur)
    }

    pub(crate) fn current(&self) -> &EpochMetadata {
        debug_assert!(!self.done());
        let idx = self.cur.raw().wrapping_sub(self.cache_first.raw()) as usize;
        &self.cache[idx]
    }

    pub(crate) fn advance(&mut self) -> Result<()> {
        debug_assert!(!self.done());
        self.cur = self.cur.next();
        if !self.done() {
            self.prefetch()?;
        }
        Ok(())
    }

    fn cache_covers(&self, epoch: Epoch) -> bool {
        if !self.cache_first.is_valid() {
            return false;
        }
        let idx = epoch.raw().wrapping_sub(self.cache_first.raw());
        (idx as usize) < self.cache.len()
    }

    fn prefetch(&mut self) -> Result<()> {
        let geo = &self.mds.geo;
        let epoch = self.cur;
        let file_no = geo.file_no(epoch);
        let page_no = geo.page_no(epoch);
        let buffer = self.mds.bufmgr.buffer(file_no);

        // Optimistic read from the NV write buffer.
        if buffer.page_no.load(Ordering::Acquire) == page_no {
            let raw = buffer.read_record(geo.page_offset(epoch) as usize)?;
            if buffer.page_no.load(Ordering::Acquire) == page_no {
                self.cache.clear();
                self.cache.push(EpochMetadata::from_bytes(&raw));
                self.cache_first = epoch;
                return Ok(());
            }
            // The page was recycled mid-copy; it is on disk now.
        }

        if self.cache_covers(epoch) {
            return Ok(());
        }

        // Refill from the page file, clamped to the page boundary.
        let upper = (epoch.raw() + READ_PREFETCH as u64 - 1)
            .min(self.end.raw().wrapping_sub(1))
            .min(geo.last_epoch_on_page(page_no));
        let count = (upper - epoch.raw() + 1) as usize;
        let mut raw = vec![0u8; count * EPOCH_RECORD_SIZE];
        self.mds
            .io
            .file(file_no)
            .pread(&mut raw, geo.file_offset(epoch))?;

        self.cache.clear();
        for chunk in raw.chunks_exact(EPOCH_RECORD_SIZE) {
            let record: &[u8; EPOCH_RECORD_SIZE] = chunk.try_into().expect("record chunk size");
            self.cache.push(EpochMetadata::from_bytes(record));
        }
        self.cache_first = epoch;
        Ok(())
    }
}
