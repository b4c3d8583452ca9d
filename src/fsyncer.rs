//! Fsyncer: evicts full NV segments to block-device files.
//!
//! Segments are synced strictly in dsid order so `last_synced_dsid`
//! always names a dense prefix; the cursor's NV-versus-disk decision
//! depends on that.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::layout;
use crate::segment::{slot_for_dsid, NvSegment};
use crate::wal::WalShared;
use crate::{Error, Result};

const WRITE_CHUNK: usize = 1 << 20;
const IDLE_BACKOFF: Duration = Duration::from_micros(200);

pub(crate) struct Fsyncer {
    shared: Arc<WalShared>,
}

impl Fsyncer {
    pub(crate) fn new(shared: Arc<WalShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        if !shared.fsyncer_state.try_start() {
            // Stop was requested before the thread got going.
            return Ok(());
        }
        let result = self.main(&shared);
        shared.fsyncer_state.mark_stopped();
        result
    }

    fn main(&mut self, shared: &WalShared) -> Result<()> {
        loop {
            std::thread::yield_now();
            if shared.fsyncer_state.stop_requested() {
                return Ok(());
            }

            let next_dsid = shared.control.last_synced_dsid() + 1;
            let segment = &shared.segments[slot_for_dsid(next_dsid, shared.config.segment_count())];
            let ready = segment.dsid.load(Ordering::Acquire) == next_dsid
                && segment.fsync_requested.load(Ordering::Acquire) == 1
                && segment.fsync_completed.load(Ordering::Acquire) == 0;
            if !ready {
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            }

            match self.sync_segment(shared, segment, next_dsid) {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn sync_segment(&self, shared: &WalShared, segment: &NvSegment, dsid: u64) -> Result<()> {
        match self.write_and_sync(shared, segment, dsid) {
            Ok(()) => {
                segment.fsync_requested.store(0, Ordering::Relaxed);
                segment.fsync_completed.store(1, Ordering::Release);
                // Durably record the progress for recovery and cursors.
                shared.control.set_last_synced_dsid(dsid);
                log::debug!("synced segment dsid {dsid} to disk");
                Ok(())
            }
            Err(err) => {
                if !matches!(err, Error::Cancelled) {
                    // Leave the error on the segment for the flusher to
                    // propagate out of its recycle wait.
                    segment.fsync_error.store(err.errno(), Ordering::Release);
                    log::error!("segment sync failed for dsid {dsid}: {err}");
                }
                Err(err)
            }
        }
    }

    fn write_and_sync(&self, shared: &WalShared, segment: &NvSegment, dsid: u64) -> Result<()> {
        let path = layout::disk_segment_path(&shared.config.disk_root, dsid);
        let mut file = open_rw_direct(&path)?;
        let len = shared.config.segment_size as usize;
        // SAFETY: between fsync_requested and fsync_completed the slot's
        // contents belong exclusively to the fsyncer.
        let body = unsafe { std::slice::from_raw_parts(segment.base_ptr() as *const u8, len) };

        let mut written = 0usize;
        while written < len {
            let end = (written + WRITE_CHUNK).min(len);
            file.write_all(&body[written..end])?;
            written = end;
            if shared.fsyncer_state.stop_requested_relaxed() {
                return Err(Error::Cancelled);
            }
        }
        file.sync_all()?;
        drop(file);
        // Persist the dentry as well.
        layout::fsync_dir(&shared.config.disk_root)?;
        Ok(())
    }
}

/// O_DIRECT is best-effort; filesystems that refuse it get a plain open.
fn open_rw_direct(path: &Path) -> Result<File> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Ok(file) = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            return Ok(file);
        }
    }
    Ok(OpenOptions::new().read(true).write(true).create(true).open(path)?)
}
