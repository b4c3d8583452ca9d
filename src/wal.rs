//! The owning engine value: lifecycle, recovery, and the public surface.
//!
//! `Wal::open` validates the configuration, creates or recovers the
//! persistent state, and starts the two background threads. All owned
//! resources (control-block mapping, NV segment maps, MDS state, thread
//! handles) are released on `shutdown` or drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{Config, InitMode};
use crate::control::ControlFile;
use crate::cursor::LogCursor;
use crate::epoch::Epoch;
use crate::flusher::Flusher;
use crate::fsyncer::Fsyncer;
use crate::layout;
use crate::mds::{EpochMetadata, Mds};
use crate::segment::{discover_disk_segments, NvSegment};
use crate::state::StateCell;
use crate::writer::{WriterHandle, WriterShared};
use crate::{Error, Result};

/// State shared between the public surface, the flusher, the fsyncer,
/// and cursors.
pub(crate) struct WalShared {
    pub(crate) config: Config,
    pub(crate) control: ControlFile,
    pub(crate) segments: Vec<NvSegment>,
    pub(crate) writers: Vec<Arc<WriterShared>>,
    pub(crate) mds: Mds,
    /// Volatile announce copy of the durable epoch; the persistent CB
    /// field is written first, this one after.
    pub(crate) durable_epoch: AtomicU64,
    pub(crate) stable_epoch: AtomicU64,
    pub(crate) flusher_state: StateCell,
    pub(crate) fsyncer_state: StateCell,
    /// User metadata staged for epochs not yet concluded.
    pending_metadata: Mutex<Vec<(u64, u64, u64)>>,
    first_error: Mutex<Option<Error>>,
}

impl WalShared {
    pub(crate) fn durable(&self) -> Epoch {
        Epoch::new(self.durable_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn stable(&self) -> Epoch {
        Epoch::new(self.stable_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn take_pending_metadata(&self, epoch: Epoch) -> (u64, u64) {
        let mut pending = self.pending_metadata.lock().expect("pending metadata lock");
        match pending.iter().position(|(raw, _, _)| *raw == epoch.raw()) {
            Some(at) => {
                let (_, meta0, meta1) = pending.remove(at);
                (meta0, meta1)
            }
            None => (0, 0),
        }
    }

    pub(crate) fn record_error(&self, err: Error) {
        let mut slot = self.first_error.lock().expect("first error lock");
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

struct Bootstrap {
    control: ControlFile,
    mds: Mds,
    segments: Vec<NvSegment>,
    durable: Epoch,
    cur_dsid: u64,
    epoch_head_dsid: u64,
    epoch_head_offset: u64,
}

pub struct Wal {
    shared: Arc<WalShared>,
    flusher: Option<JoinHandle<()>>,
    fsyncer: Option<JoinHandle<()>>,
    writer_taken: Mutex<Vec<bool>>,
}

impl Wal {
    pub fn open(config: Config, mode: InitMode) -> Result<Wal> {
        let config = config.validated()?;
        let control_exists = layout::control_path(&config.nv_root).exists();
        if mode == InitMode::Restart && !control_exists {
            return Err(Error::Config("restart requested but no engine state exists"));
        }
        let fresh = mode == InitMode::CreateTruncate || !control_exists;
        let boot = if fresh {
            Self::create(&config)?
        } else {
            Self::restart(&config)?
        };

        let writers = (0..config.writer_count)
            .map(|_| Arc::new(WriterShared::new(config.writer_buffer_size)))
            .collect();
        let writer_count = config.writer_count as usize;

        let shared = Arc::new(WalShared {
            config,
            control: boot.control,
            segments: boot.segments,
            writers,
            mds: boot.mds,
            durable_epoch: AtomicU64::new(boot.durable.raw()),
            stable_epoch: AtomicU64::new(boot.durable.raw()),
            flusher_state: StateCell::new(),
            fsyncer_state: StateCell::new(),
            pending_metadata: Mutex::new(Vec::new()),
            first_error: Mutex::new(None),
        });

        let mut flusher = Flusher::new(
            Arc::clone(&shared),
            boot.cur_dsid,
            boot.epoch_head_dsid,
            boot.epoch_head_offset,
        );
        let flusher_shared = Arc::clone(&shared);
        let flusher_handle = std::thread::Builder::new()
            .name("nvlog-flusher".into())
            .spawn(move || {
                if let Err(err) = flusher.run() {
                    log::error!("flusher stopped with error: {err}");
                    flusher_shared.record_error(err);
                }
            })?;

        let mut fsyncer = Fsyncer::new(Arc::clone(&shared));
        let fsyncer_shared = Arc::clone(&shared);
        let fsyncer_handle = std::thread::Builder::new()
            .name("nvlog-fsyncer".into())
            .spawn(move || {
                if let Err(err) = fsyncer.run() {
                    log::error!("fsyncer stopped with error: {err}");
                    fsyncer_shared.record_error(err);
                }
            })?;

        Ok(Wal {
            shared,
            flusher: Some(flusher_handle),
            fsyncer: Some(fsyncer_handle),
            writer_taken: Mutex::new(vec![false; writer_count]),
        })
    }

    fn create(config: &Config) -> Result<Bootstrap> {
        log::info!(
            "creating wal engine: nv_root={} disk_root={}",
            config.nv_root.display(),
            config.disk_root.display()
        );
        let control = ControlFile::create(
            &layout::control_path(&config.nv_root),
            config.resuming_epoch,
            config.geometry_crc(),
        )?;
        let segment_count = config.segment_count();
        let mut segments = Vec::with_capacity(segment_count as usize);
        for slot in 0..segment_count {
            let segment = NvSegment::create(&config.nv_root, slot, config.segment_size)?;
            segment.dsid.store(slot as u64 + 1, Ordering::Relaxed);
            // Slots beyond the first start out trivially recyclable.
            segment
                .fsync_completed
                .store(u32::from(slot != 0), Ordering::Relaxed);
            segments.push(segment);
        }
        layout::fsync_dir(&config.nv_root)?;

        let (mds, restarted) = Mds::init(InitMode::CreateTruncate, config)?;
        debug_assert!(!restarted);
        mds.set_latest(config.resuming_epoch);

        Ok(Bootstrap {
            control,
            mds,
            segments,
            durable: config.resuming_epoch,
            cur_dsid: 1,
            epoch_head_dsid: 1,
            epoch_head_offset: 0,
        })
    }

    fn restart(config: &Config) -> Result<Bootstrap> {
        let control = ControlFile::open(&layout::control_path(&config.nv_root))?;
        control.verify_config_crc(config.geometry_crc())?;

        let (mds, restarted) = Mds::init(InitMode::Restart, config)?;
        debug_assert!(restarted);
        mds.recover(&control)?;

        let durable = control.durable_epoch();
        let last_synced = control.last_synced_dsid();

        // The recorded sync progress must be backed by real files: sealed
        // segments are never deleted, so every dsid up to
        // last_synced_dsid has to be present under disk_root.
        let on_disk = discover_disk_segments(&config.disk_root)?;
        for dsid in 1..=last_synced {
            if on_disk.binary_search(&dsid).is_err() {
                return Err(Error::CorruptMetadata("sealed segment missing from disk_root"));
            }
        }

        // Resume where the durable epoch's byte range ends. A missing
        // record only happens for a resuming epoch the engine never
        // concluded itself; start from scratch then.
        let (cur_dsid, cur_offset) = if durable.is_valid() {
            match mds.read_one(durable) {
                Ok(meta) if meta.epoch_id == durable.raw() => (meta.to_seg_id, meta.to_off),
                _ => (1, 0),
            }
        } else {
            (1, 0)
        };

        let segment_count = config.segment_count();
        let mut segments = Vec::with_capacity(segment_count as usize);
        for slot in 0..segment_count {
            let segment = NvSegment::open(&config.nv_root, slot, config.segment_size)?;
            let first_dsid = slot as u64 + 1;
            if first_dsid > cur_dsid {
                // Never reached; behaves like a fresh recyclable slot.
                segment.dsid.store(first_dsid, Ordering::Relaxed);
                segment.fsync_completed.store(1, Ordering::Relaxed);
                segments.push(segment);
                continue;
            }
            // Largest dsid <= cur_dsid that maps onto this slot.
            let slot_dsid = cur_dsid - (cur_dsid - first_dsid) % segment_count as u64;
            segment.dsid.store(slot_dsid, Ordering::Relaxed);
            if slot_dsid == cur_dsid {
                segment.written_bytes.store(cur_offset, Ordering::Relaxed);
            } else if slot_dsid <= last_synced {
                segment
                    .written_bytes
                    .store(config.segment_size, Ordering::Relaxed);
                segment.fsync_completed.store(1, Ordering::Relaxed);
            } else {
                // Full but never made it to disk; re-queue the sync. The
                // rewrite is idempotent.
                segment
                    .written_bytes
                    .store(config.segment_size, Ordering::Relaxed);
                segment.fsync_requested.store(1, Ordering::Relaxed);
            }
            segments.push(segment);
        }

        log::info!("restarted wal engine: durable epoch {durable}, resuming at dsid {cur_dsid}");
        Ok(Bootstrap {
            control,
            mds,
            segments,
            durable,
            cur_dsid,
            epoch_head_dsid: cur_dsid,
            epoch_head_offset: cur_offset,
        })
    }

    /// Hands out the writer handle for `id`; each may be taken once.
    pub fn writer(&self, id: u32) -> Result<WriterHandle> {
        let mut taken = self.writer_taken.lock().expect("writer registry lock");
        let slot = taken
            .get_mut(id as usize)
            .ok_or(Error::Config("writer id out of range"))?;
        if *slot {
            return Err(Error::Config("writer handle already taken"));
        }
        *slot = true;
        Ok(WriterHandle::new(Arc::clone(&self.shared.writers[id as usize])))
    }

    /// Declares every epoch up to `epoch` complete: the flusher may now
    /// conclude them. Monotonic; an older value is a no-op.
    pub fn advance_stable_epoch(&self, epoch: Epoch) -> Result<()> {
        if !epoch.is_valid() {
            return Err(Error::Config("invalid stable epoch"));
        }
        if self.shared.flusher_state.is_stopped() {
            return Err(Error::NotRunning);
        }
        let stable = &self.shared.stable_epoch;
        let mut observed = stable.load(Ordering::Acquire);
        while epoch.after(Epoch::new(observed)) {
            match stable.compare_exchange_weak(
                observed,
                epoch.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => observed = now,
            }
        }
        Ok(())
    }

    /// Like `advance_stable_epoch`, additionally staging the two user
    /// metadata words stamped into `epoch`'s record at conclusion.
    pub fn advance_stable_epoch_with_metadata(
        &self,
        epoch: Epoch,
        user_metadata_0: u64,
        user_metadata_1: u64,
    ) -> Result<()> {
        if !epoch.is_valid() {
            return Err(Error::Config("invalid stable epoch"));
        }
        self.shared
            .pending_metadata
            .lock()
            .expect("pending metadata lock")
            .push((epoch.raw(), user_metadata_0, user_metadata_1));
        self.advance_stable_epoch(epoch)
    }

    pub fn durable_epoch(&self) -> Epoch {
        self.shared.durable()
    }

    pub fn stable_epoch(&self) -> Epoch {
        self.shared.stable()
    }

    /// Newest epoch with a record in the metadata store; may exceed the
    /// durable epoch transiently but is never authoritative beyond it.
    pub fn latest_epoch(&self) -> Epoch {
        self.shared.mds.latest_epoch()
    }

    pub fn paged_mds_epoch(&self) -> Epoch {
        self.shared.control.paged_mds_epoch()
    }

    pub fn last_synced_dsid(&self) -> u64 {
        self.shared.control.last_synced_dsid()
    }

    /// Blocks until `epoch` is durable. `Cancelled` on timeout,
    /// `NotRunning` if the flusher died first.
    pub fn wait_durable(&self, epoch: Epoch, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.durable().equal_or_after(epoch) {
                return Ok(());
            }
            if self.shared.flusher_state.is_stopped() {
                return Err(Error::NotRunning);
            }
            if Instant::now() >= deadline {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    pub fn epoch_metadata(&self, epoch: Epoch) -> Result<EpochMetadata> {
        if !epoch.is_valid() || epoch.after(self.shared.mds.latest_epoch()) {
            return Err(Error::Config("epoch out of range"));
        }
        self.shared.mds.read_one(epoch)
    }

    /// Opens a cursor over `[begin, end]` (inclusive). Epochs beyond the
    /// durable epoch are not iterated.
    pub fn open_cursor(&self, begin: Epoch, end: Epoch) -> Result<LogCursor<'_>> {
        LogCursor::open(&self.shared, begin, end)
    }

    /// Winds durable state back to `epoch`: later records become
    /// invisible and paged metadata is truncated. Callers quiesce the
    /// engine first: no concurrent appends, stable-epoch advances, or
    /// open cursors.
    pub fn rollback_to_epoch(&self, epoch: Epoch) -> Result<()> {
        if !epoch.is_valid() {
            return Err(Error::Config("cannot roll back to the invalid epoch"));
        }
        let durable = self.shared.durable();
        if epoch.after(durable) {
            return Err(Error::Config("rollback target exceeds the durable epoch"));
        }
        self.shared.stable_epoch.store(epoch.raw(), Ordering::Release);
        self.shared.durable_epoch.store(epoch.raw(), Ordering::Release);
        self.shared
            .mds
            .rollback_to_epoch(epoch, &self.shared.control)
    }

    /// Lowest epoch whose record satisfies `predicate` over the chosen
    /// user metadata word; the predicate must be monotone.
    pub fn find_metadata_lower_bound(
        &self,
        metadata_id: usize,
        predicate: impl Fn(u64) -> bool,
    ) -> Result<Option<EpochMetadata>> {
        self.shared.mds.find_metadata_lower_bound(metadata_id, predicate)
    }

    /// Highest epoch whose record satisfies `predicate`.
    pub fn find_metadata_upper_bound(
        &self,
        metadata_id: usize,
        predicate: impl Fn(u64) -> bool,
    ) -> Result<Option<EpochMetadata>> {
        self.shared.mds.find_metadata_upper_bound(metadata_id, predicate)
    }

    /// First error either background thread died with; `None` while the
    /// pipeline is healthy. `Error::errno` maps it onto the platform
    /// error-code surface.
    pub fn pipeline_error(&self) -> Option<Error> {
        self.shared
            .first_error
            .lock()
            .expect("first error lock")
            .as_ref()
            .map(Error::duplicate)
    }

    /// Nanosecond timestamp of the flusher's latest loop iteration.
    pub fn flusher_heartbeat_ns(&self) -> u64 {
        self.shared.control.flusher_heartbeat_ns()
    }

    fn stop(&mut self) {
        self.shared.flusher_state.request_stop();
        self.shared.fsyncer_state.request_stop();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fsyncer.take() {
            let _ = handle.join();
        }
    }

    /// Stops both background threads and surfaces the first error the
    /// pipeline hit, if any.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop();
        let err = self.shared.first_error.lock().expect("first error lock").take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.stop();
    }
}
