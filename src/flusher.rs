//! Flusher: the single agent that copies writer bytes into NV segments,
//! concludes stable epochs, and advances the durable epoch.
//!
//! Policy: always drain `DE + 1`. As long as an epoch has bytes it is
//! correct to write them out; the only cost is a little wasted bandwidth
//! while `DE + 1` is already fully drained but not yet stable. Tracking a
//! second in-flight epoch is not worth the complexity.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::circular;
use crate::epoch::Epoch;
use crate::mds::EpochMetadata;
use crate::pmem;
use crate::segment::{slot_for_dsid, PIN_EXCLUSIVE};
use crate::wal::WalShared;
use crate::writer::{WriterShared, EPOCH_FRAME_COUNT};
use crate::{Error, Result};

const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// Wall-anchored TSC time for the liveness stamp in the control block.
/// The anchor to wall time is taken once at thread start; after that a
/// stamp costs a few nanoseconds of tick arithmetic, cheap enough for
/// every loop iteration.
struct HeartbeatClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start: quanta::Instant,
}

impl HeartbeatClock {
    fn new() -> Self {
        let clock = quanta::Clock::new();
        let start = clock.now();
        let start_wall_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_nanos() as u64;
        Self {
            clock,
            start_wall_ns,
            start,
        }
    }

    fn now_ns(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

pub(crate) struct Flusher {
    shared: Arc<WalShared>,
    clock: HeartbeatClock,
    /// Dsid of the segment currently receiving bytes.
    cur_dsid: u64,
    /// Where the in-progress epoch's bytes begin.
    epoch_head_dsid: u64,
    epoch_head_offset: u64,
}

impl Flusher {
    pub(crate) fn new(
        shared: Arc<WalShared>,
        cur_dsid: u64,
        epoch_head_dsid: u64,
        epoch_head_offset: u64,
    ) -> Self {
        Self {
            shared,
            clock: HeartbeatClock::new(),
            cur_dsid,
            epoch_head_dsid,
            epoch_head_offset,
        }
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        if !shared.flusher_state.try_start() {
            // Stop was requested before the thread got going.
            return Ok(());
        }
        let result = self.main(&shared);
        shared.flusher_state.mark_stopped();
        result
    }

    fn main(&mut self, shared: &WalShared) -> Result<()> {
        loop {
            std::thread::yield_now();
            shared.control.set_flusher_heartbeat_ns(self.clock.now_ns());
            if shared.flusher_state.stop_requested() {
                return Ok(());
            }
            match self.main_loop(shared) {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(IDLE_BACKOFF),
                Err(Error::Cancelled) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// One pass: copy the target epoch out of every writer, then conclude
    /// it if the client has declared it stable. Returns whether any work
    /// happened.
    fn main_loop(&mut self, shared: &WalShared) -> Result<bool> {
        let target = shared.durable().next();
        let is_stable = shared.stable().equal_or_after(target);

        let mut did_work = false;
        for writer in &shared.writers {
            did_work |= self.copy_one_writer(shared, writer, target, is_stable)?;
            // React promptly; the pass is incomplete, so no conclusion.
            if shared.flusher_state.stop_requested_relaxed() {
                return Ok(did_work);
            }
        }
        if is_stable {
            self.conclude(shared, target)?;
            return Ok(true);
        }
        Ok(did_work)
    }

    /// Copies all currently visible bytes of `target` from one writer
    /// into the NV segment ring. Does not drain or persist; persistence
    /// is batched at epoch conclusion.
    fn copy_one_writer(
        &mut self,
        shared: &WalShared,
        writer: &WriterShared,
        target: Epoch,
        is_stable: bool,
    ) -> Result<bool> {
        let buffer_size = writer.buffer_size();

        // Frames hold strictly increasing epochs starting at the retire
        // point; find the one carrying the target epoch.
        let retired = writer.retired_frames.load(Ordering::Relaxed);
        let mut target_count = None;
        for count in retired..retired + EPOCH_FRAME_COUNT as u64 {
            let frame = writer.frame(count);
            let raw = frame.log_epoch.load(Ordering::Acquire);
            if raw == 0 {
                break; // nothing published past here yet
            }
            let epoch = Epoch::new(raw);
            if epoch == target {
                target_count = Some(count);
                break;
            }
            if epoch.after(target) {
                break; // writer ran ahead; nothing for this round
            }
            // Older than target: fully drained in an earlier stable pass
            // whose retirement a stop request interrupted. Finish it.
            let head = frame.head_offset.load(Ordering::Acquire);
            let tail = frame.tail_offset.load(Ordering::Acquire);
            if circular::distance(head, tail, buffer_size) != 0 {
                return Err(Error::Corrupt("unflushed bytes in a concluded epoch frame"));
            }
            Self::retire_frame(writer, count);
        }
        let Some(count) = target_count else {
            return Ok(false);
        };
        let frame = writer.frame(count);

        let segment_size = shared.config.segment_size;
        let segment_count = shared.config.segment_count();
        let mut copied_any = false;
        loop {
            // Markers first, then the data.
            let head = frame.head_offset.load(Ordering::Acquire);
            let tail = frame.tail_offset.load(Ordering::Acquire);
            let distance = circular::distance(head, tail, buffer_size);
            if distance == 0 {
                if is_stable {
                    Self::retire_frame(writer, count);
                }
                return Ok(copied_any);
            }

            let segment = &shared.segments[slot_for_dsid(self.cur_dsid, segment_count)];
            let written = segment.written_bytes.load(Ordering::Relaxed);
            let writable = segment_size - written;
            if writable == 0 {
                self.rotate(shared)?;
                continue;
            }
            let n = writable.min(distance);
            // SAFETY: the destination range is the unwritten tail of the
            // segment this flusher exclusively owns; the source range
            // [head, tail) is published and stable until head advances.
            unsafe {
                circular::copy_from_ring(
                    segment.base_ptr().add(written as usize),
                    writer.buffer.as_ptr() as *const u8,
                    buffer_size,
                    head,
                    n,
                );
            }
            segment.written_bytes.store(written + n, Ordering::Relaxed);
            copied_any = true;

            let new_head = circular::wrap_offset(head + n, buffer_size);
            if new_head == tail && is_stable {
                Self::retire_frame(writer, count);
                if written + n == segment_size {
                    self.rotate(shared)?;
                }
                return Ok(true);
            }
            // Release order: has_enough_space depends on a current head.
            frame.head_offset.store(new_head, Ordering::Release);
            if written + n == segment_size {
                self.rotate(shared)?;
                continue;
            }
            if n == distance {
                return Ok(true);
            }
        }
    }

    /// Frees the frame back to the writer.
    fn retire_frame(writer: &WriterShared, count: u64) {
        debug_assert_eq!(writer.retired_frames.load(Ordering::Relaxed), count);
        let frame = writer.frame(count);
        frame.head_offset.store(0, Ordering::Relaxed);
        frame.tail_offset.store(0, Ordering::Relaxed);
        frame.log_epoch.store(0, Ordering::Release);
        writer.retired_frames.store(count + 1, Ordering::Release);
    }

    /// The current segment is full: hand it to the fsyncer and recycle
    /// the next ring slot, waiting out its sync and any cursor pins.
    fn rotate(&mut self, shared: &WalShared) -> Result<()> {
        let segment_count = shared.config.segment_count();
        let cur = &shared.segments[slot_for_dsid(self.cur_dsid, segment_count)];
        debug_assert_eq!(
            cur.written_bytes.load(Ordering::Relaxed),
            shared.config.segment_size
        );
        cur.fsync_requested.store(1, Ordering::Release);

        let next_dsid = self.cur_dsid + 1;
        let next = &shared.segments[slot_for_dsid(next_dsid, segment_count)];
        while next.fsync_completed.load(Ordering::Acquire) == 0 {
            let err = next.fsync_error.load(Ordering::Acquire);
            if err != 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(err)));
            }
            if shared.flusher_state.stop_requested_relaxed() {
                return Err(Error::Cancelled);
            }
            if shared.fsyncer_state.is_stopped() {
                // The fsyncer died on another segment; this sync will
                // never complete.
                return Err(Error::NotRunning);
            }
            std::thread::yield_now();
        }

        // Wait for cursors to let go of the old contents.
        while next
            .nv_reader_pins
            .compare_exchange_weak(0, PIN_EXCLUSIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if shared.flusher_state.stop_requested_relaxed() {
                return Err(Error::Cancelled);
            }
            std::thread::yield_now();
        }

        next.written_bytes.store(0, Ordering::Relaxed);
        next.fsync_requested.store(0, Ordering::Relaxed);
        next.fsync_completed.store(0, Ordering::Relaxed);
        next.fsync_error.store(0, Ordering::Relaxed);
        next.dsid.store(next_dsid, Ordering::Release);
        next.nv_reader_pins.store(0, Ordering::Release);

        self.cur_dsid = next_dsid;
        log::debug!("flusher rotated onto nv segment dsid {next_dsid}");
        Ok(())
    }

    /// All bytes of `target` are in NV segments; make the epoch durable.
    fn conclude(&mut self, shared: &WalShared, target: Epoch) -> Result<()> {
        let segment_count = shared.config.segment_count();
        let cur = &shared.segments[slot_for_dsid(self.cur_dsid, segment_count)];
        let (user_metadata_0, user_metadata_1) = shared.take_pending_metadata(target);
        let meta = EpochMetadata {
            epoch_id: target.raw(),
            from_seg_id: self.epoch_head_dsid,
            from_offset: self.epoch_head_offset,
            to_seg_id: self.cur_dsid,
            to_off: cur.written_bytes.load(Ordering::Relaxed),
            user_metadata_0,
            user_metadata_1,
        };

        // The copies above were plain memcpys. Persist the epoch's byte
        // ranges here, once per affected segment, skipping segments that
        // already made it to disk.
        let synced = shared.control.last_synced_dsid();
        for dsid in meta.from_seg_id..=meta.to_seg_id {
            if dsid <= synced {
                continue;
            }
            let segment = &shared.segments[slot_for_dsid(dsid, segment_count)];
            debug_assert_eq!(segment.dsid.load(Ordering::Relaxed), dsid);
            let from = if dsid == meta.from_seg_id { meta.from_offset } else { 0 };
            let to = if dsid == meta.to_seg_id {
                meta.to_off
            } else {
                shared.config.segment_size
            };
            debug_assert!(from <= to);
            // SAFETY: the range lies inside the slot's mapping.
            pmem::persist(
                unsafe { segment.base_ptr().add(from as usize) } as *const u8,
                (to - from) as usize,
            );
        }

        shared.mds.write_epoch(&meta, &shared.control)?;
        // Volatile announce; no other thread reads the CB copy directly,
        // which isolates readers from torn persistent writes.
        shared.durable_epoch.store(target.raw(), Ordering::Release);

        self.epoch_head_dsid = self.cur_dsid;
        self.epoch_head_offset = meta.to_off;
        Ok(())
    }
}
