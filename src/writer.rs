//! Writer ingest: per-writer ring buffers and epoch frames.
//!
//! Each writer owns a private circular byte buffer and a small ring of
//! epoch frames describing which `[head, tail)` range belongs to which
//! epoch. The client thread is the only producer, the flusher the only
//! consumer, so the hot path is a pointer bump and two release stores,
//! no locks, no cross-writer coordination.
//!
//! Frames are claimed and retired in FIFO order. Both sides count frames
//! monotonically (`created` on the handle, `retired` on the shared
//! state); a frame's slot is its count modulo [`EPOCH_FRAME_COUNT`], so
//! live frames always occupy consecutive slots holding strictly
//! increasing epochs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::circular;
use crate::epoch::Epoch;

/// Frames per writer; bounds how many epochs a writer may hold unflushed
/// bytes for at once.
pub const EPOCH_FRAME_COUNT: usize = 5;

/// One epoch's byte range inside a writer buffer.
///
/// `log_epoch == 0` marks the frame unused. The writer release-stores the
/// offsets before publishing the epoch, so a flusher that observes a live
/// epoch always sees consistent offsets.
#[derive(Default)]
pub struct EpochFrame {
    pub log_epoch: AtomicU64,
    /// Last byte the flusher has copied out.
    pub head_offset: AtomicU64,
    /// Last byte the writer has filled.
    pub tail_offset: AtomicU64,
}

pub(crate) struct RingBuffer {
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: byte ranges are partitioned by the head/tail protocol: the
// writer only stores into the free region past `tail`, the flusher only
// loads from `[head, tail)`.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn new(size: u64) -> Self {
        let data = (0..size).map(|_| UnsafeCell::new(0u8)).collect();
        Self { data }
    }

    pub(crate) fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }
}

/// The flusher-visible half of a writer.
pub struct WriterShared {
    pub(crate) buffer: RingBuffer,
    pub(crate) frames: [EpochFrame; EPOCH_FRAME_COUNT],
    /// Monotonic count of frames the flusher has retired.
    pub(crate) retired_frames: AtomicU64,
}

impl WriterShared {
    pub(crate) fn new(buffer_size: u64) -> Self {
        Self {
            buffer: RingBuffer::new(buffer_size),
            frames: std::array::from_fn(|_| EpochFrame::default()),
            retired_frames: AtomicU64::new(0),
        }
    }

    pub(crate) fn buffer_size(&self) -> u64 {
        self.buffer.size()
    }

    pub(crate) fn frame(&self, count: u64) -> &EpochFrame {
        &self.frames[(count % EPOCH_FRAME_COUNT as u64) as usize]
    }
}

/// Client-side writer handle; exactly one per writer id.
pub struct WriterHandle {
    shared: Arc<WriterShared>,
    /// Monotonic count of frames this writer has created.
    created_frames: u64,
    /// Cached tail of the active frame for fast client writes.
    last_tail_offset: u64,
}

impl WriterHandle {
    pub(crate) fn new(shared: Arc<WriterShared>) -> Self {
        Self {
            shared,
            created_frames: 0,
            last_tail_offset: 0,
        }
    }

    /// True while at most half the buffer holds unflushed bytes. The
    /// half-buffer threshold keeps headroom for bursts and bounds the
    /// flusher's worst-case catch-up work. Callers must back off on
    /// `false`; `on_write` assumes space.
    pub fn has_enough_space(&self) -> bool {
        let shared = &self.shared;
        let size = shared.buffer.size();
        let retired = shared.retired_frames.load(Ordering::Acquire);
        let mut consumed = 0;
        for count in retired..self.created_frames {
            let frame = shared.frame(count);
            if frame.log_epoch.load(Ordering::Acquire) == 0 {
                // Retired under us; the next frame bounds the range.
                continue;
            }
            let head = frame.head_offset.load(Ordering::Acquire);
            consumed = circular::distance(head, self.last_tail_offset, size);
            break;
        }
        consumed * 2 <= size
    }

    /// Publishes `bytes_written` bytes the caller already copied into the
    /// buffer at the current tail, attributed to `log_epoch`.
    ///
    /// # Panics
    ///
    /// Epochs must be valid and non-decreasing, the in-flight epoch limit
    /// must hold, and the caller must have respected `has_enough_space`;
    /// violations are programmer errors and fail hard.
    pub fn on_write(&mut self, bytes_written: u64, log_epoch: Epoch) {
        assert!(log_epoch.is_valid(), "invalid log epoch");
        let size = self.shared.buffer.size();
        assert!(bytes_written < size, "write larger than the writer buffer");

        let idx = self.assure_active_frame(log_epoch);
        let frame = &self.shared.frames[idx];
        let head = frame.head_offset.load(Ordering::Acquire);
        let pending = circular::distance(head, self.last_tail_offset, size);
        assert!(
            pending + bytes_written < size,
            "writer ring buffer overrun; has_enough_space was not respected"
        );

        let new_tail = circular::wrap_offset(self.last_tail_offset + bytes_written, size);
        frame.tail_offset.store(new_tail, Ordering::Release);
        self.last_tail_offset = new_tail;
    }

    /// Copies `payload` into the ring at the current tail and publishes
    /// it, handling the wrap. Convenience over the raw
    /// fill-then-`on_write` protocol.
    pub fn append(&mut self, payload: &[u8], log_epoch: Epoch) {
        let size = self.shared.buffer.size();
        assert!(
            (payload.len() as u64) < size,
            "payload larger than the writer buffer"
        );
        // SAFETY: the destination range past `tail` is free space owned by
        // this writer; `on_write` republishes the tail afterwards.
        unsafe {
            circular::copy_into_ring(
                self.shared.buffer.as_ptr(),
                size,
                self.last_tail_offset,
                payload.as_ptr(),
                payload.len() as u64,
            );
        }
        self.on_write(payload.len() as u64, log_epoch);
    }

    /// Makes the active frame match `log_epoch`, creating one if needed.
    /// Returns the frame's slot index.
    fn assure_active_frame(&mut self, log_epoch: Epoch) -> usize {
        let shared = &self.shared;
        let retired = shared.retired_frames.load(Ordering::Acquire);
        if self.created_frames > retired {
            let idx = ((self.created_frames - 1) % EPOCH_FRAME_COUNT as u64) as usize;
            let frame = &shared.frames[idx];
            let cur = Epoch::new(frame.log_epoch.load(Ordering::Relaxed));
            if cur == log_epoch {
                return idx;
            }
            if cur.is_valid() {
                assert!(log_epoch.after(cur), "log epoch went backwards");
            }
        }

        assert!(
            self.created_frames - shared.retired_frames.load(Ordering::Acquire)
                < EPOCH_FRAME_COUNT as u64,
            "writer exceeded the in-flight epoch limit"
        );
        let idx = (self.created_frames % EPOCH_FRAME_COUNT as u64) as usize;
        let frame = &shared.frames[idx];
        debug_assert_eq!(frame.log_epoch.load(Ordering::Acquire), 0);
        frame.head_offset.store(self.last_tail_offset, Ordering::Release);
        frame.tail_offset.store(self.last_tail_offset, Ordering::Release);
        frame.log_epoch.store(log_epoch.raw(), Ordering::Release);
        self.created_frames += 1;
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(buffer_size: u64) -> WriterHandle {
        WriterHandle::new(Arc::new(WriterShared::new(buffer_size)))
    }

    /// Flusher-side retirement, reduced to what the writer observes.
    fn retire_oldest(shared: &WriterShared) {
        let retired = shared.retired_frames.load(Ordering::Acquire);
        let frame = shared.frame(retired);
        frame.head_offset.store(0, Ordering::Relaxed);
        frame.tail_offset.store(0, Ordering::Relaxed);
        frame.log_epoch.store(0, Ordering::Release);
        shared.retired_frames.store(retired + 1, Ordering::Release);
    }

    #[test]
    fn append_tracks_frames_and_tail() {
        let mut writer = handle(1024);
        writer.append(&[1u8; 100], Epoch::new(1));
        writer.append(&[2u8; 50], Epoch::new(1));
        let frame = &writer.shared.frames[0];
        assert_eq!(frame.log_epoch.load(Ordering::Relaxed), 1);
        assert_eq!(frame.head_offset.load(Ordering::Relaxed), 0);
        assert_eq!(frame.tail_offset.load(Ordering::Relaxed), 150);

        writer.append(&[3u8; 10], Epoch::new(2));
        let frame = &writer.shared.frames[1];
        assert_eq!(frame.log_epoch.load(Ordering::Relaxed), 2);
        assert_eq!(frame.head_offset.load(Ordering::Relaxed), 150);
        assert_eq!(frame.tail_offset.load(Ordering::Relaxed), 160);
    }

    #[test]
    fn space_check_uses_oldest_live_frame() {
        let mut writer = handle(1024);
        assert!(writer.has_enough_space());
        writer.append(&[0u8; 500], Epoch::new(1));
        assert!(writer.has_enough_space());
        writer.append(&[0u8; 100], Epoch::new(2));
        assert!(!writer.has_enough_space());

        // Retiring the oldest frame releases its bytes.
        retire_oldest(&writer.shared);
        assert!(writer.has_enough_space());
    }

    #[test]
    fn new_frame_reclaims_retired_slots() {
        let mut writer = handle(1024);
        for raw in 1..=4u64 {
            writer.append(&[0u8; 8], Epoch::new(raw));
        }
        for _ in 0..4 {
            retire_oldest(&writer.shared);
        }
        // Slots wrap: epoch 5 lands on slot 4, epoch 6 back on slot 0.
        writer.append(&[0u8; 8], Epoch::new(5));
        writer.append(&[0u8; 8], Epoch::new(6));
        assert_eq!(writer.shared.frames[4].log_epoch.load(Ordering::Relaxed), 5);
        assert_eq!(writer.shared.frames[0].log_epoch.load(Ordering::Relaxed), 6);
    }

    #[test]
    #[should_panic(expected = "in-flight epoch limit")]
    fn too_many_unsealed_epochs_is_fatal() {
        let mut writer = handle(1024);
        for raw in 1..=6u64 {
            writer.append(&[0u8; 8], Epoch::new(raw));
        }
    }

    #[test]
    #[should_panic(expected = "went backwards")]
    fn epoch_regression_is_fatal() {
        let mut writer = handle(1024);
        writer.append(&[0u8; 8], Epoch::new(5));
        writer.append(&[0u8; 8], Epoch::new(3));
    }
}
