//! Persistence primitive: cache-line flush plus store fence.
//!
//! Stores to a `MAP_SHARED` NVDIMM mapping become durable once their
//! cache lines are flushed and a store fence has retired. Everything in
//! the engine that claims durability funnels through `persist`.

pub const CACHE_LINE: usize = 64;

#[cfg(target_arch = "x86_64")]
pub fn persist(addr: *const u8, len: usize) {
    use std::arch::x86_64::{_mm_clflush, _mm_sfence};

    if len == 0 {
        return;
    }
    let start = addr as usize & !(CACHE_LINE - 1);
    let end = addr as usize + len;
    let mut line = start;
    // SAFETY: clflush only requires the address to be mapped; every caller
    // passes a range inside a live mapping.
    unsafe {
        while line < end {
            _mm_clflush(line as *const u8);
            line += CACHE_LINE;
        }
        _mm_sfence();
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn persist(addr: *const u8, len: usize) {
    // No cache-line flush primitive on this target; a full fence is the
    // closest ordering guarantee available without platform support.
    let _ = (addr, len);
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Copies `len` bytes and persists the destination range.
///
/// # Safety
///
/// `dst` and `src` must be valid for `len` bytes and must not overlap.
pub unsafe fn persist_copy(dst: *mut u8, src: *const u8, len: usize) {
    std::ptr::copy_nonoverlapping(src, dst, len);
    persist(dst as *const u8, len);
}

/// Zeroes `len` bytes and persists the range.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
pub unsafe fn persist_zero(dst: *mut u8, len: usize) {
    std::ptr::write_bytes(dst, 0, len);
    persist(dst as *const u8, len);
}
