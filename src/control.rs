//! Persistent control block on NVDIMM.
//!
//! The control block carries the three numbers that make a crashed engine
//! re-discoverable: the durable epoch and paged MDS epoch (flusher-owned)
//! and the last synced dsid (fsyncer-owned). Each field sits in its own
//! cache line, is written only by the thread that owns its phase, and is
//! persisted immediately after every store.

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::epoch::Epoch;
use crate::mmap::MmapFile;
use crate::pmem;
use crate::{Error, Result};

pub const CB_MAGIC: u32 = 0x4E56_4C47; // 'NVLG'
pub const FORMAT_VERSION: u32 = 1;

#[repr(C, align(64))]
pub struct ControlBlock {
    // Identity, written once at create.
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub config_crc: AtomicU32,
    _pad0: [u8; 48],

    // Flusher-owned durable progress.
    pub durable_epoch: AtomicU64,
    pub paged_mds_epoch: AtomicU64,
    _pad1: [u8; 48],

    // Fsyncer-owned durable progress.
    pub last_synced_dsid: AtomicU64,
    _pad2: [u8; 56],

    // Volatile liveness stamp; never persisted.
    pub flusher_heartbeat_ns: AtomicU64,
    _pad3: [u8; 56],
}

pub struct ControlFile {
    _map: MmapFile,
    ptr: *mut ControlBlock,
}

// SAFETY: ControlFile owns the mapping; all field access goes through
// atomics on the shared block.
unsafe impl Send for ControlFile {}
unsafe impl Sync for ControlFile {}

impl ControlFile {
    pub fn create(path: &Path, resuming: Epoch, config_crc: u32) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let map = MmapFile::create(&tmp_path, size_of::<ControlBlock>())?;
        let ptr = map.as_mut_ptr() as *mut ControlBlock;
        let block = unsafe { &*ptr };
        block.init_state.store(1, Ordering::Relaxed);
        block.version.store(FORMAT_VERSION, Ordering::Relaxed);
        block.config_crc.store(config_crc, Ordering::Relaxed);
        block.durable_epoch.store(resuming.raw(), Ordering::Relaxed);
        block.paged_mds_epoch.store(resuming.raw(), Ordering::Relaxed);
        block.last_synced_dsid.store(0, Ordering::Relaxed);
        block.flusher_heartbeat_ns.store(0, Ordering::Relaxed);
        block.magic.store(CB_MAGIC, Ordering::Relaxed);
        block.init_state.store(2, Ordering::Release);
        pmem::persist(ptr as *const u8, size_of::<ControlBlock>());
        map.sync()?;
        std::fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            crate::layout::fsync_dir(parent)?;
        }
        Ok(Self { _map: map, ptr })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let map = MmapFile::open(path)?;
        if map.len() < size_of::<ControlBlock>() {
            return Err(Error::CorruptMetadata("control block file too small"));
        }
        let ptr = map.as_mut_ptr() as *mut ControlBlock;
        let this = Self { _map: map, ptr };
        let block = this.block();
        if block.init_state.load(Ordering::Acquire) != 2 {
            return Err(Error::CorruptMetadata("control block never finished init"));
        }
        if block.magic.load(Ordering::Acquire) != CB_MAGIC {
            return Err(Error::CorruptMetadata("control block magic mismatch"));
        }
        let version = block.version.load(Ordering::Acquire);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(this)
    }

    pub fn verify_config_crc(&self, expected: u32) -> Result<()> {
        if self.block().config_crc.load(Ordering::Acquire) != expected {
            return Err(Error::Config("engine geometry differs from on-media state"));
        }
        Ok(())
    }

    pub fn block(&self) -> &ControlBlock {
        unsafe { &*self.ptr }
    }

    fn persist_u64(field: &AtomicU64) {
        pmem::persist(field as *const AtomicU64 as *const u8, size_of::<u64>());
    }

    pub fn durable_epoch(&self) -> Epoch {
        Epoch::new(self.block().durable_epoch.load(Ordering::Acquire))
    }

    pub fn set_durable_epoch(&self, epoch: Epoch) {
        let field = &self.block().durable_epoch;
        field.store(epoch.raw(), Ordering::Release);
        Self::persist_u64(field);
    }

    pub fn paged_mds_epoch(&self) -> Epoch {
        Epoch::new(self.block().paged_mds_epoch.load(Ordering::Acquire))
    }

    pub fn set_paged_mds_epoch(&self, epoch: Epoch) {
        let field = &self.block().paged_mds_epoch;
        field.store(epoch.raw(), Ordering::Release);
        Self::persist_u64(field);
    }

    pub fn last_synced_dsid(&self) -> u64 {
        self.block().last_synced_dsid.load(Ordering::Acquire)
    }

    pub fn set_last_synced_dsid(&self, dsid: u64) {
        let field = &self.block().last_synced_dsid;
        field.store(dsid, Ordering::Release);
        Self::persist_u64(field);
    }

    pub fn flusher_heartbeat_ns(&self) -> u64 {
        self.block().flusher_heartbeat_ns.load(Ordering::Relaxed)
    }

    pub fn set_flusher_heartbeat_ns(&self, now_ns: u64) {
        self.block()
            .flusher_heartbeat_ns
            .store(now_ns, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_persists_progress_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nvwal-control");

        let control = ControlFile::create(&path, Epoch::new(7), 0xABCD).expect("create");
        control.set_durable_epoch(Epoch::new(9));
        control.set_paged_mds_epoch(Epoch::new(8));
        control.set_last_synced_dsid(3);
        drop(control);

        let control = ControlFile::open(&path).expect("open");
        control.verify_config_crc(0xABCD).expect("crc matches");
        assert!(control.verify_config_crc(0xABCE).is_err());
        assert_eq!(control.durable_epoch(), Epoch::new(9));
        assert_eq!(control.paged_mds_epoch(), Epoch::new(8));
        assert_eq!(control.last_synced_dsid(), 3);
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nvwal-control");
        std::fs::write(&path, vec![0u8; 64]).expect("write");
        assert!(ControlFile::open(&path).is_err());
    }
}
