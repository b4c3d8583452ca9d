//! Engine configuration and init modes.

use std::path::PathBuf;

use crate::epoch::{Epoch, INVALID_EPOCH};
use crate::{Error, Result};

pub const MAX_WRITERS: u32 = 64;
pub const MAX_ACTIVE_SEGMENTS: u64 = 1024;
pub const MAX_PATH_LEN: usize = 512;
pub const DEFAULT_MDS_PAGE_SIZE: u64 = 4096;

/// How `Wal::open` treats existing on-media state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Restart from existing state if present, otherwise create fresh.
    CreateIfNotExists,
    /// Require existing state and recover from it.
    Restart,
    /// The caller has already cleaned up; treat as a fresh create.
    CreateTruncate,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory on the NVDIMM filesystem. Must already exist.
    pub nv_root: PathBuf,
    /// Directory on the block device. Must already exist.
    pub disk_root: PathBuf,
    pub writer_count: u32,
    /// Per-writer ring buffer size in bytes; multiple of 512.
    pub writer_buffer_size: u64,
    /// NV/disk segment size in bytes; multiple of 512.
    pub segment_size: u64,
    /// Total NV bytes for the segment ring; multiple of `segment_size`,
    /// at least two segments.
    pub nv_quota: u64,
    /// MDS page size; zero selects the default.
    pub mds_page_size: u64,
    /// Epoch restored as the durable epoch on a fresh create.
    pub resuming_epoch: Epoch,
}

impl Config {
    pub fn new(nv_root: impl Into<PathBuf>, disk_root: impl Into<PathBuf>) -> Self {
        Self {
            nv_root: nv_root.into(),
            disk_root: disk_root.into(),
            writer_count: 1,
            writer_buffer_size: 1 << 20,
            segment_size: 32 << 20,
            nv_quota: 64 << 20,
            mds_page_size: 0,
            resuming_epoch: INVALID_EPOCH,
        }
    }

    pub(crate) fn validated(mut self) -> Result<Config> {
        for root in [&self.nv_root, &self.disk_root] {
            if root.as_os_str().len() >= MAX_PATH_LEN {
                return Err(Error::Config("root path too long"));
            }
            if !root.is_dir() {
                return Err(Error::Config("root path is not an existing directory"));
            }
        }
        if self.writer_count == 0 || self.writer_count > MAX_WRITERS {
            return Err(Error::Config("writer_count out of range"));
        }
        if self.writer_buffer_size == 0 || self.writer_buffer_size % 512 != 0 {
            return Err(Error::Config("writer_buffer_size must be a non-zero multiple of 512"));
        }
        if self.segment_size == 0 || self.segment_size % 512 != 0 {
            return Err(Error::Config("segment_size must be a non-zero multiple of 512"));
        }
        if self.nv_quota % self.segment_size != 0 {
            return Err(Error::Config("nv_quota must be a multiple of segment_size"));
        }
        if self.nv_quota < 2 * self.segment_size {
            return Err(Error::Config("nv_quota must cover at least two segments"));
        }
        if self.nv_quota > MAX_ACTIVE_SEGMENTS * self.segment_size {
            return Err(Error::Config("nv_quota exceeds the active segment limit"));
        }
        if self.mds_page_size == 0 {
            self.mds_page_size = DEFAULT_MDS_PAGE_SIZE;
        }
        if self.mds_page_size % 512 != 0 {
            return Err(Error::Config("mds_page_size must be a multiple of 512"));
        }
        Ok(self)
    }

    pub(crate) fn segment_count(&self) -> u32 {
        (self.nv_quota / self.segment_size) as u32
    }

    /// CRC over the geometry that dsid and page arithmetic depends on.
    /// Stored in the control block and re-verified at restart.
    pub(crate) fn geometry_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.writer_count.to_le_bytes());
        hasher.update(&self.writer_buffer_size.to_le_bytes());
        hasher.update(&self.segment_size.to_le_bytes());
        hasher.update(&self.segment_count().to_le_bytes());
        hasher.update(&self.mds_page_size.to_le_bytes());
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base(dir: &std::path::Path) -> Config {
        Config::new(dir, dir)
    }

    #[test]
    fn defaults_validate() {
        let dir = tempdir().expect("tempdir");
        let config = base(dir.path()).validated().expect("valid");
        assert_eq!(config.mds_page_size, DEFAULT_MDS_PAGE_SIZE);
        assert_eq!(config.segment_count(), 2);
    }

    #[test]
    fn rejects_bad_geometry() {
        let dir = tempdir().expect("tempdir");

        let mut config = base(dir.path());
        config.writer_buffer_size = 1000;
        assert!(matches!(config.validated(), Err(Error::Config(_))));

        let mut config = base(dir.path());
        config.nv_quota = config.segment_size;
        assert!(matches!(config.validated(), Err(Error::Config(_))));

        let mut config = base(dir.path());
        config.writer_count = MAX_WRITERS + 1;
        assert!(matches!(config.validated(), Err(Error::Config(_))));

        let config = Config::new(dir.path().join("missing"), dir.path());
        assert!(matches!(config.validated(), Err(Error::Config(_))));
    }

    #[test]
    fn geometry_crc_tracks_fields() {
        let dir = tempdir().expect("tempdir");
        let a = base(dir.path()).validated().expect("valid");
        let mut b = a.clone();
        assert_eq!(a.geometry_crc(), b.geometry_crc());
        b.segment_size *= 2;
        b.nv_quota *= 2;
        assert_ne!(a.geometry_crc(), b.geometry_crc());
    }
}
