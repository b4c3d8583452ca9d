//! File naming under the NVDIMM and block-device roots.

use std::path::{Path, PathBuf};

pub const CONTROL_FILE: &str = "nvwal-control";
pub const NV_SEGMENT_PREFIX: &str = "nvwal-segment-";
pub const DISK_SEGMENT_PREFIX: &str = "nvwal_ds_";
pub const MDS_BUFFER_PREFIX: &str = "mds-nvram-buf-";
pub const MDS_PAGEFILE_PREFIX: &str = "mds-pagefile-";

pub fn control_path(nv_root: &Path) -> PathBuf {
    nv_root.join(CONTROL_FILE)
}

/// NV segment files are per ring slot and reused across recycling.
pub fn nv_segment_path(nv_root: &Path, slot: u32) -> PathBuf {
    nv_root.join(format!("{NV_SEGMENT_PREFIX}{slot}"))
}

pub fn disk_segment_filename(dsid: u64) -> String {
    format!("{DISK_SEGMENT_PREFIX}{dsid:09}")
}

pub fn disk_segment_path(disk_root: &Path, dsid: u64) -> PathBuf {
    disk_root.join(disk_segment_filename(dsid))
}

pub fn mds_buffer_path(nv_root: &Path, slot: u32) -> PathBuf {
    nv_root.join(format!("{MDS_BUFFER_PREFIX}{slot}"))
}

pub fn mds_pagefile_path(disk_root: &Path, slot: u32) -> PathBuf {
    disk_root.join(format!("{MDS_PAGEFILE_PREFIX}{slot}"))
}

/// Returns the dsid encoded in a sealed segment filename, if it is one.
pub fn parse_disk_segment_filename(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(DISK_SEGMENT_PREFIX)?;
    if digits.len() < 9 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Fsyncs a directory so freshly created entries survive a crash.
pub fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_segment_names_are_sortable() {
        assert_eq!(disk_segment_filename(1), "nvwal_ds_000000001");
        assert_eq!(disk_segment_filename(123_456_789), "nvwal_ds_123456789");
        assert!(disk_segment_filename(9) < disk_segment_filename(10));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_disk_segment_filename("nvwal_ds_000000042"), Some(42));
        assert_eq!(parse_disk_segment_filename("nvwal_ds_abc"), None);
        assert_eq!(parse_disk_segment_filename("mds-pagefile-0"), None);
        assert_eq!(parse_disk_segment_filename("nvwal_ds_1"), None);
    }
}
