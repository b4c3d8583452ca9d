//! MDS page-file I/O.
//!
//! Page files hold whole pages at fixed offsets. Only the flusher writes
//! them (via buffer writeback), so positioned writes double as the
//! append discipline; readers use positioned reads on the same handles.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::config::InitMode;
use crate::layout;
use crate::{Error, Result};

use super::PAGEFILE_COUNT;

pub(crate) struct PageFile {
    file: File,
    page_size: u64,
}

impl PageFile {
    fn create(disk_root: &Path, file_no: u32, page_size: u64) -> Result<Self> {
        let path = layout::mds_pagefile_path(disk_root, file_no);
        log::info!("creating metadata page file {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;
        // Make the new dentry itself durable.
        layout::fsync_dir(disk_root)?;
        Ok(Self { file, page_size })
    }

    fn open(disk_root: &Path, file_no: u32, page_size: u64) -> Result<Self> {
        let path = layout::mds_pagefile_path(disk_root, file_no);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let this = Self { file, page_size };
        this.truncate_torn_page()?;
        Ok(this)
    }

    /// A crashed append can leave a partial trailing page; round the file
    /// down to a page multiple.
    fn truncate_torn_page(&self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len % self.page_size != 0 {
            let pages = len / self.page_size;
            log::warn!("truncating torn metadata page ({} -> {} pages)", len, pages);
            self.truncate_pages(pages)?;
        }
        Ok(())
    }

    /// Writes one whole page at its slot and syncs it.
    pub(crate) fn write_page_at(&self, file_page_index: u64, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len() as u64, self.page_size);
        self.file.write_all_at(page, file_page_index * self.page_size)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn truncate_pages(&self, pages: u64) -> Result<()> {
        self.file.set_len(pages * self.page_size)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn num_pages(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        if len % self.page_size != 0 {
            return Err(Error::CorruptMetadata("page file size is not a page multiple"));
        }
        Ok(len / self.page_size)
    }
}

pub(crate) struct MdsIo {
    files: Vec<PageFile>,
}

impl MdsIo {
    pub(crate) fn init(mode: InitMode, disk_root: &Path, page_size: u64) -> Result<(Self, bool)> {
        let existing = (0..PAGEFILE_COUNT)
            .filter(|i| layout::mds_pagefile_path(disk_root, *i).exists())
            .count() as u32;

        if mode != InitMode::CreateTruncate && existing == PAGEFILE_COUNT {
            let files = (0..PAGEFILE_COUNT)
                .map(|i| PageFile::open(disk_root, i, page_size))
                .collect::<Result<Vec<_>>>()?;
            return Ok((Self { files }, true));
        }
        if mode != InitMode::Restart && (mode == InitMode::CreateTruncate || existing == 0) {
            let files = (0..PAGEFILE_COUNT)
                .map(|i| PageFile::create(disk_root, i, page_size))
                .collect::<Result<Vec<_>>>()?;
            return Ok((Self { files }, false));
        }
        Err(Error::CorruptMetadata("metadata page files are incomplete"))
    }

    pub(crate) fn file(&self, file_no: u32) -> &PageFile {
        &self.files[file_no as usize]
    }
}
