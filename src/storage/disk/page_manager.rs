use crate::storage::page::PageId;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Flat file of fixed-size pages, addressed by page index.
///
/// Partition, flag and rotation bits of a [`PageId`] do not take part in
/// addressing; a recycled page overwrites its old slot.
pub struct PageManager {
    file: File,
    page_size: usize,
}

impl PageManager {
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file, page_size })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            bail!(
                "File {:?} of {} bytes is not a multiple of page size {}",
                path,
                len,
                page_size
            );
        }

        Ok(Self { file, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.page_size {
            bail!(
                "Buffer size must be page size ({}), got {}",
                self.page_size,
                buf.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            bail!("Page {} does not exist", page_id);
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    /// Writes one page, growing the file when needed. Call [`sync`] to make
    /// a batch of writes durable.
    ///
    /// [`sync`]: PageManager::sync
    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            bail!(
                "Data size must be page size ({}), got {}",
                self.page_size,
                data.len()
            );
        }

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            let new_size = offset + self.page_size as u64;
            self.file
                .set_len(new_size)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().context("Failed to sync")
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.index() as u64 * self.page_size as u64
    }
}
