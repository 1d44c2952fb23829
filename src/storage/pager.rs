//! Disk page manager: one file per tree. Superblock at file slot 0, user
//! pages (ids from 1) at `id * page_size`. Disposed pages form an intrusive
//! freelist threaded through their first four bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::page::Page;

const SUPERBLOCK_MAGIC: [u8; 4] = *b"SLP1";
const OFFSET_MAGIC: usize = 0;
const OFFSET_PAGE_SIZE: usize = 4;
const OFFSET_PAGE_COUNT: usize = 8;
const OFFSET_FREE_HEAD: usize = 12;

/// Smallest page the manager will accept.
pub const MIN_PAGE_SIZE: usize = 64;

/// The distinguished page holding tree-level metadata.
pub const HEADER_PAGE_ID: u32 = 1;

/// Page manager backed by a single file. All tree reads and writes pass
/// through here; read/write counters support the query statistics the
/// harness reports.
pub struct DiskPageManager {
    path: PathBuf,
    file: File,
    page_size: usize,
    page_count: u32,
    free_head: u32,
    reads: u64,
    writes: u64,
}

impl DiskPageManager {
    /// Create a new page file. Overwrites if it exists. The header page is
    /// allocated (zeroed) immediately.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(Error::Format(format!(
                "page size {} below minimum {}",
                page_size, MIN_PAGE_SIZE
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut pager = Self {
            path,
            file,
            page_size,
            page_count: HEADER_PAGE_ID,
            free_head: 0,
            reads: 0,
            writes: 0,
        };
        pager.write_raw(HEADER_PAGE_ID, &vec![0u8; page_size])?;
        pager.write_superblock()?;
        Ok(pager)
    }

    /// Open an existing page file, validating the superblock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut head = [0u8; 16];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head)?;
        if head[OFFSET_MAGIC..OFFSET_MAGIC + 4] != SUPERBLOCK_MAGIC {
            return Err(Error::Format("bad page file magic".into()));
        }
        let page_size =
            u32::from_le_bytes(head[OFFSET_PAGE_SIZE..OFFSET_PAGE_SIZE + 4].try_into().unwrap())
                as usize;
        let page_count =
            u32::from_le_bytes(head[OFFSET_PAGE_COUNT..OFFSET_PAGE_COUNT + 4].try_into().unwrap());
        let free_head =
            u32::from_le_bytes(head[OFFSET_FREE_HEAD..OFFSET_FREE_HEAD + 4].try_into().unwrap());
        if page_size < MIN_PAGE_SIZE {
            return Err(Error::Format(format!("bad page size {}", page_size)));
        }
        let len = file.metadata()?.len();
        let expected = (page_count as u64 + 1) * page_size as u64;
        if len != expected {
            return Err(Error::Format(format!(
                "page file length {} does not match {} pages of {} bytes",
                len, page_count, page_size
            )));
        }
        Ok(Self {
            path,
            file,
            page_size,
            page_count,
            free_head,
            reads: 0,
            writes: 0,
        })
    }

    /// Fetch a page from disk.
    pub fn get_page(&mut self, id: u32) -> Result<Page> {
        if id == 0 || id > self.page_count {
            return Err(Error::Invariant(format!("page id {} out of range", id)));
        }
        let mut page = Page::new(id, self.page_size);
        self.file
            .seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
        self.file.read_exact(page.data_mut())?;
        self.reads += 1;
        Ok(page)
    }

    /// Fetch the distinguished header page. Not counted in the read
    /// statistics: the tree holds it for its whole lifetime.
    pub fn get_header_page(&mut self) -> Result<Page> {
        let mut page = Page::new(HEADER_PAGE_ID, self.page_size);
        self.file
            .seek(SeekFrom::Start(HEADER_PAGE_ID as u64 * self.page_size as u64))?;
        self.file.read_exact(page.data_mut())?;
        Ok(page)
    }

    /// Allocate a page: reuse the freelist head if any, else extend the
    /// file. The returned page is zeroed with a fresh non-zero id.
    pub fn new_page(&mut self) -> Result<Page> {
        let id = if self.free_head != 0 {
            let id = self.free_head;
            let mut next = [0u8; 4];
            self.file
                .seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
            self.file.read_exact(&mut next)?;
            self.free_head = u32::from_le_bytes(next);
            id
        } else {
            self.page_count += 1;
            let id = self.page_count;
            self.write_raw(id, &vec![0u8; self.page_size])?;
            id
        };
        self.write_superblock()?;
        Ok(Page::new(id, self.page_size))
    }

    /// Force write-through of a page.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        if page.id() == 0 || page.id() > self.page_count {
            return Err(Error::Invariant(format!("page id {} out of range", page.id())));
        }
        self.write_raw(page.id(), page.data())?;
        self.writes += 1;
        Ok(())
    }

    /// Return a page to the pool; a dirty page is persisted first.
    pub fn release_page(&mut self, page: Page, dirty: bool) -> Result<()> {
        if dirty {
            self.write_page(&page)?;
        }
        Ok(())
    }

    /// Return a page to the freelist for later reuse.
    pub fn dispose_page(&mut self, id: u32) -> Result<()> {
        if id == 0 || id == HEADER_PAGE_ID || id > self.page_count {
            return Err(Error::Invariant(format!("cannot dispose page {}", id)));
        }
        self.file
            .seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
        self.file.write_all(&self.free_head.to_le_bytes())?;
        self.free_head = id;
        self.write_superblock()
    }

    /// Lower bound on the page size usable by the tree.
    pub fn min_page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True while no pages beyond the header page exist.
    pub fn is_empty(&self) -> bool {
        self.page_count <= HEADER_PAGE_ID
    }

    pub fn reset_statistics(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    pub fn read_count(&self) -> u64 {
        self.reads
    }

    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the superblock and sync the file.
    pub fn flush(&mut self) -> Result<()> {
        self.write_superblock()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_superblock(&mut self) -> Result<()> {
        let mut block = vec![0u8; self.page_size];
        block[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(&SUPERBLOCK_MAGIC);
        block[OFFSET_PAGE_SIZE..OFFSET_PAGE_SIZE + 4]
            .copy_from_slice(&(self.page_size as u32).to_le_bytes());
        block[OFFSET_PAGE_COUNT..OFFSET_PAGE_COUNT + 4]
            .copy_from_slice(&self.page_count.to_le_bytes());
        block[OFFSET_FREE_HEAD..OFFSET_FREE_HEAD + 4]
            .copy_from_slice(&self.free_head.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    fn write_raw(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }
}
