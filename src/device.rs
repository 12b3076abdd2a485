use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use log::{debug, trace};
use memmap2::MmapOptions;

use crate::{
    error::{BurrowError, BurrowResult},
    freelist::Freelist,
    io::PagedFile,
    page::{Page, PageBuf},
};

/// The backing store of an environment: a real file, or nothing at all for
/// purely in-memory environments. All page and blob i/o funnels through
/// here, serialized by the environment lock.
pub(crate) enum Device {
    InMemory {
        /// Surrogate page addresses; unique per environment lifetime.
        next_addr: u64,
        /// In-memory blob store; ids come from a monotone counter.
        blobs: HashMap<u64, Bytes>,
        next_blob_id: u64,
    },
    File {
        file: PagedFile,
        mmap: bool,
    },
}

impl Device {
    pub fn create<P: AsRef<Path>>(path: P, mmap: bool) -> BurrowResult<Self> {
        Ok(Device::File {
            file: PagedFile::create(path)?,
            mmap,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, mmap: bool) -> BurrowResult<Self> {
        Ok(Device::File {
            file: PagedFile::open(path)?,
            mmap,
        })
    }

    pub fn in_memory() -> Self {
        Device::InMemory {
            next_addr: 0x1000,
            blobs: HashMap::new(),
            next_blob_id: 0x10,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Device::InMemory { .. })
    }

    pub(crate) fn file(&self) -> BurrowResult<&PagedFile> {
        match self {
            Device::File { file, .. } => Ok(file),
            Device::InMemory { .. } => Err(BurrowError::InternalError),
        }
    }

    /// Read the page at `addr`, either by mapping the file region or by a
    /// positional read into a fresh heap buffer.
    pub fn read_page(&self, addr: u64, pagesize: usize) -> BurrowResult<PageBuf> {
        let (file, mmap) = match self {
            Device::File { file, mmap } => (file, *mmap),
            // in-memory pages live in the cache only; there is nothing to
            // read them back from
            Device::InMemory { .. } => return Err(BurrowError::InternalError),
        };

        if addr + pagesize as u64 > file.len()? {
            return Err(BurrowError::IoError);
        }

        if mmap {
            // SAFETY: the region is owned by this environment and all
            // access to it is serialized by the environment lock.
            let map = unsafe {
                MmapOptions::new()
                    .offset(addr)
                    .len(pagesize)
                    .map_mut(file.inner())
            }
            .map_err(|_| BurrowError::IoError)?;
            trace!("mapped page at 0x{:x}", addr);
            Ok(PageBuf::Mapped(map))
        } else {
            let mut buf = vec![0u8; pagesize];
            file.read_exact_at(&mut buf, addr)?;
            Ok(PageBuf::Heap(buf))
        }
    }

    /// Write the page's persistent buffer back to its `addr`; clears the
    /// dirty flag. Never called for in-memory environments.
    pub fn write_page(&self, page: &mut Page) -> BurrowResult<()> {
        let file = self.file()?;
        match &page.buf {
            PageBuf::Heap(buf) => file.write_all_at(buf, page.addr)?,
            // a mapped page already shares its bytes with the file; flush
            // the region so they reach the disk
            PageBuf::Mapped(map) => map.flush().map_err(|_| BurrowError::IoError)?,
        }
        page.dirty = false;
        Ok(())
    }

    /// Allocate storage for one page: ask the freelist first, otherwise
    /// grow the file by one page. Returns the new page address.
    pub fn alloc_page_addr(
        &mut self,
        freelist: &mut Freelist,
        pagesize: usize,
        ignore_freelist: bool,
    ) -> BurrowResult<u64> {
        match self {
            Device::InMemory { next_addr, .. } => {
                let addr = *next_addr;
                *next_addr += pagesize as u64;
                Ok(addr)
            }
            Device::File { file, .. } => {
                if !ignore_freelist {
                    if let Some(addr) = freelist.alloc_area(pagesize) {
                        debug!("reusing freed page at 0x{:x}", addr);
                        return Ok(addr);
                    }
                }
                // move to the end of the file and grow it by one page
                let addr = file.len()?;
                file.set_len(addr + pagesize as u64)?;
                Ok(addr)
            }
        }
    }

    /// Produce the in-memory buffer for a freshly allocated page. In mmap
    /// mode this maps the newly grown region; otherwise it is a zeroed
    /// heap buffer.
    pub fn new_page_buf(&self, addr: u64, pagesize: usize) -> BurrowResult<PageBuf> {
        match self {
            Device::InMemory { .. } => Ok(PageBuf::Heap(vec![0u8; pagesize])),
            Device::File { mmap, .. } => {
                if *mmap {
                    self.read_page(addr, pagesize)
                } else {
                    Ok(PageBuf::Heap(vec![0u8; pagesize]))
                }
            }
        }
    }

    pub fn sync(&self) -> BurrowResult<()> {
        match self {
            Device::InMemory { .. } => Ok(()),
            Device::File { file, .. } => file.sync(),
        }
    }
}
