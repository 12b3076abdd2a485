use bytes::Bytes;
use log::trace;

use crate::{
    device::Device,
    error::{BurrowError, BurrowResult},
    freelist::Freelist,
    io::{get_u32, put_u32},
    page::PageType,
};

/// Offset of the blob header within its first page; the page's own header
/// (type tag) comes first.
const BLOB_PAGE_HEADER: usize = 8;
/// `{size: u32, flags: u32}` precede the payload bytes.
const BLOB_HEADER: usize = 8;

// Blobs hold extended-key tails, records and duplicate tables. On disk a
// blob occupies a run of dedicated pages and is addressed by the file
// offset of its header; i/o is positional and bypasses the page cache. In
// in-memory environments blobs live in a map keyed by a monotone id.
impl Device {
    pub(crate) fn blob_alloc(
        &mut self,
        freelist: &mut Freelist,
        pagesize: usize,
        data: &[u8],
        flags: u32,
    ) -> BurrowResult<u64> {
        match self {
            Device::InMemory {
                blobs, next_blob_id, ..
            } => {
                let id = *next_blob_id;
                *next_blob_id += 1;
                blobs.insert(id, Bytes::copy_from_slice(data));
                Ok(id)
            }
            Device::File { file, .. } => {
                let total = BLOB_PAGE_HEADER + BLOB_HEADER + data.len();
                let npages = (total + pagesize - 1) / pagesize;

                // single-page blobs can recycle a freed page; longer runs
                // must be contiguous, so they always extend the file
                let page_addr = if npages == 1 {
                    match freelist.alloc_area(pagesize) {
                        Some(addr) => addr,
                        None => {
                            let addr = file.len()?;
                            file.set_len(addr + pagesize as u64)?;
                            addr
                        }
                    }
                } else {
                    let addr = file.len()?;
                    file.set_len(addr + (npages * pagesize) as u64)?;
                    addr
                };

                let mut buf = vec![0u8; BLOB_PAGE_HEADER + BLOB_HEADER + data.len()];
                buf[0] = PageType::Blob as u8;
                put_u32(&mut buf, BLOB_PAGE_HEADER, data.len() as u32);
                put_u32(&mut buf, BLOB_PAGE_HEADER + 4, flags);
                buf[BLOB_PAGE_HEADER + BLOB_HEADER..].copy_from_slice(data);
                file.write_all_at(&buf, page_addr)?;

                let id = page_addr + BLOB_PAGE_HEADER as u64;
                trace!("allocated blob 0x{:x}, {} bytes", id, data.len());
                Ok(id)
            }
        }
    }

    pub(crate) fn blob_read(&self, id: u64) -> BurrowResult<Bytes> {
        match self {
            Device::InMemory { blobs, .. } => {
                blobs.get(&id).cloned().ok_or(BurrowError::KeyNotFound)
            }
            Device::File { file, .. } => {
                let mut header = [0u8; BLOB_HEADER];
                file.read_exact_at(&mut header, id)?;
                let size = get_u32(&header, 0) as usize;

                let mut data = vec![0u8; size];
                file.read_exact_at(&mut data, id + BLOB_HEADER as u64)?;
                Ok(Bytes::from(data))
            }
        }
    }

    /// Release a blob's storage; its pages go back to the freelist.
    pub(crate) fn blob_free(
        &mut self,
        freelist: &mut Freelist,
        pagesize: usize,
        id: u64,
    ) -> BurrowResult<()> {
        match self {
            Device::InMemory { blobs, .. } => {
                blobs.remove(&id);
                Ok(())
            }
            Device::File { file, .. } => {
                let mut header = [0u8; BLOB_HEADER];
                file.read_exact_at(&mut header, id)?;
                let size = get_u32(&header, 0) as usize;

                let page_addr = id - BLOB_PAGE_HEADER as u64;
                let total = BLOB_PAGE_HEADER + BLOB_HEADER + size;
                let npages = (total + pagesize - 1) / pagesize;
                for i in 0..npages {
                    freelist.free_area(page_addr + (i * pagesize) as u64);
                }
                trace!("freed blob 0x{:x}, {} pages", id, npages);
                Ok(())
            }
        }
    }
}
