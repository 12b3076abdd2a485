use bytes::Bytes;
use log::trace;

use crate::error::{BurrowError, BurrowResult};

pub const EXTKEY_CACHE_BUCKETSIZE: usize = 128;

struct ExtKey {
    blobid: u64,
    data: Bytes,
}

/// Cache for the assembled bodies of extended keys, keyed by the blob id of
/// the key's tail. Hash-bucketed with a fixed power-of-two bucket count; no
/// rehashing ever happens. Its `usedsize` is deducted from the page cache's
/// byte budget.
pub(crate) struct ExtkeyCache {
    buckets: Vec<Vec<ExtKey>>,
    usedsize: usize,
    // test observability: reads served from the cache vs. from the blob
    // store
    hits: u64,
    misses: u64,
}

impl ExtkeyCache {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(EXTKEY_CACHE_BUCKETSIZE);
        buckets.resize_with(EXTKEY_CACHE_BUCKETSIZE, Vec::new);
        Self {
            buckets,
            usedsize: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn bucket_of(&self, blobid: u64) -> usize {
        (blobid & (EXTKEY_CACHE_BUCKETSIZE as u64 - 1)) as usize
    }

    pub fn usedsize(&self) -> usize {
        self.usedsize
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Insert a full key body. Rejected with `CacheFull` when the combined
    /// page-cache and extended-key usage would exceed the cache budget.
    pub fn insert(
        &mut self,
        blobid: u64,
        data: Bytes,
        page_cache_used: usize,
        cachesize: usize,
    ) -> BurrowResult<()> {
        debug_assert!(
            !self.buckets[self.bucket_of(blobid)]
                .iter()
                .any(|e| e.blobid == blobid),
            "extkey (blob id {}) is already in the cache",
            blobid
        );

        if page_cache_used + self.usedsize + data.len() > cachesize {
            return Err(BurrowError::CacheFull);
        }

        trace!("caching extended key for blob 0x{:x}", blobid);
        self.usedsize += data.len();
        let bucket = self.bucket_of(blobid);
        self.buckets[bucket].push(ExtKey { blobid, data });
        Ok(())
    }

    /// Fetch a cached key body. The returned bytes share the cache's
    /// allocation; the caller must not grow or free them.
    pub fn fetch(&mut self, blobid: u64) -> Option<Bytes> {
        let bucket = self.bucket_of(blobid);
        match self.buckets[bucket].iter().find(|e| e.blobid == blobid) {
            Some(e) => {
                self.hits += 1;
                Some(e.data.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Unlink an entry and give its bytes back to the budget.
    pub fn remove(&mut self, blobid: u64) -> BurrowResult<()> {
        let bucket = self.bucket_of(blobid);
        let pos = self.buckets[bucket]
            .iter()
            .position(|e| e.blobid == blobid)
            .ok_or(BurrowError::KeyNotFound)?;
        let e = self.buckets[bucket].remove(pos);
        self.usedsize -= e.data.len();
        Ok(())
    }

    /// Tear the cache down. Every bucket must already be empty: all entries
    /// are scrubbed when their owning leaf pages are released.
    pub fn destroy(&self) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            debug_assert!(bucket.is_empty(), "extended key cache bucket {} is not empty", i);
        }
    }
}
