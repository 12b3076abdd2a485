use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::{
    page::Page,
    utils::{HandyRwLock, Pod},
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_CACHE_SIZE: usize = 256 * DEFAULT_PAGE_SIZE;

/// Bounded mapping from page address to resident page. Holds at most
/// `cachesize` bytes of page buffers; the extended-key caches are deducted
/// from the same budget by the capacity check.
///
/// Eviction is approximate LRU: every page carries a monotone counter that
/// is refreshed on each hit, and the victim is the unpinned page with the
/// lowest counter. Pinning is decided by the caller (cursor and transaction
/// state live above this layer).
pub(crate) struct PageCache {
    pages: HashMap<u64, Pod<Page>>,
    pagesize: usize,
    cachesize: usize,
    usedsize: usize,
    next_counter: u64,
}

impl PageCache {
    pub fn new(pagesize: usize, cachesize: usize) -> Self {
        Self {
            pages: HashMap::new(),
            pagesize,
            cachesize,
            usedsize: 0,
            next_counter: 0,
        }
    }

    pub fn usedsize(&self) -> usize {
        self.usedsize
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Look up a page; a hit refreshes the page's eviction counter.
    pub fn get(&mut self, addr: u64) -> Option<Pod<Page>> {
        if !self.pages.contains_key(&addr) {
            return None;
        }
        self.next_counter += 1;
        let pod = self.pages.get(&addr)?;
        pod.wl().cache_counter = self.next_counter;
        Some(Arc::clone(pod))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.pages.contains_key(&addr)
    }

    /// Insert a page; a no-op if the address is already resident.
    pub fn put(&mut self, addr: u64, pod: Pod<Page>) {
        if self.pages.contains_key(&addr) {
            return;
        }
        self.next_counter += 1;
        pod.wl().cache_counter = self.next_counter;
        self.usedsize += self.pagesize;
        self.pages.insert(addr, pod);
    }

    /// `true` if one more page fits in the budget, given the bytes the
    /// extended-key caches already claim from it.
    pub fn can_add_page(&self, extkey_used: usize) -> bool {
        self.usedsize + extkey_used + self.pagesize <= self.cachesize
    }

    /// Pick and unlink an eviction victim: the page with the lowest counter
    /// among pages that are not pinned, not delete-pending, and not
    /// referenced outside the cache. Returns `None` when every resident
    /// page is pinned.
    pub fn take_unused<F>(&mut self, is_pinned: F) -> Option<Pod<Page>>
    where
        F: Fn(u64) -> bool,
    {
        let mut victim: Option<(u64, u64)> = None;
        for (addr, pod) in self.pages.iter() {
            if is_pinned(*addr) {
                continue;
            }
            // an Arc held outside the cache means some caller is still
            // working on the page
            if Arc::strong_count(pod) > 1 {
                continue;
            }
            let page = pod.rl();
            if page.delete_pending {
                continue;
            }
            match victim {
                Some((_, counter)) if counter <= page.cache_counter => {}
                _ => victim = Some((*addr, page.cache_counter)),
            }
        }

        let (addr, _) = victim?;
        trace!("evicting page 0x{:x}", addr);
        self.usedsize -= self.pagesize;
        self.pages.remove(&addr)
    }

    /// Unlink a page from the cache tables without releasing its buffer.
    pub fn remove_page(&mut self, addr: u64) -> Option<Pod<Page>> {
        let pod = self.pages.remove(&addr)?;
        self.usedsize -= self.pagesize;
        Some(pod)
    }

    pub fn addrs(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    /// Remove every page; the caller writes dirty ones first.
    pub fn drain(&mut self) -> Vec<Pod<Page>> {
        self.usedsize = 0;
        self.pages.drain().map(|(_, pod)| pod).collect()
    }
}
