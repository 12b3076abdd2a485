use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::{debug, warn};

use crate::{
    btree::{node, SeekResult},
    cursor::{Cursor, CursorState, LastOp},
    device::Device,
    dupecache::{apply_txn_ops, DupeCache, DupeCacheLine},
    error::{BurrowError, BurrowResult},
    flags::{CursorHalf, EnvFlags, InsertFlags},
    freelist::Freelist,
    key::{
        default_compare, BtKey, CompareFunc, PrefixCompareFunc, Record, KEY_IS_EXTENDED,
    },
    page::{Page, PageType},
    page_cache::{PageCache, DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SIZE},
    txn::{DupPosition, Transaction, TxnOpKind, TxnState},
    utils::{HandyRwLock, Pod},
};

pub const DEFAULT_KEY_SIZE: u16 = 32;
/// An extended key needs room for the 8-byte blob id plus some prefix.
pub const MIN_KEY_SIZE: u16 = 12;
pub const MAX_DATABASES: usize = 16;

const HEADER_MAGIC: [u8; 4] = *b"BRW1";
const FORMAT_VERSION: u16 = 1;
const ENDIAN_LITTLE: u8 = 1;
/// Fixed prelude before the database-name table.
const HEADER_TABLE_OFF: usize = 24;
const HEADER_ENTRY_SIZE: usize = 16;

/// Per-database state owned by the environment.
pub(crate) struct DbState {
    pub name: u16,
    pub flags: u32,
    pub keysize: u16,
    /// Address of the btree root page; 0 while the database is empty.
    pub root: u64,
    pub open: bool,
    pub compare: CompareFunc,
    pub prefix_compare: Option<PrefixCompareFunc>,
    pub extkeys: crate::extkey::ExtkeyCache,
}

impl DbState {
    fn new(name: u16, keysize: u16) -> Self {
        Self {
            name,
            flags: 0,
            keysize,
            root: 0,
            open: false,
            compare: default_compare,
            prefix_compare: None,
            extkeys: crate::extkey::ExtkeyCache::new(),
        }
    }
}

/// The whole engine state behind one lock. Every public handle clones the
/// `Pod` and takes the write lock for the duration of a call.
pub(crate) struct EnvInner {
    pub flags: EnvFlags,
    pub pagesize: usize,
    pub cachesize: usize,
    pub device: Device,
    pub freelist: Freelist,
    pub cache: PageCache,
    /// Databases keyed by a stable internal id; the public u16 name is an
    /// attribute (it can change under `rename_db` while handles stay
    /// valid).
    pub dbs: HashMap<u16, DbState>,
    /// Creation order of db ids; drives the header table and
    /// `get_database_names`.
    pub db_order: Vec<u16>,
    pub next_db_id: u16,
    pub txn: Option<TxnState>,
    pub next_txn_id: u64,
    pub cursors: HashMap<u64, CursorState>,
    pub next_cursor_id: u64,
    /// Cursors whose btree half sits on a page, keyed by page address.
    /// Doubles as the pin table for eviction and as the invalidation list
    /// for erases.
    pub cursors_on_page: HashMap<u64, Vec<u64>>,
    pub header_dirty: bool,
    pub open: bool,
}

impl EnvInner {
    // ------------------------------------------------------------------
    // header page
    // ------------------------------------------------------------------

    fn write_header(&mut self) -> BurrowResult<()> {
        if self.device.is_in_memory() {
            self.header_dirty = false;
            return Ok(());
        }
        let mut buf = vec![0u8; self.pagesize];
        buf[0] = PageType::Header as u8;
        buf[1..5].copy_from_slice(&HEADER_MAGIC);
        crate::io::put_u16(&mut buf, 5, FORMAT_VERSION);
        buf[7] = ENDIAN_LITTLE;
        crate::io::put_u32(&mut buf, 8, self.pagesize as u32);
        crate::io::put_u64(&mut buf, 12, self.cachesize as u64);
        crate::io::put_u16(&mut buf, 20, self.db_order.len() as u16);
        for (i, id) in self.db_order.iter().enumerate() {
            let state = self.dbs.get(id).ok_or(BurrowError::InternalError)?;
            let off = HEADER_TABLE_OFF + i * HEADER_ENTRY_SIZE;
            crate::io::put_u16(&mut buf, off, state.name);
            crate::io::put_u32(&mut buf, off + 2, state.flags);
            crate::io::put_u16(&mut buf, off + 6, state.keysize);
            crate::io::put_u64(&mut buf, off + 8, state.root);
        }
        self.device.file()?.write_all_at(&buf, 0)?;
        self.header_dirty = false;
        Ok(())
    }

    fn read_header(&mut self) -> BurrowResult<()> {
        let file = self.device.file()?;
        let mut prelude = [0u8; HEADER_TABLE_OFF];
        file.read_exact_at(&mut prelude, 0)?;
        if prelude[0] != PageType::Header as u8 || prelude[1..5] != HEADER_MAGIC {
            return Err(BurrowError::InvalidParameter);
        }
        if crate::io::get_u16(&prelude, 5) != FORMAT_VERSION {
            return Err(BurrowError::InvalidParameter);
        }
        if prelude[7] != ENDIAN_LITTLE {
            return Err(BurrowError::InvalidParameter);
        }
        self.pagesize = crate::io::get_u32(&prelude, 8) as usize;
        if self.cachesize == 0 {
            self.cachesize = crate::io::get_u64(&prelude, 12) as usize;
        }

        let mut buf = vec![0u8; self.pagesize];
        self.device.file()?.read_exact_at(&mut buf, 0)?;
        let count = crate::io::get_u16(&buf, 20) as usize;
        if count > MAX_DATABASES {
            return Err(BurrowError::InvalidParameter);
        }
        for i in 0..count {
            let off = HEADER_TABLE_OFF + i * HEADER_ENTRY_SIZE;
            let name = crate::io::get_u16(&buf, off);
            let mut state = DbState::new(name, crate::io::get_u16(&buf, off + 6));
            state.flags = crate::io::get_u32(&buf, off + 2);
            state.root = crate::io::get_u64(&buf, off + 8);
            let id = self.next_db_id;
            self.next_db_id += 1;
            self.dbs.insert(id, state);
            self.db_order.push(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // page management
    // ------------------------------------------------------------------

    pub(crate) fn total_extkey_used(&self) -> usize {
        self.dbs.values().map(|d| d.extkeys.usedsize()).sum()
    }

    fn txn_add_page(&mut self, addr: u64) {
        if let Some(txn) = self.txn.as_mut() {
            txn.pages.insert(addr);
        }
    }

    /// Evict until one more page fits the budget. In-memory environments
    /// never evict (their page buffers are the only copy of the data), so
    /// a full cache is final for them.
    fn make_room(&mut self) -> BurrowResult<()> {
        let extkey_used = self.total_extkey_used();
        if self.cache.can_add_page(extkey_used) {
            return Ok(());
        }
        if self.device.is_in_memory() {
            return Err(BurrowError::CacheFull);
        }

        let mut pinned: HashSet<u64> = self
            .cursors_on_page
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(addr, _)| *addr)
            .collect();
        if let Some(txn) = &self.txn {
            pinned.extend(txn.pages.iter().copied());
        }

        while !self.cache.can_add_page(self.total_extkey_used()) {
            let pod = self
                .cache
                .take_unused(|addr| pinned.contains(&addr))
                .ok_or(BurrowError::CacheFull)?;
            self.release_page_pod(pod)?;
        }
        Ok(())
    }

    /// Write back and tear down an evicted page: dirty pages hit the disk
    /// first, then the extended keys of the leaf are scrubbed, then the
    /// buffer is released per its mode.
    fn release_page_pod(&mut self, pod: Pod<Page>) -> BurrowResult<()> {
        let mut page = match Arc::try_unwrap(pod) {
            Ok(lock) => lock.into_inner().map_err(|_| BurrowError::InternalError)?,
            Err(pod) => {
                // somebody still holds the frame; put it back instead of
                // releasing bytes under them
                let addr = pod.rl().addr;
                self.cache.put(addr, pod);
                return Err(BurrowError::CacheFull);
            }
        };
        if page.dirty && !page.delete_pending && !self.device.is_in_memory() {
            self.device.write_page(&mut page)?;
        }
        self.scrub_extkeys_on_release(&page);
        Ok(())
    }

    /// Drop the extended-key cache entries of a leaf page that is leaving
    /// memory; the cache must only ever describe resident pages.
    fn scrub_extkeys_on_release(&mut self, page: &Page) {
        if !page.page_type.is_btree() {
            return;
        }
        let state = match self.dbs.get_mut(&page.db) {
            Some(state) => state,
            None => return,
        };
        let ks = state.keysize as usize;
        let bytes = page.bytes();
        if !node::is_leaf(bytes) {
            return;
        }
        for slot in 0..node::count(bytes) {
            if node::entry_flags(bytes, slot, ks) & KEY_IS_EXTENDED != 0 {
                let key = node::read_key(bytes, slot, ks);
                let _ = state.extkeys.remove(key.tail_blobid(ks));
            }
        }
    }

    /// Fetch a page through the cache, reading it from the device on a
    /// miss. Pages touched while a transaction is active join its working
    /// set and stay pinned until it ends.
    pub(crate) fn fetch_page(&mut self, addr: u64, db: u16) -> BurrowResult<Pod<Page>> {
        if let Some(pod) = self.cache.get(addr) {
            self.txn_add_page(addr);
            return Ok(pod);
        }
        self.make_room()?;
        let buf = self.device.read_page(addr, self.pagesize)?;
        let page_type = PageType::from_u8(buf.bytes()[0]);
        let mut page = Page::new(addr, page_type, buf);
        page.db = db;
        let pod = Arc::new(RwLock::new(page));
        self.cache.put(addr, Arc::clone(&pod));
        self.txn_add_page(addr);
        Ok(pod)
    }

    /// Allocate a fresh btree page: storage from the freelist or the end
    /// of the file, a zeroed node header, and a slot in the cache.
    pub(crate) fn alloc_btree_page(
        &mut self,
        db: u16,
        page_type: PageType,
        level: u8,
    ) -> BurrowResult<Pod<Page>> {
        self.make_room()?;
        let ignore_freelist = self.flags.contains(EnvFlags::IGNORE_FREELIST);
        let pagesize = self.pagesize;
        let addr = self
            .device
            .alloc_page_addr(&mut self.freelist, pagesize, ignore_freelist)?;
        let mut buf = self.device.new_page_buf(addr, pagesize)?;
        {
            let bytes = buf.bytes_mut();
            bytes[..node::NODE_HEADER].fill(0);
            bytes[0] = page_type as u8;
            node::init(bytes, level);
        }
        let mut page = Page::new(addr, page_type, buf);
        page.db = db;
        page.dirty = true;
        let pod = Arc::new(RwLock::new(page));
        self.cache.put(addr, Arc::clone(&pod));
        self.txn_add_page(addr);
        debug!("allocated {:?} page at 0x{:x}", page_type, addr);
        Ok(pod)
    }

    /// Release a page for good: scrub its extended keys, mark it
    /// delete-pending (it must never be written again), unlink it from the
    /// cache and recycle its storage.
    pub(crate) fn free_page(&mut self, addr: u64) -> BurrowResult<()> {
        self.cursors_invalidate_page(addr);
        if let Some(pod) = self.cache.remove_page(addr) {
            {
                let mut guard = pod.wl();
                debug_assert!(
                    !guard.delete_pending,
                    "deleting page 0x{:x} which is already deleted",
                    addr
                );
                guard.delete_pending = true;
            }
            {
                let guard = pod.rl();
                self.scrub_extkeys_on_release(&*guard);
            }
        }
        if let Some(txn) = self.txn.as_mut() {
            txn.pages.remove(&addr);
        }
        if !self.device.is_in_memory() {
            self.freelist.free_area(addr);
        }
        debug!("freed page 0x{:x}", addr);
        Ok(())
    }

    /// Write-through hook: with `WRITE_THROUGH` a dirty page is flushed as
    /// soon as the mutating operation releases it.
    pub(crate) fn flush_page_pod(&mut self, pod: &Pod<Page>) -> BurrowResult<()> {
        if !self.flags.contains(EnvFlags::WRITE_THROUGH) || self.device.is_in_memory() {
            return Ok(());
        }
        let mut guard = pod.wl();
        if guard.dirty && !guard.delete_pending {
            self.device.write_page(&mut *guard)?;
        }
        Ok(())
    }

    /// Write every dirty page, keep everything resident.
    fn flush_all_pages(&mut self) -> BurrowResult<()> {
        if self.device.is_in_memory() {
            return Ok(());
        }
        for addr in self.cache.addrs() {
            if let Some(pod) = self.cache.get(addr) {
                let mut guard = pod.wl();
                if guard.dirty && !guard.delete_pending {
                    self.device.write_page(&mut *guard)?;
                }
            }
        }
        Ok(())
    }

    /// Write every dirty page and release all buffers; used on close.
    fn flush_and_delete(&mut self) -> BurrowResult<()> {
        let in_memory = self.device.is_in_memory();
        for pod in self.cache.drain() {
            match Arc::try_unwrap(pod) {
                Ok(lock) => {
                    let mut page = lock.into_inner().map_err(|_| BurrowError::InternalError)?;
                    if page.dirty && !page.delete_pending && !in_memory {
                        self.device.write_page(&mut page)?;
                    }
                    self.scrub_extkeys_on_release(&page);
                }
                Err(pod) => {
                    let mut guard = pod.wl();
                    if guard.dirty && !guard.delete_pending && !in_memory {
                        self.device.write_page(&mut *guard)?;
                    }
                    drop(guard);
                    let guard = pod.rl();
                    self.scrub_extkeys_on_release(&*guard);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // blob plumbing
    // ------------------------------------------------------------------

    pub(crate) fn blob_alloc(&mut self, data: &[u8]) -> BurrowResult<u64> {
        let pagesize = self.pagesize;
        self.device
            .blob_alloc(&mut self.freelist, pagesize, data, 0)
    }

    pub(crate) fn blob_read(&self, id: u64) -> BurrowResult<Bytes> {
        self.device.blob_read(id)
    }

    pub(crate) fn blob_free(&mut self, id: u64) -> BurrowResult<()> {
        let pagesize = self.pagesize;
        self.device.blob_free(&mut self.freelist, pagesize, id)
    }

    // ------------------------------------------------------------------
    // merged (txn + btree) views
    // ------------------------------------------------------------------

    fn txn_is_live(&self, txn_id: Option<u64>) -> BurrowResult<bool> {
        match txn_id {
            None => Ok(false),
            Some(id) => match &self.txn {
                Some(txn) if txn.id == id => Ok(true),
                // the handle outlived its transaction
                _ => Err(BurrowError::InvalidParameter),
            },
        }
    }

    fn merged_lines(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> BurrowResult<(DupeCache, Option<crate::btree::BtPos>)> {
        let mut cache = DupeCache::new();
        let pos = match self.btree_seek(db, &BtKey::from_user(key))? {
            SeekResult::Found(pos) => {
                let n = self.btree_dup_rids(db, &pos)?.len();
                for i in 0..n {
                    cache.append(DupeCacheLine::Btree(i as u64));
                }
                Some(pos)
            }
            _ => None,
        };
        if let Some(ops) = self.txn_node_ops(db, txn_id, key) {
            apply_txn_ops(&mut cache, &ops);
        }
        Ok((cache, pos))
    }

    pub(crate) fn merged_dup_count(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> BurrowResult<usize> {
        let (cache, _) = self.merged_lines(db, txn_id, key)?;
        Ok(cache.count())
    }

    // ------------------------------------------------------------------
    // database-level operations
    // ------------------------------------------------------------------

    fn check_db_open(&self, db: u16) -> BurrowResult<()> {
        if !self.open {
            return Err(BurrowError::InvalidParameter);
        }
        match self.dbs.get(&db) {
            Some(state) if state.open => Ok(()),
            _ => Err(BurrowError::InvalidParameter),
        }
    }

    pub(crate) fn db_insert_impl(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        position: DupPosition,
        cur: Option<u64>,
    ) -> BurrowResult<()> {
        self.check_db_open(db)?;
        if flags.contains(InsertFlags::OVERWRITE) && flags.contains(InsertFlags::DUPLICATE) {
            return Err(BurrowError::InvalidParameter);
        }
        let mut flags = flags;
        if flags.intersects(
            InsertFlags::DUPLICATE_INSERT_BEFORE
                | InsertFlags::DUPLICATE_INSERT_AFTER
                | InsertFlags::DUPLICATE_INSERT_FIRST
                | InsertFlags::DUPLICATE_INSERT_LAST,
        ) {
            flags |= InsertFlags::DUPLICATE;
        }
        if key.len() > u16::MAX as usize {
            return Err(BurrowError::InvalidParameter);
        }

        if self.txn_is_live(txn_id)? {
            // route the mutation into the op-tree; the btree stays
            // untouched until commit
            let exists = self.merged_dup_count(db, txn_id, key)? > 0;
            if exists
                && !flags.contains(InsertFlags::OVERWRITE)
                && !flags.contains(InsertFlags::DUPLICATE)
            {
                return Err(BurrowError::DuplicateKey);
            }
            let kind = if exists && flags.contains(InsertFlags::DUPLICATE) {
                TxnOpKind::InsertDuplicate {
                    record: Bytes::copy_from_slice(record),
                    position,
                }
            } else if exists && flags.contains(InsertFlags::OVERWRITE) {
                TxnOpKind::InsertOverwrite {
                    record: Bytes::copy_from_slice(record),
                }
            } else {
                TxnOpKind::Insert {
                    record: Bytes::copy_from_slice(record),
                }
            };
            let op_count = {
                let txn = self.txn.as_mut().ok_or(BurrowError::InternalError)?;
                txn.record_op(db, key, kind);
                txn.tree(db)
                    .and_then(|t| t.get(key))
                    .map(|n| n.ops.len())
                    .unwrap_or(0)
            };

            if let Some(cur) = cur {
                // couple to the freshly recorded op
                if let Some(pos) = match self.btree_seek(db, &BtKey::from_user(key))? {
                    SeekResult::Found(pos) => Some(pos),
                    _ => None,
                } {
                    self.btree_couple_cursor(cur, pos);
                } else {
                    self.btree_uncouple_cursor(cur);
                }
                let new_op = op_count.saturating_sub(1);
                if let Some(state) = self.cursors.get_mut(&cur) {
                    state.txn_cur.key = Some(key.to_vec());
                    state.txn_cur.op = new_op;
                    state.coupled_to_txn = true;
                    state.last_op = LastOp::LookupInsert;
                    state.last_cmp = None;
                }
                self.cursor_update_dupecache(cur, CursorHalf::Both)?;
                let idx = {
                    let state = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                    let mut found = 1;
                    for i in 0..state.dupecache.count() {
                        if state.dupecache.get(i) == Some(DupeCacheLine::Txn(new_op)) {
                            found = i + 1;
                            break;
                        }
                    }
                    found
                };
                self.cursor_couple_to_dupe(cur, idx)?;
            }
            Ok(())
        } else {
            let (pos, dup) = self.btree_insert(db, key, record, flags, position)?;
            if let Some(cur) = cur {
                self.cursor_set_to_nil(cur, CursorHalf::Both);
                self.btree_couple_cursor(
                    cur,
                    crate::btree::BtPos {
                        page: pos.page,
                        slot: pos.slot,
                        dup,
                    },
                );
                self.cursor_update_dupecache(cur, CursorHalf::Btree)?;
                if let Some(state) = self.cursors.get_mut(&cur) {
                    state.coupled_to_txn = false;
                    state.dupecache_index = dup as usize + 1;
                    state.last_op = LastOp::LookupInsert;
                    state.last_cmp = None;
                }
            }
            Ok(())
        }
    }

    pub(crate) fn db_find_impl(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> BurrowResult<Bytes> {
        self.check_db_open(db)?;
        let _ = self.txn_is_live(txn_id)?;
        let (cache, pos) = self.merged_lines(db, txn_id, key)?;
        match cache.get(0) {
            None => Err(BurrowError::KeyNotFound),
            Some(DupeCacheLine::Btree(dup)) => {
                let mut pos = pos.ok_or(BurrowError::InternalError)?;
                pos.dup = dup;
                self.btree_record(db, &pos)
            }
            Some(DupeCacheLine::Txn(op)) => {
                let ops = self
                    .txn_node_ops(db, txn_id, key)
                    .ok_or(BurrowError::InternalError)?;
                ops.get(op)
                    .and_then(|o| o.record().cloned())
                    .ok_or(BurrowError::InternalError)
            }
        }
    }

    pub(crate) fn db_erase_impl(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> BurrowResult<()> {
        self.check_db_open(db)?;
        if self.txn_is_live(txn_id)? {
            if self.merged_dup_count(db, txn_id, key)? == 0 {
                return Err(BurrowError::KeyNotFound);
            }
            let txn = self.txn.as_mut().ok_or(BurrowError::InternalError)?;
            txn.record_op(db, key, TxnOpKind::Erase { dup: None });
            Ok(())
        } else {
            self.btree_erase_key(db, key)
        }
    }

    // ------------------------------------------------------------------
    // environment-level operations
    // ------------------------------------------------------------------

    fn db_id_by_name(&self, name: u16) -> Option<u16> {
        self.dbs
            .iter()
            .find(|(_, state)| state.name == name)
            .map(|(id, _)| *id)
    }

    fn create_db_impl(&mut self, name: u16, keysize: u16) -> BurrowResult<u16> {
        if !self.open {
            return Err(BurrowError::InvalidParameter);
        }
        if keysize < MIN_KEY_SIZE || node::capacity(self.pagesize, keysize as usize) < 4 {
            return Err(BurrowError::InvalidParameter);
        }
        if self.db_id_by_name(name).is_some() {
            return Err(BurrowError::InvalidParameter);
        }
        if self.dbs.len() >= MAX_DATABASES {
            return Err(BurrowError::LimitsReached);
        }
        let mut state = DbState::new(name, keysize);
        state.open = true;
        let id = self.next_db_id;
        self.next_db_id += 1;
        self.dbs.insert(id, state);
        self.db_order.push(id);
        self.header_dirty = true;
        Ok(id)
    }

    fn open_db_impl(&mut self, name: u16) -> BurrowResult<u16> {
        if !self.open {
            return Err(BurrowError::InvalidParameter);
        }
        let id = self.db_id_by_name(name).ok_or(BurrowError::KeyNotFound)?;
        let state = self.dbs.get_mut(&id).ok_or(BurrowError::InternalError)?;
        if state.open {
            return Err(BurrowError::DatabaseAlreadyOpen);
        }
        state.open = true;
        Ok(id)
    }

    fn close_db_impl(&mut self, id: u16) {
        self.close_db_cursors(id);
        if let Some(state) = self.dbs.get_mut(&id) {
            state.open = false;
            state.compare = default_compare;
            state.prefix_compare = None;
        }
    }

    fn rename_db_impl(&mut self, old: u16, new: u16) -> BurrowResult<()> {
        if !self.open || old == new {
            return Err(BurrowError::InvalidParameter);
        }
        if self.db_id_by_name(new).is_some() {
            return Err(BurrowError::InvalidParameter);
        }
        let id = self.db_id_by_name(old).ok_or(BurrowError::KeyNotFound)?;
        if let Some(state) = self.dbs.get_mut(&id) {
            state.name = new;
        }
        self.header_dirty = true;
        Ok(())
    }

    fn erase_db_impl(&mut self, name: u16) -> BurrowResult<()> {
        if !self.open {
            return Err(BurrowError::InvalidParameter);
        }
        let id = self.db_id_by_name(name).ok_or(BurrowError::KeyNotFound)?;
        if self.dbs.get(&id).map(|s| s.open).unwrap_or(false) {
            return Err(BurrowError::DatabaseAlreadyOpen);
        }
        self.btree_drop_tree(id)?;
        if let Some(state) = self.dbs.remove(&id) {
            state.extkeys.destroy();
        }
        self.db_order.retain(|n| *n != id);
        self.header_dirty = true;
        Ok(())
    }

    fn flush_impl(&mut self) -> BurrowResult<()> {
        if !self.open {
            return Err(BurrowError::InvalidParameter);
        }
        self.flush_all_pages()?;
        self.write_header()?;
        self.device.sync()
    }

    fn close_impl(&mut self, flags: EnvFlags) -> BurrowResult<()> {
        if !self.open {
            return Ok(());
        }
        let auto_cleanup =
            flags.contains(EnvFlags::AUTO_CLEANUP) || self.flags.contains(EnvFlags::AUTO_CLEANUP);

        if !self.cursors.is_empty() && !auto_cleanup {
            warn!("closing environment with {} open cursor(s)", self.cursors.len());
        }
        let cursor_ids: Vec<u64> = self.cursors.keys().copied().collect();
        for id in cursor_ids {
            self.cursor_close(id);
        }
        if let Some(txn) = self.txn.take() {
            warn!("aborting transaction {} left open at close", txn.id);
        }
        let ids: Vec<u16> = self.db_order.clone();
        for id in ids {
            self.close_db_impl(id);
        }

        self.flush_and_delete()?;
        self.write_header()?;
        self.device.sync()?;
        for state in self.dbs.values() {
            state.extkeys.destroy();
        }
        self.open = false;
        Ok(())
    }
}

/// An environment: one file (or one in-memory arena) holding up to
/// [`MAX_DATABASES`] named databases.
pub struct Env {
    inner: Pod<EnvInner>,
}

impl Env {
    /// Create a fresh environment with default page and cache sizes.
    pub fn create<P: AsRef<Path>>(path: P, flags: EnvFlags) -> BurrowResult<Env> {
        Self::create_with(path, flags, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_SIZE)
    }

    pub fn create_with<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        pagesize: usize,
        cachesize: usize,
    ) -> BurrowResult<Env> {
        if flags.contains(EnvFlags::USE_HASH) {
            // hash indices are not supported
            return Err(BurrowError::InvalidParameter);
        }
        if pagesize < 1024 || pagesize % 512 != 0 {
            return Err(BurrowError::InvalidParameter);
        }
        let cachesize = if cachesize == 0 {
            DEFAULT_CACHE_SIZE
        } else {
            cachesize
        };

        let in_memory = flags.contains(EnvFlags::IN_MEMORY_DB);
        let device = if in_memory {
            Device::in_memory()
        } else {
            Device::create(path, flags.contains(EnvFlags::USE_MMAP))?
        };

        let mut inner = EnvInner {
            flags,
            pagesize,
            cachesize,
            device,
            freelist: Freelist::new(),
            cache: PageCache::new(pagesize, cachesize),
            dbs: HashMap::new(),
            db_order: Vec::new(),
            next_db_id: 1,
            txn: None,
            next_txn_id: 1,
            cursors: HashMap::new(),
            next_cursor_id: 1,
            cursors_on_page: HashMap::new(),
            header_dirty: false,
            open: true,
        };
        // page 0 is the header; writing it reserves the first page
        inner.write_header()?;
        Ok(Env {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Open an existing on-disk environment.
    pub fn open<P: AsRef<Path>>(path: P, flags: EnvFlags) -> BurrowResult<Env> {
        if flags.contains(EnvFlags::USE_HASH) {
            return Err(BurrowError::InvalidParameter);
        }
        if flags.contains(EnvFlags::IN_MEMORY_DB) {
            return Err(BurrowError::InvalidParameter);
        }
        let device = Device::open(path, flags.contains(EnvFlags::USE_MMAP))?;
        let mut inner = EnvInner {
            flags,
            pagesize: DEFAULT_PAGE_SIZE,
            cachesize: 0,
            device,
            freelist: Freelist::new(),
            cache: PageCache::new(DEFAULT_PAGE_SIZE, DEFAULT_CACHE_SIZE),
            dbs: HashMap::new(),
            db_order: Vec::new(),
            next_db_id: 1,
            txn: None,
            next_txn_id: 1,
            cursors: HashMap::new(),
            next_cursor_id: 1,
            cursors_on_page: HashMap::new(),
            header_dirty: false,
            open: true,
        };
        inner.read_header()?;
        inner.cache = PageCache::new(inner.pagesize, inner.cachesize);
        Ok(Env {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Create a database under this environment and open it.
    pub fn create_db(&self, name: u16) -> BurrowResult<Db> {
        self.create_db_with(name, DEFAULT_KEY_SIZE)
    }

    pub fn create_db_with(&self, name: u16, keysize: u16) -> BurrowResult<Db> {
        let id = self.inner.wl().create_db_impl(name, keysize)?;
        Ok(Db {
            env: self.inner.clone(),
            id,
        })
    }

    pub fn open_db(&self, name: u16) -> BurrowResult<Db> {
        let id = self.inner.wl().open_db_impl(name)?;
        Ok(Db {
            env: self.inner.clone(),
            id,
        })
    }

    pub fn rename_db(&self, old: u16, new: u16) -> BurrowResult<()> {
        self.inner.wl().rename_db_impl(old, new)
    }

    /// Remove a database and all its pages and blobs. The database must
    /// not be open.
    pub fn erase_db(&self, name: u16) -> BurrowResult<()> {
        self.inner.wl().erase_db_impl(name)
    }

    /// Names of all databases, in creation order.
    pub fn get_database_names(&self) -> BurrowResult<Vec<u16>> {
        let inner = self.inner.rl();
        if !inner.open {
            return Err(BurrowError::InvalidParameter);
        }
        Ok(inner
            .db_order
            .iter()
            .filter_map(|id| inner.dbs.get(id).map(|state| state.name))
            .collect())
    }

    /// Write all dirty pages and the header to the device.
    pub fn flush(&self) -> BurrowResult<()> {
        self.inner.wl().flush_impl()
    }

    /// Begin a transaction (requires `ENABLE_TRANSACTIONS`).
    pub fn begin(&self) -> BurrowResult<Transaction> {
        self.begin_impl(None)
    }

    pub fn begin_named(&self, name: &str) -> BurrowResult<Transaction> {
        self.begin_impl(Some(name.to_string()))
    }

    fn begin_impl(&self, name: Option<String>) -> BurrowResult<Transaction> {
        let id = self.inner.wl().txn_begin(name.clone())?;
        Ok(Transaction {
            env: self.inner.clone(),
            id,
            done: false,
            name,
        })
    }

    /// Close the environment; `AUTO_CLEANUP` closes attached databases and
    /// cursors first. Closing twice is a no-op.
    pub fn close(&self, flags: EnvFlags) -> BurrowResult<()> {
        self.inner.wl().close_impl(flags)
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        let _ = self.inner.wl().close_impl(EnvFlags::AUTO_CLEANUP);
    }
}

/// A handle to one named database of an environment.
pub struct Db {
    pub(crate) env: Pod<EnvInner>,
    pub(crate) id: u16,
}

impl Db {
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> BurrowResult<()> {
        if flags.intersects(
            InsertFlags::DUPLICATE_INSERT_BEFORE | InsertFlags::DUPLICATE_INSERT_AFTER,
        ) {
            // relative placement needs a cursor position
            return Err(BurrowError::InvalidParameter);
        }
        let position = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            DupPosition::First
        } else {
            DupPosition::Last
        };
        self.env.wl().db_insert_impl(
            self.id,
            txn.map(|t| t.id()),
            key,
            record,
            flags,
            position,
            None,
        )
    }

    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> BurrowResult<Record> {
        let bytes = self
            .env
            .wl()
            .db_find_impl(self.id, txn.map(|t| t.id()), key)?;
        Ok(Record {
            data: bytes.to_vec(),
            flags: Default::default(),
        })
    }

    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> BurrowResult<()> {
        self.env
            .wl()
            .db_erase_impl(self.id, txn.map(|t| t.id()), key)
    }

    pub fn set_compare_func(&self, f: CompareFunc) -> BurrowResult<()> {
        let mut inner = self.env.wl();
        inner.check_db_open(self.id)?;
        if let Some(state) = inner.dbs.get_mut(&self.id) {
            state.compare = f;
        }
        Ok(())
    }

    pub fn set_prefix_compare_func(&self, f: PrefixCompareFunc) -> BurrowResult<()> {
        let mut inner = self.env.wl();
        inner.check_db_open(self.id)?;
        if let Some(state) = inner.dbs.get_mut(&self.id) {
            state.prefix_compare = Some(f);
        }
        Ok(())
    }

    /// Number of live keys as seen by `txn` (or by readers outside any
    /// transaction).
    pub fn get_key_count(&self, txn: Option<&Transaction>) -> BurrowResult<u64> {
        let mut inner = self.env.wl();
        inner.check_db_open(self.id)?;
        inner.db_key_count(self.id, txn.map(|t| t.id()))
    }

    /// Open a cursor over this database, optionally bound to `txn`.
    pub fn cursor(&self, txn: Option<&Transaction>) -> BurrowResult<Cursor> {
        let id = self
            .env
            .wl()
            .cursor_create(self.id, txn.map(|t| t.id()))?;
        Ok(Cursor {
            env: self.env.clone(),
            id,
        })
    }

    /// Close this database handle and every cursor attached to it.
    pub fn close(&self) {
        self.env.wl().close_db_impl(self.id);
    }

    /// Test observability: cache-hit/miss counters of this database's
    /// extended-key cache.
    pub fn extkey_cache_counters(&self) -> BurrowResult<(u64, u64)> {
        let inner = self.env.rl();
        let state = inner
            .dbs
            .get(&self.id)
            .ok_or(BurrowError::InvalidParameter)?;
        Ok((state.extkeys.hits(), state.extkeys.misses()))
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.env.wl().close_db_impl(self.id);
    }
}
