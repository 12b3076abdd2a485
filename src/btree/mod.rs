//! The btree backend: a paged, ordered key space with duplicate support.
//!
//! The tree is deliberately shallow — a doubly linked chain of leaf pages
//! under at most one index page. Splitting a leaf inserts a separator into
//! the index root; when the index root itself is full the engine reports
//! `LimitsReached`. Rebalancing beyond that is not this crate's subject;
//! the cursor and cache layers above only rely on the contracts here.

pub(crate) mod node;

use bytes::Bytes;
use log::debug;

use crate::{
    env::EnvInner,
    error::{BurrowError, BurrowResult},
    flags::InsertFlags,
    io::{get_u32, get_u64, put_u32, put_u64},
    key::{BtKey, KEY_HAS_DUPLICATES, KEY_IS_EXTENDED},
    page::PageType,
    txn::DupPosition,
    utils::HandyRwLock,
};

/// Position of a btree cursor: the leaf page, the entry slot, and the
/// 0-based index into the entry's duplicate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BtPos {
    pub page: u64,
    pub slot: usize,
    pub dup: u64,
}

/// The btree-side half of a fused cursor.
#[derive(Debug, Default, Clone)]
pub(crate) struct BtreeCursorState {
    pub pos: Option<BtPos>,
}

impl BtreeCursorState {
    pub fn is_nil(&self) -> bool {
        self.pos.is_none()
    }
}

/// Outcome of a key lookup.
pub(crate) enum SeekResult {
    /// The tree holds no keys at all.
    Empty,
    /// Exact match.
    Found(BtPos),
    /// No match; (page, slot) is the first entry greater than the key,
    /// which doubles as the insertion point.
    Gap { page: u64, slot: usize },
    /// The key is greater than every entry; (page, slot) is the insertion
    /// point at the end of the rightmost leaf.
    End { page: u64, slot: usize },
}

fn encode_dup_table(rids: &[u64]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + rids.len() * 8];
    put_u32(&mut buf, 0, rids.len() as u32);
    for (i, rid) in rids.iter().enumerate() {
        put_u64(&mut buf, 4 + i * 8, *rid);
    }
    buf
}

fn decode_dup_table(bytes: &[u8]) -> Vec<u64> {
    let n = get_u32(bytes, 0) as usize;
    (0..n).map(|i| get_u64(bytes, 4 + i * 8)).collect()
}

impl EnvInner {
    fn db_keysize(&self, db: u16) -> BurrowResult<usize> {
        Ok(self
            .dbs
            .get(&db)
            .ok_or(BurrowError::InvalidParameter)?
            .keysize as usize)
    }

    fn db_root(&self, db: u16) -> BurrowResult<u64> {
        Ok(self
            .dbs
            .get(&db)
            .ok_or(BurrowError::InvalidParameter)?
            .root)
    }

    fn node_capacity(&self, db: u16) -> BurrowResult<usize> {
        Ok(node::capacity(self.pagesize, self.db_keysize(db)?))
    }

    /// Locate `key` in the tree, or the place where it would live.
    pub(crate) fn btree_seek(&mut self, db: u16, key: &BtKey) -> BurrowResult<SeekResult> {
        let ks = self.db_keysize(db)?;
        let root = self.db_root(db)?;
        if root == 0 {
            return Ok(SeekResult::Empty);
        }

        // stage 1: descend to the leaf that covers the key
        let mut addr = root;
        loop {
            let pod = self.fetch_page(addr, db)?;
            let leaf = node::is_leaf(pod.rl().bytes());
            if leaf {
                break;
            }
            let n = {
                let guard = pod.rl();
                node::count(guard.bytes())
            };
            // the leftmost child's separator is never consulted
            let mut child = {
                let guard = pod.rl();
                node::entry_rid(guard.bytes(), 0, ks)
            };
            for slot in 1..n {
                let sep = {
                    let guard = pod.rl();
                    node::read_key(guard.bytes(), slot, ks)
                };
                if self.compare_keys(db, &sep, key)? != std::cmp::Ordering::Greater {
                    let guard = pod.rl();
                    child = node::entry_rid(guard.bytes(), slot, ks);
                } else {
                    break;
                }
            }
            addr = child;
        }

        // stage 2: scan the leaf for the first entry >= key
        let pod = self.fetch_page(addr, db)?;
        let n = {
            let guard = pod.rl();
            node::count(guard.bytes())
        };
        for slot in 0..n {
            let entry_key = {
                let guard = pod.rl();
                node::read_key(guard.bytes(), slot, ks)
            };
            match self.compare_keys(db, &entry_key, key)? {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => {
                    return Ok(SeekResult::Found(BtPos {
                        page: addr,
                        slot,
                        dup: 0,
                    }))
                }
                std::cmp::Ordering::Greater => {
                    return Ok(SeekResult::Gap { page: addr, slot });
                }
            }
        }

        // stage 3: past the end of this leaf; the first entry of the next
        // non-empty leaf is the successor
        let mut next = {
            let guard = pod.rl();
            node::right(guard.bytes())
        };
        while next != 0 {
            let sibling = self.fetch_page(next, db)?;
            let guard = sibling.rl();
            if node::count(guard.bytes()) > 0 {
                return Ok(SeekResult::Gap {
                    page: next,
                    slot: 0,
                });
            }
            next = node::right(guard.bytes());
        }
        Ok(SeekResult::End { page: addr, slot: n })
    }

    pub(crate) fn btree_first(&mut self, db: u16) -> BurrowResult<Option<BtPos>> {
        let ks = self.db_keysize(db)?;
        let root = self.db_root(db)?;
        if root == 0 {
            return Ok(None);
        }
        let mut addr = root;
        loop {
            let pod = self.fetch_page(addr, db)?;
            let guard = pod.rl();
            if node::is_leaf(guard.bytes()) {
                break;
            }
            addr = node::entry_rid(guard.bytes(), 0, ks);
        }
        // skip empty leaves (only an emptied root can be empty)
        let mut addr = Some(addr);
        while let Some(a) = addr {
            let pod = self.fetch_page(a, db)?;
            let guard = pod.rl();
            if node::count(guard.bytes()) > 0 {
                return Ok(Some(BtPos {
                    page: a,
                    slot: 0,
                    dup: 0,
                }));
            }
            let right = node::right(guard.bytes());
            addr = if right == 0 { None } else { Some(right) };
        }
        Ok(None)
    }

    pub(crate) fn btree_last(&mut self, db: u16) -> BurrowResult<Option<BtPos>> {
        let ks = self.db_keysize(db)?;
        let root = self.db_root(db)?;
        if root == 0 {
            return Ok(None);
        }
        let mut addr = root;
        loop {
            let pod = self.fetch_page(addr, db)?;
            let guard = pod.rl();
            if node::is_leaf(guard.bytes()) {
                break;
            }
            let n = node::count(guard.bytes());
            addr = node::entry_rid(guard.bytes(), n - 1, ks);
        }
        let mut addr = Some(addr);
        while let Some(a) = addr {
            let pod = self.fetch_page(a, db)?;
            let guard = pod.rl();
            let n = node::count(guard.bytes());
            if n > 0 {
                return Ok(Some(BtPos {
                    page: a,
                    slot: n - 1,
                    dup: 0,
                }));
            }
            let left = node::left(guard.bytes());
            addr = if left == 0 { None } else { Some(left) };
        }
        Ok(None)
    }

    /// Next key position (duplicates are the caller's concern).
    pub(crate) fn btree_next(&mut self, db: u16, pos: &BtPos) -> BurrowResult<Option<BtPos>> {
        let pod = self.fetch_page(pos.page, db)?;
        let guard = pod.rl();
        if pos.slot + 1 < node::count(guard.bytes()) {
            return Ok(Some(BtPos {
                page: pos.page,
                slot: pos.slot + 1,
                dup: 0,
            }));
        }
        let mut next = node::right(guard.bytes());
        drop(guard);
        while next != 0 {
            let sibling = self.fetch_page(next, db)?;
            let guard = sibling.rl();
            if node::count(guard.bytes()) > 0 {
                return Ok(Some(BtPos {
                    page: next,
                    slot: 0,
                    dup: 0,
                }));
            }
            next = node::right(guard.bytes());
        }
        Ok(None)
    }

    pub(crate) fn btree_prev(&mut self, db: u16, pos: &BtPos) -> BurrowResult<Option<BtPos>> {
        if pos.slot > 0 {
            return Ok(Some(BtPos {
                page: pos.page,
                slot: pos.slot - 1,
                dup: 0,
            }));
        }
        let pod = self.fetch_page(pos.page, db)?;
        let mut prev = node::left(pod.rl().bytes());
        while prev != 0 {
            let sibling = self.fetch_page(prev, db)?;
            let guard = sibling.rl();
            let n = node::count(guard.bytes());
            if n > 0 {
                return Ok(Some(BtPos {
                    page: prev,
                    slot: n - 1,
                    dup: 0,
                }));
            }
            prev = node::left(guard.bytes());
        }
        Ok(None)
    }

    pub(crate) fn btree_key_at(&mut self, db: u16, pos: &BtPos) -> BurrowResult<BtKey> {
        let ks = self.db_keysize(db)?;
        let pod = self.fetch_page(pos.page, db)?;
        let guard = pod.rl();
        if pos.slot >= node::count(guard.bytes()) {
            return Err(BurrowError::InternalError);
        }
        Ok(node::read_key(guard.bytes(), pos.slot, ks))
    }

    /// The record ids of every duplicate of the key at `pos`, in storage
    /// order.
    pub(crate) fn btree_dup_rids(&mut self, db: u16, pos: &BtPos) -> BurrowResult<Vec<u64>> {
        let ks = self.db_keysize(db)?;
        let pod = self.fetch_page(pos.page, db)?;
        let (flags, rid) = {
            let guard = pod.rl();
            (
                node::entry_flags(guard.bytes(), pos.slot, ks),
                node::entry_rid(guard.bytes(), pos.slot, ks),
            )
        };
        if flags & KEY_HAS_DUPLICATES != 0 {
            let table = self.blob_read(rid)?;
            Ok(decode_dup_table(&table))
        } else {
            Ok(vec![rid])
        }
    }

    /// The record payload of the duplicate `pos.dup` of the key at `pos`.
    pub(crate) fn btree_record(&mut self, db: u16, pos: &BtPos) -> BurrowResult<Bytes> {
        let rids = self.btree_dup_rids(db, pos)?;
        let rid = rids
            .get(pos.dup as usize)
            .copied()
            .ok_or(BurrowError::KeyNotFound)?;
        self.blob_read(rid)
    }

    /// Rewrite the duplicate table of the key at `pos`. A single remaining
    /// rid collapses back into the entry itself.
    fn write_dup_rids(&mut self, db: u16, pos: &BtPos, rids: &[u64]) -> BurrowResult<()> {
        let ks = self.db_keysize(db)?;
        let pod = self.fetch_page(pos.page, db)?;
        let (flags, old_rid) = {
            let guard = pod.rl();
            (
                node::entry_flags(guard.bytes(), pos.slot, ks),
                node::entry_rid(guard.bytes(), pos.slot, ks),
            )
        };

        let (new_flags, new_rid) = if rids.len() == 1 {
            (flags & !KEY_HAS_DUPLICATES, rids[0])
        } else {
            let table = self.blob_alloc(&encode_dup_table(rids))?;
            (flags | KEY_HAS_DUPLICATES, table)
        };
        if flags & KEY_HAS_DUPLICATES != 0 {
            self.blob_free(old_rid)?;
        }

        {
            let mut guard = pod.wl();
            let bytes = guard.bytes_mut();
            node::set_entry_flags(bytes, pos.slot, ks, new_flags);
            node::set_entry_rid(bytes, pos.slot, ks, new_rid);
            guard.dirty = true;
        }
        self.flush_page_pod(&pod)
    }

    /// Turn a user key into an entry's inline form, spilling the tail into
    /// a blob when it does not fit the key slot.
    fn make_key_inline(&mut self, db: u16, key: &[u8]) -> BurrowResult<(u8, Vec<u8>)> {
        let ks = self.db_keysize(db)?;
        if key.len() <= ks {
            return Ok((0, key.to_vec()));
        }
        let blobid = self.blob_alloc(&key[ks - 8..])?;
        let mut inline = key[..ks - 8].to_vec();
        inline.extend_from_slice(&blobid.to_le_bytes());
        Ok((KEY_IS_EXTENDED, inline))
    }

    /// Release an extended key's tail blob and scrub its cache entry.
    fn free_extended_key(&mut self, db: u16, key: &BtKey) -> BurrowResult<()> {
        if !key.is_extended() {
            return Ok(());
        }
        let ks = self.db_keysize(db)?;
        let blobid = key.tail_blobid(ks);
        self.blob_free(blobid)?;
        if let Some(state) = self.dbs.get_mut(&db) {
            let _ = state.extkeys.remove(blobid);
        }
        Ok(())
    }

    /// A private copy of a key for use as an index separator. Extended keys
    /// get their own tail blob so leaf and index never share one.
    fn copy_key_for_index(&mut self, db: u16, key: &BtKey) -> BurrowResult<(u8, usize, Vec<u8>)> {
        if !key.is_extended() {
            return Ok((0, key.len, key.data.clone()));
        }
        let ks = self.db_keysize(db)?;
        let tail = self.blob_read(key.tail_blobid(ks))?;
        let blobid = self.blob_alloc(&tail)?;
        let mut inline = key.data[..ks - 8].to_vec();
        inline.extend_from_slice(&blobid.to_le_bytes());
        Ok((KEY_IS_EXTENDED, key.len, inline))
    }

    /// Insert a key/record pair. Returns the final position and the 0-based
    /// index of the inserted (or overwritten) duplicate.
    pub(crate) fn btree_insert(
        &mut self,
        db: u16,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        position: DupPosition,
    ) -> BurrowResult<(BtPos, u64)> {
        if key.len() > u16::MAX as usize {
            return Err(BurrowError::InvalidParameter);
        }
        let probe = BtKey::from_user(key);

        match self.btree_seek(db, &probe)? {
            SeekResult::Found(pos) => {
                if flags.contains(InsertFlags::DUPLICATE) {
                    let mut rids = self.btree_dup_rids(db, &pos)?;
                    let at = match position {
                        DupPosition::First => 0,
                        DupPosition::Last => rids.len(),
                        DupPosition::Before(r) => {
                            (r as usize).saturating_sub(1).min(rids.len())
                        }
                        DupPosition::After(r) => (r as usize).min(rids.len()),
                    };
                    let rid = self.blob_alloc(record)?;
                    rids.insert(at, rid);
                    if let Err(e) = self.write_dup_rids(db, &pos, &rids) {
                        let _ = self.blob_free(rid);
                        return Err(e);
                    }
                    Ok((pos, at as u64))
                } else if flags.contains(InsertFlags::OVERWRITE) {
                    self.btree_overwrite_dup(db, &pos, record)?;
                    Ok((pos, 0))
                } else {
                    Err(BurrowError::DuplicateKey)
                }
            }
            miss => {
                let (page, slot) = match miss {
                    SeekResult::Empty => {
                        // first key of this database: the root starts out
                        // as a single leaf page
                        let pod = self.alloc_btree_page(db, PageType::BtreeRoot, node::LEVEL_LEAF)?;
                        let addr = pod.rl().addr;
                        if let Some(state) = self.dbs.get_mut(&db) {
                            state.root = addr;
                        }
                        self.header_dirty = true;
                        (addr, 0)
                    }
                    SeekResult::Gap { page, slot } => (page, slot),
                    SeekResult::End { page, slot } => (page, slot),
                    SeekResult::Found(_) => return Err(BurrowError::InternalError),
                };
                let (kflags, inline) = self.make_key_inline(db, key)?;
                let rid = self.blob_alloc(record)?;
                match self.leaf_insert(db, page, slot, kflags, key.len(), &inline, rid) {
                    Ok(pos) => Ok((pos, 0)),
                    Err(e) => {
                        // release everything this attempt allocated
                        let _ = self.blob_free(rid);
                        if kflags & KEY_IS_EXTENDED != 0 {
                            let tail = get_u64(&inline, inline.len() - 8);
                            let _ = self.blob_free(tail);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Replace the record of the duplicate `pos.dup` in place.
    pub(crate) fn btree_overwrite_dup(
        &mut self,
        db: u16,
        pos: &BtPos,
        record: &[u8],
    ) -> BurrowResult<()> {
        let mut rids = self.btree_dup_rids(db, pos)?;
        let i = pos.dup as usize;
        if i >= rids.len() {
            return Err(BurrowError::KeyNotFound);
        }
        self.blob_free(rids[i])?;
        rids[i] = self.blob_alloc(record)?;
        self.write_dup_rids(db, pos, &rids)
    }

    /// Put an entry into a leaf, splitting it when full.
    fn leaf_insert(
        &mut self,
        db: u16,
        page: u64,
        slot: usize,
        kflags: u8,
        key_len: usize,
        inline: &[u8],
        rid: u64,
    ) -> BurrowResult<BtPos> {
        let ks = self.db_keysize(db)?;
        let cap = self.node_capacity(db)?;
        let pod = self.fetch_page(page, db)?;
        let n = node::count(pod.rl().bytes());

        if n < cap {
            {
                let mut guard = pod.wl();
                node::insert_entry(guard.bytes_mut(), slot, ks, kflags, key_len, inline, rid);
                guard.dirty = true;
            }
            self.cursors_adjust_insert(page, slot);
            self.flush_page_pod(&pod)?;
            return Ok(BtPos {
                page,
                slot,
                dup: 0,
            });
        }

        // stage 1: make sure the split can complete before touching
        // anything: the parent must have room for the separator, and both
        // new pages must be allocatable
        let root = self.db_root(db)?;
        let new_root_pod = if page == root {
            Some(self.alloc_btree_page(db, PageType::BtreeRoot, node::LEVEL_INDEX)?)
        } else {
            let root_pod = self.fetch_page(root, db)?;
            if node::count(root_pod.rl().bytes()) >= cap {
                return Err(BurrowError::LimitsReached);
            }
            None
        };

        // stage 2: move the upper half into a fresh leaf and stitch the
        // sibling chain
        let split_at = n / 2;
        let new_pod = self.alloc_btree_page(db, PageType::BtreeIndex, node::LEVEL_LEAF)?;
        let new_addr = new_pod.rl().addr;
        debug!("splitting leaf 0x{:x} into 0x{:x} at {}", page, new_addr, split_at);

        let old_right = {
            let mut old = pod.wl();
            let mut new = new_pod.wl();
            let right = node::right(old.bytes());
            node::move_tail(old.bytes_mut(), new.bytes_mut(), split_at, ks);
            node::set_right(new.bytes_mut(), right);
            node::set_left(new.bytes_mut(), page);
            node::set_right(old.bytes_mut(), new_addr);
            old.dirty = true;
            new.dirty = true;
            right
        };
        if old_right != 0 {
            let right_pod = self.fetch_page(old_right, db)?;
            let mut guard = right_pod.wl();
            node::set_left(guard.bytes_mut(), new_addr);
            guard.dirty = true;
            drop(guard);
            self.flush_page_pod(&right_pod)?;
        }
        self.cursors_adjust_split(page, new_addr, split_at);

        // stage 3: hand the new leaf's lower bound to the parent
        let sep_key = {
            let guard = new_pod.rl();
            node::read_key(guard.bytes(), 0, ks)
        };
        let (sep_flags, sep_len, sep_inline) = self.copy_key_for_index(db, &sep_key)?;

        if let Some(index_pod) = new_root_pod {
            // the root was a leaf: grow an index root above the two leaves
            let index_addr = index_pod.rl().addr;
            {
                let mut guard = index_pod.wl();
                let bytes = guard.bytes_mut();
                // the leftmost child needs no separator
                node::insert_entry(bytes, 0, ks, 0, 0, &[], page);
                node::insert_entry(bytes, 1, ks, sep_flags, sep_len, &sep_inline, new_addr);
                guard.dirty = true;
            }
            {
                let mut old = pod.wl();
                old.page_type = PageType::BtreeIndex;
                old.bytes_mut()[0] = PageType::BtreeIndex as u8;
                old.dirty = true;
            }
            if let Some(state) = self.dbs.get_mut(&db) {
                state.root = index_addr;
            }
            self.header_dirty = true;
            self.flush_page_pod(&index_pod)?;
        } else {
            let root_pod = self.fetch_page(root, db)?;
            {
                let mut guard = root_pod.wl();
                let bytes = guard.bytes_mut();
                let n = node::count(bytes);
                let mut at = n;
                for i in 0..n {
                    if node::entry_rid(bytes, i, ks) == page {
                        at = i + 1;
                        break;
                    }
                }
                node::insert_entry(bytes, at, ks, sep_flags, sep_len, &sep_inline, new_addr);
                guard.dirty = true;
            }
            self.flush_page_pod(&root_pod)?;
        }

        // stage 4: the insert itself, into whichever half owns the slot
        let (target, target_slot) = if slot >= split_at {
            (new_addr, slot - split_at)
        } else {
            (page, slot)
        };
        let target_pod = self.fetch_page(target, db)?;
        {
            let mut guard = target_pod.wl();
            node::insert_entry(guard.bytes_mut(), target_slot, ks, kflags, key_len, inline, rid);
            guard.dirty = true;
        }
        self.cursors_adjust_insert(target, target_slot);
        self.flush_page_pod(&pod)?;
        self.flush_page_pod(&new_pod)?;
        self.flush_page_pod(&target_pod)?;

        Ok(BtPos {
            page: target,
            slot: target_slot,
            dup: 0,
        })
    }

    /// Erase a whole key: every duplicate record, the duplicate table, the
    /// extended tail, and the entry itself.
    pub(crate) fn btree_erase_key(&mut self, db: u16, key: &[u8]) -> BurrowResult<()> {
        let probe = BtKey::from_user(key);
        let pos = match self.btree_seek(db, &probe)? {
            SeekResult::Found(pos) => pos,
            _ => return Err(BurrowError::KeyNotFound),
        };
        self.btree_erase_at(db, &pos)
    }

    pub(crate) fn btree_erase_at(&mut self, db: u16, pos: &BtPos) -> BurrowResult<()> {
        let ks = self.db_keysize(db)?;
        let rids = self.btree_dup_rids(db, pos)?;
        for rid in rids {
            self.blob_free(rid)?;
        }
        let pod = self.fetch_page(pos.page, db)?;
        let (flags, rid, entry_key) = {
            let guard = pod.rl();
            (
                node::entry_flags(guard.bytes(), pos.slot, ks),
                node::entry_rid(guard.bytes(), pos.slot, ks),
                node::read_key(guard.bytes(), pos.slot, ks),
            )
        };
        drop(pod);
        if flags & KEY_HAS_DUPLICATES != 0 {
            self.blob_free(rid)?;
        }
        self.free_extended_key(db, &entry_key)?;
        self.leaf_remove_entry(db, pos.page, pos.slot)
    }

    /// Erase one duplicate (1-based, counted in storage order). Erasing the
    /// last remaining duplicate removes the key.
    pub(crate) fn btree_erase_dup(&mut self, db: u16, key: &[u8], dup: u32) -> BurrowResult<()> {
        let probe = BtKey::from_user(key);
        let pos = match self.btree_seek(db, &probe)? {
            SeekResult::Found(pos) => pos,
            _ => return Err(BurrowError::KeyNotFound),
        };
        let mut rids = self.btree_dup_rids(db, &pos)?;
        let i = dup as usize;
        if i < 1 || i > rids.len() {
            return Err(BurrowError::KeyNotFound);
        }
        if rids.len() == 1 {
            return self.btree_erase_at(db, &pos);
        }
        self.blob_free(rids[i - 1])?;
        rids.remove(i - 1);
        self.write_dup_rids(db, &pos, &rids)?;
        self.cursors_adjust_erase_dup(pos.page, pos.slot, (i - 1) as u64);
        Ok(())
    }

    /// Drop the entry at (page, slot); a leaf that runs empty is unlinked
    /// and freed.
    fn leaf_remove_entry(&mut self, db: u16, page: u64, slot: usize) -> BurrowResult<()> {
        let ks = self.db_keysize(db)?;
        let pod = self.fetch_page(page, db)?;
        let remaining = {
            let mut guard = pod.wl();
            node::remove_entry(guard.bytes_mut(), slot, ks);
            guard.dirty = true;
            node::count(guard.bytes())
        };
        self.cursors_adjust_remove(page, slot);
        self.flush_page_pod(&pod)?;
        drop(pod);

        if remaining == 0 {
            self.free_empty_leaf(db, page)?;
        }
        Ok(())
    }

    fn free_empty_leaf(&mut self, db: u16, page: u64) -> BurrowResult<()> {
        let ks = self.db_keysize(db)?;
        let root = self.db_root(db)?;

        if page == root {
            // the last key of the database is gone
            if let Some(state) = self.dbs.get_mut(&db) {
                state.root = 0;
            }
            self.header_dirty = true;
            return self.free_page(page);
        }

        // unlink from the sibling chain
        let pod = self.fetch_page(page, db)?;
        let (left, right) = {
            let guard = pod.rl();
            (node::left(guard.bytes()), node::right(guard.bytes()))
        };
        drop(pod);
        if left != 0 {
            let left_pod = self.fetch_page(left, db)?;
            let mut guard = left_pod.wl();
            node::set_right(guard.bytes_mut(), right);
            guard.dirty = true;
            drop(guard);
            self.flush_page_pod(&left_pod)?;
        }
        if right != 0 {
            let right_pod = self.fetch_page(right, db)?;
            let mut guard = right_pod.wl();
            node::set_left(guard.bytes_mut(), left);
            guard.dirty = true;
            drop(guard);
            self.flush_page_pod(&right_pod)?;
        }

        // drop the separator that routed to this leaf
        let root_pod = self.fetch_page(root, db)?;
        let mut sep_key = None;
        {
            let mut guard = root_pod.wl();
            let bytes = guard.bytes_mut();
            let n = node::count(bytes);
            for i in 0..n {
                if node::entry_rid(bytes, i, ks) == page {
                    sep_key = Some(node::read_key(bytes, i, ks));
                    node::remove_entry(bytes, i, ks);
                    break;
                }
            }
            guard.dirty = true;
        }
        self.flush_page_pod(&root_pod)?;
        if let Some(sep) = sep_key {
            self.free_extended_key(db, &sep)?;
        }

        // a single remaining child collapses the tree back to one level
        let remaining = node::count(root_pod.rl().bytes());
        if remaining == 1 {
            let child = node::entry_rid(root_pod.rl().bytes(), 0, ks);
            drop(root_pod);
            let child_pod = self.fetch_page(child, db)?;
            {
                let mut guard = child_pod.wl();
                guard.page_type = PageType::BtreeRoot;
                guard.bytes_mut()[0] = PageType::BtreeRoot as u8;
                guard.dirty = true;
            }
            self.flush_page_pod(&child_pod)?;
            drop(child_pod);
            if let Some(state) = self.dbs.get_mut(&db) {
                state.root = child;
            }
            self.header_dirty = true;
            self.free_page(root)?;
        }

        self.free_page(page)
    }

    /// Free every page and blob a database owns; used by `erase_db`.
    pub(crate) fn btree_drop_tree(&mut self, db: u16) -> BurrowResult<()> {
        let ks = self.db_keysize(db)?;
        let root = self.db_root(db)?;
        if root == 0 {
            return Ok(());
        }

        // collect the leaf chain before tearing anything down
        let mut leaves = Vec::new();
        let mut addr = root;
        let mut index_page = None;
        loop {
            let pod = self.fetch_page(addr, db)?;
            let guard = pod.rl();
            if node::is_leaf(guard.bytes()) {
                break;
            }
            index_page = Some(addr);
            addr = node::entry_rid(guard.bytes(), 0, ks);
        }
        while addr != 0 {
            leaves.push(addr);
            let pod = self.fetch_page(addr, db)?;
            let guard = pod.rl();
            addr = node::right(guard.bytes());
        }

        // free the payload blobs of every entry, then the pages; the page
        // release scrubs the extended-key cache
        for leaf in leaves {
            let pod = self.fetch_page(leaf, db)?;
            let n = node::count(pod.rl().bytes());
            for slot in 0..n {
                let pos = BtPos {
                    page: leaf,
                    slot,
                    dup: 0,
                };
                let rids = self.btree_dup_rids(db, &pos)?;
                for rid in rids {
                    self.blob_free(rid)?;
                }
                let (flags, rid, entry_key) = {
                    let guard = pod.rl();
                    (
                        node::entry_flags(guard.bytes(), slot, ks),
                        node::entry_rid(guard.bytes(), slot, ks),
                        node::read_key(guard.bytes(), slot, ks),
                    )
                };
                if flags & KEY_HAS_DUPLICATES != 0 {
                    self.blob_free(rid)?;
                }
                if entry_key.is_extended() {
                    // tail blobs die with the database
                    self.blob_free(entry_key.tail_blobid(ks))?;
                }
            }
            drop(pod);
            self.free_page(leaf)?;
        }
        if let Some(index) = index_page {
            let pod = self.fetch_page(index, db)?;
            let n = node::count(pod.rl().bytes());
            for slot in 0..n {
                let sep = {
                    let guard = pod.rl();
                    node::read_key(guard.bytes(), slot, ks)
                };
                if sep.is_extended() {
                    self.blob_free(sep.tail_blobid(ks))?;
                    if let Some(state) = self.dbs.get_mut(&db) {
                        let _ = state.extkeys.remove(sep.tail_blobid(ks));
                    }
                }
            }
            drop(pod);
            self.free_page(index)?;
        }

        if let Some(state) = self.dbs.get_mut(&db) {
            state.root = 0;
        }
        self.header_dirty = true;
        Ok(())
    }
}
