//! The fused cursor: a btree cursor and a transaction cursor welded
//! together behind one handle.
//!
//! A cursor is NIL (points at nothing), coupled to the btree, or coupled
//! to a transaction op; each half can independently be NIL. Moves walk
//! both halves in lockstep and consolidate the duplicates of the current
//! key through the dupecache, so the caller sees committed and pending
//! state as one ordered key space.

use std::cmp::Ordering;

use bytes::Bytes;
use log::trace;

use crate::{
    btree::{BtPos, BtreeCursorState, SeekResult},
    dupecache::{apply_txn_ops, DupeCache, DupeCacheLine},
    env::EnvInner,
    error::{BurrowError, BurrowResult},
    flags::{CursorHalf, InsertFlags, MoveFlags, SyncFlags},
    key::{BtKey, Key, Record},
    txn::{
        tree_first, tree_last, tree_next, tree_prev, tree_seek_geq, DupPosition, TxnCursorState,
        TxnOp, TxnOpKind,
    },
    utils::{HandyRwLock, Pod},
};

/// The previous cursor operation; NEXT/PREVIOUS need it to decide whether
/// the duplicate cache is still walking the current key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum LastOp {
    #[default]
    None,
    Next,
    Previous,
    LookupInsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Forward,
    Backward,
}

pub(crate) struct CursorState {
    pub db: u16,
    /// The transaction this cursor was created under, if any. A dead id
    /// (committed/aborted) degrades the cursor to a btree-only view.
    pub txn_id: Option<u64>,
    /// Which sub-cursor is authoritative; mirrors the original's
    /// coupled-to-txn flag bit.
    pub coupled_to_txn: bool,
    pub btree: BtreeCursorState,
    pub txn_cur: TxnCursorState,
    pub dupecache: DupeCache,
    /// 1-based position in the dupecache; 0 means the cache is not in use.
    pub dupecache_index: usize,
    pub last_op: LastOp,
    /// Last btree-vs-txn key comparison; `None` means stale.
    pub last_cmp: Option<Ordering>,
}

impl CursorState {
    fn new(db: u16, txn_id: Option<u64>) -> Self {
        Self {
            db,
            txn_id,
            coupled_to_txn: false,
            btree: BtreeCursorState::default(),
            txn_cur: TxnCursorState::default(),
            dupecache: DupeCache::new(),
            dupecache_index: 0,
            last_op: LastOp::None,
            last_cmp: None,
        }
    }

    pub fn is_nil(&self, what: CursorHalf) -> bool {
        match what {
            CursorHalf::Btree => self.btree.is_nil(),
            CursorHalf::Txn => self.txn_cur.is_nil(),
            CursorHalf::Both => self.btree.is_nil() && self.txn_cur.is_nil(),
        }
    }
}

impl EnvInner {
    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn cursor_create(&mut self, db: u16, txn_id: Option<u64>) -> BurrowResult<u64> {
        if !self.dbs.get(&db).map(|d| d.open).unwrap_or(false) {
            return Err(BurrowError::InvalidParameter);
        }
        if let Some(id) = txn_id {
            match &self.txn {
                Some(txn) if txn.id == id => {}
                _ => return Err(BurrowError::InvalidParameter),
            }
        }
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors.insert(id, CursorState::new(db, txn_id));
        Ok(id)
    }

    pub(crate) fn cursor_clone(&mut self, src: u64) -> BurrowResult<u64> {
        let state = self.cursors.get(&src).ok_or(BurrowError::InvalidParameter)?;
        let copy = CursorState {
            db: state.db,
            txn_id: state.txn_id,
            coupled_to_txn: state.coupled_to_txn,
            btree: state.btree.clone(),
            txn_cur: state.txn_cur.clone(),
            dupecache: state.dupecache.clone(),
            dupecache_index: state.dupecache_index,
            last_op: state.last_op,
            last_cmp: state.last_cmp,
        };
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        let pos = copy.btree.pos;
        self.cursors.insert(id, copy);
        if let Some(pos) = pos {
            self.cursors_on_page.entry(pos.page).or_default().push(id);
        }
        Ok(id)
    }

    pub(crate) fn cursor_close(&mut self, cur: u64) {
        self.btree_uncouple_cursor(cur);
        self.cursors.remove(&cur);
    }

    pub(crate) fn close_db_cursors(&mut self, db: u16) {
        let ids: Vec<u64> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.db == db)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.cursor_close(id);
        }
    }

    // ------------------------------------------------------------------
    // coupling bookkeeping; the per-page list exists so an erase can
    // invalidate every sibling cursor sitting on the dead entry, and so
    // the cache knows which pages are pinned
    // ------------------------------------------------------------------

    pub(crate) fn btree_couple_cursor(&mut self, cur: u64, pos: BtPos) {
        self.btree_uncouple_cursor(cur);
        if let Some(c) = self.cursors.get_mut(&cur) {
            c.btree.pos = Some(pos);
            self.cursors_on_page.entry(pos.page).or_default().push(cur);
        }
    }

    pub(crate) fn btree_uncouple_cursor(&mut self, cur: u64) {
        let pos = match self.cursors.get_mut(&cur) {
            Some(c) => c.btree.pos.take(),
            None => None,
        };
        if let Some(pos) = pos {
            if let Some(list) = self.cursors_on_page.get_mut(&pos.page) {
                list.retain(|id| *id != cur);
                if list.is_empty() {
                    self.cursors_on_page.remove(&pos.page);
                }
            }
        }
    }

    pub(crate) fn cursor_set_to_nil(&mut self, cur: u64, what: CursorHalf) {
        if matches!(what, CursorHalf::Btree | CursorHalf::Both) {
            self.btree_uncouple_cursor(cur);
        }
        if let Some(c) = self.cursors.get_mut(&cur) {
            if matches!(what, CursorHalf::Txn | CursorHalf::Both) {
                c.txn_cur.set_to_nil();
            }
            match what {
                CursorHalf::Btree => c.coupled_to_txn = !c.txn_cur.is_nil(),
                CursorHalf::Txn | CursorHalf::Both => c.coupled_to_txn = false,
            }
            // the cache may reference whichever half just went away
            c.dupecache.clear();
            c.dupecache_index = 0;
            c.last_cmp = None;
            if c.is_nil(CursorHalf::Both) {
                c.last_op = LastOp::None;
            }
        }
    }

    pub(crate) fn cursor_set_to_nil_txn_half(&mut self, cur: u64) {
        self.cursor_set_to_nil(cur, CursorHalf::Txn);
    }

    // called by the btree when entries shift under live cursors

    pub(crate) fn cursors_adjust_insert(&mut self, page: u64, slot: usize) {
        let ids = self.cursors_on_page.get(&page).cloned().unwrap_or_default();
        for id in ids {
            if let Some(c) = self.cursors.get_mut(&id) {
                if let Some(pos) = &mut c.btree.pos {
                    if pos.slot >= slot {
                        pos.slot += 1;
                    }
                }
            }
        }
    }

    pub(crate) fn cursors_adjust_remove(&mut self, page: u64, slot: usize) {
        let ids = self.cursors_on_page.get(&page).cloned().unwrap_or_default();
        for id in ids {
            let mut nil = false;
            if let Some(c) = self.cursors.get_mut(&id) {
                if let Some(pos) = &mut c.btree.pos {
                    if pos.slot == slot {
                        nil = true;
                    } else if pos.slot > slot {
                        pos.slot -= 1;
                    }
                }
            }
            if nil {
                self.cursor_set_to_nil(id, CursorHalf::Btree);
            }
        }
    }

    pub(crate) fn cursors_adjust_erase_dup(&mut self, page: u64, slot: usize, dup: u64) {
        let ids = self.cursors_on_page.get(&page).cloned().unwrap_or_default();
        for id in ids {
            let mut nil = false;
            if let Some(c) = self.cursors.get_mut(&id) {
                if let Some(pos) = &mut c.btree.pos {
                    if pos.slot == slot {
                        if pos.dup == dup {
                            nil = true;
                        } else if pos.dup > dup {
                            pos.dup -= 1;
                        }
                    }
                }
            }
            if nil {
                self.cursor_set_to_nil(id, CursorHalf::Btree);
            }
        }
    }

    pub(crate) fn cursors_adjust_split(&mut self, old: u64, new: u64, split_at: usize) {
        let ids = self.cursors_on_page.get(&old).cloned().unwrap_or_default();
        for id in ids {
            let moved = match self.cursors.get_mut(&id) {
                Some(c) => match &mut c.btree.pos {
                    Some(pos) if pos.slot >= split_at => {
                        pos.page = new;
                        pos.slot -= split_at;
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if moved {
                if let Some(list) = self.cursors_on_page.get_mut(&old) {
                    list.retain(|x| *x != id);
                }
                self.cursors_on_page.entry(new).or_default().push(id);
            }
        }
        let drained = self
            .cursors_on_page
            .get(&old)
            .map(|l| l.is_empty())
            .unwrap_or(false);
        if drained {
            self.cursors_on_page.remove(&old);
        }
    }

    pub(crate) fn cursors_invalidate_page(&mut self, page: u64) {
        let ids = self.cursors_on_page.get(&page).cloned().unwrap_or_default();
        for id in ids {
            self.cursor_set_to_nil(id, CursorHalf::Btree);
        }
    }

    // ------------------------------------------------------------------
    // views of the current position
    // ------------------------------------------------------------------

    fn cursor_meta(&self, cur: u64) -> BurrowResult<(u16, Option<u64>)> {
        let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
        Ok((c.db, c.txn_id))
    }

    /// Ops for `key` recorded by the cursor's own (still live) transaction.
    pub(crate) fn txn_node_ops(
        &self,
        db: u16,
        txn_id: Option<u64>,
        key: &[u8],
    ) -> Option<Vec<TxnOp>> {
        let id = txn_id?;
        let txn = self.txn.as_ref()?;
        if txn.id != id {
            return None;
        }
        txn.tree(db)?.get(key).map(|n| n.ops.clone())
    }

    fn txn_tree_has(&self, db: u16, txn_id: Option<u64>, key: &[u8]) -> bool {
        self.txn_node_ops(db, txn_id, key).is_some()
    }

    /// Full bytes of the key the cursor currently sits on.
    pub(crate) fn cursor_current_key_bytes(&mut self, cur: u64) -> BurrowResult<Bytes> {
        let (db, coupled_to_txn, txn_key, pos) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (c.db, c.coupled_to_txn, c.txn_cur.key.clone(), c.btree.pos)
        };
        if coupled_to_txn {
            let key = txn_key.ok_or(BurrowError::CursorIsNil)?;
            Ok(Bytes::from(key))
        } else {
            let pos = pos.ok_or(BurrowError::CursorIsNil)?;
            let key = self.btree_key_at(db, &pos)?;
            self.full_key_bytes(db, &key)
        }
    }

    pub(crate) fn cursor_current_record(&mut self, cur: u64) -> BurrowResult<Bytes> {
        let (db, txn_id, coupled_to_txn, txn_key, op, pos) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (
                c.db,
                c.txn_id,
                c.coupled_to_txn,
                c.txn_cur.key.clone(),
                c.txn_cur.op,
                c.btree.pos,
            )
        };
        if coupled_to_txn {
            let key = txn_key.ok_or(BurrowError::CursorIsNil)?;
            let ops = self
                .txn_node_ops(db, txn_id, &key)
                .ok_or(BurrowError::InternalError)?;
            ops.get(op)
                .and_then(|o| o.record().cloned())
                .ok_or(BurrowError::InternalError)
        } else {
            let pos = pos.ok_or(BurrowError::CursorIsNil)?;
            self.btree_record(db, &pos)
        }
    }

    // ------------------------------------------------------------------
    // dupecache
    // ------------------------------------------------------------------

    /// Rebuild the dupecache from the named halves: btree duplicates in
    /// storage order, then the key's op chain layered on top.
    pub(crate) fn cursor_update_dupecache(
        &mut self,
        cur: u64,
        what: CursorHalf,
    ) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        let (bt_pos, txn_key) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (c.btree.pos, c.txn_cur.key.clone())
        };

        let mut cache = DupeCache::new();
        if matches!(what, CursorHalf::Btree | CursorHalf::Both) {
            if let Some(pos) = bt_pos {
                let n = self.btree_dup_rids(db, &pos)?.len();
                for i in 0..n {
                    cache.append(DupeCacheLine::Btree(i as u64));
                }
            }
        }
        if matches!(what, CursorHalf::Txn | CursorHalf::Both) {
            if let Some(key) = txn_key {
                if let Some(ops) = self.txn_node_ops(db, txn_id, &key) {
                    apply_txn_ops(&mut cache, &ops);
                }
            }
        }

        if let Some(c) = self.cursors.get_mut(&cur) {
            c.dupecache = cache;
        }
        Ok(())
    }

    pub(crate) fn cursor_clear_dupecache(&mut self, cur: u64) {
        if let Some(c) = self.cursors.get_mut(&cur) {
            c.dupecache.clear();
            c.dupecache_index = 0;
        }
    }

    /// Couple the cursor to the duplicate at `idx` (1-based) of its
    /// dupecache; picks the authoritative half from the line's flavor.
    pub(crate) fn cursor_couple_to_dupe(&mut self, cur: u64, idx: usize) -> BurrowResult<()> {
        let line = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            idx.checked_sub(1)
                .and_then(|i| c.dupecache.get(i))
                .ok_or(BurrowError::KeyNotFound)?
        };
        match line {
            DupeCacheLine::Btree(dup) => {
                let mut pos = {
                    let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                    c.btree.pos.ok_or(BurrowError::InternalError)?
                };
                pos.dup = dup;
                self.btree_couple_cursor(cur, pos);
                if let Some(c) = self.cursors.get_mut(&cur) {
                    c.coupled_to_txn = false;
                }
            }
            DupeCacheLine::Txn(op) => {
                if let Some(c) = self.cursors.get_mut(&cur) {
                    if c.txn_cur.is_nil() {
                        return Err(BurrowError::InternalError);
                    }
                    c.txn_cur.op = op;
                    c.coupled_to_txn = true;
                }
            }
        }
        if let Some(c) = self.cursors.get_mut(&cur) {
            c.dupecache_index = idx;
        }
        Ok(())
    }

    /// True if the txn layered ops over the cursor's current btree key that
    /// erase or overwrite the btree's version.
    pub(crate) fn cursor_check_if_btree_key_is_erased_or_overwritten(
        &mut self,
        cur: u64,
    ) -> BurrowResult<bool> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        let pos = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            c.btree.pos.ok_or(BurrowError::CursorIsNil)?
        };
        let key = self.btree_key_at(db, &pos)?;
        let full = self.full_key_bytes(db, &key)?;
        let ops = match self.txn_node_ops(db, txn_id, &full) {
            Some(ops) => ops,
            None => return Ok(false),
        };
        let n = self.btree_dup_rids(db, &pos)?.len();
        let mut cache = DupeCache::new();
        for i in 0..n {
            cache.append(DupeCacheLine::Btree(i as u64));
        }
        apply_txn_ops(&mut cache, &ops);
        for i in 0..cache.count() {
            if matches!(cache.get(i), Some(DupeCacheLine::Btree(_))) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // sync
    // ------------------------------------------------------------------

    /// Bring the lagging (NIL) sub-cursor onto the active one's key.
    /// Returns whether both halves sit on equal keys afterwards.
    pub(crate) fn cursor_sync(&mut self, cur: u64, flags: SyncFlags) -> BurrowResult<bool> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        let (bt_nil, txn_nil) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (c.btree.is_nil(), c.txn_cur.is_nil())
        };

        if bt_nil && txn_nil {
            return Ok(false);
        }
        if !bt_nil && !txn_nil {
            // both positioned; just report whether they agree
            let pos = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                c.btree.pos.ok_or(BurrowError::InternalError)?
            };
            let bt_key = self.btree_key_at(db, &pos)?;
            let txn_key = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                c.txn_cur.key.clone().ok_or(BurrowError::InternalError)?
            };
            let cmp = self.compare_keys(db, &bt_key, &BtKey::from_user(&txn_key))?;
            if let Some(c) = self.cursors.get_mut(&cur) {
                c.last_cmp = Some(cmp);
            }
            return Ok(cmp == Ordering::Equal);
        }

        if txn_nil {
            // move the txn-cursor to the btree-cursor's key
            let pos = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                c.btree.pos.ok_or(BurrowError::InternalError)?
            };
            let key = self.btree_key_at(db, &pos)?;
            let full = self.full_key_bytes(db, &key)?;
            let tree_key = match (txn_id, self.txn.as_ref()) {
                (Some(id), Some(txn)) if txn.id == id => {
                    txn.tree(db).and_then(|t| tree_seek_geq(t, &full))
                }
                _ => None,
            };
            let equal = tree_key.as_deref() == Some(full.as_ref());
            if let Some(k) = tree_key {
                if equal || !flags.contains(SyncFlags::ONLY_EQUAL_KEY) {
                    if let Some(c) = self.cursors.get_mut(&cur) {
                        c.txn_cur.key = Some(k);
                        c.txn_cur.op = 0;
                        c.last_cmp = None;
                    }
                }
            }
            Ok(equal)
        } else {
            // move the btree-cursor to the txn-cursor's key
            let key = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                c.txn_cur.key.clone().ok_or(BurrowError::InternalError)?
            };
            match self.btree_seek(db, &BtKey::from_user(&key))? {
                SeekResult::Found(pos) => {
                    self.btree_couple_cursor(cur, pos);
                    if let Some(c) = self.cursors.get_mut(&cur) {
                        c.last_cmp = None;
                    }
                    Ok(true)
                }
                SeekResult::Gap { page, slot } if !flags.contains(SyncFlags::ONLY_EQUAL_KEY) => {
                    self.btree_couple_cursor(cur, BtPos { page, slot, dup: 0 });
                    if let Some(c) = self.cursors.get_mut(&cur) {
                        c.last_cmp = None;
                    }
                    Ok(false)
                }
                _ => Ok(false),
            }
        }
    }

    // ------------------------------------------------------------------
    // moves
    // ------------------------------------------------------------------

    /// One live merged key in direction `dir`, starting from the candidate
    /// sub-positions. Skips keys whose merged duplicate set is empty
    /// (entirely erased in the txn). Works on locals so an exhausted walk
    /// leaves the cursor untouched.
    #[allow(clippy::type_complexity)]
    fn merge_step(
        &mut self,
        db: u16,
        txn_id: Option<u64>,
        mut bt: Option<BtPos>,
        mut tk: Option<Vec<u8>>,
        dir: Dir,
    ) -> BurrowResult<Option<(Option<BtPos>, Option<Vec<u8>>, Option<Ordering>, DupeCache)>> {
        loop {
            if bt.is_none() && tk.is_none() {
                return Ok(None);
            }

            let cmp = match (&bt, &tk) {
                (Some(pos), Some(key)) => {
                    let bt_key = self.btree_key_at(db, pos)?;
                    Some(self.compare_keys(db, &bt_key, &BtKey::from_user(key))?)
                }
                _ => None,
            };

            // which sides sit on the current merged key
            let (use_bt, use_txn) = match (cmp, &bt, &tk) {
                (Some(Ordering::Equal), _, _) => (true, true),
                (Some(Ordering::Less), _, _) => match dir {
                    Dir::Forward => (true, false),
                    Dir::Backward => (false, true),
                },
                (Some(Ordering::Greater), _, _) => match dir {
                    Dir::Forward => (false, true),
                    Dir::Backward => (true, false),
                },
                (None, Some(_), None) => (true, false),
                (None, None, Some(_)) => (false, true),
                (None, None, None) => return Ok(None),
                (None, Some(_), Some(_)) => return Err(BurrowError::InternalError),
            };

            // merge the duplicate views of the chosen key
            let mut cache = DupeCache::new();
            if use_bt {
                if let Some(pos) = &bt {
                    let n = self.btree_dup_rids(db, pos)?.len();
                    for i in 0..n {
                        cache.append(DupeCacheLine::Btree(i as u64));
                    }
                    if use_txn {
                        if let Some(key) = &tk {
                            if let Some(ops) = self.txn_node_ops(db, txn_id, key) {
                                apply_txn_ops(&mut cache, &ops);
                            }
                        }
                    } else if txn_id.is_some() {
                        // the txn may still hold ops for this key even
                        // though its cursor sits elsewhere
                        let bt_key = self.btree_key_at(db, pos)?;
                        let full = self.full_key_bytes(db, &bt_key)?;
                        if let Some(ops) = self.txn_node_ops(db, txn_id, &full) {
                            apply_txn_ops(&mut cache, &ops);
                            let has_txn_line = (0..cache.count())
                                .any(|i| matches!(cache.get(i), Some(DupeCacheLine::Txn(_))));
                            if has_txn_line {
                                // those lines resolve against this key's op
                                // chain, so the txn half must sit here too
                                tk = Some(full.to_vec());
                            }
                        }
                    }
                }
            } else if let Some(key) = &tk {
                if let Some(ops) = self.txn_node_ops(db, txn_id, key) {
                    apply_txn_ops(&mut cache, &ops);
                }
            }

            if cache.count() > 0 {
                return Ok(Some((bt, tk, cmp, cache)));
            }

            // the key is invisible; step past it
            if use_bt {
                bt = match &bt {
                    Some(pos) => match dir {
                        Dir::Forward => self.btree_next(db, pos)?,
                        Dir::Backward => self.btree_prev(db, pos)?,
                    },
                    None => None,
                };
            }
            if use_txn {
                tk = self.txn_step(db, txn_id, tk.as_deref(), dir);
            }
        }
    }

    fn txn_step(
        &self,
        db: u16,
        txn_id: Option<u64>,
        key: Option<&[u8]>,
        dir: Dir,
    ) -> Option<Vec<u8>> {
        let id = txn_id?;
        let txn = self.txn.as_ref()?;
        if txn.id != id {
            return None;
        }
        let tree = txn.tree(db)?;
        match (key, dir) {
            (Some(k), Dir::Forward) => tree_next(tree, k),
            (Some(k), Dir::Backward) => tree_prev(tree, k),
            (None, _) => None,
        }
    }

    /// Commit a successful merge step into the cursor state.
    fn cursor_commit_position(
        &mut self,
        cur: u64,
        bt: Option<BtPos>,
        tk: Option<Vec<u8>>,
        cmp: Option<Ordering>,
        cache: DupeCache,
        dir: Dir,
    ) -> BurrowResult<()> {
        match bt {
            Some(pos) => self.btree_couple_cursor(cur, pos),
            None => self.btree_uncouple_cursor(cur),
        }
        let count = cache.count();
        if let Some(c) = self.cursors.get_mut(&cur) {
            c.txn_cur.key = tk;
            c.txn_cur.op = 0;
            c.last_cmp = cmp;
            c.dupecache = cache;
        }
        let idx = match dir {
            Dir::Forward => 1,
            Dir::Backward => count,
        };
        self.cursor_couple_to_dupe(cur, idx)
    }

    fn cursor_move_first(&mut self, cur: u64, dir: Dir) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        self.cursor_set_to_nil(cur, CursorHalf::Both);

        let bt = match dir {
            Dir::Forward => self.btree_first(db)?,
            Dir::Backward => self.btree_last(db)?,
        };
        let tk = match (txn_id, self.txn.as_ref()) {
            (Some(id), Some(txn)) if txn.id == id => match txn.tree(db) {
                Some(tree) => match dir {
                    Dir::Forward => tree_first(tree),
                    Dir::Backward => tree_last(tree),
                },
                None => None,
            },
            _ => None,
        };

        match self.merge_step(db, txn_id, bt, tk, dir)? {
            Some((bt, tk, cmp, cache)) => self.cursor_commit_position(cur, bt, tk, cmp, cache, dir),
            None => Err(BurrowError::KeyNotFound),
        }
    }

    fn cursor_move_step(&mut self, cur: u64, dir: Dir) -> BurrowResult<()> {
        // stage 1: more duplicates of the current key in this direction?
        {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            if c.is_nil(CursorHalf::Both) {
                // a nil cursor starts from the matching end
                return self.cursor_move_first(cur, dir);
            }
            match dir {
                Dir::Forward => {
                    if c.dupecache_index > 0 && c.dupecache_index < c.dupecache.count() {
                        let idx = c.dupecache_index + 1;
                        return self.cursor_couple_to_dupe(cur, idx);
                    }
                }
                Dir::Backward => {
                    if c.dupecache_index > 1 {
                        let idx = c.dupecache_index - 1;
                        return self.cursor_couple_to_dupe(cur, idx);
                    }
                }
            }
        }

        // stage 2: done with this key's duplicates; position the lagging
        // sub-cursor so the lockstep walk sees pending keys on both sides
        self.cursor_clear_dupecache(cur);
        self.cursor_sync(cur, SyncFlags::DONT_LOAD_KEY)?;

        let (db, txn_id) = self.cursor_meta(cur)?;
        let (bt, tk, mut cmp) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (c.btree.pos, c.txn_cur.key.clone(), c.last_cmp)
        };

        // stage 3: refresh a stale compare, then advance whichever side
        // sits on the current key
        if cmp.is_none() {
            if let (Some(pos), Some(key)) = (&bt, &tk) {
                let bt_key = self.btree_key_at(db, pos)?;
                cmp = Some(self.compare_keys(db, &bt_key, &BtKey::from_user(key))?);
            }
        }
        let (advance_bt, advance_txn) = match (cmp, &bt, &tk) {
            (Some(Ordering::Equal), _, _) => (true, true),
            (Some(Ordering::Less), _, _) => match dir {
                Dir::Forward => (true, false),
                Dir::Backward => (false, true),
            },
            (Some(Ordering::Greater), _, _) => match dir {
                Dir::Forward => (false, true),
                Dir::Backward => (true, false),
            },
            (None, Some(_), None) => (true, false),
            (None, None, Some(_)) => (false, true),
            _ => return Err(BurrowError::CursorIsNil),
        };

        let next_bt = if advance_bt {
            match &bt {
                Some(pos) => match dir {
                    Dir::Forward => self.btree_next(db, pos)?,
                    Dir::Backward => self.btree_prev(db, pos)?,
                },
                None => None,
            }
        } else {
            bt
        };
        let next_tk = if advance_txn {
            self.txn_step(db, txn_id, tk.as_deref(), dir)
        } else {
            tk
        };

        // stage 4: land on the next visible key; exhaustion leaves the
        // cursor where it was
        match self.merge_step(db, txn_id, next_bt, next_tk, dir)? {
            Some((bt, tk, cmp, cache)) => self.cursor_commit_position(cur, bt, tk, cmp, cache, dir),
            None => Err(BurrowError::KeyNotFound),
        }
    }

    pub(crate) fn cursor_move(
        &mut self,
        cur: u64,
        key_out: Option<&mut Key>,
        record_out: Option<&mut Record>,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        if flags.contains(MoveFlags::FIRST) {
            self.cursor_move_first(cur, Dir::Forward)?;
        } else if flags.contains(MoveFlags::LAST) {
            self.cursor_move_first(cur, Dir::Backward)?;
        } else if flags.contains(MoveFlags::NEXT) {
            self.cursor_move_step(cur, Dir::Forward)?;
        } else if flags.contains(MoveFlags::PREVIOUS) {
            self.cursor_move_step(cur, Dir::Backward)?;
        } else {
            // "current": the cursor must be coupled, and a btree position
            // must not have been superseded by the transaction
            let (nil, coupled_to_txn) = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                (c.is_nil(CursorHalf::Both), c.coupled_to_txn)
            };
            if nil {
                return Err(BurrowError::CursorIsNil);
            }
            if !coupled_to_txn && self.cursor_check_if_btree_key_is_erased_or_overwritten(cur)? {
                return Err(BurrowError::KeyNotFound);
            }
        }

        if let Some(c) = self.cursors.get_mut(&cur) {
            if flags.contains(MoveFlags::NEXT) {
                c.last_op = LastOp::Next;
            } else if flags.contains(MoveFlags::PREVIOUS) {
                c.last_op = LastOp::Previous;
            } else if !flags.is_empty() {
                c.last_op = LastOp::None;
            }
        }

        if let Some(out) = key_out {
            let bytes = self.cursor_current_key_bytes(cur)?;
            out.fill(&bytes);
        }
        if let Some(out) = record_out {
            let bytes = self.cursor_current_record(cur)?;
            out.fill(&bytes);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // find / insert / erase / overwrite
    // ------------------------------------------------------------------

    pub(crate) fn cursor_find(&mut self, cur: u64, key: &[u8]) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        self.cursor_set_to_nil(cur, CursorHalf::Both);

        // probe the txn tree first, then the btree
        let txn_has = self.txn_tree_has(db, txn_id, key);
        let bt = match self.btree_seek(db, &BtKey::from_user(key))? {
            SeekResult::Found(pos) => Some(pos),
            _ => None,
        };
        if !txn_has && bt.is_none() {
            return Err(BurrowError::KeyNotFound);
        }

        if let Some(pos) = bt {
            self.btree_couple_cursor(cur, pos);
        }
        if txn_has {
            if let Some(c) = self.cursors.get_mut(&cur) {
                c.txn_cur.key = Some(key.to_vec());
                c.txn_cur.op = 0;
            }
        }

        let what = match (bt.is_some(), txn_has) {
            (true, true) => CursorHalf::Both,
            (true, false) => CursorHalf::Btree,
            _ => CursorHalf::Txn,
        };
        self.cursor_update_dupecache(cur, what)?;

        let count = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            c.dupecache.count()
        };
        if count == 0 {
            // the txn erased every live version of this key
            self.cursor_set_to_nil(cur, CursorHalf::Both);
            return Err(BurrowError::KeyNotFound);
        }
        self.cursor_couple_to_dupe(cur, 1)?;
        if let Some(c) = self.cursors.get_mut(&cur) {
            c.last_op = LastOp::LookupInsert;
            c.last_cmp = if bt.is_some() && txn_has {
                Some(Ordering::Equal)
            } else {
                None
            };
        }
        trace!("cursor {} found key, {} duplicate(s)", cur, count);
        Ok(())
    }

    pub(crate) fn cursor_insert(
        &mut self,
        cur: u64,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        let dupe_ref = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            c.dupecache_index
        };

        let position = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            DupPosition::First
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
            if dupe_ref == 0 {
                return Err(BurrowError::CursorIsNil);
            }
            DupPosition::Before(dupe_ref as u32)
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
            if dupe_ref == 0 {
                return Err(BurrowError::CursorIsNil);
            }
            DupPosition::After(dupe_ref as u32)
        } else {
            DupPosition::Last
        };

        self.db_insert_impl(db, txn_id, key, record, flags, position, Some(cur))
    }

    pub(crate) fn cursor_erase(&mut self, cur: u64) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            if c.is_nil(CursorHalf::Both) {
                return Err(BurrowError::CursorIsNil);
            }
        }
        let key = self.cursor_current_key_bytes(cur)?;
        let dupe_index = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            c.dupecache_index
        };

        let txn_live = matches!((txn_id, self.txn.as_ref()),
            (Some(id), Some(txn)) if txn.id == id);
        if txn_live {
            let count = self.merged_dup_count(db, txn_id, &key)?;
            if count == 0 {
                return Err(BurrowError::KeyNotFound);
            }
            let dup = if count > 1 && dupe_index > 0 {
                Some(dupe_index as u32)
            } else {
                None
            };
            if let Some(txn) = self.txn.as_mut() {
                txn.record_op(db, &key, TxnOpKind::Erase { dup });
            }
            self.cursor_set_to_nil(cur, CursorHalf::Both);
            Ok(())
        } else {
            let dups = match self.btree_seek(db, &BtKey::from_user(&key))? {
                SeekResult::Found(pos) => self.btree_dup_rids(db, &pos)?.len(),
                _ => return Err(BurrowError::KeyNotFound),
            };
            // sibling cursors on the dead entry are invalidated by the
            // btree's cursor adjustments; this cursor goes with them
            if dups > 1 && dupe_index > 0 {
                self.btree_erase_dup(db, &key, dupe_index as u32)?;
            } else {
                self.btree_erase_key(db, &key)?;
            }
            self.cursor_set_to_nil(cur, CursorHalf::Both);
            Ok(())
        }
    }

    pub(crate) fn cursor_overwrite(&mut self, cur: u64, record: &[u8]) -> BurrowResult<()> {
        let (db, txn_id) = self.cursor_meta(cur)?;
        let (nil, coupled_to_txn, dupe_index) = {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            (
                c.is_nil(CursorHalf::Both),
                c.coupled_to_txn,
                c.dupecache_index,
            )
        };
        if nil {
            return Err(BurrowError::CursorIsNil);
        }

        if coupled_to_txn {
            // the cursor sits on its own pending op; replace the payload
            // in place
            let (key, op_idx) = {
                let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                (
                    c.txn_cur.key.clone().ok_or(BurrowError::InternalError)?,
                    c.txn_cur.op,
                )
            };
            let txn = self.txn.as_mut().ok_or(BurrowError::InternalError)?;
            if Some(txn.id) != txn_id {
                return Err(BurrowError::InternalError);
            }
            let node = txn
                .trees
                .get_mut(&db)
                .and_then(|t| t.get_mut(&key))
                .ok_or(BurrowError::InternalError)?;
            let slot = node
                .ops
                .get_mut(op_idx)
                .and_then(|op| op.record_mut())
                .ok_or(BurrowError::InternalError)?;
            *slot = Bytes::copy_from_slice(record);
            Ok(())
        } else {
            let txn_live = matches!((txn_id, self.txn.as_ref()),
                (Some(id), Some(txn)) if txn.id == id);
            if txn_live {
                // layer the overwrite over the btree version
                let key = self.cursor_current_key_bytes(cur)?;
                let count = self.merged_dup_count(db, txn_id, &key)?;
                let idx = dupe_index.max(1) as u32;
                if count > 1 {
                    if let Some(txn) = self.txn.as_mut() {
                        txn.record_op(db, &key, TxnOpKind::Erase { dup: Some(idx) });
                        txn.record_op(
                            db,
                            &key,
                            TxnOpKind::InsertDuplicate {
                                record: Bytes::copy_from_slice(record),
                                position: DupPosition::Before(idx),
                            },
                        );
                    }
                } else if let Some(txn) = self.txn.as_mut() {
                    txn.record_op(
                        db,
                        &key,
                        TxnOpKind::InsertOverwrite {
                            record: Bytes::copy_from_slice(record),
                        },
                    );
                }
                if let Some(c) = self.cursors.get_mut(&cur) {
                    c.txn_cur.key = Some(key.to_vec());
                }
                self.cursor_update_dupecache(cur, CursorHalf::Both)?;
                self.cursor_couple_to_dupe(cur, dupe_index.max(1))?;
                Ok(())
            } else {
                let pos = {
                    let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
                    c.btree.pos.ok_or(BurrowError::CursorIsNil)?
                };
                self.btree_overwrite_dup(db, &pos, record)
            }
        }
    }

    /// Number of duplicates of the current key, refreshing the dupecache.
    pub(crate) fn cursor_get_duplicate_count(&mut self, cur: u64) -> BurrowResult<usize> {
        {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            if c.is_nil(CursorHalf::Both) {
                return Err(BurrowError::CursorIsNil);
            }
        }
        let equal = self.cursor_sync(cur, SyncFlags::ONLY_EQUAL_KEY)?;
        let what = if equal {
            CursorHalf::Both
        } else {
            let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
            if c.coupled_to_txn {
                CursorHalf::Txn
            } else {
                CursorHalf::Btree
            }
        };
        self.cursor_update_dupecache(cur, what)?;
        let c = self.cursors.get(&cur).ok_or(BurrowError::InvalidParameter)?;
        Ok(c.dupecache.count())
    }

    /// Count the live keys of a database as the (optional) transaction
    /// sees them, by walking the merged view.
    pub(crate) fn db_key_count(&mut self, db: u16, txn_id: Option<u64>) -> BurrowResult<u64> {
        let mut count = 0u64;
        let mut bt = self.btree_first(db)?;
        let mut tk = match (txn_id, self.txn.as_ref()) {
            (Some(id), Some(txn)) if txn.id == id => txn.tree(db).and_then(tree_first),
            _ => None,
        };
        loop {
            match self.merge_step(db, txn_id, bt, tk, Dir::Forward)? {
                None => return Ok(count),
                Some((nbt, ntk, cmp, _cache)) => {
                    count += 1;
                    let (advance_bt, advance_txn) = match cmp {
                        Some(Ordering::Equal) => (true, true),
                        Some(Ordering::Less) => (true, false),
                        Some(Ordering::Greater) => (false, true),
                        None => (nbt.is_some(), ntk.is_some()),
                    };
                    bt = if advance_bt {
                        match &nbt {
                            Some(pos) => self.btree_next(db, pos)?,
                            None => None,
                        }
                    } else {
                        nbt
                    };
                    tk = if advance_txn {
                        self.txn_step(db, txn_id, ntk.as_deref(), Dir::Forward)
                    } else {
                        ntk
                    };
                }
            }
        }
    }
}

/// A database cursor. Closing happens on drop or via [`Cursor::close`].
pub struct Cursor {
    pub(crate) env: Pod<EnvInner>,
    pub(crate) id: u64,
}

impl Cursor {
    /// Locate an exact key and couple to its first visible duplicate.
    pub fn find(&self, key: &[u8]) -> BurrowResult<()> {
        self.env.wl().cursor_find(self.id, key)
    }

    /// Move the cursor and fetch the landed-on key and/or record.
    pub fn move_to(
        &self,
        key: Option<&mut Key>,
        record: Option<&mut Record>,
        flags: MoveFlags,
    ) -> BurrowResult<()> {
        self.env.wl().cursor_move(self.id, key, record, flags)
    }

    pub fn move_first(&self, key: Option<&mut Key>, record: Option<&mut Record>) -> BurrowResult<()> {
        self.move_to(key, record, MoveFlags::FIRST)
    }

    pub fn move_last(&self, key: Option<&mut Key>, record: Option<&mut Record>) -> BurrowResult<()> {
        self.move_to(key, record, MoveFlags::LAST)
    }

    pub fn move_next(&self, key: Option<&mut Key>, record: Option<&mut Record>) -> BurrowResult<()> {
        self.move_to(key, record, MoveFlags::NEXT)
    }

    pub fn move_previous(
        &self,
        key: Option<&mut Key>,
        record: Option<&mut Record>,
    ) -> BurrowResult<()> {
        self.move_to(key, record, MoveFlags::PREVIOUS)
    }

    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> BurrowResult<()> {
        self.env.wl().cursor_insert(self.id, key, record, flags)
    }

    /// Replace the record of the currently coupled duplicate.
    pub fn overwrite(&self, record: &[u8]) -> BurrowResult<()> {
        self.env.wl().cursor_overwrite(self.id, record)
    }

    /// Erase the currently coupled key or duplicate; the cursor becomes
    /// nil on success.
    pub fn erase(&self) -> BurrowResult<()> {
        self.env.wl().cursor_erase(self.id)
    }

    pub fn get_duplicate_count(&self) -> BurrowResult<usize> {
        self.env.wl().cursor_get_duplicate_count(self.id)
    }

    /// Whether the named half (or the whole cursor) points at nothing.
    pub fn is_nil(&self, what: CursorHalf) -> bool {
        let inner = self.env.rl();
        inner
            .cursors
            .get(&self.id)
            .map(|c| c.is_nil(what))
            .unwrap_or(true)
    }

    /// Detach the named half; detaching both resets the duplicate cache.
    pub fn set_to_nil(&self, what: CursorHalf) {
        self.env.wl().cursor_set_to_nil(self.id, what);
    }

    /// Synchronize the two sub-cursors; returns whether they sit on equal
    /// keys.
    pub fn sync(&self, flags: SyncFlags) -> BurrowResult<bool> {
        self.env.wl().cursor_sync(self.id, flags)
    }

    /// Deep-copy this cursor, including its position and dupecache.
    pub fn try_clone(&self) -> BurrowResult<Cursor> {
        let id = self.env.wl().cursor_clone(self.id)?;
        Ok(Cursor {
            env: self.env.clone(),
            id,
        })
    }

    pub fn close(self) {
        // drop does the work
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.env.wl().cursor_close(self.id);
    }
}
