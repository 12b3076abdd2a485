use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};

use bytes::Bytes;
use log::debug;

use crate::{
    env::EnvInner,
    error::{BurrowError, BurrowResult},
    flags::{EnvFlags, InsertFlags},
    utils::{HandyRwLock, Pod},
};

/// Placement of a pending duplicate, resolved against the merged duplicate
/// sequence as it stood when the op was recorded (references are 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupPosition {
    First,
    Last,
    Before(u32),
    After(u32),
}

#[derive(Debug, Clone)]
pub(crate) enum TxnOpKind {
    Insert { record: Bytes },
    InsertOverwrite { record: Bytes },
    InsertDuplicate { record: Bytes, position: DupPosition },
    /// `dup: None` erases the whole key; `Some(i)` erases the 1-based
    /// duplicate `i` of the merged sequence at op time.
    Erase { dup: Option<u32> },
    Nop,
}

#[derive(Debug, Clone)]
pub(crate) struct TxnOp {
    #[allow(dead_code)]
    pub id: u64,
    pub kind: TxnOpKind,
}

impl TxnOp {
    /// The record this op contributes, if it is a live insert.
    pub fn record(&self) -> Option<&Bytes> {
        match &self.kind {
            TxnOpKind::Insert { record }
            | TxnOpKind::InsertOverwrite { record }
            | TxnOpKind::InsertDuplicate { record, .. } => Some(record),
            _ => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Bytes> {
        match &mut self.kind {
            TxnOpKind::Insert { record }
            | TxnOpKind::InsertOverwrite { record }
            | TxnOpKind::InsertDuplicate { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Append-only chain of modifications attached to one key.
#[derive(Debug, Default, Clone)]
pub(crate) struct TxnNode {
    pub ops: Vec<TxnOp>,
}

/// The in-memory state of the single active transaction: one ordered
/// op-tree per database, plus the working set of pages it pins in the
/// cache.
pub(crate) struct TxnState {
    pub id: u64,
    pub name: Option<String>,
    pub trees: HashMap<u16, BTreeMap<Vec<u8>, TxnNode>>,
    pub pages: HashSet<u64>,
    next_op_id: u64,
}

impl TxnState {
    pub fn new(id: u64, name: Option<String>) -> Self {
        Self {
            id,
            name,
            trees: HashMap::new(),
            pages: HashSet::new(),
            next_op_id: 1,
        }
    }

    pub fn tree(&self, db: u16) -> Option<&BTreeMap<Vec<u8>, TxnNode>> {
        self.trees.get(&db)
    }

    pub fn record_op(&mut self, db: u16, key: &[u8], kind: TxnOpKind) {
        let id = self.next_op_id;
        self.next_op_id += 1;
        self.trees
            .entry(db)
            .or_default()
            .entry(key.to_vec())
            .or_default()
            .ops
            .push(TxnOp { id, kind });
    }
}

// Ordered navigation over an op-tree; the txn-cursor's moves reduce to
// these range probes.

pub(crate) fn tree_first(tree: &BTreeMap<Vec<u8>, TxnNode>) -> Option<Vec<u8>> {
    tree.keys().next().cloned()
}

pub(crate) fn tree_last(tree: &BTreeMap<Vec<u8>, TxnNode>) -> Option<Vec<u8>> {
    tree.keys().next_back().cloned()
}

pub(crate) fn tree_next(tree: &BTreeMap<Vec<u8>, TxnNode>, key: &[u8]) -> Option<Vec<u8>> {
    tree.range::<[u8], _>((Excluded(key), Unbounded))
        .next()
        .map(|(k, _)| k.clone())
}

pub(crate) fn tree_prev(tree: &BTreeMap<Vec<u8>, TxnNode>, key: &[u8]) -> Option<Vec<u8>> {
    tree.range::<[u8], _>((Unbounded, Excluded(key)))
        .next_back()
        .map(|(k, _)| k.clone())
}

/// First key in the tree that is `>=` the probe.
pub(crate) fn tree_seek_geq(tree: &BTreeMap<Vec<u8>, TxnNode>, key: &[u8]) -> Option<Vec<u8>> {
    tree.range::<[u8], _>((std::ops::Bound::Included(key), Unbounded))
        .next()
        .map(|(k, _)| k.clone())
}

/// The transaction-side half of a fused cursor: the key it currently sits
/// on, and which op of that key's chain it is coupled to.
#[derive(Debug, Default, Clone)]
pub(crate) struct TxnCursorState {
    pub key: Option<Vec<u8>>,
    pub op: usize,
}

impl TxnCursorState {
    pub fn is_nil(&self) -> bool {
        self.key.is_none()
    }

    pub fn set_to_nil(&mut self) {
        self.key = None;
        self.op = 0;
    }
}

impl EnvInner {
    pub(crate) fn txn_begin(&mut self, name: Option<String>) -> BurrowResult<u64> {
        if !self.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(BurrowError::InvalidParameter);
        }
        // one logical writer: a single active transaction per environment
        if self.txn.is_some() {
            return Err(BurrowError::LimitsReached);
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        debug!("begin txn {}", id);
        self.txn = Some(TxnState::new(id, name));
        Ok(id)
    }

    /// Apply the op-tree to the btree, key by key in order, each chain in
    /// insertion order, then detach the transaction from all cursors.
    pub(crate) fn txn_commit(&mut self, id: u64) -> BurrowResult<()> {
        let txn = self.take_txn(id)?;
        debug!("commit txn {}", id);

        for (db, tree) in txn.trees.iter() {
            for (key, node) in tree.iter() {
                for op in node.ops.iter() {
                    self.apply_op(*db, key, op)?;
                }
            }
        }

        self.detach_txn_from_cursors(id);
        Ok(())
    }

    /// Discard the op-tree; nothing reaches the btree.
    pub(crate) fn txn_abort(&mut self, id: u64) -> BurrowResult<()> {
        let _ = self.take_txn(id)?;
        debug!("abort txn {}", id);
        self.detach_txn_from_cursors(id);
        Ok(())
    }

    fn take_txn(&mut self, id: u64) -> BurrowResult<TxnState> {
        let matches_id = self.txn.as_ref().map(|t| t.id == id).unwrap_or(false);
        if !matches_id {
            return Err(BurrowError::InvalidParameter);
        }
        self.txn.take().ok_or(BurrowError::InternalError)
    }

    fn apply_op(&mut self, db: u16, key: &[u8], op: &TxnOp) -> BurrowResult<()> {
        let structural = |e: BurrowError| {
            // the op chain was validated when it was recorded; a mismatch
            // at apply time means the engine state is inconsistent
            if e == BurrowError::KeyNotFound || e == BurrowError::DuplicateKey {
                BurrowError::InternalError
            } else {
                e
            }
        };
        match &op.kind {
            TxnOpKind::Insert { record } => self
                .btree_insert(db, key, record, InsertFlags::empty(), DupPosition::Last)
                .map(|_| ())
                .map_err(structural),
            TxnOpKind::InsertOverwrite { record } => self
                .btree_insert(db, key, record, InsertFlags::OVERWRITE, DupPosition::Last)
                .map(|_| ())
                .map_err(structural),
            TxnOpKind::InsertDuplicate { record, position } => self
                .btree_insert(db, key, record, InsertFlags::DUPLICATE, *position)
                .map(|_| ())
                .map_err(structural),
            TxnOpKind::Erase { dup: None } => {
                self.btree_erase_key(db, key).map_err(structural)
            }
            TxnOpKind::Erase { dup: Some(i) } => {
                self.btree_erase_dup(db, key, *i).map_err(structural)
            }
            TxnOpKind::Nop => Ok(()),
        }
    }

    /// Reset the txn-half of every cursor bound to this transaction; their
    /// dupecaches may reference ops that no longer exist.
    fn detach_txn_from_cursors(&mut self, id: u64) {
        let ids: Vec<u64> = self.cursors.keys().copied().collect();
        for cur_id in ids {
            let bound = self
                .cursors
                .get(&cur_id)
                .map(|c| c.txn_id == Some(id))
                .unwrap_or(false);
            if bound {
                self.cursor_set_to_nil_txn_half(cur_id);
            }
        }
    }
}

/// Handle for the single active transaction. Dropping an uncommitted
/// transaction aborts it.
pub struct Transaction {
    pub(crate) env: Pod<EnvInner>,
    pub(crate) id: u64,
    pub(crate) done: bool,
    pub(crate) name: Option<String>,
}

impl Transaction {
    pub fn commit(mut self) -> BurrowResult<()> {
        self.done = true;
        self.env.wl().txn_commit(self.id)
    }

    pub fn abort(mut self) -> BurrowResult<()> {
        self.done = true;
        self.env.wl().txn_abort(self.id)
    }

    pub fn get_name(&self) -> Option<String> {
        self.name.clone()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.env.wl().txn_abort(self.id);
        }
    }
}
