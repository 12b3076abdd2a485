use crate::txn::{DupPosition, TxnOp, TxnOpKind};

/// One line of the duplicate cache: a duplicate that lives in the btree's
/// duplicate table, or one that only exists as a pending transaction op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupeCacheLine {
    /// Index into the btree key's duplicate table.
    Btree(u64),
    /// Index into the current key's op chain in the transaction tree.
    Txn(usize),
}

/// The ordered, merged duplicate set of a cursor's current key, as visible
/// to the current transaction. Positions handed to the user are 1-based
/// indices into this sequence.
#[derive(Debug, Clone)]
pub(crate) struct DupeCache {
    lines: Vec<DupeCacheLine>,
}

impl DupeCache {
    pub fn new() -> Self {
        Self {
            lines: Vec::with_capacity(8),
        }
    }

    pub fn count(&self) -> usize {
        self.lines.len()
    }

    pub fn get(&self, idx: usize) -> Option<DupeCacheLine> {
        self.lines.get(idx).copied()
    }

    pub fn insert(&mut self, position: usize, line: DupeCacheLine) {
        self.lines.insert(position, line);
    }

    pub fn append(&mut self, line: DupeCacheLine) {
        self.lines.push(line);
    }

    pub fn erase(&mut self, position: usize) {
        self.lines.remove(position);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Layer a key's transaction op chain, in insertion order, over the lines
/// already collected from the btree. This is the merge rule that makes a
/// cursor see committed and pending duplicates as one sequence.
pub(crate) fn apply_txn_ops(cache: &mut DupeCache, ops: &[TxnOp]) {
    for (idx, op) in ops.iter().enumerate() {
        match &op.kind {
            // a plain insert or overwrite supersedes everything before it
            TxnOpKind::Insert { .. } | TxnOpKind::InsertOverwrite { .. } => {
                cache.clear();
                cache.append(DupeCacheLine::Txn(idx));
            }
            TxnOpKind::InsertDuplicate { position, .. } => {
                let at = match position {
                    DupPosition::First => 0,
                    DupPosition::Last => cache.count(),
                    // references are 1-based positions in the merged
                    // sequence as it stood when the op was recorded
                    DupPosition::Before(r) => {
                        (*r as usize).saturating_sub(1).min(cache.count())
                    }
                    DupPosition::After(r) => (*r as usize).min(cache.count()),
                };
                cache.insert(at, DupeCacheLine::Txn(idx));
            }
            TxnOpKind::Erase { dup: Some(i) } => {
                let i = *i as usize;
                if i >= 1 && i <= cache.count() {
                    cache.erase(i - 1);
                }
            }
            TxnOpKind::Erase { dup: None } => cache.clear(),
            TxnOpKind::Nop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn op(kind: TxnOpKind) -> TxnOp {
        TxnOp { id: 0, kind }
    }

    fn btree_lines(cache: &mut DupeCache, n: u64) {
        for i in 0..n {
            cache.append(DupeCacheLine::Btree(i));
        }
    }

    #[test]
    fn test_insert_supersedes_btree_lines() {
        let mut cache = DupeCache::new();
        btree_lines(&mut cache, 3);
        apply_txn_ops(
            &mut cache,
            &[op(TxnOpKind::InsertOverwrite {
                record: Bytes::from_static(b"r"),
            })],
        );
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get(0), Some(DupeCacheLine::Txn(0)));
    }

    #[test]
    fn test_duplicate_positions_and_erase() {
        // btree holds [A, B, C]; the txn inserts D after B, then erases
        // the first duplicate. Merged view: [B, D, C].
        let mut cache = DupeCache::new();
        btree_lines(&mut cache, 3);
        apply_txn_ops(
            &mut cache,
            &[
                op(TxnOpKind::InsertDuplicate {
                    record: Bytes::from_static(b"D"),
                    position: DupPosition::After(2),
                }),
                op(TxnOpKind::Erase { dup: Some(1) }),
            ],
        );
        assert_eq!(cache.count(), 3);
        assert_eq!(cache.get(0), Some(DupeCacheLine::Btree(1)));
        assert_eq!(cache.get(1), Some(DupeCacheLine::Txn(0)));
        assert_eq!(cache.get(2), Some(DupeCacheLine::Btree(2)));
    }

    #[test]
    fn test_erase_all_clears() {
        let mut cache = DupeCache::new();
        btree_lines(&mut cache, 2);
        apply_txn_ops(&mut cache, &[op(TxnOpKind::Erase { dup: None })]);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_first_last_hints() {
        let mut cache = DupeCache::new();
        btree_lines(&mut cache, 1);
        apply_txn_ops(
            &mut cache,
            &[
                op(TxnOpKind::InsertDuplicate {
                    record: Bytes::from_static(b"x"),
                    position: DupPosition::First,
                }),
                op(TxnOpKind::InsertDuplicate {
                    record: Bytes::from_static(b"y"),
                    position: DupPosition::Last,
                }),
            ],
        );
        assert_eq!(cache.get(0), Some(DupeCacheLine::Txn(0)));
        assert_eq!(cache.get(1), Some(DupeCacheLine::Btree(0)));
        assert_eq!(cache.get(2), Some(DupeCacheLine::Txn(1)));
    }

    #[test]
    fn test_out_of_range_erase_is_ignored() {
        let mut cache = DupeCache::new();
        btree_lines(&mut cache, 1);
        apply_txn_ops(&mut cache, &[op(TxnOpKind::Erase { dup: Some(5) })]);
        assert_eq!(cache.count(), 1);
    }
}
