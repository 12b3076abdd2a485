use burrow_db::{BurrowError, CursorHalf, Env, EnvFlags, InsertFlags, Key, MoveFlags, Record};
use rand::prelude::*;

mod test_utils;
use test_utils::{db_path, setup};

#[test]
fn test_cursor_lifecycle() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();
    let cursor = db.cursor(None).unwrap();

    cursor.insert(b"12345", b"12345", InsertFlags::empty()).unwrap();
    assert_eq!(
        cursor.insert(b"12345", b"12345", InsertFlags::empty()),
        Err(BurrowError::DuplicateKey)
    );
    cursor.overwrite(b"54321").unwrap();

    let clone = cursor.try_clone().unwrap();

    let mut key = Key::new();
    let mut record = Record::new();
    cursor.move_first(Some(&mut key), Some(&mut record)).unwrap();
    assert_eq!(key.data, b"12345".to_vec());
    assert_eq!(record.data, b"54321".to_vec());

    cursor.move_last(Some(&mut key), Some(&mut record)).unwrap();
    assert_eq!(key.data, b"12345".to_vec());

    // a single key: stepping off either end fails
    assert_eq!(
        cursor.move_next(None, None),
        Err(BurrowError::KeyNotFound)
    );
    assert_eq!(
        cursor.move_previous(None, None),
        Err(BurrowError::KeyNotFound)
    );

    cursor.find(b"12345").unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 1);

    cursor.erase().unwrap();
    assert!(cursor.is_nil(CursorHalf::Both));
    assert_eq!(cursor.erase(), Err(BurrowError::CursorIsNil));
    assert_eq!(cursor.find(b"12345"), Err(BurrowError::KeyNotFound));

    // the clone was pointing at the erased key and must be nil too
    assert_eq!(clone.erase(), Err(BurrowError::CursorIsNil));

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_full_scan_is_sorted_and_complete() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();

    let mut rng = rand::thread_rng();
    let mut keys: Vec<u32> = (0..500).map(|_| rng.gen_range(0..1_000_000)).collect();
    keys.sort_unstable();
    keys.dedup();
    let mut shuffled = keys.clone();
    shuffled.shuffle(&mut rng);

    for k in &shuffled {
        db.insert(
            None,
            format!("{:08}", k).as_bytes(),
            &k.to_le_bytes(),
            InsertFlags::empty(),
        )
        .unwrap();
    }

    // a full forward scan sees every key exactly once, ascending
    let cursor = db.cursor(None).unwrap();
    let mut key = Key::new();
    let mut record = Record::new();
    let mut seen = Vec::new();
    cursor.move_first(Some(&mut key), Some(&mut record)).unwrap();
    seen.push(key.data.clone());
    while cursor.move_next(Some(&mut key), Some(&mut record)).is_ok() {
        seen.push(key.data.clone());
    }
    let expect: Vec<Vec<u8>> = keys
        .iter()
        .map(|k| format!("{:08}", k).into_bytes())
        .collect();
    assert_eq!(seen, expect);

    // and the backward scan is its mirror
    let mut seen_back = Vec::new();
    cursor.move_last(Some(&mut key), None).unwrap();
    seen_back.push(key.data.clone());
    while cursor.move_previous(Some(&mut key), None).is_ok() {
        seen_back.push(key.data.clone());
    }
    seen_back.reverse();
    assert_eq!(seen_back, expect);

    assert_eq!(db.get_key_count(None).unwrap(), keys.len() as u64);
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_duplicate_positions() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();
    let cursor = db.cursor(None).unwrap();

    cursor.insert(b"k", b"B", InsertFlags::empty()).unwrap();
    cursor
        .insert(b"k", b"D", InsertFlags::DUPLICATE_INSERT_LAST)
        .unwrap();
    cursor
        .insert(b"k", b"A", InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();
    // the cursor now sits on A (position 1); insert after it
    cursor
        .insert(b"k", b"BB", InsertFlags::DUPLICATE_INSERT_AFTER)
        .unwrap();

    let mut record = Record::new();
    let mut dupes = Vec::new();
    cursor.move_first(None, Some(&mut record)).unwrap();
    dupes.push(record.data.clone());
    while cursor.move_next(None, Some(&mut record)).is_ok() {
        dupes.push(record.data.clone());
    }
    assert_eq!(
        dupes,
        vec![b"A".to_vec(), b"BB".to_vec(), b"B".to_vec(), b"D".to_vec()]
    );
    assert_eq!(cursor.get_duplicate_count().unwrap(), 4);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

// The btree holds key "k" with duplicates [A, B, C]; an open transaction
// inserts D after B and erases the first duplicate. The cursor must report
// three duplicates and enumerate [B, D, C].
#[test]
fn test_duplicate_merge_with_transaction() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"k", b"A", InsertFlags::empty()).unwrap();
    db.insert(None, b"k", b"B", InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"k", b"C", InsertFlags::DUPLICATE).unwrap();

    let txn = env.begin().unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();

    // walk to B (position 2) and add D after it
    cursor.find(b"k").unwrap();
    let mut record = Record::new();
    cursor.move_next(None, Some(&mut record)).unwrap();
    assert_eq!(record.data, b"B".to_vec());
    cursor
        .insert(b"k", b"D", InsertFlags::DUPLICATE_INSERT_AFTER)
        .unwrap();

    // erase the first duplicate (A)
    cursor.find(b"k").unwrap();
    cursor.move_to(None, Some(&mut record), MoveFlags::empty()).unwrap();
    assert_eq!(record.data, b"A".to_vec());
    cursor.erase().unwrap();

    cursor.find(b"k").unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 3);
    let mut dupes = Vec::new();
    cursor.move_to(None, Some(&mut record), MoveFlags::empty()).unwrap();
    dupes.push(record.data.clone());
    while cursor.move_next(None, Some(&mut record)).is_ok() {
        dupes.push(record.data.clone());
    }
    assert_eq!(dupes, vec![b"B".to_vec(), b"D".to_vec(), b"C".to_vec()]);

    // committing materializes the merged view in the btree
    drop(cursor);
    txn.commit().unwrap();
    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k").unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 3);
    let mut dupes = Vec::new();
    cursor.move_to(None, Some(&mut record), MoveFlags::empty()).unwrap();
    dupes.push(record.data.clone());
    while cursor.move_next(None, Some(&mut record)).is_ok() {
        dupes.push(record.data.clone());
    }
    assert_eq!(dupes, vec![b"B".to_vec(), b"D".to_vec(), b"C".to_vec()]);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_scan_merges_pending_keys() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"b", b"btree", InsertFlags::empty()).unwrap();
    db.insert(None, b"d", b"btree", InsertFlags::empty()).unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"a", b"txn", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"c", b"txn", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"e", b"txn", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), b"d").unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    let mut key = Key::new();
    let mut seen = Vec::new();
    cursor.move_first(Some(&mut key), None).unwrap();
    seen.push(key.data.clone());
    while cursor.move_next(Some(&mut key), None).is_ok() {
        seen.push(key.data.clone());
    }
    // pending inserts appear in order, the erased key is skipped
    assert_eq!(
        seen,
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"e".to_vec()]
    );

    txn.abort().unwrap();

    // without the transaction only the btree remains
    let cursor = db.cursor(None).unwrap();
    let mut seen = Vec::new();
    cursor.move_first(Some(&mut key), None).unwrap();
    seen.push(key.data.clone());
    while cursor.move_next(Some(&mut key), None).is_ok() {
        seen.push(key.data.clone());
    }
    assert_eq!(seen, vec![b"b".to_vec(), b"d".to_vec()]);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_erase_invalidates_sibling_cursors() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();

    let c1 = db.cursor(None).unwrap();
    let c2 = db.cursor(None).unwrap();
    let c3 = db.cursor(None).unwrap();
    c1.find(b"a").unwrap();
    c2.find(b"a").unwrap();
    c3.find(b"b").unwrap();

    c1.erase().unwrap();

    // both cursors on "a" are nil now; the one on "b" survives
    assert_eq!(c2.erase(), Err(BurrowError::CursorIsNil));
    let mut record = Record::new();
    c3.move_to(None, Some(&mut record), MoveFlags::empty()).unwrap();
    assert_eq!(record.data, b"2".to_vec());

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_overwrite_requires_position() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();
    let cursor = db.cursor(None).unwrap();

    assert_eq!(cursor.overwrite(b"x"), Err(BurrowError::CursorIsNil));

    cursor.insert(b"k", b"v", InsertFlags::empty()).unwrap();
    cursor.overwrite(b"w").unwrap();
    assert_eq!(db.find(None, b"k").unwrap().data, b"w".to_vec());

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_move_current_after_txn_erase() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let txn = env.begin().unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.find(b"k").unwrap();

    // another code path erases the key inside the transaction
    db.erase(Some(&txn), b"k").unwrap();

    let mut record = Record::new();
    assert_eq!(
        cursor.move_to(None, Some(&mut record), MoveFlags::empty()),
        Err(BurrowError::KeyNotFound)
    );

    txn.abort().unwrap();
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}
