use burrow_db::{BurrowError, Env, EnvFlags, InsertFlags};

mod test_utils;
use test_utils::{db_path, setup};

#[test]
fn test_begin_abort() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"12345", b"12345", InsertFlags::empty())
        .unwrap();
    txn.abort().unwrap();

    assert_eq!(db.find(None, b"12345"), Err(BurrowError::KeyNotFound));
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_begin_commit() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    let txn = env.begin_named("name").unwrap();
    db.insert(Some(&txn), b"12345", b"12345", InsertFlags::empty())
        .unwrap();
    assert_eq!(txn.get_name().as_deref(), Some("name"));
    txn.commit().unwrap();

    assert_eq!(db.find(None, b"12345").unwrap().data, b"12345".to_vec());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_read_your_writes() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"committed", b"c", InsertFlags::empty())
        .unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"pending", b"p", InsertFlags::empty())
        .unwrap();

    // the transaction observes its own writes immediately
    assert_eq!(db.find(Some(&txn), b"pending").unwrap().data, b"p".to_vec());
    // readers outside the transaction do not
    assert_eq!(db.find(None, b"pending"), Err(BurrowError::KeyNotFound));

    // an erase inside the transaction hides a committed key from it
    db.erase(Some(&txn), b"committed").unwrap();
    assert_eq!(
        db.find(Some(&txn), b"committed"),
        Err(BurrowError::KeyNotFound)
    );
    assert_eq!(db.find(None, b"committed").unwrap().data, b"c".to_vec());

    txn.commit().unwrap();
    assert_eq!(db.find(None, b"committed"), Err(BurrowError::KeyNotFound));
    assert_eq!(db.find(None, b"pending").unwrap().data, b"p".to_vec());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_begin_requires_flag() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    assert_eq!(env.begin().err(), Some(BurrowError::InvalidParameter));
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_single_transaction_at_a_time() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();

    let txn = env.begin().unwrap();
    assert_eq!(env.begin().err(), Some(BurrowError::LimitsReached));
    txn.abort().unwrap();
    // the slot is free again
    let txn = env.begin().unwrap();
    txn.commit().unwrap();
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_insert_abort() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    let txn = env.begin().unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.insert(b"12345", b"12345", InsertFlags::empty()).unwrap();
    cursor.close();
    txn.abort().unwrap();

    assert_eq!(db.find(None, b"12345"), Err(BurrowError::KeyNotFound));
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_insert_commit() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    let txn = env.begin().unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    cursor.insert(b"12345", b"12345", InsertFlags::empty()).unwrap();
    cursor.close();
    txn.commit().unwrap();

    assert_eq!(db.find(None, b"12345").unwrap().data, b"12345".to_vec());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_commit_persists_across_reopen() {
    let dir = setup();
    {
        let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
        let db = env.create_db(1).unwrap();
        let txn = env.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }
    let env = Env::open(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"k").unwrap().data, b"v".to_vec());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_dropping_transaction_aborts_it() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    {
        let txn = env.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();
        // txn dropped without commit
    }
    assert_eq!(db.find(None, b"k"), Err(BurrowError::KeyNotFound));
    // and the single-transaction slot was released
    let txn = env.begin().unwrap();
    txn.abort().unwrap();
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_key_count_sees_transaction() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::ENABLE_TRANSACTIONS).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();
    assert_eq!(db.get_key_count(None).unwrap(), 2);

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"c", b"3", InsertFlags::empty()).unwrap();
    db.erase(Some(&txn), b"a").unwrap();

    assert_eq!(db.get_key_count(Some(&txn)).unwrap(), 2);
    assert_eq!(db.get_key_count(None).unwrap(), 2);

    txn.commit().unwrap();
    assert_eq!(db.get_key_count(None).unwrap(), 2);
    assert_eq!(db.find(None, b"c").unwrap().data, b"3".to_vec());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}
