use burrow_db::{BurrowError, Env, EnvFlags, InsertFlags};

mod test_utils;
use test_utils::{db_path, setup};

#[test]
fn test_insert_find_erase() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"12345", b"12345", InsertFlags::empty())
        .unwrap();

    // inserting the same key again must be rejected
    assert_eq!(
        db.insert(None, b"12345", b"12345", InsertFlags::empty()),
        Err(BurrowError::DuplicateKey)
    );

    let record = db.find(None, b"12345").unwrap();
    assert_eq!(record.data, b"12345".to_vec());

    db.erase(None, b"12345").unwrap();
    assert_eq!(db.erase(None, b"12345"), Err(BurrowError::KeyNotFound));
    assert_eq!(db.find(None, b"12345"), Err(BurrowError::KeyNotFound));

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_overwrite_replaces_record() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"key", b"old", InsertFlags::empty()).unwrap();
    db.insert(None, b"key", b"new", InsertFlags::OVERWRITE)
        .unwrap();
    assert_eq!(db.find(None, b"key").unwrap().data, b"new".to_vec());

    // overwrite and duplicate together make no sense
    assert_eq!(
        db.insert(
            None,
            b"key",
            b"x",
            InsertFlags::OVERWRITE | InsertFlags::DUPLICATE
        ),
        Err(BurrowError::InvalidParameter)
    );

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_persistence_across_reopen() {
    let dir = setup();
    {
        let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
        let db = env.create_db(1).unwrap();
        for i in 0..100u32 {
            let key = format!("key-{:04}", i);
            let record = format!("record-{}", i);
            db.insert(None, key.as_bytes(), record.as_bytes(), InsertFlags::empty())
                .unwrap();
        }
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }

    let env = Env::open(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.open_db(1).unwrap();
    for i in 0..100u32 {
        let key = format!("key-{:04}", i);
        let record = db.find(None, key.as_bytes()).unwrap();
        assert_eq!(record.data, format!("record-{}", i).into_bytes());
    }
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_in_memory_db() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::IN_MEMORY_DB).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"alpha", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"beta", b"2", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"alpha").unwrap().data, b"1".to_vec());

    db.erase(None, b"alpha").unwrap();
    assert_eq!(db.find(None, b"alpha"), Err(BurrowError::KeyNotFound));
    assert_eq!(db.find(None, b"beta").unwrap().data, b"2".to_vec());

    // nothing was written to disk
    assert!(!db_path(&dir).exists());
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_use_hash_is_rejected() {
    let dir = setup();
    assert_eq!(
        Env::create(db_path(&dir), EnvFlags::USE_HASH).err(),
        Some(BurrowError::InvalidParameter)
    );
}

#[test]
fn test_duplicates_basic() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db(1).unwrap();

    db.insert(None, b"k", b"one", InsertFlags::empty()).unwrap();
    db.insert(None, b"k", b"two", InsertFlags::DUPLICATE).unwrap();
    db.insert(None, b"k", b"zero", InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();

    // a plain find returns the first duplicate
    assert_eq!(db.find(None, b"k").unwrap().data, b"zero".to_vec());

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"k").unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 3);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}
