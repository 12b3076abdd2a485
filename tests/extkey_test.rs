use burrow_db::{BurrowError, Env, EnvFlags, InsertFlags, Key, Record};

mod test_utils;
use test_utils::{db_path, setup};

const KEYSIZE: u16 = 16;

fn long_key(seed: u8) -> Vec<u8> {
    // well past the inline key slot
    (0..64u8).map(|i| seed.wrapping_add(i)).collect()
}

#[test]
fn test_extended_key_roundtrip() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db_with(1, KEYSIZE).unwrap();

    let key = long_key(1);
    db.insert(None, &key, b"v", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, &key).unwrap().data, b"v".to_vec());

    // a different key sharing the 8-byte inline prefix must not collide
    let mut sibling = key.clone();
    *sibling.last_mut().unwrap() ^= 0xff;
    assert_eq!(db.find(None, &sibling), Err(BurrowError::KeyNotFound));
    db.insert(None, &sibling, b"w", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, &sibling).unwrap().data, b"w".to_vec());
    assert_eq!(db.find(None, &key).unwrap().data, b"v".to_vec());

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_extended_key_survives_reopen_and_reads_through_cache() {
    let dir = setup();
    let key = long_key(7);
    {
        let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
        let db = env.create_db_with(1, KEYSIZE).unwrap();
        db.insert(None, &key, b"v", InsertFlags::empty()).unwrap();
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }

    let env = Env::open(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.open_db(1).unwrap();

    // the first lookup assembles the key from the tail blob
    assert_eq!(db.find(None, &key).unwrap().data, b"v".to_vec());
    let (hits, misses) = db.extkey_cache_counters().unwrap();
    assert_eq!(hits, 0);
    assert!(misses >= 1);

    // the second lookup is served from the extended-key cache
    assert_eq!(db.find(None, &key).unwrap().data, b"v".to_vec());
    let (hits, _) = db.extkey_cache_counters().unwrap();
    assert!(hits >= 1);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_short_keys_never_touch_blob_storage() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db_with(1, KEYSIZE).unwrap();

    for i in 0..50u8 {
        // all keys fit the inline slot
        db.insert(None, &[b'k', i], &[i], InsertFlags::empty())
            .unwrap();
    }
    for i in 0..50u8 {
        assert_eq!(db.find(None, &[b'k', i]).unwrap().data, vec![i]);
    }

    // the comparator never went near the extended-key machinery
    let (hits, misses) = db.extkey_cache_counters().unwrap();
    assert_eq!((hits, misses), (0, 0));

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_extended_key_erase_and_reinsert() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db_with(1, KEYSIZE).unwrap();

    let key = long_key(3);
    db.insert(None, &key, b"v1", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, &key).unwrap().data, b"v1".to_vec());

    db.erase(None, &key).unwrap();
    assert_eq!(db.find(None, &key), Err(BurrowError::KeyNotFound));

    db.insert(None, &key, b"v2", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, &key).unwrap().data, b"v2".to_vec());

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_extended_keys_in_cursor_scan() {
    let dir = setup();
    let env = Env::create(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.create_db_with(1, KEYSIZE).unwrap();

    let mut keys: Vec<Vec<u8>> = (0..20u8).map(long_key).collect();
    for key in &keys {
        db.insert(None, key, b"r", InsertFlags::empty()).unwrap();
    }
    keys.sort();

    let cursor = db.cursor(None).unwrap();
    let mut key = Key::new();
    let mut record = Record::new();
    let mut seen = Vec::new();
    cursor.move_first(Some(&mut key), Some(&mut record)).unwrap();
    seen.push(key.data.clone());
    while cursor.move_next(Some(&mut key), Some(&mut record)).is_ok() {
        seen.push(key.data.clone());
    }
    // the emitted keys are the full 64-byte bodies, in order
    assert_eq!(seen, keys);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}
