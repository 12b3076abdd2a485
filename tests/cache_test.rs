use burrow_db::{BurrowError, Env, EnvFlags, InsertFlags, Key};

mod test_utils;
use test_utils::{db_path, setup};

const PAGE_SIZE: usize = 1024;

// With room for only four pages the tree cannot stay resident; every
// previously dirtied page must still be on disk after close.
#[test]
fn test_eviction_under_pressure() {
    let dir = setup();
    let rows = 150u32;
    {
        let env =
            Env::create_with(db_path(&dir), EnvFlags::empty(), PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        let db = env.create_db(1).unwrap();
        for i in 0..rows {
            let key = format!("key-{:06}", i);
            let record = format!("record-{:06}", i);
            db.insert(None, key.as_bytes(), record.as_bytes(), InsertFlags::empty())
                .unwrap();
        }
        // everything is still readable while the cache churns
        for i in 0..rows {
            let key = format!("key-{:06}", i);
            assert_eq!(
                db.find(None, key.as_bytes()).unwrap().data,
                format!("record-{:06}", i).into_bytes()
            );
        }
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }

    let env = Env::open(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.get_key_count(None).unwrap(), rows as u64);
    for i in 0..rows {
        let key = format!("key-{:06}", i);
        assert_eq!(
            db.find(None, key.as_bytes()).unwrap().data,
            format!("record-{:06}", i).into_bytes()
        );
    }
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_erase_under_pressure() {
    let dir = setup();
    let env =
        Env::create_with(db_path(&dir), EnvFlags::empty(), PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
    let db = env.create_db(1).unwrap();

    let rows = 120u32;
    for i in 0..rows {
        let key = format!("key-{:06}", i);
        db.insert(None, key.as_bytes(), b"r", InsertFlags::empty())
            .unwrap();
    }
    // empty whole leaves from the middle; their pages are recycled
    for i in 0..rows {
        let key = format!("key-{:06}", i);
        db.erase(None, key.as_bytes()).unwrap();
    }
    assert_eq!(db.get_key_count(None).unwrap(), 0);

    // the database is still usable afterwards
    db.insert(None, b"fresh", b"f", InsertFlags::empty()).unwrap();
    assert_eq!(db.find(None, b"fresh").unwrap().data, b"f".to_vec());

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_write_through_mode() {
    let dir = setup();
    {
        let env = Env::create_with(
            db_path(&dir),
            EnvFlags::WRITE_THROUGH,
            PAGE_SIZE,
            4 * PAGE_SIZE,
        )
        .unwrap();
        let db = env.create_db(1).unwrap();
        for i in 0..50u32 {
            let key = format!("key-{:04}", i);
            db.insert(None, key.as_bytes(), b"wt", InsertFlags::empty())
                .unwrap();
        }
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }
    let env = Env::open(db_path(&dir), EnvFlags::empty()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.get_key_count(None).unwrap(), 50);
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_mmap_mode_roundtrip() {
    let dir = setup();
    {
        let env = Env::create(db_path(&dir), EnvFlags::USE_MMAP).unwrap();
        let db = env.create_db(1).unwrap();
        for i in 0..100u32 {
            let key = format!("key-{:04}", i);
            let record = format!("record-{}", i);
            db.insert(None, key.as_bytes(), record.as_bytes(), InsertFlags::empty())
                .unwrap();
        }
        env.close(EnvFlags::AUTO_CLEANUP).unwrap();
    }

    let env = Env::open(db_path(&dir), EnvFlags::USE_MMAP).unwrap();
    let db = env.open_db(1).unwrap();
    for i in 0..100u32 {
        let key = format!("key-{:04}", i);
        assert_eq!(
            db.find(None, key.as_bytes()).unwrap().data,
            format!("record-{}", i).into_bytes()
        );
    }
    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_in_memory_cache_is_a_hard_limit() {
    let dir = setup();
    let env = Env::create_with(
        db_path(&dir),
        EnvFlags::IN_MEMORY_DB,
        PAGE_SIZE,
        4 * PAGE_SIZE,
    )
    .unwrap();
    let db = env.create_db(1).unwrap();

    // an in-memory environment cannot evict; it eventually reports a
    // full cache instead of losing data
    let mut failed = false;
    for i in 0..100_000u32 {
        let key = format!("key-{:08}", i);
        match db.insert(None, key.as_bytes(), b"r", InsertFlags::empty()) {
            Ok(()) => {}
            Err(BurrowError::CacheFull) => {
                failed = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(failed);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_pins_pages_against_eviction() {
    let dir = setup();
    let env =
        Env::create_with(db_path(&dir), EnvFlags::empty(), PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
    let db = env.create_db(1).unwrap();

    let rows = 120u32;
    for i in 0..rows {
        let key = format!("key-{:06}", i);
        db.insert(None, key.as_bytes(), b"r", InsertFlags::empty())
            .unwrap();
    }

    // park a cursor on the first key, then churn the cache with lookups
    let cursor = db.cursor(None).unwrap();
    let mut key = Key::new();
    cursor.move_first(Some(&mut key), None).unwrap();
    for i in (0..rows).rev() {
        let probe = format!("key-{:06}", i);
        db.find(None, probe.as_bytes()).unwrap();
    }

    // the pinned page never left memory, so the cursor is still valid
    let mut again = Key::new();
    cursor
        .move_to(Some(&mut again), None, burrow_db::MoveFlags::empty())
        .unwrap();
    assert_eq!(again.data, key.data);

    env.close(EnvFlags::AUTO_CLEANUP).unwrap();
}
