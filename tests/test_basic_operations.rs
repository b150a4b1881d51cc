mod common;

use common::{key, setup_test_env, setup_with, value};
use mdbxkv::{Database, DbFlags, EnvFlags, Error, WriteFlags};

#[test]
fn test_database_open_close() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| env.set_maxdbs(4).unwrap());
    let mut txn = env.begin_rw_txn().unwrap();

    // Test opening default database
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::empty());

    // Test opening named database
    let named = Database::open(&mut txn, Some("testdb"), DbFlags::CREATE).unwrap();
    assert_ne!(named.dbi(), db.dbi());
    txn.commit().unwrap();
    named.close(&env).unwrap();
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    let result = db.get(&txn, key).unwrap();

    assert_eq!(result.unwrap(), value);
}

#[test]
fn test_overwrite() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    db.put(&mut txn, b"k", b"short", WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"k", b"a somewhat longer value", WriteFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"a somewhat longer value");
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    db.put(&mut txn, key, value, WriteFlags::empty()).unwrap();
    assert!(db.get(&txn, key).unwrap().is_some());

    db.del(&mut txn, key, None).unwrap();
    assert!(db.get(&txn, key).unwrap().is_none());
    assert!(matches!(db.del(&mut txn, key, None), Err(Error::NotFound)));
}

#[test]
fn test_database_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Get initial stats
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.depth, 0);

    // Add some entries and check stats
    for i in 0..5 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }

    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.leaf_pages, 1);
    assert_eq!(stats.psize as usize, mdbxkv::PAGE_SIZE);
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();

    // Test key not found
    let result = db.get(&txn, b"nonexistent_key").unwrap();
    assert!(result.is_none());

    // Test duplicate key with NOOVERWRITE flag
    let key = b"unique_key";
    db.put(&mut txn, key, b"value1", WriteFlags::empty()).unwrap();
    let result = db.put(&mut txn, key, b"value2", WriteFlags::NOOVERWRITE);
    assert!(matches!(result, Err(Error::KeyExist)));

    // Usage errors leave the transaction usable
    assert!(matches!(db.put(&mut txn, b"", b"v", WriteFlags::empty()), Err(Error::BadValSize)));
    let long_key = vec![b'k'; env.get_maxkeysize() + 1];
    assert!(matches!(db.put(&mut txn, &long_key, b"v", WriteFlags::empty()), Err(Error::BadValSize)));
    assert_eq!(db.get(&txn, key).unwrap().unwrap(), b"value1");
    txn.commit().unwrap();
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    // Write transaction
    let mut write_txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut write_txn, None, DbFlags::empty()).unwrap();
    db.put(&mut write_txn, b"key", b"value", WriteFlags::empty()).unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert!(result.is_none());

    // After commit, changes should be visible
    write_txn.commit().unwrap();
    assert!(db.get(&read_txn, b"key").unwrap().is_none());
    let read_txn = env.begin_ro_txn().unwrap();
    let result = db.get(&read_txn, b"key").unwrap();
    assert_eq!(result.unwrap(), b"value");
}

#[test]
fn test_abort_discards_changes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"kept", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"dropped", b"2", WriteFlags::empty()).unwrap();
    db.del(&mut txn, b"kept", None).unwrap();
    txn.abort();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"kept").unwrap().unwrap(), b"1");
    assert!(db.get(&txn, b"dropped").unwrap().is_none());
}

#[test]
fn test_read_only_transaction_refuses_writes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert!(txn.is_readonly());
    let result = db.put(&mut txn, b"key", b"value", WriteFlags::empty());
    assert!(matches!(result, Err(Error::AccessDenied)));
    assert!(matches!(txn.begin_nested(), Err(Error::AccessDenied)));
}

#[test]
fn test_many_keys_split_pages() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    for i in (0..2000).rev() {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 2000);
    assert!(stats.depth >= 2);
    assert!(stats.branch_pages >= 1);
    for i in (0..2000).step_by(37) {
        assert_eq!(db.get(&txn, &key(i)).unwrap().unwrap(), value(i));
    }
    assert_eq!(env.stat().unwrap(), stats);
}

#[test]
fn test_delete_everything_collapses_tree() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    for i in 0..1000 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..1000 {
        db.del(&mut txn, &key(i), None).unwrap();
    }
    let stats = db.stat(&txn).unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.branch_pages, 0);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert!(db.get(&txn, &key(500)).unwrap().is_none());
}

#[test]
fn test_integer_keys() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::INTEGERKEY).unwrap();
    for i in [300u64, 2, 70000, 1] {
        db.put(&mut txn, &i.to_ne_bytes(), b"n", WriteFlags::empty()).unwrap();
    }
    let mut cursor = db.cursor(&txn).unwrap();
    let mut seen = Vec::new();
    let mut item = cursor.first().unwrap();
    while let Some((k, _)) = item {
        seen.push(u64::from_ne_bytes(k.as_slice().try_into().unwrap()));
        item = cursor.next().unwrap();
    }
    assert_eq!(seen, vec![1, 2, 300, 70000]);

    let result = db.put(&mut txn, b"abc", b"n", WriteFlags::empty());
    assert!(matches!(result, Err(Error::BadValSize)));
}
