mod common;

use common::{key, reopen, setup_test_env, setup_with, value};
use mdbxkv::{CopyFlags, Canary, Database, DbFlags, EnvFlags, Environment, Error, WriteFlags};
use tempfile::TempDir;

#[test]
fn test_environment_settings() {
    let (dir, mut env) = setup_test_env();
    assert_eq!(env.get_path().unwrap(), dir.path());
    assert_eq!(env.get_maxreaders(), 126);
    assert_eq!(env.get_maxkeysize(), 1990);
    assert!(matches!(env.set_maxdbs(4), Err(Error::InvalidArgument)));
    assert!(matches!(env.set_maxreaders(4), Err(Error::InvalidArgument)));

    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    assert!(env.get_flags().unwrap().contains(EnvFlags::NOSYNC));
    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.get_flags().unwrap().contains(EnvFlags::NOSYNC));
    assert!(matches!(env.set_flags(EnvFlags::RDONLY, true), Err(Error::InvalidArgument)));

    let unopened = Environment::new().unwrap();
    assert!(matches!(unopened.begin_ro_txn(), Err(Error::InvalidArgument)));
    assert!(matches!(unopened.info(), Err(Error::InvalidArgument)));
}

#[test]
fn test_no_subdir_layout() {
    common::init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let mut env = Environment::new().unwrap();
    env.open(&path, EnvFlags::NOSUBDIR, 0o644).unwrap();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    assert!(path.exists());
    assert!(dir.path().join("store.db-lock").exists());
}

#[test]
fn test_reader_table() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| env.set_maxreaders(2).unwrap());
    assert_eq!(env.get_maxreaders(), 2);
    let first = env.begin_ro_txn().unwrap();
    let mut second = env.begin_ro_txn().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));

    let readers = env.reader_list().unwrap();
    assert_eq!(readers.len(), 2);
    assert!(readers.iter().all(|r| r.pid == std::process::id()));
    assert!(readers.iter().all(|r| r.txnid == Some(first.id())));
    assert_eq!(env.info().unwrap().num_readers, 2);

    second.reset();
    let readers = env.reader_list().unwrap();
    assert_eq!(readers.iter().filter(|r| r.txnid.is_none()).count(), 1);
    assert_eq!(env.reader_check().unwrap(), 0);

    drop(first);
    drop(second);
    assert!(env.reader_list().unwrap().is_empty());
    let _third = env.begin_ro_txn().unwrap();
}

#[test]
fn test_map_grown_by_another_handle() {
    let (dir, mut env) = setup_test_env();
    let db = {
        let mut txn = env.begin_rw_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        db.put(&mut txn, b"before", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        db
    };

    let mut other = reopen(&dir, EnvFlags::empty(), |_| {});
    other.set_mapsize(4 << 20).unwrap();
    let mut txn = other.begin_rw_txn().unwrap();
    for i in 0..2000 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
    assert_eq!(other.info().unwrap().mapsize, 4 << 20);

    assert!(matches!(env.begin_ro_txn(), Err(Error::MapResized)));
    assert!(matches!(env.begin_rw_txn(), Err(Error::MapResized)));
    env.set_mapsize(0).unwrap();
    assert_eq!(env.info().unwrap().mapsize, 4 << 20);
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, &key(1999)).unwrap().unwrap(), value(1999));
    assert_eq!(db.get(&txn, b"before").unwrap().unwrap(), b"1");
}

fn populated(dbs: u32) -> (TempDir, Environment) {
    let (dir, env) = setup_with(EnvFlags::empty(), |env| {
        env.set_maxdbs(dbs).unwrap();
        env.set_mapsize(4 << 20).unwrap();
    });
    {
        let mut txn = env.begin_rw_txn().unwrap();
        let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        let dups = Database::open(&mut txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
        for i in 0..3000 {
            main.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
            dups.put(&mut txn, &key(i % 10), &value(i), WriteFlags::empty()).unwrap();
        }
        main.put(&mut txn, b"overflow", &vec![9u8; 20_000], WriteFlags::empty()).unwrap();
        dups.sequence(&mut txn, 42).unwrap();
        txn.canary_put(&Canary { x: 7, y: 8, z: 9, v: 0 }).unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = env.begin_rw_txn().unwrap();
        let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        for i in (0..3000).filter(|i| i % 10 != 0) {
            main.del(&mut txn, &key(i), None).unwrap();
        }
        txn.commit().unwrap();
    }
    (dir, env)
}

fn check_copy(path: &std::path::Path) -> u32 {
    let mut env = Environment::new().unwrap();
    env.set_maxdbs(2).unwrap();
    env.open(path, EnvFlags::empty(), 0o644).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    let dups = Database::open(&mut txn, Some("dups"), DbFlags::empty()).unwrap();
    assert_eq!(main.stat(&txn).unwrap().entries, 300 + 2);
    assert_eq!(main.get(&txn, &key(20)).unwrap().unwrap(), value(20));
    assert!(main.get(&txn, &key(21)).unwrap().is_none());
    assert_eq!(main.get(&txn, b"overflow").unwrap().unwrap(), vec![9u8; 20_000]);
    assert_eq!(dups.stat(&txn).unwrap().entries, 3000);
    assert_eq!(dups.get_ex(&txn, &key(3)).unwrap().unwrap().1, 300);
    assert_eq!(dups.sequence(&mut txn, 0).unwrap(), 42);
    let canary = txn.canary_get();
    assert_eq!((canary.x, canary.y, canary.z), (7, 8, 9));
    mdbxkv::audit(&txn).unwrap();
    env.info().unwrap().last_pgno
}

#[test]
fn test_copy_plain() {
    let (_dir, env) = populated(2);
    let target = TempDir::new().unwrap();
    env.copy(target.path(), CopyFlags::empty()).unwrap();
    let last = check_copy(target.path());
    assert_eq!(last, env.info().unwrap().last_pgno);
}

#[test]
fn test_copy_compact() {
    let (_dir, env) = populated(2);
    let target = TempDir::new().unwrap();
    env.copy(target.path(), CopyFlags::COMPACT).unwrap();
    let last = check_copy(target.path());
    assert!(last < env.info().unwrap().last_pgno);
}
