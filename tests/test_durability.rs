mod common;

use common::{key, reopen, setup_test_env, setup_with, value};
use mdbxkv::{Canary, DataSign, Database, DbFlags, EnvFlags, Error, TxnFlags, WriteFlags};

#[test]
fn test_commit_survives_reopen() {
    let (dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"persistent", b"yes", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    env.close();

    let env = reopen(&dir, EnvFlags::empty(), |_| {});
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"persistent").unwrap().unwrap(), b"yes");
    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, txn.id());
}

#[test]
fn test_weak_commit_rolled_back_on_reopen() {
    let (dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"steady", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn(TxnFlags::NOSYNC).unwrap();
    db.put(&mut txn, b"weak", b"2", WriteFlags::empty()).unwrap();
    let weak_id = txn.id();
    txn.commit().unwrap();

    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, weak_id);
    let head_sign = if info.meta1_txnid == weak_id { info.meta1_sign } else { info.meta2_sign };
    assert_eq!(head_sign, DataSign::Weak);
    env.close_ex(true);

    let env = reopen(&dir, EnvFlags::empty(), |_| {});
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.id(), weak_id - 1);
    assert_eq!(db.get(&txn, b"steady").unwrap().unwrap(), b"1");
    assert!(db.get(&txn, b"weak").unwrap().is_none());
}

#[test]
fn test_weak_commits_keep_steady_snapshot() {
    let (dir, env) = setup_with(EnvFlags::empty(), |env| env.set_mapsize(4 << 20).unwrap());
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    for i in 0..2000 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    let steady_id = txn.id();
    txn.commit().unwrap();

    // every weak round rewrites the whole tree and releases the pages
    // of the round before
    for round in 0..6 {
        let mut txn = env.begin_txn(TxnFlags::NOSYNC).unwrap();
        for i in 0..2000 {
            let weak = format!("weak-value-{:02}-{:010}", round, i);
            db.put(&mut txn, &key(i), weak.as_bytes(), WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }
    assert_eq!(env.info().unwrap().last_txnid, steady_id + 6);
    env.close_ex(true);

    let env = reopen(&dir, EnvFlags::empty(), |_| {});
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.id(), steady_id);
    for i in 0..2000 {
        assert_eq!(db.get(&txn, &key(i)).unwrap().unwrap(), value(i));
    }
    let report = mdbxkv::audit(&txn).unwrap();
    assert_eq!(report.used + report.gc, report.total);
}

#[test]
fn test_nosync_space_reused_after_forced_sync() {
    let (_dir, env) = setup_with(EnvFlags::NOSYNC, |env| {
        env.set_mapsize(64 * mdbxkv::PAGE_SIZE).unwrap();
    });
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    let first = txn.id();
    txn.commit().unwrap();

    // weak commits cannot reuse what the steady snapshot sees, so running
    // out of room makes the head steady instead of failing
    for round in 0..200 {
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..10 {
            db.put(&mut txn, &key(i), &[round as u8; 100], WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }
    let info = env.info().unwrap();
    let steady = [(info.meta1_txnid, info.meta1_sign), (info.meta2_txnid, info.meta2_sign)]
        .iter()
        .filter(|(_, sign)| sign.is_steady())
        .map(|(txnid, _)| *txnid)
        .max()
        .unwrap();
    assert!(steady > first);
    assert_eq!(db.get(&env.begin_ro_txn().unwrap(), &key(3)).unwrap().unwrap(), vec![199u8; 100]);
}

#[test]
fn test_nosync_commits_made_steady_by_sync() {
    let (dir, env) = setup_with(EnvFlags::NOSYNC, |_| {});
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let info = env.info().unwrap();
    assert!(!info.meta1_sign.is_steady() || !info.meta2_sign.is_steady());
    env.sync(true).unwrap();
    let info = env.info().unwrap();
    let head_sign = if info.meta1_txnid == info.last_txnid { info.meta1_sign } else { info.meta2_sign };
    assert!(head_sign.is_steady());
    env.close_ex(true);

    let env = reopen(&dir, EnvFlags::empty(), |_| {});
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"a").unwrap().unwrap(), b"1");
}

#[test]
fn test_sync_bytes_forces_steady_commit() {
    let (_dir, env) = setup_with(EnvFlags::NOSYNC, |env| env.set_syncbytes(1).unwrap());
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let info = env.info().unwrap();
    let head_sign = if info.meta1_txnid == info.last_txnid { info.meta1_sign } else { info.meta2_sign };
    assert!(head_sign.is_steady());
}

#[test]
fn test_empty_commit_keeps_txnid() {
    let (_dir, env) = setup_test_env();
    let before = env.info().unwrap().last_txnid;
    let txn = env.begin_rw_txn().unwrap();
    txn.commit().unwrap();
    assert_eq!(env.info().unwrap().last_txnid, before);
}

#[test]
fn test_canary_stamped_with_txnid() {
    let (dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    txn.canary_put(&Canary { x: 1, y: 2, z: 3, v: 99 }).unwrap();
    let id = txn.id();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.canary_get(), Canary { x: 1, y: 2, z: 3, v: id });
    drop(txn);
    env.close();

    let env = reopen(&dir, EnvFlags::empty(), |_| {});
    let mut txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.canary_get().x, 1);
    assert!(matches!(txn.canary_put(&Canary::default()), Err(Error::AccessDenied)));
}

#[test]
fn test_sequence_persists() {
    let (dir, env) = setup_with(EnvFlags::empty(), |env| env.set_maxdbs(2).unwrap());
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, Some("seq"), DbFlags::CREATE).unwrap();
    assert_eq!(db.sequence(&mut txn, 5).unwrap(), 0);
    assert_eq!(db.sequence(&mut txn, 1).unwrap(), 5);
    assert_eq!(db.sequence(&mut txn, 0).unwrap(), 6);
    assert!(matches!(db.sequence(&mut txn, u64::MAX), Err(Error::InvalidArgument)));
    txn.commit().unwrap();
    env.close();

    let env = reopen(&dir, EnvFlags::empty(), |env| env.set_maxdbs(2).unwrap());
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, Some("seq"), DbFlags::empty()).unwrap();
    assert_eq!(db.sequence(&mut txn, 0).unwrap(), 6);
}

#[test]
fn test_read_only_environment() {
    let (dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    env.close();

    let env = reopen(&dir, EnvFlags::RDONLY, |_| {});
    assert!(matches!(env.begin_rw_txn(), Err(Error::AccessDenied)));
    assert!(matches!(env.sync(true), Err(Error::AccessDenied)));
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap().unwrap(), b"v");
    assert!(env.get_flags().unwrap().contains(EnvFlags::RDONLY));
}
