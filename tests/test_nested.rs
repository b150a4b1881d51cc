mod common;

use common::{key, setup_test_env, setup_with, value};
use mdbxkv::{Database, DbFlags, DebugFlags, EnvFlags, Environment, PageState, Transaction, WriteFlags};

#[test]
fn test_child_commit_reaches_parent() {
    let (_dir, env) = setup_test_env();
    let mut parent = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut parent, None, DbFlags::empty()).unwrap();
    db.put(&mut parent, b"parent", b"1", WriteFlags::empty()).unwrap();
    {
        let mut child = parent.begin_nested().unwrap();
        assert_eq!(db.get(&child, b"parent").unwrap().unwrap(), b"1");
        db.put(&mut child, b"child", b"2", WriteFlags::empty()).unwrap();
        db.del(&mut child, b"parent", None).unwrap();
        child.commit().unwrap();
    }
    assert_eq!(db.get(&parent, b"child").unwrap().unwrap(), b"2");
    assert!(db.get(&parent, b"parent").unwrap().is_none());
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"child").unwrap().unwrap(), b"2");
    assert_eq!(db.stat(&txn).unwrap().entries, 1);
}

#[test]
fn test_child_abort_leaves_parent_untouched() {
    let (_dir, env) = setup_test_env();
    let mut parent = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut parent, None, DbFlags::empty()).unwrap();
    for i in 0..100 {
        db.put(&mut parent, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    {
        let mut child = parent.begin_nested().unwrap();
        for i in 0..100 {
            db.del(&mut child, &key(i), None).unwrap();
        }
        for i in 100..400 {
            db.put(&mut child, &key(i), &value(i), WriteFlags::empty()).unwrap();
        }
        assert_eq!(db.stat(&child).unwrap().entries, 300);
        child.abort();
    }
    {
        // dropped without commit counts as an abort
        let mut child = parent.begin_nested().unwrap();
        db.put(&mut child, b"lost", b"x", WriteFlags::empty()).unwrap();
    }
    assert_eq!(db.stat(&parent).unwrap().entries, 100);
    assert!(db.get(&parent, b"lost").unwrap().is_none());
    for i in 0..100 {
        assert_eq!(db.get(&parent, &key(i)).unwrap().unwrap(), value(i));
    }
    parent.commit().unwrap();
}

#[test]
fn test_nested_levels_audit_clean() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| env.set_debug(DebugFlags::AUDIT));
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    for i in 0..300 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let mut parent = env.begin_rw_txn().unwrap();
    for i in 0..100 {
        db.del(&mut parent, &key(i), None).unwrap();
    }
    {
        let mut child = parent.begin_nested().unwrap();
        for i in 100..200 {
            db.put(&mut child, &key(i), b"rewritten by the child", WriteFlags::empty()).unwrap();
        }
        {
            let mut grandchild = child.begin_nested().unwrap();
            for i in 200..250 {
                db.del(&mut grandchild, &key(i), None).unwrap();
            }
            grandchild.commit().unwrap();
        }
        mdbxkv::audit(&child).unwrap();
        child.commit().unwrap();
    }
    mdbxkv::audit(&parent).unwrap();
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 150);
    assert_eq!(db.get(&txn, &key(150)).unwrap().unwrap(), b"rewritten by the child");
    assert!(db.get(&txn, &key(220)).unwrap().is_none());
    let report = mdbxkv::audit(&txn).unwrap();
    assert_eq!(report.used + report.gc, report.total);
}

fn small_budget(env: &mut Environment) {
    env.set_max_dirty(64).unwrap();
    env.set_mapsize(16 << 20).unwrap();
    env.set_debug(DebugFlags::AUDIT);
}

fn states(txn: &Transaction) -> Vec<PageState> {
    txn.walk()
        .map(Result::unwrap)
        .filter(|visit| visit.db == "@main")
        .map(|visit| txn.page_state(visit.pgno))
        .collect()
}

#[test]
fn test_child_spills_within_shared_budget() {
    let (_dir, env) = setup_with(EnvFlags::empty(), small_budget);
    let mut parent = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut parent, None, DbFlags::empty()).unwrap();
    for i in 0..3000 {
        db.put(&mut parent, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    {
        let mut child = parent.begin_nested().unwrap();
        for i in 3000..6000 {
            db.put(&mut child, &key(i), &value(i), WriteFlags::empty()).unwrap();
        }
        for i in (0..3000).step_by(3) {
            db.put(&mut child, &key(i), b"rewritten by the child", WriteFlags::empty()).unwrap();
        }
        let seen = states(&child);
        assert!(seen.contains(&PageState::Spilled));
        assert!(seen.iter().filter(|s| **s == PageState::Dirty).count() <= 64);
        mdbxkv::audit(&child).unwrap();
        child.commit().unwrap();
    }
    assert_eq!(db.stat(&parent).unwrap().entries, 6000);
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    for i in (0..6000).step_by(7) {
        let expected = if i < 3000 && i % 3 == 0 { b"rewritten by the child".to_vec() } else { value(i) };
        assert_eq!(db.get(&txn, &key(i)).unwrap().unwrap(), expected);
    }
}

#[test]
fn test_child_abort_after_spilling_keeps_parent() {
    let (_dir, env) = setup_with(EnvFlags::empty(), small_budget);
    let mut parent = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut parent, None, DbFlags::empty()).unwrap();
    for i in 0..3000 {
        db.put(&mut parent, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    {
        let mut child = parent.begin_nested().unwrap();
        for i in 0..3000 {
            db.put(&mut child, &key(i), b"never committed", WriteFlags::empty()).unwrap();
        }
        for i in 3000..6000 {
            db.put(&mut child, &key(i), &value(i), WriteFlags::empty()).unwrap();
        }
        assert!(states(&child).contains(&PageState::Spilled));
        child.abort();
    }
    assert_eq!(db.stat(&parent).unwrap().entries, 3000);
    for i in 0..3000 {
        assert_eq!(db.get(&parent, &key(i)).unwrap().unwrap(), value(i));
    }
    mdbxkv::audit(&parent).unwrap();
    parent.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 3000);
    assert!(db.get(&txn, &key(4000)).unwrap().is_none());
}
