mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{key, setup_test_env, setup_with, value};
use mdbxkv::{
    Database, DbFlags, DebugFlags, EnvFlags, Environment, Error, OomDecision, OomRequest, PageKind, PageState,
    Pgno, Transaction, WriteFlags,
};
use tempfile::TempDir;

const ROUNDS: usize = 50;

/// Rewrite the same keys in one transaction per round
fn churn(env: &Environment, db: Database, rounds: usize, size: usize) -> Result<(), Error> {
    for round in 0..rounds {
        let mut txn = env.begin_rw_txn()?;
        for i in 0..10 {
            let data = vec![(round + i) as u8; size];
            db.put(&mut txn, &key(i), &data, WriteFlags::empty())?;
        }
        txn.commit()?;
    }
    Ok(())
}

fn main_db(env: &Environment) -> Database {
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();
    db
}

fn small_map(flags: EnvFlags, pages: usize) -> (TempDir, Environment) {
    setup_with(flags, |env| {
        env.set_mapsize(pages * mdbxkv::PAGE_SIZE).unwrap();
        env.set_debug(DebugFlags::AUDIT);
    })
}

#[test]
fn test_overflow_values() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    db.put(&mut txn, b"big", &big, WriteFlags::empty()).unwrap();
    db.put(&mut txn, b"small", b"s", WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 3);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), big);
    let chains: Vec<_> = txn
        .walk()
        .map(Result::unwrap)
        .filter(|visit| visit.kind == PageKind::Overflow)
        .collect();
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].pages, 3);
    assert_eq!(chains[0].payload_bytes, big.len());
    drop(txn);

    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"big", &big[..5000], WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 2);
    assert_eq!(db.get(&txn, b"big").unwrap().unwrap(), &big[..5000]);
    db.put(&mut txn, b"big", b"tiny now", WriteFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);
    db.put(&mut txn, b"big", &big, WriteFlags::empty()).unwrap();
    db.del(&mut txn, b"big", None).unwrap();
    assert_eq!(db.stat(&txn).unwrap().overflow_pages, 0);
    mdbxkv::audit(&txn).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_walk_reports_every_page() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| env.set_maxdbs(2).unwrap());
    let mut txn = env.begin_rw_txn().unwrap();
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    let named = Database::open(&mut txn, Some("named"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    for i in 0..500 {
        main.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
        named.put(&mut txn, &key(i % 7), &value(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let visits: Vec<_> = txn.walk().collect::<Result<_, _>>().unwrap();
    assert_eq!(visits.iter().filter(|v| v.db == "@meta").count(), 2);
    assert!(visits.iter().any(|v| v.db == "@main" && v.kind == PageKind::Branch));
    assert!(visits.iter().any(|v| v.db == "named"));
    let psize = mdbxkv::PAGE_SIZE;
    for visit in &visits {
        let span = visit.pages as usize * psize;
        assert!(visit.payload_bytes + visit.header_bytes + visit.unused_bytes <= span);
    }
    let report = mdbxkv::audit(&txn).unwrap();
    let pages: usize = visits.iter().map(|v| v.pages as usize).sum();
    assert_eq!(report.used, pages);
    assert_eq!(report.used + report.gc, report.total);
    assert_eq!(report.total as u32, env.info().unwrap().last_pgno + 1);
}

#[test]
fn test_freed_pages_are_reused() {
    for flags in [EnvFlags::empty(), EnvFlags::LIFORECLAIM, EnvFlags::COALESCE] {
        let (_dir, env) = small_map(flags, 256);
        let db = main_db(&env);
        churn(&env, db, ROUNDS, 100).unwrap();
        let info = env.info().unwrap();
        assert!(info.last_pgno < 40, "{:?} grew to {} pages", flags, info.last_pgno);

        let txn = env.begin_ro_txn().unwrap();
        let report = mdbxkv::audit(&txn).unwrap();
        assert!(report.gc > 0);
        assert_eq!(db.get(&txn, &key(3)).unwrap().unwrap(), vec![(ROUNDS - 1 + 3) as u8; 100]);
    }
}

fn main_root(txn: &Transaction) -> Pgno {
    txn.walk().map(Result::unwrap).find(|visit| visit.db == "@main").unwrap().pgno
}

/// Main root after a first commit and after each later round, with a
/// reader keeping every round's FreeDB record around
fn roots_behind_reader(env: &Environment, db: Database, rounds: usize) -> Vec<Pgno> {
    churn(env, db, 1, 100).unwrap();
    let reader = env.begin_ro_txn().unwrap();
    let mut roots = vec![main_root(&reader)];
    for _ in 0..rounds {
        churn(env, db, 1, 100).unwrap();
        roots.push(main_root(&env.begin_ro_txn().unwrap()));
    }
    drop(reader);
    roots
}

#[test]
fn test_reclaim_order_follows_flags() {
    for flags in [EnvFlags::empty(), EnvFlags::LIFORECLAIM] {
        let (_dir, env) = small_map(flags, 256);
        let db = main_db(&env);
        let roots = roots_behind_reader(&env, db, 5);
        // fresh pages only while the reader was pinned
        assert!(roots.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", roots);

        // the head record is still visible, the four before it are reusable
        let mut txn = env.begin_rw_txn().unwrap();
        db.put(&mut txn, &key(0), b"touch", WriteFlags::empty()).unwrap();
        let root = main_root(&txn);
        if flags.contains(EnvFlags::LIFORECLAIM) {
            assert_eq!(root, roots[3]);
            assert_ne!(txn.page_state(roots[0]), PageState::Reclaimable);
        } else {
            assert_eq!(root, roots[0]);
            assert_ne!(txn.page_state(roots[3]), PageState::Reclaimable);
        }
        txn.commit().unwrap();
    }
}

#[test]
fn test_coalesce_loads_every_record() {
    let (_dir, env) = small_map(EnvFlags::COALESCE, 256);
    let db = main_db(&env);
    let roots = roots_behind_reader(&env, db, 5);

    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, &key(0), b"touch", WriteFlags::empty()).unwrap();
    assert_eq!(main_root(&txn), roots[0]);
    for &pgno in &roots[1..4] {
        assert_eq!(txn.page_state(pgno), PageState::Reclaimable);
    }
    assert_ne!(txn.page_state(roots[4]), PageState::Reclaimable);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let report = mdbxkv::audit(&txn).unwrap();
    assert_eq!(report.used + report.gc, report.total);
}

#[test]
fn test_reader_holds_back_reclaiming() {
    let (_dir, env) = small_map(EnvFlags::empty(), 1024);
    let db = main_db(&env);
    churn(&env, db, 5, 3000).unwrap();
    let before = env.info().unwrap().last_pgno;

    let reader = env.begin_ro_txn().unwrap();
    churn(&env, db, 20, 3000).unwrap();
    let pinned = env.info().unwrap().last_pgno;
    assert!(pinned > before + 150);
    assert_eq!(env.info().unwrap().tail_txnid, reader.id());
    let (lag, _) = reader.straggler().unwrap();
    assert_eq!(lag, 20);
    drop(reader);

    churn(&env, db, 20, 3000).unwrap();
    assert!(env.info().unwrap().last_pgno < pinned + 40);
}

#[test]
fn test_map_full_poisons_transaction() {
    let (_dir, env) = small_map(EnvFlags::empty(), 32);
    let db = main_db(&env);
    let mut txn = env.begin_rw_txn().unwrap();
    let huge = vec![7u8; 200 * 1024];
    let result = db.put(&mut txn, b"huge", &huge, WriteFlags::empty());
    assert!(matches!(result, Err(Error::MapFull)));
    let result = db.put(&mut txn, b"small", b"v", WriteFlags::empty());
    assert!(matches!(result, Err(Error::BadTxn)));
    assert!(matches!(txn.commit(), Err(Error::BadTxn)));

    // the environment is still usable
    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"small", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_oom_refused_gives_map_full() {
    let (_dir, env) = small_map(EnvFlags::empty(), 128);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut env = env;
    env.set_oomfunc(Some(Box::new(move |request: &OomRequest| {
        assert!(request.gap > 1);
        seen.fetch_add(1, Ordering::SeqCst);
        OomDecision::Refuse
    })));
    let db = main_db(&env);
    churn(&env, db, 1, 3000).unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let result = churn(&env, db, ROUNDS, 3000);
    assert!(matches!(result, Err(Error::MapFull)));
    assert!(calls.load(Ordering::SeqCst) > 0);
    assert_eq!(db.get(&reader, &key(0)).unwrap().unwrap(), vec![0u8; 3000]);
}

#[test]
fn test_oom_evicts_lagging_reader() {
    let (_dir, env) = small_map(EnvFlags::empty(), 128);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut env = env;
    env.set_oomfunc(Some(Box::new(move |_: &OomRequest| {
        seen.fetch_add(1, Ordering::SeqCst);
        OomDecision::Evicted
    })));
    let db = main_db(&env);
    churn(&env, db, 1, 3000).unwrap();

    let reader = env.begin_ro_txn().unwrap();
    churn(&env, db, ROUNDS, 3000).unwrap();
    assert!(calls.load(Ordering::SeqCst) > 0);
    assert!(matches!(db.get(&reader, &key(0)), Err(Error::BadRslot)));
    drop(reader);
    assert!(env.reader_list().unwrap().is_empty());
}

#[test]
fn test_oom_killed_reader_loses_its_slot() {
    let (_dir, env) = small_map(EnvFlags::empty(), 128);
    let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = requests.clone();
    let mut env = env;
    env.set_oomfunc(Some(Box::new(move |request: &OomRequest| {
        seen.lock().unwrap().push(*request);
        OomDecision::Killed
    })));
    let db = main_db(&env);
    churn(&env, db, 1, 3000).unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let pinned = reader.id();
    churn(&env, db, ROUNDS, 3000).unwrap();
    assert!(env.reader_list().unwrap().is_empty());
    assert!(matches!(db.get(&reader, &key(0)), Err(Error::BadRslot)));
    drop(reader);

    let requests = requests.lock().unwrap();
    let first = &requests[0];
    assert_eq!((first.txnid, first.retry), (pinned, 0));
    assert!(first.pid != 0 && first.gap > 1);
    // the attempts end with a notification carrying the negated count
    let last = requests.last().unwrap();
    assert_eq!(last.retry, -1);
    assert_eq!((last.pid, last.txnid), (0, pinned));
    assert!(last.gap > 0);
}

#[test]
fn test_oom_retry_gives_up_after_notifying() {
    let (_dir, env) = small_map(EnvFlags::empty(), 128);
    let retries = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = retries.clone();
    let mut env = env;
    env.set_oomfunc(Some(Box::new(move |request: &OomRequest| {
        seen.lock().unwrap().push(request.retry);
        OomDecision::Retry
    })));
    let db = main_db(&env);
    churn(&env, db, 1, 3000).unwrap();

    let reader = env.begin_ro_txn().unwrap();
    assert!(matches!(churn(&env, db, ROUNDS, 3000), Err(Error::MapFull)));
    assert_eq!(db.get(&reader, &key(0)).unwrap().unwrap(), vec![0u8; 3000]);
    let retries = retries.lock().unwrap();
    let end = retries.iter().position(|&retry| retry < 0).unwrap();
    assert_eq!(retries[..end], (0..end as i32).collect::<Vec<_>>()[..]);
    assert_eq!(retries[end], -(end as i32));
}

#[test]
fn test_spill_keeps_dirty_pages_bounded() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| {
        env.set_max_dirty(64).unwrap();
        env.set_mapsize(8 << 20).unwrap();
        env.set_debug(DebugFlags::AUDIT);
    });
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    for i in 0..4000 {
        db.put(&mut txn, &key(i), &value(i), WriteFlags::empty()).unwrap();
    }
    let states: Vec<PageState> = txn
        .walk()
        .map(Result::unwrap)
        .filter(|visit| visit.db == "@main")
        .map(|visit| txn.page_state(visit.pgno))
        .collect();
    assert!(states.contains(&PageState::Spilled));
    assert!(states.iter().all(|s| matches!(s, PageState::Dirty | PageState::Spilled)));
    for i in (0..4000).step_by(97) {
        assert_eq!(db.get(&txn, &key(i)).unwrap().unwrap(), value(i));
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 4000);
    for i in (0..4000).step_by(13) {
        assert_eq!(db.get(&txn, &key(i)).unwrap().unwrap(), value(i));
    }
}

#[test]
fn test_duplicate_trees_stay_within_dirty_budget() {
    let (_dir, env) = setup_with(EnvFlags::empty(), |env| {
        env.set_maxdbs(2).unwrap();
        env.set_max_dirty(64).unwrap();
        env.set_mapsize(16 << 20).unwrap();
        env.set_debug(DebugFlags::AUDIT);
    });
    let dirty = |txn: &Transaction| {
        txn.walk()
            .map(Result::unwrap)
            .filter(|visit| txn.page_state(visit.pgno) == PageState::Dirty)
            .count()
    };
    let mut txn = env.begin_rw_txn().unwrap();
    let db = Database::open(&mut txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    // 150 values per key outgrow their sub-pages and get promoted
    for i in 0..6000 {
        db.put(&mut txn, &key(i % 40), &value(i), WriteFlags::empty()).unwrap();
        if i % 500 == 499 {
            assert!(dirty(&txn) <= 64);
        }
    }
    for i in (0..6000).filter(|i| (i / 40) % 2 == 0) {
        db.del(&mut txn, &key(i % 40), Some(&value(i))).unwrap();
    }
    assert!(dirty(&txn) <= 64);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 3000);
    for k in 0..40 {
        let (_, count) = db.get_ex(&txn, &key(k)).unwrap().unwrap();
        assert_eq!(count, 75);
    }
}

#[test]
fn test_page_states_in_write_transaction() {
    let (_dir, env) = setup_test_env();
    let db = main_db(&env);
    let mut txn = env.begin_rw_txn().unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let root = txn.walk().map(Result::unwrap).find(|v| v.db == "@main").unwrap().pgno;
    assert_eq!(txn.page_state(root), PageState::Mapped);
    drop(txn);

    let mut txn = env.begin_rw_txn().unwrap();
    assert!(!txn.is_dirty(root));
    db.put(&mut txn, b"k", b"w", WriteFlags::empty()).unwrap();
    assert_eq!(txn.page_state(root), PageState::FreedPending);
    let new_root = txn.walk().map(Result::unwrap).find(|v| v.db == "@main").unwrap().pgno;
    assert_ne!(new_root, root);
    assert!(txn.is_dirty(new_root));
}
