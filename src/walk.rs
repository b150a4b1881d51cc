//! Page walk and space audit.
//!
//! The walk visits every page reachable from a snapshot: the two metas,
//! then FreeDB, the main database, each named database and the nested
//! trees holding duplicates. It is the basis of consistency checking.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use log::debug;

use crate::constants::{DbFlags, NodeFlags, FREE_DBI, MAIN_DBI, NUM_METAS, PAGEHDRSZ};
use crate::cursor;
use crate::error::{Error, Result};
use crate::freelist::decode_key;
use crate::meta::{DbRecord, META_SIZE};
use crate::midl::Idl;
use crate::page::{Page, PageKind};
use crate::transaction::{DbState, Transaction, TxnInner};
use crate::types::Pgno;

/// One page, or overflow chain, met by the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageVisit {
    pub pgno: Pgno,
    /// Pages covered, more than one for an overflow chain
    pub pages: u32,
    /// `@meta`, `@gc`, `@main` or the name of the database
    pub db: String,
    pub kind: PageKind,
    pub entries: usize,
    pub payload_bytes: usize,
    pub header_bytes: usize,
    pub unused_bytes: usize,
}

#[derive(Debug)]
enum Task {
    Tree {
        pgno: Pgno,
        db: Rc<str>,
        /// Leaves of this tree pack fixed size keys
        leaf2: bool,
        dupsort: bool,
        main: bool,
    },
    Overflow {
        pgno: Pgno,
        db: Rc<str>,
        dsize: usize,
    },
}

/// Iterator over the pages of a snapshot. The walk stops after the first
/// error.
#[derive(Debug)]
pub struct PageWalk<'a> {
    txn: &'a TxnInner,
    next_meta: Pgno,
    stack: Vec<Task>,
    named: VecDeque<(String, DbRecord)>,
    failed: bool,
}

impl<'a> PageWalk<'a> {
    pub(crate) fn new(txn: &'a TxnInner) -> Self {
        let mut walk = PageWalk {
            txn,
            next_meta: 0,
            stack: Vec::new(),
            named: VecDeque::new(),
            failed: false,
        };
        walk.push_tree("@main", &txn.dbs[MAIN_DBI as usize].rec, true);
        walk.push_tree("@gc", &txn.dbs[FREE_DBI as usize].rec, false);
        walk
    }

    fn push_tree(&mut self, db: &str, rec: &DbRecord, main: bool) {
        if rec.is_empty_tree() {
            return;
        }
        let flags = rec.db_flags();
        self.stack.push(Task::Tree {
            pgno: rec.root,
            db: Rc::from(db),
            leaf2: false,
            dupsort: flags.contains(DbFlags::DUPSORT),
            main,
        });
    }

    fn meta(&mut self) -> PageVisit {
        let pgno = self.next_meta;
        self.next_meta += 1;
        PageVisit {
            pgno,
            pages: 1,
            db: "@meta".to_string(),
            kind: PageKind::Meta,
            entries: 0,
            payload_bytes: META_SIZE - PAGEHDRSZ,
            header_bytes: PAGEHDRSZ,
            unused_bytes: self.txn.psize - META_SIZE,
        }
    }

    fn visit(&mut self, task: Task) -> Result<PageVisit> {
        let txn = self.txn;
        match task {
            Task::Tree {
                pgno,
                db,
                leaf2,
                dupsort,
                main,
            } => {
                let page = Page::new(txn.page(pgno)?);
                let kind = page.validate(Some(pgno))?;
                let n = page.numkeys();
                match kind {
                    PageKind::Branch => {
                        if n == 0 {
                            return Err(Error::Corrupted);
                        }
                        for i in (0..n).rev() {
                            self.stack.push(Task::Tree {
                                pgno: page.node(i)?.child(),
                                db: db.clone(),
                                leaf2,
                                dupsort,
                                main,
                            });
                        }
                    }
                    PageKind::Leaf if !leaf2 => self.leaf_children(&page, &db, dupsort, main)?,
                    PageKind::Leaf2 if leaf2 => {}
                    _ => return Err(Error::Corrupted),
                }
                let unused = page.free_space();
                Ok(PageVisit {
                    pgno,
                    pages: 1,
                    db: db.to_string(),
                    kind,
                    entries: n,
                    payload_bytes: page.used_space(),
                    header_bytes: PAGEHDRSZ,
                    unused_bytes: unused,
                })
            }
            Task::Overflow { pgno, db, dsize } => {
                let page = Page::new(txn.page(pgno)?);
                if page.validate(Some(pgno))? != PageKind::Overflow {
                    return Err(Error::Corrupted);
                }
                let pages = page.overflow_count();
                let span = pages as usize * txn.psize;
                if pages == 0 || PAGEHDRSZ + dsize > span {
                    return Err(Error::Corrupted);
                }
                Ok(PageVisit {
                    pgno,
                    pages,
                    db: db.to_string(),
                    kind: PageKind::Overflow,
                    entries: 1,
                    payload_bytes: dsize,
                    header_bytes: PAGEHDRSZ,
                    unused_bytes: span - PAGEHDRSZ - dsize,
                })
            }
        }
    }

    /// Queue what hangs off the nodes of a leaf
    fn leaf_children(&mut self, page: &Page<'_>, db: &Rc<str>, dupsort: bool, main: bool) -> Result<()> {
        let mut found = Vec::new();
        for i in 0..page.numkeys() {
            let node = page.node(i)?;
            if node.flags.contains(NodeFlags::BIGDATA) {
                found.push(Task::Overflow {
                    pgno: node.overflow_pgno()?,
                    db: db.clone(),
                    dsize: node.size as usize,
                });
            } else if node.flags.contains(NodeFlags::SUBDATA) {
                let rec = DbRecord::decode(node.data)?;
                if node.flags.contains(NodeFlags::DUPDATA) {
                    if !dupsort {
                        return Err(Error::Corrupted);
                    }
                    if !rec.is_empty_tree() {
                        found.push(Task::Tree {
                            pgno: rec.root,
                            db: db.clone(),
                            leaf2: rec.db_flags().contains(DbFlags::DUPFIXED),
                            dupsort: false,
                            main: false,
                        });
                    }
                } else if main {
                    let name = String::from_utf8_lossy(node.key).into_owned();
                    // an open write transaction holds newer records than the main tree
                    let live = self
                        .txn
                        .dbs
                        .iter()
                        .find(|state| state.valid && state.name.as_deref() == Some(name.as_str()))
                        .map_or(rec, |state| state.rec);
                    self.named.push_back((name, live));
                }
            }
        }
        self.stack.extend(found.into_iter().rev());
        Ok(())
    }
}

impl Iterator for PageWalk<'_> {
    type Item = Result<PageVisit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.next_meta < NUM_METAS {
            return Some(Ok(self.meta()));
        }
        let task = loop {
            if let Some(task) = self.stack.pop() {
                break task;
            }
            let (name, rec) = self.named.pop_front()?;
            self.push_tree(&name, &rec, false);
        };
        let visit = self.visit(task);
        if visit.is_err() {
            self.failed = true;
        }
        Some(visit)
    }
}

/// Where the pages of a snapshot went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpaceReport {
    /// Pages reachable from the metas and the trees
    pub used: usize,
    /// Pages recorded in FreeDB
    pub gc: usize,
    /// Pages freed or reclaimed by the transaction and not yet in FreeDB
    pub pending: usize,
    /// Pages of the datafile, up to the last one used
    pub total: usize,
}

/// Check every page up to the last used one is either reachable, listed
/// in FreeDB or held by the transaction, and none is claimed twice
pub fn audit(txn: &Transaction<'_>) -> Result<SpaceReport> {
    let inner = &txn.inner;
    let mut claimed = BTreeSet::new();
    let mut claim = |pgno: Pgno, n: u32| -> Result<usize> {
        for p in pgno..pgno + n {
            if !claimed.insert(p) {
                debug!("page {} claimed twice", p);
                return Err(Error::Problem);
            }
        }
        Ok(n as usize)
    };

    let mut report = SpaceReport {
        total: inner.next_pgno as usize,
        ..SpaceReport::default()
    };
    for visit in PageWalk::new(inner) {
        let visit = visit?;
        report.used += claim(visit.pgno, visit.pages)?;
    }

    let mut gc = Vec::new();
    let free = DbState::for_record(inner.dbs[FREE_DBI as usize].rec);
    cursor::scan(inner, &free, |key, value, _| {
        let id = decode_key(key)?;
        let skip = inner.consumed.contains(&id) || (!inner.is_readonly() && id == inner.txnid);
        if !skip {
            gc.push(Idl::decode(value)?);
        }
        Ok(())
    })?;
    for idl in &gc {
        for pgno in idl.iter() {
            report.gc += claim(pgno, 1)?;
        }
    }

    if !inner.is_readonly() {
        let mut pending: Vec<Pgno> = inner.free_pages.iter().chain(inner.reclaimed.iter()).collect();
        pending.extend(&inner.loose);
        let mut level = inner.parent.as_deref();
        while let Some(parent) = level {
            pending.extend(parent.free_pages.iter());
            pending.extend(&parent.loose);
            level = parent.parent.as_deref();
        }
        for pgno in pending {
            report.pending += claim(pgno, 1)?;
        }
    }

    let accounted = report.used + report.gc + report.pending;
    if accounted != report.total {
        debug!(
            "txn {}: {} pages used, {} in FreeDB, {} pending, {} in the file",
            inner.txnid, report.used, report.gc, report.pending, report.total
        );
        return Err(Error::Problem);
    }
    Ok(report)
}
