use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, error, trace};
use memmap2::Mmap;
use parking_lot::MutexGuard;

use crate::btree;
use crate::cmp::{cmp_int, dup_cmp_for, key_cmp_for, CmpFn};
use crate::constants::{
    DbFlags, DebugFlags, EnvFlags, NodeFlags, TxnFlags, CORE_DBS, FREE_DBI, MAIN_DBI,
};
use crate::cursor;
use crate::env::{DbSlot, EnvCore, Environment};
use crate::error::{Error, Result};
use crate::meta::{self, DbRecord, Meta};
use crate::midl::Idl;
use crate::osal;
use crate::page::{init_header, set_pgno, PageKind};
use crate::types::{Canary, DataSign, Dbi, PageState, Pgno, Txnid};
use crate::walk::{self, PageWalk};

/// State of one database as seen by a transaction
#[derive(Debug, Clone)]
pub(crate) struct DbState {
    /// Database record
    pub(crate) rec: DbRecord,
    /// Name, `None` for the core databases
    pub(crate) name: Option<String>,
    /// Key comparison
    pub(crate) cmp: CmpFn,
    /// Duplicate comparison
    pub(crate) dcmp: CmpFn,
    /// Generation of the environment slot the handle must match
    pub(crate) seq: u32,
    /// Usable in this transaction
    pub(crate) valid: bool,
    /// Record changed, written back on commit
    pub(crate) dirty: bool,
}

impl DbState {
    pub(crate) fn unused(seq: u32) -> Self {
        DbState {
            rec: DbRecord::default(),
            name: None,
            cmp: key_cmp_for(DbFlags::empty()),
            dcmp: dup_cmp_for(DbFlags::empty()),
            seq,
            valid: false,
            dirty: false,
        }
    }

    pub(crate) fn from_slot(slot: &DbSlot, rec: DbRecord) -> Self {
        let flags = rec.db_flags();
        DbState {
            rec,
            name: slot.name.clone(),
            cmp: slot.cmp.unwrap_or_else(|| key_cmp_for(flags)),
            dcmp: slot.dcmp.unwrap_or_else(|| dup_cmp_for(flags)),
            seq: slot.seq,
            valid: true,
            dirty: false,
        }
    }

    /// State for a record reached without a handle, with default comparators
    pub(crate) fn for_record(rec: DbRecord) -> Self {
        let flags = rec.db_flags();
        DbState {
            rec,
            name: None,
            cmp: key_cmp_for(flags),
            dcmp: dup_cmp_for(flags),
            seq: 0,
            valid: true,
            dirty: false,
        }
    }

    pub(crate) fn flags(&self) -> DbFlags {
        self.rec.db_flags()
    }
}

/// Everything a transaction owns. Nested transactions keep their parent's
/// state in `parent` and hand it back when they end.
#[derive(Debug)]
pub(crate) struct TxnInner {
    pub(crate) txnid: Txnid,
    pub(crate) flags: TxnFlags,
    pub(crate) psize: usize,
    /// Snapshot of the map, kept alive for the whole transaction
    pub(crate) map: Arc<Mmap>,
    pub(crate) debug: DebugFlags,
    /// First page never used so far
    pub(crate) next_pgno: Pgno,
    /// Databases indexed by dbi
    pub(crate) dbs: Vec<DbState>,
    /// Copy-on-write shadows, keyed by page number
    pub(crate) dirty: BTreeMap<Pgno, Vec<u8>>,
    /// Dirty pages already written to their place in the file
    pub(crate) spilled: BTreeSet<Pgno>,
    /// Pages released by this transaction, saved in FreeDB on commit
    pub(crate) free_pages: Idl,
    /// Pages dirtied and freed again by this transaction
    pub(crate) loose: Vec<Pgno>,
    /// Free pages available for allocation
    pub(crate) reclaimed: Idl,
    /// FreeDB records loaded into `reclaimed`
    pub(crate) consumed: BTreeSet<Txnid>,
    pub(crate) canary: Canary,
    /// Named databases opened for the first time by this transaction
    pub(crate) created: Vec<Dbi>,
    /// Reader slot of a read-only transaction
    pub(crate) reader: Option<usize>,
    pub(crate) parent: Option<Box<TxnInner>>,
}

impl TxnInner {
    fn new(core: &EnvCore, meta: &Meta, txnid: Txnid, flags: TxnFlags, debug: DebugFlags) -> Result<Self> {
        let slots = core.dbis.lock().clone();
        let mut inner = TxnInner {
            txnid,
            flags,
            psize: core.psize,
            map: core.map.clone(),
            debug,
            next_pgno: meta.last_pg + 1,
            dbs: Vec::with_capacity(slots.len()),
            dirty: BTreeMap::new(),
            spilled: BTreeSet::new(),
            free_pages: Idl::new(),
            loose: Vec::new(),
            reclaimed: Idl::new(),
            consumed: BTreeSet::new(),
            canary: meta.canary,
            created: Vec::new(),
            reader: None,
            parent: None,
        };
        let mut free = DbState::from_slot(&slots[FREE_DBI as usize], meta.dbs[FREE_DBI as usize]);
        free.cmp = cmp_int;
        inner.dbs.push(free);
        inner
            .dbs
            .push(DbState::from_slot(&slots[MAIN_DBI as usize], meta.dbs[MAIN_DBI as usize]));
        inner.load_named(&slots)?;
        Ok(inner)
    }

    /// Fetch the records of the named databases known to the environment
    fn load_named(&mut self, slots: &[DbSlot]) -> Result<()> {
        self.dbs.truncate(CORE_DBS as usize);
        for slot in &slots[CORE_DBS as usize..] {
            let state = match (&slot.name, slot.used) {
                (Some(name), true) => match btree::find(self, MAIN_DBI, name.as_bytes())? {
                    Some(node) if node.flags.contains(NodeFlags::SUBDATA) => {
                        DbState::from_slot(slot, DbRecord::decode(&node.data)?)
                    }
                    _ => DbState::unused(slot.seq),
                },
                _ => DbState::unused(slot.seq),
            };
            self.dbs.push(state);
        }
        Ok(())
    }

    /// Empty stand-in left in a parent while a child runs
    fn detached(&self) -> TxnInner {
        TxnInner {
            txnid: self.txnid,
            flags: TxnFlags::HAS_CHILD,
            psize: self.psize,
            map: self.map.clone(),
            debug: self.debug,
            next_pgno: self.next_pgno,
            dbs: Vec::new(),
            dirty: BTreeMap::new(),
            spilled: BTreeSet::new(),
            free_pages: Idl::new(),
            loose: Vec::new(),
            reclaimed: Idl::new(),
            consumed: BTreeSet::new(),
            canary: self.canary,
            created: Vec::new(),
            reader: None,
            parent: None,
        }
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.flags.contains(TxnFlags::RDONLY)
    }

    /// Database state for a handle
    pub(crate) fn db(&self, dbi: Dbi, seq: u32) -> Result<&DbState> {
        match self.dbs.get(dbi as usize) {
            Some(state) if state.valid && state.seq == seq => Ok(state),
            _ => Err(Error::BadDbi),
        }
    }

    pub(crate) fn set_record(&mut self, dbi: Dbi, rec: DbRecord) {
        let state = &mut self.dbs[dbi as usize];
        if state.rec != rec {
            state.rec = rec;
            state.dirty = true;
            self.flags |= TxnFlags::DIRTY;
        }
    }

    /// One page, looked up through the dirty and spill lists of this
    /// transaction and its ancestors before falling back to the map
    pub(crate) fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        self.span(pgno, 1)
    }

    /// `n` consecutive pages starting at `pgno`
    pub(crate) fn span(&self, pgno: Pgno, n: usize) -> Result<&[u8]> {
        let mut level = Some(self);
        while let Some(txn) = level {
            if let Some(buf) = txn.dirty.get(&pgno) {
                return buf.get(..n * self.psize).ok_or(Error::PageNotFound);
            }
            if txn.spilled.contains(&pgno) {
                break;
            }
            level = txn.parent.as_deref();
        }
        if pgno as usize + n > self.next_pgno as usize {
            return Err(Error::PageNotFound);
        }
        let start = pgno as usize * self.psize;
        self.map
            .get(start..start + n * self.psize)
            .ok_or(Error::PageNotFound)
    }

    pub(crate) fn dirty_in_ancestor(&self, pgno: Pgno) -> bool {
        let mut level = self.parent.as_deref();
        while let Some(txn) = level {
            if txn.dirty.contains_key(&pgno) {
                return true;
            }
            if txn.spilled.contains(&pgno) {
                return false;
            }
            level = txn.parent.as_deref();
        }
        false
    }

    pub(crate) fn spilled_in_ancestor(&self, pgno: Pgno) -> bool {
        let mut level = self.parent.as_deref();
        while let Some(txn) = level {
            if txn.spilled.contains(&pgno) {
                return true;
            }
            level = txn.parent.as_deref();
        }
        false
    }

    /// Page was written by this transaction or one of its ancestors
    pub(crate) fn owns(&self, pgno: Pgno) -> bool {
        self.dirty.contains_key(&pgno)
            || self.spilled.contains(&pgno)
            || self.dirty_in_ancestor(pgno)
            || self.spilled_in_ancestor(pgno)
    }

    /// Dirty pages held by this transaction and its ancestors
    pub(crate) fn dirty_total(&self) -> usize {
        let mut total = self.dirty.len();
        let mut level = self.parent.as_deref();
        while let Some(txn) = level {
            total += txn.dirty.len();
            level = txn.parent.as_deref();
        }
        total
    }

    /// Fold a committed child into this transaction. Pages the child freed
    /// that this transaction had written itself can be reused right away.
    fn merge(&mut self, mut child: TxnInner) -> Result<()> {
        let psize = self.psize;
        let freed: BTreeSet<Pgno> = child.free_pages.iter().collect();
        let mut skip_until: Pgno = 0;
        for pgno in freed {
            if pgno < skip_until {
                continue;
            }
            if let Some(buf) = self.dirty.remove(&pgno) {
                let n = (buf.len() / psize) as u32;
                skip_until = pgno + n;
                if n == 1 {
                    self.loose.push(pgno);
                } else {
                    child.reclaimed.append_range(pgno, n);
                }
            } else if self.spilled.contains(&pgno) {
                let n = btree::run_length(self, pgno)?;
                self.spilled.remove(&pgno);
                skip_until = pgno + n;
                child.reclaimed.append_range(pgno, n);
            } else {
                self.free_pages.append(pgno);
            }
        }
        for pgno in &child.spilled {
            self.dirty.remove(pgno);
            self.spilled.insert(*pgno);
        }
        for (pgno, buf) in child.dirty {
            self.spilled.remove(&pgno);
            self.dirty.insert(pgno, buf);
        }
        self.loose.extend(child.loose);
        child.reclaimed.sort();
        self.reclaimed = child.reclaimed;
        self.consumed = child.consumed;
        self.next_pgno = child.next_pgno;
        self.dbs = child.dbs;
        self.canary = child.canary;
        self.created.extend(child.created);
        self.flags |= child.flags & (TxnFlags::DIRTY | TxnFlags::SPILLS);
        Ok(())
    }
}

/// A transaction against an [`Environment`].
///
/// Read-only transactions pin a snapshot in the reader table; a write
/// transaction holds the writer lock until it commits or aborts.
#[derive(Debug)]
pub struct Transaction<'env> {
    pub(crate) env: &'env Environment,
    pub(crate) core: &'env EnvCore,
    pub(crate) inner: TxnInner,
    /// Parent slot of a nested transaction
    home: Option<&'env mut TxnInner>,
    writer: Option<MutexGuard<'env, ()>>,
}

impl<'env> Transaction<'env> {
    pub(crate) fn begin(env: &'env Environment, flags: TxnFlags) -> Result<Transaction<'env>> {
        let core = env.core()?;
        if core.is_fatal() {
            return Err(Error::Panic);
        }
        if flags.contains(TxnFlags::RDONLY) {
            Self::begin_read(env, core, flags)
        } else {
            Self::begin_write(env, core, flags)
        }
    }

    fn begin_read(env: &'env Environment, core: &'env EnvCore, flags: TxnFlags) -> Result<Self> {
        let slot = core.readers.acquire()?;
        let inner = Self::pin_snapshot(core, slot).and_then(|meta| {
            TxnInner::new(
                core,
                &meta,
                meta.txnid,
                TxnFlags::RDONLY | (flags & TxnFlags::NOSYNC),
                env.debug_flags(),
            )
        });
        match inner {
            Ok(mut inner) => {
                inner.reader = Some(slot);
                Ok(Transaction {
                    env,
                    core,
                    inner,
                    home: None,
                    writer: None,
                })
            }
            Err(err) => {
                core.readers.release(slot);
                Err(err)
            }
        }
    }

    /// Publish the head snapshot in the reader slot, retrying until the
    /// head did not move in between
    fn pin_snapshot(core: &EnvCore, slot: usize) -> Result<Meta> {
        loop {
            let head = core.head_meta()?;
            core.readers.pin(slot, head.txnid);
            if core.head_meta()? == head {
                if head.mapsize as usize > core.mapsize {
                    core.readers.pin(slot, crate::constants::TXNID_NONE);
                    return Err(Error::MapResized);
                }
                return Ok(head);
            }
        }
    }

    fn begin_write(env: &'env Environment, core: &'env EnvCore, flags: TxnFlags) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::AccessDenied);
        }
        let guard = core.writer.lock();
        osal::lock_writer(&core.data)?;
        let inner = core.head_meta().and_then(|head| {
            if head.mapsize as usize > core.mapsize {
                return Err(Error::MapResized);
            }
            TxnInner::new(
                core,
                &head,
                head.txnid + 1,
                flags & (TxnFlags::NOSYNC | TxnFlags::NOMETASYNC),
                env.debug_flags(),
            )
        });
        match inner {
            Ok(inner) => {
                trace!("begin write txn {}", inner.txnid);
                Ok(Transaction {
                    env,
                    core,
                    inner,
                    home: None,
                    writer: Some(guard),
                })
            }
            Err(err) => {
                osal::unlock_writer(&core.data);
                Err(err)
            }
        }
    }

    /// Start a child of this write transaction. The parent cannot be used
    /// until the child ends; the child's changes reach the parent only if
    /// it commits.
    pub fn begin_nested(&mut self) -> Result<Transaction<'_>> {
        self.check(true)?;
        let (env, core) = (self.env, self.core);
        let placeholder = self.inner.detached();
        let parent = std::mem::replace(&mut self.inner, placeholder);
        let child = TxnInner {
            txnid: parent.txnid,
            flags: parent.flags & (TxnFlags::NOSYNC | TxnFlags::NOMETASYNC),
            psize: parent.psize,
            map: parent.map.clone(),
            debug: parent.debug,
            next_pgno: parent.next_pgno,
            dbs: parent.dbs.clone(),
            dirty: BTreeMap::new(),
            spilled: BTreeSet::new(),
            free_pages: Idl::new(),
            loose: Vec::new(),
            reclaimed: parent.reclaimed.clone(),
            consumed: parent.consumed.clone(),
            canary: parent.canary,
            created: Vec::new(),
            reader: None,
            parent: Some(Box::new(parent)),
        };
        Ok(Transaction {
            env,
            core,
            inner: child,
            home: Some(&mut self.inner),
            writer: None,
        })
    }

    pub fn env(&self) -> &'env Environment {
        self.env
    }

    pub fn id(&self) -> Txnid {
        self.inner.txnid
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.is_readonly()
    }

    fn is_nested(&self) -> bool {
        self.home.is_some()
    }

    /// Fail unless the transaction can still be used, for writing if `write`
    pub(crate) fn check(&self, write: bool) -> Result<()> {
        if self.inner.flags.intersects(TxnFlags::BLOCKED) {
            return Err(Error::BadTxn);
        }
        if write && self.inner.is_readonly() {
            return Err(Error::AccessDenied);
        }
        if let Some(slot) = self.inner.reader {
            if self.core.readers.pinned(slot) != self.inner.txnid || !self.core.readers.owned(slot) {
                return Err(Error::BadRslot);
            }
        }
        Ok(())
    }

    /// Record a failure; anything but a usage error blocks the transaction
    pub(crate) fn poison(&mut self, err: Error) -> Error {
        if !err.is_usage() && !self.inner.is_readonly() {
            self.inner.flags |= TxnFlags::ERROR;
        }
        err
    }

    pub(crate) fn psize(&self) -> usize {
        self.inner.psize
    }

    /// Make `pgno` writable, returning the page number of the writable copy
    pub(crate) fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        if self.inner.dirty.contains_key(&pgno) {
            return Ok(pgno);
        }
        let mut buf = self.inner.page(pgno)?.to_vec();
        if self.inner.owns(pgno) {
            self.claim_dirty()?;
            self.inner.spilled.remove(&pgno);
            self.inner.dirty.insert(pgno, buf);
            return Ok(pgno);
        }
        let new = self.page_alloc(1)?;
        set_pgno(&mut buf, new);
        self.page_free(pgno, 1)?;
        self.inner.dirty.insert(new, buf);
        Ok(new)
    }

    /// Allocate a fresh dirty page
    pub(crate) fn new_page(&mut self, kind: PageKind, ksize: usize) -> Result<Pgno> {
        let pgno = self.page_alloc(1)?;
        let mut buf = vec![0u8; self.inner.psize];
        init_header(&mut buf, pgno, kind, ksize);
        self.inner.dirty.insert(pgno, buf);
        Ok(pgno)
    }

    pub(crate) fn dirty_mut(&mut self, pgno: Pgno) -> Result<&mut Vec<u8>> {
        self.inner.dirty.get_mut(&pgno).ok_or(Error::Problem)
    }

    /// Spill dirty pages until `need` more fit in the dirty budget. The
    /// budget is shared along the nesting chain; an ancestor's page is only
    /// spilled when no younger level holds its own copy.
    pub(crate) fn ensure_room(&mut self, need: usize) -> Result<()> {
        let max = self.env.max_dirty();
        let mut total = self.inner.dirty_total();
        if total + need <= max {
            return Ok(());
        }
        let limit = max.saturating_sub(need);
        let goal = limit - limit / 8;
        let psize = self.inner.psize as u64;
        let data = &self.core.data;
        let mut spilled = 0;
        let mut shadowed: BTreeSet<Pgno> = BTreeSet::new();
        let mut level = Some(&mut self.inner);
        while let Some(txn) = level {
            if total <= goal {
                break;
            }
            let candidates: Vec<Pgno> = txn
                .dirty
                .keys()
                .copied()
                .filter(|pgno| !shadowed.contains(pgno) && !txn.spilled_in_ancestor(*pgno))
                .collect();
            for pgno in candidates {
                if total <= goal {
                    break;
                }
                if let Some(buf) = txn.dirty.remove(&pgno) {
                    osal::pwrite(data, &buf, pgno as u64 * psize)?;
                    txn.spilled.insert(pgno);
                    txn.flags |= TxnFlags::SPILLS;
                    total -= 1;
                    spilled += 1;
                }
            }
            shadowed.extend(txn.dirty.keys().copied());
            shadowed.extend(txn.spilled.iter().copied());
            level = txn.parent.as_deref_mut();
        }
        if spilled > 0 {
            trace!("txn {} spilled {} pages", self.inner.txnid, spilled);
        }
        if total + need > max {
            return Err(Error::TxnFull);
        }
        Ok(())
    }

    /// One more dirty page must stay within the budget `ensure_room` made
    pub(crate) fn claim_dirty(&self) -> Result<()> {
        if self.inner.dirty_total() >= self.env.max_dirty() {
            debug!("txn {} ran out of dirty room", self.inner.txnid);
            return Err(Error::TxnFull);
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        if let Err(err) = self.check(false) {
            self.end(false);
            return Err(err);
        }
        let result = if self.inner.is_readonly() {
            Ok(())
        } else if self.is_nested() {
            self.commit_nested()
        } else {
            self.commit_top()
        };
        self.end(result.is_ok());
        result
    }

    pub fn abort(mut self) {
        self.end(false);
    }

    fn commit_nested(&mut self) -> Result<()> {
        let mut parent = self.inner.parent.take().ok_or(Error::Problem)?;
        let child = std::mem::replace(&mut self.inner, parent.detached());
        let result = parent.merge(child);
        parent.flags.remove(TxnFlags::HAS_CHILD);
        if result.is_err() {
            parent.flags |= TxnFlags::ERROR;
        }
        if let Some(home) = self.home.as_mut() {
            **home = *parent;
        }
        result
    }

    fn commit_top(&mut self) -> Result<()> {
        let core = self.core;
        if !self.inner.flags.contains(TxnFlags::DIRTY)
            && self.inner.dirty.is_empty()
            && self.inner.spilled.is_empty()
        {
            trace!("txn {} has nothing to commit", self.inner.txnid);
            return Ok(());
        }
        // everything dirty is written below anyway, so make room for the records
        self.ensure_room(self.env.max_dirty() / 2)?;
        self.store_records()?;
        self.save_freelist()?;
        if self.env.debug_flags().contains(DebugFlags::AUDIT) {
            walk::audit(self)?;
        }

        let psize = self.inner.psize;
        let mut written = 0u64;
        for (pgno, buf) in &self.inner.dirty {
            if let Err(err) = osal::pwrite(&core.data, buf, *pgno as u64 * psize as u64) {
                return Err(self.fatal(&format!("writing page {}", pgno), err));
            }
            written += buf.len() as u64;
        }
        written += (self.inner.spilled.len() * psize) as u64;

        let env_flags = self.env.flags();
        let nosync =
            env_flags.contains(EnvFlags::NOSYNC) || self.inner.flags.contains(TxnFlags::NOSYNC);
        let nometasync = env_flags.contains(EnvFlags::NOMETASYNC)
            || self.inner.flags.contains(TxnFlags::NOMETASYNC);
        let pending = core.add_unsynced(written);
        let threshold = self.env.sync_bytes() as u64;
        let forced = threshold > 0 && pending >= threshold;
        let sync_data = !nosync || forced;
        if sync_data {
            if let Err(err) = osal::fsync(&core.data, false) {
                return Err(self.fatal("syncing data", err));
            }
        }
        let steady = sync_data && (!nometasync || forced);

        let metas = core.metas();
        let head = meta::head_index(&metas)?;
        let slot = meta::target_slot(&metas, head);
        let mut meta = Meta::initial(psize, core.mapsize);
        meta.dbs[FREE_DBI as usize] = DbRecord {
            xsize: psize as u32,
            ..self.inner.dbs[FREE_DBI as usize].rec
        };
        meta.dbs[MAIN_DBI as usize] = self.inner.dbs[MAIN_DBI as usize].rec;
        meta.last_pg = self.inner.next_pgno - 1;
        meta.txnid = self.inner.txnid;
        meta.canary = self.inner.canary;
        meta.sign = if steady {
            DataSign::Steady(meta.steady_sign())
        } else if env_flags.contains(EnvFlags::MAPASYNC) && nosync {
            DataSign::None
        } else {
            DataSign::Weak
        };

        let page = meta.encode(slot as Pgno, psize);
        if let Err(err) = osal::pwrite(&core.data, &page, (slot * psize) as u64) {
            return Err(self.fatal(&format!("writing meta {}", slot), err));
        }
        if steady {
            if let Err(err) = osal::fsync(&core.data, false) {
                return Err(self.fatal(&format!("syncing meta {}", slot), err));
            }
            core.clear_unsynced();
        }
        debug!(
            "committed txn {} to meta {}: {} dirty, {} spilled, sign {:?}",
            meta.txnid,
            slot,
            self.inner.dirty.len(),
            self.inner.spilled.len(),
            meta.sign
        );
        Ok(())
    }

    /// An I/O failure while committing leaves the file in an unknown state:
    /// the environment refuses further transactions
    fn fatal(&self, what: &str, err: Error) -> Error {
        self.core.set_fatal();
        error!("{} of txn {} failed: {}", what, self.inner.txnid, err);
        Error::Panic
    }

    /// Write the records of changed named databases into the main database
    fn store_records(&mut self) -> Result<()> {
        for dbi in CORE_DBS as usize..self.inner.dbs.len() {
            let state = &self.inner.dbs[dbi];
            if !(state.valid && state.dirty) {
                continue;
            }
            if let Some(name) = state.name.clone() {
                let rec = state.rec;
                cursor::store_subdb(self, name.as_bytes(), &rec)?;
                self.inner.dbs[dbi].dirty = false;
            }
        }
        Ok(())
    }

    /// End the transaction; `committed` keeps the databases it created
    fn end(&mut self, committed: bool) {
        if self.inner.flags.contains(TxnFlags::FINISHED) {
            self.release_reader();
            return;
        }
        if let Some(home) = self.home.as_mut() {
            if let Some(mut parent) = self.inner.parent.take() {
                parent.flags.remove(TxnFlags::HAS_CHILD);
                **home = *parent;
            }
        } else if !self.inner.is_readonly() {
            osal::unlock_writer(&self.core.data);
        }
        if !committed {
            self.release_created();
        }
        self.release_reader();
        self.inner.flags |= TxnFlags::FINISHED;
        self.writer = None;
    }

    fn release_created(&mut self) {
        if self.inner.created.is_empty() {
            return;
        }
        let mut slots = self.core.dbis.lock();
        for dbi in self.inner.created.drain(..) {
            if let Some(slot) = slots.get_mut(dbi as usize) {
                slot.release();
            }
        }
    }

    fn release_reader(&mut self) {
        if let Some(slot) = self.inner.reader.take() {
            self.core.readers.release(slot);
        }
    }

    /// Release the snapshot of a read-only transaction but keep its reader slot
    pub fn reset(&mut self) {
        if !self.inner.is_readonly() {
            return;
        }
        if let Some(slot) = self.inner.reader {
            self.core.readers.pin(slot, crate::constants::TXNID_NONE);
        }
        self.inner.flags |= TxnFlags::FINISHED;
    }

    /// Pin the newest snapshot again after `reset`. A read transaction
    /// still holding its snapshot cannot be renewed.
    pub fn renew(&mut self) -> Result<()> {
        if !self.inner.is_readonly() || !self.inner.flags.contains(TxnFlags::FINISHED) {
            return Err(Error::InvalidArgument);
        }
        let core = self.core;
        if core.is_fatal() {
            return Err(Error::Panic);
        }
        let slot = match self.inner.reader {
            Some(slot) if core.readers.owned(slot) => slot,
            _ => core.readers.acquire()?,
        };
        self.inner.reader = None;
        let meta = match Self::pin_snapshot(core, slot) {
            Ok(meta) => meta,
            Err(err) => {
                core.readers.release(slot);
                return Err(err);
            }
        };
        let mut inner = TxnInner::new(core, &meta, meta.txnid, TxnFlags::RDONLY, self.env.debug_flags())
            .map_err(|err| {
                core.readers.release(slot);
                err
            })?;
        inner.reader = Some(slot);
        self.inner = inner;
        Ok(())
    }

    /// Set the application canary; `v` is stamped with the transaction id
    pub fn canary_put(&mut self, canary: &Canary) -> Result<()> {
        self.check(true)?;
        self.inner.canary = Canary {
            v: self.inner.txnid,
            ..*canary
        };
        self.inner.flags |= TxnFlags::DIRTY;
        Ok(())
    }

    pub fn canary_get(&self) -> Canary {
        self.inner.canary
    }

    /// How many commits this snapshot lags behind the head, and the share
    /// of the map in use in percent
    pub fn straggler(&self) -> Result<(u64, u32)> {
        self.check(false)?;
        let head = self.core.head_meta()?;
        let lag = head.txnid.saturating_sub(self.inner.txnid);
        let total = (self.core.mapsize / self.inner.psize).max(1) as u64;
        let percent = (head.last_pg as u64 + 1) * 100 / total;
        Ok((lag, percent as u32))
    }

    /// Where a page stands from the point of view of this transaction
    pub fn page_state(&self, pgno: Pgno) -> PageState {
        let inner = &self.inner;
        if inner.loose.contains(&pgno) {
            return PageState::Loose;
        }
        let mut level = Some(inner);
        while let Some(txn) = level {
            if txn.dirty.contains_key(&pgno) {
                return PageState::Dirty;
            }
            if txn.spilled.contains(&pgno) {
                return PageState::Spilled;
            }
            level = txn.parent.as_deref();
        }
        if inner.free_pages.contains(pgno) {
            PageState::FreedPending
        } else if inner.reclaimed.contains(pgno) {
            PageState::Reclaimable
        } else {
            PageState::Mapped
        }
    }

    pub fn is_dirty(&self, pgno: Pgno) -> bool {
        matches!(self.page_state(pgno), PageState::Dirty | PageState::Spilled)
    }

    /// Visit every page reachable from the snapshot
    pub fn walk(&self) -> PageWalk<'_> {
        PageWalk::new(&self.inner)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.end(false);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread::LocalKey;

    use tempfile::TempDir;

    use crate::constants::{DbFlags, EnvFlags, WriteFlags};
    use crate::database::Database;
    use crate::env::Environment;
    use crate::error::{Error, Result};
    use crate::osal::{FAIL_SYNCS, FAIL_WRITES};
    use crate::transaction::Transaction;

    fn open_env(dir: &TempDir) -> Environment {
        let mut env = Environment::new().unwrap();
        env.open(dir.path(), EnvFlags::empty(), 0o644).unwrap();
        env
    }

    fn commit_with(fault: &'static LocalKey<Cell<bool>>, txn: Transaction<'_>) -> Result<()> {
        fault.with(|fail| fail.set(true));
        let result = txn.commit();
        fault.with(|fail| fail.set(false));
        result
    }

    #[test]
    fn page_write_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let env = open_env(&dir);
        let mut txn = env.begin_rw_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
        let before = env.info().unwrap().last_txnid;

        assert_eq!(commit_with(&FAIL_WRITES, txn), Err(Error::Panic));
        assert!(matches!(env.begin_rw_txn(), Err(Error::Panic)));
        assert!(matches!(env.begin_ro_txn(), Err(Error::Panic)));
        drop(env);

        // a fresh open finds the last good commit
        let env = open_env(&dir);
        let mut txn = env.begin_ro_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        assert_eq!(db.get(&txn, b"k"), Ok(None));
        assert_eq!(txn.id(), before);
    }

    #[test]
    fn data_sync_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let env = open_env(&dir);
        let mut txn = env.begin_rw_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        for i in 0..100u32 {
            db.put(&mut txn, &i.to_be_bytes(), b"value", WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        let mut txn = env.begin_rw_txn().unwrap();
        db.put(&mut txn, b"late", b"value", WriteFlags::empty()).unwrap();
        assert_eq!(commit_with(&FAIL_SYNCS, txn), Err(Error::Panic));
        assert!(matches!(env.begin_rw_txn(), Err(Error::Panic)));
    }
}
