//! Page allocation and the FreeDB.
//!
//! Pages come, in order, from the loose list, from the reclaimed cache, from
//! FreeDB records no reader can still see, and finally from the end of the
//! file. Pages released by a transaction are recorded in FreeDB under its
//! txnid when it commits.

use byteorder::{ByteOrder, NativeEndian};
use log::{debug, trace, warn};

use crate::constants::{DebugFlags, EnvFlags, TxnFlags, WriteFlags, FREE_DBI};
use crate::cursor::{self, CursorState};
use crate::error::{Error, Result};
use crate::meta;
use crate::midl::{Idl, IDL_UM_MAX};
use crate::osal;
use crate::transaction::Transaction;
use crate::types::{CursorOp, OomDecision, OomRequest, Pgno, Txnid};

/// Rounds of writing the freelist back before giving up
const SAVE_LOOPS: usize = 16;
/// Calls to the out-of-space callback for one allocation
const OOM_RETRIES: i32 = 8;
/// Reclaimed pages gathered before COALESCE stops loading records
const COALESCE_LIMIT: usize = IDL_UM_MAX / 2;

pub(crate) fn decode_key(key: &[u8]) -> Result<Txnid> {
    if key.len() != 8 {
        return Err(Error::Corrupted);
    }
    Ok(NativeEndian::read_u64(key))
}

impl Transaction<'_> {
    /// Allocate `num` consecutive pages
    pub(crate) fn page_alloc(&mut self, num: usize) -> Result<Pgno> {
        self.claim_dirty()?;
        if num == 1 {
            if let Some(pgno) = self.inner.loose.pop() {
                self.trace_alloc("loose", pgno, num);
                return Ok(pgno);
            }
        }
        let mut synced = false;
        loop {
            if let Some(pgno) = self.inner.reclaimed.take_run(num) {
                self.trace_alloc("reclaimed", pgno, num);
                return Ok(pgno);
            }
            if !self.inner.flags.contains(TxnFlags::FREELIST_SAVE) && self.reclaim()? {
                continue;
            }
            let limit = (self.core.mapsize / self.inner.psize) as u64;
            if self.inner.next_pgno as u64 + num as u64 <= limit {
                let pgno = self.inner.next_pgno;
                self.inner.next_pgno += num as Pgno;
                self.trace_alloc("new", pgno, num);
                return Ok(pgno);
            }
            if !synced && self.steady_behind().is_some() {
                self.sync_steady()?;
                synced = true;
                continue;
            }
            if !self.kick_laggard()? {
                return Err(Error::MapFull);
            }
        }
    }

    fn trace_alloc(&self, source: &str, pgno: Pgno, num: usize) {
        if self.inner.debug.contains(DebugFlags::TRACE) {
            trace!("txn {} allocated {} page(s) at {} from {}", self.inner.txnid, num, pgno, source);
        }
    }

    /// Release `num` pages starting at `pgno`
    pub(crate) fn page_free(&mut self, pgno: Pgno, num: usize) -> Result<()> {
        let inner = &mut self.inner;
        let was_dirty = inner.dirty.remove(&pgno).is_some();
        let inherited = inner.dirty_in_ancestor(pgno) || inner.spilled_in_ancestor(pgno);
        if was_dirty && !inherited {
            if num == 1 {
                inner.loose.push(pgno);
            } else {
                inner.reclaimed.append_range(pgno, num as u32);
            }
        } else if !inherited && inner.spilled.remove(&pgno) {
            if self.env.flags().contains(EnvFlags::PAGEPERTURB) {
                let scribble = vec![0xA5u8; num * inner.psize];
                osal::pwrite(&self.core.data, &scribble, pgno as u64 * inner.psize as u64)?;
            }
            inner.reclaimed.append_range(pgno, num as u32);
        } else {
            inner.free_pages.append_range(pgno, num as u32);
        }
        if inner.debug.contains(DebugFlags::TRACE) {
            trace!("txn {} freed {} page(s) at {}", inner.txnid, num, pgno);
        }
        Ok(())
    }

    /// Snapshot below which FreeDB records may be reused. A weak head can
    /// still be rolled back to the newest steady commit, so pages that
    /// commit sees stay put as if a reader held it.
    fn reclaim_floor(&self) -> Txnid {
        let floor = self.core.readers.oldest(self.inner.txnid - 1);
        match self.steady_behind() {
            Some(steady) => floor.min(steady + 1),
            None => floor,
        }
    }

    /// The newest steady commit, when weak commits were made after it
    fn steady_behind(&self) -> Option<Txnid> {
        let head = self.inner.txnid - 1;
        meta::steady_txnid(&self.core.metas()).filter(|&steady| steady < head)
    }

    /// Make the head steady so the pages the weak commits released become
    /// reclaimable
    fn sync_steady(&self) -> Result<()> {
        debug!("txn {} ran out of space behind weak commits, syncing", self.inner.txnid);
        self.core.sync_head().map_err(|err| {
            self.core.set_fatal();
            err
        })
    }

    /// Move FreeDB records into the reclaimed cache. Returns false when no
    /// record could be loaded.
    fn reclaim(&mut self) -> Result<bool> {
        let floor = self.reclaim_floor();
        let coalesce = self.env.flags().contains(EnvFlags::COALESCE);
        let mut loaded = false;
        while let Some((key, idl)) = self.next_reclaimable(floor)? {
            self.inner.reclaimed.merge(&idl)?;
            self.inner.consumed.insert(key);
            loaded = true;
            trace!(
                "txn {} reclaimed {} pages of txn {}",
                self.inner.txnid,
                idl.len(),
                key
            );
            if !coalesce || self.inner.reclaimed.len() >= COALESCE_LIMIT {
                break;
            }
        }
        Ok(loaded)
    }

    /// Next FreeDB record older than `floor` that was not consumed yet, the
    /// oldest first or with LIFORECLAIM the newest first
    fn next_reclaimable(&self, floor: Txnid) -> Result<Option<(Txnid, Idl)>> {
        let inner = &self.inner;
        let lifo = self.env.flags().contains(EnvFlags::LIFORECLAIM);
        let mut cursor = CursorState::new(FREE_DBI, inner.dbs[FREE_DBI as usize].seq);
        let (mut item, step) = if lifo {
            let start = match cursor.get(inner, Some(&floor.to_ne_bytes()), None, CursorOp::SetRange)? {
                Some(_) => cursor.get(inner, None, None, CursorOp::Prev)?,
                None => cursor.get(inner, None, None, CursorOp::Last)?,
            };
            (start, CursorOp::Prev)
        } else {
            (cursor.get(inner, None, None, CursorOp::First)?, CursorOp::Next)
        };
        while let Some((key, data)) = item {
            let id = decode_key(&key)?;
            if id >= floor {
                if lifo {
                    item = cursor.get(inner, None, None, step)?;
                    continue;
                }
                return Ok(None);
            }
            if !inner.consumed.contains(&id) {
                return Ok(Some((id, Idl::decode(&data)?)));
            }
            item = cursor.get(inner, None, None, step)?;
        }
        Ok(None)
    }

    /// Try to move the reclamation floor: clear the slots of dead
    /// processes, then ask the out-of-space callback about the reader
    /// holding the floor back. Returns true when the floor moved.
    fn kick_laggard(&self) -> Result<bool> {
        let head = self.inner.txnid - 1;
        let readers = &self.core.readers;
        let stuck = readers.oldest(head);
        let mut retry = 0;
        let moved = loop {
            readers.clear_dead();
            if readers.oldest(head) > stuck {
                break true;
            }
            let oom = match self.env.oom_func() {
                Some(oom) if retry < OOM_RETRIES => oom,
                _ => break false,
            };
            let laggard = match readers.laggard() {
                Some(reader) => reader,
                None => break false,
            };
            let txnid = match laggard.txnid {
                Some(txnid) if txnid < head => txnid,
                _ => break false,
            };
            let request = OomRequest {
                pid: laggard.pid,
                tid: laggard.tid,
                txnid,
                gap: head - txnid,
                retry,
            };
            match oom(&request) {
                OomDecision::Refuse => break false,
                OomDecision::Retry => {}
                OomDecision::Evicted => {
                    warn!(
                        "evicting reader {} of process {} pinned to txn {}",
                        laggard.slot, laggard.pid, txnid
                    );
                    readers.evict(laggard.slot, laggard.pid, false);
                }
                OomDecision::Killed => {
                    warn!(
                        "clearing reader {} of killed process {} pinned to txn {}",
                        laggard.slot, laggard.pid, txnid
                    );
                    readers.evict(laggard.slot, laggard.pid, true);
                }
            }
            retry += 1;
        };
        if retry > 0 {
            if let Some(oom) = self.env.oom_func() {
                let floor = readers.oldest(head);
                oom(&OomRequest {
                    pid: 0,
                    tid: 0,
                    txnid: stuck,
                    gap: floor.saturating_sub(stuck),
                    retry: -retry,
                });
            }
        }
        Ok(moved)
    }

    /// Write or delete the FreeDB record of `key`
    fn freedb_store(&mut self, key: Txnid, idl: &Idl) -> Result<()> {
        let raw = key.to_ne_bytes();
        if idl.is_empty() {
            return match cursor::delete_key(self, FREE_DBI, &raw) {
                Ok(()) | Err(Error::NotFound) => Ok(()),
                Err(err) => Err(err),
            };
        }
        cursor::put_raw(self, FREE_DBI, &raw, &idl.encode(), WriteFlags::empty())
    }

    /// Record the pages released by this transaction in FreeDB, and put back
    /// what is left of the reclaimed cache.
    ///
    /// Writing FreeDB allocates and frees pages itself, so the records are
    /// rewritten until the lists stop changing.
    pub(crate) fn save_freelist(&mut self) -> Result<()> {
        self.inner.flags |= TxnFlags::FREELIST_SAVE;
        let consumed: Vec<Txnid> = self.inner.consumed.iter().copied().collect();
        for key in &consumed {
            self.freedb_store(*key, &Idl::new())?;
        }
        let spare_key = consumed.last().copied();
        let txnid = self.inner.txnid;
        for _ in 0..SAVE_LOOPS {
            let (mine, spare) = self.pending_lists()?;
            match spare_key {
                Some(key) => {
                    self.freedb_store(txnid, &mine)?;
                    self.freedb_store(key, &spare)?;
                }
                None => {
                    let mut all = mine.clone();
                    all.merge(&spare)?;
                    self.freedb_store(txnid, &all)?;
                }
            }
            if self.pending_lists()? == (mine, spare) {
                trace!(
                    "txn {} saved freelist: {} freed, {} spare",
                    txnid,
                    self.inner.free_pages.len(),
                    self.inner.reclaimed.len() + self.inner.loose.len()
                );
                return Ok(());
            }
        }
        Err(Error::Problem)
    }

    /// Freed pages, and reusable pages not handed out
    fn pending_lists(&self) -> Result<(Idl, Idl)> {
        let mut mine = self.inner.free_pages.clone();
        mine.sort();
        let mut spare = self.inner.reclaimed.clone();
        spare.merge(&Idl::from_unsorted(self.inner.loose.clone()))?;
        Ok((mine, spare))
    }
}
