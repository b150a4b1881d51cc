use crate::btree;
use crate::cmp::{dup_cmp_for, key_cmp_for, CmpFn};
use crate::constants::{DbFlags, NodeFlags, WriteFlags, CORE_DBS, FREE_DBI, MAIN_DBI};
use crate::cursor::{self, Cursor, CursorState, RwCursor};
use crate::env::{DbSlot, Environment};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::max_key_size;
use crate::transaction::{DbState, Transaction};
use crate::types::{CursorOp, Dbi, Stat};

/// Database handle.
///
/// A handle stays valid for every transaction started after the one that
/// opened it committed, until the database is closed or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Database {
    /// Database identifier
    dbi: Dbi,
    /// Generation of the environment slot
    seq: u32,
}

impl Database {
    /// Open a database in the environment; `None` is the main database
    pub fn open(txn: &mut Transaction, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        txn.check(false)?;
        let wanted = flags & DbFlags::PERSISTENT;
        match name {
            None => Self::open_main(txn, wanted),
            Some(name) => {
                let result = Self::open_named(txn, name, wanted, flags.contains(DbFlags::CREATE));
                result.map_err(|err| match err {
                    Error::DbsFull => err,
                    err => txn.poison(err),
                })
            }
        }
    }

    fn open_main(txn: &mut Transaction, wanted: DbFlags) -> Result<Database> {
        let state = &txn.inner.dbs[MAIN_DBI as usize];
        let seq = state.seq;
        if wanted.is_empty() || wanted == state.flags() {
            return Ok(Database { dbi: MAIN_DBI, seq });
        }
        if state.rec.entries != 0 || txn.is_readonly() {
            return Err(Error::Incompatible);
        }
        let rec = DbRecord {
            seq: state.rec.seq,
            ..DbRecord::with_flags(wanted)
        };
        let slot = txn.core.dbis.lock()[MAIN_DBI as usize].clone();
        let state = &mut txn.inner.dbs[MAIN_DBI as usize];
        state.cmp = slot.cmp.unwrap_or_else(|| key_cmp_for(wanted));
        state.dcmp = slot.dcmp.unwrap_or_else(|| dup_cmp_for(wanted));
        txn.inner.set_record(MAIN_DBI, rec);
        Ok(Database { dbi: MAIN_DBI, seq })
    }

    fn open_named(txn: &mut Transaction, name: &str, wanted: DbFlags, create: bool) -> Result<Database> {
        if name.is_empty() || name.len() > max_key_size(txn.psize()) {
            return Err(Error::BadValSize);
        }
        let main = txn.inner.dbs[MAIN_DBI as usize].flags();
        if main.intersects(DbFlags::DUPSORT | DbFlags::INTEGERKEY) {
            return Err(Error::Incompatible);
        }
        let (rec, fresh) = match btree::find(&txn.inner, MAIN_DBI, name.as_bytes())? {
            Some(node) if node.flags.contains(NodeFlags::SUBDATA) => (DbRecord::decode(&node.data)?, false),
            Some(_) => return Err(Error::Incompatible),
            None if !create => return Err(Error::NotFound),
            None if txn.is_readonly() => return Err(Error::AccessDenied),
            None => (DbRecord::with_flags(wanted), true),
        };
        if !wanted.is_empty() && wanted != rec.db_flags() {
            return Err(Error::Incompatible);
        }

        let core = txn.core;
        let (dbi, slot, claimed) = {
            let mut slots = core.dbis.lock();
            let known = slots
                .iter()
                .position(|s| s.used && s.name.as_deref() == Some(name));
            match known {
                Some(dbi) => (dbi, slots[dbi].clone(), false),
                None => {
                    let vacant = slots
                        .iter()
                        .skip(CORE_DBS as usize)
                        .position(|s| !s.used)
                        .map(|i| i + CORE_DBS as usize);
                    let dbi = match vacant {
                        Some(dbi) => dbi,
                        None if slots.len() < (CORE_DBS + txn.env.max_dbs()) as usize => {
                            slots.push(DbSlot::vacant());
                            slots.len() - 1
                        }
                        None => return Err(Error::DbsFull),
                    };
                    let slot = &mut slots[dbi];
                    slot.name = Some(name.to_string());
                    slot.used = true;
                    (dbi, slot.clone(), true)
                }
            }
        };
        if claimed {
            txn.inner.created.push(dbi as Dbi);
        }
        while txn.inner.dbs.len() <= dbi {
            let seq = core.dbis.lock()[txn.inner.dbs.len()].seq;
            txn.inner.dbs.push(DbState::unused(seq));
        }
        let state = &mut txn.inner.dbs[dbi];
        if !(state.valid && state.seq == slot.seq) {
            *state = DbState::from_slot(&slot, rec);
        }
        if fresh {
            txn.inner.dbs[dbi].dirty = true;
            txn.ensure_room(cursor::write_budget(&txn.inner, MAIN_DBI, 0))?;
            cursor::store_subdb(txn, name.as_bytes(), &rec)?;
            txn.inner.dbs[dbi].dirty = false;
        }
        Ok(Database {
            dbi: dbi as Dbi,
            seq: slot.seq,
        })
    }

    /// Release the handle. Transactions using it must have ended.
    pub fn close(self, env: &Environment) -> Result<()> {
        if self.dbi < CORE_DBS {
            return Ok(());
        }
        let mut slots = env.core()?.dbis.lock();
        match slots.get_mut(self.dbi as usize) {
            Some(slot) if slot.used && slot.seq == self.seq => {
                slot.release();
                Ok(())
            }
            _ => Err(Error::BadDbi),
        }
    }

    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    fn state<'t>(&self, txn: &'t Transaction) -> Result<&'t DbState> {
        txn.check(false)?;
        txn.inner.db(self.dbi, self.seq)
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        let psize = txn.psize() as u32;
        Ok(self.state(txn)?.rec.stat(psize))
    }

    /// Get database flags
    pub fn flags(&self, txn: &Transaction) -> Result<DbFlags> {
        Ok(self.state(txn)?.flags())
    }

    /// Empty the database, and with `del` remove it from the environment
    pub fn drop(&self, txn: &mut Transaction, del: bool) -> Result<()> {
        txn.check(true)?;
        let state = txn.inner.db(self.dbi, self.seq)?;
        let (rec, name) = (state.rec, state.name.clone());
        if self.dbi == FREE_DBI {
            return Err(Error::InvalidArgument);
        }
        if self.dbi == MAIN_DBI && !cursor::named_databases(&txn.inner)?.is_empty() {
            return Err(Error::Incompatible);
        }
        let result = Self::drop_inner(txn, self.dbi, rec, name.filter(|_| del));
        if let Err(err) = result {
            return Err(txn.poison(err));
        }
        if del && self.dbi >= CORE_DBS {
            txn.inner.dbs[self.dbi as usize].valid = false;
            if let Some(slot) = txn.core.dbis.lock().get_mut(self.dbi as usize) {
                if slot.seq == self.seq {
                    slot.release();
                }
            }
            txn.inner.created.retain(|&dbi| dbi != self.dbi);
        }
        Ok(())
    }

    fn drop_inner(txn: &mut Transaction, dbi: Dbi, rec: DbRecord, name: Option<String>) -> Result<()> {
        txn.ensure_room(cursor::write_budget(&txn.inner, MAIN_DBI, 0))?;
        btree::drop_tree(txn, &rec, rec.db_flags().contains(DbFlags::DUPSORT))?;
        let empty = DbRecord {
            seq: rec.seq,
            ..DbRecord::with_flags(rec.db_flags())
        };
        txn.inner.set_record(dbi, empty);
        match name {
            Some(name) => {
                txn.inner.dbs[dbi as usize].dirty = false;
                cursor::delete_key(txn, MAIN_DBI, name.as_bytes())
            }
            None => Ok(()),
        }
    }

    /// Order keys with `cmp` instead of the default comparator
    pub fn set_compare(&self, txn: &mut Transaction, cmp: CmpFn) -> Result<()> {
        txn.inner.db(self.dbi, self.seq)?;
        if let Some(slot) = txn.core.dbis.lock().get_mut(self.dbi as usize) {
            slot.cmp = Some(cmp);
        }
        txn.inner.dbs[self.dbi as usize].cmp = cmp;
        Ok(())
    }

    /// Order the duplicates of a DUPSORT database with `cmp`
    pub fn set_dupsort(&self, txn: &mut Transaction, cmp: CmpFn) -> Result<()> {
        txn.inner.db(self.dbi, self.seq)?;
        if let Some(slot) = txn.core.dbis.lock().get_mut(self.dbi as usize) {
            slot.dcmp = Some(cmp);
        }
        txn.inner.dbs[self.dbi as usize].dcmp = cmp;
        Ok(())
    }

    fn check_key(txn: &Transaction, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > max_key_size(txn.psize()) {
            return Err(Error::BadValSize);
        }
        Ok(())
    }

    /// Value of `key`, the first one for a DUPSORT database
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state(txn)?;
        Self::check_key(txn, key)?;
        let mut cursor = CursorState::new(self.dbi, self.seq);
        let item = cursor.get(&txn.inner, Some(key), None, CursorOp::Set)?;
        Ok(item.map(|(_, value)| value))
    }

    /// Value of `key` together with its number of duplicates
    pub fn get_ex(&self, txn: &Transaction, key: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        self.state(txn)?;
        Self::check_key(txn, key)?;
        let mut cursor = CursorState::new(self.dbi, self.seq);
        match cursor.get(&txn.inner, Some(key), None, CursorOp::Set)? {
            Some((_, value)) => Ok(Some((value, cursor.count(&txn.inner)?))),
            None => Ok(None),
        }
    }

    pub fn put(&self, txn: &mut Transaction, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.rw_cursor(txn)?.put(key, data, flags)
    }

    /// Delete `key`. With `data`, only that value of a DUPSORT database.
    pub fn del(&self, txn: &mut Transaction, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        Self::check_key(txn, key)?;
        let dupsort = self.state(txn)?.flags().contains(DbFlags::DUPSORT);
        let mut cursor = self.rw_cursor(txn)?;
        let found = match data {
            Some(data) if dupsort => cursor.get_both(key, data)?,
            _ => cursor.set(key)?,
        };
        if found.is_none() {
            return Err(Error::NotFound);
        }
        let flags = if data.is_some() && dupsort {
            WriteFlags::empty()
        } else {
            WriteFlags::NODUPDATA
        };
        cursor.del(flags)
    }

    /// Store `new` under `key`, or delete the value when `new` is `None`,
    /// returning the value it replaced. A DUPSORT database needs the `old`
    /// value to swap unless the key has a single one.
    pub fn replace(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        new: Option<&[u8]>,
        old: Option<&[u8]>,
        flags: WriteFlags,
    ) -> Result<Option<Vec<u8>>> {
        Self::check_key(txn, key)?;
        let dupsort = self.state(txn)?.flags().contains(DbFlags::DUPSORT);
        let mut cursor = self.rw_cursor(txn)?;
        let previous = match cursor.set(key)? {
            None if flags.contains(WriteFlags::CURRENT) => return Err(Error::NotFound),
            None => None,
            Some(_) if flags.contains(WriteFlags::NOOVERWRITE) => return Err(Error::KeyExist),
            Some((_, first)) if dupsort => {
                let wanted = match old {
                    Some(old) => old.to_vec(),
                    None if cursor.count()? == 1 => first,
                    None => return Err(Error::MultiVal),
                };
                if cursor.get_both(key, &wanted)?.is_none() {
                    return Err(Error::NotFound);
                }
                if new == Some(wanted.as_slice()) {
                    return Ok(Some(wanted));
                }
                cursor.del(WriteFlags::empty())?;
                Some(wanted)
            }
            Some((_, value)) => Some(value),
        };
        match new {
            Some(new) => {
                let flags = flags & !(WriteFlags::CURRENT | WriteFlags::NOOVERWRITE);
                cursor.put(key, new, flags)?;
            }
            None if previous.is_some() && !dupsort => cursor.del(WriteFlags::NODUPDATA)?,
            None => {}
        }
        Ok(previous)
    }

    /// Return the persistent sequence of the database and add `increment` to it
    pub fn sequence(&self, txn: &mut Transaction, increment: u64) -> Result<u64> {
        let mut rec = self.state(txn)?.rec;
        let current = rec.seq;
        if increment == 0 {
            return Ok(current);
        }
        txn.check(true)?;
        rec.seq = current.checked_add(increment).ok_or(Error::InvalidArgument)?;
        txn.inner.set_record(self.dbi, rec);
        Ok(current)
    }

    pub fn cursor<'txn, 'env>(&self, txn: &'txn Transaction<'env>) -> Result<Cursor<'txn, 'env>> {
        Cursor::new(txn, self.dbi, self.seq)
    }

    pub fn rw_cursor<'txn, 'env>(&self, txn: &'txn mut Transaction<'env>) -> Result<RwCursor<'txn, 'env>> {
        RwCursor::new(txn, self.dbi, self.seq)
    }
}
