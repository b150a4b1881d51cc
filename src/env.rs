use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::{debug, error, warn};
use memmap2::{Advice, Mmap};
use parking_lot::Mutex;

use crate::cmp::CmpFn;
use crate::constants::{
    CopyFlags, DbFlags, DebugFlags, EnvFlags, NodeFlags, TxnFlags, WriteFlags, DEFAULT_MAPSIZE,
    DEFAULT_MAX_DBS, DEFAULT_MAX_DIRTY, DEFAULT_MAX_READERS, FREE_DBI, MAIN_DBI, NUM_METAS, PAGE_SIZE,
};
use crate::cursor;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::{self, DbRecord, Meta, META_SIZE};
use crate::osal::{self, ReaderTable};
use crate::page::max_key_size;
use crate::transaction::{DbState, Transaction};
use crate::types::{DataSign, EnvInfo, OomFunc, Pgno, ReaderInfo, Stat};

/// Chunk size of a plain copy
const COPY_CHUNK: usize = 1 << 20;

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC
        | EnvFlags::NOMETASYNC
        | EnvFlags::MAPASYNC
        | EnvFlags::NOMEMINIT
        | EnvFlags::COALESCE
        | EnvFlags::LIFORECLAIM
        | EnvFlags::PAGEPERTURB;
}

/// Settings of an environment, fixed at open unless noted on the setter
pub(crate) struct EnvConfig {
    mapsize: usize,
    max_readers: u32,
    max_dbs: u32,
    max_dirty: usize,
    sync_bytes: usize,
    flags: EnvFlags,
    debug: DebugFlags,
    oom: Option<OomFunc>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            mapsize: DEFAULT_MAPSIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            max_dirty: DEFAULT_MAX_DIRTY,
            sync_bytes: 0,
            flags: EnvFlags::empty(),
            debug: DebugFlags::empty(),
            oom: None,
        }
    }
}

/// Environment-wide record of a database handle
#[derive(Debug, Clone)]
pub(crate) struct DbSlot {
    pub(crate) name: Option<String>,
    /// Comparators set by the application
    pub(crate) cmp: Option<CmpFn>,
    pub(crate) dcmp: Option<CmpFn>,
    /// Bumped every time the slot is released, invalidating old handles
    pub(crate) seq: u32,
    pub(crate) used: bool,
}

impl DbSlot {
    fn core() -> Self {
        DbSlot {
            name: None,
            cmp: None,
            dcmp: None,
            seq: 0,
            used: true,
        }
    }

    pub(crate) fn vacant() -> Self {
        DbSlot {
            used: false,
            ..DbSlot::core()
        }
    }

    pub(crate) fn release(&mut self) {
        self.name = None;
        self.cmp = None;
        self.dcmp = None;
        self.used = false;
        self.seq = self.seq.wrapping_add(1);
    }
}

/// State of an open environment
#[derive(Debug)]
pub(crate) struct EnvCore {
    pub(crate) path: PathBuf,
    pub(crate) data: File,
    /// Read-only shared map of the whole data file
    pub(crate) map: Arc<Mmap>,
    pub(crate) mapsize: usize,
    pub(crate) psize: usize,
    pub(crate) readers: ReaderTable,
    /// Serialises writers of this process, the file lock does it across processes
    pub(crate) writer: Mutex<()>,
    pub(crate) dbis: Mutex<Vec<DbSlot>>,
    fatal: AtomicBool,
    /// Bytes written since the last steady sync
    unsynced: AtomicU64,
}

impl EnvCore {
    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub(crate) fn set_fatal(&self) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            error!("environment {} entered the fatal state", self.path.display());
        }
    }

    /// Both meta pages as currently mapped; torn or foreign ones are `None`
    pub(crate) fn metas(&self) -> [Option<Meta>; 2] {
        let read = |slot: usize| {
            let start = slot * self.psize;
            self.map
                .get(start..start + META_SIZE)
                .and_then(|buf| Meta::decode(buf).ok())
                .filter(Meta::sign_ok)
        };
        [read(0), read(1)]
    }

    pub(crate) fn head_meta(&self) -> Result<Meta> {
        let metas = self.metas();
        let head = meta::head_index(&metas)?;
        metas[head].ok_or(Error::Corrupted)
    }

    pub(crate) fn add_unsynced(&self, bytes: u64) -> u64 {
        self.unsynced.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub(crate) fn clear_unsynced(&self) {
        self.unsynced.store(0, Ordering::Release);
    }

    /// Sign the head meta steady after flushing the data file
    pub(crate) fn sync_head(&self) -> Result<()> {
        osal::fsync(&self.data, false)?;
        let metas = self.metas();
        let head = meta::head_index(&metas)?;
        let mut meta = metas[head].ok_or(Error::Corrupted)?;
        if !meta.is_steady() {
            meta.sign = DataSign::Steady(meta.steady_sign());
            let page = meta.encode(head as Pgno, self.psize);
            osal::pwrite(&self.data, &page, (head * self.psize) as u64)?;
            osal::fsync(&self.data, false)?;
            debug!("signed meta {} of txn {} steady", head, meta.txnid);
        }
        self.clear_unsynced();
        Ok(())
    }
}

fn round_up(size: usize, psize: usize) -> usize {
    size.div_ceil(psize) * psize
}

/// Data and lock file paths of an environment
fn env_files(path: &Path, flags: EnvFlags) -> (PathBuf, PathBuf) {
    if flags.contains(EnvFlags::NOSUBDIR) {
        let mut lock = path.as_os_str().to_owned();
        lock.push("-lock");
        (path.to_path_buf(), PathBuf::from(lock))
    } else {
        (path.join("data.mdb"), path.join("lock.mdb"))
    }
}

/// An environment: one data file holding a set of databases, shared by
/// every process that opens it.
pub struct Environment {
    config: EnvConfig,
    core: Option<EnvCore>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.core.as_ref().map(|core| &core.path))
            .field("flags", &self.config.flags)
            .field("mapsize", &self.config.mapsize)
            .finish()
    }
}

impl Environment {
    /// Create an unopened environment with default settings
    pub fn new() -> Result<Environment> {
        Ok(Environment {
            config: EnvConfig::default(),
            core: None,
        })
    }

    pub(crate) fn core(&self) -> Result<&EnvCore> {
        self.core.as_ref().ok_or(Error::InvalidArgument)
    }

    pub(crate) fn flags(&self) -> EnvFlags {
        self.config.flags
    }

    pub(crate) fn debug_flags(&self) -> DebugFlags {
        self.config.debug
    }

    pub(crate) fn max_dirty(&self) -> usize {
        self.config.max_dirty
    }

    pub(crate) fn max_dbs(&self) -> u32 {
        self.config.max_dbs
    }

    pub(crate) fn sync_bytes(&self) -> usize {
        self.config.sync_bytes
    }

    pub(crate) fn oom_func(&self) -> Option<&OomFunc> {
        self.config.oom.as_ref()
    }

    fn is_open(&self) -> bool {
        self.core.is_some()
    }

    /// Open the environment at `path`: a directory, or the data file itself
    /// with `NOSUBDIR`. A missing data file is created with `mode`.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, flags: EnvFlags, mode: u32) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidArgument);
        }
        let flags = self.config.flags | flags;
        let path = path.as_ref();
        let (data_path, lock_path) = env_files(path, flags);
        let rdonly = flags.contains(EnvFlags::RDONLY);

        let data = osal::open_file(&data_path, rdonly, mode)?;
        let readers = ReaderTable::open(&lock_path, mode, self.config.max_readers, flags.bits() as u64)?;
        let len = data.metadata()?.len() as usize;

        let (psize, head) = if len == 0 {
            if rdonly {
                return Err(Error::Invalid);
            }
            let psize = PAGE_SIZE;
            let mapsize = round_up(self.config.mapsize.max(NUM_METAS as usize * psize), psize);
            let mut meta = Meta::initial(psize, mapsize);
            meta.sign = DataSign::Steady(meta.steady_sign());
            for slot in 0..NUM_METAS as usize {
                osal::pwrite(&data, &meta.encode(slot as Pgno, psize), (slot * psize) as u64)?;
            }
            data.set_len(mapsize as u64)?;
            osal::fsync(&data, true)?;
            debug!("created environment {} with map size {}", path.display(), mapsize);
            (psize, meta)
        } else {
            Self::recover(&data, &readers, rdonly)?
        };

        let used = (head.last_pg as usize + 1) * psize;
        let mapsize = round_up(self.config.mapsize.max(head.mapsize as usize).max(used), psize);
        if !rdonly && len < mapsize {
            data.set_len(mapsize as u64)?;
        }
        let map = osal::map_data(&data, mapsize)?;
        if flags.contains(EnvFlags::NORDAHEAD) {
            map.advise(Advice::Random)?;
        }

        self.config.flags = flags;
        self.config.mapsize = mapsize;
        let dbis = vec![DbSlot::core(), DbSlot::core()];
        self.core = Some(EnvCore {
            path: path.to_path_buf(),
            data,
            map: Arc::new(map),
            mapsize,
            psize,
            readers,
            writer: Mutex::new(()),
            dbis: Mutex::new(dbis),
            fatal: AtomicBool::new(false),
            unsynced: AtomicU64::new(0),
        });
        debug!(
            "opened environment {}: txn {}, {} pages used, map size {}",
            path.display(),
            head.txnid,
            head.last_pg + 1,
            mapsize
        );
        Ok(())
    }

    /// Read the metas of an existing data file. The first process to attach
    /// rolls a weak head back to the last steady meta.
    fn recover(data: &File, readers: &ReaderTable, rdonly: bool) -> Result<(usize, Meta)> {
        let mut buf = vec![0u8; META_SIZE];
        osal::pread(data, &mut buf, 0).map_err(|_| Error::Invalid)?;
        let psize = Meta::decode(&buf)?.psize();
        if !psize.is_power_of_two() || !(256..=65536).contains(&psize) {
            return Err(Error::Invalid);
        }
        let mut metas = [None, None];
        for (slot, meta) in metas.iter_mut().enumerate() {
            osal::pread(data, &mut buf, (slot * psize) as u64)?;
            *meta = Meta::decode(&buf).ok().filter(Meta::sign_ok);
        }
        let head = meta::head_index(&metas)?;
        if readers.created() && !rdonly {
            if let Some(steady) = meta::rollback_slot(&metas, head) {
                let meta = metas[steady].ok_or(Error::Corrupted)?;
                let weak = metas[head].map_or(0, |m| m.txnid);
                osal::pwrite(data, &meta.encode(head as Pgno, psize), (head * psize) as u64)?;
                osal::fsync(data, false)?;
                debug!("rolled back weak txn {} to steady txn {}", weak, meta.txnid);
                metas[head] = Some(meta);
            }
        }
        Ok((psize, metas[head].ok_or(Error::Corrupted)?))
    }

    /// Close the environment, syncing it first
    pub fn close(self) {
        drop(self);
    }

    /// Close the environment. With `dont_sync` the last commits stay weak and
    /// are rolled back by the next process to open it.
    pub fn close_ex(mut self, dont_sync: bool) {
        self.shutdown(dont_sync);
    }

    fn shutdown(&mut self, dont_sync: bool) {
        let core = match self.core.take() {
            Some(core) => core,
            None => return,
        };
        let rdonly = self.config.flags.contains(EnvFlags::RDONLY);
        if !dont_sync && !rdonly && !core.is_fatal() {
            let _guard = core.writer.lock();
            let result = osal::lock_writer(&core.data).and_then(|()| {
                let result = core.sync_head();
                osal::unlock_writer(&core.data);
                result
            });
            if let Err(err) = result {
                warn!("syncing {} on close failed: {}", core.path.display(), err);
            }
        }
        debug!("closed environment {}", core.path.display());
    }

    /// Begin a transaction; `TxnFlags::RDONLY` makes it read-only
    pub fn begin_txn(&self, flags: TxnFlags) -> Result<Transaction<'_>> {
        Transaction::begin(self, flags)
    }

    pub fn begin_rw_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, TxnFlags::empty())
    }

    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self, TxnFlags::RDONLY)
    }

    /// Set the map size. Once open the file is resized and remapped; `0`
    /// adopts the size recorded by the last commit.
    pub fn set_mapsize(&mut self, size: usize) -> Result<()> {
        let rdonly = self.config.flags.contains(EnvFlags::RDONLY);
        let core = match self.core.as_mut() {
            Some(core) => core,
            None => {
                self.config.mapsize = if size == 0 { DEFAULT_MAPSIZE } else { size };
                return Ok(());
            }
        };
        let head = core.head_meta()?;
        let used = (head.last_pg as usize + 1) * core.psize;
        let wanted = if size == 0 { head.mapsize as usize } else { size };
        let mapsize = round_up(wanted.max(used), core.psize);
        if !rdonly {
            let _guard = core.writer.lock();
            osal::lock_writer(&core.data)?;
            let resized = core.data.set_len(mapsize as u64);
            osal::unlock_writer(&core.data);
            resized?;
        }
        core.map = Arc::new(osal::map_data(&core.data, mapsize)?);
        core.mapsize = mapsize;
        self.config.mapsize = mapsize;
        debug!("map of {} resized to {}", core.path.display(), mapsize);
        Ok(())
    }

    pub fn set_maxreaders(&mut self, readers: u32) -> Result<()> {
        if self.is_open() || readers == 0 {
            return Err(Error::InvalidArgument);
        }
        self.config.max_readers = readers;
        Ok(())
    }

    /// Number of named databases the environment can have open
    pub fn set_maxdbs(&mut self, dbs: u32) -> Result<()> {
        if self.is_open() {
            return Err(Error::InvalidArgument);
        }
        self.config.max_dbs = dbs;
        Ok(())
    }

    /// Dirty pages a write transaction keeps in memory before spilling
    pub fn set_max_dirty(&mut self, pages: usize) -> Result<()> {
        if self.is_open() || pages == 0 {
            return Err(Error::InvalidArgument);
        }
        self.config.max_dirty = pages;
        Ok(())
    }

    /// Force a steady sync once this many bytes were written since the
    /// last one; `0` disables it
    pub fn set_syncbytes(&mut self, bytes: usize) -> Result<()> {
        self.config.sync_bytes = bytes;
        Ok(())
    }

    pub fn set_oomfunc(&mut self, oom: Option<OomFunc>) {
        self.config.oom = oom;
    }

    pub fn set_debug(&mut self, debug: DebugFlags) {
        self.config.debug = debug;
    }

    /// Turn flags on or off. Once open only the run-time flags may change.
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if self.is_open() && !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        self.config.flags.set(flags, onoff);
        Ok(())
    }

    pub fn get_flags(&self) -> Result<EnvFlags> {
        self.core()?;
        Ok(self.config.flags)
    }

    pub fn get_path(&self) -> Result<&Path> {
        Ok(&self.core()?.path)
    }

    pub fn get_maxkeysize(&self) -> usize {
        max_key_size(self.core.as_ref().map_or(PAGE_SIZE, |core| core.psize))
    }

    pub fn get_maxreaders(&self) -> u32 {
        match &self.core {
            Some(core) => core.readers.capacity() as u32,
            None => self.config.max_readers,
        }
    }

    /// Statistics of the main database in the newest snapshot
    pub fn stat(&self) -> Result<Stat> {
        let core = self.core()?;
        Ok(core.head_meta()?.main().stat(core.psize as u32))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let core = self.core()?;
        let metas = core.metas();
        let head = core.head_meta()?;
        let txnid = |slot: usize| metas[slot].map_or(0, |m| m.txnid);
        let sign = |slot: usize| metas[slot].map_or(DataSign::None, |m| m.sign);
        Ok(EnvInfo {
            mapsize: core.mapsize,
            last_pgno: head.last_pg,
            last_txnid: head.txnid,
            max_readers: core.readers.capacity() as u32,
            num_readers: core.readers.num_readers(),
            tail_txnid: core.readers.oldest(head.txnid),
            meta1_txnid: txnid(0),
            meta1_sign: sign(0),
            meta2_txnid: txnid(1),
            meta2_sign: sign(1),
        })
    }

    /// Flush the data file and make the newest commit steady. Without
    /// `force` an environment opened with `NOSYNC` is left alone.
    pub fn sync(&self, force: bool) -> Result<()> {
        let core = self.core()?;
        if self.config.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::AccessDenied);
        }
        if self.config.flags.contains(EnvFlags::NOSYNC) && !force {
            return Ok(());
        }
        let _guard = core.writer.try_lock().ok_or(Error::Busy)?;
        osal::lock_writer(&core.data)?;
        let result = core.sync_head();
        osal::unlock_writer(&core.data);
        if result.is_err() {
            core.set_fatal();
        }
        result
    }

    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        Ok(self.core()?.readers.list())
    }

    /// Release the reader slots of processes that no longer exist
    pub fn reader_check(&self) -> Result<usize> {
        Ok(self.core()?.readers.clear_dead())
    }

    /// Write a consistent copy of the newest snapshot to `path`, a
    /// directory unless the environment uses `NOSUBDIR`
    pub fn copy<P: AsRef<Path>>(&self, path: P, flags: CopyFlags) -> Result<()> {
        let path = path.as_ref();
        if !self.config.flags.contains(EnvFlags::NOSUBDIR) {
            fs::create_dir_all(path)?;
        }
        if flags.contains(CopyFlags::COMPACT) {
            self.copy_compact(path)
        } else {
            self.copy_plain(path)
        }
    }

    fn copy_plain(&self, path: &Path) -> Result<()> {
        let core = self.core()?;
        let txn = self.begin_ro_txn()?;
        let inner = &txn.inner;
        let psize = core.psize;
        let (data_path, _) = env_files(path, self.config.flags);
        let file = osal::open_file(&data_path, false, 0o644)?;
        file.set_len(0)?;

        let mut meta = Meta::initial(psize, core.mapsize);
        meta.dbs[FREE_DBI as usize] = DbRecord {
            xsize: psize as u32,
            ..inner.dbs[FREE_DBI as usize].rec
        };
        meta.dbs[MAIN_DBI as usize] = inner.dbs[MAIN_DBI as usize].rec;
        meta.last_pg = inner.next_pgno - 1;
        meta.txnid = inner.txnid;
        meta.canary = inner.canary;
        meta.sign = DataSign::Steady(meta.steady_sign());
        for slot in 0..NUM_METAS as usize {
            osal::pwrite(&file, &meta.encode(slot as Pgno, psize), (slot * psize) as u64)?;
        }

        let chunk = (COPY_CHUNK / psize).max(1);
        let mut pgno = NUM_METAS as usize;
        while pgno < inner.next_pgno as usize {
            let n = chunk.min(inner.next_pgno as usize - pgno);
            let bytes = inner.span(pgno as Pgno, n)?;
            osal::pwrite(&file, bytes, (pgno * psize) as u64)?;
            pgno += n;
        }
        osal::fsync(&file, true)?;
        debug!("copied txn {} of {} to {}", inner.txnid, core.path.display(), path.display());
        Ok(())
    }

    /// Copy holding only live data: every database is re-inserted into a
    /// fresh environment
    fn copy_compact(&self, path: &Path) -> Result<()> {
        let core = self.core()?;
        let src = self.begin_ro_txn()?;
        let named = cursor::named_databases(&src.inner)?;
        let slots = core.dbis.lock().clone();

        let mut dst = Environment::new()?;
        dst.set_mapsize(core.mapsize)?;
        dst.set_maxdbs(named.len() as u32)?;
        dst.open(path, self.config.flags & EnvFlags::NOSUBDIR, 0o644)?;
        let mut txn = dst.begin_rw_txn()?;

        let main = &src.inner.dbs[MAIN_DBI as usize];
        let db = Database::open(&mut txn, None, main.flags())?;
        Self::copy_compare(&mut txn, db, &slots[MAIN_DBI as usize])?;
        Self::copy_tree(&src, main, &mut txn, db)?;
        db.sequence(&mut txn, main.rec.seq)?;

        for (name, rec) in named {
            let name = String::from_utf8(name).map_err(|_| Error::Incompatible)?;
            let slot = slots.iter().find(|s| s.used && s.name.as_deref() == Some(name.as_str()));
            let mut state = DbState::for_record(rec);
            if let Some(slot) = slot {
                state = DbState::from_slot(slot, rec);
            }
            let db = Database::open(&mut txn, Some(&name), rec.db_flags() | DbFlags::CREATE)?;
            if let Some(slot) = slot {
                Self::copy_compare(&mut txn, db, slot)?;
            }
            Self::copy_tree(&src, &state, &mut txn, db)?;
            db.sequence(&mut txn, rec.seq)?;
        }
        txn.canary_put(&src.canary_get())?;
        txn.commit()?;
        debug!("compacted {} into {}", core.path.display(), path.display());
        Ok(())
    }

    fn copy_compare(txn: &mut Transaction<'_>, db: Database, slot: &DbSlot) -> Result<()> {
        if let Some(cmp) = slot.cmp {
            db.set_compare(txn, cmp)?;
        }
        if let Some(dcmp) = slot.dcmp {
            db.set_dupsort(txn, dcmp)?;
        }
        Ok(())
    }

    fn copy_tree(src: &Transaction<'_>, state: &DbState, txn: &mut Transaction<'_>, db: Database) -> Result<()> {
        cursor::scan(&src.inner, state, |key, value, flags| {
            if flags.contains(NodeFlags::SUBDATA) && !flags.contains(NodeFlags::DUPDATA) {
                return Ok(());
            }
            db.put(&mut *txn, key, value, WriteFlags::APPENDDUP)
        })
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
