//! Files, maps and the shared reader table.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fs2::FileExt as LockExt;
use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use once_cell::sync::Lazy;

use crate::constants::{LOCK_MAGIC, LOCK_VERSION, TXNID_NONE};
use crate::error::{Error, Result};
use crate::types::{ReaderInfo, Txnid};

static PID: Lazy<u32> = Lazy::new(std::process::id);

/// Id of the calling process
pub fn current_pid() -> u32 {
    *PID
}

/// Id of the calling thread
pub fn current_tid() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// Whether a process still exists
pub fn process_alive(pid: u32) -> bool {
    if pid == current_pid() {
        return true;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

pub fn open_file(path: &Path, rdonly: bool, mode: u32) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !rdonly {
        options.write(true).create(true).mode(mode);
    }
    Ok(options.open(path)?)
}

/// Map `len` bytes of the data file, shared and read-only
pub fn map_data(file: &File, len: usize) -> Result<Mmap> {
    let map = unsafe { MmapOptions::new().len(len).map(file) }?;
    Ok(map)
}

#[cfg(test)]
thread_local! {
    /// Writes of the calling thread fail with EIO while set
    pub static FAIL_WRITES: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
    /// Syncs of the calling thread fail with EIO while set
    pub static FAIL_SYNCS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
fn injected(fault: &'static std::thread::LocalKey<std::cell::Cell<bool>>) -> Result<()> {
    if fault.with(|fail| fail.get()) {
        return Err(Error::Os(libc::EIO));
    }
    Ok(())
}

pub fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    #[cfg(test)]
    injected(&FAIL_WRITES)?;
    file.write_all_at(buf, offset)?;
    Ok(())
}

pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Flush file data, and the inode too when `full`
pub fn fsync(file: &File, full: bool) -> Result<()> {
    #[cfg(test)]
    injected(&FAIL_SYNCS)?;
    if full {
        file.sync_all()?;
    } else {
        file.sync_data()?;
    }
    Ok(())
}

/// Exclusive cross-process lock held by the writer
pub fn lock_writer(file: &File) -> Result<()> {
    LockExt::lock_exclusive(file)?;
    Ok(())
}

pub fn unlock_writer(file: &File) {
    if let Err(err) = LockExt::unlock(file) {
        warn!("unlocking writer lock failed: {}", err);
    }
}

// Lock file layout
const HDR_MAGIC: usize = 0;
const HDR_FORMAT: usize = 8;
const HDR_ENVMODE: usize = 16;
const HDR_CAPACITY: usize = 24;
const HDR_NUMREADERS: usize = 64;
const HDR_SIZE: usize = 128;
const SLOT_SIZE: usize = 64;
const SLOT_TXNID: usize = 0;
const SLOT_PID: usize = 8;
const SLOT_TID: usize = 16;

/// Reader slots shared by every process attached to the environment.
///
/// The table lives in the memory mapped lock file and is only ever touched
/// through atomics.
pub struct ReaderTable {
    file: File,
    _map: MmapMut,
    base: NonNull<u8>,
    capacity: usize,
    created: bool,
}

impl std::fmt::Debug for ReaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderTable")
            .field("capacity", &self.capacity)
            .field("readers", &self.num_readers())
            .finish()
    }
}

// The mapping is owned by the table and all access goes through atomics.
unsafe impl Send for ReaderTable {}
unsafe impl Sync for ReaderTable {}

impl ReaderTable {
    /// Attach to the lock file, initialising it when no other process uses it
    pub fn open(path: &Path, mode: u32, max_readers: u32, env_mode: u64) -> Result<ReaderTable> {
        let file = open_file(path, false, mode)?;
        let first = LockExt::try_lock_exclusive(&file).is_ok();
        let capacity = if first {
            let size = HDR_SIZE + SLOT_SIZE * max_readers as usize;
            file.set_len(0)?;
            file.set_len(size as u64)?;
            max_readers as usize
        } else {
            LockExt::lock_shared(&file)?;
            let mut hdr = [0u8; HDR_SIZE];
            pread(&file, &mut hdr, 0).map_err(|_| Error::Invalid)?;
            let magic = u64::from_ne_bytes(hdr[HDR_MAGIC..HDR_MAGIC + 8].try_into().map_err(|_| Error::Invalid)?);
            let format = u64::from_ne_bytes(hdr[HDR_FORMAT..HDR_FORMAT + 8].try_into().map_err(|_| Error::Invalid)?);
            if magic != LOCK_MAGIC {
                return Err(Error::Invalid);
            }
            if format != LOCK_VERSION {
                return Err(Error::VersionMismatch);
            }
            u32::from_ne_bytes(hdr[HDR_CAPACITY..HDR_CAPACITY + 4].try_into().map_err(|_| Error::Invalid)?) as usize
        };
        let size = HDR_SIZE + SLOT_SIZE * capacity;
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or(Error::Invalid)?;
        let table = ReaderTable {
            file,
            _map: map,
            base,
            capacity,
            created: first,
        };
        if first {
            table.u64_at(HDR_MAGIC).store(LOCK_MAGIC, Ordering::Relaxed);
            table.u64_at(HDR_FORMAT).store(LOCK_VERSION, Ordering::Relaxed);
            table.u64_at(HDR_ENVMODE).store(env_mode, Ordering::Relaxed);
            table.u32_at(HDR_CAPACITY).store(capacity as u32, Ordering::Relaxed);
            table.u32_at(HDR_NUMREADERS).store(0, Ordering::Relaxed);
            for slot in 0..capacity {
                table.txnid_cell(slot).store(TXNID_NONE, Ordering::Relaxed);
                table.pid_cell(slot).store(0, Ordering::Relaxed);
                table.tid_cell(slot).store(0, Ordering::Relaxed);
            }
            LockExt::lock_shared(&table.file)?;
            debug!("initialised reader table with {} slots", capacity);
        }
        Ok(table)
    }

    /// Whether no other process had the environment open when this one attached
    pub fn created(&self) -> bool {
        self.created
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        unsafe { &*(self.base.as_ptr().add(off) as *const AtomicU64) }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        unsafe { &*(self.base.as_ptr().add(off) as *const AtomicU32) }
    }

    fn txnid_cell(&self, slot: usize) -> &AtomicU64 {
        self.u64_at(HDR_SIZE + slot * SLOT_SIZE + SLOT_TXNID)
    }

    fn pid_cell(&self, slot: usize) -> &AtomicU32 {
        self.u32_at(HDR_SIZE + slot * SLOT_SIZE + SLOT_PID)
    }

    fn tid_cell(&self, slot: usize) -> &AtomicU64 {
        self.u64_at(HDR_SIZE + slot * SLOT_SIZE + SLOT_TID)
    }

    fn numreaders(&self) -> usize {
        (self.u32_at(HDR_NUMREADERS).load(Ordering::Acquire) as usize).min(self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_readers(&self) -> u32 {
        (0..self.numreaders())
            .filter(|&slot| self.pid_cell(slot).load(Ordering::Acquire) != 0)
            .count() as u32
    }

    /// Claim a free slot for the calling thread
    pub fn acquire(&self) -> Result<usize> {
        let pid = current_pid();
        for slot in 0..self.capacity {
            if self
                .pid_cell(slot)
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.txnid_cell(slot).store(TXNID_NONE, Ordering::Release);
                self.tid_cell(slot).store(current_tid(), Ordering::Release);
                self.u32_at(HDR_NUMREADERS)
                    .fetch_max(slot as u32 + 1, Ordering::AcqRel);
                return Ok(slot);
            }
        }
        Err(Error::ReadersFull)
    }

    pub fn release(&self, slot: usize) {
        self.txnid_cell(slot).store(TXNID_NONE, Ordering::Release);
        self.tid_cell(slot).store(0, Ordering::Release);
        self.pid_cell(slot).store(0, Ordering::Release);
    }

    pub fn pin(&self, slot: usize, txnid: Txnid) {
        self.txnid_cell(slot).store(txnid, Ordering::SeqCst);
    }

    pub fn pinned(&self, slot: usize) -> Txnid {
        self.txnid_cell(slot).load(Ordering::Acquire)
    }

    /// Whether the slot still belongs to this process
    pub fn owned(&self, slot: usize) -> bool {
        self.pid_cell(slot).load(Ordering::Acquire) == current_pid()
    }

    /// Oldest snapshot pinned by any reader, `limit` when none is older
    pub fn oldest(&self, limit: Txnid) -> Txnid {
        (0..self.numreaders())
            .filter(|&slot| self.pid_cell(slot).load(Ordering::Acquire) != 0)
            .map(|slot| self.txnid_cell(slot).load(Ordering::Acquire))
            .filter(|&txnid| txnid != TXNID_NONE)
            .fold(limit, Txnid::min)
    }

    /// Reader pinned to the oldest snapshot
    pub fn laggard(&self) -> Option<ReaderInfo> {
        self.list()
            .into_iter()
            .filter(|r| r.txnid.is_some())
            .min_by_key(|r| r.txnid)
    }

    pub fn list(&self) -> Vec<ReaderInfo> {
        (0..self.numreaders())
            .filter_map(|slot| {
                let pid = self.pid_cell(slot).load(Ordering::Acquire);
                if pid == 0 {
                    return None;
                }
                let txnid = self.txnid_cell(slot).load(Ordering::Acquire);
                Some(ReaderInfo {
                    slot,
                    pid,
                    tid: self.tid_cell(slot).load(Ordering::Acquire),
                    txnid: (txnid != TXNID_NONE).then_some(txnid),
                })
            })
            .collect()
    }

    /// Stop a reader from holding back reclamation; `clear` frees the slot
    pub fn evict(&self, slot: usize, pid: u32, clear: bool) -> bool {
        if self.pid_cell(slot).load(Ordering::Acquire) != pid {
            return false;
        }
        self.txnid_cell(slot).store(TXNID_NONE, Ordering::Release);
        if clear {
            self.tid_cell(slot).store(0, Ordering::Release);
            let _ = self
                .pid_cell(slot)
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
        true
    }

    /// Release the slots of processes that no longer exist
    pub fn clear_dead(&self) -> usize {
        let mut cleared = 0;
        for slot in 0..self.numreaders() {
            let pid = self.pid_cell(slot).load(Ordering::Acquire);
            if pid != 0 && !process_alive(pid) {
                warn!("clearing reader slot {} of dead process {}", slot, pid);
                if self.evict(slot, pid, true) {
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

impl Drop for ReaderTable {
    fn drop(&mut self) {
        let _ = LockExt::unlock(&self.file);
    }
}
