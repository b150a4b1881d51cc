use std::fmt;

/// Database handle index
pub type Dbi = u32;
/// Page number
pub type Pgno = u32;
/// Transaction id
pub type Txnid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    GetMultiple,
    Last,
    LastDup,
    Next,
    NextDup,
    NextMultiple,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetKey,
    SetRange,
    PrevMultiple,
}

/// Statistics for a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

/// Durability of a committed meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSign {
    /// Never sent to storage
    None,
    /// Written but not known to be durable
    Weak,
    /// Synced, carries the meta checksum
    Steady(u64),
}

impl DataSign {
    pub fn from_raw(raw: u64) -> DataSign {
        match raw {
            0 => DataSign::None,
            1 => DataSign::Weak,
            sign => DataSign::Steady(sign),
        }
    }

    pub fn raw(&self) -> u64 {
        match self {
            DataSign::None => 0,
            DataSign::Weak => 1,
            DataSign::Steady(sign) => *sign,
        }
    }

    pub fn is_steady(&self) -> bool {
        matches!(self, DataSign::Steady(_))
    }
}

/// Environment information
#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub mapsize: usize,
    pub last_pgno: Pgno,
    pub last_txnid: Txnid,
    pub max_readers: u32,
    pub num_readers: u32,
    /// Oldest snapshot still pinned by a reader
    pub tail_txnid: Txnid,
    pub meta1_txnid: Txnid,
    pub meta1_sign: DataSign,
    pub meta2_txnid: Txnid,
    pub meta2_sign: DataSign,
}

/// Application tuple stored with every commit. `v` is stamped with the txnid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Canary {
    pub x: u64,
    pub y: u64,
    pub z: u64,
    pub v: u64,
}

/// One occupied reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub tid: u64,
    /// Pinned snapshot, `None` for a reset transaction
    pub txnid: Option<Txnid>,
}

impl fmt::Display for ReaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.txnid {
            Some(txnid) => write!(f, "{:10} {:#18x} {:20}", self.pid, self.tid, txnid),
            None => write!(f, "{:10} {:#18x} {:>20}", self.pid, self.tid, "-"),
        }
    }
}

/// Passed to the out-of-space callback about the reader holding back reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomRequest {
    pub pid: u32,
    pub tid: u64,
    /// Snapshot the lagging reader is pinned to
    pub txnid: Txnid,
    /// Distance between the writer and that snapshot
    pub gap: u64,
    /// Number of earlier attempts for this allocation. Once the attempts
    /// end the callback is told with the negated count, `pid` and `tid`
    /// zero and `gap` how far the floor moved; its answer is ignored.
    pub retry: i32,
}

/// Answer of the out-of-space callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomDecision {
    /// Give up, the allocation fails with MapFull (-1)
    Refuse,
    /// The reader finished on its own, look again (0)
    Retry,
    /// The reader was told to stop, release its snapshot (1)
    Evicted,
    /// The reader's process is gone, clear the whole slot (>1)
    Killed,
}

impl OomDecision {
    pub fn from_code(code: i32) -> OomDecision {
        match code {
            i32::MIN..=-1 => OomDecision::Refuse,
            0 => OomDecision::Retry,
            1 => OomDecision::Evicted,
            _ => OomDecision::Killed,
        }
    }
}

/// Out-of-space callback
pub type OomFunc = Box<dyn Fn(&OomRequest) -> OomDecision + Send + Sync>;

/// Lifecycle state of a page as seen by a write transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Unmodified page of the snapshot, read through the map
    Mapped,
    /// Copy-on-write shadow held in memory
    Dirty,
    /// Dirty page already written to its final place ahead of commit
    Spilled,
    /// Dirtied then freed in this transaction, reusable right away
    Loose,
    /// Freed by this transaction, goes to FreeDB at commit
    FreedPending,
    /// Loaded from FreeDB, free for allocation
    Reclaimable,
}
