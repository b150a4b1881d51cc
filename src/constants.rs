use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        /// Path names the data file itself, lock file is `<path>-lock`
        const NOSUBDIR = 0x4000;
        /// Don't fsync after commit
        const NOSYNC = 0x10000;
        /// Read only
        const RDONLY = 0x20000;
        /// Don't fsync the meta page after commit
        const NOMETASYNC = 0x40000;
        /// Accepted for compatibility, pages are still written through the file
        const WRITEMAP = 0x80000;
        /// Combined with NOSYNC the commit does not even count as written
        const MAPASYNC = 0x100000;
        /// Reader slots are tied to transactions rather than threads
        const NOTLS = 0x200000;
        /// Don't do readahead
        const NORDAHEAD = 0x800000;
        /// Accepted, new pages are always zeroed
        const NOMEMINIT = 0x1000000;
        /// Merge adjacent reclaimed runs before allocating
        const COALESCE = 0x2000000;
        /// Consume FreeDB records newest first
        const LIFORECLAIM = 0x4000000;
        /// Scribble over freed dirty pages
        const PAGEPERTURB = 0x8000000;
        /// No sync at all
        const UTTERLY_NOSYNC = Self::NOSYNC.bits() | Self::MAPASYNC.bits();
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

impl DbFlags {
    /// Flags stored in the database record
    pub const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxnFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();
        const NOSYNC = EnvFlags::NOSYNC.bits();
        const NOMETASYNC = EnvFlags::NOMETASYNC.bits();

        // Transaction-specific flags
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const DIRTY = 0x04;
        const SPILLS = 0x08;
        const HAS_CHILD = 0x10;
        /// Set while the freelist is written back, reclaiming is off
        const FREELIST_SAVE = 0x20;
        const BLOCKED = Self::FINISHED.bits() | Self::ERROR.bits() | Self::HAS_CHILD.bits();
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CopyFlags: u32 {
        const COMPACT = 0x01;
    }
}

// Node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u16 {
        /// Data lives in overflow pages
        const BIGDATA = 0x01;
        /// Data is a database record
        const SUBDATA = 0x02;
        /// Data has duplicates
        const DUPDATA = 0x04;
    }
}

// Page flags as stored in the page header
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const LEAF2 = 0x20;
        const SUBP = 0x40;
    }
}

// Cursor state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CursorFlags: u32 {
        const INITIALIZED = 0x01;
        const EOF = 0x02;
        const DEL = 0x08;
        /// With DEL: the cursor stayed on the deleted value's key
        const DEL_DUP = 0x10;
    }
}

// Per-environment debug switches
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Check page headers as pages are fetched
        const ASSERT = 0x01;
        /// Run the space audit on every commit
        const AUDIT = 0x02;
        /// Trace page allocation and reclamation
        const TRACE = 0x04;
    }
}

/// Page size used for new environments
pub const PAGE_SIZE: usize = 4096;
/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// On-disk data format version
pub const DATA_VERSION: u32 = 2;
/// Lock file magic
pub const LOCK_MAGIC: u64 = 0x4D44_4258_4C4F_434B;
/// Lock file format version
pub const LOCK_VERSION: u64 = 2;

/// Core database identifiers
pub const FREE_DBI: u32 = 0;
pub const MAIN_DBI: u32 = 1;
pub const CORE_DBS: u32 = 2;
/// Pages 0 and 1 hold the metas
pub const NUM_METAS: u32 = 2;

/// Size of the common page header
pub const PAGEHDRSZ: usize = 16;
/// Size of a node header
pub const NODESIZE: usize = 8;
/// Size of a serialized database record
pub const DB_RECORD_SIZE: usize = 40;
/// Invalid page number, marks an empty tree
pub const P_INVALID: u32 = u32::MAX;
/// Reader slot txnid meaning "not reading"
pub const TXNID_NONE: u64 = u64::MAX;
/// Max depth of a cursor stack
pub const CURSOR_STACK: usize = 32;
/// A page must hold at least this many nodes
pub const MINKEYS: usize = 2;
/// Pages below this fill (per mille) are candidates for merging
pub const FILL_THRESHOLD: usize = 250;

pub const DEFAULT_MAPSIZE: usize = 1 << 20;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 0;
pub const DEFAULT_MAX_DIRTY: usize = 65536;
/// Max value size, as a signed 32-bit length
pub const MAXDATASIZE: usize = i32::MAX as usize;
