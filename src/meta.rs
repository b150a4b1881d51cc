use byteorder::{ByteOrder, NativeEndian};

use crate::constants::{
    DbFlags, DATA_VERSION, DB_RECORD_SIZE, FREE_DBI, MAIN_DBI, MDB_MAGIC, P_INVALID, PAGEHDRSZ,
};
use crate::error::{Error, Result};
use crate::page::{init_header, Page, PageKind};
use crate::types::{Canary, DataSign, Pgno, Stat, Txnid};

/// Database record matching MDBX_db, 40 bytes on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRecord {
    /// Key size for LEAF2 pages; page size for the free DB of a meta
    pub xsize: u32,
    /// Persistent database flags
    pub flags: u16,
    /// Depth of B-tree
    pub depth: u16,
    /// Per-database sequence
    pub seq: u64,
    /// Number of branch pages
    pub branch_pages: Pgno,
    /// Number of leaf pages
    pub leaf_pages: Pgno,
    /// Number of overflow pages
    pub overflow_pages: Pgno,
    /// Root page number
    pub root: Pgno,
    /// Number of data items
    pub entries: u64,
}

impl Default for DbRecord {
    fn default() -> Self {
        DbRecord {
            xsize: 0,
            flags: 0,
            depth: 0,
            seq: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            root: P_INVALID,
            entries: 0,
        }
    }
}

impl DbRecord {
    pub fn with_flags(flags: DbFlags) -> Self {
        DbRecord {
            flags: (flags & DbFlags::PERSISTENT).bits() as u16,
            ..DbRecord::default()
        }
    }

    pub fn db_flags(&self) -> DbFlags {
        DbFlags::from_bits_truncate(self.flags as u32)
    }

    pub fn is_empty_tree(&self) -> bool {
        self.root == P_INVALID
    }

    pub fn encode(&self) -> [u8; DB_RECORD_SIZE] {
        let mut buf = [0u8; DB_RECORD_SIZE];
        NativeEndian::write_u32(&mut buf[0..4], self.xsize);
        NativeEndian::write_u16(&mut buf[4..6], self.flags);
        NativeEndian::write_u16(&mut buf[6..8], self.depth);
        NativeEndian::write_u64(&mut buf[8..16], self.seq);
        NativeEndian::write_u32(&mut buf[16..20], self.branch_pages);
        NativeEndian::write_u32(&mut buf[20..24], self.leaf_pages);
        NativeEndian::write_u32(&mut buf[24..28], self.overflow_pages);
        NativeEndian::write_u32(&mut buf[28..32], self.root);
        NativeEndian::write_u64(&mut buf[32..40], self.entries);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<DbRecord> {
        if buf.len() != DB_RECORD_SIZE {
            return Err(Error::Corrupted);
        }
        Ok(DbRecord {
            xsize: NativeEndian::read_u32(&buf[0..4]),
            flags: NativeEndian::read_u16(&buf[4..6]),
            depth: NativeEndian::read_u16(&buf[6..8]),
            seq: NativeEndian::read_u64(&buf[8..16]),
            branch_pages: NativeEndian::read_u32(&buf[16..20]),
            leaf_pages: NativeEndian::read_u32(&buf[20..24]),
            overflow_pages: NativeEndian::read_u32(&buf[24..28]),
            root: NativeEndian::read_u32(&buf[28..32]),
            entries: NativeEndian::read_u64(&buf[32..40]),
        })
    }

    pub fn stat(&self, psize: u32) -> Stat {
        Stat {
            psize,
            depth: self.depth as u32,
            branch_pages: self.branch_pages as u64,
            leaf_pages: self.leaf_pages as u64,
            overflow_pages: self.overflow_pages as u64,
            entries: self.entries,
        }
    }
}

// Field offsets inside a meta page
const OFF_MAGIC: usize = PAGEHDRSZ;
const OFF_VERSION: usize = OFF_MAGIC + 4;
const OFF_MAPSIZE: usize = OFF_VERSION + 4;
const OFF_DBS: usize = OFF_MAPSIZE + 8;
const OFF_LAST_PG: usize = OFF_DBS + 2 * DB_RECORD_SIZE;
const OFF_TXNID: usize = OFF_LAST_PG + 8;
const OFF_SIGN: usize = OFF_TXNID + 8;
const OFF_CANARY: usize = OFF_SIGN + 8;
/// Bytes of a meta page actually used
pub const META_SIZE: usize = OFF_CANARY + 32;

/// Meta page content matching MDBX_meta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub mapsize: u64,
    /// Free and main database records
    pub dbs: [DbRecord; 2],
    /// Last used page in the datafile
    pub last_pg: Pgno,
    /// txnid that committed this page
    pub txnid: Txnid,
    pub sign: DataSign,
    pub canary: Canary,
}

impl Meta {
    /// Meta of a brand new environment
    pub fn initial(psize: usize, mapsize: usize) -> Self {
        let mut free = DbRecord::with_flags(DbFlags::INTEGERKEY);
        free.xsize = psize as u32;
        Meta {
            magic: MDB_MAGIC,
            version: DATA_VERSION,
            mapsize: mapsize as u64,
            dbs: [free, DbRecord::default()],
            last_pg: 1,
            txnid: 0,
            sign: DataSign::Weak,
            canary: Canary::default(),
        }
    }

    pub fn psize(&self) -> usize {
        self.dbs[FREE_DBI as usize].xsize as usize
    }

    pub fn main(&self) -> &DbRecord {
        &self.dbs[MAIN_DBI as usize]
    }

    /// Lay the meta out as page `slot` of `psize` bytes
    pub fn encode(&self, slot: Pgno, psize: usize) -> Vec<u8> {
        let mut buf = vec![0u8; psize];
        init_header(&mut buf, slot, PageKind::Meta, 0);
        NativeEndian::write_u32(&mut buf[OFF_MAGIC..OFF_MAGIC + 4], self.magic);
        NativeEndian::write_u32(&mut buf[OFF_VERSION..OFF_VERSION + 4], self.version);
        NativeEndian::write_u64(&mut buf[OFF_MAPSIZE..OFF_MAPSIZE + 8], self.mapsize);
        for (i, db) in self.dbs.iter().enumerate() {
            let off = OFF_DBS + i * DB_RECORD_SIZE;
            buf[off..off + DB_RECORD_SIZE].copy_from_slice(&db.encode());
        }
        NativeEndian::write_u32(&mut buf[OFF_LAST_PG..OFF_LAST_PG + 4], self.last_pg);
        NativeEndian::write_u64(&mut buf[OFF_TXNID..OFF_TXNID + 8], self.txnid);
        NativeEndian::write_u64(&mut buf[OFF_SIGN..OFF_SIGN + 8], self.sign.raw());
        let c = &self.canary;
        for (i, v) in [c.x, c.y, c.z, c.v].iter().enumerate() {
            let off = OFF_CANARY + 8 * i;
            NativeEndian::write_u64(&mut buf[off..off + 8], *v);
        }
        buf
    }

    /// Decode a meta page. Magic and version are checked, the sign is not.
    pub fn decode(buf: &[u8]) -> Result<Meta> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }
        let magic = NativeEndian::read_u32(&buf[OFF_MAGIC..OFF_MAGIC + 4]);
        if magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if Page::new(buf).kind()? != PageKind::Meta {
            return Err(Error::Invalid);
        }
        let version = NativeEndian::read_u32(&buf[OFF_VERSION..OFF_VERSION + 4]);
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch);
        }
        let db = |i: usize| {
            let off = OFF_DBS + i * DB_RECORD_SIZE;
            DbRecord::decode(&buf[off..off + DB_RECORD_SIZE])
        };
        let canary_at = |i: usize| {
            let off = OFF_CANARY + 8 * i;
            NativeEndian::read_u64(&buf[off..off + 8])
        };
        Ok(Meta {
            magic,
            version,
            mapsize: NativeEndian::read_u64(&buf[OFF_MAPSIZE..OFF_MAPSIZE + 8]),
            dbs: [db(0)?, db(1)?],
            last_pg: NativeEndian::read_u32(&buf[OFF_LAST_PG..OFF_LAST_PG + 4]),
            txnid: NativeEndian::read_u64(&buf[OFF_TXNID..OFF_TXNID + 8]),
            sign: DataSign::from_raw(NativeEndian::read_u64(&buf[OFF_SIGN..OFF_SIGN + 8])),
            canary: Canary {
                x: canary_at(0),
                y: canary_at(1),
                z: canary_at(2),
                v: canary_at(3),
            },
        })
    }

    /// Checksum stamped into a steady meta
    pub fn steady_sign(&self) -> u64 {
        let buf = self.encode(0, META_SIZE);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[OFF_MAGIC..OFF_SIGN]);
        hasher.update(&buf[OFF_CANARY..META_SIZE]);
        u64::from(hasher.finalize()) | (1 << 32)
    }

    /// A steady sign must match the content, anything else means a torn write
    pub fn sign_ok(&self) -> bool {
        match self.sign {
            DataSign::Steady(sign) => sign == self.steady_sign(),
            _ => true,
        }
    }

    pub fn is_steady(&self) -> bool {
        self.sign.is_steady()
    }
}

/// Order two metas: the higher txnid wins, a steady one wins a tie
fn newer(a: &Meta, b: &Meta) -> bool {
    a.txnid > b.txnid || (a.txnid == b.txnid && a.is_steady() && !b.is_steady())
}

/// Index of the authoritative meta among the usable ones
pub fn head_index(metas: &[Option<Meta>; 2]) -> Result<usize> {
    match (&metas[0], &metas[1]) {
        (Some(a), Some(b)) => Ok(if newer(b, a) { 1 } else { 0 }),
        (Some(_), None) => Ok(0),
        (None, Some(_)) => Ok(1),
        (None, None) => Err(Error::Corrupted),
    }
}

/// Slot a commit should overwrite: the non-head slot, unless that would
/// destroy the only steady checkpoint.
pub fn target_slot(metas: &[Option<Meta>; 2], head: usize) -> usize {
    let other = head ^ 1;
    match (&metas[head], &metas[other]) {
        (Some(h), Some(o)) if !h.is_steady() && o.is_steady() => head,
        _ => other,
    }
}

/// Txnid of the newest steady meta
pub fn steady_txnid(metas: &[Option<Meta>; 2]) -> Option<Txnid> {
    metas.iter().flatten().filter(|meta| meta.is_steady()).map(|meta| meta.txnid).max()
}

/// When the head is weak but an older steady meta exists, the slot of the
/// steady meta to roll back to
pub fn rollback_slot(metas: &[Option<Meta>; 2], head: usize) -> Option<usize> {
    let other = head ^ 1;
    match (&metas[head], &metas[other]) {
        (Some(h), Some(o)) if !h.is_steady() && o.is_steady() => Some(other),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    fn meta(txnid: Txnid, steady: bool) -> Meta {
        let mut m = Meta::initial(PAGE_SIZE, 1 << 20);
        m.txnid = txnid;
        if steady {
            m.sign = DataSign::Steady(m.steady_sign());
        }
        m
    }

    #[test]
    fn encode_decode_keeps_fields() {
        let mut m = meta(7, false);
        m.canary = Canary { x: 1, y: 2, z: 3, v: 7 };
        m.dbs[1].root = 42;
        m.dbs[1].entries = 9;
        m.sign = DataSign::Steady(m.steady_sign());
        let page = m.encode(1, PAGE_SIZE);
        let back = Meta::decode(&page).unwrap();
        assert_eq!(back, m);
        assert!(back.sign_ok());
        assert_eq!(back.psize(), PAGE_SIZE);
    }

    #[test]
    fn torn_steady_meta_is_detected() {
        let m = meta(3, true);
        let mut page = m.encode(0, PAGE_SIZE);
        page[OFF_LAST_PG] ^= 0xff;
        assert!(!Meta::decode(&page).unwrap().sign_ok());
    }

    #[test]
    fn bad_magic_and_version() {
        let m = meta(1, true);
        let mut page = m.encode(0, PAGE_SIZE);
        page[OFF_VERSION] ^= 0x55;
        assert_eq!(Meta::decode(&page), Err(Error::VersionMismatch));
        page[OFF_MAGIC] ^= 0x55;
        assert_eq!(Meta::decode(&page), Err(Error::Invalid));
    }

    #[test]
    fn weak_head_rolls_back_to_steady() {
        let metas = [Some(meta(6, true)), Some(meta(7, false))];
        let head = head_index(&metas).unwrap();
        assert_eq!(head, 1);
        assert_eq!(rollback_slot(&metas, head), Some(0));
        assert_eq!(target_slot(&metas, head), 1);

        let metas = [Some(meta(8, false)), Some(meta(7, false))];
        let head = head_index(&metas).unwrap();
        assert_eq!(head, 0);
        assert_eq!(rollback_slot(&metas, head), None);
        assert_eq!(target_slot(&metas, head), 1);
    }

    #[test]
    fn newest_steady_meta() {
        assert_eq!(steady_txnid(&[Some(meta(6, true)), Some(meta(7, false))]), Some(6));
        assert_eq!(steady_txnid(&[Some(meta(9, true)), Some(meta(8, true))]), Some(9));
        assert_eq!(steady_txnid(&[None, Some(meta(8, false))]), None);
    }
}
