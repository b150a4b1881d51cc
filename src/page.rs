//! Page and node layout.
//!
//! Every page starts with a 16 byte header:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | page number                             |
//! | 4      | 4    | unused, in-memory link in the C engine  |
//! | 8      | 2    | key size of LEAF2 pages                 |
//! | 10     | 2    | page flags                              |
//! | 12     | 2/4  | lower bound, or overflow page count     |
//! | 14     | 2    | upper bound                             |
//!
//! Branch and leaf pages continue with an array of 16-bit node offsets that
//! grows upwards, while the nodes themselves are packed downwards from the
//! end of the page. LEAF2 pages store fixed size keys back to back instead,
//! with the lower bound right after the last key.

use byteorder::{ByteOrder, NativeEndian};

use crate::constants::{NodeFlags, PageFlags, MINKEYS, NODESIZE, PAGEHDRSZ};
use crate::error::{Error, Result};
use crate::types::Pgno;

/// Page type, decided from the exact header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Branch,
    Leaf,
    /// Leaf of fixed size duplicates
    Leaf2,
    Overflow,
    Meta,
    /// Duplicates embedded in a leaf node
    SubLeaf,
    /// Fixed size duplicates embedded in a leaf node
    SubLeaf2,
}

impl PageKind {
    pub fn from_flags(raw: u16) -> Result<PageKind> {
        const BRANCH: u16 = PageFlags::BRANCH.bits();
        const LEAF: u16 = PageFlags::LEAF.bits();
        const LEAF2: u16 = PageFlags::LEAF.bits() | PageFlags::LEAF2.bits();
        const OVERFLOW: u16 = PageFlags::OVERFLOW.bits();
        const META: u16 = PageFlags::META.bits();
        const SUBLEAF: u16 = PageFlags::LEAF.bits() | PageFlags::SUBP.bits();
        const SUBLEAF2: u16 =
            PageFlags::LEAF.bits() | PageFlags::LEAF2.bits() | PageFlags::SUBP.bits();
        match raw {
            BRANCH => Ok(PageKind::Branch),
            LEAF => Ok(PageKind::Leaf),
            LEAF2 => Ok(PageKind::Leaf2),
            OVERFLOW => Ok(PageKind::Overflow),
            META => Ok(PageKind::Meta),
            SUBLEAF => Ok(PageKind::SubLeaf),
            SUBLEAF2 => Ok(PageKind::SubLeaf2),
            _ => Err(Error::Corrupted),
        }
    }

    pub fn flags(self) -> PageFlags {
        match self {
            PageKind::Branch => PageFlags::BRANCH,
            PageKind::Leaf => PageFlags::LEAF,
            PageKind::Leaf2 => PageFlags::LEAF | PageFlags::LEAF2,
            PageKind::Overflow => PageFlags::OVERFLOW,
            PageKind::Meta => PageFlags::META,
            PageKind::SubLeaf => PageFlags::LEAF | PageFlags::SUBP,
            PageKind::SubLeaf2 => PageFlags::LEAF | PageFlags::LEAF2 | PageFlags::SUBP,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            PageKind::Leaf | PageKind::Leaf2 | PageKind::SubLeaf | PageKind::SubLeaf2
        )
    }

    pub fn is_leaf2(self) -> bool {
        matches!(self, PageKind::Leaf2 | PageKind::SubLeaf2)
    }

    /// Name used by the page walk
    pub fn name(self) -> &'static str {
        match self {
            PageKind::Branch => "branch",
            PageKind::Leaf => "leaf",
            PageKind::Leaf2 => "dupfixed-leaf",
            PageKind::Overflow => "overflow-data",
            PageKind::Meta => "meta",
            PageKind::SubLeaf => "dupsort-subleaf",
            PageKind::SubLeaf2 => "dupsort-dupfixed-subleaf",
        }
    }
}

#[inline]
fn even(n: usize) -> usize {
    (n + 1) & !1
}

/// Largest leaf node kept inline in a page of `psize` bytes
pub fn node_max(psize: usize) -> usize {
    (((psize - PAGEHDRSZ) / MINKEYS) & !1) - 2
}

/// Largest key accepted for a page of `psize` bytes
pub fn max_key_size(psize: usize) -> usize {
    node_max(psize) - NODESIZE - crate::constants::DB_RECORD_SIZE
}

/// Pages needed for an overflow value of `dsize` bytes
pub fn overflow_pages(psize: usize, dsize: usize) -> u32 {
    ((PAGEHDRSZ + dsize + psize - 1) / psize) as u32
}

/// A node read out of a page
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    pub flags: NodeFlags,
    pub key: &'a [u8],
    /// Data size for leaves, child page for branches
    pub size: u32,
    /// Inline payload of a leaf node
    pub data: &'a [u8],
}

impl<'a> Node<'a> {
    pub fn child(&self) -> Pgno {
        self.size
    }

    /// First page of the overflow chain of a BIGDATA node
    pub fn overflow_pgno(&self) -> Result<Pgno> {
        if self.data.len() != 4 {
            return Err(Error::Corrupted);
        }
        Ok(NativeEndian::read_u32(self.data))
    }

    pub fn to_entry(&self) -> NodeEntry {
        NodeEntry {
            flags: self.flags,
            key: self.key.to_vec(),
            size: self.size,
            data: self.data.to_vec(),
        }
    }
}

/// Owned node, used when pages are rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub flags: NodeFlags,
    pub key: Vec<u8>,
    /// Data size for leaves, child page for branches
    pub size: u32,
    pub data: Vec<u8>,
}

impl NodeEntry {
    pub fn leaf(key: &[u8], data: &[u8], flags: NodeFlags) -> Self {
        NodeEntry {
            flags,
            key: key.to_vec(),
            size: data.len() as u32,
            data: data.to_vec(),
        }
    }

    /// Leaf whose value lives in overflow pages starting at `pgno`
    pub fn big(key: &[u8], dsize: usize, pgno: Pgno) -> Self {
        NodeEntry {
            flags: NodeFlags::BIGDATA,
            key: key.to_vec(),
            size: dsize as u32,
            data: pgno.to_ne_bytes().to_vec(),
        }
    }

    pub fn branch(key: &[u8], pgno: Pgno) -> Self {
        NodeEntry {
            flags: NodeFlags::empty(),
            key: key.to_vec(),
            size: pgno,
            data: Vec::new(),
        }
    }

    /// Bytes taken in a page of the given kind, offset slot included
    pub fn space(&self, kind: PageKind, ksize: usize) -> usize {
        if kind.is_leaf2() {
            ksize
        } else {
            even(NODESIZE + self.key.len() + self.data.len()) + 2
        }
    }
}

/// Read-only view over a page buffer
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    buf: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Page { buf }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn pgno(&self) -> Pgno {
        NativeEndian::read_u32(&self.buf[0..4])
    }

    pub fn raw_flags(&self) -> u16 {
        NativeEndian::read_u16(&self.buf[10..12])
    }

    pub fn kind(&self) -> Result<PageKind> {
        if self.buf.len() < PAGEHDRSZ {
            return Err(Error::Corrupted);
        }
        PageKind::from_flags(self.raw_flags())
    }

    pub fn leaf2_ksize(&self) -> usize {
        NativeEndian::read_u16(&self.buf[8..10]) as usize
    }

    pub fn lower(&self) -> usize {
        NativeEndian::read_u16(&self.buf[12..14]) as usize
    }

    pub fn upper(&self) -> usize {
        NativeEndian::read_u16(&self.buf[14..16]) as usize
    }

    /// Page count of an overflow chain
    pub fn overflow_count(&self) -> u32 {
        NativeEndian::read_u32(&self.buf[12..16])
    }

    pub fn numkeys(&self) -> usize {
        let used = self.lower().saturating_sub(PAGEHDRSZ);
        if self.raw_flags() & PageFlags::LEAF2.bits() != 0 {
            used.checked_div(self.leaf2_ksize()).unwrap_or(0)
        } else {
            used >> 1
        }
    }

    pub fn free_space(&self) -> usize {
        self.upper().saturating_sub(self.lower())
    }

    pub fn used_space(&self) -> usize {
        self.buf.len() - PAGEHDRSZ - self.free_space()
    }

    /// Fill ratio in per mille
    pub fn fill(&self) -> usize {
        1000 * self.used_space() / (self.buf.len() - PAGEHDRSZ)
    }

    /// Check the header is self-consistent
    pub fn validate(&self, expect: Option<Pgno>) -> Result<PageKind> {
        let kind = self.kind()?;
        if let Some(pgno) = expect {
            if kind != PageKind::SubLeaf && kind != PageKind::SubLeaf2 && self.pgno() != pgno {
                return Err(Error::Corrupted);
            }
        }
        if kind != PageKind::Overflow && kind != PageKind::Meta {
            let (lower, upper) = (self.lower(), self.upper());
            if lower < PAGEHDRSZ || lower > upper || upper > self.buf.len() {
                return Err(Error::Corrupted);
            }
        }
        Ok(kind)
    }

    pub fn node(&self, idx: usize) -> Result<Node<'a>> {
        let slot = PAGEHDRSZ + 2 * idx;
        let off = self
            .buf
            .get(slot..slot + 2)
            .map(NativeEndian::read_u16)
            .ok_or(Error::Corrupted)? as usize;
        let hdr = self.buf.get(off..off + NODESIZE).ok_or(Error::Corrupted)?;
        let size = NativeEndian::read_u32(&hdr[0..4]);
        let flags = NodeFlags::from_bits(NativeEndian::read_u16(&hdr[4..6])).ok_or(Error::Corrupted)?;
        let ksize = NativeEndian::read_u16(&hdr[6..8]) as usize;
        let kstart = off + NODESIZE;
        let key = self.buf.get(kstart..kstart + ksize).ok_or(Error::Corrupted)?;
        let data = if self.raw_flags() & PageFlags::BRANCH.bits() != 0 {
            &self.buf[0..0]
        } else {
            let dlen = if flags.contains(NodeFlags::BIGDATA) { 4 } else { size as usize };
            let dstart = kstart + ksize;
            self.buf.get(dstart..dstart + dlen).ok_or(Error::Corrupted)?
        };
        Ok(Node { flags, key, size, data })
    }

    pub fn leaf2_key(&self, idx: usize) -> Result<&'a [u8]> {
        let ksize = self.leaf2_ksize();
        let start = PAGEHDRSZ + idx * ksize;
        self.buf.get(start..start + ksize).ok_or(Error::Corrupted)
    }

    /// Key at `idx` whatever the page layout
    pub fn key(&self, idx: usize) -> Result<&'a [u8]> {
        if self.kind()?.is_leaf2() {
            self.leaf2_key(idx)
        } else {
            Ok(self.node(idx)?.key)
        }
    }

    /// All nodes as owned entries
    pub fn entries(&self) -> Result<Vec<NodeEntry>> {
        let kind = self.kind()?;
        (0..self.numkeys())
            .map(|i| {
                if kind.is_leaf2() {
                    Ok(NodeEntry::leaf(self.leaf2_key(i)?, &[], NodeFlags::empty()))
                } else {
                    Ok(self.node(i)?.to_entry())
                }
            })
            .collect()
    }

    /// Packed values of a LEAF2 page
    pub fn leaf2_data(&self) -> &'a [u8] {
        let end = PAGEHDRSZ + self.numkeys() * self.leaf2_ksize();
        &self.buf[PAGEHDRSZ..end.min(self.buf.len())]
    }
}

/// Write a fresh header
pub fn init_header(buf: &mut [u8], pgno: Pgno, kind: PageKind, ksize: usize) {
    let len = buf.len();
    NativeEndian::write_u32(&mut buf[0..4], pgno);
    NativeEndian::write_u32(&mut buf[4..8], 0);
    NativeEndian::write_u16(&mut buf[8..10], ksize as u16);
    NativeEndian::write_u16(&mut buf[10..12], kind.flags().bits());
    if kind == PageKind::Overflow {
        NativeEndian::write_u32(&mut buf[12..16], 0);
    } else {
        NativeEndian::write_u16(&mut buf[12..14], PAGEHDRSZ as u16);
        NativeEndian::write_u16(&mut buf[14..16], len.min(u16::MAX as usize) as u16);
    }
}

pub fn set_pgno(buf: &mut [u8], pgno: Pgno) {
    NativeEndian::write_u32(&mut buf[0..4], pgno);
}

pub fn set_overflow_count(buf: &mut [u8], count: u32) {
    NativeEndian::write_u32(&mut buf[12..16], count);
}

/// Point the branch node at `idx` to another child
pub fn set_child(buf: &mut [u8], idx: usize, pgno: Pgno) -> Result<()> {
    let slot = PAGEHDRSZ + 2 * idx;
    let off = buf
        .get(slot..slot + 2)
        .map(NativeEndian::read_u16)
        .ok_or(Error::Corrupted)? as usize;
    let field = buf.get_mut(off..off + 4).ok_or(Error::Corrupted)?;
    NativeEndian::write_u32(field, pgno);
    Ok(())
}

/// Overwrite the payload of a leaf node with bytes of the same length
pub fn overwrite_data(buf: &mut [u8], idx: usize, data: &[u8]) -> Result<()> {
    let slot = PAGEHDRSZ + 2 * idx;
    let off = buf
        .get(slot..slot + 2)
        .map(NativeEndian::read_u16)
        .ok_or(Error::Corrupted)? as usize;
    let ksize = buf
        .get(off + 6..off + 8)
        .map(NativeEndian::read_u16)
        .ok_or(Error::Corrupted)? as usize;
    let start = off + NODESIZE + ksize;
    let field = buf.get_mut(start..start + data.len()).ok_or(Error::Corrupted)?;
    field.copy_from_slice(data);
    Ok(())
}

/// Bytes available for nodes in a page buffer of `len` bytes
pub fn capacity(len: usize) -> usize {
    len - PAGEHDRSZ
}

/// Bytes the entries take in a page of this kind
pub fn entries_space(entries: &[NodeEntry], kind: PageKind, ksize: usize) -> usize {
    entries.iter().map(|e| e.space(kind, ksize)).sum()
}

/// Lay out `entries` in `buf`, replacing its content. Fails with PageFull
/// when they do not fit.
pub fn write_entries(
    buf: &mut [u8],
    pgno: Pgno,
    kind: PageKind,
    ksize: usize,
    entries: &[NodeEntry],
) -> Result<()> {
    if entries_space(entries, kind, ksize) > capacity(buf.len()) {
        return Err(Error::PageFull);
    }
    let len = buf.len();
    init_header(buf, pgno, kind, ksize);
    if kind.is_leaf2() {
        for (i, e) in entries.iter().enumerate() {
            if e.key.len() != ksize {
                return Err(Error::BadValSize);
            }
            let start = PAGEHDRSZ + i * ksize;
            buf[start..start + ksize].copy_from_slice(&e.key);
        }
        let lower = PAGEHDRSZ + entries.len() * ksize;
        NativeEndian::write_u16(&mut buf[12..14], lower as u16);
        return Ok(());
    }
    let mut upper = len;
    for (i, e) in entries.iter().enumerate() {
        let nsize = even(NODESIZE + e.key.len() + e.data.len());
        upper -= nsize;
        let node = &mut buf[upper..upper + nsize];
        NativeEndian::write_u32(&mut node[0..4], e.size);
        NativeEndian::write_u16(&mut node[4..6], e.flags.bits());
        NativeEndian::write_u16(&mut node[6..8], e.key.len() as u16);
        node[NODESIZE..NODESIZE + e.key.len()].copy_from_slice(&e.key);
        let dstart = NODESIZE + e.key.len();
        node[dstart..dstart + e.data.len()].copy_from_slice(&e.data);
        let slot = PAGEHDRSZ + 2 * i;
        NativeEndian::write_u16(&mut buf[slot..slot + 2], upper as u16);
    }
    NativeEndian::write_u16(&mut buf[12..14], (PAGEHDRSZ + 2 * entries.len()) as u16);
    NativeEndian::write_u16(&mut buf[14..16], upper as u16);
    Ok(())
}

/// Build a sub-page holding the duplicate values of one key
pub fn build_subpage(values: &[Vec<u8>], fixed: Option<usize>) -> Result<Vec<u8>> {
    let (kind, ksize) = match fixed {
        Some(ksize) => (PageKind::SubLeaf2, ksize),
        None => (PageKind::SubLeaf, 0),
    };
    let entries: Vec<NodeEntry> = values
        .iter()
        .map(|v| NodeEntry::leaf(v, &[], NodeFlags::empty()))
        .collect();
    let len = PAGEHDRSZ + entries_space(&entries, kind, ksize);
    let mut buf = vec![0u8; len];
    write_entries(&mut buf, 0, kind, ksize, &entries)?;
    Ok(buf)
}

/// Binary search for `key` among the keys of a page. Returns the index of
/// the first key not less than `key` and whether it is an exact match.
/// Branch pages ignore the key of node 0.
pub fn search<F>(page: &Page<'_>, key: &[u8], cmp: F) -> Result<(usize, bool)>
where
    F: Fn(&[u8], &[u8]) -> std::cmp::Ordering,
{
    let kind = page.kind()?;
    let n = page.numkeys();
    let mut low = if kind == PageKind::Branch { 1 } else { 0 };
    let mut high = n;
    while low < high {
        let mid = low + (high - low) / 2;
        match cmp(key, page.key(mid)?) {
            std::cmp::Ordering::Greater => low = mid + 1,
            std::cmp::Ordering::Less => high = mid,
            std::cmp::Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((low, false))
}
