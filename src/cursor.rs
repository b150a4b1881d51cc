use std::cmp::Ordering;

use byteorder::{ByteOrder, NativeEndian};

use crate::btree::{self, Path, Tree};
use crate::cmp::dup_tree_flags;
use crate::constants::{CursorFlags, DbFlags, NodeFlags, WriteFlags, MAIN_DBI, MAXDATASIZE, NODESIZE};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{build_subpage, entries_space, max_key_size, node_max, overflow_pages, Node, NodeEntry, Page, PageKind};
use crate::transaction::{DbState, Transaction, TxnInner};
use crate::types::{CursorOp, Dbi};

/// A key and its value
pub type Item = (Vec<u8>, Vec<u8>);

/// Position among the duplicates of the current key
#[derive(Debug, Clone)]
enum Dups {
    /// The key has a single value
    Single,
    /// Values held in a sub-page inside the node
    Inline { page: Vec<u8>, idx: usize },
    /// Values held in a nested tree
    Nested { rec: DbRecord, path: Path },
}

/// Comparators and layout of a database
#[derive(Debug, Clone, Copy)]
struct Ctx {
    rec: DbRecord,
    flags: DbFlags,
    tree: Tree,
    dup: Tree,
}

impl Ctx {
    fn of(state: &DbState) -> Self {
        let flags = state.flags();
        Ctx {
            rec: state.rec,
            flags,
            tree: Tree {
                cmp: state.cmp,
                leaf2: false,
            },
            dup: Tree {
                cmp: state.dcmp,
                leaf2: flags.contains(DbFlags::DUPFIXED),
            },
        }
    }

    fn dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }
}

fn current_node<'t>(txn: &'t TxnInner, path: &Path) -> Result<Node<'t>> {
    let (page, idx) = btree::leaf(txn, path)?;
    page.node(idx)
}

fn node_value(txn: &TxnInner, node: &Node<'_>) -> Result<Vec<u8>> {
    if node.flags.contains(NodeFlags::BIGDATA) {
        Ok(btree::read_overflow(txn, node.overflow_pgno()?, node.size as usize)?.to_vec())
    } else {
        Ok(node.data.to_vec())
    }
}

fn has_dups(ctx: &Ctx, flags: NodeFlags) -> bool {
    ctx.dupsort() && flags.contains(NodeFlags::DUPDATA)
}

/// Duplicate position at the first or last value of a node
fn dups_at(txn: &TxnInner, ctx: &Ctx, node: &Node<'_>, last: bool) -> Result<Dups> {
    if !has_dups(ctx, node.flags) {
        return Ok(Dups::Single);
    }
    if node.flags.contains(NodeFlags::SUBDATA) {
        let rec = DbRecord::decode(node.data)?;
        let mut path = Vec::new();
        let found = if last {
            btree::last(txn, &rec, &mut path)?
        } else {
            btree::first(txn, &rec, &mut path)?
        };
        if !found {
            return Err(Error::Corrupted);
        }
        return Ok(Dups::Nested { rec, path });
    }
    let page = node.data.to_vec();
    let n = Page::new(&page).numkeys();
    if n == 0 {
        return Err(Error::Corrupted);
    }
    let idx = if last { n - 1 } else { 0 };
    Ok(Dups::Inline { page, idx })
}

/// Duplicate position of `value`, or of the first value not less than it
/// unless `exact`
fn dup_seek(txn: &TxnInner, ctx: &Ctx, node: &Node<'_>, value: &[u8], exact: bool) -> Result<Option<Dups>> {
    if !has_dups(ctx, node.flags) {
        let current = node_value(txn, node)?;
        return Ok(match (ctx.dup.cmp)(&current, value) {
            Ordering::Equal => Some(Dups::Single),
            Ordering::Greater if !exact => Some(Dups::Single),
            _ => None,
        });
    }
    if node.flags.contains(NodeFlags::SUBDATA) {
        let rec = DbRecord::decode(node.data)?;
        let mut path = Vec::new();
        let found = match btree::seek(txn, &rec, &ctx.dup, value, &mut path)? {
            None => false,
            Some(true) => true,
            Some(false) => !exact && btree::settle(txn, &mut path)?,
        };
        return Ok(found.then_some(Dups::Nested { rec, path }));
    }
    let page = node.data.to_vec();
    let (idx, found, n) = {
        let sub = Page::new(&page);
        let (idx, found) = crate::page::search(&sub, value, ctx.dup.cmp)?;
        (idx, found, sub.numkeys())
    };
    if found || (!exact && idx < n) {
        Ok(Some(Dups::Inline { page, idx }))
    } else {
        Ok(None)
    }
}

/// Every duplicate value held by a leaf node that is not a nested tree
fn inline_values(entry: &NodeEntry) -> Result<Vec<Vec<u8>>> {
    if !entry.flags.contains(NodeFlags::DUPDATA) {
        return Ok(vec![entry.data.clone()]);
    }
    let page = Page::new(&entry.data);
    (0..page.numkeys()).map(|i| Ok(page.key(i)?.to_vec())).collect()
}

/// Node holding `values` inside the leaf, as a plain value or a sub-page,
/// or `None` when they need a nested tree
fn inline_entry(psize: usize, ctx: &Ctx, key: &[u8], values: &[Vec<u8>]) -> Result<Option<NodeEntry>> {
    let limit = node_max(psize);
    match values {
        [] => Err(Error::Problem),
        [single] => {
            if NODESIZE + key.len() + single.len() <= limit {
                Ok(Some(NodeEntry::leaf(key, single, NodeFlags::empty())))
            } else {
                Ok(None)
            }
        }
        _ => {
            let (kind, ksize) = if ctx.dup.leaf2 {
                (PageKind::SubLeaf2, values[0].len())
            } else {
                (PageKind::SubLeaf, 0)
            };
            let probe: Vec<NodeEntry> = values
                .iter()
                .map(|v| NodeEntry::leaf(v, &[], NodeFlags::empty()))
                .collect();
            let len = crate::constants::PAGEHDRSZ + entries_space(&probe, kind, ksize);
            if NODESIZE + key.len() + len > limit {
                return Ok(None);
            }
            let fixed = ctx.dup.leaf2.then_some(ksize);
            let sub = build_subpage(values, fixed)?;
            Ok(Some(NodeEntry::leaf(key, &sub, NodeFlags::DUPDATA)))
        }
    }
}

/// Build a nested duplicate tree from sorted values
fn build_tree(txn: &mut Transaction, ctx: &Ctx, values: &[Vec<u8>]) -> Result<DbRecord> {
    let mut sub = DbRecord::with_flags(dup_tree_flags(ctx.flags));
    let kind = if ctx.dup.leaf2 {
        sub.xsize = values.first().map_or(0, |v| v.len() as u32);
        PageKind::Leaf2
    } else {
        PageKind::Leaf
    };
    let root = txn.new_page(kind, sub.xsize as usize)?;
    sub.root = root;
    sub.depth = 1;
    sub.leaf_pages = 1;
    for value in values {
        let mut path = Vec::new();
        btree::seek(&txn.inner, &sub, &ctx.dup, value, &mut path)?;
        btree::insert(txn, &mut sub, &mut path, NodeEntry::leaf(value, &[], NodeFlags::empty()), true)?;
        sub.entries += 1;
    }
    Ok(sub)
}

/// Node for `values` of `key`, promoting them to a nested tree when they
/// do not fit inside the leaf
fn dup_entry(txn: &mut Transaction, ctx: &Ctx, key: &[u8], values: &[Vec<u8>]) -> Result<NodeEntry> {
    if let Some(entry) = inline_entry(txn.psize(), ctx, key, values)? {
        return Ok(entry);
    }
    let sub = build_tree(txn, ctx, values)?;
    Ok(NodeEntry::leaf(key, &sub.encode(), NodeFlags::DUPDATA | NodeFlags::SUBDATA))
}

fn check_sizes(psize: usize, ctx: &Ctx, key: &[u8], data: &[u8]) -> Result<()> {
    let max_key = max_key_size(psize);
    if key.is_empty() || key.len() > max_key {
        return Err(Error::BadValSize);
    }
    if ctx.flags.contains(DbFlags::INTEGERKEY) && key.len() != 4 && key.len() != 8 {
        return Err(Error::BadValSize);
    }
    if data.len() > MAXDATASIZE {
        return Err(Error::BadValSize);
    }
    if ctx.dupsort() {
        if data.len() > max_key {
            return Err(Error::BadValSize);
        }
        if ctx.flags.contains(DbFlags::INTEGERDUP) && data.len() != 4 && data.len() != 8 {
            return Err(Error::BadValSize);
        }
    }
    Ok(())
}

/// Dirty pages a put or delete may need at most
pub(crate) fn write_budget(txn: &TxnInner, dbi: Dbi, dsize: usize) -> usize {
    let depth = |dbi: Dbi| txn.dbs.get(dbi as usize).map_or(0, |s| s.rec.depth as usize);
    2 * (depth(dbi) + depth(MAIN_DBI) + 4) + overflow_pages(txn.psize, dsize) as usize
}

/// Extra dirty pages for the duplicates of `key`: the path and splits of
/// its nested tree, or the tree a full sub-page gets promoted to
pub(crate) fn dup_budget(txn: &TxnInner, dbi: Dbi, key: &[u8]) -> Result<usize> {
    let dupsort = txn.dbs.get(dbi as usize).is_some_and(|s| s.flags().contains(DbFlags::DUPSORT));
    if !dupsort || key.is_empty() {
        return Ok(0);
    }
    Ok(match btree::find(txn, dbi, key)? {
        Some(node) if node.flags.contains(NodeFlags::SUBDATA) => {
            2 * (DbRecord::decode(&node.data)?.depth as usize + 1)
        }
        // a sub-page holds less than a page, so its tree has two leaves and a branch
        Some(node) if node.flags.contains(NodeFlags::DUPDATA) => 4,
        _ => 0,
    })
}

/// Cursor position and state, independent of the transaction borrow
#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    dbi: Dbi,
    seq: u32,
    flags: CursorFlags,
    path: Path,
    dups: Dups,
}

impl CursorState {
    pub(crate) fn new(dbi: Dbi, seq: u32) -> Self {
        CursorState {
            dbi,
            seq,
            flags: CursorFlags::empty(),
            path: Vec::new(),
            dups: Dups::Single,
        }
    }

    fn ctx(&self, txn: &TxnInner) -> Result<Ctx> {
        Ok(Ctx::of(txn.db(self.dbi, self.seq)?))
    }

    fn initialized(&self) -> bool {
        self.flags.contains(CursorFlags::INITIALIZED)
    }

    fn require(&self) -> Result<()> {
        if self.initialized() {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn reset(&mut self) {
        self.flags = CursorFlags::empty();
        self.path.clear();
        self.dups = Dups::Single;
    }

    fn current(&self, txn: &TxnInner) -> Result<Item> {
        let node = current_node(txn, &self.path)?;
        let value = match &self.dups {
            Dups::Single => node_value(txn, &node)?,
            Dups::Inline { page, idx } => Page::new(page).key(*idx)?.to_vec(),
            Dups::Nested { path, .. } => {
                let (page, idx) = btree::leaf(txn, path)?;
                page.key(idx)?.to_vec()
            }
        };
        Ok((node.key.to_vec(), value))
    }

    /// Land on the leaf item of `path`, at its first or last duplicate
    fn land(&mut self, txn: &TxnInner, ctx: &Ctx, path: Path, last: bool) -> Result<()> {
        let node = current_node(txn, &path)?;
        self.dups = dups_at(txn, ctx, &node, last)?;
        self.path = path;
        self.flags = CursorFlags::INITIALIZED;
        Ok(())
    }

    fn dup_step(&mut self, txn: &TxnInner, forward: bool) -> Result<bool> {
        match &mut self.dups {
            Dups::Single => Ok(false),
            Dups::Inline { page, idx } => {
                let n = Page::new(page).numkeys();
                if forward && *idx + 1 < n {
                    *idx += 1;
                    Ok(true)
                } else if !forward && *idx > 0 {
                    *idx -= 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Dups::Nested { path, .. } => {
                if forward {
                    btree::next(txn, path)
                } else {
                    btree::prev(txn, path)
                }
            }
        }
    }

    pub(crate) fn get(&mut self, txn: &TxnInner, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<Option<Item>> {
        let ctx = self.ctx(txn)?;
        match op {
            CursorOp::First => self.first(txn, &ctx),
            CursorOp::Last => self.last(txn, &ctx),
            CursorOp::Next => self.next(txn, &ctx, Step::Any),
            CursorOp::NextDup => self.next(txn, &ctx, Step::Dup),
            CursorOp::NextNoDup => self.next(txn, &ctx, Step::NoDup),
            CursorOp::Prev => self.prev(txn, &ctx, Step::Any),
            CursorOp::PrevDup => self.prev(txn, &ctx, Step::Dup),
            CursorOp::PrevNoDup => self.prev(txn, &ctx, Step::NoDup),
            CursorOp::Set | CursorOp::SetKey => self.set(txn, &ctx, required(key)?, false),
            CursorOp::SetRange => self.set(txn, &ctx, required(key)?, true),
            CursorOp::GetBoth => self.get_both(txn, &ctx, required(key)?, required(data)?, false),
            CursorOp::GetBothRange => self.get_both(txn, &ctx, required(key)?, required(data)?, true),
            CursorOp::GetCurrent => {
                self.require()?;
                self.current(txn).map(Some)
            }
            CursorOp::FirstDup | CursorOp::LastDup => {
                if !ctx.dupsort() {
                    return Err(Error::Incompatible);
                }
                self.require()?;
                let node = current_node(txn, &self.path)?;
                self.dups = dups_at(txn, &ctx, &node, op == CursorOp::LastDup)?;
                self.flags = CursorFlags::INITIALIZED;
                self.current(txn).map(Some)
            }
            CursorOp::GetMultiple => {
                fixed(&ctx)?;
                self.require()?;
                self.multiple(txn)
            }
            CursorOp::NextMultiple => {
                fixed(&ctx)?;
                if !self.initialized() {
                    if self.first(txn, &ctx)?.is_none() {
                        return Ok(None);
                    }
                    return self.multiple(txn);
                }
                if self.flags.contains(CursorFlags::EOF) || !self.dup_step(txn, true)? {
                    return Ok(None);
                }
                self.multiple(txn)
            }
            CursorOp::PrevMultiple => {
                fixed(&ctx)?;
                if !self.initialized() {
                    if self.last(txn, &ctx)?.is_none() {
                        return Ok(None);
                    }
                } else {
                    self.to_page_start();
                    if !self.dup_step(txn, false)? {
                        return Ok(None);
                    }
                }
                self.to_page_start();
                self.multiple(txn)
            }
        }
    }

    fn first(&mut self, txn: &TxnInner, ctx: &Ctx) -> Result<Option<Item>> {
        let mut path = Vec::new();
        if !btree::first(txn, &ctx.rec, &mut path)? {
            self.reset();
            return Ok(None);
        }
        self.land(txn, ctx, path, false)?;
        self.current(txn).map(Some)
    }

    fn last(&mut self, txn: &TxnInner, ctx: &Ctx) -> Result<Option<Item>> {
        let mut path = Vec::new();
        if !btree::last(txn, &ctx.rec, &mut path)? {
            self.reset();
            return Ok(None);
        }
        self.land(txn, ctx, path, true)?;
        self.current(txn).map(Some)
    }

    fn next(&mut self, txn: &TxnInner, ctx: &Ctx, step: Step) -> Result<Option<Item>> {
        if !self.initialized() {
            if step == Step::Dup {
                return Err(Error::InvalidArgument);
            }
            return self.first(txn, ctx);
        }
        if self.flags.contains(CursorFlags::EOF) {
            return Ok(None);
        }
        if self.flags.contains(CursorFlags::DEL) {
            let same_key = self.flags.contains(CursorFlags::DEL_DUP);
            self.flags.remove(CursorFlags::DEL | CursorFlags::DEL_DUP);
            if step != Step::NoDup || !same_key {
                return self.current(txn).map(Some);
            }
        }
        if step != Step::NoDup && self.dup_step(txn, true)? {
            return self.current(txn).map(Some);
        }
        if step == Step::Dup {
            return Ok(None);
        }
        let mut path = self.path.clone();
        if !btree::next(txn, &mut path)? {
            self.flags |= CursorFlags::EOF;
            return Ok(None);
        }
        self.land(txn, ctx, path, false)?;
        self.current(txn).map(Some)
    }

    fn prev(&mut self, txn: &TxnInner, ctx: &Ctx, step: Step) -> Result<Option<Item>> {
        if !self.initialized() {
            if step == Step::Dup {
                return Err(Error::InvalidArgument);
            }
            return self.last(txn, ctx);
        }
        if self.flags.contains(CursorFlags::EOF) {
            self.flags.remove(CursorFlags::EOF);
            return self.current(txn).map(Some);
        }
        self.flags.remove(CursorFlags::DEL | CursorFlags::DEL_DUP);
        if step != Step::NoDup && self.dup_step(txn, false)? {
            return self.current(txn).map(Some);
        }
        if step == Step::Dup {
            return Ok(None);
        }
        let mut path = self.path.clone();
        if !btree::prev(txn, &mut path)? {
            return Ok(None);
        }
        self.land(txn, ctx, path, true)?;
        self.current(txn).map(Some)
    }

    fn set(&mut self, txn: &TxnInner, ctx: &Ctx, key: &[u8], range: bool) -> Result<Option<Item>> {
        let mut path = Vec::new();
        let found = match btree::seek(txn, &ctx.rec, &ctx.tree, key, &mut path)? {
            None => false,
            Some(true) => true,
            Some(false) => range && btree::settle(txn, &mut path)?,
        };
        if !found {
            return Ok(None);
        }
        self.land(txn, ctx, path, false)?;
        self.current(txn).map(Some)
    }

    fn get_both(&mut self, txn: &TxnInner, ctx: &Ctx, key: &[u8], value: &[u8], range: bool) -> Result<Option<Item>> {
        let mut path = Vec::new();
        if btree::seek(txn, &ctx.rec, &ctx.tree, key, &mut path)? != Some(true) {
            return Ok(None);
        }
        let node = current_node(txn, &path)?;
        let dups = match dup_seek(txn, ctx, &node, value, !range)? {
            Some(dups) => dups,
            None => return Ok(None),
        };
        self.path = path;
        self.dups = dups;
        self.flags = CursorFlags::INITIALIZED;
        self.current(txn).map(Some)
    }

    fn to_page_start(&mut self) {
        match &mut self.dups {
            Dups::Single => {}
            Dups::Inline { idx, .. } => *idx = 0,
            Dups::Nested { path, .. } => {
                if let Some(last) = path.last_mut() {
                    last.1 = 0;
                }
            }
        }
    }

    /// Values from the current duplicate to the end of its page, packed.
    /// The cursor moves to the last of them.
    fn multiple(&mut self, txn: &TxnInner) -> Result<Option<Item>> {
        let node = current_node(txn, &self.path)?;
        let key = node.key.to_vec();
        let data = match &mut self.dups {
            Dups::Single => node_value(txn, &node)?,
            Dups::Inline { page, idx } => {
                let (bytes, n) = {
                    let sub = Page::new(page);
                    let ksize = sub.leaf2_ksize();
                    (sub.leaf2_data()[*idx * ksize..].to_vec(), sub.numkeys())
                };
                *idx = n - 1;
                bytes
            }
            Dups::Nested { path, .. } => {
                let last = path.last_mut().ok_or(Error::Problem)?;
                let page = btree::load(txn, last.0)?;
                let ksize = page.leaf2_ksize();
                let bytes = page.leaf2_data()[last.1 * ksize..].to_vec();
                last.1 = page.numkeys() - 1;
                bytes
            }
        };
        Ok(Some((key, data)))
    }

    pub(crate) fn count(&self, txn: &TxnInner) -> Result<usize> {
        let ctx = self.ctx(txn)?;
        self.require()?;
        if !ctx.dupsort() {
            return Ok(1);
        }
        Ok(match &self.dups {
            Dups::Single => 1,
            Dups::Inline { page, .. } => Page::new(page).numkeys(),
            Dups::Nested { rec, .. } => rec.entries as usize,
        })
    }

    fn eof(&self) -> bool {
        !self.initialized() || self.flags.contains(CursorFlags::EOF)
    }

    /// Every level of the position, duplicates included, is at its first
    /// or last slot
    fn at_edge(&self, txn: &TxnInner, last: bool) -> Result<bool> {
        if !self.initialized() {
            return Ok(false);
        }
        let edge = |path: &Path| -> Result<bool> {
            for &(pgno, idx) in path {
                let n = btree::load(txn, pgno)?.numkeys();
                let want = if last { n.saturating_sub(1) } else { 0 };
                if idx != want {
                    return Ok(false);
                }
            }
            Ok(true)
        };
        if !edge(&self.path)? {
            return Ok(false);
        }
        match &self.dups {
            Dups::Single => Ok(true),
            Dups::Inline { page, idx } => {
                let n = Page::new(page).numkeys();
                Ok(*idx == if last { n - 1 } else { 0 })
            }
            Dups::Nested { path, .. } => edge(path),
        }
    }

    /// Store a key/value pair and leave the cursor on it
    pub(crate) fn put(&mut self, txn: &mut Transaction, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let ctx = self.ctx(&txn.inner)?;
        check_sizes(txn.psize(), &ctx, key, data)?;
        let mut rec = ctx.rec;
        let result = self.put_inner(txn, &ctx, &mut rec, key, data, flags);
        txn.inner.set_record(self.dbi, rec);
        result?;
        let ctx = self.ctx(&txn.inner)?;
        let found = if ctx.dupsort() {
            self.get_both(&txn.inner, &ctx, key, data, false)?
        } else {
            self.set(&txn.inner, &ctx, key, false)?
        };
        found.map(|_| ()).ok_or(Error::Problem)
    }

    fn put_inner(&mut self, txn: &mut Transaction, ctx: &Ctx, rec: &mut DbRecord, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::CURRENT) {
            self.require()?;
            let (cur_key, cur_value) = self.current(&txn.inner)?;
            if (ctx.tree.cmp)(&cur_key, key) != Ordering::Equal {
                return Err(Error::InvalidArgument);
            }
            if ctx.dupsort() {
                if (ctx.dup.cmp)(&cur_value, data) == Ordering::Equal {
                    return Ok(());
                }
                self.del_inner(txn, ctx, rec, false, false)?;
            }
        }
        if rec.is_empty_tree() {
            rec.root = txn.new_page(PageKind::Leaf, 0)?;
            rec.depth = 1;
            rec.leaf_pages = 1;
        }
        let mut path = Vec::new();
        let exact = btree::seek(&txn.inner, rec, &ctx.tree, key, &mut path)?.ok_or(Error::Problem)?;
        if flags.contains(WriteFlags::APPEND) {
            if exact && !ctx.dupsort() {
                return Err(Error::KeyExist);
            }
            let mut tail = Vec::new();
            if btree::last(&txn.inner, rec, &mut tail)? {
                let (page, idx) = btree::leaf(&txn.inner, &tail)?;
                let ord = (ctx.tree.cmp)(key, page.key(idx)?);
                if ord == Ordering::Less || (ord == Ordering::Equal && !exact) {
                    return Err(Error::KeyExist);
                }
            }
        }
        if !exact {
            let entry = self.new_entry(txn, ctx, rec, key, data)?;
            btree::insert(txn, rec, &mut path, entry, flags.contains(WriteFlags::APPEND))?;
            rec.entries += 1;
            return Ok(());
        }
        if flags.contains(WriteFlags::NOOVERWRITE) {
            return Err(Error::KeyExist);
        }
        let old = current_node(&txn.inner, &path)?.to_entry();
        if old.flags.contains(NodeFlags::SUBDATA) && !ctx.dupsort() {
            return Err(Error::Incompatible);
        }
        if ctx.dupsort() {
            add_dup(txn, ctx, rec, &mut path, &old, data, flags)
        } else {
            overwrite_value(txn, rec, &mut path, &old, data)
        }
    }

    /// Leaf node for a key not yet in the tree
    fn new_entry(&self, txn: &mut Transaction, ctx: &Ctx, rec: &mut DbRecord, key: &[u8], data: &[u8]) -> Result<NodeEntry> {
        if ctx.dupsort() {
            return dup_entry(txn, ctx, key, &[data.to_vec()]);
        }
        if NODESIZE + key.len() + data.len() > node_max(txn.psize()) {
            let pgno = btree::put_overflow(txn, rec, data)?;
            return Ok(NodeEntry::big(key, data.len(), pgno));
        }
        Ok(NodeEntry::leaf(key, data, NodeFlags::empty()))
    }

    /// Delete the current item, or every value of the current key with `all`
    pub(crate) fn del(&mut self, txn: &mut Transaction, all: bool) -> Result<()> {
        self.del_with(txn, all, false)
    }

    /// Delete, allowing the record of a named database when `named`
    fn del_with(&mut self, txn: &mut Transaction, all: bool, named: bool) -> Result<()> {
        let ctx = self.ctx(&txn.inner)?;
        if !self.initialized() || self.flags.contains(CursorFlags::EOF) {
            return Err(Error::NotFound);
        }
        let (key, value) = self.current(&txn.inner)?;
        let mut rec = ctx.rec;
        let result = self.del_inner(txn, &ctx, &mut rec, all, named);
        txn.inner.set_record(self.dbi, rec);
        result?;
        self.after_delete(&txn.inner, &key, &value)
    }

    fn del_inner(&mut self, txn: &mut Transaction, ctx: &Ctx, rec: &mut DbRecord, all: bool, named: bool) -> Result<()> {
        let subdb = current_node(&txn.inner, &self.path)?.flags.contains(NodeFlags::SUBDATA) && !ctx.dupsort();
        if subdb && !named {
            return Err(Error::Incompatible);
        }
        let mut path = self.path.clone();
        btree::touch_path(txn, rec, &mut path)?;
        let old = current_node(&txn.inner, &path)?.to_entry();
        if !all && has_dups(ctx, old.flags) {
            return match &self.dups {
                Dups::Nested { path: spath, .. } => {
                    let spath = spath.clone();
                    del_nested(txn, ctx, rec, &mut path, &old, spath)
                }
                Dups::Inline { idx, .. } => {
                    let mut values = inline_values(&old)?;
                    if *idx >= values.len() {
                        return Err(Error::Corrupted);
                    }
                    values.remove(*idx);
                    let entry = dup_entry(txn, ctx, &old.key, &values)?;
                    rec.entries = rec.entries.saturating_sub(1);
                    btree::replace(txn, rec, &mut path, entry)
                }
                Dups::Single => Err(Error::Corrupted),
            };
        }
        let count = if subdb {
            1
        } else if old.flags.contains(NodeFlags::SUBDATA) {
            let sub = DbRecord::decode(&old.data)?;
            btree::drop_tree(txn, &sub, false)?;
            sub.entries
        } else if has_dups(ctx, old.flags) {
            Page::new(&old.data).numkeys() as u64
        } else {
            1
        };
        if old.flags.contains(NodeFlags::BIGDATA) {
            if old.data.len() != 4 {
                return Err(Error::Corrupted);
            }
            btree::free_overflow(txn, rec, NativeEndian::read_u32(&old.data))?;
        }
        rec.entries = rec.entries.saturating_sub(count);
        btree::remove(txn, rec, &mut path)
    }

    /// Reposition after a delete on the item that followed the deleted one
    fn after_delete(&mut self, txn: &TxnInner, key: &[u8], value: &[u8]) -> Result<()> {
        let ctx = self.ctx(txn)?;
        self.reset();
        let mut path = Vec::new();
        match btree::seek(txn, &ctx.rec, &ctx.tree, key, &mut path)? {
            None => return Ok(()),
            Some(true) if ctx.dupsort() => {
                let node = current_node(txn, &path)?;
                if let Some(dups) = dup_seek(txn, &ctx, &node, value, false)? {
                    self.path = path;
                    self.dups = dups;
                    self.flags = CursorFlags::INITIALIZED | CursorFlags::DEL | CursorFlags::DEL_DUP;
                    return Ok(());
                }
                let mut following = path.clone();
                if btree::next(txn, &mut following)? {
                    self.land(txn, &ctx, following, false)?;
                    self.flags |= CursorFlags::DEL;
                } else {
                    self.land(txn, &ctx, path, true)?;
                    self.flags |= CursorFlags::EOF;
                }
                return Ok(());
            }
            Some(_) => {}
        }
        if btree::settle(txn, &mut path)? {
            self.land(txn, &ctx, path, false)?;
            self.flags |= CursorFlags::DEL;
        } else if btree::last(txn, &ctx.rec, &mut path)? {
            self.land(txn, &ctx, path, true)?;
            self.flags |= CursorFlags::EOF;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Any,
    Dup,
    NoDup,
}

fn required(value: Option<&[u8]>) -> Result<&[u8]> {
    value.ok_or(Error::InvalidArgument)
}

fn fixed(ctx: &Ctx) -> Result<()> {
    if ctx.dupsort() && ctx.dup.leaf2 {
        Ok(())
    } else {
        Err(Error::Incompatible)
    }
}

/// Replace the value of an existing key in a database without duplicates
fn overwrite_value(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path, old: &NodeEntry, data: &[u8]) -> Result<()> {
    let big = NODESIZE + old.key.len() + data.len() > node_max(txn.psize());
    if old.flags.contains(NodeFlags::BIGDATA) {
        if old.data.len() != 4 {
            return Err(Error::Corrupted);
        }
        let pgno = NativeEndian::read_u32(&old.data);
        if big && btree::rewrite_overflow(txn, pgno, data)? {
            if old.size as usize != data.len() {
                btree::replace(txn, rec, path, NodeEntry::big(&old.key, data.len(), pgno))?;
            }
            return Ok(());
        }
        btree::free_overflow(txn, rec, pgno)?;
    } else if !big && old.data.len() == data.len() {
        return btree::overwrite(txn, rec, path, data);
    }
    let entry = if big {
        let pgno = btree::put_overflow(txn, rec, data)?;
        NodeEntry::big(&old.key, data.len(), pgno)
    } else {
        NodeEntry::leaf(&old.key, data, NodeFlags::empty())
    };
    btree::replace(txn, rec, path, entry)
}

/// Add a value to the duplicates of an existing key
fn add_dup(
    txn: &mut Transaction,
    ctx: &Ctx,
    rec: &mut DbRecord,
    path: &mut Path,
    old: &NodeEntry,
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    let nodup = flags.contains(WriteFlags::NODUPDATA);
    let appenddup = flags.intersects(WriteFlags::APPENDDUP | WriteFlags::APPEND);
    if old.flags.contains(NodeFlags::SUBDATA) {
        let mut sub = DbRecord::decode(&old.data)?;
        if ctx.dup.leaf2 && data.len() != sub.xsize as usize {
            return Err(Error::BadValSize);
        }
        let mut spath = Vec::new();
        let exact = btree::seek(&txn.inner, &sub, &ctx.dup, data, &mut spath)?.ok_or(Error::Corrupted)?;
        if exact {
            return if nodup { Err(Error::KeyExist) } else { Ok(()) };
        }
        if appenddup {
            let mut probe = spath.clone();
            if btree::settle(&txn.inner, &mut probe)? {
                return Err(Error::KeyExist);
            }
        }
        btree::insert(txn, &mut sub, &mut spath, NodeEntry::leaf(data, &[], NodeFlags::empty()), appenddup)?;
        sub.entries += 1;
        rec.entries += 1;
        return btree::overwrite(txn, rec, path, &sub.encode());
    }
    let mut values = inline_values(old)?;
    if ctx.dup.leaf2 && values.first().map_or(false, |v| v.len() != data.len()) {
        return Err(Error::BadValSize);
    }
    let pos = match values.binary_search_by(|probe| (ctx.dup.cmp)(probe, data)) {
        Ok(_) => return if nodup { Err(Error::KeyExist) } else { Ok(()) },
        Err(pos) => pos,
    };
    if appenddup && pos != values.len() {
        return Err(Error::KeyExist);
    }
    values.insert(pos, data.to_vec());
    let entry = dup_entry(txn, ctx, &old.key, &values)?;
    btree::replace(txn, rec, path, entry)?;
    rec.entries += 1;
    Ok(())
}

/// Remove the current value of a nested duplicate tree, folding the tree
/// back into the leaf once it is small enough
fn del_nested(txn: &mut Transaction, ctx: &Ctx, rec: &mut DbRecord, path: &mut Path, old: &NodeEntry, mut spath: Path) -> Result<()> {
    let mut sub = DbRecord::decode(&old.data)?;
    btree::remove(txn, &mut sub, &mut spath)?;
    sub.entries = sub.entries.saturating_sub(1);
    rec.entries = rec.entries.saturating_sub(1);
    if sub.is_empty_tree() {
        return btree::remove(txn, rec, path);
    }
    if sub.depth == 1 {
        let values: Vec<Vec<u8>> = {
            let page = btree::load(&txn.inner, sub.root)?;
            (0..page.numkeys())
                .map(|i| Ok(page.key(i)?.to_vec()))
                .collect::<Result<_>>()?
        };
        if let Some(entry) = inline_entry(txn.psize(), ctx, &old.key, &values)? {
            txn.page_free(sub.root, 1)?;
            return btree::replace(txn, rec, path, entry);
        }
    }
    btree::overwrite(txn, rec, path, &sub.encode())
}

/// Write the record of a named database into the main database
pub(crate) fn store_subdb(txn: &mut Transaction, name: &[u8], sub: &DbRecord) -> Result<()> {
    let ctx = Ctx::of(&txn.inner.dbs[MAIN_DBI as usize]);
    let mut rec = ctx.rec;
    let result = store_subdb_inner(txn, &ctx, &mut rec, name, sub);
    txn.inner.set_record(MAIN_DBI, rec);
    result
}

fn store_subdb_inner(txn: &mut Transaction, ctx: &Ctx, rec: &mut DbRecord, name: &[u8], sub: &DbRecord) -> Result<()> {
    if rec.is_empty_tree() {
        rec.root = txn.new_page(PageKind::Leaf, 0)?;
        rec.depth = 1;
        rec.leaf_pages = 1;
    }
    let mut path = Vec::new();
    let exact = btree::seek(&txn.inner, rec, &ctx.tree, name, &mut path)?.ok_or(Error::Problem)?;
    if exact {
        if !current_node(&txn.inner, &path)?.flags.contains(NodeFlags::SUBDATA) {
            return Err(Error::Incompatible);
        }
        return btree::overwrite(txn, rec, &mut path, &sub.encode());
    }
    btree::insert(txn, rec, &mut path, NodeEntry::leaf(name, &sub.encode(), NodeFlags::SUBDATA), false)?;
    rec.entries += 1;
    Ok(())
}

/// Put without the transaction checks of the public API
pub(crate) fn put_raw(txn: &mut Transaction, dbi: Dbi, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
    let seq = txn.inner.dbs.get(dbi as usize).ok_or(Error::BadDbi)?.seq;
    CursorState::new(dbi, seq).put(txn, key, data, flags)
}

/// Delete a key with all its values
pub(crate) fn delete_key(txn: &mut Transaction, dbi: Dbi, key: &[u8]) -> Result<()> {
    let seq = txn.inner.dbs.get(dbi as usize).ok_or(Error::BadDbi)?.seq;
    let mut cursor = CursorState::new(dbi, seq);
    if cursor.get(&txn.inner, Some(key), None, CursorOp::Set)?.is_none() {
        return Err(Error::NotFound);
    }
    cursor.del_with(txn, true, dbi == MAIN_DBI)
}

/// Visit every key/value pair of a tree in order, duplicates included. The
/// node flags of the key are passed along.
pub(crate) fn scan<F>(txn: &TxnInner, state: &DbState, mut visit: F) -> Result<()>
where
    F: FnMut(&[u8], &[u8], NodeFlags) -> Result<()>,
{
    let ctx = Ctx::of(state);
    let mut cursor = CursorState::new(0, 0);
    let mut item = cursor.first(txn, &ctx)?;
    while let Some((key, value)) = item {
        let flags = current_node(txn, &cursor.path)?.flags;
        visit(&key, &value, flags)?;
        item = cursor.next(txn, &ctx, Step::Any)?;
    }
    Ok(())
}

/// Named databases recorded in the main database
pub(crate) fn named_databases(txn: &TxnInner) -> Result<Vec<(Vec<u8>, DbRecord)>> {
    let main = &txn.dbs[MAIN_DBI as usize];
    let mut named = Vec::new();
    if main.flags().contains(DbFlags::DUPSORT) {
        return Ok(named);
    }
    scan(txn, main, |key, value, flags| {
        if flags.contains(NodeFlags::SUBDATA) {
            named.push((key.to_vec(), DbRecord::decode(value)?));
        }
        Ok(())
    })?;
    Ok(named)
}

/// Read-only cursor over one database
#[derive(Debug)]
pub struct Cursor<'txn, 'env> {
    txn: &'txn Transaction<'env>,
    state: CursorState,
}

impl<'txn, 'env> Cursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn Transaction<'env>, dbi: Dbi, seq: u32) -> Result<Self> {
        txn.check(false)?;
        txn.inner.db(dbi, seq)?;
        Ok(Cursor {
            txn,
            state: CursorState::new(dbi, seq),
        })
    }

    /// Position the cursor with `op` and return the item it lands on
    pub fn get(&mut self, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<Option<Item>> {
        self.txn.check(false)?;
        self.state.get(&self.txn.inner, key, data, op)
    }

    pub fn first(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::First)
    }

    pub fn last(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Last)
    }

    pub fn next(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Next)
    }

    pub fn prev(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Prev)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), None, CursorOp::Set)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), None, CursorOp::SetRange)
    }

    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), Some(data), CursorOp::GetBoth)
    }

    pub fn get_current(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::GetCurrent)
    }

    /// Number of values of the current key
    pub fn count(&self) -> Result<usize> {
        self.txn.check(false)?;
        self.state.count(&self.txn.inner)
    }

    /// Unpositioned, or moved past the last item
    pub fn eof(&self) -> bool {
        self.state.eof()
    }

    pub fn on_first(&self) -> Result<bool> {
        self.state.at_edge(&self.txn.inner, false)
    }

    pub fn on_last(&self) -> Result<bool> {
        self.state.at_edge(&self.txn.inner, true)
    }

    /// Bind the cursor to another read-only transaction
    pub fn renew(&mut self, txn: &'txn Transaction<'env>) -> Result<()> {
        if !txn.is_readonly() {
            return Err(Error::InvalidArgument);
        }
        txn.check(false)?;
        txn.inner.db(self.state.dbi, self.state.seq)?;
        self.txn = txn;
        self.state.reset();
        Ok(())
    }

    pub fn dbi(&self) -> Dbi {
        self.state.dbi
    }
}

/// Cursor of a write transaction
#[derive(Debug)]
pub struct RwCursor<'txn, 'env> {
    txn: &'txn mut Transaction<'env>,
    state: CursorState,
}

impl<'txn, 'env> RwCursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn mut Transaction<'env>, dbi: Dbi, seq: u32) -> Result<Self> {
        txn.check(true)?;
        txn.inner.db(dbi, seq)?;
        Ok(RwCursor {
            txn,
            state: CursorState::new(dbi, seq),
        })
    }

    pub fn get(&mut self, key: Option<&[u8]>, data: Option<&[u8]>, op: CursorOp) -> Result<Option<Item>> {
        self.txn.check(false)?;
        self.state.get(&self.txn.inner, key, data, op)
    }

    pub fn first(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::First)
    }

    pub fn last(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Last)
    }

    pub fn next(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Next)
    }

    pub fn prev(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::Prev)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), None, CursorOp::Set)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), None, CursorOp::SetRange)
    }

    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Item>> {
        self.get(Some(key), Some(data), CursorOp::GetBoth)
    }

    pub fn get_current(&mut self) -> Result<Option<Item>> {
        self.get(None, None, CursorOp::GetCurrent)
    }

    pub fn count(&self) -> Result<usize> {
        self.txn.check(false)?;
        self.state.count(&self.txn.inner)
    }

    pub fn eof(&self) -> bool {
        self.state.eof()
    }

    pub fn on_first(&self) -> Result<bool> {
        self.state.at_edge(&self.txn.inner, false)
    }

    pub fn on_last(&self) -> Result<bool> {
        self.state.at_edge(&self.txn.inner, true)
    }

    pub fn dbi(&self) -> Dbi {
        self.state.dbi
    }

    /// Store a key/value pair; the cursor ends up on it
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.txn.check(true)?;
        let inner = &self.txn.inner;
        let need = dup_budget(inner, self.state.dbi, key)
            .map(|extra| write_budget(inner, self.state.dbi, data.len()) + extra);
        if let Err(err) = need.and_then(|need| self.txn.ensure_room(need)) {
            return Err(self.txn.poison(err));
        }
        self.state
            .put(self.txn, key, data, flags)
            .map_err(|err| self.txn.poison(err))
    }

    /// Delete the current item. `NODUPDATA` deletes every value of the key.
    pub fn del(&mut self, flags: WriteFlags) -> Result<()> {
        self.txn.check(true)?;
        let inner = &self.txn.inner;
        let key = self.state.current(inner).map(|(key, _)| key).unwrap_or_default();
        let need = dup_budget(inner, self.state.dbi, &key)
            .map(|extra| write_budget(inner, self.state.dbi, 0) + extra);
        if let Err(err) = need.and_then(|need| self.txn.ensure_room(need)) {
            return Err(self.txn.poison(err));
        }
        self.state
            .del(self.txn, flags.contains(WriteFlags::NODUPDATA))
            .map_err(|err| self.txn.poison(err))
    }
}
