//! B+tree search and structural changes.
//!
//! Positions are paths of `(page, index)` pairs from the root down to a
//! leaf. Write operations copy every page of the path into the dirty list
//! first, rebuild the node array of the page they change and split or merge
//! pages as needed.

use byteorder::{ByteOrder, NativeEndian};
use log::trace;

use crate::cmp::CmpFn;
use crate::constants::{DebugFlags, NodeFlags, CURSOR_STACK, FILL_THRESHOLD, PAGEHDRSZ, P_INVALID};
use crate::error::{Error, Result};
use crate::meta::DbRecord;
use crate::page::{
    self, capacity, entries_space, init_header, overflow_pages, set_overflow_count, write_entries,
    NodeEntry, Page, PageKind,
};
use crate::transaction::{Transaction, TxnInner};
use crate::types::{Dbi, Pgno};

/// Root to leaf positions, one `(page, index)` pair per level
pub(crate) type Path = Vec<(Pgno, usize)>;

/// How a tree orders and lays out its keys
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tree {
    pub(crate) cmp: CmpFn,
    /// Leaves pack fixed size keys
    pub(crate) leaf2: bool,
}

/// Fetch a page, checking its header when ASSERT is on
pub(crate) fn load(txn: &TxnInner, pgno: Pgno) -> Result<Page<'_>> {
    let page = Page::new(txn.page(pgno)?);
    if txn.debug.contains(DebugFlags::ASSERT) {
        page.validate(Some(pgno))?;
    }
    Ok(page)
}

/// Descend towards `key`. Returns `None` for an empty tree, otherwise
/// whether the key was found; the leaf index is that of the first key not
/// less than `key`, possibly one past the last node of the leaf.
pub(crate) fn seek(txn: &TxnInner, rec: &DbRecord, tree: &Tree, key: &[u8], path: &mut Path) -> Result<Option<bool>> {
    path.clear();
    if rec.is_empty_tree() {
        return Ok(None);
    }
    let mut pgno = rec.root;
    loop {
        if path.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = load(txn, pgno)?;
        let kind = page.kind()?;
        let (idx, exact) = page::search(&page, key, tree.cmp)?;
        match kind {
            PageKind::Branch => {
                let idx = if exact { idx } else { idx - 1 };
                path.push((pgno, idx));
                pgno = page.node(idx)?.child();
            }
            PageKind::Leaf | PageKind::Leaf2 => {
                path.push((pgno, idx));
                return Ok(Some(exact));
            }
            _ => return Err(Error::Corrupted),
        }
    }
}

/// Descend from `pgno` along the first or last child of every page
fn descend(txn: &TxnInner, mut pgno: Pgno, path: &mut Path, last: bool) -> Result<bool> {
    loop {
        if path.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = load(txn, pgno)?;
        let n = page.numkeys();
        match page.kind()? {
            PageKind::Branch => {
                if n == 0 {
                    return Err(Error::Corrupted);
                }
                let idx = if last { n - 1 } else { 0 };
                path.push((pgno, idx));
                pgno = page.node(idx)?.child();
            }
            PageKind::Leaf | PageKind::Leaf2 => {
                let idx = if last { n.saturating_sub(1) } else { 0 };
                path.push((pgno, idx));
                return Ok(n > 0);
            }
            _ => return Err(Error::Corrupted),
        }
    }
}

pub(crate) fn first(txn: &TxnInner, rec: &DbRecord, path: &mut Path) -> Result<bool> {
    path.clear();
    if rec.is_empty_tree() {
        return Ok(false);
    }
    descend(txn, rec.root, path, false)
}

pub(crate) fn last(txn: &TxnInner, rec: &DbRecord, path: &mut Path) -> Result<bool> {
    path.clear();
    if rec.is_empty_tree() {
        return Ok(false);
    }
    descend(txn, rec.root, path, true)
}

/// Step to the following leaf item. The path is left alone when there is none.
pub(crate) fn next(txn: &TxnInner, path: &mut Path) -> Result<bool> {
    let depth = path.len();
    for level in (0..depth).rev() {
        let (pgno, idx) = path[level];
        let page = load(txn, pgno)?;
        if idx + 1 < page.numkeys() {
            path[level].1 = idx + 1;
            path.truncate(level + 1);
            if level + 1 < depth {
                descend(txn, page.node(idx + 1)?.child(), path, false)?;
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Step to the preceding leaf item. The path is left alone when there is none.
pub(crate) fn prev(txn: &TxnInner, path: &mut Path) -> Result<bool> {
    let depth = path.len();
    for level in (0..depth).rev() {
        let (pgno, idx) = path[level];
        if idx > 0 {
            path[level].1 = idx - 1;
            path.truncate(level + 1);
            if level + 1 < depth {
                let page = load(txn, pgno)?;
                descend(txn, page.node(idx - 1)?.child(), path, true)?;
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Move a position that may sit past the end of its leaf onto a real item
pub(crate) fn settle(txn: &TxnInner, path: &mut Path) -> Result<bool> {
    let &(pgno, idx) = path.last().ok_or(Error::NotFound)?;
    if idx < load(txn, pgno)?.numkeys() {
        return Ok(true);
    }
    next(txn, path)
}

/// Leaf page and index of a position
pub(crate) fn leaf<'t>(txn: &'t TxnInner, path: &Path) -> Result<(Page<'t>, usize)> {
    let &(pgno, idx) = path.last().ok_or(Error::NotFound)?;
    let page = load(txn, pgno)?;
    if idx >= page.numkeys() {
        return Err(Error::NotFound);
    }
    Ok((page, idx))
}

/// Exact lookup of `key` in database `dbi`
pub(crate) fn find(txn: &TxnInner, dbi: Dbi, key: &[u8]) -> Result<Option<NodeEntry>> {
    let state = txn.dbs.get(dbi as usize).ok_or(Error::BadDbi)?;
    let tree = Tree {
        cmp: state.cmp,
        leaf2: false,
    };
    let mut path = Vec::new();
    match seek(txn, &state.rec, &tree, key, &mut path)? {
        Some(true) => {
            let (page, idx) = leaf(txn, &path)?;
            Ok(Some(page.node(idx)?.to_entry()))
        }
        _ => Ok(None),
    }
}

/// Number of pages starting at `pgno`: the chain length for an overflow
/// page, one for anything else
pub(crate) fn run_length(txn: &TxnInner, pgno: Pgno) -> Result<u32> {
    let page = Page::new(txn.page(pgno)?);
    if page.kind()? == PageKind::Overflow {
        Ok(page.overflow_count().max(1))
    } else {
        Ok(1)
    }
}

/// Value stored in an overflow chain
pub(crate) fn read_overflow(txn: &TxnInner, pgno: Pgno, dsize: usize) -> Result<&[u8]> {
    let n = run_length(txn, pgno)?;
    let span = txn.span(pgno, n as usize)?;
    if Page::new(span).kind()? != PageKind::Overflow {
        return Err(Error::Corrupted);
    }
    span.get(PAGEHDRSZ..PAGEHDRSZ + dsize).ok_or(Error::Corrupted)
}

/// Store a value in a fresh overflow chain
pub(crate) fn put_overflow(txn: &mut Transaction, rec: &mut DbRecord, data: &[u8]) -> Result<Pgno> {
    let psize = txn.psize();
    let n = overflow_pages(psize, data.len());
    let pgno = txn.page_alloc(n as usize)?;
    let mut buf = vec![0u8; n as usize * psize];
    init_header(&mut buf, pgno, PageKind::Overflow, 0);
    set_overflow_count(&mut buf, n);
    buf[PAGEHDRSZ..PAGEHDRSZ + data.len()].copy_from_slice(data);
    txn.inner.dirty.insert(pgno, buf);
    rec.overflow_pages += n;
    Ok(pgno)
}

/// Overwrite an overflow value in place. Only possible when this
/// transaction wrote the chain and the page count stays the same.
pub(crate) fn rewrite_overflow(txn: &mut Transaction, pgno: Pgno, data: &[u8]) -> Result<bool> {
    let psize = txn.psize();
    if run_length(&txn.inner, pgno)? != overflow_pages(psize, data.len()) {
        return Ok(false);
    }
    if txn.inner.dirty_in_ancestor(pgno) {
        return Ok(false);
    }
    match txn.inner.dirty.get_mut(&pgno) {
        Some(buf) => {
            buf[PAGEHDRSZ..PAGEHDRSZ + data.len()].copy_from_slice(data);
            Ok(true)
        }
        None => Ok(false),
    }
}

pub(crate) fn free_overflow(txn: &mut Transaction, rec: &mut DbRecord, pgno: Pgno) -> Result<()> {
    let n = run_length(&txn.inner, pgno)?;
    txn.page_free(pgno, n as usize)?;
    rec.overflow_pages = rec.overflow_pages.saturating_sub(n);
    Ok(())
}

/// Make every page of `path` writable, updating the parents and the root
pub(crate) fn touch_path(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path) -> Result<()> {
    for level in 0..path.len() {
        let old = path[level].0;
        let new = txn.touch(old)?;
        if new == old {
            continue;
        }
        path[level].0 = new;
        if level == 0 {
            rec.root = new;
        } else {
            let (parent, idx) = path[level - 1];
            page::set_child(txn.dirty_mut(parent)?, idx, new)?;
        }
    }
    Ok(())
}

/// Kind, LEAF2 key size and nodes of a page
fn entries_of(txn: &Transaction, pgno: Pgno) -> Result<(PageKind, usize, Vec<NodeEntry>)> {
    let page = Page::new(txn.inner.page(pgno)?);
    Ok((page.kind()?, page.leaf2_ksize(), page.entries()?))
}

/// Rewrite the page at `depth` of the path with `entries`, splitting it
/// when they do not fit
fn store(
    txn: &mut Transaction,
    rec: &mut DbRecord,
    path: &mut Path,
    depth: usize,
    entries: Vec<NodeEntry>,
    append: bool,
) -> Result<()> {
    let pgno = path[depth].0;
    let (kind, ksize) = {
        let page = Page::new(txn.inner.page(pgno)?);
        (page.kind()?, page.leaf2_ksize())
    };
    match write_entries(txn.dirty_mut(pgno)?, pgno, kind, ksize, &entries) {
        Err(Error::PageFull) => split(txn, rec, path, depth, kind, ksize, entries, append),
        other => other,
    }
}

/// Index of the first entry moved to the right page. The larger side is
/// kept as small as possible; appends leave the left page full.
fn split_point(entries: &[NodeEntry], kind: PageKind, ksize: usize, cap: usize, append: bool) -> Result<usize> {
    let n = entries.len();
    if n < 2 {
        return Err(Error::PageFull);
    }
    let sizes: Vec<usize> = entries.iter().map(|e| e.space(kind, ksize)).collect();
    let total: usize = sizes.iter().sum();
    // the first node of a right branch page loses its key
    let head = |at: usize| -> usize {
        if kind == PageKind::Branch {
            NodeEntry::branch(&[], 0).space(kind, ksize)
        } else {
            sizes[at]
        }
    };
    let sides = |at: usize| -> (usize, usize) {
        let left: usize = sizes[..at].iter().sum();
        (left, total - left - sizes[at] + head(at))
    };
    if append {
        let (left, right) = sides(n - 1);
        if left <= cap && right <= cap {
            return Ok(n - 1);
        }
    }
    let mut best: Option<(usize, usize)> = None;
    for at in 1..n {
        let (left, right) = sides(at);
        if left > cap || right > cap {
            continue;
        }
        let worst = left.max(right);
        if best.map_or(true, |(_, w)| worst < w) {
            best = Some((at, worst));
        }
    }
    best.map(|(at, _)| at).ok_or(Error::PageFull)
}

#[allow(clippy::too_many_arguments)]
fn split(
    txn: &mut Transaction,
    rec: &mut DbRecord,
    path: &mut Path,
    mut depth: usize,
    kind: PageKind,
    ksize: usize,
    mut right: Vec<NodeEntry>,
    append: bool,
) -> Result<()> {
    let psize = txn.psize();
    let at = split_point(&right, kind, ksize, capacity(psize), append)?;
    let pgno = path[depth].0;
    if depth == 0 {
        let root = txn.new_page(PageKind::Branch, 0)?;
        write_entries(txn.dirty_mut(root)?, root, PageKind::Branch, 0, &[NodeEntry::branch(&[], pgno)])?;
        path.insert(0, (root, 0));
        rec.root = root;
        rec.depth += 1;
        rec.branch_pages += 1;
        depth = 1;
        trace!("new root {} above {}", root, pgno);
    }
    let left: Vec<NodeEntry> = right.drain(..at).collect();
    let sep = right[0].key.clone();
    if kind == PageKind::Branch {
        right[0].key.clear();
        rec.branch_pages += 1;
    } else {
        rec.leaf_pages += 1;
    }
    let sibling = txn.new_page(kind, ksize)?;
    write_entries(txn.dirty_mut(pgno)?, pgno, kind, ksize, &left)?;
    write_entries(txn.dirty_mut(sibling)?, sibling, kind, ksize, &right)?;
    trace!("split page {} at {} into {}", pgno, at, sibling);

    let (parent, pidx) = path[depth - 1];
    let (_, _, mut nodes) = entries_of(txn, parent)?;
    nodes.insert(pidx + 1, NodeEntry::branch(&sep, sibling));
    store(txn, rec, path, depth - 1, nodes, append)
}

/// Insert `entry` at the position of `path`
pub(crate) fn insert(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path, entry: NodeEntry, append: bool) -> Result<()> {
    touch_path(txn, rec, path)?;
    let depth = path.len() - 1;
    let (pgno, idx) = path[depth];
    let (_, _, mut entries) = entries_of(txn, pgno)?;
    if idx > entries.len() {
        return Err(Error::Corrupted);
    }
    entries.insert(idx, entry);
    store(txn, rec, path, depth, entries, append)
}

/// Replace the node at the position of `path`
pub(crate) fn replace(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path, entry: NodeEntry) -> Result<()> {
    touch_path(txn, rec, path)?;
    let depth = path.len() - 1;
    let (pgno, idx) = path[depth];
    let (_, _, mut entries) = entries_of(txn, pgno)?;
    let slot = entries.get_mut(idx).ok_or(Error::Corrupted)?;
    *slot = entry;
    store(txn, rec, path, depth, entries, false)
}

/// Overwrite the payload of the node at the position of `path` in place
pub(crate) fn overwrite(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path, data: &[u8]) -> Result<()> {
    touch_path(txn, rec, path)?;
    let &(pgno, idx) = path.last().ok_or(Error::Problem)?;
    page::overwrite_data(txn.dirty_mut(pgno)?, idx, data)
}

/// Remove the node at the position of `path` and rebalance. The path no
/// longer points anywhere useful afterwards.
pub(crate) fn remove(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path) -> Result<()> {
    touch_path(txn, rec, path)?;
    let depth = path.len() - 1;
    let (pgno, idx) = path[depth];
    let (_, _, mut entries) = entries_of(txn, pgno)?;
    if idx >= entries.len() {
        return Err(Error::Corrupted);
    }
    entries.remove(idx);
    store(txn, rec, path, depth, entries, false)?;
    rebalance(txn, rec, path, depth)
}

fn rebalance(txn: &mut Transaction, rec: &mut DbRecord, path: &mut Path, depth: usize) -> Result<()> {
    let pgno = path[depth].0;
    let (kind, n, fill) = {
        let page = Page::new(txn.inner.page(pgno)?);
        (page.kind()?, page.numkeys(), page.fill())
    };
    if depth == 0 {
        if kind != PageKind::Branch && n == 0 {
            txn.page_free(pgno, 1)?;
            rec.root = P_INVALID;
            rec.depth = 0;
            rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
            path.clear();
            trace!("tree emptied, root {} freed", pgno);
        } else if kind == PageKind::Branch && n == 1 {
            let child = Page::new(txn.inner.page(pgno)?).node(0)?.child();
            txn.page_free(pgno, 1)?;
            rec.root = child;
            rec.depth -= 1;
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
            path.remove(0);
            trace!("root {} collapsed into {}", pgno, child);
        }
        return Ok(());
    }
    let minkeys = if kind == PageKind::Branch { 2 } else { 1 };
    if fill >= FILL_THRESHOLD && n >= minkeys {
        return Ok(());
    }
    let (parent, pidx) = path[depth - 1];
    let (_, _, mut nodes) = entries_of(txn, parent)?;
    if nodes.len() < 2 {
        return Ok(());
    }
    // merge with the left neighbour, or the right one for a first child
    let (li, ri) = if pidx > 0 { (pidx - 1, pidx) } else { (0, 1) };
    let si = if pidx > 0 { li } else { ri };
    let sibling = txn.touch(nodes[si].size)?;
    if sibling != nodes[si].size {
        nodes[si].size = sibling;
        page::set_child(txn.dirty_mut(parent)?, si, sibling)?;
    }
    let (lpg, rpg) = (nodes[li].size, nodes[ri].size);
    let (_, ksize, mut left) = entries_of(txn, lpg)?;
    let (_, _, mut right) = entries_of(txn, rpg)?;
    if kind == PageKind::Branch {
        let first = right.first_mut().ok_or(Error::Corrupted)?;
        first.key = nodes[ri].key.clone();
    }
    let cap = capacity(txn.psize());
    if entries_space(&left, kind, ksize) + entries_space(&right, kind, ksize) <= cap {
        left.append(&mut right);
        write_entries(txn.dirty_mut(lpg)?, lpg, kind, ksize, &left)?;
        txn.page_free(rpg, 1)?;
        if kind == PageKind::Branch {
            rec.branch_pages = rec.branch_pages.saturating_sub(1);
        } else {
            rec.leaf_pages = rec.leaf_pages.saturating_sub(1);
        }
        nodes.remove(ri);
        write_entries(txn.dirty_mut(parent)?, parent, PageKind::Branch, 0, &nodes)?;
        path.truncate(depth);
        path[depth - 1].1 = li;
        trace!("merged page {} into {}", rpg, lpg);
        return rebalance(txn, rec, path, depth - 1);
    }
    if n >= minkeys {
        return Ok(());
    }
    // too full to merge: borrow one node from the neighbour
    if pidx > 0 {
        let mut moved = left.pop().ok_or(Error::Corrupted)?;
        let sep = moved.key.clone();
        if kind == PageKind::Branch {
            moved.key.clear();
        }
        right.insert(0, moved);
        nodes[ri].key = sep;
    } else {
        let moved = right.remove(0);
        left.push(moved);
        let first = right.first_mut().ok_or(Error::Corrupted)?;
        nodes[ri].key = first.key.clone();
        if kind == PageKind::Branch {
            first.key.clear();
        }
    }
    write_entries(txn.dirty_mut(lpg)?, lpg, kind, ksize, &left)?;
    write_entries(txn.dirty_mut(rpg)?, rpg, kind, ksize, &right)?;
    trace!("moved one node between pages {} and {}", lpg, rpg);
    path.truncate(depth);
    store(txn, rec, path, depth - 1, nodes, false)
}

/// Release every page of a tree and the overflow chains it refers to.
/// With `dups`, nested duplicate trees are released too.
pub(crate) fn drop_tree(txn: &mut Transaction, rec: &DbRecord, dups: bool) -> Result<()> {
    if rec.is_empty_tree() {
        return Ok(());
    }
    let mut stack = vec![rec.root];
    while let Some(pgno) = stack.pop() {
        let (kind, entries) = {
            let page = load(&txn.inner, pgno)?;
            (page.kind()?, page.entries()?)
        };
        match kind {
            PageKind::Branch => stack.extend(entries.iter().map(|e| e.size)),
            PageKind::Leaf => {
                for e in &entries {
                    if e.flags.contains(NodeFlags::BIGDATA) {
                        if e.data.len() != 4 {
                            return Err(Error::Corrupted);
                        }
                        let ov = NativeEndian::read_u32(&e.data);
                        let n = run_length(&txn.inner, ov)?;
                        txn.page_free(ov, n as usize)?;
                    } else if dups && e.flags.contains(NodeFlags::SUBDATA) {
                        let sub = DbRecord::decode(&e.data)?;
                        if !sub.is_empty_tree() {
                            stack.push(sub.root);
                        }
                    }
                }
            }
            PageKind::Leaf2 => {}
            _ => return Err(Error::Corrupted),
        }
        txn.page_free(pgno, 1)?;
    }
    Ok(())
}
