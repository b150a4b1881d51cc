use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::types::Pgno;

// Size bounds of a list, as in the C engine
const IDL_LOGN: usize = 16;
pub const IDL_DB_SIZE: usize = 1 << IDL_LOGN;
pub const IDL_UM_SIZE: usize = 1 << (IDL_LOGN + 1);
pub const IDL_DB_MAX: usize = IDL_DB_SIZE - 1;
pub const IDL_UM_MAX: usize = IDL_UM_SIZE - 1;

/// ID List - page numbers kept in descending order.
///
/// Appends may leave the list unsorted; `sort` restores the order before
/// any search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Idl {
    ids: Vec<Pgno>,
    sorted: bool,
}

impl Idl {
    pub fn new() -> Self {
        Idl {
            ids: Vec::new(),
            sorted: true,
        }
    }

    /// Build from any order of ids
    pub fn from_unsorted(ids: Vec<Pgno>) -> Self {
        let mut idl = Idl { ids, sorted: false };
        idl.sort();
        idl
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Pgno] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = Pgno> + '_ {
        self.ids.iter().copied()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.sorted = true;
    }

    /// Binary search for an id.
    /// Returns the index where the id is or should be inserted
    pub fn search(&self, id: Pgno) -> usize {
        match self.ids.binary_search_by(|probe| id.cmp(probe)) {
            Ok(pos) | Err(pos) => pos,
        }
    }

    pub fn contains(&self, id: Pgno) -> bool {
        if self.sorted {
            let pos = self.search(id);
            pos < self.ids.len() && self.ids[pos] == id
        } else {
            self.ids.contains(&id)
        }
    }

    /// Append an id, the list becomes unsorted
    pub fn append(&mut self, id: Pgno) {
        if let Some(&last) = self.ids.last() {
            if last <= id {
                self.sorted = false;
            }
        }
        self.ids.push(id);
    }

    /// Append `n` consecutive ids starting at `id`
    pub fn append_range(&mut self, id: Pgno, n: u32) {
        for i in (0..n).rev() {
            self.append(id + i);
        }
    }

    /// Sort the ID list in descending order
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        self.ids.sort_unstable_by(|a, b| b.cmp(a));
        self.sorted = true;
    }

    /// Insert keeping the order, duplicates are refused
    pub fn insert(&mut self, id: Pgno) -> Result<()> {
        self.sort();
        let pos = self.search(id);
        if pos < self.ids.len() && self.ids[pos] == id {
            return Err(Error::Problem);
        }
        self.ids.insert(pos, id);
        Ok(())
    }

    /// Remove an id if present
    pub fn remove(&mut self, id: Pgno) -> bool {
        self.sort();
        let pos = self.search(id);
        if pos < self.ids.len() && self.ids[pos] == id {
            self.ids.remove(pos);
            true
        } else {
            false
        }
    }

    /// Merge another sorted list into this one
    pub fn merge(&mut self, other: &Idl) -> Result<()> {
        self.sort();
        let mut merged = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        loop {
            match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) => {
                    if x == y {
                        return Err(Error::Problem);
                    }
                    if x > y {
                        merged.push(x);
                        a.next();
                    } else {
                        merged.push(y);
                        b.next();
                    }
                }
                (Some(&&x), None) => {
                    merged.push(x);
                    a.next();
                }
                (None, Some(&&y)) => {
                    merged.push(y);
                    b.next();
                }
                (None, None) => break,
            }
        }
        self.ids = merged;
        Ok(())
    }

    /// Take a run of `n` consecutive ids, returning its lowest id.
    /// The lowest run in the list is preferred to keep the file compact.
    pub fn take_run(&mut self, n: usize) -> Option<Pgno> {
        self.sort();
        if n == 0 || self.ids.len() < n {
            return None;
        }
        let mut i = self.ids.len();
        while i >= n {
            // ids[i-n..i] descends; a run has ids[i-n] == ids[i-1] + n - 1
            let low = self.ids[i - 1];
            if self.ids[i - n] as usize == low as usize + n - 1 {
                self.ids.drain(i - n..i);
                return Some(low);
            }
            i -= 1;
        }
        None
    }

    /// Persistent form: count followed by the ids
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 * (self.ids.len() + 1)];
        NativeEndian::write_u32(&mut buf[..4], self.ids.len() as u32);
        for (i, &id) in self.ids.iter().enumerate() {
            NativeEndian::write_u32(&mut buf[4 * (i + 1)..4 * (i + 2)], id);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Idl> {
        if buf.len() < 4 || buf.len() % 4 != 0 {
            return Err(Error::Corrupted);
        }
        let count = NativeEndian::read_u32(&buf[..4]) as usize;
        if (count + 1) * 4 != buf.len() {
            return Err(Error::Corrupted);
        }
        let ids: Vec<Pgno> = buf[4..]
            .chunks_exact(4)
            .map(NativeEndian::read_u32)
            .collect();
        if ids.windows(2).any(|w| w[0] <= w[1]) {
            return Err(Error::Corrupted);
        }
        Ok(Idl { ids, sorted: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_sort_descends() {
        let mut idl = Idl::new();
        for id in [5, 9, 2, 7] {
            idl.append(id);
        }
        idl.sort();
        assert_eq!(idl.as_slice(), &[9, 7, 5, 2]);
        assert!(idl.contains(7));
        assert!(!idl.contains(6));
    }

    #[test]
    fn take_run_prefers_low_pages() {
        let mut idl = Idl::from_unsorted(vec![20, 21, 22, 3, 4, 5, 9]);
        assert_eq!(idl.take_run(3), Some(3));
        assert_eq!(idl.as_slice(), &[22, 21, 20, 9]);
        assert_eq!(idl.take_run(2), Some(20));
        assert_eq!(idl.take_run(2), None);
        assert_eq!(idl.take_run(1), Some(9));
    }

    #[test]
    fn merge_rejects_overlap() {
        let mut a = Idl::from_unsorted(vec![1, 4, 8]);
        let b = Idl::from_unsorted(vec![2, 3]);
        a.merge(&b).unwrap();
        assert_eq!(a.as_slice(), &[8, 4, 3, 2, 1]);
        assert_eq!(a.merge(&Idl::from_unsorted(vec![4])), Err(Error::Problem));
    }

    #[test]
    fn decode_checks_size_and_order() {
        let idl = Idl::from_unsorted(vec![3, 10, 7]);
        let buf = idl.encode();
        assert_eq!(Idl::decode(&buf).unwrap(), idl);
        assert_eq!(Idl::decode(&buf[..8]), Err(Error::Corrupted));
        let mut bad = buf.clone();
        bad[4..8].copy_from_slice(&1u32.to_ne_bytes());
        assert_eq!(Idl::decode(&bad), Err(Error::Corrupted));
    }
}
