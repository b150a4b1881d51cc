//! Key and duplicate-value comparators.

use std::cmp::Ordering;

use byteorder::{ByteOrder, NativeEndian};

use crate::constants::DbFlags;

/// Key comparison function
pub type CmpFn = fn(&[u8], &[u8]) -> Ordering;

/// Byte-lexicographic, a shorter key sorts first
pub fn cmp_lexical(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Compare bytes from the end of the keys towards the start
pub fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Native-endian unsigned integers of 4 or 8 bytes
pub fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    match (a.len(), b.len()) {
        (4, 4) => NativeEndian::read_u32(a).cmp(&NativeEndian::read_u32(b)),
        (8, 8) => NativeEndian::read_u64(a).cmp(&NativeEndian::read_u64(b)),
        _ => a.len().cmp(&b.len()).then_with(|| cmp_lexical(a, b)),
    }
}

/// Default key comparator for a database
pub fn key_cmp_for(flags: DbFlags) -> CmpFn {
    if flags.contains(DbFlags::INTEGERKEY) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSEKEY) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

/// Default duplicate comparator for a DUPSORT database
pub fn dup_cmp_for(flags: DbFlags) -> CmpFn {
    if flags.contains(DbFlags::INTEGERDUP) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSEDUP) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

/// Record flags of the nested tree holding the duplicates of a key
pub fn dup_tree_flags(flags: DbFlags) -> DbFlags {
    let mut sub = DbFlags::empty();
    if flags.contains(DbFlags::DUPFIXED) {
        sub |= DbFlags::DUPFIXED;
    }
    if flags.contains(DbFlags::INTEGERDUP) {
        sub |= DbFlags::INTEGERKEY;
    }
    if flags.contains(DbFlags::REVERSEDUP) {
        sub |= DbFlags::REVERSEKEY;
    }
    sub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_shorter_first() {
        assert_eq!(cmp_lexical(b"ab", b"abc"), Ordering::Less);
        assert_eq!(cmp_lexical(b"b", b"abc"), Ordering::Greater);
    }

    #[test]
    fn reverse_compares_tails() {
        assert_eq!(cmp_reverse(b"za", b"ab"), Ordering::Less);
        assert_eq!(cmp_reverse(b"b", b"ab"), Ordering::Less);
    }

    #[test]
    fn integers_are_native_endian() {
        let a = 2u32.to_ne_bytes();
        let b = 256u32.to_ne_bytes();
        assert_eq!(cmp_int(&a, &b), Ordering::Less);
        let a = 1u64.to_ne_bytes();
        let b = u64::MAX.to_ne_bytes();
        assert_eq!(cmp_int(&a, &b), Ordering::Less);
    }
}
