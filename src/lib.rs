//! Embedded transactional key/value store: a copy-on-write B+tree in a
//! memory mapped file, with one writer and any number of readers working
//! on consistent snapshots.

mod btree;
mod cmp;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod freelist;
mod meta;
mod midl;
mod osal;
mod page;
mod transaction;
mod types;
mod walk;

pub use cmp::{cmp_int, cmp_lexical, cmp_reverse, CmpFn};
pub use constants::{
    CopyFlags, DbFlags, DebugFlags, EnvFlags, TxnFlags, WriteFlags, DEFAULT_MAPSIZE, MAXDATASIZE, PAGE_SIZE,
};
pub use cursor::{Cursor, Item, RwCursor};
pub use database::Database;
pub use env::Environment;
pub use error::{Error, Result};
pub use page::PageKind;
pub use transaction::Transaction;
pub use types::{
    Canary, CursorOp, DataSign, Dbi, EnvInfo, OomDecision, OomFunc, OomRequest, PageState, Pgno, ReaderInfo, Stat,
    Txnid,
};
pub use walk::{audit, PageVisit, PageWalk, SpaceReport};
