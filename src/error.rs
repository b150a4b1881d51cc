use std::io;
use std::result;

/// Custom result type for engine operations
pub type Result<T> = result::Result<T, Error>;

/// Engine error codes
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Requested page not found
    #[error("Requested page not found")]
    PageNotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted")]
    Corrupted,
    /// Update of meta page failed or environment had fatal error
    #[error("Update of meta page failed or environment had fatal error")]
    Panic,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// File is not a valid data file
    #[error("File is not a valid data file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Transaction has too many dirty pages
    #[error("Transaction has too many dirty pages")]
    TxnFull,
    /// Cursor stack too deep
    #[error("Cursor stack too deep")]
    CursorFull,
    /// Page has not enough space
    #[error("Page has not enough space")]
    PageFull,
    /// Database contents grew beyond environment mapsize
    #[error("Database contents grew beyond environment mapsize")]
    MapResized,
    /// Operation and DB incompatible, or DB flags changed
    #[error("Operation and DB incompatible, or DB flags changed")]
    Incompatible,
    /// Invalid reuse of reader locktable slot
    #[error("Invalid reuse of reader locktable slot")]
    BadRslot,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong DUPFIXED size
    #[error("Unsupported size of key/DB name/data, or wrong DUPFIXED size")]
    BadValSize,
    /// The specified DBI was changed unexpectedly
    #[error("The specified DBI was changed unexpectedly")]
    BadDbi,
    /// Unexpected internal bookkeeping problem
    #[error("Unexpected internal bookkeeping problem")]
    Problem,
    /// The key has more than one associated value
    #[error("The key has more than one associated value")]
    MultiVal,
    /// Bad signature of a runtime object
    #[error("Bad signature of a runtime object")]
    BadSign,
    /// Invalid argument (EINVAL)
    #[error("Invalid argument")]
    InvalidArgument,
    /// Permission denied (EACCES)
    #[error("Permission denied")]
    AccessDenied,
    /// Cannot allocate memory (ENOMEM)
    #[error("Cannot allocate memory")]
    OutOfMemory,
    /// Resource busy (EBUSY)
    #[error("Resource busy")]
    Busy,
    /// Other operating system error
    #[error("Operating system error {0}")]
    Os(i32),
}

impl Error {
    /// Numeric status code of this error
    pub fn code(&self) -> i32 {
        match self {
            Error::KeyExist => -30799,
            Error::NotFound => -30798,
            Error::PageNotFound => -30797,
            Error::Corrupted => -30796,
            Error::Panic => -30795,
            Error::VersionMismatch => -30794,
            Error::Invalid => -30793,
            Error::MapFull => -30792,
            Error::DbsFull => -30791,
            Error::ReadersFull => -30790,
            Error::TxnFull => -30788,
            Error::CursorFull => -30787,
            Error::PageFull => -30786,
            Error::MapResized => -30785,
            Error::Incompatible => -30784,
            Error::BadRslot => -30783,
            Error::BadTxn => -30782,
            Error::BadValSize => -30781,
            Error::BadDbi => -30780,
            Error::Problem => -30779,
            Error::MultiVal => -30421,
            Error::BadSign => -30420,
            Error::InvalidArgument => libc::EINVAL,
            Error::AccessDenied => libc::EACCES,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Busy => libc::EBUSY,
            Error::Os(code) => *code,
        }
    }

    /// Map a numeric status code back to an error, `None` for success
    pub fn from_code(code: i32) -> Option<Error> {
        let err = match code {
            0 => return None,
            -30799 => Error::KeyExist,
            -30798 => Error::NotFound,
            -30797 => Error::PageNotFound,
            -30796 => Error::Corrupted,
            -30795 => Error::Panic,
            -30794 => Error::VersionMismatch,
            -30793 => Error::Invalid,
            -30792 => Error::MapFull,
            -30791 => Error::DbsFull,
            -30790 => Error::ReadersFull,
            -30788 => Error::TxnFull,
            -30787 => Error::CursorFull,
            -30786 => Error::PageFull,
            -30785 => Error::MapResized,
            -30784 => Error::Incompatible,
            -30783 => Error::BadRslot,
            -30782 => Error::BadTxn,
            -30781 => Error::BadValSize,
            -30780 => Error::BadDbi,
            -30779 => Error::Problem,
            -30421 => Error::MultiVal,
            -30420 => Error::BadSign,
            libc::EINVAL => Error::InvalidArgument,
            libc::EACCES => Error::AccessDenied,
            libc::ENOMEM => Error::OutOfMemory,
            libc::EBUSY => Error::Busy,
            other => Error::Os(other),
        };
        Some(err)
    }

    /// Errors that leave a write transaction usable
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::KeyExist
                | Error::NotFound
                | Error::BadValSize
                | Error::Incompatible
                | Error::InvalidArgument
                | Error::BadDbi
                | Error::MultiVal
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::from_code(code).unwrap_or(Error::Problem),
            None => Error::Os(libc::EIO),
        }
    }
}
