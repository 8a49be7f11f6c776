//! Embedded transactional page store.
//!
//! The `burrowdb` crate (library name `burrow`) is an embedded storage
//! engine built around fixed-size slotted pages, a write-ahead log, and a
//! primary/backup replication layer driven off that log. A host opens an
//! [`Env`](env::Env), opens databases inside it, and mutates them under
//! transactions; every page edit is logged before the page can reach disk,
//! so the environment can be recovered after a crash, and the same log
//! records can be streamed to replica sites and replayed there.
//!
//! # Quick example
//!
//! ```no_run
//! use burrow::env::{Env, EnvConfig};
//! use burrow::db::DbType;
//!
//! let env = Env::open("/data/myenv", EnvConfig::default()).unwrap();
//! let db = env.db_open("inventory", DbType::Btree, None).unwrap();
//!
//! let txn = env.txn_begin(None).unwrap();
//! db.put(Some(txn), b"widget", b"12").unwrap();
//! env.txn_commit(txn).unwrap();
//!
//! let val = db.get(None, b"widget").unwrap();
//! assert_eq!(val.as_deref(), Some(&b"12"[..]));
//! ```
//!
//! # Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`env`] | Environment handle, configuration, recovery on open |
//! | [`page`] | Page layout, slotted items, overflow chains, disk codec |
//! | [`mpool`] | Buffer cache with pin/unpin and WAL-gated write-back |
//! | [`log`] | LSNs, record bodies, the append/flush writer, cursors |
//! | [`dbreg`] | Numeric file-ID registry mapping log records to databases |
//! | [`txn`] | Transactions, commit/abort/prepare, checkpoints |
//! | [`recover`] | Per-record redo/undo dispatch and the recovery driver |
//! | [`db`] | Database handles and the access-method capability trait |
//! | [`rep`] | Replication messages, elections, client catch-up |

pub mod db;
pub mod dbreg;
pub mod env;
pub mod log;
pub mod mpool;
pub mod page;
pub mod recover;
pub mod rep;
pub mod txn;

use thiserror::Error;

/// Errors returned by `burrow` operations.
///
/// Several variants are protocol signals rather than failures: `PageFull`
/// drives access-method splits, `Deadlock` tells a transaction to abort
/// and retry, and the replication variants tell the host which recovery
/// action to take next.
#[derive(Error, Debug)]
pub enum Error {
    /// Key, record, or LSN not present.
    #[error("not found")]
    NotFound,

    /// Key already present and overwrite was not requested.
    #[error("key already exists")]
    KeyExists,

    /// A page has insufficient free space; the access method must split.
    #[error("page full")]
    PageFull,

    /// A caller-owned buffer was too small; the needed size is echoed back.
    #[error("buffer too small: {0} bytes required")]
    BufferSmall(u32),

    /// Bad flag combination, bad LSN, or another programming error.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// An I/O error occurred (open, read, seek, write, or fsync failure).
    #[error("I/O error: {0}")]
    Io(String),

    /// On-disk structure failed verification (bad magic, refcount,
    /// chain cycle, or LSN regression).
    #[error("corruption detected: {0}")]
    Corrupt(String),

    /// Lock request would deadlock; the transaction must abort.
    #[error("deadlock")]
    Deadlock,

    /// Two sites believe they are master; the application must call an
    /// election.
    #[error("duplicate master detected")]
    DupMaster,

    /// A vote arrived while not in an election; start one.
    #[error("election should be held")]
    HoldElection,

    /// The client is too far behind the master and automatic
    /// initialization is disabled.
    #[error("unable to join replication group")]
    JoinFailure,

    /// The election generation changed while waiting.
    #[error("election generation changed")]
    EgenChange,

    /// Not enough sites responded to reach quorum.
    #[error("election failed: unable to reach quorum")]
    Unavail,

    /// Wait timed out.
    #[error("operation timed out")]
    Timeout,

    /// A log record would exceed the maximum log file size.
    #[error("record larger than maximum log file size")]
    RecordTooLarge,

    /// A fixed-length record operation produced the wrong length.
    #[error("length improper for fixed length record: {0}")]
    LengthMismatch(u32),

    /// The requested access method is not configured in this build.
    #[error("access method not configured")]
    NotConfigured,

    /// The environment has panicked; run recovery and reopen.
    #[error("environment panic: recovery required")]
    Panic,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
