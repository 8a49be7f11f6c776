//! Typed log record bodies.
//!
//! Every record body begins with the same 16-byte prefix: the record type,
//! the transaction id (zero outside a transaction), and the LSN of the
//! previous record written by that transaction. The prefix is what lets
//! abort and replication replay walk a transaction's records backward
//! without knowing each record's full layout.
//!
//! Bodies are encoded big-endian; variable-length byte fields are
//! length-prefixed with a `u32`.

use byteorder::{BigEndian, ByteOrder};

use crate::log::Lsn;
use crate::{Error, Result};

/// Byte offset of the transaction id within a record body.
pub const REC_TXNID_OFF: usize = 4;
/// Byte offset of the per-transaction previous LSN within a record body.
pub const REC_PREV_LSN_OFF: usize = 8;
/// Size of the common record prefix.
pub const REC_PREFIX_SIZE: usize = 16;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Database file registration (open/close/checkpoint snapshot).
    DbregRegister,
    /// Transaction commit or abort.
    TxnRegop,
    /// Checkpoint, carrying the LSN of the earliest uncommitted txn.
    TxnCkp,
    /// Child transaction commit, chaining the child's records to the
    /// parent.
    TxnChild,
    /// Two-phase-commit prepare.
    TxnXaRegop,
    /// Add or remove one slot item on a page.
    Addrem,
    /// Add or remove a single overflow page with its payload.
    Big,
    /// Adjust the reference count on an overflow chain head.
    Ovref,
    /// Rewire the prev/next pointers of a page chain.
    Relink,
    /// Position-only marker carrying a diagnostic payload.
    Debug,
    /// Position-only marker.
    Noop,
    /// Unknown or unrecognized record type.
    Unknown(u32),
}

impl RecordType {
    /// Convert a u32 type code to a `RecordType`.
    pub fn from_u32(val: u32) -> Self {
        match val {
            2 => RecordType::DbregRegister,
            10 => RecordType::TxnRegop,
            11 => RecordType::TxnCkp,
            12 => RecordType::TxnChild,
            13 => RecordType::TxnXaRegop,
            41 => RecordType::Addrem,
            43 => RecordType::Big,
            44 => RecordType::Ovref,
            45 => RecordType::Relink,
            47 => RecordType::Debug,
            48 => RecordType::Noop,
            v => RecordType::Unknown(v),
        }
    }

    /// The on-disk type code.
    pub fn code(&self) -> u32 {
        match self {
            RecordType::DbregRegister => 2,
            RecordType::TxnRegop => 10,
            RecordType::TxnCkp => 11,
            RecordType::TxnChild => 12,
            RecordType::TxnXaRegop => 13,
            RecordType::Addrem => 41,
            RecordType::Big => 43,
            RecordType::Ovref => 44,
            RecordType::Relink => 45,
            RecordType::Debug => 47,
            RecordType::Noop => 48,
            RecordType::Unknown(v) => *v,
        }
    }

    /// A record is "simple" if the client catch-up loop can append it to
    /// the local log without dispatching it: everything except commits,
    /// checkpoints, and dbreg registrations.
    pub fn is_simple(&self) -> bool {
        !matches!(
            self,
            RecordType::TxnRegop | RecordType::TxnCkp | RecordType::DbregRegister
        )
    }

    /// Display name for this record type.
    pub fn name(&self) -> &'static str {
        match self {
            RecordType::DbregRegister => "dbreg_register",
            RecordType::TxnRegop => "txn_regop",
            RecordType::TxnCkp => "txn_ckp",
            RecordType::TxnChild => "txn_child",
            RecordType::TxnXaRegop => "txn_xa_regop",
            RecordType::Addrem => "db_addrem",
            RecordType::Big => "db_big",
            RecordType::Ovref => "db_ovref",
            RecordType::Relink => "db_relink",
            RecordType::Debug => "db_debug",
            RecordType::Noop => "db_noop",
            RecordType::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::Unknown(v) => write!(f, "unknown({})", v),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Opcodes shared by `addrem`, `big`, and `relink` records.
pub const OP_ADD: u32 = 1;
/// See [`OP_ADD`].
pub const OP_REM: u32 = 2;

/// `txn_regop` opcodes.
pub const TXN_COMMIT: u32 = 1;
/// See [`TXN_COMMIT`].
pub const TXN_ABORT: u32 = 2;
/// See [`TXN_COMMIT`].
pub const TXN_PREPARE: u32 = 3;

/// `dbreg_register` opcodes.
pub const DBREG_OPEN: u32 = 1;
/// Open logged before the database itself has been created.
pub const DBREG_PREOPEN: u32 = 2;
/// Reinstate of an in-memory database.
pub const DBREG_REOPEN: u32 = 3;
/// Normal close.
pub const DBREG_CLOSE: u32 = 4;
/// Close written during recovery.
pub const DBREG_RCLOSE: u32 = 5;
/// Checkpoint snapshot of an open file; does not itself open.
pub const DBREG_CHKPNT: u32 = 6;

/// Read the record type from an encoded body.
pub fn rectype_of(body: &[u8]) -> RecordType {
    if body.len() < 4 {
        return RecordType::Unknown(0);
    }
    RecordType::from_u32(BigEndian::read_u32(body))
}

/// Read the transaction id from an encoded body.
pub fn txnid_of(body: &[u8]) -> u32 {
    if body.len() < REC_TXNID_OFF + 4 {
        return 0;
    }
    BigEndian::read_u32(&body[REC_TXNID_OFF..])
}

/// Read the per-transaction previous LSN from an encoded body.
pub fn prev_lsn_of(body: &[u8]) -> Lsn {
    if body.len() < REC_PREFIX_SIZE {
        return Lsn::ZERO;
    }
    Lsn::read_from(&body[REC_PREV_LSN_OFF..])
}

struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    fn new(rectype: RecordType, txnid: u32, prev_lsn: Lsn) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&rectype.code().to_be_bytes());
        buf.extend_from_slice(&txnid.to_be_bytes());
        let mut lsn = [0u8; Lsn::DISK_SIZE];
        prev_lsn.write_to(&mut lsn);
        buf.extend_from_slice(&lsn);
        Enc { buf }
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn lsn(&mut self, v: Lsn) {
        let mut b = [0u8; Lsn::DISK_SIZE];
        v.write_to(&mut b);
        self.buf.extend_from_slice(&b);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn done(self) -> Vec<u8> {
        self.buf
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(body: &'a [u8]) -> Result<(RecordType, u32, Lsn, Self)> {
        if body.len() < REC_PREFIX_SIZE {
            return Err(Error::Corrupt("log record shorter than prefix".into()));
        }
        let rectype = RecordType::from_u32(BigEndian::read_u32(body));
        let txnid = BigEndian::read_u32(&body[REC_TXNID_OFF..]);
        let prev_lsn = Lsn::read_from(&body[REC_PREV_LSN_OFF..]);
        Ok((
            rectype,
            txnid,
            prev_lsn,
            Dec {
                buf: body,
                pos: REC_PREFIX_SIZE,
            },
        ))
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Corrupt(format!(
                "log record truncated at byte {}",
                self.pos
            )));
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn lsn(&mut self) -> Result<Lsn> {
        self.need(Lsn::DISK_SIZE)?;
        let v = Lsn::read_from(&self.buf[self.pos..]);
        self.pos += Lsn::DISK_SIZE;
        Ok(v)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let v = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(v)
    }

    fn raw(&mut self, n: usize) -> Result<Vec<u8>> {
        self.need(n)?;
        let v = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(v)
    }
}

/// Slot item added to or removed from a page.
#[derive(Debug, Clone)]
pub struct AddremArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// [`OP_ADD`] or [`OP_REM`].
    pub opcode: u32,
    /// dbreg id of the database file.
    pub fileid: i32,
    pub pgno: u32,
    pub indx: u32,
    /// Total bytes the item occupies on the page.
    pub nbytes: u32,
    /// Item header bytes, empty when the item is a plain key/data.
    pub hdr: Vec<u8>,
    /// Item data bytes.
    pub data: Vec<u8>,
    /// Page LSN before the edit.
    pub pagelsn: Lsn,
}

impl AddremArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::Addrem, self.txnid, self.prev_lsn);
        e.u32(self.opcode);
        e.i32(self.fileid);
        e.u32(self.pgno);
        e.u32(self.indx);
        e.u32(self.nbytes);
        e.bytes(&self.hdr);
        e.bytes(&self.data);
        e.lsn(self.pagelsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::Addrem {
            return Err(Error::Corrupt(format!("expected db_addrem, got {}", rectype)));
        }
        Ok(AddremArgs {
            txnid,
            prev_lsn,
            opcode: d.u32()?,
            fileid: d.i32()?,
            pgno: d.u32()?,
            indx: d.u32()?,
            nbytes: d.u32()?,
            hdr: d.bytes()?,
            data: d.bytes()?,
            pagelsn: d.lsn()?,
        })
    }
}

/// One overflow page's worth of a big item, added or removed.
#[derive(Debug, Clone)]
pub struct BigArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// [`OP_ADD`] or [`OP_REM`].
    pub opcode: u32,
    pub fileid: i32,
    pub pgno: u32,
    pub prev_pgno: u32,
    pub next_pgno: u32,
    /// Payload stored on this page.
    pub data: Vec<u8>,
    /// LSN of the target page before the edit.
    pub pagelsn: Lsn,
    /// LSN of the previous chain page before the edit.
    pub prevlsn: Lsn,
    /// LSN of the next chain page before the edit.
    pub nextlsn: Lsn,
}

impl BigArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::Big, self.txnid, self.prev_lsn);
        e.u32(self.opcode);
        e.i32(self.fileid);
        e.u32(self.pgno);
        e.u32(self.prev_pgno);
        e.u32(self.next_pgno);
        e.bytes(&self.data);
        e.lsn(self.pagelsn);
        e.lsn(self.prevlsn);
        e.lsn(self.nextlsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::Big {
            return Err(Error::Corrupt(format!("expected db_big, got {}", rectype)));
        }
        Ok(BigArgs {
            txnid,
            prev_lsn,
            opcode: d.u32()?,
            fileid: d.i32()?,
            pgno: d.u32()?,
            prev_pgno: d.u32()?,
            next_pgno: d.u32()?,
            data: d.bytes()?,
            pagelsn: d.lsn()?,
            prevlsn: d.lsn()?,
            nextlsn: d.lsn()?,
        })
    }
}

/// Reference-count adjustment on an overflow chain head.
#[derive(Debug, Clone)]
pub struct OvrefArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    pub fileid: i32,
    pub pgno: u32,
    /// Signed adjustment applied on redo, reversed on undo.
    pub adjust: i32,
    pub pagelsn: Lsn,
}

impl OvrefArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::Ovref, self.txnid, self.prev_lsn);
        e.i32(self.fileid);
        e.u32(self.pgno);
        e.i32(self.adjust);
        e.lsn(self.pagelsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::Ovref {
            return Err(Error::Corrupt(format!("expected db_ovref, got {}", rectype)));
        }
        Ok(OvrefArgs {
            txnid,
            prev_lsn,
            fileid: d.i32()?,
            pgno: d.u32()?,
            adjust: d.i32()?,
            pagelsn: d.lsn()?,
        })
    }
}

/// Chain pointer rewiring for a page and its former neighbors.
#[derive(Debug, Clone)]
pub struct RelinkArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// [`OP_ADD`] or [`OP_REM`].
    pub opcode: u32,
    pub fileid: i32,
    pub pgno: u32,
    pub pagelsn: Lsn,
    pub prev_pgno: u32,
    pub prevlsn: Lsn,
    pub next_pgno: u32,
    pub nextlsn: Lsn,
}

impl RelinkArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::Relink, self.txnid, self.prev_lsn);
        e.u32(self.opcode);
        e.i32(self.fileid);
        e.u32(self.pgno);
        e.lsn(self.pagelsn);
        e.u32(self.prev_pgno);
        e.lsn(self.prevlsn);
        e.u32(self.next_pgno);
        e.lsn(self.nextlsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::Relink {
            return Err(Error::Corrupt(format!("expected db_relink, got {}", rectype)));
        }
        Ok(RelinkArgs {
            txnid,
            prev_lsn,
            opcode: d.u32()?,
            fileid: d.i32()?,
            pgno: d.u32()?,
            pagelsn: d.lsn()?,
            prev_pgno: d.u32()?,
            prevlsn: d.lsn()?,
            next_pgno: d.u32()?,
            nextlsn: d.lsn()?,
        })
    }
}

/// Transaction resolution: commit, abort, or the final record of a
/// prepared transaction.
#[derive(Debug, Clone)]
pub struct TxnRegopArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// [`TXN_COMMIT`], [`TXN_ABORT`], or [`TXN_PREPARE`].
    pub opcode: u32,
    /// Wall-clock seconds at resolution, for diagnostics only.
    pub timestamp: u32,
}

impl TxnRegopArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::TxnRegop, self.txnid, self.prev_lsn);
        e.u32(self.opcode);
        e.u32(self.timestamp);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::TxnRegop {
            return Err(Error::Corrupt(format!("expected txn_regop, got {}", rectype)));
        }
        Ok(TxnRegopArgs {
            txnid,
            prev_lsn,
            opcode: d.u32()?,
            timestamp: d.u32()?,
        })
    }
}

/// Two-phase-commit prepare with the external transaction identity.
#[derive(Debug, Clone)]
pub struct TxnXaRegopArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    pub xid: Vec<u8>,
    pub formatid: i32,
    pub gtrid: u32,
    pub bqual: u32,
    /// First LSN written by the transaction.
    pub begin_lsn: Lsn,
}

impl TxnXaRegopArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::TxnXaRegop, self.txnid, self.prev_lsn);
        e.bytes(&self.xid);
        e.i32(self.formatid);
        e.u32(self.gtrid);
        e.u32(self.bqual);
        e.lsn(self.begin_lsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::TxnXaRegop {
            return Err(Error::Corrupt(format!(
                "expected txn_xa_regop, got {}",
                rectype
            )));
        }
        Ok(TxnXaRegopArgs {
            txnid,
            prev_lsn,
            xid: d.bytes()?,
            formatid: d.i32()?,
            gtrid: d.u32()?,
            bqual: d.u32()?,
            begin_lsn: d.lsn()?,
        })
    }
}

/// Checkpoint marker.
#[derive(Debug, Clone)]
pub struct TxnCkpArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// LSN of the earliest record of any transaction active at
    /// checkpoint time; recovery can start its redo scan here.
    pub ckp_lsn: Lsn,
    /// LSN of the previous checkpoint record.
    pub last_ckp: Lsn,
    pub timestamp: u32,
}

impl TxnCkpArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::TxnCkp, self.txnid, self.prev_lsn);
        e.lsn(self.ckp_lsn);
        e.lsn(self.last_ckp);
        e.u32(self.timestamp);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::TxnCkp {
            return Err(Error::Corrupt(format!("expected txn_ckp, got {}", rectype)));
        }
        Ok(TxnCkpArgs {
            txnid,
            prev_lsn,
            ckp_lsn: d.lsn()?,
            last_ckp: d.lsn()?,
            timestamp: d.u32()?,
        })
    }
}

/// Child transaction commit, chaining the child's records into the
/// parent's chain.
#[derive(Debug, Clone)]
pub struct TxnChildArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// Child transaction id.
    pub child: u32,
    /// Last LSN written by the child.
    pub c_lsn: Lsn,
}

impl TxnChildArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::TxnChild, self.txnid, self.prev_lsn);
        e.u32(self.child);
        e.lsn(self.c_lsn);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::TxnChild {
            return Err(Error::Corrupt(format!("expected txn_child, got {}", rectype)));
        }
        Ok(TxnChildArgs {
            txnid,
            prev_lsn,
            child: d.u32()?,
            c_lsn: d.lsn()?,
        })
    }
}

/// Database file registration.
#[derive(Debug, Clone)]
pub struct DbregRegisterArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    /// One of the `DBREG_*` opcodes.
    pub opcode: u32,
    /// File name; empty for in-memory databases.
    pub name: Vec<u8>,
    /// Stable 16-byte file identity.
    pub uid: [u8; 16],
    /// The numeric dbreg id being bound or released.
    pub fileid: i32,
    /// Access-method type code.
    pub ftype: u32,
    /// Metadata page number within the file.
    pub meta_pgno: u32,
}

impl DbregRegisterArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::DbregRegister, self.txnid, self.prev_lsn);
        e.u32(self.opcode);
        e.bytes(&self.name);
        e.raw(&self.uid);
        e.i32(self.fileid);
        e.u32(self.ftype);
        e.u32(self.meta_pgno);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::DbregRegister {
            return Err(Error::Corrupt(format!(
                "expected dbreg_register, got {}",
                rectype
            )));
        }
        let opcode = d.u32()?;
        let name = d.bytes()?;
        let uid_raw = d.raw(16)?;
        let mut uid = [0u8; 16];
        uid.copy_from_slice(&uid_raw);
        Ok(DbregRegisterArgs {
            txnid,
            prev_lsn,
            opcode,
            name,
            uid,
            fileid: d.i32()?,
            ftype: d.u32()?,
            meta_pgno: d.u32()?,
        })
    }
}

/// Diagnostic marker with an arbitrary payload.
#[derive(Debug, Clone)]
pub struct DebugArgs {
    pub txnid: u32,
    pub prev_lsn: Lsn,
    pub msg: Vec<u8>,
}

impl DebugArgs {
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Enc::new(RecordType::Debug, self.txnid, self.prev_lsn);
        e.bytes(&self.msg);
        e.done()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let (rectype, txnid, prev_lsn, mut d) = Dec::new(body)?;
        if rectype != RecordType::Debug {
            return Err(Error::Corrupt(format!("expected db_debug, got {}", rectype)));
        }
        Ok(DebugArgs {
            txnid,
            prev_lsn,
            msg: d.bytes()?,
        })
    }
}

/// Encode a position-only no-op record.
pub fn encode_noop(txnid: u32, prev_lsn: Lsn) -> Vec<u8> {
    Enc::new(RecordType::Noop, txnid, prev_lsn).done()
}
