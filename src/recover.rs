//! Recovery dispatch.
//!
//! Every logged page operation has a handler that can run in either
//! direction. A handler compares the page's current LSN against the
//! LSNs carried in the record: if the page is exactly at the state the
//! record describes as "before", a redo applies the edit and stamps the
//! record's LSN; if it is exactly at the "after" state, an undo reverses
//! the edit and stamps the record's before-LSN. Any other relation means
//! the record is not applicable in this pass and the page is left
//! untouched — which is also what makes replaying a record twice
//! harmless.
//!
//! [`run_recovery`] drives a full crash recovery: an open-files pass
//! that rebuilds the dbreg table, a backward pass undoing transactions
//! that never committed, and a forward pass redoing the ones that did.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

use crate::dbreg::FileRegistry;
use crate::log::cursor::{CursorOp, LogCursor};
use crate::log::records::{
    self, AddremArgs, BigArgs, DbregRegisterArgs, OvrefArgs, RecordType, RelinkArgs,
    TxnCkpArgs, TxnRegopArgs, DBREG_CHKPNT, DBREG_CLOSE, DBREG_OPEN, DBREG_PREOPEN,
    DBREG_RCLOSE, DBREG_REOPEN, OP_ADD, OP_REM, TXN_COMMIT,
};
use crate::log::writer::LogManager;
use crate::log::Lsn;
use crate::mpool::{GetFlag, Mpool, PagePin};
use crate::page::{self, init_page, slots, PageType, PAGE_HDR_SIZE, PGNO_INVALID};
use crate::{Error, Result};

/// Direction of a recovery dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecOp {
    /// Roll the page forward during crash recovery.
    Redo,
    /// Roll the page backward (abort, or a loser during recovery).
    Undo,
    /// Roll forward on a replication client.
    Apply,
    /// Rebuild the open-file table; page contents are untouched.
    OpenFiles,
}

impl RecOp {
    pub fn is_redo(&self) -> bool {
        matches!(self, RecOp::Redo | RecOp::Apply)
    }

    pub fn is_undo(&self) -> bool {
        matches!(self, RecOp::Undo)
    }
}

/// Open/close machinery recovery needs when it meets a `dbreg_register`
/// record; implemented by the environment.
pub trait RecoverFiles {
    /// Open the named database and bind its logged id.
    fn do_open(&self, args: &DbregRegisterArgs) -> Result<()>;
    /// Close the database bound to the logged id, if open.
    fn do_close(&self, args: &DbregRegisterArgs) -> Result<()>;
}

/// Everything a handler needs to reach a page.
pub struct RecoverCtx<'a> {
    pub mpool: &'a Mpool,
    pub registry: &'a Mutex<FileRegistry>,
    pub files: &'a dyn RecoverFiles,
}

impl<'a> RecoverCtx<'a> {
    /// Apply one record in the given direction.
    pub fn dispatch(&self, body: &[u8], lsn: Lsn, op: RecOp) -> Result<()> {
        match records::rectype_of(body) {
            RecordType::Addrem => self.addrem_recover(&AddremArgs::decode(body)?, lsn, op),
            RecordType::Big => self.big_recover(&BigArgs::decode(body)?, lsn, op),
            RecordType::Ovref => self.ovref_recover(&OvrefArgs::decode(body)?, lsn, op),
            RecordType::Relink => self.relink_recover(&RelinkArgs::decode(body)?, lsn, op),
            RecordType::DbregRegister => {
                self.dbreg_recover(&DbregRegisterArgs::decode(body)?, op)
            }
            // Position-only markers and transaction records: the drivers
            // use them, the page state does not change.
            RecordType::Noop
            | RecordType::Debug
            | RecordType::TxnRegop
            | RecordType::TxnCkp
            | RecordType::TxnChild
            | RecordType::TxnXaRegop => Ok(()),
            RecordType::Unknown(v) => Err(Error::Corrupt(format!(
                "unknown record type {} at {}",
                v, lsn
            ))),
        }
    }

    /// Pin the target page. Absent pages are tolerated under undo (an
    /// unwritten page has LSN zero, so there is nothing to reverse) and
    /// created under redo.
    fn fetch_page(&self, fileid: i32, pgno: u32, op: RecOp) -> Result<Option<PagePin>> {
        let binding = {
            let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.binding(fileid)
        };
        let binding = match binding {
            Some(b) => b,
            // The file is not open in this pass; nothing to apply.
            None => return Ok(None),
        };
        match self.mpool.fget(binding.mpf, pgno, GetFlag::None) {
            Ok(pin) => Ok(Some(pin)),
            Err(Error::NotFound) if op.is_undo() => Ok(None),
            Err(Error::NotFound) => {
                Ok(Some(self.mpool.fget(binding.mpf, pgno, GetFlag::Create)?))
            }
            Err(e) => Err(e),
        }
    }

    fn addrem_recover(&self, args: &AddremArgs, lsn: Lsn, op: RecOp) -> Result<()> {
        let pin = match self.fetch_page(args.fileid, args.pgno, op)? {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut change = false;
        {
            let mut buf = pin.write();
            let cmp_n = lsn.cmp(&page::lsn(&buf));
            let cmp_p = page::lsn(&buf).cmp(&args.pagelsn);

            let redo = op.is_redo();
            let undo = op.is_undo();
            if (cmp_p == Ordering::Equal && redo && args.opcode == OP_ADD)
                || (cmp_n == Ordering::Equal && undo && args.opcode == OP_REM)
            {
                // Redo an add or undo a delete.
                let hdr = if args.hdr.is_empty() {
                    None
                } else {
                    Some(args.hdr.as_slice())
                };
                slots::insert_item(&mut buf, args.indx as usize, hdr, &args.data)?;
                change = true;
            } else if (cmp_n == Ordering::Equal && undo && args.opcode == OP_ADD)
                || (cmp_p == Ordering::Equal && redo && args.opcode == OP_REM)
            {
                // Undo an add or redo a delete.
                slots::delete_item(&mut buf, args.indx as usize, args.nbytes as usize)?;
                change = true;
            }
            if change {
                page::set_lsn(&mut buf, if redo { lsn } else { args.pagelsn });
            }
        }
        self.mpool.fput(pin, change);
        Ok(())
    }

    fn big_recover(&self, args: &BigArgs, lsn: Lsn, op: RecOp) -> Result<()> {
        let redo = op.is_redo();

        // The page carrying the payload.
        if let Some(pin) = self.fetch_page(args.fileid, args.pgno, op)? {
            let mut change = false;
            {
                let mut buf = pin.write();
                let cmp_n = lsn.cmp(&page::lsn(&buf));
                let cmp_p = page::lsn(&buf).cmp(&args.pagelsn);
                if (cmp_p == Ordering::Equal && redo && args.opcode == OP_ADD)
                    || (cmp_n == Ordering::Equal && op.is_undo() && args.opcode == OP_REM)
                {
                    // Redo an add or undo a delete: rebuild the overflow
                    // page with its payload.
                    init_page(
                        &mut buf,
                        args.pgno,
                        args.prev_pgno,
                        args.next_pgno,
                        0,
                        PageType::Overflow,
                    );
                    page::set_ov_len(&mut buf, args.data.len() as u16);
                    page::set_ov_ref(&mut buf, 1);
                    buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + args.data.len()]
                        .copy_from_slice(&args.data);
                    change = true;
                } else if (cmp_n == Ordering::Equal && op.is_undo() && args.opcode == OP_ADD)
                    || (cmp_p == Ordering::Equal && redo && args.opcode == OP_REM)
                {
                    // The page is about to be reclaimed; only the LSN
                    // moves.
                    change = true;
                }
                if change {
                    page::set_lsn(&mut buf, if redo { lsn } else { args.pagelsn });
                }
            }
            self.mpool.fput(pin, change);
        }

        // The previous page's forward link.
        if args.prev_pgno != PGNO_INVALID {
            if let Some(pin) = self.fetch_page(args.fileid, args.prev_pgno, op)? {
                let mut change = false;
                {
                    let mut buf = pin.write();
                    let cmp_n = lsn.cmp(&page::lsn(&buf));
                    let cmp_p = page::lsn(&buf).cmp(&args.prevlsn);
                    if (cmp_p == Ordering::Equal && redo && args.opcode == OP_ADD)
                        || (cmp_n == Ordering::Equal && op.is_undo() && args.opcode == OP_REM)
                    {
                        page::set_next_pgno(&mut buf, args.pgno);
                        change = true;
                    } else if (cmp_n == Ordering::Equal
                        && op.is_undo()
                        && args.opcode == OP_ADD)
                        || (cmp_p == Ordering::Equal && redo && args.opcode == OP_REM)
                    {
                        page::set_next_pgno(&mut buf, args.next_pgno);
                        change = true;
                    }
                    if change {
                        page::set_lsn(&mut buf, if redo { lsn } else { args.prevlsn });
                    }
                }
                self.mpool.fput(pin, change);
            }
        }

        // The next page's backward link; only set on a delete.
        if args.next_pgno != PGNO_INVALID {
            if let Some(pin) = self.fetch_page(args.fileid, args.next_pgno, op)? {
                let mut change = false;
                {
                    let mut buf = pin.write();
                    let cmp_n = lsn.cmp(&page::lsn(&buf));
                    let cmp_p = page::lsn(&buf).cmp(&args.nextlsn);
                    if cmp_p == Ordering::Equal && redo {
                        page::set_prev_pgno(&mut buf, PGNO_INVALID);
                        change = true;
                    } else if cmp_n == Ordering::Equal && op.is_undo() {
                        page::set_prev_pgno(&mut buf, args.pgno);
                        change = true;
                    }
                    if change {
                        page::set_lsn(&mut buf, if redo { lsn } else { args.nextlsn });
                    }
                }
                self.mpool.fput(pin, change);
            }
        }
        Ok(())
    }

    fn ovref_recover(&self, args: &OvrefArgs, lsn: Lsn, op: RecOp) -> Result<()> {
        let pin = match self.fetch_page(args.fileid, args.pgno, op)? {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut change = false;
        {
            let mut buf = pin.write();
            let cmp_n = lsn.cmp(&page::lsn(&buf));
            let cmp_p = page::lsn(&buf).cmp(&args.pagelsn);
            if cmp_p == Ordering::Equal && op.is_redo() {
                let r = page::ov_ref(&buf) as i32 + args.adjust;
                page::set_ov_ref(&mut buf, r.max(0) as u16);
                page::set_lsn(&mut buf, lsn);
                change = true;
            } else if cmp_n == Ordering::Equal && op.is_undo() {
                let r = page::ov_ref(&buf) as i32 - args.adjust;
                page::set_ov_ref(&mut buf, r.max(0) as u16);
                page::set_lsn(&mut buf, args.pagelsn);
                change = true;
            }
        }
        self.mpool.fput(pin, change);
        Ok(())
    }

    fn relink_recover(&self, args: &RelinkArgs, lsn: Lsn, op: RecOp) -> Result<()> {
        let redo = op.is_redo();

        // The relinked page's own pointers.
        if let Some(pin) = self.fetch_page(args.fileid, args.pgno, op)? {
            let mut change = false;
            {
                let mut buf = pin.write();
                let cmp_n = lsn.cmp(&page::lsn(&buf));
                let cmp_p = page::lsn(&buf).cmp(&args.pagelsn);
                if cmp_p == Ordering::Equal && redo {
                    if args.opcode == OP_ADD {
                        page::set_prev_pgno(&mut buf, args.prev_pgno);
                        page::set_next_pgno(&mut buf, args.next_pgno);
                    }
                    page::set_lsn(&mut buf, lsn);
                    change = true;
                } else if cmp_n == Ordering::Equal && op.is_undo() {
                    if args.opcode == OP_ADD {
                        page::set_prev_pgno(&mut buf, PGNO_INVALID);
                        page::set_next_pgno(&mut buf, PGNO_INVALID);
                    }
                    page::set_lsn(&mut buf, args.pagelsn);
                    change = true;
                }
            }
            self.mpool.fput(pin, change);
        }

        // Former neighbors.
        if args.prev_pgno != PGNO_INVALID {
            if let Some(pin) = self.fetch_page(args.fileid, args.prev_pgno, op)? {
                let mut change = false;
                {
                    let mut buf = pin.write();
                    let cmp_n = lsn.cmp(&page::lsn(&buf));
                    let cmp_p = page::lsn(&buf).cmp(&args.prevlsn);
                    if cmp_p == Ordering::Equal && redo {
                        page::set_next_pgno(
                            &mut buf,
                            if args.opcode == OP_ADD {
                                args.pgno
                            } else {
                                args.next_pgno
                            },
                        );
                        change = true;
                    } else if cmp_n == Ordering::Equal && op.is_undo() {
                        page::set_next_pgno(
                            &mut buf,
                            if args.opcode == OP_ADD {
                                args.next_pgno
                            } else {
                                args.pgno
                            },
                        );
                        change = true;
                    }
                    if change {
                        page::set_lsn(&mut buf, if redo { lsn } else { args.prevlsn });
                    }
                }
                self.mpool.fput(pin, change);
            }
        }

        if args.next_pgno != PGNO_INVALID {
            if let Some(pin) = self.fetch_page(args.fileid, args.next_pgno, op)? {
                let mut change = false;
                {
                    let mut buf = pin.write();
                    let cmp_n = lsn.cmp(&page::lsn(&buf));
                    let cmp_p = page::lsn(&buf).cmp(&args.nextlsn);
                    if cmp_p == Ordering::Equal && redo {
                        page::set_prev_pgno(
                            &mut buf,
                            if args.opcode == OP_ADD {
                                args.pgno
                            } else {
                                args.prev_pgno
                            },
                        );
                        change = true;
                    } else if cmp_n == Ordering::Equal && op.is_undo() {
                        page::set_prev_pgno(
                            &mut buf,
                            if args.opcode == OP_ADD {
                                args.prev_pgno
                            } else {
                                args.pgno
                            },
                        );
                        change = true;
                    }
                    if change {
                        page::set_lsn(&mut buf, if redo { lsn } else { args.nextlsn });
                    }
                }
                self.mpool.fput(pin, change);
            }
        }
        Ok(())
    }

    fn dbreg_recover(&self, args: &DbregRegisterArgs, op: RecOp) -> Result<()> {
        match op {
            RecOp::OpenFiles => match args.opcode {
                DBREG_OPEN | DBREG_PREOPEN | DBREG_REOPEN | DBREG_CHKPNT => {
                    self.files.do_open(args)
                }
                DBREG_CLOSE | DBREG_RCLOSE => self.files.do_close(args),
                v => Err(Error::Corrupt(format!("bad dbreg opcode {}", v))),
            },
            RecOp::Redo | RecOp::Apply => match args.opcode {
                DBREG_OPEN | DBREG_REOPEN | DBREG_PREOPEN => self.files.do_open(args),
                DBREG_CLOSE | DBREG_RCLOSE => self.files.do_close(args),
                // Checkpoint snapshots do not themselves open.
                DBREG_CHKPNT => Ok(()),
                v => Err(Error::Corrupt(format!("bad dbreg opcode {}", v))),
            },
            RecOp::Undo => match args.opcode {
                // Reversing an open closes; reversing a close re-opens.
                DBREG_OPEN | DBREG_REOPEN | DBREG_PREOPEN => self.files.do_close(args),
                DBREG_CLOSE | DBREG_RCLOSE => self.files.do_open(args),
                DBREG_CHKPNT => Ok(()),
                v => Err(Error::Corrupt(format!("bad dbreg opcode {}", v))),
            },
        }
    }
}

/// Outcome of a full recovery run.
#[derive(Debug, Default)]
pub struct RecoveryInfo {
    /// Committed transactions found.
    pub committed: usize,
    /// Records undone in the backward pass.
    pub undone: usize,
    /// Records redone in the forward pass.
    pub redone: usize,
    /// Records that failed to apply and were skipped.
    pub bad: Vec<Lsn>,
    /// Where the redo scan started.
    pub start: Lsn,
    /// End of the log at recovery time.
    pub end: Lsn,
}

/// Find the redo horizon: the `ckp_lsn` inside the most recent
/// checkpoint record, or the start of the log.
fn redo_start(log: &Mutex<LogManager>) -> Result<Lsn> {
    let log_start = {
        let lm = log.lock().unwrap_or_else(|e| e.into_inner());
        Lsn::new(lm.first_file()?, 0)
    };
    let mut cursor = LogCursor::new();
    let mut step = CursorOp::Last;
    loop {
        let got = {
            let mut lm = log.lock().unwrap_or_else(|e| e.into_inner());
            cursor.get(&mut lm, step)
        };
        let (lsn, body) = match got {
            Ok(r) => r,
            Err(Error::NotFound) => return Ok(log_start),
            Err(e) => return Err(e),
        };
        step = CursorOp::Prev;
        if lsn.offset == 0 {
            continue;
        }
        if records::rectype_of(&body) == RecordType::TxnCkp {
            let args = TxnCkpArgs::decode(&body)?;
            return Ok(if args.ckp_lsn.is_zero() {
                log_start
            } else {
                args.ckp_lsn
            });
        }
    }
}

/// Run crash recovery over the whole log: rebuild the open-file table,
/// undo losers backward, redo winners forward. The log is locked per
/// step, because the dbreg handlers may need it to close files.
pub fn run_recovery(log: &Mutex<LogManager>, ctx: &RecoverCtx<'_>) -> Result<RecoveryInfo> {
    let end = {
        let lm = log.lock().unwrap_or_else(|e| e.into_inner());
        lm.current_lsn()
    };
    let mut info = RecoveryInfo {
        end,
        ..Default::default()
    };
    if end == Lsn::new(1, 0) {
        // Nothing has ever been logged.
        return Ok(info);
    }
    let start = redo_start(log)?;
    info.start = start;

    // A single bad record is noted and skipped; an I/O failure ends the
    // whole run.
    let apply = |ctx: &RecoverCtx<'_>,
                 body: &[u8],
                 lsn: Lsn,
                 op: RecOp,
                 info: &mut RecoveryInfo|
     -> Result<bool> {
        match ctx.dispatch(body, lsn, op) {
            Ok(()) => Ok(true),
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(e) => {
                warn!(lsn = %lsn, error = %e, "skipping unrecoverable record");
                info.bad.push(lsn);
                Ok(false)
            }
        }
    };

    // Pass 1: open files, from the redo horizon forward.
    {
        let mut cursor = LogCursor::new();
        let mut step = CursorOp::Set(start);
        loop {
            let got = {
                let mut lm = log.lock().unwrap_or_else(|e| e.into_inner());
                cursor.get(&mut lm, step)
            };
            let (lsn, body) = match got {
                Ok(r) => r,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            step = CursorOp::Next;
            if lsn.offset == 0 {
                continue;
            }
            if records::rectype_of(&body) == RecordType::DbregRegister {
                apply(ctx, &body, lsn, RecOp::OpenFiles, &mut info)?;
            }
        }
    }

    // Pass 2: walk backward over the whole log, learning which
    // transactions committed and undoing the rest.
    let mut committed: HashSet<u32> = HashSet::new();
    {
        let mut cursor = LogCursor::new();
        let mut step = CursorOp::Last;
        loop {
            let got = {
                let mut lm = log.lock().unwrap_or_else(|e| e.into_inner());
                cursor.get(&mut lm, step)
            };
            let (lsn, body) = match got {
                Ok(r) => r,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            step = CursorOp::Prev;
            if lsn.offset == 0 {
                continue;
            }
            let rectype = records::rectype_of(&body);
            let txnid = records::txnid_of(&body);
            if rectype == RecordType::TxnRegop {
                let args = TxnRegopArgs::decode(&body)?;
                if args.opcode == TXN_COMMIT {
                    committed.insert(txnid);
                }
                continue;
            }
            if rectype == RecordType::TxnChild {
                // A child lives or dies with its parent; walking
                // backward, the parent's resolution has already been
                // seen.
                let args = crate::log::records::TxnChildArgs::decode(&body)?;
                if committed.contains(&txnid) {
                    committed.insert(args.child);
                }
                continue;
            }
            let is_page_record = matches!(
                rectype,
                RecordType::Addrem | RecordType::Big | RecordType::Ovref | RecordType::Relink
            );
            if is_page_record && txnid != 0 && !committed.contains(&txnid) {
                if apply(ctx, &body, lsn, RecOp::Undo, &mut info)? {
                    info.undone += 1;
                }
            }
        }
    }
    info.committed = committed.len();

    // Pass 3: redo winners forward from the horizon.
    {
        let mut cursor = LogCursor::new();
        let mut step = CursorOp::Set(start);
        loop {
            let got = {
                let mut lm = log.lock().unwrap_or_else(|e| e.into_inner());
                cursor.get(&mut lm, step)
            };
            let (lsn, body) = match got {
                Ok(r) => r,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            step = CursorOp::Next;
            if lsn.offset == 0 {
                continue;
            }
            let rectype = records::rectype_of(&body);
            let txnid = records::txnid_of(&body);
            let is_page_record = matches!(
                rectype,
                RecordType::Addrem | RecordType::Big | RecordType::Ovref | RecordType::Relink
            );
            if is_page_record && (txnid == 0 || committed.contains(&txnid)) {
                if apply(ctx, &body, lsn, RecOp::Redo, &mut info)? {
                    info.redone += 1;
                }
            }
        }
    }

    Ok(info)
}
