//! Client catch-up and transaction replay.
//!
//! Incoming log records land here. An in-sequence record is appended to
//! the local log; an out-of-order one waits in the pending queue until
//! the gap before it closes, with a LOG_REQ rerequest sent after a
//! doubling number of arrivals. "Simple" records only need appending;
//! commits replay the whole transaction against the local databases,
//! checkpoints sync the cache, and out-of-transaction dbreg records
//! maintain the file table.
//!
//! A client joining a master first negotiates the common log prefix:
//! VERIFY_REQ/VERIFY walks `verify_lsn` backward over commit and
//! checkpoint records until master and client agree byte-for-byte, then
//! the client truncates its log there and streams forward. A client so
//! far behind that the master's log no longer reaches it either loads
//! the master's pages wholesale (internal initialization) or fails.

use std::sync::Arc;

use tracing::{debug, info, warn};

use byteorder::{ByteOrder, LittleEndian};

use crate::env::{EnvFiles, EnvInner};
use crate::log::cursor::log_backup;
use crate::log::records::{
    self, RecordType, TxnCkpArgs, TxnRegopArgs, TxnXaRegopArgs, TXN_COMMIT,
};
use crate::log::Lsn;
use crate::recover::{RecOp, RecoverCtx};
use crate::rep::message::{decode_lsn_payload, MessageType, RepControl};
use crate::rep::process::{send_message, FLAG_INIT_DONE};
use crate::rep::{Eid, RepOutcome, EID_INVALID};
use crate::{Error, Result};

/// What the placement step decided to do with a record.
enum Placement {
    /// The record was appended; its type may need dispatching.
    InSequence(RecordType),
    /// Queued, duplicate, or otherwise finished.
    Done,
}

/// Feed one LOG/NEWFILE message into the catch-up machinery.
pub(crate) fn apply(inner: &Arc<EnvInner>, rp: &RepControl, rec: &[u8]) -> Result<()> {
    let mut cur: Option<(RepControl, Vec<u8>)> = Some((*rp, rec.to_vec()));

    let mut advanced = false;
    loop {
        let (ctl, body) = match cur.take() {
            Some(x) => x,
            None => match pop_contiguous(inner) {
                Some(x) => x,
                None => break,
            },
        };

        match place_record(inner, &ctl, &body)? {
            // Queued or duplicate; the queue path did its own
            // rerequest accounting.
            Placement::Done => return Ok(()),
            Placement::InSequence(rectype) => {
                advanced = true;
                if !rectype.is_simple() {
                    dispatch_nonsimple(inner, &ctl, &body, rectype)?;
                }
                // Fall through: the queue may have become contiguous.
            }
        }
    }

    if advanced {
        maybe_rerequest(inner)?;
    }
    Ok(())
}

/// Place one record relative to `ready_lsn`: append it, queue it, or
/// drop it as a duplicate.
fn place_record(inner: &Arc<EnvInner>, ctl: &RepControl, body: &[u8]) -> Result<Placement> {
    let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
    let ready = client.ready_lsn;
    let cmp = ctl.lsn.cmp(&ready);

    if cmp == std::cmp::Ordering::Equal {
        if ctl.rectype == MessageType::NewFile {
            drop(client);
            apply_newfile(inner, ctl)?;
            return Ok(Placement::InSequence(RecordType::Noop));
        }
        let new_ready = {
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.rep_put(ctl.lsn, body)?;
            log.current_lsn()
        };
        client.ready_lsn = new_ready;
        drop(client);
        {
            let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            rep.stats.log_records += 1;
        }
        return Ok(Placement::InSequence(records::rectype_of(body)));
    }

    if cmp == std::cmp::Ordering::Greater {
        // A NEWFILE for the next file whose old-file link is at or
        // before ready means the record we are waiting for does not
        // exist; there is no gap.
        if ctl.rectype == MessageType::NewFile
            && ctl.lsn.file == ready.file + 1
            && ctl.lsn.offset == 0
            && !body.is_empty()
        {
            if let Ok(old_last) = decode_lsn_payload(body) {
                if old_last <= ready {
                    drop(client);
                    apply_newfile(inner, ctl)?;
                    return Ok(Placement::InSequence(RecordType::Noop));
                }
            }
        }

        // Out of order: queue it and account toward a rerequest.
        client.pending.insert(ctl.lsn, (*ctl, body.to_vec()));
        if client.waiting_lsn.is_zero() || ctl.lsn < client.waiting_lsn {
            client.waiting_lsn = ctl.lsn;
        }
        let (request_gap, max_gap) = {
            let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            rep.stats.log_queued += 1;
            rep.stats.log_queued_total += 1;
            if rep.stats.log_queued > rep.stats.log_queued_max {
                rep.stats.log_queued_max = rep.stats.log_queued;
            }
            (rep.request_gap, rep.max_gap)
        };
        if client.wait_recs == 0 {
            // A new gap.
            client.wait_recs = request_gap;
            client.rcvd_recs = 0;
        }
        client.rcvd_recs += 1;
        let do_req = client.rcvd_recs >= client.wait_recs;
        if do_req {
            client.wait_recs = (client.wait_recs << 1).min(max_gap);
            client.rcvd_recs = 0;
        }
        let next = client.ready_lsn;
        drop(client);
        if do_req {
            request_from_master(inner, MessageType::LogReq, next)?;
        }
        return Ok(Placement::Done);
    }

    // Duplicate of something already applied.
    drop(client);
    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
    rep.stats.log_duplicated += 1;
    Ok(Placement::Done)
}

/// Take the head of the pending queue if it is now in sequence.
fn pop_contiguous(inner: &Arc<EnvInner>) -> Option<(RepControl, Vec<u8>)> {
    let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
    if client.waiting_lsn.is_zero() {
        return None;
    }
    let head = *client.pending.keys().next()?;

    let contiguous = head == client.ready_lsn || {
        // A queued NEWFILE is in sequence once its old-file link shows
        // the expected record does not exist.
        let (ctl, body) = client.pending.get(&head)?;
        ctl.rectype == MessageType::NewFile
            && head.file == client.ready_lsn.file + 1
            && head.offset == 0
            && !body.is_empty()
            && decode_lsn_payload(body)
                .map(|l| l <= client.ready_lsn)
                .unwrap_or(false)
    };
    if !contiguous {
        return None;
    }

    client.wait_recs = 0;
    client.rcvd_recs = 0;
    let entry = client.pending.remove(&head)?;
    client.waiting_lsn = client.pending.keys().next().copied().unwrap_or(Lsn::ZERO);
    {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.log_queued = rep.stats.log_queued.saturating_sub(1);
    }
    Some(entry)
}

/// Roll the local log over for a NEWFILE message, ignoring duplicates.
fn apply_newfile(inner: &Arc<EnvInner>, ctl: &RepControl) -> Result<()> {
    let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
    let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
    let target = ctl.lsn.file;
    let cur = log.current_lsn();
    let new_ready = if target > cur.file {
        log.newfile()?
    } else if cur == Lsn::new(1, 0) {
        // A pristine log receiving the stream from the very beginning
        // writes its own first file header.
        log.bootstrap_first_file()?
    } else {
        // Already rolled; a duplicate of each NEWFILE variety is
        // possible with out-of-order delivery.
        cur
    };
    client.ready_lsn = new_ready;
    Ok(())
}

/// Handle a non-simple record once it is in the log: replay a commit,
/// sync on a checkpoint, maintain the file table for an
/// out-of-transaction registration.
fn dispatch_nonsimple(
    inner: &Arc<EnvInner>,
    ctl: &RepControl,
    body: &[u8],
    rectype: RecordType,
) -> Result<()> {
    match rectype {
        RecordType::TxnRegop => {
            // Application-level locks can deadlock against replay; the
            // whole transaction retries.
            loop {
                match process_txn(inner, body) {
                    Err(Error::Deadlock) => continue,
                    other => break other,
                }
            }
        }
        RecordType::TxnCkp => {
            // Validate the record, then push everything the checkpoint
            // covers out to the data files.
            TxnCkpArgs::decode(body)?;
            inner.sync_pages()?;
            let mut txns = inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.set_last_ckp(ctl.lsn);
            Ok(())
        }
        RecordType::DbregRegister => {
            // Opens happen inside transactions and replay with them;
            // closes are not transaction-protected and apply here.
            if records::txnid_of(body) == 0 {
                let files = EnvFiles {
                    inner: Arc::clone(inner),
                };
                let ctx = RecoverCtx {
                    mpool: &inner.mpool,
                    registry: &inner.registry,
                    files: &files,
                };
                ctx.dispatch(body, ctl.lsn, RecOp::Apply)?;
            }
            Ok(())
        }
        other => Err(Error::Invalid(format!(
            "record type {} is not dispatchable",
            other
        ))),
    }
}

/// Gather every LSN of a transaction chain, recursing into committed
/// children.
fn collect_txn(inner: &Arc<EnvInner>, mut lsn: Lsn, lc: &mut Vec<Lsn>) -> Result<()> {
    while !lsn.is_zero() {
        let body = {
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.read_record(lsn)?.1
        };
        if records::rectype_of(&body) == RecordType::TxnChild {
            let args = records::TxnChildArgs::decode(&body)?;
            collect_txn(inner, args.c_lsn, lc)?;
            lsn = args.prev_lsn;
        } else {
            lc.push(lsn);
            lsn = records::prev_lsn_of(&body);
        }
    }
    Ok(())
}

/// Replay one committed (or prepared) transaction: gather its LSNs,
/// sort them ascending, and apply each under a replay locker.
pub(crate) fn process_txn(inner: &Arc<EnvInner>, rec: &[u8]) -> Result<()> {
    let prev = match records::rectype_of(rec) {
        RecordType::TxnRegop => {
            let args = TxnRegopArgs::decode(rec)?;
            if args.opcode != TXN_COMMIT {
                // Aborts were never applied here; nothing to replay.
                return Ok(());
            }
            args.prev_lsn
        }
        RecordType::TxnXaRegop => TxnXaRegopArgs::decode(rec)?.prev_lsn,
        other => {
            return Err(Error::Invalid(format!(
                "cannot replay a {} record",
                other
            )))
        }
    };

    let mut lc = Vec::new();
    collect_txn(inner, prev, &mut lc)?;
    lc.sort_unstable();

    let _locker = {
        let mut txns = inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.lock_id()
    };

    let files = EnvFiles {
        inner: Arc::clone(inner),
    };
    let ctx = RecoverCtx {
        mpool: &inner.mpool,
        registry: &inner.registry,
        files: &files,
    };
    for lsn in lc {
        let body = {
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.read_record(lsn)?.1
        };
        ctx.dispatch(&body, lsn, RecOp::Apply)?;
    }

    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
    rep.stats.txns_applied += 1;
    Ok(())
}

fn request_from_master(inner: &EnvInner, rectype: MessageType, lsn: Lsn) -> Result<()> {
    let master = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.log_requested += 1;
        rep.master_id
    };
    // No master means an election is underway; the new master will
    // renegotiate the end of the log anyway.
    if master == EID_INVALID {
        return Ok(());
    }
    send_message(inner, Some(master), rectype, lsn, &[], 0)
}

/// After processing, ask for the gap if enough records have piled up
/// behind it.
fn maybe_rerequest(inner: &Arc<EnvInner>) -> Result<()> {
    let (do_req, next) = {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.waiting_lsn.is_zero() || client.ready_lsn == client.waiting_lsn {
            return Ok(());
        }
        client.rcvd_recs += 1;
        if client.rcvd_recs >= client.wait_recs {
            let request_gap = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.request_gap
            };
            client.wait_recs = request_gap;
            client.rcvd_recs = 0;
            (true, client.ready_lsn)
        } else {
            (false, Lsn::ZERO)
        }
    };
    if do_req {
        request_from_master(inner, MessageType::LogReq, next)?;
    }
    Ok(())
}

/// Begin the verify handshake against a new master: rewind to the
/// nearest commit or checkpoint and ask for the master's copy.
pub(crate) fn start_verify(inner: &Arc<EnvInner>, master: Eid) -> Result<()> {
    let last = {
        let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.last_record_lsn()
    };

    if last.offset == 0 {
        // Empty (or header-only) log: nothing to match, stream from the
        // top.
        let end = {
            let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.current_lsn()
        };
        {
            let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
            client.ready_lsn = end;
            client.waiting_lsn = Lsn::ZERO;
            client.verify_lsn = Lsn::ZERO;
            client.pending.clear();
        }
        return send_message(inner, Some(master), MessageType::AllReq, end, &[], 0);
    }

    let vlsn = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        // The last record itself may already be a rendezvous point.
        let last_type = log.read_record(last).map(|(_, b)| records::rectype_of(&b))?;
        if matches!(last_type, RecordType::TxnRegop | RecordType::TxnCkp) {
            Some(last)
        } else {
            match log_backup(&mut log, last) {
                Ok(lsn) => Some(lsn),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            }
        }
    };
    let Some(vlsn) = vlsn else {
        // Rewound past the start of the log without a rendezvous point.
        return enter_internal_init(inner, master).map(|_| ());
    };

    let delayed = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.recover_verify = true;
        if rep.delay_client {
            rep.delayed_lsn = vlsn;
            true
        } else {
            false
        }
    };
    {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        client.verify_lsn = vlsn;
        client.rcvd_recs = 0;
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        client.wait_recs = rep.request_gap;
    }
    if delayed {
        // Deferred until the application calls `rep_sync`.
        return Ok(());
    }
    debug!(%vlsn, "starting verify handshake");
    send_message(inner, Some(master), MessageType::VerifyReq, vlsn, &[], 0)
}

/// Resend the outstanding VERIFY_REQ after enough unusable messages
/// arrive while recovering, doubling the patience each time.
pub(crate) fn retransmit_verify(inner: &Arc<EnvInner>, eid: Eid) -> Result<()> {
    let (do_req, vlsn, master) = {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if eid != rep.master_id || !rep.recover_verify {
            return Ok(());
        }
        client.rcvd_recs += 1;
        if client.rcvd_recs >= client.wait_recs {
            client.wait_recs = (client.wait_recs << 1).min(rep.max_gap).max(1);
            client.rcvd_recs = 0;
            (true, client.verify_lsn, rep.master_id)
        } else {
            (false, Lsn::ZERO, EID_INVALID)
        }
    };
    if do_req && !vlsn.is_zero() {
        send_message(inner, Some(master), MessageType::VerifyReq, vlsn, &[], 0)?;
    }
    Ok(())
}

/// Handle the master's VERIFY response: match and resynchronize, or
/// step the verify LSN backward and try again.
pub(crate) fn verify(
    inner: &Arc<EnvInner>,
    rp: &RepControl,
    rec: &[u8],
    eid: Eid,
) -> Result<RepOutcome> {
    {
        // Only the response to the outstanding request is meaningful; a
        // duplicate arriving after the match would re-truncate.
        let client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.verify_lsn.is_zero() || rp.lsn != client.verify_lsn {
            return Ok(RepOutcome::Processed);
        }
    }
    let ours = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        match log.read_record(rp.lsn) {
            Ok((_, body)) => Some(body),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        }
    };

    if let Some(ours) = &ours {
        if !rec.is_empty() && ours.as_slice() == rec {
            verify_match(inner, rp.lsn, eid)?;
            return Ok(RepOutcome::Processed);
        }
    }

    // No match: rewind to the previous rendezvous record.
    let prev = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        match log_backup(&mut log, rp.lsn) {
            Ok(lsn) => Some(lsn),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        }
    };
    match prev {
        Some(lsn) => {
            {
                let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
                client.verify_lsn = lsn;
                client.rcvd_recs = 0;
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                client.wait_recs = rep.request_gap;
            }
            send_message(inner, Some(eid), MessageType::VerifyReq, lsn, &[], 0)?;
            Ok(RepOutcome::Processed)
        }
        None => enter_internal_init(inner, eid),
    }
}

/// The logs agree through `lsn`: roll back everything the divergent
/// tail committed, truncate the log there, reset the catch-up state,
/// and resume streaming.
fn verify_match(inner: &Arc<EnvInner>, lsn: Lsn, master: Eid) -> Result<()> {
    info!(%lsn, "log verified against new master; truncating");

    // Transactions whose commit lies beyond the match point were
    // replayed here but exist only on the dead master; reverse them
    // newest-first before the records disappear.
    let mut doomed = Vec::new();
    {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        let mut cursor = crate::log::cursor::LogCursor::new();
        let mut op = crate::log::cursor::CursorOp::Set(lsn);
        loop {
            let (rec_lsn, body) = match cursor.get(&mut log, op) {
                Ok(r) => r,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            };
            op = crate::log::cursor::CursorOp::Next;
            if rec_lsn <= lsn || rec_lsn.offset == 0 {
                continue;
            }
            if records::rectype_of(&body) == RecordType::TxnRegop {
                let args = TxnRegopArgs::decode(&body)?;
                if args.opcode == TXN_COMMIT {
                    doomed.push(args.prev_lsn);
                }
            }
        }
    }
    for chain in doomed.into_iter().rev() {
        inner.undo_chain(chain)?;
    }

    let new_end = {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.flush(None)?;
        log.truncate_after(lsn)?;
        let end = log.current_lsn();
        client.ready_lsn = end;
        client.waiting_lsn = Lsn::ZERO;
        client.verify_lsn = Lsn::ZERO;
        client.pending.clear();
        client.rcvd_recs = 0;
        client.wait_recs = 0;
        end
    };
    {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.recover_verify = false;
        rep.stats.log_queued = 0;
    }
    send_message(inner, Some(master), MessageType::AllReq, new_end, &[], 0)
}

/// The master cannot serve our verify LSN: load its pages wholesale,
/// unless the application disabled that.
pub(crate) fn enter_internal_init(inner: &Arc<EnvInner>, master: Eid) -> Result<RepOutcome> {
    {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.noautoinit {
            return Err(Error::JoinFailure);
        }
        rep.recover_verify = false;
        rep.recover_update = true;
    }
    {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        client.verify_lsn = Lsn::ZERO;
        client.pending.clear();
        client.waiting_lsn = Lsn::ZERO;
    }
    // The master's pages will overwrite the files wholesale; stale
    // handles and cached frames must not survive that.
    crate::db::discard_all(inner)?;
    warn!("too far behind master; starting internal initialization");
    send_message(inner, Some(master), MessageType::UpdateReq, Lsn::ZERO, &[], 0)?;
    Ok(RepOutcome::Processed)
}

/// Apply one internal-initialization PAGE message: write the page
/// straight into the named database file, or finish the load on the
/// DONE marker.
pub(crate) fn apply_page(
    inner: &Arc<EnvInner>,
    rp: &RepControl,
    rec: &[u8],
    eid: Eid,
) -> Result<RepOutcome> {
    if rp.flags & FLAG_INIT_DONE != 0 {
        // Rebind the files named in the master's list, then continue
        // the master's log from its end.
        let mut off = 0usize;
        while off + 12 <= rec.len() {
            let fileid = LittleEndian::read_u32(&rec[off..]) as i32;
            let ftype = LittleEndian::read_u32(&rec[off + 4..]);
            let name_len = LittleEndian::read_u32(&rec[off + 8..]) as usize;
            off += 12;
            if off + name_len > rec.len() {
                return Err(Error::Invalid("truncated file list entry".into()));
            }
            let args = records::DbregRegisterArgs {
                txnid: 0,
                prev_lsn: Lsn::ZERO,
                opcode: records::DBREG_OPEN,
                name: rec[off..off + name_len].to_vec(),
                uid: [0u8; 16],
                fileid,
                ftype,
                meta_pgno: 0,
            };
            crate::db::recover_open(inner, &args)?;
            off += name_len;
        }
        {
            let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.reset_to(rp.lsn)?;
            client.ready_lsn = rp.lsn;
            client.waiting_lsn = Lsn::ZERO;
            client.pending.clear();
        }
        {
            let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            rep.recover_page = false;
        }
        info!(end = %rp.lsn, "internal initialization complete");
        send_message(inner, Some(eid), MessageType::AllReq, rp.lsn, &[], 0)?;
        return Ok(RepOutcome::Processed);
    }

    if rec.len() < 8 {
        return Err(Error::Invalid("short PAGE payload".into()));
    }
    let name_len = LittleEndian::read_u32(&rec[0..]) as usize;
    let pgno = LittleEndian::read_u32(&rec[4..]);
    if rec.len() < 8 + name_len {
        return Err(Error::Invalid("short PAGE payload".into()));
    }
    let name = String::from_utf8_lossy(&rec[8..8 + name_len]).to_string();
    let page_bytes = &rec[8 + name_len..];

    let path = inner.dir.join(&name);
    use std::io::{Seek, SeekFrom, Write};
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|e| Error::Io(format!("cannot open {}: {}", path.display(), e)))?;
    f.seek(SeekFrom::Start(pgno as u64 * page_bytes.len() as u64))
        .map_err(|e| Error::Io(e.to_string()))?;
    f.write_all(page_bytes)
        .map_err(|e| Error::Io(e.to_string()))?;
    Ok(RepOutcome::Processed)
}

/// Kick a DELAYCLIENT environment into its deferred catch-up.
pub(crate) fn rep_sync(inner: &Arc<EnvInner>) -> Result<()> {
    let (vlsn, master) = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        let vlsn = rep.delayed_lsn;
        rep.delayed_lsn = Lsn::ZERO;
        (vlsn, rep.master_id)
    };
    if vlsn.is_zero() || master == EID_INVALID {
        return Ok(());
    }
    {
        let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        client.verify_lsn = vlsn;
    }
    send_message(inner, Some(master), MessageType::VerifyReq, vlsn, &[], 0)
}
