//! The replication message loop.
//!
//! [`process_message`] is the single entry point every site runs for
//! every incoming message: validate versions, gate on generation,
//! gate on the client's recovery state, then dispatch. Masters answer
//! requests by streaming their log; clients feed the stream into the
//! catch-up machinery in [`crate::rep::apply`]; votes go to
//! [`crate::rep::election`].

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::env::EnvInner;
use crate::log::cursor::{CursorOp, LogCursor};
use crate::log::{Lsn, LOG_FILE_HDR_REC, LOG_VERSION};
use crate::rep::message::{
    decode_lsn_payload, encode_lsn_payload, MessageType, RepControl, CONTROL_SIZE,
    FLAG_IS_MASTER, REP_VERSION,
};
use crate::rep::{apply, election, Eid, RepOutcome, RepRole, EID_INVALID};
use crate::{Error, Result};

/// Bulk buffers flush at this size.
const BULK_FLUSH_SIZE: usize = 16 * 1024;

/// Control flag on a PAGE message: the internal-initialization dump is
/// complete; the control LSN is the master's end of log.
pub const FLAG_INIT_DONE: u32 = 0x2;

/// Send one message through the host transport. Without a transport
/// this is a no-op, which keeps single-site environments working.
pub(crate) fn send_message(
    inner: &EnvInner,
    eid: Option<Eid>,
    rectype: MessageType,
    lsn: Lsn,
    payload: &[u8],
    flags: u32,
) -> Result<()> {
    let transport = {
        let t = inner.transport.lock().unwrap_or_else(|e| e.into_inner());
        t.clone()
    };
    let Some(transport) = transport else {
        return Ok(());
    };
    let gen = inner.rep_gen();
    let mut control = RepControl::new(rectype, gen, lsn, payload.len() as u32);
    control.flags = flags;
    transport
        .send(&control, payload, eid, 0)
        .map_err(|_| Error::Io("replication send callback failed".into()))
}

/// Stream everything newly written to the log to the clients. Called on
/// the master after each append; rollovers become NEWFILE messages.
pub(crate) fn stream_new_records(inner: &EnvInner) {
    {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.role != RepRole::Master {
            return;
        }
    }
    if inner.transport.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
        return;
    }

    loop {
        let (pos, end) = {
            let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            let end = {
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            (rep.last_streamed, end)
        };
        if pos >= end {
            return;
        }

        let read = {
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.read_record(pos)
        };
        match read {
            Ok((hdr, body)) => {
                if pos.offset == 0 {
                    // File header records are never streamed. Announce
                    // the file instead, which also lets a pristine
                    // client write its own first header.
                    {
                        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                        rep.last_streamed = Lsn::new(pos.file, hdr.length);
                    }
                    flush_bulk(inner);
                    let _ = send_message(inner, None, MessageType::NewFile, pos, &[], 0);
                    continue;
                }
                send_log_record(inner, pos, &body);
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.last_streamed = Lsn::new(pos.file, pos.offset + hdr.length);
                rep.last_streamed_rec = pos;
            }
            Err(Error::NotFound) if pos.file < end.file => {
                // Rollover: announce the new file, carrying the last
                // record of the old one so clients can rule out a gap.
                let (newfile, old_last) = {
                    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                    let newfile = Lsn::new(pos.file + 1, 0);
                    let old_last = rep.last_streamed_rec;
                    rep.last_streamed = Lsn::new(pos.file + 1, LOG_FILE_HDR_REC);
                    (newfile, old_last)
                };
                flush_bulk(inner);
                let _ = send_message(
                    inner,
                    None,
                    MessageType::NewFile,
                    newfile,
                    &encode_lsn_payload(old_last),
                    0,
                );
            }
            Err(_) => return,
        }
    }
}

/// Send one log record, coalescing into the bulk buffer when bulk mode
/// is on.
fn send_log_record(inner: &EnvInner, lsn: Lsn, body: &[u8]) {
    let bulk = {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.bulk
    };
    if !bulk {
        let _ = send_message(inner, None, MessageType::Log, lsn, body, 0);
        return;
    }
    let full = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        let mut seg = [0u8; 12];
        LittleEndian::write_u32(&mut seg[0..], lsn.file);
        LittleEndian::write_u32(&mut seg[4..], lsn.offset);
        LittleEndian::write_u32(&mut seg[8..], body.len() as u32);
        rep.bulk_buf.extend_from_slice(&seg);
        rep.bulk_buf.extend_from_slice(body);
        rep.bulk_buf.len() >= BULK_FLUSH_SIZE
    };
    if full {
        flush_bulk(inner);
    }
}

/// Flush the bulk buffer as one BULK_LOG message.
pub(crate) fn flush_bulk(inner: &EnvInner) {
    let (buf, last) = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.bulk_buf.is_empty() {
            return;
        }
        (std::mem::take(&mut rep.bulk_buf), rep.last_streamed_rec)
    };
    let _ = send_message(inner, None, MessageType::BulkLog, last, &buf, 0);
}

/// Start replication in a role.
pub(crate) fn rep_start(inner: &Arc<EnvInner>, role: RepRole) -> Result<()> {
    let end = {
        let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.current_lsn()
    };
    match role {
        RepRole::Master => {
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                if rep.role != RepRole::Master {
                    rep.gen += 1;
                    if rep.egen <= rep.gen {
                        rep.egen = rep.gen + 1;
                    }
                }
                rep.role = RepRole::Master;
                rep.master_id = rep.eid;
                rep.election_done();
                rep.last_streamed = end;
                rep.last_streamed_rec = {
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.last_record_lsn()
                };
            }
            let _ = send_message(inner, None, MessageType::NewMaster, end, &[], 0);
            Ok(())
        }
        RepRole::Client => {
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.role = RepRole::Client;
                let mut client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
                client.ready_lsn = end;
            }
            let _ = send_message(inner, None, MessageType::NewClient, end, &[], 0);
            Ok(())
        }
        RepRole::None => Err(Error::Invalid("cannot start replication as none".into())),
    }
}

/// Rebroadcast the latest log record; a nudge for clients that missed
/// the end of the stream.
pub(crate) fn rep_flush(inner: &EnvInner) -> Result<()> {
    flush_bulk(inner);
    let (lsn, body) = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        let lsn = log.last_record_lsn();
        if lsn.offset == 0 {
            return Ok(());
        }
        let (_, body) = log.read_record(lsn)?;
        (lsn, body)
    };
    send_message(inner, None, MessageType::Log, lsn, &body, 0)
}

/// Adopt a new master: bump our generation, end any election, and start
/// the verify handshake against its log.
pub(crate) fn new_master(inner: &Arc<EnvInner>, rp: &RepControl, eid: Eid) -> Result<RepOutcome> {
    let already = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        let already = rep.master_id == eid && rep.gen == rp.gen && rep.role == RepRole::Client;
        rep.election_done();
        rep.master_id = eid;
        if rp.gen > rep.gen {
            rep.gen = rp.gen;
            if rep.egen <= rep.gen {
                rep.egen = rep.gen + 1;
            }
        }
        if rep.eid != eid {
            rep.role = RepRole::Client;
        }
        already
    };
    if already {
        return Ok(RepOutcome::NewMaster(eid));
    }
    if {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.eid == eid
    } {
        return Ok(RepOutcome::NewMaster(eid));
    }

    apply::start_verify(inner, eid)?;
    Ok(RepOutcome::NewMaster(eid))
}

/// Stream log records from `start` to `eid`, inserting NEWFILE messages
/// between files and honoring the configured byte budget; the last
/// message under an exhausted budget is LOG_MORE.
fn stream_log(inner: &EnvInner, eid: Eid, start: Lsn) -> Result<()> {
    let (gbytes, bytes) = {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        (rep.gbytes, rep.bytes)
    };
    let check_limit = gbytes != 0 || bytes != 0;
    let mut budget = gbytes as u64 * (1 << 30) + bytes as u64;

    let mut cursor = LogCursor::new();
    let mut op = CursorOp::Set(start);
    let mut prev_rec = Lsn::ZERO;
    loop {
        let (lsn, body) = {
            let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
            match cursor.get(&mut log, op) {
                Ok(r) => r,
                Err(Error::NotFound) => break,
                Err(e) => return Err(e),
            }
        };
        op = CursorOp::Next;

        if lsn.offset == 0 {
            // Landed on a file header (a request for [n][0]); tell the
            // client about the file instead.
            let _ = send_message(inner, Some(eid), MessageType::NewFile, lsn, &[], 0);
            continue;
        }
        if !prev_rec.is_zero() && lsn.file != prev_rec.file {
            let _ = send_message(
                inner,
                Some(eid),
                MessageType::NewFile,
                Lsn::new(lsn.file, 0),
                &encode_lsn_payload(prev_rec),
                0,
            );
        }

        let mut rectype = MessageType::Log;
        if check_limit {
            let need = body.len() as u64 + CONTROL_SIZE as u64;
            if budget < need {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.stats.throttles += 1;
                rectype = MessageType::LogMore;
            } else {
                budget -= need;
            }
        }
        send_message(inner, Some(eid), rectype, lsn, &body, 0)?;
        if rectype == MessageType::LogMore {
            return Ok(());
        }
        prev_rec = lsn;
    }
    Ok(())
}

/// Answer a LOG_REQ: the exact record, or a NEWFILE when the requested
/// offset names a file boundary or runs past the end of a file.
fn answer_log_req(inner: &EnvInner, eid: Eid, req: Lsn) -> Result<()> {
    let read = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.read_record(req)
    };
    match read {
        Ok((_, body)) if req.offset != 0 => {
            send_message(inner, Some(eid), MessageType::Log, req, &body, 0)
        }
        Ok(_) => send_message(inner, Some(eid), MessageType::NewFile, req, &[], 0),
        Err(Error::NotFound) => {
            // Past the end of a file the client is still reading.
            send_message(inner, Some(eid), MessageType::NewFile, req, &[], 0)
        }
        Err(e) => Err(e),
    }
}

/// Answer a VERIFY_REQ with the record at the LSN, or VERIFY_FAIL when
/// the log no longer reaches back that far.
fn answer_verify_req(inner: &EnvInner, eid: Eid, req: Lsn) -> Result<()> {
    let read = {
        let mut log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        match log.read_record(req) {
            Ok((_, body)) => Ok(body),
            Err(Error::NotFound) if log.is_outdated(req.file)? => Err(true),
            Err(_) => Err(false),
        }
    };
    match read {
        Ok(body) => send_message(inner, Some(eid), MessageType::Verify, req, &body, 0),
        Err(true) => send_message(inner, Some(eid), MessageType::VerifyFail, req, &[], 0),
        Err(false) => send_message(inner, Some(eid), MessageType::Verify, req, &[], 0),
    }
}

/// Dump every page of every open database to a client performing
/// internal initialization, finishing with an INIT_DONE marker that
/// carries our end of log and the file-id list the client must rebind.
fn answer_page_req(inner: &Arc<EnvInner>, eid: Eid) -> Result<()> {
    let dbs: Vec<(String, Arc<crate::db::Database>)> = {
        let map = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(n, d)| (n.clone(), Arc::clone(d))).collect()
    };
    for (name, db) in &dbs {
        db.sync()?;
        let pages = inner.mpool.file_pages(db.mpf)?;
        for pgno in 0..pages {
            let pin = match inner.mpool.fget(db.mpf, pgno, crate::mpool::GetFlag::None) {
                Ok(p) => p,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let mut payload = Vec::with_capacity(name.len() + 8 + db.page_size() as usize);
            let mut hdr = [0u8; 8];
            LittleEndian::write_u32(&mut hdr[0..], name.len() as u32);
            LittleEndian::write_u32(&mut hdr[4..], pgno);
            payload.extend_from_slice(&hdr);
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&pin.read());
            inner.mpool.fput(pin, false);
            send_message(inner, Some(eid), MessageType::Page, Lsn::ZERO, &payload, 0)?;
        }
    }

    // The DONE payload names every file and the id the log knows it by.
    let mut list = Vec::new();
    for (name, db) in &dbs {
        let mut entry = [0u8; 12];
        LittleEndian::write_u32(&mut entry[0..], db.fileid() as u32);
        LittleEndian::write_u32(&mut entry[4..], db.dbtype().code());
        LittleEndian::write_u32(&mut entry[8..], name.len() as u32);
        list.extend_from_slice(&entry);
        list.extend_from_slice(name.as_bytes());
    }
    let end = {
        let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.current_lsn()
    };
    send_message(inner, Some(eid), MessageType::Page, end, &list, FLAG_INIT_DONE)
}

/// Process one incoming replication message.
pub(crate) fn process_message(
    inner: &Arc<EnvInner>,
    control: &[u8],
    rec: &[u8],
    eid: Eid,
) -> Result<RepOutcome> {
    let rp = RepControl::decode(control)?;

    if rp.rep_version != REP_VERSION {
        return Err(Error::Invalid(format!(
            "unexpected replication message version {}, expected {}",
            rp.rep_version, REP_VERSION
        )));
    }
    if rp.log_version != LOG_VERSION {
        return Err(Error::Invalid(format!(
            "unexpected log record version {}, expected {}",
            rp.log_version, LOG_VERSION
        )));
    }

    let (gen, role, recovering) = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.msgs_processed += 1;
        (rep.gen, rep.role, rep.recovering())
    };

    // Generation gating: old messages are dropped unless they indicate
    // a site that needs to find the group; new ones mean we are stale.
    if rp.gen < gen
        && !matches!(
            rp.rectype,
            MessageType::AliveReq | MessageType::NewClient | MessageType::MasterReq
        )
    {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.msgs_bad_gen += 1;
        return Ok(RepOutcome::Processed);
    }
    if rp.gen > gen
        && !matches!(rp.rectype, MessageType::Alive | MessageType::NewMaster)
    {
        send_message(inner, None, MessageType::MasterReq, Lsn::ZERO, &[], 0)?;
        return Ok(RepOutcome::Processed);
    }

    // Recovery gating: while verifying or loading pages, only the
    // messages that drive those states get through; everything else
    // bumps the rerequest counter.
    if recovering {
        let allowed = match rp.rectype {
            MessageType::Alive
            | MessageType::AliveReq
            | MessageType::Elect
            | MessageType::NewClient
            | MessageType::NewMaster
            | MessageType::NewSite
            | MessageType::Vote1
            | MessageType::Vote2
            | MessageType::Update
            | MessageType::Page => true,
            MessageType::Verify => {
                let client = inner.client.lock().unwrap_or_else(|e| e.into_inner());
                rp.lsn == client.verify_lsn
            }
            _ => false,
        };
        if !allowed {
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.stats.msgs_recovering += 1;
            }
            apply::retransmit_verify(inner, eid)?;
            return Ok(RepOutcome::Processed);
        }
    }

    match rp.rectype {
        MessageType::Alive => {
            // The payload carries the sender's egen; adopt a newer one.
            if rec.len() >= 4 {
                let egen = LittleEndian::read_u32(rec);
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                if egen > rep.egen {
                    rep.election_done();
                    rep.egen = egen;
                    drop(rep);
                    crate::rep::write_egen(&inner.dir, egen)?;
                }
            }
            if rp.gen > gen && rp.flags & FLAG_IS_MASTER != 0 {
                return new_master(inner, &rp, eid);
            }
            Ok(RepOutcome::Processed)
        }
        MessageType::AliveReq => {
            let end = {
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            let egen = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.egen
            };
            let mut payload = [0u8; 4];
            LittleEndian::write_u32(&mut payload, egen);
            let flags = if role == RepRole::Master {
                FLAG_IS_MASTER
            } else {
                0
            };
            send_message(inner, Some(eid), MessageType::Alive, end, &payload, flags)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::MasterReq => {
            if role == RepRole::Master {
                let end = {
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.current_lsn()
                };
                send_message(inner, Some(eid), MessageType::NewMaster, end, &[], 0)?;
            }
            Ok(RepOutcome::Processed)
        }
        MessageType::NewClient => {
            send_message(inner, None, MessageType::NewSite, rp.lsn, rec, 0)?;
            if role == RepRole::Master {
                let end = {
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.current_lsn()
                };
                send_message(inner, Some(eid), MessageType::NewMaster, end, &[], 0)?;
            }
            Ok(RepOutcome::NewSite)
        }
        MessageType::NewSite => {
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.stats.newsites += 1;
            }
            if role == RepRole::Master {
                let end = {
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.current_lsn()
                };
                send_message(inner, Some(eid), MessageType::NewMaster, end, &[], 0)?;
            }
            Ok(RepOutcome::NewSite)
        }
        MessageType::NewMaster => {
            let self_eid = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.eid
            };
            if role == RepRole::Master && eid != self_eid {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.stats.dupmasters += 1;
                return Ok(RepOutcome::DupMaster);
            }
            new_master(inner, &rp, eid)
        }
        MessageType::Elect => {
            if role == RepRole::Master {
                let end = {
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    log.current_lsn()
                };
                {
                    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                    rep.gen += 1;
                }
                send_message(inner, Some(eid), MessageType::NewMaster, end, &[], 0)?;
                return Ok(RepOutcome::Processed);
            }
            let in_election = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.in_election()
            };
            if in_election {
                Ok(RepOutcome::Processed)
            } else {
                Ok(RepOutcome::HoldElection)
            }
        }
        MessageType::AllReq => {
            master_only(role, rp.rectype)?;
            stream_log(inner, eid, rp.lsn)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::LogReq => {
            master_only(role, rp.rectype)?;
            answer_log_req(inner, eid, rp.lsn)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::Log | MessageType::LogMore => {
            client_only(role, rp.rectype)?;
            apply::apply(inner, &rp, rec)?;
            if rp.rectype == MessageType::LogMore {
                // The master throttled; ask for the rest.
                let (master, end) = {
                    let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                    let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                    (rep.master_id, log.current_lsn())
                };
                if master != EID_INVALID {
                    send_message(inner, Some(master), MessageType::AllReq, end, &[], 0)?;
                }
            }
            Ok(RepOutcome::Processed)
        }
        MessageType::BulkLog => {
            client_only(role, rp.rectype)?;
            let mut off = 0usize;
            while off + 12 <= rec.len() {
                let file = LittleEndian::read_u32(&rec[off..]);
                let offset = LittleEndian::read_u32(&rec[off + 4..]);
                let len = LittleEndian::read_u32(&rec[off + 8..]) as usize;
                off += 12;
                if off + len > rec.len() {
                    return Err(Error::Invalid("truncated bulk segment".into()));
                }
                let seg_ctl = RepControl {
                    rectype: MessageType::Log,
                    lsn: Lsn::new(file, offset),
                    msg_len: len as u32,
                    ..rp
                };
                apply::apply(inner, &seg_ctl, &rec[off..off + len])?;
                off += len;
            }
            Ok(RepOutcome::Processed)
        }
        MessageType::NewFile => {
            client_only(role, rp.rectype)?;
            apply::apply(inner, &rp, rec)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::Verify => {
            client_only(role, rp.rectype)?;
            apply::verify(inner, &rp, rec, eid)
        }
        MessageType::VerifyFail => {
            client_only(role, rp.rectype)?;
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.stats.outdated += 1;
            }
            apply::enter_internal_init(inner, eid)
        }
        MessageType::VerifyReq => {
            master_only(role, rp.rectype)?;
            answer_verify_req(inner, eid, rp.lsn)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::UpdateReq => {
            master_only(role, rp.rectype)?;
            let end = {
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            send_message(inner, Some(eid), MessageType::Update, end, &[], 0)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::Update => {
            // Ignored unless we asked for it.
            let wanted = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.recover_update
            };
            if !wanted {
                debug!("ignoring unsolicited UPDATE");
                return Ok(RepOutcome::Processed);
            }
            {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.recover_update = false;
                rep.recover_page = true;
            }
            send_message(inner, Some(eid), MessageType::PageReq, rp.lsn, &[], 0)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::PageReq => {
            master_only(role, rp.rectype)?;
            answer_page_req(inner, eid)?;
            Ok(RepOutcome::Processed)
        }
        MessageType::Page | MessageType::BulkPage => {
            // Ignored unless an internal initialization is underway.
            let wanted = {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.recover_page
            };
            if !wanted {
                debug!("ignoring unsolicited PAGE");
                return Ok(RepOutcome::Processed);
            }
            apply::apply_page(inner, &rp, rec, eid)
        }
        MessageType::Vote1 => election::vote1(inner, &rp, rec, eid),
        MessageType::Vote2 => election::vote2(inner, &rp, rec, eid),
    }
}

fn master_only(role: RepRole, rectype: MessageType) -> Result<()> {
    if role != RepRole::Master {
        warn!(?rectype, "master-only message arrived on a non-master");
        return Err(Error::Invalid(format!(
            "{:?} may only be processed on a master",
            rectype
        )));
    }
    Ok(())
}

fn client_only(role: RepRole, rectype: MessageType) -> Result<()> {
    if role != RepRole::Client {
        warn!(?rectype, "client-only message arrived on a non-client");
        return Err(Error::Invalid(format!(
            "{:?} may only be processed on a client",
            rectype
        )));
    }
    Ok(())
}
