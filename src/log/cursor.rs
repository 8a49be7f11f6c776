//! Log record iteration.
//!
//! [`LogCursor`] walks records in either direction. It keeps only the
//! current record's LSN and header, so a cursor can be dropped and
//! recreated at any point: every step needs nothing but the LSN and the
//! next record header. Forward steps cross file boundaries transparently
//! and never land on a file header record; backward steps follow the
//! per-record back-links, using the file header's link to reach the
//! previous file.

use crate::log::records::{rectype_of, RecordType};
use crate::log::writer::LogManager;
use crate::log::{Lsn, RecordHeader, LOG_FILE_HDR_REC};
use crate::{Error, Result};

/// Positioning operations understood by [`LogCursor::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Seek to an exact LSN.
    Set(Lsn),
    /// Seek to the first record of the oldest log file.
    First,
    /// Seek to the most recently written record.
    Last,
    /// Step to the next record.
    Next,
    /// Step to the previous record.
    Prev,
}

/// Iterator over log records. Callers hold the log region mutex across
/// each `get`.
#[derive(Debug, Default)]
pub struct LogCursor {
    cur: Option<(Lsn, RecordHeader)>,
}

impl LogCursor {
    pub fn new() -> Self {
        LogCursor { cur: None }
    }

    /// The LSN of the current record, if positioned.
    pub fn position(&self) -> Option<Lsn> {
        self.cur.map(|(lsn, _)| lsn)
    }

    /// Fetch a record. Returns its LSN and body.
    pub fn get(&mut self, lm: &mut LogManager, op: CursorOp) -> Result<(Lsn, Vec<u8>)> {
        let target = match op {
            CursorOp::Set(lsn) => lsn,
            CursorOp::First => Lsn::new(lm.first_file()?, 0),
            CursorOp::Last => lm.last_record_lsn(),
            CursorOp::Next => {
                let (lsn, hdr) = self
                    .cur
                    .ok_or_else(|| Error::Invalid("cursor not positioned".into()))?;
                let next = Lsn::new(lsn.file, lsn.offset + hdr.length);
                match lm.read_record(next) {
                    Ok((hdr, body)) => {
                        self.cur = Some((next, hdr));
                        return Ok((next, body));
                    }
                    Err(Error::NotFound) if next.file < lm.current_lsn().file => {
                        // The file ended; the next record is the first
                        // real record of the following file, past its
                        // header record.
                        Lsn::new(next.file + 1, LOG_FILE_HDR_REC)
                    }
                    Err(e) => return Err(e),
                }
            }
            CursorOp::Prev => {
                let (lsn, hdr) = self
                    .cur
                    .ok_or_else(|| Error::Invalid("cursor not positioned".into()))?;
                if lsn.offset == 0 {
                    // A file header record; its back-link names the last
                    // record of the previous file.
                    if lsn.file <= 1 {
                        return Err(Error::NotFound);
                    }
                    Lsn::new(lsn.file - 1, hdr.prev_offset)
                } else {
                    Lsn::new(lsn.file, hdr.prev_offset)
                }
            }
        };

        let (hdr, body) = lm.read_record(target)?;
        self.cur = Some((target, hdr));
        Ok((target, body))
    }
}

/// Walk backward from `from` to the nearest record replication VERIFY can
/// rendezvous on: a transaction resolution or a checkpoint. The starting
/// record itself is not considered.
pub fn log_backup(lm: &mut LogManager, from: Lsn) -> Result<Lsn> {
    let mut cursor = LogCursor::new();
    cursor.get(lm, CursorOp::Set(from))?;
    loop {
        let (lsn, body) = cursor.get(lm, CursorOp::Prev)?;
        if lsn.offset == 0 {
            // File header record; keep walking.
            continue;
        }
        match rectype_of(&body) {
            RecordType::TxnRegop | RecordType::TxnCkp => return Ok(lsn),
            _ => {}
        }
    }
}

impl LogManager {
    /// The oldest log file still present, or the current file when the
    /// log has never been written to disk.
    pub fn first_file(&self) -> Result<u32> {
        Ok(self.first_file_number()?.unwrap_or(self.current_lsn().file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::records::{encode_noop, TxnRegopArgs, TXN_COMMIT};
    use crate::log::PutFlag;

    fn open_log(dir: &std::path::Path, max: u32) -> LogManager {
        LogManager::open(dir, max, 4096, 512, 1).unwrap()
    }

    #[test]
    fn test_cursor_forward_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);

        let mut lsns = Vec::new();
        for i in 0..4u8 {
            lsns.push(lm.put(&vec![i; 20], PutFlag::None, &[]).unwrap());
        }

        let mut c = LogCursor::new();
        let (lsn, body) = c.get(&mut lm, CursorOp::Set(lsns[0])).unwrap();
        assert_eq!(lsn, lsns[0]);
        assert_eq!(body, vec![0u8; 20]);

        for (i, expect) in lsns.iter().enumerate().skip(1) {
            let (lsn, body) = c.get(&mut lm, CursorOp::Next).unwrap();
            assert_eq!(lsn, *expect);
            assert_eq!(body, vec![i as u8; 20]);
        }
        assert!(matches!(c.get(&mut lm, CursorOp::Next), Err(Error::NotFound)));

        // And back down.
        for (i, expect) in lsns.iter().enumerate().rev().skip(1) {
            let (lsn, body) = c.get(&mut lm, CursorOp::Prev).unwrap();
            assert_eq!(lsn, *expect);
            assert_eq!(body, vec![i as u8; 20]);
        }
    }

    #[test]
    fn test_cursor_crosses_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 256);

        let mut lsns = Vec::new();
        for i in 0..12u8 {
            lsns.push(lm.put(&vec![i; 40], PutFlag::None, &[]).unwrap());
        }
        let boundary = lsns.iter().position(|l| l.file == 2).unwrap();

        // Forward across the rollover skips the header record.
        let mut c = LogCursor::new();
        c.get(&mut lm, CursorOp::Set(lsns[boundary - 1])).unwrap();
        let (lsn, body) = c.get(&mut lm, CursorOp::Next).unwrap();
        assert_eq!(lsn, lsns[boundary]);
        assert_eq!(body, vec![boundary as u8; 40]);

        // Backward crosses via the header's back-link.
        let (lsn, _) = c.get(&mut lm, CursorOp::Prev).unwrap();
        assert_eq!(lsn, Lsn::new(2, 0));
        let (lsn, body) = c.get(&mut lm, CursorOp::Prev).unwrap();
        assert_eq!(lsn, lsns[boundary - 1]);
        assert_eq!(body, vec![(boundary - 1) as u8; 40]);
    }

    #[test]
    fn test_cursor_first_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        let mut last = Lsn::ZERO;
        for i in 0..3u8 {
            last = lm.put(&vec![i; 10], PutFlag::Flush, &[]).unwrap();
        }

        let mut c = LogCursor::new();
        let (lsn, _) = c.get(&mut lm, CursorOp::First).unwrap();
        assert_eq!(lsn, Lsn::new(1, 0));
        let (lsn, body) = c.get(&mut lm, CursorOp::Last).unwrap();
        assert_eq!(lsn, last);
        assert_eq!(body, vec![2u8; 10]);
    }

    #[test]
    fn test_log_backup_finds_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);

        lm.put(&encode_noop(1, Lsn::ZERO), PutFlag::None, &[]).unwrap();
        let commit = TxnRegopArgs {
            txnid: 1,
            prev_lsn: Lsn::ZERO,
            opcode: TXN_COMMIT,
            timestamp: 0,
        };
        let commit_lsn = lm.put(&commit.encode(), PutFlag::None, &[]).unwrap();
        lm.put(&encode_noop(2, Lsn::ZERO), PutFlag::None, &[]).unwrap();
        let last = lm.put(&encode_noop(2, Lsn::ZERO), PutFlag::None, &[]).unwrap();

        assert_eq!(log_backup(&mut lm, last).unwrap(), commit_lsn);
    }

    #[test]
    fn test_log_backup_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        let last = lm.put(&encode_noop(1, Lsn::ZERO), PutFlag::None, &[]).unwrap();
        assert!(matches!(
            log_backup(&mut lm, last),
            Err(Error::NotFound)
        ));
    }
}
