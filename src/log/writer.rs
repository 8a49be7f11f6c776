//! Log append, buffering, and flush.
//!
//! [`LogManager`] owns the log region state: the current end-of-log LSN,
//! the shared in-memory buffer, and the on-disk write offset. Appends go
//! through the buffer; the buffer is written when it fills, when the log
//! rolls over to a new file, and on an explicit flush. Flushes are
//! prefix-closed: syncing through an LSN makes every earlier record
//! durable as well.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::log::{
    legacy_log_file_name, log_file_name, FileHeader, Lsn, LogStats, PutFlag, RecordHeader,
    LOG_FILE_HDR_REC, LOG_HDR_SIZE, LOG_MAGIC, LOG_VERSION,
};
use crate::{Error, Result};

/// The log region: append/flush state shared by every handle in the
/// environment. Callers hold the log region mutex around every method.
pub struct LogManager {
    dir: PathBuf,
    max_file_size: u32,
    pagesize: u32,
    log_id: u32,

    /// Next record position; the end of the log.
    lsn: Lsn,
    /// Length of the most recently written record.
    len: u32,
    /// LSN of the record owning the first byte of the buffer.
    f_lsn: Lsn,
    /// Everything strictly below this LSN is known durable.
    s_lsn: Lsn,
    /// On-disk write offset within the current file.
    w_off: u32,
    /// Checkpoint LSN recorded by the last CHECKPOINT put.
    chkpt_lsn: Lsn,

    buffer: Vec<u8>,
    buffer_size: usize,

    cur_file: Option<(u32, File)>,
    /// Set while recovery drives the log, suppressing open-file snapshots.
    pub recovering: bool,

    records: u64,
    bytes: u64,
    writes: u64,
    syncs: u64,
}

impl LogManager {
    /// Open the log in an environment directory, positioning at the end
    /// of any existing log.
    pub fn open(
        dir: &Path,
        max_file_size: u32,
        buffer_size: usize,
        pagesize: u32,
        log_id: u32,
    ) -> Result<Self> {
        let mut lm = LogManager {
            dir: dir.to_path_buf(),
            max_file_size,
            pagesize,
            log_id,
            lsn: Lsn::new(1, 0),
            len: 0,
            f_lsn: Lsn::new(1, 0),
            s_lsn: Lsn::new(1, 0),
            w_off: 0,
            chkpt_lsn: Lsn::ZERO,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            cur_file: None,
            recovering: false,
            records: 0,
            bytes: 0,
            writes: 0,
            syncs: 0,
        };
        if let Some(last) = lm.last_file_on_disk()? {
            lm.seek_end_of_file(last)?;
        }
        Ok(lm)
    }

    /// The LSN the next record will receive.
    pub fn current_lsn(&self) -> Lsn {
        self.lsn
    }

    /// The LSN of the most recently written record, or the end-of-log
    /// position when the log is empty.
    pub fn last_record_lsn(&self) -> Lsn {
        Lsn::new(self.lsn.file, self.lsn.offset - self.len)
    }

    /// LSN below which every record is durable.
    pub fn synced_lsn(&self) -> Lsn {
        self.s_lsn
    }

    /// Checkpoint LSN recorded by the last CHECKPOINT put.
    pub fn chkpt_lsn(&self) -> Lsn {
        self.chkpt_lsn
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> LogStats {
        LogStats {
            records: self.records,
            bytes: self.bytes,
            writes: self.writes,
            syncs: self.syncs,
            cur_lsn: self.lsn,
            synced_lsn: self.s_lsn,
            max_file_size: self.max_file_size,
        }
    }

    /// Append a record.
    ///
    /// `open_files` carries the pre-encoded dbreg snapshot records that
    /// are replayed at the head of every new log file and after a
    /// checkpoint record, so recovery's open-files pass can rebuild the
    /// registry from any starting point.
    pub fn put(&mut self, body: &[u8], flags: PutFlag, open_files: &[Vec<u8>]) -> Result<Lsn> {
        if flags == PutFlag::CurLsn {
            return Ok(self.lsn);
        }

        let rec_total = (LOG_HDR_SIZE + body.len()) as u32;

        // Roll to a new file if this record will not fit in the current
        // one.
        let mut lastoff = 0u32;
        if self.lsn.offset + rec_total > self.max_file_size {
            if rec_total + LOG_FILE_HDR_REC > self.max_file_size {
                return Err(Error::RecordTooLarge);
            }
            self.flush_internal(None)?;
            lastoff = self.lsn.offset;
            self.lsn.file += 1;
            self.lsn.offset = 0;
            self.w_off = 0;
        }

        let mut ret_lsn = self.lsn;

        // Every file begins with the persistent header; its prev link is
        // the offset of the last record in the previous file.
        if self.lsn.offset == 0 {
            let hdr = FileHeader {
                magic: LOG_MAGIC,
                version: LOG_VERSION,
                log_id: self.log_id,
                mode: 0o600,
                pagesize: self.pagesize,
                max_file_size: self.max_file_size,
            };
            let prev = if lastoff == 0 { 0 } else { lastoff - self.len };
            self.putr(&hdr.encode(), prev)?;
            if !self.recovering {
                for rec in open_files {
                    let prev = self.lsn.offset - self.len;
                    self.putr(rec, prev)?;
                }
            }
            ret_lsn = self.lsn;
        }

        let prev = self.lsn.offset - self.len;
        self.putr(body, prev)?;

        if flags == PutFlag::Checkpoint {
            self.chkpt_lsn = ret_lsn;
            if !self.recovering {
                for rec in open_files {
                    let prev = self.lsn.offset - self.len;
                    self.putr(rec, prev)?;
                }
            }
        }

        if flags == PutFlag::Flush || flags == PutFlag::Checkpoint {
            self.flush_internal(None)?;
        }

        Ok(ret_lsn)
    }

    /// Append a record at an exact LSN, used by the replication client to
    /// mirror the master's log byte-for-byte.
    pub fn rep_put(&mut self, lsn: Lsn, body: &[u8]) -> Result<Lsn> {
        if lsn != self.lsn {
            return Err(Error::Invalid(format!(
                "replicated record at {} but end-of-log is {}",
                lsn, self.lsn
            )));
        }
        let prev = self.lsn.offset - self.len;
        self.putr(body, prev)?;
        Ok(lsn)
    }

    /// Write the first file's header into a pristine log. A replication
    /// client calls this when the stream starts at the very beginning of
    /// the master's log.
    pub fn bootstrap_first_file(&mut self) -> Result<Lsn> {
        if self.lsn != Lsn::new(1, 0) {
            return Ok(self.lsn);
        }
        let hdr = FileHeader {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            log_id: self.log_id,
            mode: 0o600,
            pagesize: self.pagesize,
            max_file_size: self.max_file_size,
        };
        self.putr(&hdr.encode(), 0)?;
        Ok(self.lsn)
    }

    /// Discard the whole log and reposition at `lsn`, leaving a hole
    /// before it. Internal initialization uses this to continue the
    /// master's log from its current end after a wholesale page load.
    pub fn reset_to(&mut self, lsn: Lsn) -> Result<()> {
        self.buffer.clear();
        for n in self.scan_file_numbers()? {
            let _ = std::fs::remove_file(self.dir.join(log_file_name(n)));
        }
        self.cur_file = None;
        self.lsn = lsn;
        self.ensure_file()?;
        if let Some((_, f)) = &mut self.cur_file {
            f.set_len(lsn.offset as u64)
                .map_err(|e| Error::Io(format!("log reset: {}", e)))?;
        }
        self.len = 0;
        self.w_off = lsn.offset;
        self.f_lsn = lsn;
        self.s_lsn = lsn;
        Ok(())
    }

    /// Start a new log file, writing its persistent header. The client
    /// side of a NEWFILE message.
    pub fn newfile(&mut self) -> Result<Lsn> {
        self.flush_internal(None)?;
        let lastoff = self.lsn.offset;
        self.lsn.file += 1;
        self.lsn.offset = 0;
        self.w_off = 0;

        let hdr = FileHeader {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            log_id: self.log_id,
            mode: 0o600,
            pagesize: self.pagesize,
            max_file_size: self.max_file_size,
        };
        let prev = if lastoff == 0 { 0 } else { lastoff - self.len };
        self.putr(&hdr.encode(), prev)?;
        Ok(self.lsn)
    }

    fn putr(&mut self, body: &[u8], prev: u32) -> Result<()> {
        let hdr = RecordHeader {
            prev_offset: prev,
            length: (LOG_HDR_SIZE + body.len()) as u32,
            checksum: crc32c::crc32c(body),
        };
        let rec_lsn = self.lsn;
        self.fill(rec_lsn, &hdr.encode())?;
        self.len = LOG_HDR_SIZE as u32;
        self.lsn.offset += LOG_HDR_SIZE as u32;
        self.fill(rec_lsn, body)?;
        self.len += body.len() as u32;
        self.lsn.offset += body.len() as u32;
        self.records += 1;
        Ok(())
    }

    fn fill(&mut self, rec_lsn: Lsn, mut data: &[u8]) -> Result<()> {
        self.bytes += data.len() as u64;
        while !data.is_empty() {
            if self.buffer.is_empty() {
                self.f_lsn = rec_lsn;
            }

            // On a buffer boundary with at least a full buffer of data,
            // bypass the copy and write directly.
            if self.buffer.is_empty() && data.len() >= self.buffer_size {
                let n = (data.len() / self.buffer_size) * self.buffer_size;
                let (head, rest) = data.split_at(n);
                self.write_to_disk(head)?;
                data = rest;
                continue;
            }

            let room = self.buffer_size - self.buffer.len();
            let n = room.min(data.len());
            let (head, rest) = data.split_at(n);
            self.buffer.extend_from_slice(head);
            data = rest;

            if self.buffer.len() == self.buffer_size {
                let buf = std::mem::take(&mut self.buffer);
                self.write_to_disk(&buf)?;
                self.buffer = buf;
                self.buffer.clear();
            }
        }
        Ok(())
    }

    /// Write everything through `target` (or the whole log) to disk and
    /// sync. Returns immediately if already durable through `target`.
    pub fn flush(&mut self, target: Option<Lsn>) -> Result<()> {
        if let Some(t) = target {
            if t > self.last_record_lsn() {
                return Err(Error::Invalid(format!(
                    "flush target {} past end-of-log {}",
                    t, self.lsn
                )));
            }
        }
        self.flush_internal(target)
    }

    fn flush_internal(&mut self, target: Option<Lsn>) -> Result<()> {
        let target = target.unwrap_or_else(|| self.last_record_lsn());

        // s_lsn is the first byte not known to be on disk, so strictly
        // below means done.
        if target < self.s_lsn {
            return Ok(());
        }

        let mut wrote = false;
        if !self.buffer.is_empty() && target >= self.f_lsn {
            let buf = std::mem::take(&mut self.buffer);
            self.write_to_disk(&buf)?;
            self.buffer = buf;
            self.buffer.clear();
            wrote = true;
        }

        if self.cur_file.is_none() && !wrote {
            return Ok(());
        }

        if let Some((_, f)) = &mut self.cur_file {
            f.sync_all().map_err(|e| Error::Io(format!("log fsync: {}", e)))?;
            self.syncs += 1;
            self.s_lsn = Lsn::new(self.lsn.file, self.w_off);
        }
        Ok(())
    }

    fn write_to_disk(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_file()?;
        let w_off = self.w_off;
        let (_, f) = self.cur_file.as_mut().unwrap();
        f.seek(SeekFrom::Start(w_off as u64))
            .map_err(|e| Error::Io(format!("log seek: {}", e)))?;
        f.write_all(data)
            .map_err(|e| Error::Io(format!("log write: {}", e)))?;
        self.w_off += data.len() as u32;
        self.writes += 1;
        Ok(())
    }

    fn ensure_file(&mut self) -> Result<()> {
        let want = self.lsn.file;
        if let Some((n, _)) = &self.cur_file {
            if *n == want {
                return Ok(());
            }
        }
        let path = self.dir.join(log_file_name(want));
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("cannot open {}: {}", path.display(), e)))?;
        self.cur_file = Some((want, f));
        Ok(())
    }

    /// Read the record at `lsn`, stitching the on-disk prefix and the
    /// in-memory buffer when the record has not been flushed yet.
    pub fn read_record(&mut self, lsn: Lsn) -> Result<(RecordHeader, Vec<u8>)> {
        if lsn.file == 0 {
            return Err(Error::Invalid("zero LSN".into()));
        }
        if lsn.file > self.lsn.file
            || (lsn.file == self.lsn.file && lsn.offset >= self.lsn.offset)
        {
            return Err(Error::NotFound);
        }

        let mut hdr_buf = [0u8; LOG_HDR_SIZE];
        self.read_span(lsn.file, lsn.offset, &mut hdr_buf)?;
        let hdr = RecordHeader::parse(&hdr_buf)
            .ok_or_else(|| Error::Corrupt(format!("bad record header at {}", lsn)))?;
        if (hdr.length as usize) < LOG_HDR_SIZE || hdr.length > self.max_file_size {
            return Err(Error::Corrupt(format!(
                "implausible record length {} at {}",
                hdr.length, lsn
            )));
        }

        let body_len = hdr.length as usize - LOG_HDR_SIZE;
        let mut body = vec![0u8; body_len];
        self.read_span(lsn.file, lsn.offset + LOG_HDR_SIZE as u32, &mut body)?;

        if crc32c::crc32c(&body) != hdr.checksum {
            return Err(Error::Corrupt(format!("checksum mismatch at {}", lsn)));
        }
        Ok((hdr, body))
    }

    fn read_span(&mut self, file: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        if file == self.lsn.file {
            // May straddle the flushed prefix and the buffer.
            let disk_end = self.w_off;
            let buf_end = disk_end as usize + self.buffer.len();
            if offset as usize + out.len() > buf_end {
                return Err(Error::NotFound);
            }
            let mut filled = 0usize;
            if offset < disk_end {
                let n = ((disk_end - offset) as usize).min(out.len());
                self.read_file_span(file, offset, &mut out[..n])?;
                filled = n;
            }
            if filled < out.len() {
                let start = (offset as usize + filled) - disk_end as usize;
                let remaining = out.len() - filled;
                out[filled..].copy_from_slice(&self.buffer[start..start + remaining]);
            }
            Ok(())
        } else {
            self.read_file_span(file, offset, out)
        }
    }

    fn read_file_span(&mut self, file: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        if let Some((n, f)) = &mut self.cur_file {
            if *n == file {
                f.seek(SeekFrom::Start(offset as u64))
                    .map_err(|e| Error::Io(format!("log seek: {}", e)))?;
                return f
                    .read_exact(out)
                    .map_err(|_| Error::NotFound);
            }
        }
        let mut f = self.open_readonly(file)?;
        f.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| Error::Io(format!("log seek: {}", e)))?;
        f.read_exact(out).map_err(|_| Error::NotFound)
    }

    fn open_readonly(&self, file: u32) -> Result<File> {
        let modern = self.dir.join(log_file_name(file));
        match File::open(&modern) {
            Ok(f) => Ok(f),
            Err(_) => {
                // Accept the pre-5.0 name on read-only opens.
                let legacy = self.dir.join(legacy_log_file_name(file));
                File::open(&legacy).map_err(|_| Error::NotFound)
            }
        }
    }

    /// True when `file` has been removed or archived away, so a request
    /// for an LSN in it can never be served.
    pub fn is_outdated(&self, file: u32) -> Result<bool> {
        match self.first_file_number()? {
            Some(first) => Ok(file < first),
            None => Ok(false),
        }
    }

    fn scan_file_numbers(&self) -> Result<Vec<u32>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::Io(format!("cannot read {}: {}", self.dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Io(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix("log.") {
                if let Ok(n) = num.parse::<u32>() {
                    files.push(n);
                }
            }
        }
        files.sort_unstable();
        Ok(files)
    }

    pub(crate) fn first_file_number(&self) -> Result<Option<u32>> {
        Ok(self.scan_file_numbers()?.into_iter().next())
    }

    fn last_file_on_disk(&self) -> Result<Option<u32>> {
        Ok(self.scan_file_numbers()?.into_iter().last())
    }

    /// Walk an existing log file to its end, validating record headers,
    /// and position the region state there.
    fn seek_end_of_file(&mut self, file: u32) -> Result<()> {
        let mut f = self.open_readonly(file)?;
        let file_len = f
            .metadata()
            .map_err(|e| Error::Io(e.to_string()))?
            .len() as u32;

        let mut off = 0u32;
        let mut last_len = 0u32;
        loop {
            if off + LOG_HDR_SIZE as u32 > file_len {
                break;
            }
            let mut hdr_buf = [0u8; LOG_HDR_SIZE];
            f.seek(SeekFrom::Start(off as u64))
                .map_err(|e| Error::Io(e.to_string()))?;
            if f.read_exact(&mut hdr_buf).is_err() {
                break;
            }
            let hdr = match RecordHeader::parse(&hdr_buf) {
                Some(h) if h.length as usize >= LOG_HDR_SIZE => h,
                _ => break,
            };
            if off + hdr.length > file_len {
                break;
            }
            let mut body = vec![0u8; hdr.length as usize - LOG_HDR_SIZE];
            if f.read_exact(&mut body).is_err() {
                break;
            }
            if crc32c::crc32c(&body) != hdr.checksum {
                break;
            }
            last_len = hdr.length;
            off += hdr.length;
        }

        self.lsn = Lsn::new(file, off);
        self.len = last_len;
        self.w_off = off;
        self.s_lsn = Lsn::new(file, off);
        self.f_lsn = self.lsn;
        Ok(())
    }

    /// Truncate the log so the record at `lsn` is the last one. Later
    /// files are removed; the containing file is cut after the record.
    pub fn truncate_after(&mut self, lsn: Lsn) -> Result<()> {
        let (hdr, _) = self.read_record(lsn)?;
        self.flush_internal(None)?;
        self.buffer.clear();

        // Drop files beyond the truncation point.
        for n in self.scan_file_numbers()? {
            if n > lsn.file {
                let _ = std::fs::remove_file(self.dir.join(log_file_name(n)));
            }
        }

        let new_end = lsn.offset + hdr.length;
        self.cur_file = None;
        self.lsn = Lsn::new(lsn.file, new_end);
        self.ensure_file()?;
        if let Some((_, f)) = &mut self.cur_file {
            f.set_len(new_end as u64)
                .map_err(|e| Error::Io(format!("log truncate: {}", e)))?;
            f.sync_all().map_err(|e| Error::Io(e.to_string()))?;
        }
        self.len = hdr.length;
        self.w_off = new_end;
        self.f_lsn = self.lsn;
        if self.s_lsn > self.lsn {
            self.s_lsn = self.lsn;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::records::{encode_noop, DebugArgs};
    use crate::log::LOG_FILE_HDR_SIZE;

    fn open_log(dir: &Path, max: u32) -> LogManager {
        LogManager::open(dir, max, 4096, 512, 1).unwrap()
    }

    #[test]
    fn test_first_put_writes_file_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);

        let body = encode_noop(0, Lsn::ZERO);
        let lsn = lm.put(&body, PutFlag::Flush, &[]).unwrap();

        // The user record lands after the file header record.
        assert_eq!(lsn, Lsn::new(1, LOG_FILE_HDR_REC));

        let (_, hdr_body) = lm.read_record(Lsn::new(1, 0)).unwrap();
        let hdr = FileHeader::parse(&hdr_body).unwrap();
        assert_eq!(hdr.version, LOG_VERSION);
        assert_eq!(hdr.pagesize, 512);

        let (_, got) = lm.read_record(lsn).unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn test_curlsn_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        let before = lm.current_lsn();
        let got = lm.put(b"ignored", PutFlag::CurLsn, &[]).unwrap();
        assert_eq!(got, before);
        assert_eq!(lm.current_lsn(), before);
    }

    #[test]
    fn test_flush_is_prefix_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);

        let mut lsns = Vec::new();
        for i in 0..10u8 {
            let body = DebugArgs {
                txnid: 0,
                prev_lsn: Lsn::ZERO,
                msg: vec![i; 40],
            }
            .encode();
            lsns.push(lm.put(&body, PutFlag::None, &[]).unwrap());
        }
        lm.flush(Some(lsns[5])).unwrap();
        // Flushing through record 5 makes records 0..=5 durable; because
        // the buffer is written whole, everything earlier in the buffer
        // went with it.
        assert!(lm.synced_lsn() > lsns[5]);
    }

    #[test]
    fn test_rollover_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // Small max so a handful of records roll the file.
        let max = 256u32;
        let mut lm = open_log(dir.path(), max);

        let body = vec![0x5A; 52];
        // First record: header record (36) + this one.
        let lsn1 = lm.put(&body, PutFlag::None, &[]).unwrap();
        assert_eq!(lsn1.file, 1);

        // A record sized to land exactly at max_file_size fits.
        let fit = (max - lm.current_lsn().offset) as usize - LOG_HDR_SIZE;
        let lsn2 = lm.put(&vec![1u8; fit], PutFlag::None, &[]).unwrap();
        assert_eq!(lsn2.file, 1);
        assert_eq!(lm.current_lsn().offset, max);

        // One byte more rolls over.
        let lsn3 = lm.put(&[9u8], PutFlag::None, &[]).unwrap();
        assert_eq!(lsn3.file, 2);
        assert_eq!(lsn3.offset, LOG_FILE_HDR_REC);
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 256);
        let huge = vec![0u8; 512];
        assert!(matches!(
            lm.put(&huge, PutFlag::None, &[]),
            Err(Error::RecordTooLarge)
        ));
    }

    #[test]
    fn test_cross_file_backlink() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 256);

        let mut last_in_file1 = Lsn::ZERO;
        let mut first_in_file2 = Lsn::ZERO;
        for i in 0..20u8 {
            let lsn = lm.put(&vec![i; 40], PutFlag::None, &[]).unwrap();
            if lsn.file == 1 {
                last_in_file1 = lsn;
            } else if first_in_file2.is_zero() {
                first_in_file2 = lsn;
                break;
            }
        }
        assert_eq!(first_in_file2.file, 2);

        // The file-2 header record's prev link points at the last record
        // of file 1.
        let (hdr, body) = lm.read_record(Lsn::new(2, 0)).unwrap();
        assert!(FileHeader::parse(&body).is_some());
        assert_eq!(hdr.prev_offset, last_in_file1.offset);
    }

    #[test]
    fn test_reopen_finds_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let end;
        let last;
        {
            let mut lm = open_log(dir.path(), 1 << 20);
            for i in 0..5u8 {
                lm.put(&vec![i; 30], PutFlag::None, &[]).unwrap();
            }
            lm.flush(None).unwrap();
            end = lm.current_lsn();
            last = lm.last_record_lsn();
        }
        let mut lm = open_log(dir.path(), 1 << 20);
        assert_eq!(lm.current_lsn(), end);
        assert_eq!(lm.last_record_lsn(), last);
        // And appending still works.
        let lsn = lm.put(&[1, 2, 3], PutFlag::Flush, &[]).unwrap();
        assert_eq!(lsn, end);
    }

    #[test]
    fn test_truncate_after() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        let mut lsns = Vec::new();
        for i in 0..6u8 {
            lsns.push(lm.put(&vec![i; 25], PutFlag::None, &[]).unwrap());
        }
        lm.flush(None).unwrap();

        lm.truncate_after(lsns[2]).unwrap();
        assert_eq!(lm.last_record_lsn(), lsns[2]);
        assert!(lm.read_record(lsns[3]).is_err());
        let (_, body) = lm.read_record(lsns[2]).unwrap();
        assert_eq!(body, vec![2u8; 25]);

        // New appends continue from the truncation point.
        let lsn = lm.put(&[7u8; 25], PutFlag::Flush, &[]).unwrap();
        assert_eq!(lsn, lsns[3]);
    }

    #[test]
    fn test_rep_put_requires_exact_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        lm.put(&[1u8; 10], PutFlag::None, &[]).unwrap();
        let end = lm.current_lsn();
        assert!(lm.rep_put(Lsn::new(9, 9), &[0u8; 4]).is_err());
        lm.rep_put(end, &[0u8; 4]).unwrap();
        assert_eq!(lm.current_lsn().offset, end.offset + LOG_HDR_SIZE as u32 + 4);
    }

    #[test]
    fn test_newfile_starts_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut lm = open_log(dir.path(), 1 << 20);
        lm.put(&[1u8; 10], PutFlag::None, &[]).unwrap();
        let ready = lm.newfile().unwrap();
        assert_eq!(ready.file, 2);
        assert_eq!(ready.offset, LOG_FILE_HDR_REC);
        let (_, body) = lm.read_record(Lsn::new(2, 0)).unwrap();
        assert_eq!(body.len(), LOG_FILE_HDR_SIZE);
    }
}
