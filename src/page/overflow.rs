//! Overflow-chain storage for large keys and data.
//!
//! A key or data item too big for a slot is stored on a linked chain of
//! overflow pages, each holding up to `page_size - header` payload bytes.
//! The referencing slot keeps only the chain head and the total length.
//! The head page carries a reference count so duplicate sets can share
//! one chain; deleting a reference decrements, and the chain is freed
//! only when the count reaches zero.
//!
//! These routines run inside an access-method operation and reach the
//! environment through [`OvContext`], which supplies page pins, page
//! allocation, and transactional logging.

use std::cmp::Ordering;

use crate::db::{Dbt, DbtMode};
use crate::log::records::{BigArgs, OvrefArgs, OP_ADD, OP_REM};
use crate::log::Lsn;
use crate::mpool::PagePin;
use crate::page::{self, init_page, PageType, PAGE_HDR_SIZE, PGNO_INVALID};
use crate::{Error, Result};

/// Environment services an overflow operation needs: the page cache, a
/// page allocator, and the transaction's log chain.
pub trait OvContext {
    fn page_size(&self) -> u32;
    /// dbreg id of the database file, for log records.
    fn fileid(&self) -> i32;
    fn txnid(&self) -> u32;
    /// LSN of the enclosing transaction's previous record.
    fn prev_lsn(&self) -> Lsn;
    /// True when edits are logged (master side); replication clients and
    /// recovery apply without logging.
    fn logging(&self) -> bool;
    /// Append an encoded record body, linking it into the transaction
    /// chain, and return its LSN.
    fn log_put(&mut self, body: &[u8]) -> Result<Lsn>;
    fn fget(&self, pgno: u32, create: bool) -> Result<PagePin>;
    fn fput(&self, pin: PagePin, dirty: bool);
    /// Allocate a fresh page and pin it.
    fn new_page(&mut self) -> Result<PagePin>;
    /// Return a page to the file's free list.
    fn free_page(&mut self, pin: PagePin) -> Result<()>;
}

/// Build an overflow chain holding `data`, returning the head page
/// number. One `big` record is logged per page.
pub fn build_overflow(ctx: &mut dyn OvContext, data: &[u8]) -> Result<u32> {
    let pagespace = page::max_overflow_space(ctx.page_size());
    let mut first = PGNO_INVALID;
    let mut last: Option<PagePin> = None;

    let mut rest = data;
    loop {
        let chunk = &rest[..rest.len().min(pagespace)];
        let pin = ctx.new_page()?;
        let pgno = pin.pgno();
        let last_pgno = last.as_ref().map_or(PGNO_INVALID, |p| p.pgno());

        if ctx.logging() {
            let prevlsn = match &last {
                Some(p) => page::lsn(&p.read()),
                None => Lsn::ZERO,
            };
            let args = BigArgs {
                txnid: ctx.txnid(),
                prev_lsn: ctx.prev_lsn(),
                opcode: OP_ADD,
                fileid: ctx.fileid(),
                pgno,
                prev_pgno: last_pgno,
                next_pgno: PGNO_INVALID,
                data: chunk.to_vec(),
                pagelsn: page::lsn(&pin.read()),
                prevlsn,
                nextlsn: Lsn::ZERO,
            };
            let new_lsn = ctx.log_put(&args.encode())?;
            if let Some(p) = &last {
                page::set_lsn(&mut p.write(), new_lsn);
            }
            page::set_lsn(&mut pin.write(), new_lsn);
        }

        {
            let mut buf = pin.write();
            let saved_lsn = page::lsn(&buf);
            init_page(&mut buf, pgno, last_pgno, PGNO_INVALID, 0, PageType::Overflow);
            page::set_lsn(&mut buf, saved_lsn);
            page::set_ov_len(&mut buf, chunk.len() as u16);
            page::set_ov_ref(&mut buf, 1);
            buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + chunk.len()].copy_from_slice(chunk);
        }

        if let Some(p) = last.take() {
            page::set_next_pgno(&mut p.write(), pgno);
            ctx.fput(p, true);
        } else {
            first = pgno;
        }
        last = Some(pin);

        if rest.len() <= pagespace {
            break;
        }
        rest = &rest[pagespace..];
    }

    if let Some(p) = last {
        ctx.fput(p, true);
    }
    Ok(first)
}

/// Read an overflow chain into `dbt`, honoring partial gets and the
/// caller's memory mode.
pub fn read_overflow(ctx: &mut dyn OvContext, dbt: &mut Dbt, tlen: u32, first: u32) -> Result<()> {
    let (start, needed) = if dbt.partial {
        (dbt.doff, dbt.dlen.min(tlen.saturating_sub(dbt.doff)))
    } else {
        (0, tlen)
    };

    match dbt.mode {
        DbtMode::UserMem { ulen } => {
            if needed > ulen {
                dbt.size = needed;
                return Err(Error::BufferSmall(needed));
            }
            dbt.data.clear();
            dbt.data.reserve(needed as usize);
        }
        DbtMode::Alloc => {
            dbt.data = Vec::with_capacity(needed as usize);
        }
        DbtMode::Realloc | DbtMode::Scratch => {
            dbt.data.clear();
            dbt.data.reserve(needed as usize);
        }
    }
    dbt.size = needed;

    let mut pgno = first;
    let mut curoff = 0u32;
    let mut left = needed;
    while pgno != PGNO_INVALID && left > 0 {
        let pin = ctx.fget(pgno, false)?;
        let wrong_type;
        {
            let buf = pin.read();
            wrong_type = page::ptype(&buf) != PageType::Overflow;
            if !wrong_type {
                let len = page::ov_len(&buf) as u32;
                if curoff + len > start {
                    let skip = start.saturating_sub(curoff);
                    let take = (len - skip).min(left);
                    let src = PAGE_HDR_SIZE + skip as usize;
                    dbt.data
                        .extend_from_slice(&buf[src..src + take as usize]);
                    left -= take;
                }
                curoff += len;
                pgno = page::next_pgno(&buf);
            }
        }
        if wrong_type {
            ctx.fput(pin, false);
            return Err(Error::Corrupt(format!(
                "page {} in overflow chain has wrong type",
                pgno
            )));
        }
        ctx.fput(pin, false);
    }
    Ok(())
}

/// Adjust the reference count on an overflow chain head.
pub fn adjust_ovref(ctx: &mut dyn OvContext, pgno: u32, adjust: i32) -> Result<()> {
    let pin = ctx.fget(pgno, false)?;
    if ctx.logging() {
        let args = OvrefArgs {
            txnid: ctx.txnid(),
            prev_lsn: ctx.prev_lsn(),
            fileid: ctx.fileid(),
            pgno,
            adjust,
            pagelsn: page::lsn(&pin.read()),
        };
        let new_lsn = ctx.log_put(&args.encode())?;
        page::set_lsn(&mut pin.write(), new_lsn);
    }
    let underflow;
    {
        let mut buf = pin.write();
        let cur = page::ov_ref(&buf) as i32;
        let next = cur + adjust;
        underflow = next < 0;
        if !underflow {
            page::set_ov_ref(&mut buf, next as u16);
        }
    }
    if underflow {
        ctx.fput(pin, true);
        return Err(Error::Corrupt(format!(
            "overflow page {} refcount underflow",
            pgno
        )));
    }
    ctx.fput(pin, true);
    Ok(())
}

/// Delete one reference to an overflow chain. With other references
/// outstanding this only decrements the head count; the last reference
/// frees every page, logging one `big` removal per page.
pub fn delete_overflow_chain(ctx: &mut dyn OvContext, first: u32) -> Result<()> {
    let mut pgno = first;
    loop {
        let pin = ctx.fget(pgno, false)?;
        if page::ptype(&pin.read()) != PageType::Overflow {
            ctx.fput(pin, false);
            return Err(Error::Corrupt(format!(
                "page {} in overflow chain has wrong type",
                pgno
            )));
        }

        if page::ov_ref(&pin.read()) > 1 {
            ctx.fput(pin, false);
            return adjust_ovref(ctx, pgno, -1);
        }

        if ctx.logging() {
            let (payload, pagelsn, prev, next) = {
                let buf = pin.read();
                let len = page::ov_len(&buf) as usize;
                (
                    buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + len].to_vec(),
                    page::lsn(&buf),
                    page::prev_pgno(&buf),
                    page::next_pgno(&buf),
                )
            };
            let args = BigArgs {
                txnid: ctx.txnid(),
                prev_lsn: ctx.prev_lsn(),
                opcode: OP_REM,
                fileid: ctx.fileid(),
                pgno,
                prev_pgno: prev,
                next_pgno: next,
                data: payload,
                pagelsn,
                prevlsn: Lsn::ZERO,
                nextlsn: Lsn::ZERO,
            };
            let new_lsn = ctx.log_put(&args.encode())?;
            page::set_lsn(&mut pin.write(), new_lsn);
        }

        let next = page::next_pgno(&pin.read());
        ctx.free_page(pin)?;
        if next == PGNO_INVALID {
            break;
        }
        pgno = next;
    }
    Ok(())
}

/// Compare `key` against an overflow chain. Without a comparator the
/// chain is compared chunk-at-a-time; a user comparator sees the whole
/// materialized item.
pub fn match_overflow(
    ctx: &mut dyn OvContext,
    key: &[u8],
    first: u32,
    tlen: u32,
    cmp: Option<&dyn Fn(&[u8], &[u8]) -> Ordering>,
) -> Result<Ordering> {
    if let Some(cmp) = cmp {
        let mut dbt = Dbt::alloc();
        read_overflow(ctx, &mut dbt, tlen, first)?;
        return Ok(cmp(key, &dbt.data));
    }

    let mut pgno = first;
    let mut key_left = key.len();
    let mut chain_left = tlen as usize;
    let mut kpos = 0usize;
    while key_left > 0 && pgno != PGNO_INVALID {
        let pin = ctx.fget(pgno, false)?;
        let (ord, len, next) = {
            let buf = pin.read();
            let len = page::ov_len(&buf) as usize;
            let n = len.min(key_left);
            let ord = key[kpos..kpos + n].cmp(&buf[PAGE_HDR_SIZE..PAGE_HDR_SIZE + n]);
            (ord, n, page::next_pgno(&buf))
        };
        ctx.fput(pin, false);
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        kpos += len;
        key_left -= len;
        chain_left -= len;
        pgno = next;
    }
    Ok(if key_left > 0 {
        Ordering::Greater
    } else if chain_left > 0 {
        Ordering::Less
    } else {
        Ordering::Equal
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpool::{GetFlag, Mpool};
    use crate::page::codec::CodecCtx;

    const PS: u32 = 512;

    /// Minimal unlogged context over a real pool, allocating pages
    /// sequentially and tracking frees.
    struct TestCtx {
        pool: Mpool,
        mpf: crate::mpool::MpfId,
        next_pgno: u32,
        freed: Vec<u32>,
    }

    impl TestCtx {
        fn new(dir: &std::path::Path) -> Self {
            let pool = Mpool::new(256);
            let ctx = CodecCtx {
                page_size: PS,
                needs_swap: false,
            };
            let mpf = pool.fopen(&dir.join("ov.db"), PS, ctx, None);
            TestCtx {
                pool,
                mpf,
                next_pgno: 1,
                freed: Vec::new(),
            }
        }
    }

    impl OvContext for TestCtx {
        fn page_size(&self) -> u32 {
            PS
        }
        fn fileid(&self) -> i32 {
            1
        }
        fn txnid(&self) -> u32 {
            0
        }
        fn prev_lsn(&self) -> Lsn {
            Lsn::ZERO
        }
        fn logging(&self) -> bool {
            false
        }
        fn log_put(&mut self, _body: &[u8]) -> Result<Lsn> {
            Ok(Lsn::ZERO)
        }
        fn fget(&self, pgno: u32, create: bool) -> Result<PagePin> {
            self.pool.fget(
                self.mpf,
                pgno,
                if create { GetFlag::Create } else { GetFlag::None },
            )
        }
        fn fput(&self, pin: PagePin, dirty: bool) {
            self.pool.fput(pin, dirty);
        }
        fn new_page(&mut self) -> Result<PagePin> {
            let pgno = self.next_pgno;
            self.next_pgno += 1;
            self.pool.fget(self.mpf, pgno, GetFlag::Create)
        }
        fn free_page(&mut self, pin: PagePin) -> Result<()> {
            self.freed.push(pin.pgno());
            self.pool.fput(pin, true);
            Ok(())
        }
    }

    #[test]
    fn test_build_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let first = build_overflow(&mut ctx, &data).unwrap();
        let mut dbt = Dbt::alloc();
        read_overflow(&mut ctx, &mut dbt, data.len() as u32, first).unwrap();
        assert_eq!(dbt.size as usize, data.len());
        assert_eq!(dbt.data, data);
    }

    #[test]
    fn test_chain_structure() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let space = page::max_overflow_space(PS);
        let data = vec![0x77u8; space * 2 + 5];

        let first = build_overflow(&mut ctx, &data).unwrap();

        // Walk the chain: three pages, forward and backward links agree,
        // lengths sum to the total.
        let mut pgno = first;
        let mut prev = PGNO_INVALID;
        let mut total = 0u32;
        let mut count = 0;
        while pgno != PGNO_INVALID {
            let pin = ctx.fget(pgno, false).unwrap();
            let buf = pin.read();
            assert_eq!(page::ptype(&buf), PageType::Overflow);
            assert_eq!(page::prev_pgno(&buf), prev);
            if count == 0 {
                assert_eq!(page::ov_ref(&buf), 1);
            }
            total += page::ov_len(&buf) as u32;
            prev = pgno;
            pgno = page::next_pgno(&buf);
            drop(buf);
            ctx.fput(pin, false);
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(total as usize, data.len());
    }

    #[test]
    fn test_partial_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 97) as u8).collect();
        let first = build_overflow(&mut ctx, &data).unwrap();

        let mut dbt = Dbt::alloc().with_partial(700, 300);
        read_overflow(&mut ctx, &mut dbt, data.len() as u32, first).unwrap();
        assert_eq!(dbt.size, 300);
        assert_eq!(dbt.data, &data[700..1000]);
    }

    #[test]
    fn test_user_buffer_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let data = vec![1u8; 1000];
        let first = build_overflow(&mut ctx, &data).unwrap();

        let mut dbt = Dbt::user_mem(100);
        match read_overflow(&mut ctx, &mut dbt, 1000, first) {
            Err(Error::BufferSmall(needed)) => {
                assert_eq!(needed, 1000);
                assert_eq!(dbt.size, 1000);
            }
            other => panic!("expected BufferSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_delete_frees_whole_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let data = vec![9u8; 1500];
        let first = build_overflow(&mut ctx, &data).unwrap();

        delete_overflow_chain(&mut ctx, first).unwrap();
        // 1500 bytes on 480-byte pages: 4 pages, all freed.
        assert_eq!(ctx.freed.len(), 4);
        assert_eq!(ctx.freed[0], first);
    }

    #[test]
    fn test_shared_chain_decrements_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let data = vec![3u8; 600];
        let first = build_overflow(&mut ctx, &data).unwrap();

        // Second reference, as a shared duplicate key would hold.
        adjust_ovref(&mut ctx, first, 1).unwrap();

        delete_overflow_chain(&mut ctx, first).unwrap();
        assert!(ctx.freed.is_empty());
        let pin = ctx.fget(first, false).unwrap();
        assert_eq!(page::ov_ref(&pin.read()), 1);
        ctx.fput(pin, false);

        // Last reference frees.
        delete_overflow_chain(&mut ctx, first).unwrap();
        assert_eq!(ctx.freed.len(), 2);
    }

    #[test]
    fn test_match_overflow_orders() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let stored = b"mmmmmm".repeat(200);
        let first = build_overflow(&mut ctx, &stored).unwrap();
        let tlen = stored.len() as u32;

        assert_eq!(
            match_overflow(&mut ctx, &stored, first, tlen, None).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            match_overflow(&mut ctx, b"a", first, tlen, None).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            match_overflow(&mut ctx, b"z", first, tlen, None).unwrap(),
            Ordering::Greater
        );
        // Prefix of the stored value: shorter sorts first.
        assert_eq!(
            match_overflow(&mut ctx, &stored[..100], first, tlen, None).unwrap(),
            Ordering::Less
        );

        // User comparator sees the materialized chain.
        let reverse = |a: &[u8], b: &[u8]| b.cmp(a);
        assert_eq!(
            match_overflow(&mut ctx, b"a", first, tlen, Some(&reverse)).unwrap(),
            Ordering::Greater
        );
    }
}
