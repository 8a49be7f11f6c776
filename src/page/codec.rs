//! Host ↔ disk page conversion.
//!
//! Pages are canonically big-endian. A database file created by an
//! opposite-convention build is detected at open time by a byte-swapped
//! metadata magic; every page of such a file is converted in place as it
//! moves through the buffer cache: [`PageIo::page_in`] after a read,
//! [`PageIo::page_out`] before a write. When `needs_swap` is false both
//! are no-ops.
//!
//! Meta pages swap a fixed field prefix and then a method-specific tail
//! of `u32` fields. Slotted pages swap the header and then walk `inp[]`
//! to find and swap each item's embedded integers (overflow items carry a
//! page number and total length; duplicate items carry a root page).
//! Hash is the one method whose `page_in` also writes: a never-written
//! page (type zero, invalid stored page number) is initialized as an
//! empty hash data page in place.

use crate::page::{
    self, init_page, PageType, BKEYDATA_OVERHEAD, B_DUPLICATE, B_KEYDATA, B_OVERFLOW,
    M_FLAGS, M_FREE, M_KEY_COUNT, M_LAST_PGNO, M_MAGIC, M_NPARTS, M_PAGESIZE, M_RECORD_COUNT,
    M_ROOT, M_TAIL, M_VERSION, PAGE_HDR_SIZE, PGNO_INVALID,
};
use crate::{Error, Result};

/// Conversion context handed to the page-io hooks.
#[derive(Debug, Clone, Copy)]
pub struct CodecCtx {
    pub page_size: u32,
    /// True when the file's integers are byte-swapped relative to the
    /// canonical layout.
    pub needs_swap: bool,
}

/// Per-access-method page conversion hooks, installed on a database at
/// open time and called by the buffer cache.
pub trait PageIo: Send + Sync {
    /// Convert a page that was just read from disk.
    fn page_in(&self, ctx: &CodecCtx, pgno: u32, page: &mut [u8]) -> Result<()>;
    /// Convert a page that is about to be written to disk.
    fn page_out(&self, ctx: &CodecCtx, pgno: u32, page: &mut [u8]) -> Result<()>;
}

fn swap16(page: &mut [u8], off: usize) {
    page.swap(off, off + 1);
}

fn swap32(page: &mut [u8], off: usize) {
    page.swap(off, off + 3);
    page.swap(off + 1, off + 2);
}

fn swap_header(page: &mut [u8]) {
    swap32(page, 0); // lsn.file
    swap32(page, 4); // lsn.offset
    swap32(page, 8); // pgno
    swap32(page, 12); // prev
    swap32(page, 16); // next
    swap16(page, 20); // entries
    swap16(page, 22); // hoffset
}

/// Swap a slotted page in place. `pgin` is true when converting from the
/// foreign order, which determines whether the entry count is readable
/// before or after the header swap.
fn swap_slotted(page: &mut [u8], pgin: bool) -> Result<()> {
    if pgin {
        swap_header(page);
    }
    let n = page::entries(page) as usize;
    if PAGE_HDR_SIZE + 2 * n > page.len() {
        return Err(Error::Corrupt(format!(
            "entry count {} overruns page during conversion",
            n
        )));
    }
    for i in 0..n {
        if pgin {
            swap16(page, PAGE_HDR_SIZE + 2 * i);
        }
        let off = page::inp(page, i) as usize;
        if off + BKEYDATA_OVERHEAD > page.len() {
            return Err(Error::Corrupt(format!(
                "slot {} offset {} overruns page during conversion",
                i, off
            )));
        }
        match page::b_type(page[off + 2]) {
            B_KEYDATA => swap16(page, off),
            B_OVERFLOW => {
                swap32(page, off + 4); // pgno
                swap32(page, off + 8); // tlen
            }
            B_DUPLICATE => swap32(page, off + 4), // root
            t => {
                return Err(Error::Corrupt(format!(
                    "unknown item type {} during conversion",
                    t
                )))
            }
        }
        if !pgin {
            swap16(page, PAGE_HDR_SIZE + 2 * i);
        }
    }
    if !pgin {
        swap_header(page);
    }
    Ok(())
}

/// Swap a metadata page: the fixed prefix, then `tail_words` u32 fields
/// of method-specific metadata.
fn swap_meta(page: &mut [u8], tail_words: usize) {
    swap32(page, 0);
    swap32(page, 4);
    swap32(page, 8);
    swap32(page, M_MAGIC);
    swap32(page, M_VERSION);
    swap32(page, M_PAGESIZE);
    swap32(page, M_FREE);
    swap32(page, M_LAST_PGNO);
    swap32(page, M_NPARTS);
    swap32(page, M_KEY_COUNT);
    swap32(page, M_RECORD_COUNT);
    swap32(page, M_FLAGS);
    swap32(page, M_ROOT);
    for i in 0..tail_words {
        swap32(page, M_TAIL + 4 * i);
    }
}

/// Words in the B-tree meta tail (minkey, re_len, re_pad).
const BTREE_META_TAIL: usize = 3;
/// Words in the hash meta tail (max_bucket, high_mask, low_mask, ffactor,
/// h_charkey).
const HASH_META_TAIL: usize = 5;
/// Words in the queue meta tail (re_len, re_pad, rec_page, first_recno,
/// cur_recno).
const QUEUE_META_TAIL: usize = 5;

fn swap_by_type(page: &mut [u8], pgin: bool) -> Result<()> {
    match page::ptype(page) {
        PageType::BtreeMeta => {
            swap_meta(page, BTREE_META_TAIL);
            Ok(())
        }
        PageType::HashMeta => {
            swap_meta(page, HASH_META_TAIL);
            Ok(())
        }
        PageType::QueueMeta => {
            swap_meta(page, QUEUE_META_TAIL);
            Ok(())
        }
        t if t.is_slotted() => swap_slotted(page, pgin),
        // Overflow and unwritten pages keep their integers in the header.
        _ => {
            swap_header(page);
            Ok(())
        }
    }
}

/// Dispatch to the right swap for a page arriving from disk. The type
/// byte is unaffected by swapping, so it can be read either way.
fn swap_in(page: &mut [u8]) -> Result<()> {
    // Meta pages are recognizable before the swap; slotted swaps handle
    // their own ordering.
    swap_by_type(page, true)
}

fn swap_out(page: &mut [u8]) -> Result<()> {
    swap_by_type(page, false)
}

/// B-tree page conversion.
pub struct BtreeCodec;

impl PageIo for BtreeCodec {
    fn page_in(&self, ctx: &CodecCtx, _pgno: u32, page: &mut [u8]) -> Result<()> {
        if !ctx.needs_swap {
            return Ok(());
        }
        swap_in(page)
    }

    fn page_out(&self, ctx: &CodecCtx, _pgno: u32, page: &mut [u8]) -> Result<()> {
        if !ctx.needs_swap {
            return Ok(());
        }
        swap_out(page)
    }
}

/// Hash page conversion; also initializes never-written pages.
pub struct HashCodec;

impl PageIo for HashCodec {
    fn page_in(&self, ctx: &CodecCtx, pgno: u32, page: &mut [u8]) -> Result<()> {
        if ctx.needs_swap {
            swap_in(page)?;
        }
        // Page never written: zero type, bogus stored page number.
        if page::ptype(page) == PageType::Invalid
            && page::pgno(page) == PGNO_INVALID
            && pgno != PGNO_INVALID
        {
            init_page(page, pgno, PGNO_INVALID, PGNO_INVALID, 0, PageType::Hash);
        }
        Ok(())
    }

    fn page_out(&self, ctx: &CodecCtx, _pgno: u32, page: &mut [u8]) -> Result<()> {
        if !ctx.needs_swap {
            return Ok(());
        }
        swap_out(page)
    }
}

/// Queue page conversion.
pub struct QueueCodec;

impl PageIo for QueueCodec {
    fn page_in(&self, ctx: &CodecCtx, _pgno: u32, page: &mut [u8]) -> Result<()> {
        if !ctx.needs_swap {
            return Ok(());
        }
        if page::ptype(page) == PageType::QueueMeta {
            swap_meta(page, QUEUE_META_TAIL);
        }
        // Queue data pages hold fixed-length records with no embedded
        // integers beyond the header.
        else {
            swap_header(page);
        }
        Ok(())
    }

    fn page_out(&self, ctx: &CodecCtx, pgno: u32, page: &mut [u8]) -> Result<()> {
        self.page_in(ctx, pgno, page)
    }
}

/// Decide whether a file needs conversion from its stored meta magic.
/// Returns `None` when the magic matches neither byte order.
pub fn needs_swap_from_magic(stored: u32, expected: u32) -> Option<bool> {
    if stored == expected {
        Some(false)
    } else if stored == expected.swap_bytes() {
        Some(true)
    } else {
        None
    }
}
