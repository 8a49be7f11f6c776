//! Page layout and access.
//!
//! Every page starts with the same 26-byte header, padded to 32 bytes:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | LSN of the newest logged edit |
//! | 8 | 4 | Page number |
//! | 12 | 4 | Previous page in the chain (0 if none) |
//! | 16 | 4 | Next page in the chain (0 if none) |
//! | 20 | 2 | Entry count (overflow pages: reference count) |
//! | 22 | 2 | Heap offset (overflow pages: payload length) |
//! | 24 | 1 | B-tree level |
//! | 25 | 1 | Page type |
//!
//! Slotted pages (leaf, duplicate, internal) carry an array of `u16`
//! offsets (`inp[]`) growing forward from the header and a heap of
//! variable-length items growing backward from the page end; the heap
//! offset marks the first in-use heap byte. Meta pages carry a distinct
//! layout parsed by [`MetaHeader`]. All integer fields are canonically
//! big-endian; [`codec`] converts opposite-order files in place.
//!
//! Field access is through the free functions in this module, which
//! operate directly on a borrowed page buffer.

pub mod codec;
pub mod dups;
pub mod overflow;
pub mod slots;

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::log::Lsn;

/// Size of the page header, padding included.
pub const PAGE_HDR_SIZE: usize = 32;
/// Invalid page number; also the metadata page of every file.
pub const PGNO_INVALID: u32 = 0;
/// Metadata page number.
pub const PGNO_BASE_MD: u32 = 0;

const P_LSN: usize = 0;
const P_PGNO: usize = 8;
const P_PREV: usize = 12;
const P_NEXT: usize = 16;
const P_ENTRIES: usize = 20;
const P_HOFFSET: usize = 22;
const P_LEVEL: usize = 24;
const P_TYPE: usize = 25;

/// Leaf pages are level 1; each level up is one step closer to the root.
pub const LEAFLEVEL: u8 = 1;

/// Page types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageType {
    /// Unwritten or unallocated page.
    Invalid,
    /// Hash data page.
    Hash,
    /// B-tree internal page.
    IBtree,
    /// B-tree leaf page.
    LBtree,
    /// Recno leaf page (also used for unsorted off-page duplicates).
    LRecno,
    /// Overflow-chain page.
    Overflow,
    /// Hash metadata page.
    HashMeta,
    /// B-tree metadata page.
    BtreeMeta,
    /// Queue metadata page.
    QueueMeta,
    /// Queue data page.
    QueueData,
    /// Sorted off-page duplicate leaf.
    LDup,
    /// Unknown type code.
    Unknown(u8),
}

impl PageType {
    /// Convert a raw type byte to a `PageType`.
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => PageType::Invalid,
            2 => PageType::Hash,
            3 => PageType::IBtree,
            5 => PageType::LBtree,
            6 => PageType::LRecno,
            7 => PageType::Overflow,
            8 => PageType::HashMeta,
            9 => PageType::BtreeMeta,
            11 => PageType::QueueMeta,
            12 => PageType::QueueData,
            13 => PageType::LDup,
            v => PageType::Unknown(v),
        }
    }

    /// The on-disk type code.
    pub fn code(&self) -> u8 {
        match self {
            PageType::Invalid => 0,
            PageType::Hash => 2,
            PageType::IBtree => 3,
            PageType::LBtree => 5,
            PageType::LRecno => 6,
            PageType::Overflow => 7,
            PageType::HashMeta => 8,
            PageType::BtreeMeta => 9,
            PageType::QueueMeta => 11,
            PageType::QueueData => 12,
            PageType::LDup => 13,
            PageType::Unknown(v) => *v,
        }
    }

    /// True for the three metadata page types.
    pub fn is_meta(&self) -> bool {
        matches!(
            self,
            PageType::BtreeMeta | PageType::HashMeta | PageType::QueueMeta
        )
    }

    /// True for slotted pages that carry an `inp[]` array.
    pub fn is_slotted(&self) -> bool {
        matches!(
            self,
            PageType::IBtree
                | PageType::LBtree
                | PageType::LRecno
                | PageType::LDup
                | PageType::Hash
        )
    }
}

/// Read the page LSN.
pub fn lsn(page: &[u8]) -> Lsn {
    Lsn::read_from(&page[P_LSN..])
}

/// Set the page LSN.
pub fn set_lsn(page: &mut [u8], lsn: Lsn) {
    lsn.write_to(&mut page[P_LSN..]);
}

/// Read the page number.
pub fn pgno(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[P_PGNO..])
}

/// Read the previous-page pointer.
pub fn prev_pgno(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[P_PREV..])
}

/// Set the previous-page pointer.
pub fn set_prev_pgno(page: &mut [u8], pgno: u32) {
    BigEndian::write_u32(&mut page[P_PREV..], pgno);
}

/// Read the next-page pointer.
pub fn next_pgno(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[P_NEXT..])
}

/// Set the next-page pointer.
pub fn set_next_pgno(page: &mut [u8], pgno: u32) {
    BigEndian::write_u32(&mut page[P_NEXT..], pgno);
}

/// Read the entry count.
pub fn entries(page: &[u8]) -> u16 {
    BigEndian::read_u16(&page[P_ENTRIES..])
}

/// Set the entry count.
pub fn set_entries(page: &mut [u8], n: u16) {
    BigEndian::write_u16(&mut page[P_ENTRIES..], n);
}

/// Read the heap offset.
pub fn hoffset(page: &[u8]) -> u16 {
    BigEndian::read_u16(&page[P_HOFFSET..])
}

/// Set the heap offset.
pub fn set_hoffset(page: &mut [u8], off: u16) {
    BigEndian::write_u16(&mut page[P_HOFFSET..], off);
}

/// Read the tree level.
pub fn level(page: &[u8]) -> u8 {
    page[P_LEVEL]
}

/// Read the page type.
pub fn ptype(page: &[u8]) -> PageType {
    PageType::from_u8(page[P_TYPE])
}

/// Overflow pages store their payload length in the heap offset field.
pub fn ov_len(page: &[u8]) -> u16 {
    hoffset(page)
}

/// See [`ov_len`].
pub fn set_ov_len(page: &mut [u8], len: u16) {
    set_hoffset(page, len)
}

/// Overflow chain heads store their reference count in the entry field.
pub fn ov_ref(page: &[u8]) -> u16 {
    entries(page)
}

/// See [`ov_ref`].
pub fn set_ov_ref(page: &mut [u8], count: u16) {
    set_entries(page, count)
}

/// Initialize a page in place.
pub fn init_page(page: &mut [u8], pg: u32, prev: u32, next: u32, lvl: u8, ty: PageType) {
    let size = page.len();
    page[..PAGE_HDR_SIZE].fill(0);
    BigEndian::write_u32(&mut page[P_PGNO..], pg);
    BigEndian::write_u32(&mut page[P_PREV..], prev);
    BigEndian::write_u32(&mut page[P_NEXT..], next);
    set_hoffset(page, size as u16);
    page[P_LEVEL] = lvl;
    page[P_TYPE] = ty.code();
}

/// Read slot `i` of the `inp[]` array.
pub fn inp(page: &[u8], i: usize) -> u16 {
    BigEndian::read_u16(&page[PAGE_HDR_SIZE + 2 * i..])
}

/// Set slot `i` of the `inp[]` array.
pub fn set_inp(page: &mut [u8], i: usize, off: u16) {
    BigEndian::write_u16(&mut page[PAGE_HDR_SIZE + 2 * i..], off);
}

/// Bytes of free space on a slotted page.
pub fn free_space(page: &[u8]) -> usize {
    hoffset(page) as usize - (PAGE_HDR_SIZE + 2 * entries(page) as usize)
}

/// Usable payload bytes on an overflow page.
pub fn max_overflow_space(page_size: u32) -> usize {
    page_size as usize - PAGE_HDR_SIZE
}

// ── Slot items ──────────────────────────────────────────────────────────

/// Inline key or data item.
pub const B_KEYDATA: u8 = 1;
/// Off-page duplicate tree reference.
pub const B_DUPLICATE: u8 = 2;
/// Overflow chain reference.
pub const B_OVERFLOW: u8 = 3;
/// Tombstone bit, set on deleted items; distinct from the category bits.
pub const B_DELETE: u8 = 0x80;

/// Byte overhead of an inline item (length + type).
pub const BKEYDATA_OVERHEAD: usize = 3;
/// On-page size of overflow and duplicate items.
pub const BOVERFLOW_SIZE: usize = 12;

/// On-page size of an inline item holding `len` data bytes.
pub fn bkeydata_size(len: usize) -> usize {
    BKEYDATA_OVERHEAD + len
}

/// Strip the tombstone bit from an item type byte.
pub fn b_type(t: u8) -> u8 {
    t & !B_DELETE
}

/// True if the tombstone bit is set.
pub fn b_deleted(t: u8) -> bool {
    t & B_DELETE != 0
}

/// A decoded slot item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Inline bytes.
    KeyData { deleted: bool, data: Vec<u8> },
    /// Big key/data stored as an overflow chain.
    Overflow { deleted: bool, pgno: u32, tlen: u32 },
    /// Off-page duplicate tree.
    Duplicate { deleted: bool, root: u32 },
}

impl Item {
    /// Bytes this item occupies on a page.
    pub fn size(&self) -> usize {
        match self {
            Item::KeyData { data, .. } => bkeydata_size(data.len()),
            Item::Overflow { .. } | Item::Duplicate { .. } => BOVERFLOW_SIZE,
        }
    }

    /// Encode this item into its on-page form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Item::KeyData { deleted, data } => {
                let mut buf = vec![0u8; bkeydata_size(data.len())];
                BigEndian::write_u16(&mut buf[0..], data.len() as u16);
                buf[2] = B_KEYDATA | if *deleted { B_DELETE } else { 0 };
                buf[3..].copy_from_slice(data);
                buf
            }
            Item::Overflow { deleted, pgno, tlen } => {
                let mut buf = vec![0u8; BOVERFLOW_SIZE];
                buf[2] = B_OVERFLOW | if *deleted { B_DELETE } else { 0 };
                BigEndian::write_u32(&mut buf[4..], *pgno);
                BigEndian::write_u32(&mut buf[8..], *tlen);
                buf
            }
            Item::Duplicate { deleted, root } => {
                let mut buf = vec![0u8; BOVERFLOW_SIZE];
                buf[2] = B_DUPLICATE | if *deleted { B_DELETE } else { 0 };
                BigEndian::write_u32(&mut buf[4..], *root);
                buf
            }
        }
    }

    /// Decode the item at slot `i` of a page.
    pub fn decode(page: &[u8], i: usize) -> Option<Item> {
        let off = inp(page, i) as usize;
        if off + BKEYDATA_OVERHEAD > page.len() {
            return None;
        }
        let ty = page[off + 2];
        let deleted = b_deleted(ty);
        match b_type(ty) {
            B_KEYDATA => {
                let len = BigEndian::read_u16(&page[off..]) as usize;
                if off + BKEYDATA_OVERHEAD + len > page.len() {
                    return None;
                }
                Some(Item::KeyData {
                    deleted,
                    data: page[off + 3..off + 3 + len].to_vec(),
                })
            }
            B_OVERFLOW => {
                if off + BOVERFLOW_SIZE > page.len() {
                    return None;
                }
                Some(Item::Overflow {
                    deleted,
                    pgno: BigEndian::read_u32(&page[off + 4..]),
                    tlen: BigEndian::read_u32(&page[off + 8..]),
                })
            }
            B_DUPLICATE => {
                if off + BOVERFLOW_SIZE > page.len() {
                    return None;
                }
                Some(Item::Duplicate {
                    deleted,
                    root: BigEndian::read_u32(&page[off + 4..]),
                })
            }
            _ => None,
        }
    }

    /// On-page size of the item at slot `i`, without decoding its data.
    pub fn size_on_page(page: &[u8], i: usize) -> usize {
        let off = inp(page, i) as usize;
        match b_type(page[off + 2]) {
            B_KEYDATA => bkeydata_size(BigEndian::read_u16(&page[off..]) as usize),
            _ => BOVERFLOW_SIZE,
        }
    }
}

// ── Meta page ───────────────────────────────────────────────────────────

/// B-tree metadata magic.
pub const BTREE_MAGIC: u32 = 0x053162;
/// B-tree metadata format version.
pub const BTREE_VERSION: u32 = 9;
/// Hash metadata magic.
pub const HASH_MAGIC: u32 = 0x061561;
/// Hash metadata format version.
pub const HASH_VERSION: u32 = 9;
/// Queue metadata magic.
pub const QUEUE_MAGIC: u32 = 0x042253;
/// Queue metadata format version.
pub const QUEUE_VERSION: u32 = 4;

pub(crate) const M_MAGIC: usize = 12;
pub(crate) const M_VERSION: usize = 16;
pub(crate) const M_PAGESIZE: usize = 20;
pub(crate) const M_ENCRYPT_ALG: usize = 24;
pub(crate) const M_TYPE: usize = 25;
pub(crate) const M_METAFLAGS: usize = 26;
pub(crate) const M_FREE: usize = 28;
pub(crate) const M_LAST_PGNO: usize = 32;
pub(crate) const M_NPARTS: usize = 36;
pub(crate) const M_KEY_COUNT: usize = 40;
pub(crate) const M_RECORD_COUNT: usize = 44;
pub(crate) const M_FLAGS: usize = 48;
pub(crate) const M_UID: usize = 52;
pub(crate) const M_ROOT: usize = 68;
pub(crate) const M_IV: usize = 72;
/// First byte of the method-specific metadata tail.
pub(crate) const M_TAIL: usize = 88;
/// Minimum bytes a buffer must have for meta parsing.
pub const META_SIZE: usize = 112;

/// Parsed metadata page header, common to every access method.
#[derive(Debug, Clone, Serialize)]
pub struct MetaHeader {
    pub lsn: Lsn,
    pub pgno: u32,
    pub magic: u32,
    pub version: u32,
    pub pagesize: u32,
    /// Zero when the file is not encrypted.
    pub encrypt_alg: u8,
    pub ptype: PageType,
    pub metaflags: u8,
    /// Head of the free-page chain.
    pub free: u32,
    pub last_pgno: u32,
    pub key_count: u32,
    pub record_count: u32,
    pub flags: u32,
    /// Stable 16-byte file identity.
    pub uid: [u8; 16],
    /// Root page of the access method.
    pub root: u32,
}

impl MetaHeader {
    /// Parse a metadata page.
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < META_SIZE {
            return None;
        }
        let mut uid = [0u8; 16];
        uid.copy_from_slice(&page[M_UID..M_UID + 16]);
        Some(MetaHeader {
            lsn: Lsn::read_from(&page[P_LSN..]),
            pgno: BigEndian::read_u32(&page[P_PGNO..]),
            magic: BigEndian::read_u32(&page[M_MAGIC..]),
            version: BigEndian::read_u32(&page[M_VERSION..]),
            pagesize: BigEndian::read_u32(&page[M_PAGESIZE..]),
            encrypt_alg: page[M_ENCRYPT_ALG],
            ptype: PageType::from_u8(page[M_TYPE]),
            metaflags: page[M_METAFLAGS],
            free: BigEndian::read_u32(&page[M_FREE..]),
            last_pgno: BigEndian::read_u32(&page[M_LAST_PGNO..]),
            key_count: BigEndian::read_u32(&page[M_KEY_COUNT..]),
            record_count: BigEndian::read_u32(&page[M_RECORD_COUNT..]),
            flags: BigEndian::read_u32(&page[M_FLAGS..]),
            uid,
            root: BigEndian::read_u32(&page[M_ROOT..]),
        })
    }

    /// Write this header into a page buffer.
    pub fn write_to(&self, page: &mut [u8]) {
        self.lsn.write_to(&mut page[P_LSN..]);
        BigEndian::write_u32(&mut page[P_PGNO..], self.pgno);
        BigEndian::write_u32(&mut page[M_MAGIC..], self.magic);
        BigEndian::write_u32(&mut page[M_VERSION..], self.version);
        BigEndian::write_u32(&mut page[M_PAGESIZE..], self.pagesize);
        page[M_ENCRYPT_ALG] = self.encrypt_alg;
        page[M_TYPE] = self.ptype.code();
        page[M_METAFLAGS] = self.metaflags;
        BigEndian::write_u32(&mut page[M_FREE..], self.free);
        BigEndian::write_u32(&mut page[M_LAST_PGNO..], self.last_pgno);
        BigEndian::write_u32(&mut page[M_KEY_COUNT..], self.key_count);
        BigEndian::write_u32(&mut page[M_RECORD_COUNT..], self.record_count);
        BigEndian::write_u32(&mut page[M_FLAGS..], self.flags);
        page[M_UID..M_UID + 16].copy_from_slice(&self.uid);
        BigEndian::write_u32(&mut page[M_ROOT..], self.root);
    }
}

/// Read the free-list head from a metadata page.
pub fn meta_free(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[M_FREE..])
}

/// Set the free-list head on a metadata page.
pub fn set_meta_free(page: &mut [u8], pg: u32) {
    BigEndian::write_u32(&mut page[M_FREE..], pg);
}

/// Read the root page from a metadata page.
pub fn meta_root(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[M_ROOT..])
}

/// Set the last allocated page number on a metadata page.
pub fn set_meta_last_pgno(page: &mut [u8], pg: u32) {
    BigEndian::write_u32(&mut page[M_LAST_PGNO..], pg);
}

/// Read the last allocated page number from a metadata page.
pub fn meta_last_pgno(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[M_LAST_PGNO..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_page_fields() {
        let mut page = vec![0u8; 512];
        init_page(&mut page, 7, 6, 8, LEAFLEVEL, PageType::LBtree);
        assert_eq!(pgno(&page), 7);
        assert_eq!(prev_pgno(&page), 6);
        assert_eq!(next_pgno(&page), 8);
        assert_eq!(entries(&page), 0);
        assert_eq!(hoffset(&page), 512);
        assert_eq!(level(&page), LEAFLEVEL);
        assert_eq!(ptype(&page), PageType::LBtree);
        assert_eq!(lsn(&page), Lsn::ZERO);
        assert_eq!(free_space(&page), 512 - PAGE_HDR_SIZE);
    }

    #[test]
    fn test_page_type_roundtrip() {
        for t in [
            PageType::Invalid,
            PageType::Hash,
            PageType::IBtree,
            PageType::LBtree,
            PageType::LRecno,
            PageType::Overflow,
            PageType::HashMeta,
            PageType::BtreeMeta,
            PageType::QueueMeta,
            PageType::QueueData,
            PageType::LDup,
        ] {
            assert_eq!(PageType::from_u8(t.code()), t);
        }
        assert!(PageType::BtreeMeta.is_meta());
        assert!(!PageType::LBtree.is_meta());
        assert!(PageType::LBtree.is_slotted());
        assert!(!PageType::Overflow.is_slotted());
    }

    #[test]
    fn test_item_encode_decode() {
        let mut page = vec![0u8; 256];
        init_page(&mut page, 1, 0, 0, LEAFLEVEL, PageType::LBtree);

        let item = Item::KeyData {
            deleted: false,
            data: b"payload".to_vec(),
        };
        let enc = item.encode();
        let off = 256 - enc.len();
        page[off..].copy_from_slice(&enc);
        set_inp(&mut page, 0, off as u16);
        set_entries(&mut page, 1);
        set_hoffset(&mut page, off as u16);

        assert_eq!(Item::decode(&page, 0), Some(item));
        assert_eq!(Item::size_on_page(&page, 0), bkeydata_size(7));
    }

    #[test]
    fn test_item_tombstone_bit() {
        let item = Item::KeyData {
            deleted: true,
            data: b"x".to_vec(),
        };
        let enc = item.encode();
        assert!(b_deleted(enc[2]));
        assert_eq!(b_type(enc[2]), B_KEYDATA);
    }

    #[test]
    fn test_overflow_item_fields() {
        let item = Item::Overflow {
            deleted: false,
            pgno: 42,
            tlen: 5000,
        };
        let enc = item.encode();
        assert_eq!(enc.len(), BOVERFLOW_SIZE);
        assert_eq!(BigEndian::read_u32(&enc[4..]), 42);
        assert_eq!(BigEndian::read_u32(&enc[8..]), 5000);
    }

    #[test]
    fn test_meta_header_roundtrip() {
        let mut page = vec![0u8; 512];
        let meta = MetaHeader {
            lsn: Lsn::new(3, 99),
            pgno: 0,
            magic: BTREE_MAGIC,
            version: BTREE_VERSION,
            pagesize: 512,
            encrypt_alg: 0,
            ptype: PageType::BtreeMeta,
            metaflags: 0,
            free: 0,
            last_pgno: 12,
            key_count: 100,
            record_count: 100,
            flags: 0,
            uid: [9u8; 16],
            root: 1,
        };
        meta.write_to(&mut page);
        let got = MetaHeader::parse(&page).unwrap();
        assert_eq!(got.magic, BTREE_MAGIC);
        assert_eq!(got.version, BTREE_VERSION);
        assert_eq!(got.pagesize, 512);
        assert_eq!(got.root, 1);
        assert_eq!(got.last_pgno, 12);
        assert_eq!(got.uid, [9u8; 16]);
        assert_eq!(got.lsn, Lsn::new(3, 99));
        assert_eq!(got.ptype, PageType::BtreeMeta);
    }
}
