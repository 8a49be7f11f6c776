//! Slotted-page item primitives.
//!
//! Callers hold a write pin on the page and a slot index. Items live in
//! the heap growing backward from the page end; `inp[]` holds their
//! offsets in logical order. Inserting allocates at `hoffset - needed`
//! and shifts `inp[indx..]` right; deleting compacts the heap upward for
//! every item that sat below the removed one and shifts `inp[]` left.
//!
//! The only error callers are expected to handle is [`Error::PageFull`],
//! which the access method answers with a split. Anything else indicates
//! on-disk corruption mid-write.

use crate::page::{
    self, bkeydata_size, free_space, Item, B_KEYDATA, PAGE_HDR_SIZE,
};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Insert an item at slot `indx`.
///
/// `hdr` is the pre-encoded item header (overflow and duplicate items are
/// header-only); when `None`, an inline key/data item is built around
/// `data`. Needs `item size + 2` bytes of free space for the slot entry.
pub fn insert_item(
    page: &mut [u8],
    indx: usize,
    hdr: Option<&[u8]>,
    data: &[u8],
) -> Result<()> {
    let needed = match hdr {
        Some(h) => h.len() + data.len(),
        None => bkeydata_size(data.len()),
    };
    if free_space(page) < needed + 2 {
        return Err(Error::PageFull);
    }

    let n = page::entries(page) as usize;
    if indx > n {
        return Err(Error::Invalid(format!(
            "slot {} out of range (page has {} entries)",
            indx, n
        )));
    }

    let new_off = page::hoffset(page) as usize - needed;
    match hdr {
        Some(h) => {
            page[new_off..new_off + h.len()].copy_from_slice(h);
            page[new_off + h.len()..new_off + needed].copy_from_slice(data);
        }
        None => {
            BigEndian::write_u16(&mut page[new_off..], data.len() as u16);
            page[new_off + 2] = B_KEYDATA;
            page[new_off + 3..new_off + needed].copy_from_slice(data);
        }
    }

    for i in (indx..n).rev() {
        let v = page::inp(page, i);
        page::set_inp(page, i + 1, v);
    }
    page::set_inp(page, indx, new_off as u16);
    page::set_entries(page, (n + 1) as u16);
    page::set_hoffset(page, new_off as u16);
    Ok(())
}

/// Delete the item at slot `indx`, which occupies `nbytes` on the page.
pub fn delete_item(page: &mut [u8], indx: usize, nbytes: usize) -> Result<()> {
    let n = page::entries(page) as usize;
    if indx >= n {
        return Err(Error::Invalid(format!(
            "slot {} out of range (page has {} entries)",
            indx, n
        )));
    }
    let old_off = page::inp(page, indx) as usize;
    let hoff = page::hoffset(page) as usize;
    if old_off < hoff || old_off + nbytes > page.len() {
        return Err(Error::Corrupt(format!(
            "slot {} offset {} outside heap",
            indx, old_off
        )));
    }

    // Compact: items below the deleted one slide up over it.
    page.copy_within(hoff..old_off, hoff + nbytes);
    for i in 0..n {
        let off = page::inp(page, i) as usize;
        if off < old_off {
            page::set_inp(page, i, (off + nbytes) as u16);
        }
    }

    for i in indx + 1..n {
        let v = page::inp(page, i);
        page::set_inp(page, i - 1, v);
    }
    page::set_entries(page, (n - 1) as u16);
    page::set_hoffset(page, (hoff + nbytes) as u16);
    Ok(())
}

/// Replace the item at slot `indx` with pre-encoded bytes, shifting the
/// heap by the signed size delta. When the item sits at `hoffset` the
/// shift degenerates to a single offset update.
pub fn replace_item(page: &mut [u8], indx: usize, new: &[u8]) -> Result<()> {
    let n = page::entries(page) as usize;
    if indx >= n {
        return Err(Error::Invalid(format!(
            "slot {} out of range (page has {} entries)",
            indx, n
        )));
    }
    let old_off = page::inp(page, indx) as usize;
    let old_size = Item::size_on_page(page, indx);
    if new.len() > old_size && free_space(page) < new.len() - old_size {
        return Err(Error::PageFull);
    }

    let hoff = page::hoffset(page) as usize;
    let delta = old_size as isize - new.len() as isize;
    let new_hoff = (hoff as isize + delta) as usize;
    let new_off = (old_off as isize + delta) as usize;

    if old_off != hoff {
        page.copy_within(hoff..old_off, new_hoff);
        for i in 0..n {
            let off = page::inp(page, i) as usize;
            if off < old_off {
                page::set_inp(page, i, (off as isize + delta) as u16);
            }
        }
    }
    page[new_off..new_off + new.len()].copy_from_slice(new);
    page::set_inp(page, indx, new_off as u16);
    page::set_hoffset(page, new_hoff as u16);
    Ok(())
}

/// Adjust the slot array without touching the heap. With `insert` set,
/// open a slot at `indx` referencing the same item as `copy` — the
/// duplicate-key pattern a B-tree leaf uses to repeat a key in its
/// `{key, data, key, data}` layout. Otherwise drop slot `indx`.
pub fn adjust_indices(page: &mut [u8], indx: usize, copy: usize, insert: bool) -> Result<()> {
    let n = page::entries(page) as usize;
    if insert {
        if free_space(page) < 2 {
            return Err(Error::PageFull);
        }
        if indx > n || copy >= n {
            return Err(Error::Invalid("slot out of range".into()));
        }
        let v = page::inp(page, copy);
        for i in (indx..n).rev() {
            let t = page::inp(page, i);
            page::set_inp(page, i + 1, t);
        }
        page::set_inp(page, indx, v);
        page::set_entries(page, (n + 1) as u16);
    } else {
        if indx >= n {
            return Err(Error::Invalid("slot out of range".into()));
        }
        for i in indx + 1..n {
            let v = page::inp(page, i);
            page::set_inp(page, i - 1, v);
        }
        page::set_entries(page, (n - 1) as u16);
    }
    Ok(())
}

/// Size of the record that results from a partial put.
///
/// `nbytes` is the current item length, `doff`/`dlen` the partial window,
/// and `size` the replacement length. Replacing past the end of record
/// extends to `doff + size`; otherwise the unreplaced prefix and suffix
/// survive.
pub fn partial_size(nbytes: u32, doff: u32, dlen: u32, size: u32) -> u32 {
    if nbytes < doff + dlen {
        doff + size
    } else {
        nbytes + size - dlen
    }
}

/// Check a partial-put result against a fixed record length.
pub fn check_fixed_len(result: u32, fixed: u32) -> Result<()> {
    if result != fixed {
        return Err(Error::LengthMismatch(result));
    }
    Ok(())
}

/// Total free bytes needed to insert an item of `item_size` bytes,
/// including its slot entry.
pub fn insert_space(item_size: usize) -> usize {
    item_size + 2
}

/// Bytes available for items on an empty slotted page.
pub fn usable_space(page_size: u32) -> usize {
    page_size as usize - PAGE_HDR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{init_page, PageType, LEAFLEVEL};

    const PS: usize = 256;

    fn empty_leaf() -> Vec<u8> {
        let mut page = vec![0u8; PS];
        init_page(&mut page, 1, 0, 0, LEAFLEVEL, PageType::LBtree);
        page
    }

    fn get(page: &[u8], i: usize) -> Vec<u8> {
        match Item::decode(page, i).unwrap() {
            Item::KeyData { data, .. } => data,
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_insert_and_order() {
        let mut page = empty_leaf();
        insert_item(&mut page, 0, None, b"bbb").unwrap();
        insert_item(&mut page, 0, None, b"aaa").unwrap();
        insert_item(&mut page, 2, None, b"ccc").unwrap();

        assert_eq!(page::entries(&page), 3);
        assert_eq!(get(&page, 0), b"aaa");
        assert_eq!(get(&page, 1), b"bbb");
        assert_eq!(get(&page, 2), b"ccc");
    }

    #[test]
    fn test_insert_exact_fit_boundary() {
        let mut page = empty_leaf();
        // Fill until only one item's worth of space is left.
        let item = vec![0x41u8; 16];
        loop {
            let left = free_space(&page);
            let need = insert_space(bkeydata_size(item.len()));
            if left < 2 * need {
                break;
            }
            let n = page::entries(&page) as usize;
            insert_item(&mut page, n, None, &item).unwrap();
        }

        // Now craft a payload so free space exactly equals what is
        // needed: it must succeed.
        let left = free_space(&page);
        let payload = vec![0x42u8; left - 2 - bkeydata_size(0)];
        let n = page::entries(&page) as usize;
        insert_item(&mut page, n, None, &payload).unwrap();
        assert_eq!(free_space(&page), 0);

        // One more byte anywhere fails with PageFull.
        let n = page::entries(&page) as usize;
        assert!(matches!(
            insert_item(&mut page, n, None, b""),
            Err(Error::PageFull)
        ));
    }

    #[test]
    fn test_delete_compacts_heap() {
        let mut page = empty_leaf();
        insert_item(&mut page, 0, None, b"first").unwrap();
        insert_item(&mut page, 1, None, b"second").unwrap();
        insert_item(&mut page, 2, None, b"third").unwrap();
        let free_before = free_space(&page);

        let nbytes = Item::size_on_page(&page, 1);
        delete_item(&mut page, 1, nbytes).unwrap();

        assert_eq!(page::entries(&page), 2);
        assert_eq!(get(&page, 0), b"first");
        assert_eq!(get(&page, 1), b"third");
        assert_eq!(free_space(&page), free_before + nbytes + 2);
    }

    #[test]
    fn test_insert_delete_roundtrip_space() {
        let mut page = empty_leaf();
        let baseline = free_space(&page);
        insert_item(&mut page, 0, None, b"ephemeral").unwrap();
        let nbytes = Item::size_on_page(&page, 0);
        delete_item(&mut page, 0, nbytes).unwrap();
        assert_eq!(free_space(&page), baseline);
        assert_eq!(page::entries(&page), 0);
        assert_eq!(page::hoffset(&page) as usize, PS);
    }

    #[test]
    fn test_replace_smaller_and_larger() {
        let mut page = empty_leaf();
        insert_item(&mut page, 0, None, b"underneath").unwrap();
        insert_item(&mut page, 1, None, b"abcdefgh").unwrap();

        let shorter = Item::KeyData {
            deleted: false,
            data: b"ab".to_vec(),
        };
        replace_item(&mut page, 1, &shorter.encode()).unwrap();
        assert_eq!(get(&page, 1), b"ab");
        assert_eq!(get(&page, 0), b"underneath");

        let longer = Item::KeyData {
            deleted: false,
            data: b"abcdefghijklmnop".to_vec(),
        };
        replace_item(&mut page, 1, &longer.encode()).unwrap();
        assert_eq!(get(&page, 1), b"abcdefghijklmnop");
        assert_eq!(get(&page, 0), b"underneath");
    }

    #[test]
    fn test_replace_at_hoffset_single_update() {
        let mut page = empty_leaf();
        insert_item(&mut page, 0, None, b"alpha").unwrap();
        // Item 0 is at hoffset; replacing it must not disturb anything.
        let item = Item::KeyData {
            deleted: false,
            data: b"om".to_vec(),
        };
        replace_item(&mut page, 0, &item.encode()).unwrap();
        assert_eq!(get(&page, 0), b"om");
        assert_eq!(
            page::hoffset(&page) as usize,
            PS - bkeydata_size(2)
        );
    }

    #[test]
    fn test_adjust_indices_duplicate_key_pattern() {
        let mut page = empty_leaf();
        insert_item(&mut page, 0, None, b"key").unwrap();
        insert_item(&mut page, 1, None, b"data1").unwrap();

        // Repeat the key slot to build {key, data1, key, data2}.
        adjust_indices(&mut page, 2, 0, true).unwrap();
        insert_item(&mut page, 3, None, b"data2").unwrap();

        assert_eq!(page::entries(&page), 4);
        assert_eq!(get(&page, 0), b"key");
        assert_eq!(get(&page, 2), b"key");
        assert_eq!(page::inp(&page, 0), page::inp(&page, 2));
        assert_eq!(get(&page, 3), b"data2");

        // Dropping the copied slot leaves the original untouched.
        adjust_indices(&mut page, 2, 0, false).unwrap();
        assert_eq!(page::entries(&page), 3);
        assert_eq!(get(&page, 0), b"key");
        assert_eq!(get(&page, 2), b"data2");
    }

    #[test]
    fn test_partial_size_cases() {
        // Replacing past the end of record: doff + size.
        assert_eq!(partial_size(10, 8, 5, 7), 15);
        // Replacing inside the record: nbytes + size - dlen.
        assert_eq!(partial_size(20, 5, 5, 3), 18);
        // Boundary: nbytes == doff + dlen takes the second case.
        assert_eq!(partial_size(13, 8, 5, 7), 15);
        assert_eq!(partial_size(12, 8, 5, 7), 15);
    }

    #[test]
    fn test_check_fixed_len() {
        assert!(check_fixed_len(16, 16).is_ok());
        assert!(matches!(
            check_fixed_len(15, 16),
            Err(Error::LengthMismatch(15))
        ));
    }
}
