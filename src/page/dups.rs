//! Off-page duplicate promotion.
//!
//! A B-tree leaf stores duplicate keys as repeated `{key, data}` pairs
//! whose key slots all reference one heap item. When a single key's
//! duplicate set grows to a quarter of the page while the page is at
//! least half full, the set is moved to its own off-page tree: a sorted
//! duplicate leaf or, for unsorted duplicates, a recno leaf. The leaf
//! keeps one key slot and a single `DUPLICATE{root}` item; live cursors
//! pointing into the moved region are repointed at the new page.

use crate::log::records::{AddremArgs, OP_ADD, OP_REM};
use crate::log::Lsn;
use crate::mpool::PagePin;
use crate::page::overflow::OvContext;
use crate::page::slots::{adjust_indices, delete_item, insert_item};
use crate::page::{self, init_page, Item, PageType, LEAFLEVEL};
use crate::Result;

/// A live cursor position subject to adjustment when items move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorAdjust {
    pub pgno: u32,
    pub indx: usize,
}

/// Two key slots belong to the same set when they reference the same
/// heap item or carry equal inline keys.
fn same_key(page: &[u8], a: usize, b: usize) -> bool {
    if page::inp(page, a) == page::inp(page, b) {
        return true;
    }
    matches!(
        (Item::decode(page, a), Item::decode(page, b)),
        (
            Some(Item::KeyData { data: x, .. }),
            Some(Item::KeyData { data: y, .. })
        ) if x == y
    )
}

/// Find the first slot of the duplicate set containing slot `indx`: the
/// lowest pair carrying the same key.
pub fn dup_set_start(page: &[u8], indx: usize) -> usize {
    let anchor = indx & !1;
    let mut first = anchor;
    while first >= 2 && same_key(page, first - 2, anchor) {
        first -= 2;
    }
    first
}

/// Number of `{key, data}` pairs in the duplicate set starting at
/// `first`.
pub fn dup_set_len(page: &[u8], first: usize) -> usize {
    let n = page::entries(page) as usize;
    let mut count = 0;
    let mut i = first;
    while i + 1 < n && same_key(page, i, first) {
        count += 1;
        i += 2;
    }
    count
}

/// Decide whether the duplicate set containing slot `indx` has grown
/// enough to move off-page: the set occupies at least a quarter of the
/// page and the page is at least half full.
pub fn should_promote(page: &[u8], indx: usize, page_size: u32) -> bool {
    let first = dup_set_start(page, indx);
    let pairs = dup_set_len(page, first);
    if pairs < 2 {
        return false;
    }
    let mut dupsize = 0usize;
    for j in 0..pairs {
        dupsize += Item::size_on_page(page, first + 2 * j + 1) + 2;
    }
    let used = page_size as usize - page::free_space(page);
    dupsize >= page_size as usize / 4 && used >= page_size as usize / 2
}

fn log_addrem(
    ctx: &mut dyn OvContext,
    opcode: u32,
    pin: &PagePin,
    indx: usize,
    item: &[u8],
) -> Result<()> {
    if !ctx.logging() {
        return Ok(());
    }
    let args = AddremArgs {
        txnid: ctx.txnid(),
        prev_lsn: ctx.prev_lsn(),
        opcode,
        fileid: ctx.fileid(),
        pgno: pin.pgno(),
        indx: indx as u32,
        nbytes: item.len() as u32,
        hdr: item.to_vec(),
        data: Vec::new(),
        pagelsn: page::lsn(&pin.read()),
    };
    let lsn = ctx.log_put(&args.encode())?;
    page::set_lsn(&mut pin.write(), lsn);
    Ok(())
}

/// Move the duplicate set containing slot `indx` to a fresh off-page
/// tree, returning its root page number. `sorted` selects a sorted
/// duplicate leaf over a recno leaf. `cursors` are repointed in place.
pub fn promote_duplicates(
    ctx: &mut dyn OvContext,
    leaf: &PagePin,
    indx: usize,
    sorted: bool,
    cursors: &mut [CursorAdjust],
) -> Result<u32> {
    let (first, pairs) = {
        let buf = leaf.read();
        let first = dup_set_start(&buf, indx);
        (first, dup_set_len(&buf, first))
    };

    // Collect the data items in order before any slot shifts.
    let mut items: Vec<Vec<u8>> = Vec::with_capacity(pairs);
    {
        let buf = leaf.read();
        for j in 0..pairs {
            let slot = first + 2 * j + 1;
            let off = page::inp(&buf, slot) as usize;
            let size = Item::size_on_page(&buf, slot);
            items.push(buf[off..off + size].to_vec());
        }
    }

    // Build the off-page tree.
    let root_pin = ctx.new_page()?;
    let root = root_pin.pgno();
    {
        let mut buf = root_pin.write();
        init_page(
            &mut buf,
            root,
            page::PGNO_INVALID,
            page::PGNO_INVALID,
            LEAFLEVEL,
            if sorted { PageType::LDup } else { PageType::LRecno },
        );
    }
    for (j, item) in items.iter().enumerate() {
        log_addrem(ctx, OP_ADD, &root_pin, j, item)?;
        insert_item(&mut root_pin.write(), j, Some(item), &[])?;
    }
    ctx.fput(root_pin, true);

    // Strip the pairs from the leaf, keeping the first key slot. Walk
    // backward so earlier indices stay valid. A key slot sharing the
    // first pair's heap item only drops its slot entry; a key stored as
    // its own copy is deleted like any item.
    for j in (0..pairs).rev() {
        let data_slot = first + 2 * j + 1;
        let (item, nbytes) = {
            let buf = leaf.read();
            let off = page::inp(&buf, data_slot) as usize;
            let size = Item::size_on_page(&buf, data_slot);
            (buf[off..off + size].to_vec(), size)
        };
        log_addrem(ctx, OP_REM, leaf, data_slot, &item)?;
        delete_item(&mut leaf.write(), data_slot, nbytes)?;
        if j > 0 {
            let key_slot = first + 2 * j;
            let shared = {
                let buf = leaf.read();
                page::inp(&buf, key_slot) == page::inp(&buf, first)
            };
            if shared {
                adjust_indices(&mut leaf.write(), key_slot, 0, false)?;
            } else {
                let (item, nbytes) = {
                    let buf = leaf.read();
                    let off = page::inp(&buf, key_slot) as usize;
                    let size = Item::size_on_page(&buf, key_slot);
                    (buf[off..off + size].to_vec(), size)
                };
                log_addrem(ctx, OP_REM, leaf, key_slot, &item)?;
                delete_item(&mut leaf.write(), key_slot, nbytes)?;
            }
        }
    }

    // The surviving pair becomes {key, DUPLICATE{root}}.
    let dup_item = Item::Duplicate {
        deleted: false,
        root,
    }
    .encode();
    log_addrem(ctx, OP_ADD, leaf, first + 1, &dup_item)?;
    insert_item(&mut leaf.write(), first + 1, Some(&dup_item), &[])?;

    // Repoint cursors that sat on moved data items.
    let leaf_pgno = leaf.pgno();
    for c in cursors.iter_mut() {
        if c.pgno == leaf_pgno && c.indx > first && c.indx < first + 2 * pairs {
            let j = (c.indx - first) / 2;
            *c = CursorAdjust { pgno: root, indx: j };
        }
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpool::{GetFlag, Mpool};
    use crate::page::codec::CodecCtx;
    use crate::page::slots::insert_item as raw_insert;

    const PS: u32 = 512;

    struct TestCtx {
        pool: Mpool,
        mpf: crate::mpool::MpfId,
        next_pgno: u32,
    }

    impl TestCtx {
        fn new(dir: &std::path::Path) -> Self {
            let pool = Mpool::new(64);
            let ctx = CodecCtx {
                page_size: PS,
                needs_swap: false,
            };
            let mpf = pool.fopen(&dir.join("dup.db"), PS, ctx, None);
            TestCtx {
                pool,
                mpf,
                next_pgno: 2,
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
            self.pool.fput(pin, true);
            Ok(())
        }
    }

    /// Build a leaf holding one duplicate set of `n` pairs for "k", with
    /// `datalen`-byte values.
    fn build_dup_leaf(ctx: &TestCtx, n: usize, datalen: usize) -> PagePin {
        let pin = ctx.fget(1, true).unwrap();
        {
            let mut buf = pin.write();
            init_page(&mut buf, 1, 0, 0, LEAFLEVEL, PageType::LBtree);
            raw_insert(&mut buf, 0, None, b"k").unwrap();
            let mut v = vec![0u8; datalen];
            v[0] = b'0';
            raw_insert(&mut buf, 1, None, &v).unwrap();
            for j in 1..n {
                adjust_indices(&mut buf, 2 * j, 0, true).unwrap();
                v[0] = b'0' + j as u8;
                raw_insert(&mut buf, 2 * j + 1, None, &v).unwrap();
            }
        }
        pin
    }

    #[test]
    fn test_should_promote_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TestCtx::new(dir.path());

        // Two small pairs: nowhere near the thresholds.
        let pin = build_dup_leaf(&ctx, 2, 8);
        assert!(!should_promote(&pin.read(), 0, PS));
        ctx.fput(pin, false);
    }

    #[test]
    fn test_promote_moves_set_offpage() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());

        // 6 pairs of 40-byte values: set is ~250 bytes on a 512 page.
        let pin = build_dup_leaf(&ctx, 6, 40);
        assert!(should_promote(&pin.read(), 0, PS));

        let mut cursors = vec![
            CursorAdjust { pgno: 1, indx: 5 }, // data item of pair 2
            CursorAdjust { pgno: 1, indx: 0 }, // the key itself
        ];
        let root = promote_duplicates(&mut ctx, &pin, 0, true, &mut cursors).unwrap();

        // Leaf now holds {key, DUPLICATE{root}}.
        {
            let buf = pin.read();
            assert_eq!(page::entries(&buf), 2);
            assert_eq!(
                Item::decode(&buf, 0),
                Some(Item::KeyData {
                    deleted: false,
                    data: b"k".to_vec()
                })
            );
            assert_eq!(
                Item::decode(&buf, 1),
                Some(Item::Duplicate {
                    deleted: false,
                    root
                })
            );
        }
        ctx.fput(pin, true);

        // The off-page leaf holds the six values in order.
        let dup = ctx.fget(root, false).unwrap();
        {
            let buf = dup.read();
            assert_eq!(page::ptype(&buf), PageType::LDup);
            assert_eq!(page::entries(&buf), 6);
            for j in 0..6usize {
                match Item::decode(&buf, j).unwrap() {
                    Item::KeyData { data, .. } => {
                        assert_eq!(data[0], b'0' + j as u8);
                        assert_eq!(data.len(), 40);
                    }
                    other => panic!("unexpected item {:?}", other),
                }
            }
        }
        ctx.fput(dup, false);

        // Cursor on a moved item follows it; the key cursor stays.
        assert_eq!(cursors[0], CursorAdjust { pgno: root, indx: 2 });
        assert_eq!(cursors[1], CursorAdjust { pgno: 1, indx: 0 });
    }

    #[test]
    fn test_promote_unsorted_uses_recno_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = TestCtx::new(dir.path());
        let pin = build_dup_leaf(&ctx, 6, 40);
        let root = promote_duplicates(&mut ctx, &pin, 0, false, &mut []).unwrap();
        ctx.fput(pin, true);
        let dup = ctx.fget(root, false).unwrap();
        assert_eq!(page::ptype(&dup.read()), PageType::LRecno);
        ctx.fput(dup, false);
    }
}
