//! Database handles and access methods.
//!
//! A [`Database`] is one named file of pages inside an environment:
//! page 0 is its metadata page, the rest belong to the access method.
//! Each access method is a value implementing the [`AccessMethod`]
//! capability set; the buffer cache and the recovery dispatcher only
//! ever see the trait object. B-tree is fully built here; hash carries
//! its page codec but returns "not configured" from its operations, as
//! do recno and queue.
//!
//! The B-tree keeps sorted `{key, data}` pairs on a chain of leaf
//! pages, with duplicate keys repeated. Items larger than a quarter
//! page spill to overflow chains; a key's duplicate set that outgrows
//! its page moves to an off-page tree.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

use crate::dbreg::{DbBinding, FnameHandle, DBREG_INVALID_ID};
use crate::env::EnvInner;
use crate::log::records::{AddremArgs, DbregRegisterArgs, RelinkArgs, OP_ADD, OP_REM};
use crate::log::{Lsn, PutFlag};
use crate::mpool::{GetFlag, MpfId, PagePin};
use crate::page::codec::{BtreeCodec, CodecCtx, HashCodec, PageIo, QueueCodec};
use crate::page::dups::{promote_duplicates, should_promote};
use crate::page::overflow::{
    build_overflow, delete_overflow_chain, match_overflow, read_overflow, OvContext,
};
use crate::page::slots::{delete_item, insert_item, insert_space, partial_size};
use crate::page::{
    self, bkeydata_size, init_page, Item, MetaHeader, PageType, BOVERFLOW_SIZE, BTREE_MAGIC,
    BTREE_VERSION, HASH_MAGIC, LEAFLEVEL, PGNO_INVALID, QUEUE_MAGIC,
};
use crate::rep::RepRole;
use crate::{Error, Result};

/// Access-method types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DbType {
    Btree,
    Hash,
    Recno,
    Queue,
}

impl DbType {
    pub fn code(&self) -> u32 {
        match self {
            DbType::Btree => 1,
            DbType::Hash => 2,
            DbType::Recno => 3,
            DbType::Queue => 4,
        }
    }

    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            1 => DbType::Btree,
            2 => DbType::Hash,
            3 => DbType::Recno,
            4 => DbType::Queue,
            _ => return None,
        })
    }
}

/// Memory modes for data returned through a [`Dbt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbtMode {
    /// The library allocates a fresh buffer.
    Alloc,
    /// Caller-owned buffer of `ulen` bytes; the result must fit.
    UserMem { ulen: u32 },
    /// The library reuses and grows the caller's buffer.
    Realloc,
    /// Internal scratch buffer reused across calls.
    Scratch,
}

/// A key/data thunk: how results are returned and, for partial
/// operations, which byte window is touched.
#[derive(Debug, Clone)]
pub struct Dbt {
    pub mode: DbtMode,
    /// Result bytes.
    pub data: Vec<u8>,
    /// Logical size of the result; on `BufferSmall` the size that would
    /// have been needed.
    pub size: u32,
    pub doff: u32,
    pub dlen: u32,
    pub partial: bool,
}

impl Dbt {
    pub fn alloc() -> Self {
        Dbt {
            mode: DbtMode::Alloc,
            data: Vec::new(),
            size: 0,
            doff: 0,
            dlen: 0,
            partial: false,
        }
    }

    pub fn user_mem(ulen: u32) -> Self {
        Dbt {
            mode: DbtMode::UserMem { ulen },
            ..Dbt::alloc()
        }
    }

    pub fn realloc(buf: Vec<u8>) -> Self {
        Dbt {
            mode: DbtMode::Realloc,
            data: buf,
            ..Dbt::alloc()
        }
    }

    pub fn scratch() -> Self {
        Dbt {
            mode: DbtMode::Scratch,
            ..Dbt::alloc()
        }
    }

    /// Restrict the operation to `dlen` bytes starting at `doff`.
    pub fn with_partial(mut self, doff: u32, dlen: u32) -> Self {
        self.doff = doff;
        self.dlen = dlen;
        self.partial = true;
        self
    }

    /// Fill from an in-memory value, honoring mode and partial window.
    pub(crate) fn fill(&mut self, value: &[u8]) -> Result<()> {
        let (start, needed) = if self.partial {
            let start = self.doff.min(value.len() as u32);
            let avail = value.len() as u32 - start;
            (start, self.dlen.min(avail))
        } else {
            (0, value.len() as u32)
        };
        if let DbtMode::UserMem { ulen } = self.mode {
            if needed > ulen {
                self.size = needed;
                return Err(Error::BufferSmall(needed));
            }
        }
        self.data.clear();
        self.data
            .extend_from_slice(&value[start as usize..(start + needed) as usize]);
        self.size = needed;
        Ok(())
    }
}

/// Modes for [`Database::put_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the data of an existing key.
    Overwrite,
    /// Fail with `KeyExists` if the key is present.
    NoOverwrite,
    /// Add another `{key, data}` pair after the key's existing pairs.
    AddDup,
}

/// Point-in-time statistics for one database.
#[derive(Debug, Clone, Serialize)]
pub struct DbStat {
    pub dbtype: DbType,
    pub page_size: u32,
    /// Number of `{key, data}` pairs.
    pub entries: u64,
    /// Pages in the file.
    pub pages: u32,
}

/// The capability set every access method provides. The environment
/// holds only the trait object; stubs for unbuilt methods return
/// [`Error::NotConfigured`] rather than panicking.
pub trait AccessMethod: Send + Sync {
    /// The page conversion hooks installed into the buffer cache.
    fn codec(&self) -> Arc<dyn PageIo>;
    fn cursor_get(
        &self,
        db: &Database,
        pos: Option<(u32, usize)>,
    ) -> Result<Option<((u32, usize), Vec<u8>, Vec<u8>)>>;
    fn get(&self, db: &Database, txn: Option<u32>, key: &[u8], dbt: &mut Dbt) -> Result<()>;
    fn cursor_put(
        &self,
        db: &Database,
        txn: Option<u32>,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> Result<()>;
    fn cursor_del(&self, db: &Database, txn: Option<u32>, key: &[u8]) -> Result<()>;
    fn stat(&self, db: &Database) -> Result<DbStat>;
    fn sync(&self, db: &Database) -> Result<()>;
    fn close(&self, db: &Database) -> Result<()>;
}

/// An open database.
pub struct Database {
    pub(crate) env: Arc<EnvInner>,
    name: String,
    dbtype: DbType,
    page_size: u32,
    pub(crate) mpf: MpfId,
    pub(crate) fname: FnameHandle,
    method: Arc<dyn AccessMethod>,
    closed: AtomicBool,
    /// Serializes structural edits (splits, promotions) on this
    /// database.
    write_lock: Mutex<()>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dbtype(&self) -> DbType {
        self.dbtype
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The dbreg id currently bound to this database.
    pub fn fileid(&self) -> i32 {
        let reg = self.env.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.fname(self.fname).map_or(DBREG_INVALID_ID, |f| f.id)
    }

    fn check_open(&self) -> Result<()> {
        self.env.check_panic()?;
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(Error::Invalid(format!("database {} is closed", self.name)));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.env.rep_role() == RepRole::Client {
            return Err(Error::Invalid(
                "attempted to modify a database on a replication client".into(),
            ));
        }
        Ok(())
    }

    /// Fetch the data for `key` into a fresh buffer.
    pub fn get(&self, txn: Option<crate::env::TxnHandle>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut dbt = Dbt::alloc();
        match self.get_dbt(txn, key, &mut dbt) {
            Ok(()) => Ok(Some(dbt.data)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch the data for `key` under the caller's memory mode and
    /// partial window.
    pub fn get_dbt(
        &self,
        txn: Option<crate::env::TxnHandle>,
        key: &[u8],
        dbt: &mut Dbt,
    ) -> Result<()> {
        self.check_open()?;
        self.method.get(self, txn.map(|t| t.0), key, dbt)
    }

    /// Store `data` under `key`, replacing any existing data.
    pub fn put(
        &self,
        txn: Option<crate::env::TxnHandle>,
        key: &[u8],
        data: &[u8],
    ) -> Result<()> {
        self.put_mode(txn, key, data, PutMode::Overwrite)
    }

    /// Store with explicit duplicate/overwrite behavior.
    pub fn put_mode(
        &self,
        txn: Option<crate::env::TxnHandle>,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        self.method
            .cursor_put(self, txn.map(|t| t.0), key, data, mode)
    }

    /// Replace `dlen` bytes at `doff` of the existing value with `data`.
    pub fn put_partial(
        &self,
        txn: Option<crate::env::TxnHandle>,
        key: &[u8],
        data: &[u8],
        doff: u32,
        dlen: u32,
    ) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        let old = self.get(txn, key)?.unwrap_or_default();
        let nbytes = old.len() as u32;
        let new_size = partial_size(nbytes, doff, dlen, data.len() as u32);
        let mut new = Vec::with_capacity(new_size as usize);
        // Prefix, zero-padded if the old value is short of doff.
        let take = (doff as usize).min(old.len());
        new.extend_from_slice(&old[..take]);
        new.resize(doff as usize, 0);
        new.extend_from_slice(data);
        let tail = (doff + dlen) as usize;
        if tail < old.len() {
            new.extend_from_slice(&old[tail..]);
        }
        debug_assert_eq!(new.len() as u32, new_size);
        self.put_mode(txn, key, &new, PutMode::Overwrite)
    }

    /// Delete `key` (its first pair) and any storage it owns.
    pub fn del(&self, txn: Option<crate::env::TxnHandle>, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.check_writable()?;
        self.method.cursor_del(self, txn.map(|t| t.0), key)
    }

    /// Open a forward scan over the database.
    pub fn cursor(self: &Arc<Self>) -> DbCursor {
        DbCursor {
            db: Arc::clone(self),
            pos: None,
            done: false,
        }
    }

    pub fn stat(&self) -> Result<DbStat> {
        self.check_open()?;
        self.method.stat(self)
    }

    /// Flush this database's dirty pages.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.method.sync(self)
    }

    /// Close the handle: sync, log the dbreg close, release the id.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        self.closed.store(true, AtomicOrdering::Release);
        self.method.close(self)?;
        {
            let mut reg = self.env.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.teardown(self.fname);
        }
        let mut dbs = self.env.databases.lock().unwrap_or_else(|e| e.into_inner());
        dbs.remove(&self.name);
        Ok(())
    }
}

/// Forward iterator over `{key, data}` pairs.
pub struct DbCursor {
    db: Arc<Database>,
    pos: Option<(u32, usize)>,
    done: bool,
}

impl DbCursor {
    /// Fetch the next pair, materializing overflow items.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        self.db.check_open()?;
        match self.db.method.cursor_get(&self.db, self.pos)? {
            Some((pos, key, data)) => {
                self.pos = Some(pos);
                Ok(Some((key, data)))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

// ── Operation context ───────────────────────────────────────────────────

/// Per-operation context wiring the page primitives to the environment.
struct DbOpCtx<'a> {
    db: &'a Database,
    txn: Option<u32>,
    fileid: i32,
}

impl<'a> DbOpCtx<'a> {
    fn new(db: &'a Database, txn: Option<u32>) -> Self {
        DbOpCtx {
            db,
            txn,
            fileid: db.fileid(),
        }
    }

    fn log_addrem(
        &mut self,
        opcode: u32,
        pin: &PagePin,
        indx: usize,
        hdr: &[u8],
        data: &[u8],
        nbytes: usize,
    ) -> Result<()> {
        if !self.logging() {
            return Ok(());
        }
        let args = AddremArgs {
            txnid: self.txnid(),
            prev_lsn: self.prev_lsn(),
            opcode,
            fileid: self.fileid,
            pgno: pin.pgno(),
            indx: indx as u32,
            nbytes: nbytes as u32,
            hdr: hdr.to_vec(),
            data: data.to_vec(),
            pagelsn: page::lsn(&pin.read()),
        };
        let lsn = self.log_put(&args.encode())?;
        page::set_lsn(&mut pin.write(), lsn);
        Ok(())
    }

    /// Logged insert of a pre-encoded item.
    fn put_item(&mut self, pin: &PagePin, indx: usize, item: &[u8]) -> Result<()> {
        self.log_addrem(OP_ADD, pin, indx, item, &[], item.len())?;
        insert_item(&mut pin.write(), indx, Some(item), &[])
    }

    /// Logged delete of the item at `indx`.
    fn del_item(&mut self, pin: &PagePin, indx: usize) -> Result<()> {
        let (item, nbytes) = {
            let buf = pin.read();
            let off = page::inp(&buf, indx) as usize;
            let size = Item::size_on_page(&buf, indx);
            (buf[off..off + size].to_vec(), size)
        };
        self.log_addrem(OP_REM, pin, indx, &item, &[], nbytes)?;
        delete_item(&mut pin.write(), indx, nbytes)
    }
}

impl OvContext for DbOpCtx<'_> {
    fn page_size(&self) -> u32 {
        self.db.page_size
    }

    fn fileid(&self) -> i32 {
        self.fileid
    }

    fn txnid(&self) -> u32 {
        self.txn.unwrap_or(0)
    }

    fn prev_lsn(&self) -> Lsn {
        match self.txn {
            Some(id) => {
                let txns = self.db.env.txns.lock().unwrap_or_else(|e| e.into_inner());
                txns.prev_lsn(id)
            }
            None => Lsn::ZERO,
        }
    }

    fn logging(&self) -> bool {
        true
    }

    fn log_put(&mut self, body: &[u8]) -> Result<Lsn> {
        let lsn = self.db.env.log_put_internal(body, PutFlag::None)?;
        if let Some(id) = self.txn {
            let mut txns = self.db.env.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.record_write(id, lsn);
        }
        crate::rep::process::stream_new_records(&self.db.env);
        Ok(lsn)
    }

    fn fget(&self, pgno: u32, create: bool) -> Result<PagePin> {
        self.db.env.mpool.fget(
            self.db.mpf,
            pgno,
            if create { GetFlag::Create } else { GetFlag::None },
        )
    }

    fn fput(&self, pin: PagePin, dirty: bool) {
        self.db.env.mpool.fput(pin, dirty);
    }

    fn new_page(&mut self) -> Result<PagePin> {
        let meta = self.fget(0, false)?;
        // Prefer the free list; fall back to extending the file.
        let free_head = page::meta_free(&meta.read());
        if free_head != PGNO_INVALID {
            let pin = self.fget(free_head, false)?;
            if page::ptype(&pin.read()) == PageType::Invalid {
                let next = page::next_pgno(&pin.read());
                page::set_meta_free(&mut meta.write(), next);
                self.fput(meta, true);
                {
                    let mut buf = pin.write();
                    buf.fill(0);
                }
                return Ok(pin);
            }
            self.fput(pin, false);
        }
        let last = page::meta_last_pgno(&meta.read());
        let pgno = last + 1;
        page::set_meta_last_pgno(&mut meta.write(), pgno);
        self.fput(meta, true);
        self.fget(pgno, true)
    }

    fn free_page(&mut self, pin: PagePin) -> Result<()> {
        let meta = self.fget(0, false)?;
        let pgno = pin.pgno();
        let old_head = page::meta_free(&meta.read());
        {
            let mut buf = pin.write();
            let lsn = page::lsn(&buf);
            init_page(&mut buf, pgno, PGNO_INVALID, old_head, 0, PageType::Invalid);
            page::set_lsn(&mut buf, lsn);
            page::set_next_pgno(&mut buf, old_head);
        }
        page::set_meta_free(&mut meta.write(), pgno);
        self.fput(meta, true);
        self.fput(pin, true);
        Ok(())
    }
}

// ── B-tree ──────────────────────────────────────────────────────────────

/// Items bigger than a quarter page go to overflow chains.
fn overflow_threshold(page_size: u32) -> usize {
    page_size as usize / 4
}

/// Where a search landed.
struct SearchPos {
    pgno: u32,
    /// Pair start slot: the key slot of the match or insertion point.
    indx: usize,
    exact: bool,
}

/// The built-in B-tree access method.
pub struct BtreeMethod;

impl BtreeMethod {
    /// Compare `key` against the key item at `indx`.
    fn cmp_key(
        ctx: &mut DbOpCtx<'_>,
        buf: &[u8],
        indx: usize,
        key: &[u8],
    ) -> Result<Ordering> {
        match Item::decode(buf, indx)
            .ok_or_else(|| Error::Corrupt("undecodable key item".into()))?
        {
            Item::KeyData { data, .. } => Ok(key.cmp(&data)),
            Item::Overflow { pgno, tlen, .. } => match_overflow(ctx, key, pgno, tlen, None),
            Item::Duplicate { .. } => {
                Err(Error::Corrupt("duplicate item in key slot".into()))
            }
        }
    }

    /// Walk the leaf chain for `key`. Returns the match or the
    /// insertion point.
    fn search(ctx: &mut DbOpCtx<'_>, key: &[u8]) -> Result<SearchPos> {
        let root = {
            let meta = ctx.fget(0, false)?;
            let root = page::meta_root(&meta.read());
            ctx.fput(meta, false);
            root
        };
        let mut pgno = root;
        loop {
            let pin = ctx.fget(pgno, false)?;
            let (entries, next) = {
                let buf = pin.read();
                (page::entries(&buf) as usize, page::next_pgno(&buf))
            };
            let mut indx = 0;
            while indx < entries {
                let ord = {
                    let buf = pin.read();
                    Self::cmp_key(ctx, &buf, indx, key)?
                };
                match ord {
                    Ordering::Equal => {
                        ctx.fput(pin, false);
                        return Ok(SearchPos {
                            pgno,
                            indx,
                            exact: true,
                        });
                    }
                    Ordering::Less => {
                        ctx.fput(pin, false);
                        return Ok(SearchPos {
                            pgno,
                            indx,
                            exact: false,
                        });
                    }
                    Ordering::Greater => indx += 2,
                }
            }
            ctx.fput(pin, false);
            if next == PGNO_INVALID {
                return Ok(SearchPos {
                    pgno,
                    indx: entries,
                    exact: false,
                });
            }
            pgno = next;
        }
    }

    /// Encode `bytes` as an item, spilling to overflow when large.
    fn build_item(ctx: &mut DbOpCtx<'_>, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() > overflow_threshold(ctx.page_size()) {
            let first = build_overflow(ctx, bytes)?;
            Ok(Item::Overflow {
                deleted: false,
                pgno: first,
                tlen: bytes.len() as u32,
            }
            .encode())
        } else {
            Ok(Item::KeyData {
                deleted: false,
                data: bytes.to_vec(),
            }
            .encode())
        }
    }

    /// Split `pgno`, moving its upper half of pairs to a fresh leaf
    /// chained after it.
    fn split(ctx: &mut DbOpCtx<'_>, pgno: u32) -> Result<()> {
        let left = ctx.fget(pgno, false)?;
        let (entries, old_next) = {
            let buf = left.read();
            (page::entries(&buf) as usize, page::next_pgno(&buf))
        };
        if entries < 4 {
            // A page with a single oversized pair cannot split further.
            ctx.fput(left, false);
            return Err(Error::PageFull);
        }
        let mut half = entries / 2;
        half &= !1; // pair boundary

        let right = ctx.new_page()?;
        let right_pgno = right.pgno();
        {
            let mut buf = right.write();
            init_page(
                &mut buf,
                right_pgno,
                pgno,
                old_next,
                LEAFLEVEL,
                PageType::LBtree,
            );
        }

        // Log the chain rewire before moving items so redo rebuilds in
        // the same order.
        if ctx.logging() {
            let args = RelinkArgs {
                txnid: ctx.txnid(),
                prev_lsn: ctx.prev_lsn(),
                opcode: OP_ADD,
                fileid: ctx.fileid,
                pgno: right_pgno,
                pagelsn: page::lsn(&right.read()),
                prev_pgno: pgno,
                prevlsn: page::lsn(&left.read()),
                next_pgno: old_next,
                nextlsn: if old_next == PGNO_INVALID {
                    Lsn::ZERO
                } else {
                    let nxt = ctx.fget(old_next, false)?;
                    let lsn = page::lsn(&nxt.read());
                    ctx.fput(nxt, false);
                    lsn
                },
            };
            let lsn = ctx.log_put(&args.encode())?;
            page::set_lsn(&mut right.write(), lsn);
            page::set_lsn(&mut left.write(), lsn);
        }
        page::set_next_pgno(&mut left.write(), right_pgno);
        if old_next != PGNO_INVALID {
            let nxt = ctx.fget(old_next, false)?;
            page::set_prev_pgno(&mut nxt.write(), right_pgno);
            ctx.fput(nxt, true);
        }

        // Move items: copy up, then strip down from the top.
        let moved: Vec<Vec<u8>> = {
            let buf = left.read();
            (half..entries)
                .map(|i| {
                    let off = page::inp(&buf, i) as usize;
                    let size = Item::size_on_page(&buf, i);
                    buf[off..off + size].to_vec()
                })
                .collect()
        };
        for (j, item) in moved.iter().enumerate() {
            ctx.put_item(&right, j, item)?;
        }
        for i in (half..entries).rev() {
            ctx.del_item(&left, i)?;
        }

        ctx.fput(left, true);
        ctx.fput(right, true);
        Ok(())
    }

    /// Free an off-page duplicate tree, releasing any overflow chains
    /// its items reference.
    fn free_dup_tree(ctx: &mut DbOpCtx<'_>, root: u32) -> Result<()> {
        let pin = ctx.fget(root, false)?;
        let entries = page::entries(&pin.read()) as usize;
        for i in (0..entries).rev() {
            let item = Item::decode(&pin.read(), i);
            if let Some(Item::Overflow { pgno, .. }) = item {
                delete_overflow_chain(ctx, pgno)?;
            }
            ctx.del_item(&pin, i)?;
        }
        ctx.free_page(pin)
    }

    /// Release whatever storage a data item owns, then delete it.
    fn drop_data_item(ctx: &mut DbOpCtx<'_>, pin: &PagePin, indx: usize) -> Result<()> {
        match Item::decode(&pin.read(), indx) {
            Some(Item::Overflow { pgno, .. }) => delete_overflow_chain(ctx, pgno)?,
            Some(Item::Duplicate { root, .. }) => Self::free_dup_tree(ctx, root)?,
            _ => {}
        }
        ctx.del_item(pin, indx)
    }
}

impl AccessMethod for BtreeMethod {
    fn codec(&self) -> Arc<dyn PageIo> {
        Arc::new(BtreeCodec)
    }

    fn get(&self, db: &Database, txn: Option<u32>, key: &[u8], dbt: &mut Dbt) -> Result<()> {
        let mut ctx = DbOpCtx::new(db, txn);
        let pos = Self::search(&mut ctx, key)?;
        if !pos.exact {
            return Err(Error::NotFound);
        }
        let pin = ctx.fget(pos.pgno, false)?;
        let item = Item::decode(&pin.read(), pos.indx + 1)
            .ok_or_else(|| Error::Corrupt("undecodable data item".into()))?;
        let result = match item {
            Item::KeyData { deleted: true, .. } => Err(Error::NotFound),
            Item::KeyData { data, .. } => dbt.fill(&data),
            Item::Overflow { pgno, tlen, .. } => {
                ctx.fput(pin, false);
                return read_overflow(&mut ctx, dbt, tlen, pgno);
            }
            Item::Duplicate { root, .. } => {
                // A get on a promoted key returns the first duplicate.
                ctx.fput(pin, false);
                let dup = ctx.fget(root, false)?;
                let first = Item::decode(&dup.read(), 0)
                    .ok_or_else(|| Error::Corrupt("empty duplicate tree".into()))?;
                let r = match first {
                    Item::KeyData { data, .. } => dbt.fill(&data),
                    Item::Overflow { pgno, tlen, .. } => {
                        ctx.fput(dup, false);
                        return read_overflow(&mut ctx, dbt, tlen, pgno);
                    }
                    Item::Duplicate { .. } => {
                        Err(Error::Corrupt("nested duplicate tree".into()))
                    }
                };
                ctx.fput(dup, false);
                return r;
            }
        };
        ctx.fput(pin, false);
        result
    }

    fn cursor_get(
        &self,
        db: &Database,
        pos: Option<(u32, usize)>,
    ) -> Result<Option<((u32, usize), Vec<u8>, Vec<u8>)>> {
        let mut ctx = DbOpCtx::new(db, None);
        let (mut pgno, mut indx) = match pos {
            Some((p, i)) => (p, i + 2),
            None => {
                let meta = ctx.fget(0, false)?;
                let root = page::meta_root(&meta.read());
                ctx.fput(meta, false);
                (root, 0)
            }
        };
        loop {
            let pin = ctx.fget(pgno, false)?;
            let (entries, next) = {
                let buf = pin.read();
                (page::entries(&buf) as usize, page::next_pgno(&buf))
            };
            if indx + 1 < entries {
                let key_item = Item::decode(&pin.read(), indx);
                let data_item = Item::decode(&pin.read(), indx + 1);
                ctx.fput(pin, false);
                let key = match key_item {
                    Some(Item::KeyData { deleted: false, data }) => data,
                    Some(Item::Overflow { deleted: false, pgno, tlen }) => {
                        let mut dbt = Dbt::alloc();
                        read_overflow(&mut ctx, &mut dbt, tlen, pgno)?;
                        dbt.data
                    }
                    _ => {
                        indx += 2;
                        continue;
                    }
                };
                let data = match data_item {
                    Some(Item::KeyData { deleted: false, data }) => data,
                    Some(Item::Overflow { deleted: false, pgno, tlen }) => {
                        let mut dbt = Dbt::alloc();
                        read_overflow(&mut ctx, &mut dbt, tlen, pgno)?;
                        dbt.data
                    }
                    Some(Item::Duplicate { deleted: false, root }) => {
                        let dup = ctx.fget(root, false)?;
                        let first = Item::decode(&dup.read(), 0);
                        ctx.fput(dup, false);
                        match first {
                            Some(Item::KeyData { data, .. }) => data,
                            _ => {
                                indx += 2;
                                continue;
                            }
                        }
                    }
                    _ => {
                        indx += 2;
                        continue;
                    }
                };
                return Ok(Some(((pgno, indx), key, data)));
            }
            ctx.fput(pin, false);
            if next == PGNO_INVALID {
                return Ok(None);
            }
            pgno = next;
            indx = 0;
        }
    }

    fn cursor_put(
        &self,
        db: &Database,
        txn: Option<u32>,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> Result<()> {
        let _guard = db.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut ctx = DbOpCtx::new(db, txn);

        // A split moves the insertion point, so search again after one.
        for _ in 0..4 {
            let pos = Self::search(&mut ctx, key)?;

            if pos.exact && mode == PutMode::NoOverwrite {
                return Err(Error::KeyExists);
            }

            if pos.exact && mode == PutMode::Overwrite {
                let new_est = Self::item_size_for(db.page_size, data);
                let pin = ctx.fget(pos.pgno, false)?;
                let old_size = Item::size_on_page(&pin.read(), pos.indx + 1);
                if page::free_space(&pin.read()) + old_size < new_est {
                    ctx.fput(pin, false);
                    Self::split(&mut ctx, pos.pgno)?;
                    continue;
                }
                Self::drop_data_item(&mut ctx, &pin, pos.indx + 1)?;
                let data_item = Self::build_item(&mut ctx, data)?;
                ctx.put_item(&pin, pos.indx + 1, &data_item)?;
                ctx.fput(pin, true);
                return Ok(());
            }

            let need = insert_space(Self::item_size_for(db.page_size, key))
                + insert_space(Self::item_size_for(db.page_size, data));
            let pin = ctx.fget(pos.pgno, false)?;
            if page::free_space(&pin.read()) < need {
                ctx.fput(pin, false);
                Self::split(&mut ctx, pos.pgno)?;
                continue;
            }

            // Fresh pair, either a new key or an additional duplicate
            // placed after the key's existing pairs.
            let indx = if pos.exact && mode == PutMode::AddDup {
                let entries = page::entries(&pin.read()) as usize;
                let mut i = pos.indx;
                loop {
                    let same = {
                        let buf = pin.read();
                        i < entries
                            && matches!(
                                Self::cmp_key(&mut ctx, &buf, i, key),
                                Ok(Ordering::Equal)
                            )
                    };
                    if !same {
                        break;
                    }
                    i += 2;
                }
                i
            } else {
                pos.indx
            };

            let key_item = Self::build_item(&mut ctx, key)?;
            let data_item = Self::build_item(&mut ctx, data)?;
            ctx.put_item(&pin, indx, &key_item)?;
            ctx.put_item(&pin, indx + 1, &data_item)?;

            // A grown duplicate set may now belong off-page.
            if mode == PutMode::AddDup && should_promote(&pin.read(), indx, db.page_size) {
                promote_duplicates(&mut ctx, &pin, indx, true, &mut [])?;
            }
            ctx.fput(pin, true);
            return Ok(());
        }
        Err(Error::PageFull)
    }

    fn cursor_del(&self, db: &Database, txn: Option<u32>, key: &[u8]) -> Result<()> {
        let _guard = db.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut ctx = DbOpCtx::new(db, txn);
        let pos = Self::search(&mut ctx, key)?;
        if !pos.exact {
            return Err(Error::NotFound);
        }
        let pin = ctx.fget(pos.pgno, false)?;
        Self::drop_data_item(&mut ctx, &pin, pos.indx + 1)?;
        // The key slot: release an overflow key's chain too.
        if let Some(Item::Overflow { pgno, .. }) = Item::decode(&pin.read(), pos.indx) {
            delete_overflow_chain(&mut ctx, pgno)?;
        }
        ctx.del_item(&pin, pos.indx)?;
        ctx.fput(pin, true);
        Ok(())
    }

    fn stat(&self, db: &Database) -> Result<DbStat> {
        let mut ctx = DbOpCtx::new(db, None);
        let meta = ctx.fget(0, false)?;
        let root = page::meta_root(&meta.read());
        let last = page::meta_last_pgno(&meta.read());
        ctx.fput(meta, false);

        let mut entries = 0u64;
        let mut pgno = root;
        while pgno != PGNO_INVALID {
            let pin = ctx.fget(pgno, false)?;
            entries += page::entries(&pin.read()) as u64 / 2;
            let next = page::next_pgno(&pin.read());
            ctx.fput(pin, false);
            pgno = next;
        }
        Ok(DbStat {
            dbtype: db.dbtype,
            page_size: db.page_size,
            entries,
            pages: last + 1,
        })
    }

    fn sync(&self, db: &Database) -> Result<()> {
        db.env.sync_pages()
    }

    fn close(&self, db: &Database) -> Result<()> {
        db.env.sync_pages()?;
        db.env.dbreg_close_id(db.fname, None)?;
        db.env.mpool.fclose(db.mpf);
        Ok(())
    }
}

impl BtreeMethod {
    /// On-page size an item for `bytes` will need, without building it.
    fn item_size_for(page_size: u32, bytes: &[u8]) -> usize {
        if bytes.len() > overflow_threshold(page_size) {
            BOVERFLOW_SIZE
        } else {
            bkeydata_size(bytes.len())
        }
    }
}

// ── Stub methods ────────────────────────────────────────────────────────

macro_rules! stub_method {
    ($name:ident, $codec:expr) => {
        pub struct $name;

        impl AccessMethod for $name {
            fn codec(&self) -> Arc<dyn PageIo> {
                Arc::new($codec)
            }
            fn cursor_get(
                &self,
                _db: &Database,
                _pos: Option<(u32, usize)>,
            ) -> Result<Option<((u32, usize), Vec<u8>, Vec<u8>)>> {
                Err(Error::NotConfigured)
            }
            fn get(
                &self,
                _db: &Database,
                _txn: Option<u32>,
                _key: &[u8],
                _dbt: &mut Dbt,
            ) -> Result<()> {
                Err(Error::NotConfigured)
            }
            fn cursor_put(
                &self,
                _db: &Database,
                _txn: Option<u32>,
                _key: &[u8],
                _data: &[u8],
                _mode: PutMode,
            ) -> Result<()> {
                Err(Error::NotConfigured)
            }
            fn cursor_del(&self, _db: &Database, _txn: Option<u32>, _key: &[u8]) -> Result<()> {
                Err(Error::NotConfigured)
            }
            fn stat(&self, _db: &Database) -> Result<DbStat> {
                Err(Error::NotConfigured)
            }
            fn sync(&self, db: &Database) -> Result<()> {
                db.env.sync_pages()
            }
            fn close(&self, db: &Database) -> Result<()> {
                db.env.sync_pages()?;
                db.env.dbreg_close_id(db.fname, None)?;
                db.env.mpool.fclose(db.mpf);
                Ok(())
            }
        }
    };
}

stub_method!(HashMethod, HashCodec);
stub_method!(RecnoMethod, BtreeCodec);
stub_method!(QueueMethod, QueueCodec);

fn method_for(dbtype: DbType) -> Arc<dyn AccessMethod> {
    match dbtype {
        DbType::Btree => Arc::new(BtreeMethod),
        DbType::Hash => Arc::new(HashMethod),
        DbType::Recno => Arc::new(RecnoMethod),
        DbType::Queue => Arc::new(QueueMethod),
    }
}

// ── Open / close ────────────────────────────────────────────────────────

fn expected_magic(dbtype: DbType) -> u32 {
    match dbtype {
        DbType::Btree | DbType::Recno => BTREE_MAGIC,
        DbType::Hash => HASH_MAGIC,
        DbType::Queue => QUEUE_MAGIC,
    }
}

#[cfg(unix)]
fn file_uid(path: &std::path::Path) -> [u8; 16] {
    use std::os::unix::fs::MetadataExt;
    let mut uid = [0u8; 16];
    if let Ok(m) = std::fs::metadata(path) {
        uid[0..8].copy_from_slice(&m.ino().to_be_bytes());
        uid[8..16].copy_from_slice(&m.dev().to_be_bytes());
    }
    uid
}

#[cfg(not(unix))]
fn file_uid(path: &std::path::Path) -> [u8; 16] {
    let mut uid = [0u8; 16];
    let name = path.to_string_lossy();
    let h = crc32c::crc32c(name.as_bytes());
    uid[0..4].copy_from_slice(&h.to_be_bytes());
    uid[4..8].copy_from_slice(&rand::random::<u32>().to_be_bytes());
    uid
}

fn db_path(inner: &EnvInner, name: &str) -> PathBuf {
    inner.dir.join(name)
}

/// Create the meta page and root leaf of a fresh database file.
fn create_db_file(inner: &Arc<EnvInner>, path: &PathBuf, dbtype: DbType) -> Result<()> {
    let ps = inner.config.page_size;
    let mut meta_page = vec![0u8; ps as usize];
    let meta = MetaHeader {
        lsn: Lsn::ZERO,
        pgno: 0,
        magic: expected_magic(dbtype),
        version: BTREE_VERSION,
        pagesize: ps,
        encrypt_alg: 0,
        ptype: match dbtype {
            DbType::Hash => PageType::HashMeta,
            DbType::Queue => PageType::QueueMeta,
            _ => PageType::BtreeMeta,
        },
        metaflags: 0,
        free: PGNO_INVALID,
        last_pgno: 1,
        key_count: 0,
        record_count: 0,
        flags: 0,
        uid: [0u8; 16],
        root: 1,
    };
    meta.write_to(&mut meta_page);

    let mut root = vec![0u8; ps as usize];
    init_page(
        &mut root,
        1,
        PGNO_INVALID,
        PGNO_INVALID,
        LEAFLEVEL,
        PageType::LBtree,
    );

    let mut bytes = meta_page;
    bytes.extend_from_slice(&root);
    std::fs::write(path, &bytes)
        .map_err(|e| Error::Io(format!("cannot create {}: {}", path.display(), e)))?;

    // Stamp the file identity now that the inode exists.
    let uid = file_uid(path);
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::Io(e.to_string()))?;
    use std::io::{Seek, SeekFrom, Write};
    f.seek(SeekFrom::Start(52)).map_err(|e| Error::Io(e.to_string()))?;
    f.write_all(&uid).map_err(|e| Error::Io(e.to_string()))?;
    f.sync_all().map_err(|e| Error::Io(e.to_string()))?;
    Ok(())
}

fn read_meta(path: &PathBuf) -> Result<(MetaHeader, bool)> {
    let bytes = std::fs::read(path).map_err(|e| Error::Io(format!("{}", e)))?;
    let meta = MetaHeader::parse(&bytes)
        .ok_or_else(|| Error::Corrupt(format!("{}: short metadata page", path.display())))?;
    Ok((meta, false))
}

/// How an open binds its dbreg id.
#[derive(Clone, Copy)]
enum RegisterAs {
    /// Allocate and log a fresh id; the master/standalone path.
    New(Option<u32>),
    /// Bind the id a log record dictates; recovery and replica replay.
    Assign(i32),
    /// Bind nothing; replication clients learn ids from the master's
    /// stream.
    Skip,
}

fn open_database_at(
    inner: &Arc<EnvInner>,
    name: &str,
    dbtype: DbType,
    register: RegisterAs,
) -> Result<Arc<Database>> {
    {
        let dbs = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(db) = dbs.get(name) {
            if db.dbtype != dbtype {
                return Err(Error::Invalid(format!(
                    "{} is already open with a different access method",
                    name
                )));
            }
            // A replayed registration may rebind the id of an
            // already-open handle.
            if let RegisterAs::Assign(id) = register {
                let gen = inner.rep_gen();
                let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
                if reg.handle_of_id(id) != Some(db.fname) {
                    reg.assign_id(db.fname, id, gen)?;
                }
                reg.bind(
                    id,
                    DbBinding {
                        mpf: db.mpf,
                        page_size: db.page_size,
                    },
                );
            }
            return Ok(Arc::clone(db));
        }
    }

    let path = db_path(inner, name);
    if !path.exists() {
        create_db_file(inner, &path, dbtype)?;
    }

    let (meta, _) = read_meta(&path)?;
    let expected = expected_magic(dbtype);
    let needs_swap = match crate::page::codec::needs_swap_from_magic(meta.magic, expected) {
        Some(s) => s,
        None => {
            return Err(Error::Corrupt(format!(
                "{}: bad metadata magic {:#x}",
                name, meta.magic
            )))
        }
    };
    if !needs_swap && meta.version != BTREE_VERSION {
        return Err(Error::Corrupt(format!(
            "{}: unsupported version {}",
            name, meta.version
        )));
    }
    if meta.encrypt_alg != 0 {
        return Err(Error::NotConfigured);
    }
    let page_size = if needs_swap {
        meta.pagesize.swap_bytes()
    } else {
        meta.pagesize
    };

    let method = method_for(dbtype);
    let ctx = CodecCtx {
        page_size,
        needs_swap,
    };
    let mpf = inner.mpool.fopen(&path, page_size, ctx, Some(method.codec()));

    let create_txnid = match register {
        RegisterAs::New(txn) => txn.unwrap_or(0),
        _ => 0,
    };
    let uid = file_uid(&path);
    let fname = {
        let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.setup(Some(name), uid, dbtype, 0, create_txnid)
    };

    let db = Arc::new(Database {
        env: Arc::clone(inner),
        name: name.to_string(),
        dbtype,
        page_size,
        mpf,
        fname,
        method,
        closed: AtomicBool::new(false),
        write_lock: Mutex::new(()),
    });

    match register {
        RegisterAs::New(txn) => {
            let id = inner.dbreg_new_id(fname, txn)?;
            let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.bind(id, DbBinding { mpf, page_size });
        }
        RegisterAs::Assign(id) => {
            // Bind the id the log dictates, silently displacing any
            // current owner.
            let gen = inner.rep_gen();
            let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.assign_id(fname, id, gen)?;
            reg.bind(id, DbBinding { mpf, page_size });
        }
        RegisterAs::Skip => {}
    }

    let mut dbs = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
    dbs.insert(name.to_string(), Arc::clone(&db));
    Ok(db)
}

/// Open (creating if needed) a database; the normal application path.
/// Replication clients bind no id of their own — the master's stream
/// dictates ids.
pub(crate) fn open_database(
    inner: &Arc<EnvInner>,
    name: &str,
    dbtype: DbType,
    txn: Option<u32>,
) -> Result<Arc<Database>> {
    let register = if inner.rep_role() == RepRole::Client {
        RegisterAs::Skip
    } else {
        RegisterAs::New(txn)
    };
    open_database_at(inner, name, dbtype, register)
}

/// Open a database named by a `dbreg_register` record during recovery
/// or replication replay. A missing file is created: on a replica it
/// legitimately does not exist yet, and after a crash the creation is
/// deterministic.
pub(crate) fn recover_open(inner: &Arc<EnvInner>, args: &DbregRegisterArgs) -> Result<()> {
    let name = String::from_utf8_lossy(&args.name).to_string();
    if name.is_empty() {
        return Ok(());
    }
    {
        let reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = reg.handle_of_id(args.fileid) {
            if reg.fname(h).map(|f| f.name.as_deref()) == Some(Some(name.as_str())) {
                // Already open under this id.
                return Ok(());
            }
        }
    }
    let dbtype = DbType::from_u32(args.ftype)
        .ok_or_else(|| Error::Corrupt(format!("bad access method code {}", args.ftype)))?;
    let path = db_path(inner, &name);
    if !path.exists() {
        warn!(file = %name, "registered database file missing; creating empty");
    }
    open_database_at(inner, &name, dbtype, RegisterAs::Assign(args.fileid))?;
    Ok(())
}

/// Close the database bound to a logged id, if open.
pub(crate) fn recover_close(inner: &EnvInner, args: &DbregRegisterArgs) -> Result<()> {
    let name = {
        let reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.handle_of_id(args.fileid)
            .and_then(|h| reg.fname(h))
            .and_then(|f| f.name.clone())
    };
    let db = name.and_then(|n| {
        let dbs = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
        dbs.get(&n).cloned()
    });
    if let Some(db) = db {
        close_internal(inner, &db)?;
    }
    Ok(())
}

/// Close one database without logging (recovery and shutdown paths log
/// through the normal close instead when appropriate).
fn close_internal(inner: &EnvInner, db: &Database) -> Result<()> {
    db.closed.store(true, AtomicOrdering::Release);
    inner.sync_pages()?;
    let gen = inner.rep_gen();
    {
        let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.revoke_id(db.fname, gen);
        reg.teardown(db.fname);
    }
    inner.mpool.fclose(db.mpf);
    let mut dbs = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
    dbs.remove(&db.name);
    Ok(())
}

/// Drop every database handle and its cached pages without writing
/// anything. Internal initialization uses this before the master's
/// pages overwrite the files underneath.
pub(crate) fn discard_all(inner: &Arc<EnvInner>) -> Result<()> {
    let dbs: Vec<Arc<Database>> = {
        let mut map = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
        let v = map.values().cloned().collect();
        map.clear();
        v
    };
    let gen = inner.rep_gen();
    for db in dbs {
        db.closed.store(true, AtomicOrdering::Release);
        {
            let mut reg = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.revoke_id(db.fname, gen);
            reg.teardown(db.fname);
        }
        inner.mpool.fclose(db.mpf);
    }
    Ok(())
}

/// Close every open database. During recovery closes are silent; at
/// normal shutdown each close is logged.
pub(crate) fn close_all(inner: &Arc<EnvInner>) -> Result<()> {
    let dbs: Vec<Arc<Database>> = {
        let map = inner.databases.lock().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    };
    let recovering = inner.recovering.load(AtomicOrdering::Acquire);
    for db in dbs {
        if recovering {
            close_internal(inner, &db)?;
        } else if !db.closed.load(AtomicOrdering::Acquire) {
            db.close()?;
        }
    }
    Ok(())
}
