//! Buffer cache.
//!
//! Pages are owned by the cache; access-method code borrows them through
//! [`Mpool::fget`] (pin) and returns them with [`Mpool::fput`] (unpin,
//! optionally marking dirty). A pinned page is held alive by its pin;
//! the cache never evicts a pinned frame.
//!
//! Write-back honors the WAL rule: before a dirty page goes to disk, the
//! log is flushed through that page's LSN, so the durable log always
//! describes at least everything the data files contain. The
//! per-database [`PageIo`] hook converts pages on the way in and out.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::log::Lsn;
use crate::page;
use crate::page::codec::{CodecCtx, PageIo};
use crate::{Error, Result};

/// Handle for a file registered with the pool.
pub type MpfId = u32;

/// Flags for [`Mpool::fget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFlag {
    /// Fail with `NotFound` if the page does not exist.
    None,
    /// Materialize a zeroed page if it does not exist.
    Create,
}

struct Frame {
    buf: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

/// A pinned page. The pin keeps the frame resident; return it with
/// [`Mpool::fput`].
pub struct PagePin {
    frame: Arc<Frame>,
    mpf: MpfId,
    pgno: u32,
}

impl PagePin {
    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    pub fn mpf(&self) -> MpfId {
        self.mpf
    }

    /// Borrow the page for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.buf.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrow the page for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.frame.buf.write().unwrap_or_else(|e| e.into_inner())
    }
}

struct MpoolFile {
    path: PathBuf,
    page_size: u32,
    ctx: CodecCtx,
    io: Option<Arc<dyn PageIo>>,
    frames: HashMap<u32, Arc<Frame>>,
}

impl MpoolFile {
    fn read_from_disk(&self, pgno: u32) -> Result<Option<Vec<u8>>> {
        let ps = self.page_size as usize;
        let mut f = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(None),
        };
        let len = f.metadata().map_err(|e| Error::Io(e.to_string()))?.len();
        let off = pgno as u64 * ps as u64;
        if off + ps as u64 > len {
            return Ok(None);
        }
        f.seek(SeekFrom::Start(off))
            .map_err(|e| Error::Io(e.to_string()))?;
        let mut buf = vec![0u8; ps];
        f.read_exact(&mut buf)
            .map_err(|e| Error::Io(format!("read page {}: {}", pgno, e)))?;
        Ok(Some(buf))
    }

    fn write_to_disk(&self, pgno: u32, data: &[u8]) -> Result<()> {
        let ps = self.page_size as usize;
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| Error::Io(format!("cannot open {}: {}", self.path.display(), e)))?;
        f.seek(SeekFrom::Start(pgno as u64 * ps as u64))
            .map_err(|e| Error::Io(e.to_string()))?;
        f.write_all(data)
            .map_err(|e| Error::Io(format!("write page {}: {}", pgno, e)))?;
        Ok(())
    }

    fn sync_file(&self) -> Result<()> {
        if let Ok(f) = std::fs::File::open(&self.path) {
            f.sync_all().map_err(|e| Error::Io(e.to_string()))?;
        }
        Ok(())
    }
}

struct MpoolInner {
    next_id: MpfId,
    files: HashMap<MpfId, MpoolFile>,
    max_frames: usize,
}

/// Observer invoked with `(pgno, page_lsn)` immediately before each
/// physical page write, after the WAL flush. Installed by tests checking
/// write-ordering.
pub type WriteObserver = Box<dyn Fn(u32, Lsn) + Send + Sync>;

/// The environment's buffer cache.
pub struct Mpool {
    inner: Mutex<MpoolInner>,
    write_observer: Mutex<Option<WriteObserver>>,
}

impl Mpool {
    pub fn new(max_frames: usize) -> Self {
        Mpool {
            inner: Mutex::new(MpoolInner {
                next_id: 1,
                files: HashMap::new(),
                max_frames,
            }),
            write_observer: Mutex::new(None),
        }
    }

    /// Register a file with the pool. `io` is the access method's page
    /// conversion hook; `ctx` its conversion context.
    pub fn fopen(
        &self,
        path: &Path,
        page_size: u32,
        ctx: CodecCtx,
        io: Option<Arc<dyn PageIo>>,
    ) -> MpfId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.files.insert(
            id,
            MpoolFile {
                path: path.to_path_buf(),
                page_size,
                ctx,
                io,
                frames: HashMap::new(),
            },
        );
        id
    }

    /// Unregister a file, discarding its clean frames. Dirty frames must
    /// have been flushed by a prior [`Mpool::sync`].
    pub fn fclose(&self, mpf: MpfId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.files.remove(&mpf);
    }

    /// Number of pages currently in the file, counting unflushed frames.
    pub fn file_pages(&self, mpf: MpfId) -> Result<u32> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let file = inner.files.get(&mpf).ok_or(Error::NotFound)?;
        let on_disk = match std::fs::metadata(&file.path) {
            Ok(m) => (m.len() / file.page_size as u64) as u32,
            Err(_) => 0,
        };
        let in_cache = file.frames.keys().map(|p| p + 1).max().unwrap_or(0);
        Ok(on_disk.max(in_cache))
    }

    /// Pin a page, reading it from disk on a miss.
    pub fn fget(&self, mpf: MpfId, pgno: u32, flag: GetFlag) -> Result<PagePin> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let file = inner.files.get_mut(&mpf).ok_or(Error::NotFound)?;

        if let Some(frame) = file.frames.get(&pgno) {
            return Ok(PagePin {
                frame: Arc::clone(frame),
                mpf,
                pgno,
            });
        }

        let buf = match file.read_from_disk(pgno)? {
            Some(mut buf) => {
                if let Some(io) = &file.io {
                    io.page_in(&file.ctx, pgno, &mut buf)?;
                }
                buf
            }
            None if flag == GetFlag::Create => vec![0u8; file.page_size as usize],
            None => return Err(Error::NotFound),
        };

        let frame = Arc::new(Frame {
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(false),
        });
        file.frames.insert(pgno, Arc::clone(&frame));
        Ok(PagePin { frame, mpf, pgno })
    }

    /// Unpin a page, marking it dirty if it was edited.
    pub fn fput(&self, pin: PagePin, dirty: bool) {
        if dirty {
            pin.frame.dirty.store(true, Ordering::Release);
        }
        drop(pin);
    }

    /// Write every dirty frame to disk, flushing the log first so the
    /// WAL rule holds, then fsync the files. `flush_log` receives the
    /// highest page LSN about to be written.
    pub fn sync(&self, flush_log: &mut dyn FnMut(Lsn) -> Result<()>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let observer = self.write_observer.lock().unwrap_or_else(|e| e.into_inner());

        for file in inner.files.values_mut() {
            let mut dirty_pgnos: Vec<u32> = file
                .frames
                .iter()
                .filter(|(_, f)| f.dirty.load(Ordering::Acquire))
                .map(|(p, _)| *p)
                .collect();
            dirty_pgnos.sort_unstable();

            for pgno in dirty_pgnos {
                let frame = Arc::clone(file.frames.get(&pgno).unwrap());
                let buf = frame.buf.read().unwrap_or_else(|e| e.into_inner());
                let page_lsn = page::lsn(&buf);

                // WAL: the log must be durable through this page's LSN
                // before the page itself can reach disk.
                if !page_lsn.is_zero() {
                    flush_log(page_lsn)?;
                }
                if let Some(obs) = observer.as_ref() {
                    obs(pgno, page_lsn);
                }

                let mut out = buf.clone();
                drop(buf);
                if let Some(io) = &file.io {
                    io.page_out(&file.ctx, pgno, &mut out)?;
                }
                file.write_to_disk(pgno, &out)?;
                frame.dirty.store(false, Ordering::Release);
            }
            file.sync_file()?;
        }

        // With everything clean, trim the cache back under its budget.
        let max = inner.max_frames;
        let total: usize = inner.files.values().map(|f| f.frames.len()).sum();
        if total > max {
            for file in inner.files.values_mut() {
                file.frames.retain(|_, f| {
                    Arc::strong_count(f) > 1 || f.dirty.load(Ordering::Acquire)
                });
            }
        }
        Ok(())
    }

    /// Install a pre-write observer; used by tests that verify the WAL
    /// ordering rule.
    pub fn set_write_observer(&self, obs: Option<WriteObserver>) {
        *self.write_observer.lock().unwrap_or_else(|e| e.into_inner()) = obs;
    }

    /// True if any frame of the file is dirty.
    pub fn has_dirty(&self, mpf: MpfId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .files
            .get(&mpf)
            .map(|f| {
                f.frames
                    .values()
                    .any(|fr| fr.dirty.load(Ordering::Acquire))
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::codec::BtreeCodec;
    use crate::page::{init_page, PageType, LEAFLEVEL};

    const PS: u32 = 512;

    fn pool_with_file(dir: &Path) -> (Mpool, MpfId) {
        let pool = Mpool::new(64);
        let ctx = CodecCtx {
            page_size: PS,
            needs_swap: false,
        };
        let mpf = pool.fopen(&dir.join("t.db"), PS, ctx, Some(Arc::new(BtreeCodec)));
        (pool, mpf)
    }

    #[test]
    fn test_fget_create_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, mpf) = pool_with_file(dir.path());

        assert!(matches!(
            pool.fget(mpf, 0, GetFlag::None),
            Err(Error::NotFound)
        ));

        let pin = pool.fget(mpf, 0, GetFlag::Create).unwrap();
        {
            let mut buf = pin.write();
            init_page(&mut buf, 0, 0, 0, LEAFLEVEL, PageType::LBtree);
            page::set_lsn(&mut buf, Lsn::new(1, 100));
        }
        pool.fput(pin, true);

        // Still cached.
        let pin = pool.fget(mpf, 0, GetFlag::None).unwrap();
        assert_eq!(page::lsn(&pin.read()), Lsn::new(1, 100));
        pool.fput(pin, false);
    }

    #[test]
    fn test_sync_writes_through_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let (pool, mpf) = pool_with_file(&path);
            let pin = pool.fget(mpf, 0, GetFlag::Create).unwrap();
            {
                let mut buf = pin.write();
                init_page(&mut buf, 0, 0, 0, LEAFLEVEL, PageType::LBtree);
                page::set_lsn(&mut buf, Lsn::new(2, 40));
            }
            pool.fput(pin, true);
            pool.sync(&mut |_| Ok(())).unwrap();
        }
        // A fresh pool reads the page back from disk.
        let (pool, mpf) = pool_with_file(&path);
        let pin = pool.fget(mpf, 0, GetFlag::None).unwrap();
        assert_eq!(page::lsn(&pin.read()), Lsn::new(2, 40));
        pool.fput(pin, false);
    }

    #[test]
    fn test_sync_flushes_log_to_page_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, mpf) = pool_with_file(dir.path());
        let pin = pool.fget(mpf, 3, GetFlag::Create).unwrap();
        {
            let mut buf = pin.write();
            init_page(&mut buf, 3, 0, 0, LEAFLEVEL, PageType::LBtree);
            page::set_lsn(&mut buf, Lsn::new(5, 777));
        }
        pool.fput(pin, true);

        let mut flushed = Vec::new();
        pool.sync(&mut |lsn| {
            flushed.push(lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(flushed, vec![Lsn::new(5, 777)]);
    }

    #[test]
    fn test_pinned_frame_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Mpool::new(1);
        let ctx = CodecCtx {
            page_size: PS,
            needs_swap: false,
        };
        let mpf = pool.fopen(&dir.path().join("t.db"), PS, ctx, None);

        let pinned = pool.fget(mpf, 0, GetFlag::Create).unwrap();
        {
            let mut b = pinned.write();
            init_page(&mut b, 0, 0, 0, 0, PageType::Hash);
        }
        for pgno in 1..5 {
            let pin = pool.fget(mpf, pgno, GetFlag::Create).unwrap();
            pool.fput(pin, false);
        }
        pool.sync(&mut |_| Ok(())).unwrap();
        // The pinned page survived eviction with its contents.
        assert_eq!(page::ptype(&pinned.read()), PageType::Hash);
        pool.fput(pinned, false);
    }
}
