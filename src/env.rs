//! The environment.
//!
//! An [`Env`] owns one on-disk environment directory: the numbered log
//! files, the database files, and the replication egen file. Inside the
//! process it owns the shared regions — log, buffer cache, file
//! registry, transaction table, replication state — each behind its own
//! mutex, plus a write-once panic flag that every public entry point
//! checks first. Opening an environment runs crash recovery over
//! whatever log it finds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::db::{self, Database, DbType};
use crate::dbreg::{FileRegistry, FnameHandle};
use crate::log::cursor::{CursorOp, LogCursor};
use crate::log::records::{
    self, RecordType, TxnChildArgs, TxnCkpArgs, TxnRegopArgs, TxnXaRegopArgs, DBREG_CLOSE,
    DBREG_OPEN, TXN_ABORT, TXN_COMMIT,
};
use crate::log::writer::LogManager;
use crate::log::{Lsn, LogStats, PutFlag, LOG_BUFFER_DEFAULT, LOG_MAX_DEFAULT};
use crate::mpool::Mpool;
use crate::recover::{run_recovery, RecOp, RecoverCtx, RecoverFiles, RecoveryInfo};
use crate::rep::{ClientState, Eid, RepRegion, RepRole, RepStats, Transport};
use crate::txn::{TxnInfo, TxnRegion, TxnState, TxnStats};
use crate::{Error, Result};

/// Environment configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Page size for databases created in this environment; a power of
    /// two between 512 and 64K.
    pub page_size: u32,
    /// Buffer cache budget in pages.
    pub cache_pages: usize,
    /// Maximum log file size.
    pub log_max_file_size: u32,
    /// In-memory log buffer size.
    pub log_buffer_size: usize,
    /// Identifier stamped into log file headers and diagnostics.
    pub env_id: u32,
    /// Run recovery on open.
    pub recover: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            page_size: 4096,
            cache_pages: 256,
            log_max_file_size: LOG_MAX_DEFAULT,
            log_buffer_size: LOG_BUFFER_DEFAULT,
            env_id: 0,
            recover: true,
        }
    }
}

/// Handle naming an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHandle(pub(crate) u32);

impl TxnHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Diagnostic callback type for [`Env::set_errcall`].
pub type ErrCall = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct EnvInner {
    pub(crate) dir: PathBuf,
    pub(crate) config: EnvConfig,
    pub(crate) panicked: AtomicBool,
    pub(crate) recovering: AtomicBool,
    pub(crate) log: Mutex<LogManager>,
    pub(crate) mpool: Mpool,
    pub(crate) registry: Mutex<FileRegistry>,
    pub(crate) txns: Mutex<TxnRegion>,
    pub(crate) rep: Mutex<RepRegion>,
    pub(crate) client: Mutex<ClientState>,
    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    pub(crate) errcall: Mutex<Option<ErrCall>>,
    pub(crate) databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl EnvInner {
    pub(crate) fn check_panic(&self) -> Result<()> {
        if self.panicked.load(Ordering::Acquire) {
            return Err(Error::Panic);
        }
        Ok(())
    }

    /// Taint the environment. Every subsequent call fails until the
    /// environment is recreated and recovered.
    pub(crate) fn set_panic(&self, origin: &str) {
        if self.panicked.swap(true, Ordering::AcqRel) {
            return;
        }
        let lsn = self
            .log
            .lock()
            .map(|l| l.current_lsn())
            .unwrap_or_else(|e| e.into_inner().current_lsn());
        let msg = format!(
            "PANIC: env {} at {}: {}; run recovery",
            self.config.env_id, lsn, origin
        );
        error!("{}", msg);
        if let Ok(cb) = self.errcall.lock() {
            if let Some(cb) = cb.as_ref() {
                cb(&msg);
            }
        }
    }

    /// Append a record, carrying the dbreg snapshot for rollovers and
    /// checkpoints. A log I/O failure panics the environment.
    pub(crate) fn log_put_internal(&self, body: &[u8], flags: PutFlag) -> Result<Lsn> {
        self.check_panic()?;
        let snapshot = {
            let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            reg.snapshot_records(self.recovering.load(Ordering::Acquire))
        };
        let result = {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.put(body, flags, &snapshot)
        };
        match result {
            Err(Error::Io(e)) => {
                self.set_panic(&format!(
                    "log write failed ({}, record type {})",
                    e,
                    records::rectype_of(body)
                ));
                Err(Error::Panic)
            }
            other => other,
        }
    }

    /// Build and append a transactional record. The builder receives
    /// the transaction id and its previous-record LSN; afterwards the
    /// transaction chain is advanced.
    pub(crate) fn txn_log_put(
        &self,
        txn: Option<u32>,
        flags: PutFlag,
        build: &dyn Fn(u32, Lsn) -> Vec<u8>,
    ) -> Result<Lsn> {
        let (txnid, prev) = match txn {
            Some(id) => {
                let txns = self.txns.lock().unwrap_or_else(|e| e.into_inner());
                (id, txns.prev_lsn(id))
            }
            None => (0, Lsn::ZERO),
        };
        let body = build(txnid, prev);
        let lsn = self.log_put_internal(&body, flags)?;
        if txnid != 0 {
            let mut txns = self.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.record_write(txnid, lsn);
        }
        // A master streams everything it just wrote.
        crate::rep::process::stream_new_records(self);
        Ok(lsn)
    }

    pub(crate) fn flush_log(&self, lsn: Option<Lsn>) -> Result<()> {
        let result = {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.flush(lsn)
        };
        match result {
            Err(Error::Io(e)) => {
                self.set_panic(&format!("log flush failed ({})", e));
                Err(Error::Panic)
            }
            other => other,
        }
    }

    /// Write every dirty page, flushing the log first per the WAL rule.
    pub(crate) fn sync_pages(&self) -> Result<()> {
        let result = self.mpool.sync(&mut |lsn| {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.flush(Some(lsn).filter(|l| !l.is_zero()))
        });
        match result {
            Err(Error::Io(e)) => {
                self.set_panic(&format!("page write failed ({})", e));
                Err(Error::Panic)
            }
            other => other,
        }
    }

    pub(crate) fn rep_role(&self) -> RepRole {
        self.rep.lock().unwrap_or_else(|e| e.into_inner()).role
    }

    pub(crate) fn rep_gen(&self) -> u32 {
        self.rep.lock().unwrap_or_else(|e| e.into_inner()).gen
    }

    /// Bind a dbreg id to a freshly opened database, logging the OPEN.
    pub(crate) fn dbreg_new_id(&self, handle: FnameHandle, txn: Option<u32>) -> Result<i32> {
        let gen = self.rep_gen();
        let (id, record) = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(f) = reg.fname(handle) {
                if f.id != crate::dbreg::DBREG_INVALID_ID {
                    return Ok(f.id);
                }
            }
            let id = reg.alloc_id();
            reg.install(handle, id, gen)?;
            let record = reg.register_record(handle, DBREG_OPEN, txn.unwrap_or(0))?;
            (id, record)
        };
        match self.log_put_internal(&record, PutFlag::None) {
            Ok(_) => {
                crate::rep::process::stream_new_records(self);
                Ok(id)
            }
            Err(e) => {
                let mut reg = self.registry.lock().unwrap_or_else(|e2| e2.into_inner());
                reg.revoke_id(handle, gen);
                Err(e)
            }
        }
    }

    /// Log the CLOSE for a dbreg id and revoke it. A failed close log
    /// leaves the FNAME marked so shutdown can detect the inconsistency.
    pub(crate) fn dbreg_close_id(&self, handle: FnameHandle, txn: Option<u32>) -> Result<()> {
        let gen = self.rep_gen();
        let record = {
            let reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            match reg.fname(handle) {
                Some(f) if f.id != crate::dbreg::DBREG_INVALID_ID => {
                    Some(reg.register_record(handle, DBREG_CLOSE, txn.unwrap_or(0))?)
                }
                _ => None,
            }
        };
        if let Some(record) = record {
            if let Err(e) = self.log_put_internal(&record, PutFlag::None) {
                let mut reg = self.registry.lock().unwrap_or_else(|e2| e2.into_inner());
                reg.mark_not_logged(handle);
                reg.revoke_id(handle, gen);
                return Err(e);
            }
            crate::rep::process::stream_new_records(self);
        }
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.revoke_id(handle, gen);
        Ok(())
    }

    /// Undo one transaction's records by walking its back-chain,
    /// recursing into committed children.
    pub(crate) fn undo_chain(self: &Arc<Self>, mut lsn: Lsn) -> Result<()> {
        let files = EnvFiles {
            inner: Arc::clone(self),
        };
        let ctx = RecoverCtx {
            mpool: &self.mpool,
            registry: &self.registry,
            files: &files,
        };
        while !lsn.is_zero() {
            let body = {
                let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
                log.read_record(lsn)?.1
            };
            if records::rectype_of(&body) == RecordType::TxnChild {
                let child = TxnChildArgs::decode(&body)?;
                self.undo_chain(child.c_lsn)?;
                lsn = child.prev_lsn;
                continue;
            }
            ctx.dispatch(&body, lsn, RecOp::Undo)?;
            lsn = records::prev_lsn_of(&body);
        }
        Ok(())
    }
}

/// Bridges recovery's dbreg records to real database opens.
pub(crate) struct EnvFiles {
    pub(crate) inner: Arc<EnvInner>,
}

impl RecoverFiles for EnvFiles {
    fn do_open(&self, args: &records::DbregRegisterArgs) -> Result<()> {
        db::recover_open(&self.inner, args)
    }

    fn do_close(&self, args: &records::DbregRegisterArgs) -> Result<()> {
        db::recover_close(&self.inner, args)
    }
}

/// An open environment. Cloning the handle is cheap; all clones share
/// the same regions.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl Env {
    /// Open (creating if necessary) the environment at `dir` and run
    /// recovery over its log.
    pub fn open<P: AsRef<Path>>(dir: P, config: EnvConfig) -> Result<Env> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Io(format!("cannot create {}: {}", dir.display(), e)))?;

        if !config.page_size.is_power_of_two() || !(512..=65536).contains(&config.page_size) {
            return Err(Error::Invalid(format!(
                "page size {} is not a power of two in [512, 64K]",
                config.page_size
            )));
        }

        let log = LogManager::open(
            &dir,
            config.log_max_file_size,
            config.log_buffer_size,
            config.page_size,
            config.env_id,
        )?;

        let mut rep = RepRegion::new(config.env_id as Eid);
        if let Some(egen) = crate::rep::read_egen(&dir)? {
            rep.egen = egen.max(1);
        }

        let inner = Arc::new(EnvInner {
            mpool: Mpool::new(config.cache_pages),
            dir,
            panicked: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            log: Mutex::new(log),
            registry: Mutex::new(FileRegistry::new()),
            txns: Mutex::new(TxnRegion::new()),
            rep: Mutex::new(rep),
            client: Mutex::new(ClientState::new()),
            transport: Mutex::new(None),
            errcall: Mutex::new(None),
            databases: Mutex::new(HashMap::new()),
            config,
        });

        let env = Env { inner };
        if env.inner.config.recover {
            env.run_recovery()?;
        }
        Ok(env)
    }

    fn run_recovery(&self) -> Result<RecoveryInfo> {
        self.inner.recovering.store(true, Ordering::Release);
        {
            let mut log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.recovering = true;
        }
        let files = EnvFiles {
            inner: Arc::clone(&self.inner),
        };
        let ctx = RecoverCtx {
            mpool: &self.inner.mpool,
            registry: &self.inner.registry,
            files: &files,
        };
        let result = run_recovery(&self.inner.log, &ctx);
        let info = match result {
            Ok(info) => info,
            Err(e) => {
                self.inner.set_panic(&format!("recovery failed: {}", e));
                return Err(Error::Panic);
            }
        };
        // Recovered state goes straight to disk so the databases are
        // consistent even if nothing else runs.
        self.inner.sync_pages()?;

        // Close everything recovery opened; the application reopens what
        // it needs.
        db::close_all(&self.inner)?;

        {
            let mut log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
            log.recovering = false;
        }
        self.inner.recovering.store(false, Ordering::Release);
        if !info.bad.is_empty() {
            info!(
                skipped = info.bad.len(),
                "recovery skipped unrecoverable records"
            );
        }
        Ok(info)
    }

    /// Install a diagnostic callback, invoked on panic paths.
    pub fn set_errcall(&self, cb: Option<ErrCall>) {
        *self.inner.errcall.lock().unwrap_or_else(|e| e.into_inner()) = cb;
    }

    /// Open a database in this environment.
    pub fn db_open(
        &self,
        name: &str,
        dbtype: DbType,
        txn: Option<TxnHandle>,
    ) -> Result<Arc<Database>> {
        self.inner.check_panic()?;
        db::open_database(&self.inner, name, dbtype, txn.map(|t| t.0))
    }

    /// Begin a transaction.
    pub fn txn_begin(&self, parent: Option<TxnHandle>) -> Result<TxnHandle> {
        self.inner.check_panic()?;
        let mut txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        Ok(TxnHandle(txns.begin(parent.map(|t| t.0))?))
    }

    /// Commit a transaction. The commit record is durable before this
    /// returns; a child's records are chained into its parent instead.
    pub fn txn_commit(&self, txn: TxnHandle) -> Result<()> {
        self.inner.check_panic()?;
        let info: TxnInfo = {
            let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.get(txn.0)?.clone()
        };

        if let Some(parent) = info.parent {
            // Child commit: chain the child's records into the parent.
            if !info.last_lsn.is_zero() {
                self.inner.txn_log_put(Some(parent), PutFlag::None, &|txnid, prev| {
                    TxnChildArgs {
                        txnid,
                        prev_lsn: prev,
                        child: txn.0,
                        c_lsn: info.last_lsn,
                    }
                    .encode()
                })?;
            }
        } else if !info.last_lsn.is_zero() {
            self.inner.txn_log_put(Some(txn.0), PutFlag::Flush, &|txnid, prev| {
                TxnRegopArgs {
                    txnid,
                    prev_lsn: prev,
                    opcode: TXN_COMMIT,
                    timestamp: wallclock(),
                }
                .encode()
            })?;
        }

        let mut txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.resolve(txn.0, TxnState::Committed)?;
        Ok(())
    }

    /// Abort a transaction, undoing each of its records newest-first.
    pub fn txn_abort(&self, txn: TxnHandle) -> Result<()> {
        self.inner.check_panic()?;
        let info: TxnInfo = {
            let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.get(txn.0)?.clone()
        };

        if !info.last_lsn.is_zero() {
            self.inner.undo_chain(info.last_lsn)?;
            self.inner.txn_log_put(Some(txn.0), PutFlag::None, &|txnid, prev| {
                TxnRegopArgs {
                    txnid,
                    prev_lsn: prev,
                    opcode: TXN_ABORT,
                    timestamp: wallclock(),
                }
                .encode()
            })?;
        }

        let mut txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.resolve(txn.0, TxnState::Aborted)?;
        Ok(())
    }

    /// First phase of two-phase commit: make the transaction durable
    /// without resolving it.
    pub fn txn_prepare(&self, txn: TxnHandle, xid: &[u8]) -> Result<()> {
        self.inner.check_panic()?;
        let info: TxnInfo = {
            let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.get(txn.0)?.clone()
        };
        self.inner.txn_log_put(Some(txn.0), PutFlag::Flush, &|txnid, prev| {
            TxnXaRegopArgs {
                txnid,
                prev_lsn: prev,
                xid: xid.to_vec(),
                formatid: 0,
                gtrid: 0,
                bqual: 0,
                begin_lsn: info.begin_lsn,
            }
            .encode()
        })?;
        let mut txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.resolve(txn.0, TxnState::Prepared)?;
        Ok(())
    }

    /// Transactions prepared but not yet resolved, for the transaction
    /// manager to finish after a crash.
    pub fn txn_recover(&self) -> Result<Vec<TxnInfo>> {
        self.inner.check_panic()?;
        let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        Ok(txns.prepared())
    }

    /// Write a checkpoint: sync the cache, then log the checkpoint
    /// record with the recovery horizon and the open-file snapshot.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.check_panic()?;
        let ckp_lsn = {
            let end = {
                let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.earliest_active_lsn(end)
        };
        self.inner.sync_pages()?;

        let last_ckp = {
            let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
            txns.last_ckp()
        };
        let lsn = self.inner.txn_log_put(None, PutFlag::Checkpoint, &|txnid, prev| {
            TxnCkpArgs {
                txnid,
                prev_lsn: prev,
                ckp_lsn,
                last_ckp,
                timestamp: wallclock(),
            }
            .encode()
        })?;
        let mut txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.set_last_ckp(lsn);
        Ok(())
    }

    /// Append an application record to the log.
    pub fn log_put(&self, body: &[u8], flags: PutFlag) -> Result<Lsn> {
        self.inner.check_panic()?;
        let lsn = self.inner.log_put_internal(body, flags)?;
        crate::rep::process::stream_new_records(&self.inner);
        Ok(lsn)
    }

    /// Flush the log through `lsn`, or entirely.
    pub fn log_flush(&self, lsn: Option<Lsn>) -> Result<()> {
        self.inner.check_panic()?;
        self.inner.flush_log(lsn)
    }

    /// Open a log cursor.
    pub fn log_cursor(&self) -> EnvLogCursor {
        EnvLogCursor {
            inner: Arc::clone(&self.inner),
            cursor: LogCursor::new(),
        }
    }

    /// Point-in-time log statistics.
    pub fn log_stats(&self) -> LogStats {
        let log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.stats()
    }

    /// Point-in-time transaction statistics.
    pub fn txn_stats(&self) -> TxnStats {
        let txns = self.inner.txns.lock().unwrap_or_else(|e| e.into_inner());
        txns.stats()
    }

    /// Point-in-time replication statistics.
    pub fn rep_stats(&self) -> RepStats {
        let rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.clone()
    }

    /// Install the host's message transport.
    pub fn rep_set_transport(&self, eid: Eid, transport: Arc<dyn Transport>) {
        {
            let mut rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            rep.eid = eid;
        }
        *self.inner.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    /// Start replication in the given role.
    pub fn rep_start(&self, role: RepRole) -> Result<()> {
        self.inner.check_panic()?;
        crate::rep::process::rep_start(&self.inner, role)
    }

    /// Process one incoming replication message. Returns the sender to
    /// act on plus an informational outcome.
    pub fn rep_process_message(
        &self,
        control: &[u8],
        rec: &[u8],
        eid: Eid,
    ) -> Result<crate::rep::RepOutcome> {
        self.inner.check_panic()?;
        crate::rep::process::process_message(&self.inner, control, rec, eid)
    }

    /// Hold an election, blocking up to `timeout`.
    pub fn rep_elect(
        &self,
        nsites: u32,
        nvotes: u32,
        priority: u32,
        timeout: std::time::Duration,
    ) -> Result<Eid> {
        self.inner.check_panic()?;
        crate::rep::election::elect(&self.inner, nsites, nvotes, priority, timeout)
    }

    /// Start an election without waiting; phase transitions then run
    /// inside the vote handlers as messages arrive.
    pub fn rep_elect_begin(&self, nsites: u32, nvotes: u32, priority: u32) -> Result<()> {
        self.inner.check_panic()?;
        crate::rep::election::elect_begin(&self.inner, nsites, nvotes, priority)
    }

    /// Rebroadcast the latest log record, nudging clients that missed
    /// the tail of the stream.
    pub fn rep_flush(&self) -> Result<()> {
        self.inner.check_panic()?;
        crate::rep::process::rep_flush(&self.inner)
    }

    /// Kick off the deferred catch-up of a DELAYCLIENT configuration.
    pub fn rep_sync(&self) -> Result<()> {
        self.inner.check_panic()?;
        crate::rep::apply::rep_sync(&self.inner)
    }

    /// Configure replication knobs not covered by `rep_start`.
    pub fn rep_set_config(&self, delay_client: bool, noautoinit: bool, bulk: bool) {
        let mut rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.delay_client = delay_client;
        rep.noautoinit = noautoinit;
        let was_bulk = rep.bulk;
        rep.bulk = bulk;
        drop(rep);
        if was_bulk && !bulk {
            // Toggling bulk off flushes whatever is buffered.
            crate::rep::process::flush_bulk(&self.inner);
        }
    }

    /// Limit outgoing replication streams to `gbytes` GB + `bytes`.
    pub fn rep_set_limit(&self, gbytes: u32, bytes: u32) {
        let mut rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.gbytes = gbytes;
        rep.bytes = bytes;
    }

    /// Tune how many records a client waits at a gap before asking for
    /// a resend, and the ceiling the doubling interval may reach.
    pub fn rep_set_request(&self, min: u32, max: u32) {
        let mut rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.request_gap = min.max(1);
        rep.max_gap = max.max(rep.request_gap);
    }

    /// A consistent view of the replication state machine.
    pub fn rep_snapshot(&self) -> crate::rep::RepSnapshot {
        let rep = self.inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        crate::rep::RepSnapshot {
            eid: rep.eid,
            role: rep.role,
            master_id: rep.master_id,
            gen: rep.gen,
            egen: rep.egen,
            in_election: rep.in_election(),
            recovering: rep.recovering(),
        }
    }

    /// Install an observer called with `(pgno, page_lsn)` immediately
    /// before each physical page write, after the WAL flush; used to
    /// audit write ordering.
    pub fn set_page_write_observer(&self, obs: Option<crate::mpool::WriteObserver>) {
        self.inner.mpool.set_write_observer(obs);
    }

    /// Flush all dirty pages, honoring the WAL rule.
    pub fn sync(&self) -> Result<()> {
        self.inner.check_panic()?;
        self.inner.sync_pages()
    }

    /// Flush everything and close. Fails if a database close could not
    /// be logged.
    pub fn close(self) -> Result<()> {
        self.inner.check_panic()?;
        db::close_all(&self.inner)?;
        self.inner.sync_pages()?;
        self.inner.flush_log(None)?;
        let reg = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        if reg.any_not_logged() {
            return Err(Error::Corrupt(
                "environment closed with unlogged file closes".into(),
            ));
        }
        Ok(())
    }

    /// The environment directory.
    pub fn home(&self) -> &Path {
        &self.inner.dir
    }
}

/// A log cursor bound to its environment.
pub struct EnvLogCursor {
    inner: Arc<EnvInner>,
    cursor: LogCursor,
}

impl EnvLogCursor {
    /// Fetch a record; see [`CursorOp`].
    pub fn get(&mut self, op: CursorOp) -> Result<(Lsn, Vec<u8>)> {
        self.inner.check_panic()?;
        let mut log = self.inner.log.lock().unwrap_or_else(|e| e.into_inner());
        self.cursor.get(&mut log, op)
    }
}

pub(crate) fn wallclock() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
