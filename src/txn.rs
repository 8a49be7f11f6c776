//! Transaction region.
//!
//! Transactions are identified by a 32-bit id and carry the LSN of the
//! last record they wrote; every record a transaction writes embeds the
//! previous one's LSN, so abort and replication replay can walk the
//! whole chain backward from the resolution record. The region also
//! hands out locker ids for replication replay, which acquires locks
//! per replayed transaction and releases them as a group.
//!
//! Commit/abort/prepare themselves are driven from the environment,
//! which owns the log; this module is the bookkeeping.

use std::collections::HashMap;

use serde::Serialize;

use crate::log::Lsn;
use crate::{Error, Result};

/// Transaction id of non-transactional operations.
pub const TXN_INVALID: u32 = 0;
/// First id handed out; ids below this are reserved.
pub const TXN_MINIMUM: u32 = 0x8000_0000;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// Region bookkeeping for one transaction.
#[derive(Debug, Clone)]
pub struct TxnInfo {
    pub id: u32,
    pub parent: Option<u32>,
    /// LSN of the transaction's most recent record; zero until it first
    /// writes.
    pub last_lsn: Lsn,
    /// LSN of the transaction's first record.
    pub begin_lsn: Lsn,
    pub state: TxnState,
}

/// Point-in-time transaction statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TxnStats {
    pub active: u32,
    pub commits: u64,
    pub aborts: u64,
    pub begins: u64,
    pub last_ckp: Lsn,
}

/// The transaction region. Callers hold the region mutex.
pub struct TxnRegion {
    last_id: u32,
    txns: HashMap<u32, TxnInfo>,
    last_ckp: Lsn,
    next_locker: u32,
    commits: u64,
    aborts: u64,
    begins: u64,
}

impl Default for TxnRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnRegion {
    pub fn new() -> Self {
        TxnRegion {
            last_id: TXN_MINIMUM,
            txns: HashMap::new(),
            last_ckp: Lsn::ZERO,
            next_locker: 1,
            commits: 0,
            aborts: 0,
            begins: 0,
        }
    }

    /// Begin a transaction, optionally as a child.
    pub fn begin(&mut self, parent: Option<u32>) -> Result<u32> {
        if let Some(p) = parent {
            match self.txns.get(&p) {
                Some(t) if t.state == TxnState::Active => {}
                _ => {
                    return Err(Error::Invalid(format!(
                        "parent transaction {:#x} is not active",
                        p
                    )))
                }
            }
        }
        let id = self.last_id;
        self.last_id = self.last_id.wrapping_add(1).max(TXN_MINIMUM);
        self.txns.insert(
            id,
            TxnInfo {
                id,
                parent,
                last_lsn: Lsn::ZERO,
                begin_lsn: Lsn::ZERO,
                state: TxnState::Active,
            },
        );
        self.begins += 1;
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<&TxnInfo> {
        self.txns
            .get(&id)
            .ok_or_else(|| Error::Invalid(format!("unknown transaction {:#x}", id)))
    }

    /// The back-link the transaction's next record should carry.
    pub fn prev_lsn(&self, id: u32) -> Lsn {
        self.txns.get(&id).map_or(Lsn::ZERO, |t| t.last_lsn)
    }

    /// Note that the transaction wrote a record at `lsn`.
    pub fn record_write(&mut self, id: u32, lsn: Lsn) {
        if let Some(t) = self.txns.get_mut(&id) {
            if t.begin_lsn.is_zero() {
                t.begin_lsn = lsn;
            }
            t.last_lsn = lsn;
        }
    }

    /// Move a transaction to a terminal or prepared state. Terminal
    /// transactions are dropped from the table.
    pub fn resolve(&mut self, id: u32, state: TxnState) -> Result<TxnInfo> {
        let mut info = self
            .txns
            .remove(&id)
            .ok_or_else(|| Error::Invalid(format!("unknown transaction {:#x}", id)))?;
        info.state = state;
        match state {
            TxnState::Committed => self.commits += 1,
            TxnState::Aborted => self.aborts += 1,
            TxnState::Prepared => {
                // Prepared transactions stay resident until resolved.
                self.txns.insert(id, info.clone());
            }
            TxnState::Active => {
                return Err(Error::Invalid("cannot resolve to active".into()))
            }
        }
        Ok(info)
    }

    /// Transactions in the prepared state, for `txn_recover`.
    pub fn prepared(&self) -> Vec<TxnInfo> {
        let mut v: Vec<TxnInfo> = self
            .txns
            .values()
            .filter(|t| t.state == TxnState::Prepared)
            .cloned()
            .collect();
        v.sort_by_key(|t| t.id);
        v
    }

    /// LSN of the earliest record of any live transaction, used as the
    /// checkpoint's recovery horizon; the current end-of-log when idle.
    pub fn earliest_active_lsn(&self, end_of_log: Lsn) -> Lsn {
        self.txns
            .values()
            .filter(|t| !t.begin_lsn.is_zero())
            .map(|t| t.begin_lsn)
            .min()
            .unwrap_or(end_of_log)
    }

    pub fn set_last_ckp(&mut self, lsn: Lsn) {
        self.last_ckp = lsn;
    }

    pub fn last_ckp(&self) -> Lsn {
        self.last_ckp
    }

    /// Allocate a locker id for replication replay.
    pub fn lock_id(&mut self) -> u32 {
        let id = self.next_locker;
        self.next_locker = self.next_locker.wrapping_add(1).max(1);
        id
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            active: self.txns.len() as u32,
            commits: self.commits,
            aborts: self.aborts,
            begins: self.begins,
            last_ckp: self.last_ckp,
        }
    }
}
