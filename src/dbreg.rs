//! Database file registration.
//!
//! Log records name database files by a small numeric id instead of a
//! filename. This module owns the mapping: an arena of FNAME entries,
//! one per open database handle, plus the list of entries with live ids
//! and a free stack of recycled ids. The mapping itself is logged
//! (`dbreg_register` records) so recovery can rebuild it from any
//! starting point: OPEN when an id is bound, CLOSE when it is released,
//! and a CHECKPOINT snapshot of the whole open set at every checkpoint
//! and at the head of every new log file.
//!
//! Ids may be recycled, with one exception: while replication is
//! active, an id bound under an older master generation is not pushed
//! back on the free stack, so a stale master's in-flight records can
//! never resolve to the wrong file.

use std::collections::HashMap;

use crate::db::DbType;
use crate::log::records::{DbregRegisterArgs, DBREG_CHKPNT, DBREG_CLOSE};
use crate::log::Lsn;
use crate::mpool::MpfId;
use crate::{Error, Result};

/// Sentinel for an FNAME with no id bound.
pub const DBREG_INVALID_ID: i32 = -1;

/// Arena handle for an FNAME entry.
pub type FnameHandle = u32;

/// Registration state for one open database handle.
#[derive(Debug, Clone)]
pub struct Fname {
    /// Bound dbreg id, or [`DBREG_INVALID_ID`].
    pub id: i32,
    /// File name; `None` for in-memory databases.
    pub name: Option<String>,
    /// Stable 16-byte file identity.
    pub uid: [u8; 16],
    pub dbtype: DbType,
    pub meta_pgno: u32,
    /// Transaction that created the file; cleared once logged so it is
    /// never relogged.
    pub create_txnid: u32,
    pub durable: bool,
    /// Set when a close failed to reach the log, so environment
    /// shutdown can detect the inconsistency.
    pub not_logged: bool,
    /// Replication generation when the id was bound.
    pub gen: u32,
}

/// What recovery and replication replay need to apply a record against a
/// registered file.
#[derive(Debug, Clone, Copy)]
pub struct DbBinding {
    pub mpf: MpfId,
    pub page_size: u32,
}

/// The environment's file-id table. Callers hold the file-list mutex.
pub struct FileRegistry {
    table: Vec<Option<Fname>>,
    /// Entries with a bound id, most recently bound first.
    open_list: Vec<FnameHandle>,
    id_map: HashMap<i32, FnameHandle>,
    free_ids: Vec<i32>,
    fid_max: i32,
    bindings: HashMap<i32, DbBinding>,
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry {
            table: Vec::new(),
            open_list: Vec::new(),
            id_map: HashMap::new(),
            free_ids: Vec::new(),
            fid_max: 0,
            bindings: HashMap::new(),
        }
    }

    /// Allocate an FNAME for a handle being opened. No id is bound yet.
    pub fn setup(
        &mut self,
        name: Option<&str>,
        uid: [u8; 16],
        dbtype: DbType,
        meta_pgno: u32,
        create_txnid: u32,
    ) -> FnameHandle {
        let fname = Fname {
            id: DBREG_INVALID_ID,
            name: name.map(|s| s.to_string()),
            uid,
            dbtype,
            meta_pgno,
            create_txnid,
            durable: true,
            not_logged: false,
            gen: 0,
        };
        for (i, slot) in self.table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fname);
                return i as FnameHandle;
            }
        }
        self.table.push(Some(fname));
        (self.table.len() - 1) as FnameHandle
    }

    /// Destroy an FNAME. The handle must have no bound id.
    pub fn teardown(&mut self, handle: FnameHandle) {
        if let Some(Some(f)) = self.table.get(handle as usize) {
            debug_assert_eq!(f.id, DBREG_INVALID_ID);
        }
        if let Some(slot) = self.table.get_mut(handle as usize) {
            *slot = None;
        }
    }

    pub fn fname(&self, handle: FnameHandle) -> Option<&Fname> {
        self.table.get(handle as usize).and_then(|s| s.as_ref())
    }

    pub fn fname_mut(&mut self, handle: FnameHandle) -> Option<&mut Fname> {
        self.table.get_mut(handle as usize).and_then(|s| s.as_mut())
    }

    /// Pop a recycled id or mint a fresh one.
    pub fn alloc_id(&mut self) -> i32 {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = self.fid_max;
                self.fid_max += 1;
                id
            }
        }
    }

    /// Bind `id` to the handle and link it into the open-file list.
    /// Clears `create_txnid` so it is never relogged.
    pub fn install(&mut self, handle: FnameHandle, id: i32, gen: u32) -> Result<()> {
        let f = self
            .fname_mut(handle)
            .ok_or_else(|| Error::Invalid("bad fname handle".into()))?;
        f.id = id;
        f.gen = gen;
        f.create_txnid = 0;
        self.id_map.insert(id, handle);
        self.open_list.insert(0, handle);
        Ok(())
    }

    /// Bind a specific id during recovery. If another entry owns the id
    /// it is displaced and returned so the caller can close it; the id
    /// is plucked from the free stack if present.
    pub fn assign_id(&mut self, handle: FnameHandle, id: i32, gen: u32) -> Result<Option<FnameHandle>> {
        let displaced = self.id_map.get(&id).copied();
        if let Some(old) = displaced {
            self.revoke_id_inner(old, false, gen);
        }
        self.free_ids.retain(|&i| i != id);
        if id >= self.fid_max {
            self.fid_max = id + 1;
        }
        self.install(handle, id, gen)?;
        Ok(displaced)
    }

    fn revoke_id_inner(&mut self, handle: FnameHandle, recycle: bool, rep_gen: u32) {
        let (id, f_gen) = match self.fname(handle) {
            Some(f) if f.id != DBREG_INVALID_ID => (f.id, f.gen),
            _ => return,
        };
        self.id_map.remove(&id);
        self.open_list.retain(|&h| h != handle);
        self.bindings.remove(&id);
        if let Some(f) = self.fname_mut(handle) {
            f.id = DBREG_INVALID_ID;
        }
        // Never recycle across a generation change while replication is
        // active: a stale master's log may still name this id.
        if recycle && f_gen == rep_gen {
            self.free_ids.push(id);
        }
    }

    /// Unlink the FNAME from the open list and recycle its id (subject
    /// to the replication-generation guard).
    pub fn revoke_id(&mut self, handle: FnameHandle, rep_gen: u32) {
        self.revoke_id_inner(handle, true, rep_gen);
    }

    /// Look up the handle bound to `id`.
    pub fn handle_of_id(&self, id: i32) -> Option<FnameHandle> {
        self.id_map.get(&id).copied()
    }

    /// Record what replay needs to reach the file behind `id`.
    pub fn bind(&mut self, id: i32, binding: DbBinding) {
        self.bindings.insert(id, binding);
    }

    pub fn binding(&self, id: i32) -> Option<DbBinding> {
        self.bindings.get(&id).copied()
    }

    /// Mark that a close could not be logged.
    pub fn mark_not_logged(&mut self, handle: FnameHandle) {
        if let Some(f) = self.fname_mut(handle) {
            f.not_logged = true;
        }
    }

    /// True if any entry failed to log its close; checked at shutdown.
    pub fn any_not_logged(&self) -> bool {
        self.table
            .iter()
            .flatten()
            .any(|f| f.not_logged)
    }

    /// Build the register record for an FNAME.
    pub fn register_record(&self, handle: FnameHandle, opcode: u32, txnid: u32) -> Result<Vec<u8>> {
        let f = self
            .fname(handle)
            .ok_or_else(|| Error::Invalid("bad fname handle".into()))?;
        Ok(DbregRegisterArgs {
            txnid,
            prev_lsn: Lsn::ZERO,
            opcode,
            name: f.name.clone().unwrap_or_default().into_bytes(),
            uid: f.uid,
            fileid: f.id,
            ftype: f.dbtype.code(),
            meta_pgno: f.meta_pgno,
        }
        .encode())
    }

    /// Encode one record per live FNAME: the open-file snapshot written
    /// at checkpoints and at the head of every new log file. During
    /// recovery the snapshot is written as CLOSE records instead, so a
    /// future backward pass sees the files closed going forward.
    pub fn snapshot_records(&self, recovering: bool) -> Vec<Vec<u8>> {
        let opcode = if recovering { DBREG_CLOSE } else { DBREG_CHKPNT };
        self.open_list
            .iter()
            .filter_map(|&h| self.register_record(h, opcode, 0).ok())
            .collect()
    }

    /// Ids currently bound, for diagnostics.
    pub fn live_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.id_map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_one(reg: &mut FileRegistry, name: &str) -> FnameHandle {
        reg.setup(Some(name), [1u8; 16], DbType::Btree, 0, 0)
    }

    #[test]
    fn test_ids_allocate_sequentially_and_recycle() {
        let mut reg = FileRegistry::new();
        let a = setup_one(&mut reg, "a.db");
        let b = setup_one(&mut reg, "b.db");

        let id_a = reg.alloc_id();
        reg.install(a, id_a, 0).unwrap();
        let id_b = reg.alloc_id();
        reg.install(b, id_b, 0).unwrap();
        assert_eq!((id_a, id_b), (0, 1));

        // Revoking recycles the id for the next open.
        reg.revoke_id(a, 0);
        assert_eq!(reg.alloc_id(), 0);
        assert_eq!(reg.alloc_id(), 2);
    }

    #[test]
    fn test_generation_guard_blocks_recycling() {
        let mut reg = FileRegistry::new();
        let a = setup_one(&mut reg, "a.db");
        let id = reg.alloc_id();
        reg.install(a, id, 3).unwrap();

        // Replication generation moved on; the id must not be reused.
        reg.revoke_id(a, 4);
        assert_eq!(reg.alloc_id(), 1);
    }

    #[test]
    fn test_assign_id_displaces_owner() {
        let mut reg = FileRegistry::new();
        let a = setup_one(&mut reg, "a.db");
        let b = setup_one(&mut reg, "b.db");
        reg.install(a, 5, 0).unwrap();

        let displaced = reg.assign_id(b, 5, 0).unwrap();
        assert_eq!(displaced, Some(a));
        assert_eq!(reg.handle_of_id(5), Some(b));
        assert_eq!(reg.fname(a).unwrap().id, DBREG_INVALID_ID);
        // fid_max advanced past the assigned id.
        assert_eq!(reg.alloc_id(), 6);
    }

    #[test]
    fn test_install_clears_create_txnid() {
        let mut reg = FileRegistry::new();
        let h = reg.setup(Some("t.db"), [2u8; 16], DbType::Btree, 0, 77);
        assert_eq!(reg.fname(h).unwrap().create_txnid, 77);
        let id = reg.alloc_id();
        reg.install(h, id, 0).unwrap();
        assert_eq!(reg.fname(h).unwrap().create_txnid, 0);
    }

    #[test]
    fn test_snapshot_records_cover_open_set() {
        let mut reg = FileRegistry::new();
        let a = setup_one(&mut reg, "a.db");
        let b = setup_one(&mut reg, "b.db");
        let id_a = reg.alloc_id();
        reg.install(a, id_a, 0).unwrap();
        let id_b = reg.alloc_id();
        reg.install(b, id_b, 0).unwrap();

        let recs = reg.snapshot_records(false);
        assert_eq!(recs.len(), 2);
        let decoded = DbregRegisterArgs::decode(&recs[0]).unwrap();
        assert_eq!(decoded.opcode, DBREG_CHKPNT);

        let recs = reg.snapshot_records(true);
        let decoded = DbregRegisterArgs::decode(&recs[0]).unwrap();
        assert_eq!(decoded.opcode, DBREG_CLOSE);
    }

    #[test]
    fn test_not_logged_flag() {
        let mut reg = FileRegistry::new();
        let a = setup_one(&mut reg, "a.db");
        assert!(!reg.any_not_logged());
        reg.mark_not_logged(a);
        assert!(reg.any_not_logged());
    }
}
