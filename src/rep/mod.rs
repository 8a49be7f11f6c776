//! Replication.
//!
//! Every site in a replication group runs the same message-driven state
//! machine. One site is master and streams its log; the others are
//! clients that append the stream to their own logs and replay committed
//! transactions. When the master is lost, a two-phase election picks the
//! site with the most log (then highest priority, then a random
//! tiebreaker). A client joining or changing masters first negotiates a
//! common log prefix through the VERIFY handshake, rolling its log back
//! record by record until master and client agree byte-for-byte.
//!
//! Submodules: [`message`] (wire format), [`process`] (the dispatch
//! loop), [`election`], [`apply`] (client catch-up and replay).

pub mod apply;
pub mod election;
pub mod message;
pub mod process;

use std::collections::BTreeMap;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::log::Lsn;
use crate::rep::message::RepControl;
use crate::{Error, Result};

/// Environment id of a site.
pub type Eid = i32;
/// "No site": the invalid id.
pub const EID_INVALID: Eid = -1;
/// Send target meaning "every site".
pub const EID_BROADCAST: Eid = -2;

/// Name of the file persisting the election generation.
pub const EGEN_FILE: &str = "__db.rep.egen";

/// Initial number of records a client waits at a gap before asking for a
/// resend.
pub const REQUEST_GAP_DEFAULT: u32 = 4;
/// Ceiling for the doubling rerequest interval.
pub const MAX_GAP_DEFAULT: u32 = 128;

/// This site's replication role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepRole {
    /// Replication not started.
    None,
    Master,
    Client,
}

/// One tallied vote: who, at which election generation.
#[derive(Debug, Clone, Copy)]
pub struct VoteTally {
    pub eid: Eid,
    pub egen: u32,
}

/// Point-in-time view of the replication state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepSnapshot {
    pub eid: Eid,
    pub role: RepRole,
    pub master_id: Eid,
    pub gen: u32,
    pub egen: u32,
    pub in_election: bool,
    pub recovering: bool,
}

/// Point-in-time replication statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepStats {
    pub msgs_processed: u64,
    pub msgs_bad_gen: u64,
    pub msgs_recovering: u64,
    pub log_records: u64,
    /// Records currently held in the out-of-order queue.
    pub log_queued: u64,
    /// Records that ever passed through the queue.
    pub log_queued_total: u64,
    pub log_queued_max: u64,
    pub log_duplicated: u64,
    pub log_requested: u64,
    pub throttles: u64,
    pub newsites: u64,
    pub dupmasters: u64,
    pub elections: u64,
    pub elections_won: u64,
    pub txns_applied: u64,
    pub outdated: u64,
}

/// Replication region state, one per site, guarded by the replication
/// mutex.
pub struct RepRegion {
    pub eid: Eid,
    pub role: RepRole,
    /// Current master generation; advances on every successful election.
    pub gen: u32,
    /// Election generation; always at least `gen`, and persisted before
    /// this site votes so a crash cannot produce a double vote.
    pub egen: u32,
    pub master_id: Eid,

    pub nsites: u32,
    pub nvotes: u32,
    pub priority: u32,

    /// Phase-1 of an election is underway.
    pub in_phase1: bool,
    /// Phase-2 of an election is underway.
    pub in_phase2: bool,
    /// Votes arrived before this site called an election; kept so the
    /// late election starts with them.
    pub tallying: bool,
    /// An election call is active on some thread.
    pub elect_running: bool,

    /// Sites heard from in phase 1.
    pub sites: u32,
    /// VOTE2s received in phase 2.
    pub votes: u32,
    pub winner: Eid,
    pub w_priority: u32,
    pub w_lsn: Lsn,
    pub w_gen: u32,
    pub w_tiebreaker: u32,
    pub tally1: Vec<VoteTally>,
    pub tally2: Vec<VoteTally>,

    /// Client is verifying its log against a new master.
    pub recover_verify: bool,
    /// Client is receiving an internal-initialization page dump.
    pub recover_page: bool,
    /// Client is waiting for an internal-initialization file list.
    pub recover_update: bool,

    /// Defer catch-up until the application calls `rep_sync`.
    pub delay_client: bool,
    /// Saved verify target while delayed.
    pub delayed_lsn: Lsn,
    /// Fail instead of entering internal initialization.
    pub noautoinit: bool,
    /// Coalesce outgoing master log records into bulk buffers.
    pub bulk: bool,

    pub request_gap: u32,
    pub max_gap: u32,
    /// Outgoing stream budget: gigabytes + bytes, zero meaning
    /// unlimited.
    pub gbytes: u32,
    pub bytes: u32,

    /// Master: position up to which the live stream has been sent.
    pub last_streamed: Lsn,
    /// Master: LSN of the last record actually sent, for NEWFILE
    /// payloads.
    pub last_streamed_rec: Lsn,
    /// Pending bulk-mode segments.
    pub bulk_buf: Vec<u8>,

    pub stats: RepStats,
}

impl RepRegion {
    pub fn new(eid: Eid) -> Self {
        RepRegion {
            eid,
            role: RepRole::None,
            gen: 0,
            egen: 1,
            master_id: EID_INVALID,
            nsites: 0,
            nvotes: 0,
            priority: 0,
            in_phase1: false,
            in_phase2: false,
            tallying: false,
            elect_running: false,
            sites: 0,
            votes: 0,
            winner: EID_INVALID,
            w_priority: 0,
            w_lsn: Lsn::ZERO,
            w_gen: 0,
            w_tiebreaker: 0,
            tally1: Vec::new(),
            tally2: Vec::new(),
            recover_verify: false,
            recover_page: false,
            recover_update: false,
            delay_client: false,
            delayed_lsn: Lsn::ZERO,
            noautoinit: false,
            bulk: false,
            request_gap: REQUEST_GAP_DEFAULT,
            max_gap: MAX_GAP_DEFAULT,
            gbytes: 0,
            bytes: 0,
            last_streamed: Lsn::ZERO,
            last_streamed_rec: Lsn::ZERO,
            bulk_buf: Vec::new(),
            stats: RepStats::default(),
        }
    }

    /// In either election phase.
    pub fn in_election(&self) -> bool {
        self.in_phase1 || self.in_phase2
    }

    /// In an election, or holding early votes for one.
    pub fn in_election_tally(&self) -> bool {
        self.in_election() || self.tallying
    }

    /// In any client recovery state.
    pub fn recovering(&self) -> bool {
        self.recover_verify || self.recover_page || self.recover_update
    }

    /// Clear all per-election state. Called when an election completes
    /// or is superseded by a newer egen.
    pub fn election_done(&mut self) {
        self.in_phase1 = false;
        self.in_phase2 = false;
        self.tallying = false;
        self.sites = 0;
        self.votes = 0;
        self.winner = EID_INVALID;
        self.w_priority = 0;
        self.w_lsn = Lsn::ZERO;
        self.w_gen = 0;
        self.w_tiebreaker = 0;
        self.tally1.clear();
        self.tally2.clear();
    }
}

/// Client catch-up state, guarded by the client mutex.
pub struct ClientState {
    /// Next LSN expected in the local log.
    pub ready_lsn: Lsn,
    /// LSN of the earliest queued out-of-order record; zero when the
    /// queue is empty.
    pub waiting_lsn: Lsn,
    /// LSN being matched against the master during VERIFY; zero when
    /// not verifying.
    pub verify_lsn: Lsn,
    /// Out-of-order records keyed by LSN.
    pub pending: BTreeMap<Lsn, (RepControl, Vec<u8>)>,
    /// Records received since the gap appeared.
    pub rcvd_recs: u32,
    /// Records to wait before rerequesting; doubles up to `max_gap`.
    pub wait_recs: u32,
}

impl ClientState {
    pub fn new() -> Self {
        ClientState {
            ready_lsn: Lsn::ZERO,
            waiting_lsn: Lsn::ZERO,
            verify_lsn: Lsn::ZERO,
            pending: BTreeMap::new(),
            rcvd_recs: 0,
            wait_recs: 0,
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

/// How the host delivers messages to other sites. The engine may call
/// this under region locks; the callback must not call back into the
/// engine's write APIs.
pub trait Transport: Send + Sync {
    /// Deliver `control` and `rec` to `eid`, or to every site when
    /// `None`.
    fn send(
        &self,
        control: &RepControl,
        rec: &[u8],
        eid: Option<Eid>,
        flags: u32,
    ) -> std::result::Result<(), ()>;
}

/// Informational outcomes of message processing; the host acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepOutcome {
    /// Nothing further to do.
    Processed,
    /// A new site joined the group.
    NewSite,
    /// This or another site became master.
    NewMaster(Eid),
    /// A vote arrived outside an election; call one.
    HoldElection,
    /// Two sites claim mastership; call an election.
    DupMaster,
}

/// Persist the election generation. Written before this site votes at
/// `egen`, so after a crash it can never vote at that generation again.
pub fn write_egen(dir: &Path, egen: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, egen);
    let path = dir.join(EGEN_FILE);
    std::fs::write(&path, buf)
        .map_err(|e| Error::Io(format!("cannot write {}: {}", path.display(), e)))?;
    // The write must be durable before any vote is sent.
    if let Ok(f) = std::fs::File::open(&path) {
        f.sync_all().map_err(|e| Error::Io(e.to_string()))?;
    }
    Ok(())
}

/// Read the persisted election generation, if any.
pub fn read_egen(dir: &Path) -> Result<Option<u32>> {
    match std::fs::read(dir.join(EGEN_FILE)) {
        Ok(buf) if buf.len() >= 4 => Ok(Some(BigEndian::read_u32(&buf))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_egen_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_egen(dir.path()).unwrap(), None);
        write_egen(dir.path(), 42).unwrap();
        assert_eq!(read_egen(dir.path()).unwrap(), Some(42));
        write_egen(dir.path(), 43).unwrap();
        assert_eq!(read_egen(dir.path()).unwrap(), Some(43));
    }

    #[test]
    fn test_election_done_resets() {
        let mut rep = RepRegion::new(1);
        rep.in_phase1 = true;
        rep.sites = 3;
        rep.winner = 2;
        rep.w_lsn = Lsn::new(5, 100);
        rep.tally1.push(VoteTally { eid: 2, egen: 7 });
        rep.election_done();
        assert!(!rep.in_election());
        assert_eq!(rep.sites, 0);
        assert_eq!(rep.winner, EID_INVALID);
        assert!(rep.tally1.is_empty());
    }
}
