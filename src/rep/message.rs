//! Replication wire format.
//!
//! Every message is a fixed 32-byte control structure plus an optional
//! record payload. Control integers are little-endian on the wire
//! regardless of host order:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | rep_version |
//! | 4 | log_version |
//! | 8 | rectype |
//! | 12 | flags |
//! | 16 | gen |
//! | 20 | lsn.file |
//! | 24 | lsn.offset |
//! | 28 | msg_len |

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::log::Lsn;
use crate::{Error, Result};

/// Replication protocol version this engine speaks.
pub const REP_VERSION: u32 = 3;

/// Size of the encoded control structure.
pub const CONTROL_SIZE: usize = 32;

/// Control flag: the ALIVE sender believes it is master.
pub const FLAG_IS_MASTER: u32 = 0x1;

/// Replication message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageType {
    /// I am alive; payload may carry my egen.
    Alive,
    /// Ask a site whether it is alive and where its log ends.
    AliveReq,
    /// Ask the master to stream everything from an LSN on.
    AllReq,
    /// Coalesced log records.
    BulkLog,
    /// Coalesced pages during internal initialization.
    BulkPage,
    /// Ask a site to hold an election.
    Elect,
    /// One log record.
    Log,
    /// One log record, with more available on request.
    LogMore,
    /// Ask the master for a bounded range of log records.
    LogReq,
    /// Ask the group who the master is.
    MasterReq,
    /// A new client joined.
    NewClient,
    /// The log rolled over to a new file.
    NewFile,
    /// A site declares itself master.
    NewMaster,
    /// Broadcast notice of a new site.
    NewSite,
    /// One page during internal initialization.
    Page,
    /// Ask the master for pages.
    PageReq,
    /// Internal-initialization file list.
    Update,
    /// Ask the master for its file list.
    UpdateReq,
    /// The record at the requested verify LSN.
    Verify,
    /// The master no longer has the requested LSN.
    VerifyFail,
    /// Ask the master for the record at an LSN.
    VerifyReq,
    /// Phase-1 election vote.
    Vote1,
    /// Phase-2 election vote.
    Vote2,
}

impl MessageType {
    /// Convert a wire code to a message type.
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            1 => MessageType::Alive,
            2 => MessageType::AliveReq,
            3 => MessageType::AllReq,
            4 => MessageType::BulkLog,
            5 => MessageType::BulkPage,
            6 => MessageType::Elect,
            7 => MessageType::Log,
            8 => MessageType::LogMore,
            9 => MessageType::LogReq,
            10 => MessageType::MasterReq,
            11 => MessageType::NewClient,
            12 => MessageType::NewFile,
            13 => MessageType::NewMaster,
            14 => MessageType::NewSite,
            15 => MessageType::Page,
            16 => MessageType::PageReq,
            17 => MessageType::Update,
            18 => MessageType::UpdateReq,
            19 => MessageType::Verify,
            20 => MessageType::VerifyFail,
            21 => MessageType::VerifyReq,
            22 => MessageType::Vote1,
            23 => MessageType::Vote2,
            _ => return None,
        })
    }

    /// The wire code.
    pub fn code(&self) -> u32 {
        match self {
            MessageType::Alive => 1,
            MessageType::AliveReq => 2,
            MessageType::AllReq => 3,
            MessageType::BulkLog => 4,
            MessageType::BulkPage => 5,
            MessageType::Elect => 6,
            MessageType::Log => 7,
            MessageType::LogMore => 8,
            MessageType::LogReq => 9,
            MessageType::MasterReq => 10,
            MessageType::NewClient => 11,
            MessageType::NewFile => 12,
            MessageType::NewMaster => 13,
            MessageType::NewSite => 14,
            MessageType::Page => 15,
            MessageType::PageReq => 16,
            MessageType::Update => 17,
            MessageType::UpdateReq => 18,
            MessageType::Verify => 19,
            MessageType::VerifyFail => 20,
            MessageType::VerifyReq => 21,
            MessageType::Vote1 => 22,
            MessageType::Vote2 => 23,
        }
    }
}

/// The control structure accompanying every replication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepControl {
    pub rep_version: u32,
    pub log_version: u32,
    pub rectype: MessageType,
    pub flags: u32,
    /// Sender's master generation.
    pub gen: u32,
    /// Meaning depends on the message: record position for LOG,
    /// requested position for *_REQ, end-of-log for NEWMASTER/ALIVE.
    pub lsn: Lsn,
    /// Length of the accompanying record payload.
    pub msg_len: u32,
}

impl RepControl {
    pub fn new(rectype: MessageType, gen: u32, lsn: Lsn, msg_len: u32) -> Self {
        RepControl {
            rep_version: REP_VERSION,
            log_version: crate::log::LOG_VERSION,
            rectype,
            flags: 0,
            gen,
            lsn,
            msg_len,
        }
    }

    /// Encode to the 32-byte little-endian wire form.
    pub fn encode(&self) -> [u8; CONTROL_SIZE] {
        let mut buf = [0u8; CONTROL_SIZE];
        LittleEndian::write_u32(&mut buf[0..], self.rep_version);
        LittleEndian::write_u32(&mut buf[4..], self.log_version);
        LittleEndian::write_u32(&mut buf[8..], self.rectype.code());
        LittleEndian::write_u32(&mut buf[12..], self.flags);
        LittleEndian::write_u32(&mut buf[16..], self.gen);
        LittleEndian::write_u32(&mut buf[20..], self.lsn.file);
        LittleEndian::write_u32(&mut buf[24..], self.lsn.offset);
        LittleEndian::write_u32(&mut buf[28..], self.msg_len);
        buf
    }

    /// Decode from the wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTROL_SIZE {
            return Err(Error::Invalid(format!(
                "control structure is {} bytes, expected {}",
                buf.len(),
                CONTROL_SIZE
            )));
        }
        let code = LittleEndian::read_u32(&buf[8..]);
        let rectype = MessageType::from_u32(code)
            .ok_or_else(|| Error::Invalid(format!("unknown replication message type {}", code)))?;
        Ok(RepControl {
            rep_version: LittleEndian::read_u32(&buf[0..]),
            log_version: LittleEndian::read_u32(&buf[4..]),
            rectype,
            flags: LittleEndian::read_u32(&buf[12..]),
            gen: LittleEndian::read_u32(&buf[16..]),
            lsn: Lsn::new(
                LittleEndian::read_u32(&buf[20..]),
                LittleEndian::read_u32(&buf[24..]),
            ),
            msg_len: LittleEndian::read_u32(&buf[28..]),
        })
    }
}

/// Payload of a VOTE1 (and, egen only, a VOTE2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteInfo {
    pub egen: u32,
    pub nsites: u32,
    pub nvotes: u32,
    pub priority: u32,
    pub tiebreaker: u32,
}

impl VoteInfo {
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..], self.egen);
        LittleEndian::write_u32(&mut buf[4..], self.nsites);
        LittleEndian::write_u32(&mut buf[8..], self.nvotes);
        LittleEndian::write_u32(&mut buf[12..], self.priority);
        LittleEndian::write_u32(&mut buf[16..], self.tiebreaker);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Invalid("vote payload too short".into()));
        }
        Ok(VoteInfo {
            egen: LittleEndian::read_u32(&buf[0..]),
            nsites: LittleEndian::read_u32(&buf[4..]),
            nvotes: LittleEndian::read_u32(&buf[8..]),
            priority: LittleEndian::read_u32(&buf[12..]),
            tiebreaker: LittleEndian::read_u32(&buf[16..]),
        })
    }
}

/// Encode an LSN as a little-endian payload (NEWFILE's old-file link,
/// ALIVE's egen-bearing variants use [`VoteInfo`] instead).
pub fn encode_lsn_payload(lsn: Lsn) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u32(&mut buf[0..], lsn.file);
    LittleEndian::write_u32(&mut buf[4..], lsn.offset);
    buf
}

/// Decode an LSN payload.
pub fn decode_lsn_payload(buf: &[u8]) -> Result<Lsn> {
    if buf.len() < 8 {
        return Err(Error::Invalid("LSN payload too short".into()));
    }
    Ok(Lsn::new(
        LittleEndian::read_u32(&buf[0..]),
        LittleEndian::read_u32(&buf[4..]),
    ))
}
