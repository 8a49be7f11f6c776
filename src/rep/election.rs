//! Leader election.
//!
//! Two phases. In phase 1 every participant broadcasts a VOTE1 carrying
//! its end-of-log LSN, priority, and a random tiebreaker; each site
//! tracks the best candidate it has seen (most log wins, then priority,
//! then tiebreaker — priority zero can never win). When a site has
//! heard from the whole group, or from a quorum when its timer expires,
//! it sends a VOTE2 to its winner. A site collecting `nvotes` VOTE2s
//! declares itself master at generation `w_gen + 1` and broadcasts
//! NEWMASTER.
//!
//! Election attempts are numbered by `egen`. A site durably writes
//! `egen + 1` before casting any vote, so after a crash it can never
//! vote twice in the same attempt; a vote from a newer egen resets the
//! local election and adopts it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::env::EnvInner;
use crate::log::Lsn;
use crate::rep::message::{MessageType, RepControl, VoteInfo};
use crate::rep::process::send_message;
use crate::rep::{Eid, RepOutcome, RepRegion, RepRole, VoteTally, EID_INVALID};
use crate::{Error, Result};

/// Poll granularity of the blocking wait.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(500);

/// Record a vote in a tally, refusing duplicates. A VOTE1 from a later
/// egen replaces the earlier entry without changing the count.
fn tally(list: &mut Vec<VoteTally>, count: &mut u32, eid: Eid, egen: u32) -> bool {
    for entry in list.iter_mut() {
        if entry.eid == eid {
            if entry.egen >= egen {
                return false;
            }
            entry.egen = egen;
            return true;
        }
    }
    list.push(VoteTally { eid, egen });
    *count += 1;
    true
}

/// Update the cumulative winner with an incoming candidacy. The LSN is
/// the primary determinant, then priority, then the tiebreaker;
/// priority zero is never eligible.
fn cmp_vote(
    rep: &mut RepRegion,
    eid: Eid,
    lsn: Lsn,
    priority: u32,
    gen: u32,
    tiebreaker: u32,
) {
    if rep.sites > 1 {
        if priority == 0 {
            return;
        }
        let cmp = lsn.cmp(&rep.w_lsn);
        if cmp == std::cmp::Ordering::Greater
            || (cmp == std::cmp::Ordering::Equal
                && (priority > rep.w_priority
                    || (priority == rep.w_priority && tiebreaker > rep.w_tiebreaker)))
        {
            rep.winner = eid;
            rep.w_priority = priority;
            rep.w_lsn = lsn;
            rep.w_gen = gen;
            rep.w_tiebreaker = tiebreaker;
        }
    } else if priority != 0 {
        rep.winner = eid;
        rep.w_priority = priority;
        rep.w_lsn = lsn;
        rep.w_gen = gen;
        rep.w_tiebreaker = tiebreaker;
    } else {
        rep.winner = EID_INVALID;
        rep.w_priority = 0;
        rep.w_lsn = Lsn::ZERO;
        rep.w_gen = 0;
        rep.w_tiebreaker = 0;
    }
}

fn send_vote1(inner: &EnvInner, lsn: Lsn, vi: VoteInfo) {
    let _ = send_message(
        inner,
        None,
        MessageType::Vote1,
        lsn,
        &vi.encode(),
        0,
    );
}

/// Declare this site the master: called with the region locked once
/// phase 2 reaches quorum. Returns the NEWMASTER broadcast parameters.
fn elect_master(rep: &mut RepRegion) -> Eid {
    rep.master_id = rep.eid;
    rep.gen = rep.w_gen + 1;
    if rep.egen <= rep.gen {
        rep.egen = rep.gen + 1;
    }
    rep.role = RepRole::Master;
    rep.election_done();
    rep.elect_running = false;
    rep.stats.elections_won += 1;
    info!(eid = rep.eid, gen = rep.gen, "won election");
    rep.master_id
}

/// Begin an election without blocking: persist the next egen, tally our
/// own candidacy, and broadcast VOTE1. Phase transitions then happen in
/// the vote handlers as messages arrive.
pub(crate) fn elect_begin(
    inner: &Arc<EnvInner>,
    nsites: u32,
    nvotes: u32,
    priority: u32,
) -> Result<()> {
    if nsites == 0 {
        return Err(Error::Invalid("nsites must be greater than 0".into()));
    }
    if nvotes > nsites {
        return Err(Error::Invalid(format!(
            "nvotes ({}) is larger than nsites ({})",
            nvotes, nsites
        )));
    }
    // Default to a simple majority.
    let ack = if nvotes == 0 { nsites / 2 + 1 } else { nvotes };

    let end = {
        let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
        log.current_lsn()
    };

    {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.role == RepRole::Master {
            drop(rep);
            let _ = send_message(inner, None, MessageType::NewMaster, end, &[], 0);
            return Ok(());
        }
        if rep.in_election() || rep.elect_running {
            // Another thread is already running this election.
            return Ok(());
        }
    }

    let (egen, vi) = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.stats.elections += 1;
        rep.elect_running = true;
        rep.nsites = nsites;
        rep.nvotes = ack;
        rep.priority = priority;
        rep.master_id = EID_INVALID;
        rep.in_phase1 = true;
        rep.in_phase2 = false;
        rep.tallying = false;

        let egen = rep.egen;
        let tiebreaker: u32 = rand::random();

        let eid = rep.eid;
        let rep_mut = &mut *rep;
        tally(&mut rep_mut.tally1, &mut rep_mut.sites, eid, egen);
        let gen = rep.gen;
        cmp_vote(&mut rep, eid, end, priority, gen, tiebreaker);
        (
            egen,
            VoteInfo {
                egen,
                nsites,
                nvotes: ack,
                priority,
                tiebreaker,
            },
        )
    };

    // Never participate in this egen again after a crash.
    crate::rep::write_egen(&inner.dir, egen + 1)?;

    debug!(egen, nsites, nvotes = ack, priority, "broadcasting VOTE1");
    send_vote1(inner, end, vi);
    Ok(())
}

/// Move to phase 2 after a timeout with at least a quorum of phase-1
/// votes. Returns the winner, or None when quorum was not reached.
fn phase1_timeout(inner: &Arc<EnvInner>) -> Option<Eid> {
    let (winner, self_eid, egen) = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.sites < rep.nvotes || rep.winner == EID_INVALID {
            return None;
        }
        rep.in_phase1 = false;
        rep.in_phase2 = true;
        let winner = rep.winner;
        let eid = rep.eid;
        let egen = rep.egen;
        if winner == eid {
            let (mut votes, mut t2) = (rep.votes, std::mem::take(&mut rep.tally2));
            tally(&mut t2, &mut votes, eid, egen);
            rep.tally2 = t2;
            rep.votes = votes;
        }
        (winner, eid, egen)
    };
    if winner != self_eid {
        let vi = VoteInfo {
            egen,
            nsites: 0,
            nvotes: 0,
            priority: 0,
            tiebreaker: 0,
        };
        let _ = send_message(
            inner,
            Some(winner),
            MessageType::Vote2,
            Lsn::ZERO,
            &vi.encode(),
            0,
        );
    }
    Some(winner)
}

/// Hold an election and wait for its outcome. Returns the elected
/// master's id. Waits poll at half-second granularity; an egen change
/// while waiting restarts the election with the timeout backed off to
/// 80%.
pub(crate) fn elect(
    inner: &Arc<EnvInner>,
    nsites: u32,
    nvotes: u32,
    priority: u32,
    timeout: Duration,
) -> Result<Eid> {
    let mut to = timeout;
    loop {
        {
            let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            if rep.role == RepRole::Master {
                return Ok(rep.eid);
            }
        }
        elect_begin(inner, nsites, nvotes, priority)?;

        match wait(inner, to, |rep| !rep.in_phase1) {
            WaitResult::Done(eid) => return Ok(eid),
            WaitResult::EgenChange => {
                to = backoff(to, timeout);
                restart(inner);
                continue;
            }
            WaitResult::Timeout => {
                if phase1_timeout(inner).is_none() {
                    finish(inner);
                    return Err(Error::Unavail);
                }
                // Give a winner that started late time to count votes.
                to = to.saturating_mul(2);
            }
            WaitResult::PhaseDone => {}
        }

        // Phase 2: wait for the outcome.
        match wait(inner, to, |rep| !rep.in_phase2) {
            WaitResult::Done(eid) => return Ok(eid),
            WaitResult::EgenChange => {
                to = backoff(to, timeout);
                restart(inner);
                continue;
            }
            WaitResult::Timeout => {
                finish(inner);
                return Err(Error::Unavail);
            }
            WaitResult::PhaseDone => {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                if rep.master_id != EID_INVALID {
                    return Ok(rep.master_id);
                }
                drop(rep);
                finish(inner);
                return Err(Error::Unavail);
            }
        }
    }
}

fn backoff(to: Duration, original: Duration) -> Duration {
    // 80% of the current value, bounded by the caller's original.
    let to = to.min(original);
    to.mul_f64(0.8)
}

fn restart(inner: &Arc<EnvInner>) {
    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
    rep.elect_running = false;
    rep.in_phase1 = false;
    rep.in_phase2 = false;
}

fn finish(inner: &Arc<EnvInner>) {
    let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
    rep.election_done();
    rep.elect_running = false;
}

enum WaitResult {
    /// A master emerged.
    Done(Eid),
    /// The phase predicate came true without a master yet.
    PhaseDone,
    EgenChange,
    Timeout,
}

fn wait(
    inner: &Arc<EnvInner>,
    timeout: Duration,
    phase_over: impl Fn(&RepRegion) -> bool,
) -> WaitResult {
    let start_egen = {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        rep.egen
    };
    let deadline = Instant::now() + timeout;
    let sleep = SLEEP_GRANULARITY.min(timeout / 10).max(Duration::from_millis(1));
    loop {
        std::thread::sleep(sleep);
        {
            let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
            if rep.egen != start_egen {
                return WaitResult::EgenChange;
            }
            if !rep.in_election() && rep.master_id != EID_INVALID {
                return WaitResult::Done(rep.master_id);
            }
            if phase_over(&rep) {
                return WaitResult::PhaseDone;
            }
        }
        if Instant::now() >= deadline {
            return WaitResult::Timeout;
        }
    }
}

/// Handle an incoming VOTE1.
pub(crate) fn vote1(
    inner: &Arc<EnvInner>,
    rp: &RepControl,
    rec: &[u8],
    eid: Eid,
) -> Result<RepOutcome> {
    {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.role == RepRole::Master {
            drop(rep);
            let end = {
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            let _ = send_message(inner, None, MessageType::NewMaster, end, &[], 0);
            return Ok(RepOutcome::Processed);
        }
    }

    let vi = VoteInfo::decode(rec)?;
    let mut hold = false;
    let mut send_vote2_to = EID_INVALID;
    let mut stale_egen = None;
    let mut vote2_egen = 0;
    {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());

        if vi.egen < rep.egen {
            // A stale voter; tell it where the group is.
            stale_egen = Some(rep.egen);
        } else {
            if vi.egen > rep.egen {
                debug!(
                    from = vi.egen,
                    at = rep.egen,
                    "vote from newer election generation; resetting"
                );
                rep.election_done();
                rep.egen = vi.egen;
            }
            if !rep.in_election() {
                rep.tallying = true;
            }
            if vi.nsites > rep.nsites {
                rep.nsites = vi.nsites;
            }
            if vi.nvotes > rep.nvotes {
                rep.nvotes = vi.nvotes;
            }
            if rep.sites + 1 > rep.nsites {
                rep.nsites = rep.sites + 1;
            }

            if rep.in_phase2 {
                // Too late for this one; phase 2 is already underway.
                return Ok(RepOutcome::Processed);
            }

            let (mut sites, mut t1) = (rep.sites, std::mem::take(&mut rep.tally1));
            let counted = tally(&mut t1, &mut sites, eid, vi.egen);
            rep.tally1 = t1;
            rep.sites = sites;
            if counted {
                cmp_vote(&mut rep, eid, rp.lsn, vi.priority, rp.gen, vi.tiebreaker);
            }

            if !rep.in_election() {
                // Recorded for a future election; tell the caller to
                // hold one.
                hold = true;
            } else {
                // All sites heard from: phase 1 is complete.
                let done = rep.sites >= rep.nsites && rep.w_priority != 0;
                if done {
                    rep.in_phase1 = false;
                    rep.in_phase2 = true;
                    let winner = rep.winner;
                    let self_eid = rep.eid;
                    vote2_egen = rep.egen;
                    if winner == self_eid {
                        let (mut votes, mut t2) =
                            (rep.votes, std::mem::take(&mut rep.tally2));
                        tally(&mut t2, &mut votes, self_eid, vote2_egen);
                        rep.tally2 = t2;
                        rep.votes = votes;
                    } else {
                        send_vote2_to = winner;
                    }
                }
            }
        }
    }

    if let Some(egen) = stale_egen {
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, egen);
        let _ = send_message(inner, Some(eid), MessageType::Alive, rp.lsn, &payload, 0);
        return Ok(RepOutcome::Processed);
    }
    if send_vote2_to != EID_INVALID {
        let vi2 = VoteInfo {
            egen: vote2_egen,
            nsites: 0,
            nvotes: 0,
            priority: 0,
            tiebreaker: 0,
        };
        let _ = send_message(
            inner,
            Some(send_vote2_to),
            MessageType::Vote2,
            Lsn::ZERO,
            &vi2.encode(),
            0,
        );
    }
    if hold {
        return Ok(RepOutcome::HoldElection);
    }
    Ok(RepOutcome::Processed)
}

/// Handle an incoming VOTE2: someone voted for us.
pub(crate) fn vote2(
    inner: &Arc<EnvInner>,
    _rp: &RepControl,
    rec: &[u8],
    eid: Eid,
) -> Result<RepOutcome> {
    {
        let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
        if rep.role == RepRole::Master {
            drop(rep);
            let end = {
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                log.current_lsn()
            };
            let _ = send_message(inner, Some(eid), MessageType::NewMaster, end, &[], 0);
            return Ok(RepOutcome::Processed);
        }
    }

    let vi = VoteInfo::decode(rec)?;
    let won = {
        let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());

        if !rep.in_election_tally() && vi.egen >= rep.egen {
            return Ok(RepOutcome::HoldElection);
        }

        // The vote must match a VOTE1 we tallied in this generation:
        // latent votes from earlier elections and votes from sites we
        // never heard from are dropped.
        let matches_vote1 = rep
            .tally1
            .iter()
            .any(|t| t.eid == eid && t.egen == vi.egen);
        if !matches_vote1 {
            debug!(eid, egen = vi.egen, "VOTE2 without a matching VOTE1; ignoring");
            return Ok(RepOutcome::Processed);
        }

        let (mut votes, mut t2) = (rep.votes, std::mem::take(&mut rep.tally2));
        let counted = tally(&mut t2, &mut votes, eid, vi.egen);
        rep.tally2 = t2;
        rep.votes = votes;
        if !counted {
            return Ok(RepOutcome::Processed);
        }

        if rep.votes >= rep.nvotes {
            Some(elect_master(&mut rep))
        } else {
            None
        }
    };

    match won {
        Some(master) => {
            let end = {
                let mut rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                let log = inner.log.lock().unwrap_or_else(|e| e.into_inner());
                rep.last_streamed = log.current_lsn();
                rep.last_streamed_rec = log.last_record_lsn();
                log.current_lsn()
            };
            crate::rep::write_egen(&inner.dir, {
                let rep = inner.rep.lock().unwrap_or_else(|e| e.into_inner());
                rep.egen
            })?;
            let _ = send_message(inner, None, MessageType::NewMaster, end, &[], 0);
            Ok(RepOutcome::NewMaster(master))
        }
        None => Ok(RepOutcome::Processed),
    }
}
