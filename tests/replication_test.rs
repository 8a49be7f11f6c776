//! Master/client replication scenarios with hand-routed messages.
//!
//! Every site's outgoing messages land in its own outbox, and each test
//! decides what to deliver where and in which order — which is exactly
//! what gap detection, rerequests, and the verify handshake care about.

use std::sync::{Arc, Mutex};

use burrow::db::DbType;
use burrow::env::{Env, EnvConfig};
use burrow::log::Lsn;
use burrow::rep::message::{MessageType, RepControl};
use burrow::rep::{Eid, RepRole, Transport};

type Outbox = Arc<Mutex<Vec<(Option<Eid>, Vec<u8>, Vec<u8>)>>>;

struct Collector {
    outbox: Outbox,
}

impl Transport for Collector {
    fn send(
        &self,
        control: &RepControl,
        rec: &[u8],
        eid: Option<Eid>,
        _flags: u32,
    ) -> Result<(), ()> {
        self.outbox
            .lock()
            .unwrap()
            .push((eid, control.encode().to_vec(), rec.to_vec()));
        Ok(())
    }
}

struct Site {
    eid: Eid,
    env: Env,
    outbox: Outbox,
    _dir: tempfile::TempDir,
}

fn make_site(eid: Eid) -> Site {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::open(
        dir.path(),
        EnvConfig {
            page_size: 512,
            env_id: eid as u32,
            ..EnvConfig::default()
        },
    )
    .unwrap();
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    env.rep_set_transport(
        eid,
        Arc::new(Collector {
            outbox: Arc::clone(&outbox),
        }),
    );
    Site {
        eid,
        env,
        outbox,
        _dir: dir,
    }
}

fn drain(site: &Site) -> Vec<(Option<Eid>, Vec<u8>, Vec<u8>)> {
    std::mem::take(&mut site.outbox.lock().unwrap())
}

fn rectype(ctl: &[u8]) -> MessageType {
    RepControl::decode(ctl).unwrap().rectype
}

/// Deliver every message addressed to `to` (or broadcast), recursively
/// shuttling the responses until both outboxes drain.
fn shuttle(from: &Site, to: &Site) {
    for _ in 0..10_000 {
        let mut moved = false;
        for (dst, ctl, rec) in drain(from) {
            if dst.is_none() || dst == Some(to.eid) {
                moved = true;
                to.env.rep_process_message(&ctl, &rec, from.eid).unwrap();
            }
        }
        for (dst, ctl, rec) in drain(to) {
            if dst.is_none() || dst == Some(from.eid) {
                moved = true;
                from.env.rep_process_message(&ctl, &rec, to.eid).unwrap();
            }
        }
        if !moved {
            return;
        }
    }
    panic!("shuttle failed to settle");
}

/// Bring up a master and a fully synchronized client.
fn master_client_pair() -> (Site, Site) {
    let master = make_site(1);
    let client = make_site(2);
    master.env.rep_start(RepRole::Master).unwrap();
    client.env.rep_start(RepRole::Client).unwrap();
    // The client hears NEWMASTER and pulls the (empty) log.
    shuttle(&master, &client);
    (master, client)
}

#[test]
fn test_live_stream_replicates_commits() {
    let (master, client) = master_client_pair();

    let db = master.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = master.env.txn_begin(None).unwrap();
    db.put(Some(txn), b"alpha", b"1").unwrap();
    db.put(Some(txn), b"beta", b"2").unwrap();
    master.env.txn_commit(txn).unwrap();

    shuttle(&master, &client);

    // The client's log caught up and the replayed data is readable.
    assert_eq!(
        client.env.log_stats().cur_lsn,
        master.env.log_stats().cur_lsn
    );
    let cdb = client.env.db_open("items.db", DbType::Btree, None).unwrap();
    assert_eq!(cdb.get(None, b"alpha").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(cdb.get(None, b"beta").unwrap().as_deref(), Some(&b"2"[..]));

    // And the client refuses direct writes.
    assert!(cdb.put(None, b"gamma", b"3").is_err());
}

#[test]
fn test_gap_detection_and_rerequest() {
    let (master, client) = master_client_pair();
    client.env.rep_set_request(1, 8);

    let db = master.env.db_open("items.db", DbType::Btree, None).unwrap();
    for (k, v) in [(&b"k1"[..], &b"v1"[..]), (b"k2", b"v2"), (b"k3", b"v3")] {
        let txn = master.env.txn_begin(None).unwrap();
        db.put(Some(txn), k, v).unwrap();
        master.env.txn_commit(txn).unwrap();
    }

    // Capture the whole stream and deliver it back to front.
    let stream: Vec<_> = drain(&master)
        .into_iter()
        .filter(|(_, ctl, _)| {
            matches!(rectype(ctl), MessageType::Log | MessageType::NewFile)
        })
        .collect();
    assert!(stream.len() >= 6, "expected a real stream");

    let mut requested = 0;
    for (_, ctl, rec) in stream.iter().rev() {
        client.env.rep_process_message(ctl, rec, master.eid).unwrap();
        // Out-of-order records must trigger LOG_REQ rerequests keyed at
        // the start of the gap.
        for (_, ctl, _) in drain(&client) {
            if rectype(&ctl) == MessageType::LogReq {
                requested += 1;
            }
        }
    }
    assert!(requested > 0, "no rerequest despite a gap");

    // Once the earliest record arrived the gap closed and everything
    // applied in order.
    assert_eq!(
        client.env.log_stats().cur_lsn,
        master.env.log_stats().cur_lsn
    );
    let stats = client.env.rep_stats();
    assert!(
        stats.log_queued_total > 0,
        "records never passed through the queue"
    );
    assert_eq!(stats.log_queued, 0, "queue should be empty after catch-up");
    assert!(stats.log_requested > 0);

    let cdb = client.env.db_open("items.db", DbType::Btree, None).unwrap();
    for (k, v) in [(&b"k1"[..], &b"v1"[..]), (b"k2", b"v2"), (b"k3", b"v3")] {
        assert_eq!(cdb.get(None, k).unwrap().as_deref(), Some(v));
    }
}

#[test]
fn test_duplicate_records_dropped() {
    let (master, client) = master_client_pair();
    let db = master.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = master.env.txn_begin(None).unwrap();
    db.put(Some(txn), b"once", b"1").unwrap();
    master.env.txn_commit(txn).unwrap();

    let stream = drain(&master);
    for (_, ctl, rec) in &stream {
        client.env.rep_process_message(ctl, rec, master.eid).unwrap();
    }
    // Redelivering the whole stream is harmless.
    for (_, ctl, rec) in &stream {
        client.env.rep_process_message(ctl, rec, master.eid).unwrap();
    }
    assert!(client.env.rep_stats().log_duplicated > 0);
    assert_eq!(
        client.env.log_stats().cur_lsn,
        master.env.log_stats().cur_lsn
    );
}

/// A client that followed a dead master past the divergence point
/// walks its verify LSN backward over commit records until the new
/// master agrees, truncates, and follows the new history.
#[test]
fn test_verify_rollback_to_new_master() {
    let m1 = make_site(1);
    let m2 = make_site(2);
    let client = make_site(3);
    m1.env.rep_start(RepRole::Master).unwrap();
    m2.env.rep_start(RepRole::Client).unwrap();
    client.env.rep_start(RepRole::Client).unwrap();
    shuttle(&m1, &m2);
    shuttle(&m1, &client);

    // Shared history: two committed transactions seen by everyone.
    let db = m1.env.db_open("items.db", DbType::Btree, None).unwrap();
    for (k, v) in [(&b"t1"[..], &b"a"[..]), (b"t2", b"b")] {
        let txn = m1.env.txn_begin(None).unwrap();
        db.put(Some(txn), k, v).unwrap();
        m1.env.txn_commit(txn).unwrap();
    }
    let shared = drain(&m1);
    for (_, ctl, rec) in &shared {
        m2.env.rep_process_message(ctl, rec, m1.eid).unwrap();
        client.env.rep_process_message(ctl, rec, m1.eid).unwrap();
    }
    for s in [&m2, &client] {
        for (_, ctl, rec) in drain(s) {
            m1.env.rep_process_message(&ctl, &rec, s.eid).unwrap();
        }
    }
    let _ = drain(&m1);

    // Divergence: t3 commits on m1 and reaches ONLY the client before
    // m1 dies.
    let txn = m1.env.txn_begin(None).unwrap();
    db.put(Some(txn), b"t3", b"dead-end").unwrap();
    m1.env.txn_commit(txn).unwrap();
    for (_, ctl, rec) in drain(&m1) {
        client.env.rep_process_message(&ctl, &rec, m1.eid).unwrap();
    }
    let _ = drain(&client);
    let cdb = client.env.db_open("items.db", DbType::Btree, None).unwrap();
    assert_eq!(
        cdb.get(None, b"t3").unwrap().as_deref(),
        Some(&b"dead-end"[..])
    );
    assert!(client.env.log_stats().cur_lsn > m2.env.log_stats().cur_lsn);

    // m2 takes over and the client renegotiates its log: VERIFY walks
    // back from the divergent tail to the last shared commit, the tail
    // is rolled back, and streaming resumes from m2.
    m2.env.rep_start(RepRole::Master).unwrap();
    shuttle(&m2, &client);

    assert_eq!(
        client.env.log_stats().cur_lsn,
        m2.env.log_stats().cur_lsn,
        "client did not truncate to the new master's log"
    );
    assert_eq!(cdb.get(None, b"t3").unwrap(), None, "divergent commit survived");
    assert_eq!(cdb.get(None, b"t1").unwrap().as_deref(), Some(&b"a"[..]));
    assert_eq!(cdb.get(None, b"t2").unwrap().as_deref(), Some(&b"b"[..]));

    // New history flows from the new master.
    let db2 = m2.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = m2.env.txn_begin(None).unwrap();
    db2.put(Some(txn), b"t4", b"alive").unwrap();
    m2.env.txn_commit(txn).unwrap();
    shuttle(&m2, &client);
    assert_eq!(cdb.get(None, b"t4").unwrap().as_deref(), Some(&b"alive"[..]));
}

#[test]
fn test_stale_generation_messages_dropped() {
    let (master, client) = master_client_pair();

    // A fabricated LOG from generation zero must be ignored.
    let ctl = RepControl::new(MessageType::Log, 0, Lsn::new(1, 36), 4);
    client
        .env
        .rep_process_message(&ctl.encode(), &[0u8; 4], master.eid)
        .unwrap();
    assert!(client.env.rep_stats().msgs_bad_gen > 0);
}

#[test]
fn test_newer_generation_triggers_master_req() {
    let (master, client) = master_client_pair();

    let gen = client.env.rep_snapshot().gen;
    let ctl = RepControl::new(MessageType::Log, gen + 5, Lsn::new(9, 0), 0);
    client
        .env
        .rep_process_message(&ctl.encode(), &[], master.eid)
        .unwrap();

    let sent = drain(&client);
    assert!(
        sent.iter()
            .any(|(_, ctl, _)| rectype(ctl) == MessageType::MasterReq),
        "stale client did not go looking for the master"
    );
}

#[test]
fn test_log_more_throttling() {
    // Master with history the client has to pull, under a tight send
    // budget: the stream pauses with LOG_MORE and the client keeps
    // re-requesting until it catches up.
    let master = make_site(1);
    let db = master.env.db_open("items.db", DbType::Btree, None).unwrap();
    for i in 0..20u32 {
        let txn = master.env.txn_begin(None).unwrap();
        db.put(Some(txn), format!("k{:02}", i).as_bytes(), &[7u8; 40])
            .unwrap();
        master.env.txn_commit(txn).unwrap();
    }
    master.env.rep_set_limit(0, 512);
    master.env.rep_start(RepRole::Master).unwrap();
    let _ = drain(&master);

    let client = make_site(2);
    client.env.rep_start(RepRole::Client).unwrap();
    let _ = drain(&client);
    // Hand the client the master announcement and let the request
    // cycle run.
    let ctl = RepControl::new(
        MessageType::NewMaster,
        master.env.rep_snapshot().gen,
        master.env.log_stats().cur_lsn,
        0,
    );
    client
        .env
        .rep_process_message(&ctl.encode(), &[], master.eid)
        .unwrap();
    shuttle(&master, &client);

    assert!(
        master.env.rep_stats().throttles > 0,
        "budget never throttled the stream"
    );
    assert_eq!(
        client.env.log_stats().cur_lsn,
        master.env.log_stats().cur_lsn
    );
    let cdb = client.env.db_open("items.db", DbType::Btree, None).unwrap();
    assert_eq!(cdb.get(None, b"k00").unwrap().as_deref(), Some(&[7u8; 40][..]));
    assert_eq!(cdb.get(None, b"k19").unwrap().as_deref(), Some(&[7u8; 40][..]));
}

#[test]
fn test_internal_init_when_logs_cannot_meet() {
    // A client whose whole log belongs to a dead master meets a new
    // master with disjoint history: VERIFY cannot find a common record,
    // so the client loads the master's pages wholesale and follows from
    // its end of log.
    let m1 = make_site(1);
    let client = make_site(3);
    m1.env.rep_start(RepRole::Master).unwrap();
    client.env.rep_start(RepRole::Client).unwrap();
    shuttle(&m1, &client);
    let db1 = m1.env.db_open("items.db", DbType::Btree, None).unwrap();
    for i in 0..3u32 {
        let txn = m1.env.txn_begin(None).unwrap();
        db1.put(Some(txn), format!("old{}", i).as_bytes(), b"x").unwrap();
        m1.env.txn_commit(txn).unwrap();
    }
    shuttle(&m1, &client);

    // The replacement master has its own, unrelated history.
    let m2 = make_site(4);
    let db2 = m2.env.db_open("items.db", DbType::Btree, None).unwrap();
    for i in 0..5u32 {
        let txn = m2.env.txn_begin(None).unwrap();
        db2.put(Some(txn), format!("new{}", i).as_bytes(), b"y").unwrap();
        m2.env.txn_commit(txn).unwrap();
    }
    let _ = drain(&m2);
    m2.env.rep_start(RepRole::Master).unwrap();
    m2.env.rep_start(RepRole::Master).unwrap(); // gen past the client's
    shuttle(&m2, &client);

    assert_eq!(
        client.env.log_stats().cur_lsn,
        m2.env.log_stats().cur_lsn,
        "client did not adopt the new master's log position"
    );
    let cdb = client.env.db_open("items.db", DbType::Btree, None).unwrap();
    assert_eq!(cdb.get(None, b"new0").unwrap().as_deref(), Some(&b"y"[..]));
    assert_eq!(cdb.get(None, b"new4").unwrap().as_deref(), Some(&b"y"[..]));
    assert_eq!(cdb.get(None, b"old0").unwrap(), None);

    // Live updates keep flowing after the initialization.
    let txn = m2.env.txn_begin(None).unwrap();
    db2.put(Some(txn), b"after", b"z").unwrap();
    m2.env.txn_commit(txn).unwrap();
    shuttle(&m2, &client);
    assert_eq!(cdb.get(None, b"after").unwrap().as_deref(), Some(&b"z"[..]));
}

#[test]
fn test_noautoinit_fails_join() {
    let m1 = make_site(1);
    let client = make_site(3);
    m1.env.rep_start(RepRole::Master).unwrap();
    client.env.rep_start(RepRole::Client).unwrap();
    shuttle(&m1, &client);
    let db1 = m1.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = m1.env.txn_begin(None).unwrap();
    db1.put(Some(txn), b"k", b"v").unwrap();
    m1.env.txn_commit(txn).unwrap();
    shuttle(&m1, &client);

    client.env.rep_set_config(false, true, false);

    // A fresh master with disjoint history cannot serve the client's
    // verify point; with auto-init disabled the join fails.
    let m2 = make_site(4);
    let db2 = m2.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = m2.env.txn_begin(None).unwrap();
    db2.put(Some(txn), b"other", b"w").unwrap();
    m2.env.txn_commit(txn).unwrap();
    let _ = drain(&m2);
    m2.env.rep_start(RepRole::Master).unwrap();
    m2.env.rep_start(RepRole::Master).unwrap();

    let mut join_failed = false;
    for _ in 0..100 {
        let mut moved = false;
        for (dst, ctl, rec) in drain(&m2) {
            if dst.is_none() || dst == Some(client.eid) {
                moved = true;
                match client.env.rep_process_message(&ctl, &rec, m2.eid) {
                    Err(burrow::Error::JoinFailure) => join_failed = true,
                    Ok(_) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }
        for (dst, ctl, rec) in drain(&client) {
            if dst.is_none() || dst == Some(m2.eid) {
                moved = true;
                m2.env.rep_process_message(&ctl, &rec, client.eid).unwrap();
            }
        }
        if !moved {
            break;
        }
    }
    assert!(join_failed, "client joined despite NOAUTOINIT");
}

#[test]
fn test_delayed_client_waits_for_sync() {
    let master = make_site(1);
    let client = make_site(2);
    master.env.rep_start(RepRole::Master).unwrap();
    client.env.rep_start(RepRole::Client).unwrap();
    shuttle(&master, &client);

    // Give both sides shared history, then configure the client to
    // defer catch-up.
    let db = master.env.db_open("items.db", DbType::Btree, None).unwrap();
    let txn = master.env.txn_begin(None).unwrap();
    db.put(Some(txn), b"k", b"v").unwrap();
    master.env.txn_commit(txn).unwrap();
    shuttle(&master, &client);
    client.env.rep_set_config(true, false, false);

    // A new master appears; the delayed client must not negotiate yet.
    let m2 = make_site(4);
    m2.env.rep_start(RepRole::Client).unwrap();
    shuttle(&master, &m2);
    m2.env.rep_start(RepRole::Master).unwrap();
    for (dst, ctl, rec) in drain(&m2) {
        if dst.is_none() || dst == Some(client.eid) {
            client.env.rep_process_message(&ctl, &rec, m2.eid).unwrap();
        }
    }
    assert!(
        drain(&client)
            .iter()
            .all(|(_, ctl, _)| rectype(ctl) != MessageType::VerifyReq),
        "delayed client negotiated before rep_sync"
    );

    // rep_sync releases the saved verify point.
    client.env.rep_sync().unwrap();
    assert!(
        drain(&client)
            .iter()
            .any(|(_, ctl, _)| rectype(ctl) == MessageType::VerifyReq),
        "rep_sync did not start the handshake"
    );
}
