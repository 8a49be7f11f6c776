//! Write-ahead ordering.
//!
//! An observer on the buffer cache records every physical page write
//! together with the durable log horizon at that instant. Under the WAL
//! rule no page may ever reach disk with an LSN the log has not yet
//! made durable.

use std::sync::{Arc, Mutex};

use burrow::db::DbType;
use burrow::env::{Env, EnvConfig};
use burrow::log::Lsn;

#[test]
fn test_no_page_written_before_its_log() {
    let dir = tempfile::tempdir().unwrap();
    // A tiny cache forces write-back mid-transaction.
    let config = EnvConfig {
        page_size: 512,
        cache_pages: 4,
        ..EnvConfig::default()
    };
    let env = Env::open(dir.path(), config).unwrap();

    let violations: Arc<Mutex<Vec<(u32, Lsn, Lsn)>>> = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(0usize));
    {
        let obs_env = env.clone();
        let violations = Arc::clone(&violations);
        let writes = Arc::clone(&writes);
        env.set_page_write_observer(Some(Box::new(move |pgno, page_lsn| {
            *writes.lock().unwrap() += 1;
            let synced = obs_env.log_stats().synced_lsn;
            if !page_lsn.is_zero() && page_lsn >= synced {
                // synced_lsn is the first byte not known durable, so a
                // page LSN at or past it names an unflushed record.
                violations.lock().unwrap().push((pgno, page_lsn, synced));
            }
        })));
    }

    let db = env.db_open("wal.db", DbType::Btree, None).unwrap();
    let txn = env.txn_begin(None).unwrap();
    for i in 0..100u32 {
        db.put(Some(txn), format!("key{:04}", i).as_bytes(), &[0u8; 64])
            .unwrap();
    }
    env.txn_commit(txn).unwrap();
    env.sync().unwrap();
    env.checkpoint().unwrap();

    assert!(*writes.lock().unwrap() > 0, "no page writes observed");
    let v = violations.lock().unwrap();
    assert!(
        v.is_empty(),
        "pages written ahead of their log records: {:?}",
        *v
    );
    env.close().unwrap();
}

#[test]
fn test_commit_record_durable_before_return() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::open(dir.path(), EnvConfig::default()).unwrap();
    let db = env.db_open("wal.db", DbType::Btree, None).unwrap();

    let txn = env.txn_begin(None).unwrap();
    db.put(Some(txn), b"k", b"v").unwrap();
    env.txn_commit(txn).unwrap();

    // Everything the transaction logged, commit record included, is
    // below the durable horizon.
    let stats = env.log_stats();
    assert_eq!(stats.synced_lsn, stats.cur_lsn);
    env.close().unwrap();
}

#[test]
fn test_flush_prefix_closure_across_log() {
    let dir = tempfile::tempdir().unwrap();
    // Small log files so the workload rolls over several times.
    let config = EnvConfig {
        page_size: 512,
        log_max_file_size: 2048,
        ..EnvConfig::default()
    };
    let env = Env::open(dir.path(), config).unwrap();
    let db = env.db_open("wal.db", DbType::Btree, None).unwrap();

    for i in 0..30u32 {
        let txn = env.txn_begin(None).unwrap();
        db.put(Some(txn), format!("k{:03}", i).as_bytes(), &[1u8; 100])
            .unwrap();
        env.txn_commit(txn).unwrap();
    }
    let stats = env.log_stats();
    assert!(stats.cur_lsn.file > 1, "expected the log to roll over");
    assert_eq!(stats.synced_lsn, stats.cur_lsn);
    env.close().unwrap();
}

#[test]
fn test_stats_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let env = Env::open(dir.path(), EnvConfig::default()).unwrap();
    let db = env.db_open("wal.db", DbType::Btree, None).unwrap();
    let txn = env.txn_begin(None).unwrap();
    db.put(Some(txn), b"k", b"v").unwrap();
    env.txn_commit(txn).unwrap();

    // Stats snapshots are host-renderable.
    let log = serde_json::to_value(env.log_stats()).unwrap();
    assert!(log["records"].as_u64().unwrap() > 0);
    assert!(log["cur_lsn"]["file"].as_u64().unwrap() >= 1);

    let txns = serde_json::to_value(env.txn_stats()).unwrap();
    assert_eq!(txns["commits"].as_u64().unwrap(), 1);

    let rep = serde_json::to_value(env.rep_stats()).unwrap();
    assert_eq!(rep["msgs_processed"].as_u64().unwrap(), 0);

    let stat = db.stat().unwrap();
    let stat = serde_json::to_value(stat).unwrap();
    assert_eq!(stat["entries"].as_u64().unwrap(), 1);
    env.close().unwrap();
}
