//! Election scenarios over an in-process message bus.
//!
//! Each site is a full environment in its own temp directory; the bus
//! queues every outgoing message and the test pumps them between sites,
//! answering HoldElection outcomes by joining the election.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow::env::{Env, EnvConfig};
use burrow::log::PutFlag;
use burrow::rep::message::RepControl;
use burrow::rep::{read_egen, Eid, RepOutcome, RepRole, Transport};

struct Bus {
    queue: Mutex<VecDeque<(Eid, Option<Eid>, Vec<u8>, Vec<u8>)>>,
}

impl Bus {
    fn new() -> Arc<Self> {
        Arc::new(Bus {
            queue: Mutex::new(VecDeque::new()),
        })
    }
}

struct BusPort {
    from: Eid,
    bus: Arc<Bus>,
}

impl Transport for BusPort {
    fn send(
        &self,
        control: &RepControl,
        rec: &[u8],
        eid: Option<Eid>,
        _flags: u32,
    ) -> Result<(), ()> {
        self.bus.queue.lock().unwrap().push_back((
            self.from,
            eid,
            control.encode().to_vec(),
            rec.to_vec(),
        ));
        Ok(())
    }
}

struct Site {
    eid: Eid,
    env: Env,
    priority: u32,
    _dir: tempfile::TempDir,
}

fn make_site(bus: &Arc<Bus>, eid: Eid, priority: u32) -> Site {
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
    env.rep_set_transport(
        eid,
        Arc::new(BusPort {
            from: eid,
            bus: Arc::clone(bus),
        }),
    );
    env.rep_start(RepRole::Client).unwrap();
    Site {
        eid,
        env,
        priority,
        _dir: dir,
    }
}

/// Deliver queued messages until the bus drains, joining elections on
/// HoldElection. Returns the number of messages delivered.
fn pump(bus: &Arc<Bus>, sites: &[Site], nsites: u32, nvotes: u32) -> usize {
    let mut delivered = 0;
    for _ in 0..10_000 {
        let msg = bus.queue.lock().unwrap().pop_front();
        let Some((from, to, ctl, rec)) = msg else {
            return delivered;
        };
        for site in sites {
            if site.eid == from {
                continue;
            }
            if let Some(to) = to {
                if to != site.eid {
                    continue;
                }
            }
            delivered += 1;
            match site.env.rep_process_message(&ctl, &rec, from) {
                Ok(RepOutcome::HoldElection) => {
                    site.env
                        .rep_elect_begin(nsites, nvotes, site.priority)
                        .unwrap();
                }
                Ok(_) => {}
                Err(e) => panic!("site {} failed processing: {}", site.eid, e),
            }
        }
    }
    panic!("bus failed to drain");
}

#[test]
fn test_five_site_election_picks_most_log() {
    let bus = Bus::new();
    // A has the highest LSN and priority 10; B and C priority 5; D and
    // E priority 0 and so can never win.
    let sites = vec![
        make_site(&bus, 1, 10),
        make_site(&bus, 2, 5),
        make_site(&bus, 3, 5),
        make_site(&bus, 4, 0),
        make_site(&bus, 5, 0),
    ];
    // Startup chatter (NEWCLIENT broadcasts) is irrelevant here.
    bus.queue.lock().unwrap().clear();

    // Give site A more log than anyone else.
    for _ in 0..5 {
        sites[0]
            .env
            .log_put(&[0u8; 64], PutFlag::Flush)
            .unwrap();
    }

    let gen_before = sites[0].env.rep_snapshot().gen;

    // B calls the election; everyone else joins when its VOTE1 lands.
    sites[1].env.rep_elect_begin(5, 3, 5).unwrap();
    pump(&bus, &sites, 5, 3);

    // A won: it is master at gen + 1 and every site agrees.
    let a = sites[0].env.rep_snapshot();
    assert_eq!(a.role, RepRole::Master);
    assert_eq!(a.master_id, 1);
    assert_eq!(a.gen, gen_before + 1);
    for site in &sites[1..] {
        let snap = site.env.rep_snapshot();
        assert_eq!(snap.master_id, 1, "site {} disagrees on master", site.eid);
        assert_eq!(snap.role, RepRole::Client);
        assert_eq!(snap.gen, a.gen);
    }

    // Everyone who voted persisted an egen at least one past the one
    // they voted with.
    for site in &sites {
        let stored = read_egen(site.env.home()).unwrap().unwrap_or(0);
        assert!(stored >= 2, "site {} egen file = {}", site.eid, stored);
    }
}

#[test]
fn test_quorum_of_three_elects() {
    let bus = Bus::new();
    let sites = vec![
        make_site(&bus, 1, 10),
        make_site(&bus, 2, 5),
        make_site(&bus, 3, 5),
        // Sites 4 and 5 exist in the group but never answer.
    ];
    bus.queue.lock().unwrap().clear();

    // Three of five call the election concurrently; the phase-1 timer
    // fires with exactly quorum and the winner still emerges.
    let handles: Vec<_> = sites
        .iter()
        .map(|s| {
            let env = s.env.clone();
            let priority = s.priority;
            std::thread::spawn(move || env.rep_elect(5, 3, priority, Duration::from_secs(3)))
        })
        .collect();

    // Pump the bus while the elections run.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        pump(&bus, &sites, 5, 3);
        let done = sites
            .iter()
            .any(|s| s.env.rep_snapshot().role == RepRole::Master);
        if done || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    // Drain any trailing NEWMASTER traffic.
    pump(&bus, &sites, 5, 3);

    let mut winners = Vec::new();
    for h in handles {
        if let Ok(eid) = h.join().unwrap() {
            winners.push(eid);
        }
    }
    assert!(!winners.is_empty(), "no election call saw a winner");
    assert!(winners.iter().all(|&w| w == 1), "winners: {:?}", winners);
    assert_eq!(sites[0].env.rep_snapshot().role, RepRole::Master);
}

#[test]
fn test_below_quorum_fails_unavail() {
    let bus = Bus::new();
    let sites = vec![make_site(&bus, 1, 10), make_site(&bus, 2, 5)];
    bus.queue.lock().unwrap().clear();

    // Two voters cannot reach a quorum of three.
    let handles: Vec<_> = sites
        .iter()
        .map(|s| {
            let env = s.env.clone();
            let priority = s.priority;
            std::thread::spawn(move || {
                env.rep_elect(5, 3, priority, Duration::from_millis(600))
            })
        })
        .collect();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        pump(&bus, &sites, 5, 3);
        std::thread::sleep(Duration::from_millis(20));
    }

    for h in handles {
        match h.join().unwrap() {
            Err(burrow::Error::Unavail) => {}
            other => panic!("expected Unavail, got {:?}", other.map(|_| ())),
        }
    }
    for site in &sites {
        assert_ne!(site.env.rep_snapshot().role, RepRole::Master);
    }
}

#[test]
fn test_priority_zero_never_wins() {
    let bus = Bus::new();
    let sites = vec![
        make_site(&bus, 1, 0),
        make_site(&bus, 2, 0),
        make_site(&bus, 3, 5),
    ];
    bus.queue.lock().unwrap().clear();

    // Site 1 has the most log but zero priority.
    for _ in 0..5 {
        sites[0]
            .env
            .log_put(&[0u8; 64], PutFlag::Flush)
            .unwrap();
    }

    sites[0].env.rep_elect_begin(3, 2, 0).unwrap();
    pump(&bus, &sites, 3, 2);

    let snap = sites[2].env.rep_snapshot();
    assert_eq!(snap.role, RepRole::Master);
    assert_eq!(snap.master_id, 3);
}
