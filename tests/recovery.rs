//! Crash-recovery tests: a broker reopened over an existing log directory
//! must come back with the same jobs, ordering, and reservations.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use beanpole::config::Config;
use beanpole::error::BrokerError;
use beanpole::scheduler::{Broker, Reservation};

fn cfg(dir: &Path) -> Config {
    Config {
        wal_dir: Some(dir.to_path_buf()),
        ..Config::default()
    }
}

fn put(broker: &Broker, pri: u32, data: &'static [u8]) -> u64 {
    broker
        .put(
            "default",
            pri,
            Duration::ZERO,
            Duration::from_secs(60),
            Bytes::from_static(data),
        )
        .unwrap()
}

async fn take(broker: &Broker, session: beanpole::session::SessionId) -> (u64, Bytes) {
    match broker.reserve(session, Some(Duration::ZERO)).await.unwrap() {
        Reservation::Job { id, data } => (id, data),
        Reservation::TimedOut => panic!("expected a ready job"),
    }
}

#[tokio::test]
async fn restart_restores_jobs_order_and_burials() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        let s = broker.open_session();
        let a = put(&broker, 10, b"first");
        let b = put(&broker, 10, b"second");
        let c = put(&broker, 5, b"urgent");

        // Bury the urgent job so only a and b are ready at reopen.
        let (got, _) = take(&broker, s).await;
        assert_eq!(got, c);
        broker.bury(s, c, 1).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    let broker = Broker::open(cfg(dir.path())).unwrap();
    let s = broker.open_session();

    // Same priority, so insertion order decides.
    let (id, data) = take(&broker, s).await;
    assert_eq!((id, &data[..]), (1, &b"first"[..]));
    let (id, data) = take(&broker, s).await;
    assert_eq!((id, &data[..]), (2, &b"second"[..]));

    let (id, data) = broker.peek_buried("default").unwrap().unwrap();
    assert_eq!((id, &data[..]), (3, &b"urgent"[..]));
    assert_eq!(broker.job_info(3).unwrap().state, "buried");

    // Ids are never reused across restarts.
    assert_eq!(put(&broker, 0, b"next"), 4);
}

#[tokio::test]
async fn reservation_expired_while_down_is_ready_at_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        let s = broker.open_session();
        broker
            .put(
                "default",
                0,
                Duration::ZERO,
                Duration::from_millis(200),
                Bytes::from_static(b"x"),
            )
            .unwrap();
        take(&broker, s).await;
    }

    // The TTR elapses while no process is running.
    std::thread::sleep(Duration::from_millis(300));

    let broker = Broker::open(cfg(dir.path())).unwrap();
    let info = broker.job_info(1).unwrap();
    assert_eq!(info.state, "ready");
    assert_eq!(info.timeouts, 1);

    let s = broker.open_session();
    assert_eq!(take(&broker, s).await.0, 1);
}

#[tokio::test]
async fn live_reservation_survives_reopen_until_its_deadline() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        let s = broker.open_session();
        put(&broker, 0, b"held");
        take(&broker, s).await;
    }

    let broker = Broker::open(cfg(dir.path())).unwrap();
    assert_eq!(broker.job_info(1).unwrap().state, "reserved");
    assert_eq!(broker.peek_ready("default").unwrap(), None);

    // The reservation still belongs to the dead session, so nobody else
    // may delete the job before the deadline.
    assert!(matches!(
        broker.delete(None, 1),
        Err(BrokerError::NotOwner)
    ));
}

#[tokio::test]
async fn recovered_reservation_is_safe_from_new_sessions() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        let s = broker.open_session();
        put(&broker, 0, b"held");
        take(&broker, s).await;
    }

    // Session ids must not restart below the dead reserver's id, or the
    // first connection of the new process could mutate its reservation.
    let broker = Broker::open(cfg(dir.path())).unwrap();
    let s = broker.open_session();
    assert!(matches!(broker.touch(s, 1), Err(BrokerError::NotOwner)));
    assert!(matches!(
        broker.release(s, 1, 0, Duration::ZERO),
        Err(BrokerError::NotOwner)
    ));
    assert!(matches!(broker.bury(s, 1, 0), Err(BrokerError::NotOwner)));
    assert!(matches!(
        broker.delete(Some(s), 1),
        Err(BrokerError::NotOwner)
    ));
    assert_eq!(broker.job_info(1).unwrap().state, "reserved");

    // The same holds when the reservation rides in on a checkpoint.
    broker.checkpoint().unwrap();
    drop(broker);
    let broker = Broker::open(cfg(dir.path())).unwrap();
    let s = broker.open_session();
    assert!(matches!(broker.touch(s, 1), Err(BrokerError::NotOwner)));
    assert_eq!(broker.job_info(1).unwrap().state, "reserved");
}

#[tokio::test]
async fn delayed_job_is_rescheduled_or_promoted_at_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        broker
            .put(
                "default",
                0,
                Duration::from_millis(150),
                Duration::from_secs(60),
                Bytes::from_static(b"later"),
            )
            .unwrap();
        assert_eq!(broker.job_info(1).unwrap().state, "delayed");
    }

    std::thread::sleep(Duration::from_millis(250));

    // The delay ran out while the process was down.
    let broker = Broker::open(cfg(dir.path())).unwrap();
    assert_eq!(broker.job_info(1).unwrap().state, "ready");
}

#[tokio::test]
async fn checkpointed_state_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_small = Config {
        wal_dir: Some(dir.path().to_path_buf()),
        checkpoint_every: 2,
        ..Config::default()
    };

    {
        let broker = Broker::open(cfg_small.clone()).unwrap();
        put(&broker, 10, b"keep-1");
        put(&broker, 20, b"drop");
        put(&broker, 30, b"keep-2");
        broker.delete(None, 2).unwrap();
        broker.checkpoint().unwrap();
        // Records appended after the checkpoint replay on top of it.
        put(&broker, 5, b"keep-3");
    }

    let broker = Broker::open(cfg_small).unwrap();
    let s = broker.open_session();
    assert_eq!(take(&broker, s).await.0, 4);
    assert_eq!(take(&broker, s).await.0, 1);
    assert_eq!(take(&broker, s).await.0, 3);
    assert!(matches!(
        broker.job_info(2),
        Err(BrokerError::NotFound)
    ));
}

#[tokio::test]
async fn corrupt_log_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        put(&broker, 0, b"one");
        put(&broker, 0, b"two");
    }

    let log = dir.path().join("wal.log");
    let lines: Vec<String> = fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    fs::write(&log, format!("garbage\n{}\n", lines[1])).unwrap();

    assert!(matches!(
        Broker::open(cfg(dir.path())),
        Err(BrokerError::Recovery(_))
    ));
}

#[tokio::test]
async fn torn_final_record_is_discarded() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::open(cfg(dir.path())).unwrap();
        put(&broker, 0, b"one");
        put(&broker, 0, b"two");
    }

    let log = dir.path().join("wal.log");
    let mut f = fs::OpenOptions::new().append(true).open(&log).unwrap();
    f.write_all(b"{\"seq\":3,\"at_ms\":12").unwrap();
    drop(f);

    // The torn append was never acknowledged, so losing it is correct.
    let broker = Broker::open(cfg(dir.path())).unwrap();
    assert!(broker.job_info(1).is_ok());
    assert!(broker.job_info(2).is_ok());
    assert!(matches!(broker.job_info(3), Err(BrokerError::NotFound)));
}
