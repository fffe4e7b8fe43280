// tests/integration/lifecycle_test.rs

//! Integration tests for the connection manager lifecycle
//! Tests: posted add/remove, reentrant self-close, stop ordering, groups

use super::test_helpers::{
    LogCapture, ManagerFixture, ProbeConnection, ProbeLog, RecordingMultiplexer, id, init_tracing,
    query, wait_until,
};
use connkeeper::config::{HeartbeatConfig, TableConfig};
use connkeeper::connection::{CloseReason, ConnectionManager, ManagerGroup};
use connkeeper::core::NetError;
use connkeeper::core::multiplexer::EventKind;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ===== Posted operations =====

#[test]
fn test_added_connection_becomes_visible() {
    let fx = ManagerFixture::started();
    let conn = id(5, 100, 0);
    fx.handle.add_connection(fx.probe(conn));

    let found = query(&fx.handle, move |table| table.lookup(&conn).map(|c| c.label));
    assert_eq!(found, Some(""));
    assert!(fx.mux.is_registered(5));
}

#[test]
fn test_posted_tasks_run_in_submission_order() {
    let fx = ManagerFixture::started();
    let first = id(5, 100, 0);
    let second = id(5, 100, 500);

    fx.handle
        .add_connection(ProbeConnection::labelled(first, &fx.log, "first"));
    fx.handle
        .add_connection(ProbeConnection::labelled(second, &fx.log, "second"));

    let (old, new) = query(&fx.handle, move |table| {
        (
            table.lookup(&first).is_some(),
            table.lookup(&second).map(|c| c.label),
        )
    });
    assert!(!old);
    assert_eq!(new, Some("second"));
    assert_eq!(fx.log.drops_of(first), 1);
}

#[test]
fn test_posted_double_removal_destroys_once() {
    let fx = ManagerFixture::started();
    let conn = id(3, 10, 0);
    fx.handle.add_connection(fx.probe(conn));
    fx.handle.remove_connection(conn);
    fx.handle.remove_connection(conn);

    let len = query(&fx.handle, |table| table.len());
    assert_eq!(len, 0);
    assert_eq!(fx.log.drops_of(conn), 1);
}

#[test]
fn test_inspect_sees_only_live_identity() {
    let fx = ManagerFixture::started();
    let conn = id(11, 4, 0);
    fx.handle
        .add_connection(ProbeConnection::labelled(conn, &fx.log, "inspected"));

    let (tx, rx) = mpsc::channel();
    let tx_stale = tx.clone();
    fx.handle
        .inspect(conn, move |found| tx.send(found.map(|c| c.label)).unwrap());
    fx.handle.inspect(id(11, 3, 0), move |found| {
        tx_stale.send(found.map(|c| c.label)).unwrap()
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some("inspected"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), None);
}

// ===== Readiness and reentrancy =====

#[test]
fn test_readiness_is_dispatched_on_the_worker() {
    let fx = ManagerFixture::started();
    let conn = id(8, 1, 0);
    fx.handle.add_connection(fx.probe(conn));
    query(&fx.handle, |_| ());

    assert_eq!(fx.mux.fire(8, EventKind::Read), 1);
    assert!(wait_until(WAIT, || fx.log.events().len() == 1));
    assert_eq!(fx.log.events(), vec![(conn, EventKind::Read)]);
}

#[test]
fn test_error_interest_fires_once() {
    let fx = ManagerFixture::started();
    let conn = id(8, 1, 0);
    fx.handle.add_connection(fx.probe(conn));
    query(&fx.handle, |_| ());

    assert_eq!(fx.mux.fire(8, EventKind::Error), 1);
    assert_eq!(fx.mux.fire(8, EventKind::Error), 0);
    assert_eq!(fx.mux.fire(8, EventKind::Read), 1);
    assert!(wait_until(WAIT, || fx.log.events().len() == 2));
    assert_eq!(
        fx.log.events(),
        vec![(conn, EventKind::Error), (conn, EventKind::Read)]
    );
}

#[test]
fn test_connection_can_close_itself_from_its_handler() {
    let fx = ManagerFixture::started();
    let conn = id(12, 1, 0);
    fx.handle.add_connection(ProbeConnection::self_closing(
        conn,
        &fx.log,
        fx.handle.clone(),
    ));
    query(&fx.handle, |_| ());

    fx.mux.fire(12, EventKind::Read);
    assert!(wait_until(WAIT, || fx.log.drops_of(conn) == 1));
    // The handler finished before the object went away.
    assert_eq!(fx.log.events(), vec![(conn, EventKind::Read)]);
    assert!(!fx.mux.is_registered(12));
    assert!(query(&fx.handle, move |table| table.lookup(&conn).is_none()));
}

#[test]
fn test_event_for_recycled_descriptor_is_dropped() {
    let fx = ManagerFixture::started();
    let old = id(14, 1, 0);
    let new = id(14, 2, 0);
    fx.handle.add_connection(fx.probe(old));
    query(&fx.handle, |_| ());

    // A handler bound to the old identity, as a late poller wakeup would hold.
    let stale_handler = fx
        .mux
        .handler(14, EventKind::Read)
        .expect("read interest should be registered");
    fx.handle.remove_connection(old);
    fx.handle.add_connection(fx.probe(new));
    query(&fx.handle, |_| ());

    stale_handler(EventKind::Read);
    query(&fx.handle, |_| ());
    assert!(fx.log.events().is_empty());

    fx.mux.fire(14, EventKind::Read);
    assert!(wait_until(WAIT, || fx.log.events().len() == 1));
    assert_eq!(fx.log.events(), vec![(new, EventKind::Read)]);
}

// ===== Start and stop =====

#[test]
fn test_start_rejects_zero_workers() {
    let mut fx = ManagerFixture::unstarted();
    assert_eq!(fx.manager.start(0), Err(NetError::InvalidWorkerCount(0)));
    assert!(!fx.manager.is_running());
}

#[test]
fn test_start_twice_fails() {
    let mut fx = ManagerFixture::started();
    assert_eq!(
        fx.manager.start(1),
        Err(NetError::AlreadyStarted("probe".to_string()))
    );
}

#[test]
fn test_stop_tears_down_every_connection_once() {
    let mut fx = ManagerFixture::started();
    let ids: Vec<_> = (20..30).map(|fd| id(fd, 3, 0)).collect();
    for conn in &ids {
        fx.handle.add_connection(fx.probe(*conn));
    }

    fx.manager.stop().unwrap();

    assert_eq!(fx.log.drops(), ids.len());
    for conn in &ids {
        assert_eq!(fx.log.drops_of(*conn), 1);
    }
    assert!(!fx.manager.is_running());
    // Idempotent.
    assert_eq!(fx.manager.stop(), Ok(()));
    assert_eq!(fx.log.drops(), ids.len());
}

#[test]
fn test_stop_runs_previously_posted_tasks_first() {
    let mut fx = ManagerFixture::started();
    let conn = id(4, 1, 0);
    let (tx, rx) = mpsc::channel();

    fx.handle.add_connection(fx.probe(conn));
    fx.handle.with_table(move |table| {
        tx.send(table.len()).unwrap();
    });
    fx.manager.stop().unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    assert_eq!(fx.log.drops_of(conn), 1);
}

#[test]
fn test_add_after_stop_began_is_rejected() {
    let fx = ManagerFixture::started();
    let ManagerFixture {
        mut manager,
        handle,
        mux,
        log,
    } = fx;

    // Hold the worker so the add is queued before the stop marker but runs
    // after the stop flag is raised.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    handle.with_table(move |_| {
        let _ = gate_rx.recv();
    });
    handle.add_connection(ProbeConnection::new(id(9, 1, 0), &log));

    let stopper = thread::spawn(move || manager.stop());
    assert!(wait_until(WAIT, || handle.is_stop_requested()));
    gate_tx.send(()).unwrap();

    assert_eq!(stopper.join().unwrap(), Ok(()));
    assert_eq!(log.drops(), 1);
    assert!(!mux.is_registered(9));
    assert!(
        mux.registrations().iter().all(|(fd, _, _)| *fd != 9),
        "a rejected connection must never be registered"
    );
}

#[test]
fn test_add_after_worker_exit_drops_connection() {
    let mut fx = ManagerFixture::started();
    fx.manager.stop().unwrap();

    fx.handle.add_connection(fx.probe(id(2, 1, 0)));
    assert_eq!(fx.log.drops(), 1);
    assert!(fx.mux.registrations().is_empty());
}

#[test]
fn test_start_after_stop_fails() {
    let mut fx = ManagerFixture::started();
    fx.manager.stop().unwrap();
    assert_eq!(
        fx.manager.start(1),
        Err(NetError::ServiceStopped("probe".to_string()))
    );
}

#[test]
fn test_enable_heartbeat_twice_fails() {
    let mut fx = ManagerFixture::started();
    let config = HeartbeatConfig::with_timeout(Duration::from_secs(30));
    fx.manager.enable_heartbeat(&config).unwrap();
    assert!(fx.manager.heartbeat_enabled());
    assert_eq!(
        fx.manager.enable_heartbeat(&config),
        Err(NetError::HeartbeatAlreadyEnabled)
    );
}

#[test]
fn test_stop_with_heartbeat_closes_with_shutdown_reason() {
    let capture = LogCapture::start();
    let mut fx = ManagerFixture::unstarted();
    fx.manager
        .enable_heartbeat(&HeartbeatConfig::with_timeout(Duration::from_secs(30)))
        .unwrap();
    fx.manager.start(1).unwrap();
    let ids: Vec<_> = (40..45).map(|fd| id(fd, 1, 0)).collect();
    for conn in &ids {
        fx.handle.add_connection(fx.probe(*conn));
    }
    query(&fx.handle, |_| ());

    fx.manager.stop().unwrap();
    for conn in &ids {
        assert_eq!(fx.log.drops_of(*conn), 1);
    }

    let logs = capture.contents();
    // Logged by the worker, so the capture sees the service threads.
    assert!(logs.contains("Closed 5 connection(s) on shutdown."), "{logs}");
    assert!(logs.contains("Heartbeat tracker shutting down"), "{logs}");
    assert!(!logs.contains("not found"), "{logs}");
    assert!(!logs.contains("set is full"), "{logs}");
}

#[test]
fn test_heartbeat_misses_are_logged_from_the_tracker() {
    let capture = LogCapture::start();
    let mut fx = ManagerFixture::unstarted();
    fx.manager
        .enable_heartbeat(&HeartbeatConfig::with_timeout(Duration::from_secs(30)))
        .unwrap();
    fx.manager.start(1).unwrap();

    fx.handle.heartbeat_forget(id(70, 1, 0));
    assert!(wait_until(WAIT, || capture
        .contents()
        .contains("not found on removal")));
    fx.manager.stop().unwrap();
}

#[test]
fn test_execute_runs_on_helpers() {
    let mut fx = ManagerFixture::unstarted();
    fx.manager.start(3).unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let tx = tx.clone();
        fx.handle.execute(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
    }
    for _ in 0..8 {
        let name = rx.recv_timeout(WAIT).unwrap().unwrap_or_default();
        assert!(name == "probe-1" || name == "probe-2", "ran on {name}");
    }
}

// ===== Groups =====

#[test]
fn test_group_spreads_connections_round_robin() {
    init_tracing();
    let mux = RecordingMultiplexer::new();
    let log = ProbeLog::new();
    let mut group: ManagerGroup<ProbeConnection> =
        ManagerGroup::new("grp", 2, TableConfig::default(), mux.clone()).unwrap();
    group.start(1).unwrap();
    assert_eq!(group.len(), 2);

    for fd in 0..4 {
        group
            .next_handle()
            .add_connection(ProbeConnection::new(id(fd, 1, 0), &log));
    }
    for index in 0..2 {
        let handle = group.handle(index).unwrap();
        let ids = query(&handle, |table| table.ids());
        assert_eq!(ids.len(), 2);
    }

    group.stop().unwrap();
    assert_eq!(log.drops(), 4);
}

#[test]
fn test_group_requires_a_manager() {
    let mux = RecordingMultiplexer::new();
    let group = ManagerGroup::<ProbeConnection>::new("grp", 0, TableConfig::default(), mux);
    assert!(matches!(group, Err(NetError::InvalidConfig(_))));
}

#[test]
fn test_manager_drop_stops_workers() {
    init_tracing();
    let mux = RecordingMultiplexer::new();
    let log = ProbeLog::new();
    let conn = id(30, 1, 0);
    {
        let mut manager: ConnectionManager<ProbeConnection> =
            ConnectionManager::new("dropped", TableConfig::default(), mux.clone());
        manager.start(1).unwrap();
        let handle = manager.handle();
        handle.add_connection(ProbeConnection::new(conn, &log));
        query(&handle, |_| ());
    }
    assert_eq!(log.drops_of(conn), 1);
}

#[test]
fn test_close_reason_strings() {
    assert_eq!(CloseReason::Timeout.as_str(), "timeout");
    assert_eq!(CloseReason::PeerClosed.to_string(), "peer_closed");
    assert!(!CloseReason::Timeout.forgets_heartbeat());
    assert!(!CloseReason::Shutdown.forgets_heartbeat());
    assert!(CloseReason::Normal.forgets_heartbeat());
}
