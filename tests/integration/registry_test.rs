// tests/integration/registry_test.rs

//! Integration tests for the connection table
//! Tests: insert, remove, lookup, dispatch, growth, conflicts, close_all

use super::test_helpers::{LogCapture, ProbeConnection, TableFixture, capture_logs, id, wait_until};
use connkeeper::config::HeartbeatConfig;
use connkeeper::connection::{CloseReason, Connection, Insertion};
use connkeeper::core::TableError;
use connkeeper::core::multiplexer::EventKind;
use std::time::Duration;

// ===== Identity disambiguation =====

#[test]
fn test_conflicting_descriptor_evicts_stale_occupant() {
    let mut fx = TableFixture::new();
    let first = id(5, 100, 0);
    let second = id(5, 100, 500);

    let (outcomes, logs) = capture_logs(|| {
        let a = fx.table.insert(ProbeConnection::labelled(first, &fx.log, "first"));
        let b = fx.table.insert(ProbeConnection::labelled(second, &fx.log, "second"));
        (a, b)
    });

    assert_eq!(outcomes.0, Ok(Insertion::Inserted));
    assert_eq!(outcomes.1, Ok(Insertion::Replaced(first)));
    assert_eq!(logs.matches("Descriptor conflict").count(), 1);
    assert!(logs.contains("WARN"));

    assert!(fx.table.lookup(&first).is_none());
    let occupant = fx.table.lookup(&second).expect("second connection should be live");
    assert_eq!(occupant.label, "second");
    assert_eq!(fx.table.len(), 1);
    assert_eq!(fx.log.drops_of(first), 1);
    assert_eq!(fx.log.drops_of(second), 0);
}

#[test]
fn test_lookup_with_old_generation_never_returns_new_occupant() {
    let mut fx = TableFixture::new();
    let old = id(12, 50, 0);
    let new = id(12, 51, 0);

    fx.table.insert(ProbeConnection::new(old, &fx.log)).unwrap();
    fx.table.remove(&old, CloseReason::Normal).unwrap();
    fx.table.insert(ProbeConnection::new(new, &fx.log)).unwrap();

    assert!(fx.table.lookup(&old).is_none());
    assert!(fx.table.lookup_mut(&old).is_none());
    assert_eq!(fx.table.lookup(&new).map(|c| c.label), Some(""));
}

#[test]
fn test_lookup_misses() {
    let mut fx = TableFixture::with_capacity(8, 64);

    // Out of range, negative, empty slot.
    assert!(fx.table.lookup(&id(40, 1, 0)).is_none());
    assert!(fx.table.lookup(&id(-1, 1, 0)).is_none());
    assert!(fx.table.lookup(&id(3, 1, 0)).is_none());

    fx.table.insert(ProbeConnection::new(id(3, 1, 0), &fx.log)).unwrap();
    assert!(fx.table.lookup(&id(3, 1, 1)).is_none());
    assert!(fx.table.lookup(&id(3, 1, 0)).is_some());
}

// ===== Removal =====

#[test]
fn test_double_removal_destroys_once() {
    let mut fx = TableFixture::new();
    let conn = id(3, 10, 0);
    fx.table.insert(ProbeConnection::new(conn, &fx.log)).unwrap();

    assert_eq!(fx.table.remove(&conn, CloseReason::Normal), Ok(()));
    assert_eq!(
        fx.table.remove(&conn, CloseReason::Normal),
        Err(TableError::StaleReference(3))
    );

    assert_eq!(fx.log.drops_of(conn), 1);
    assert!(fx.table.lookup(&conn).is_none());
    assert!(fx.table.is_empty());
}

#[test]
fn test_remove_with_recycled_identity_is_noop() {
    let mut fx = TableFixture::new();
    let live = id(4, 20, 0);
    fx.table.insert(ProbeConnection::new(live, &fx.log)).unwrap();

    let stale = id(4, 19, 999_999);
    assert_eq!(
        fx.table.remove(&stale, CloseReason::Error),
        Err(TableError::StaleReference(4))
    );
    assert!(fx.table.lookup(&live).is_some());
    assert_eq!(fx.log.drops(), 0);
}

#[test]
fn test_remove_out_of_range_is_stale() {
    let mut fx = TableFixture::with_capacity(4, 16);
    assert_eq!(
        fx.table.remove(&id(100, 1, 0), CloseReason::Normal),
        Err(TableError::StaleReference(100))
    );
    assert_eq!(fx.table.capacity(), 4);
}

#[test]
fn test_removal_deregisters_before_connection_drops() {
    let mut fx = TableFixture::new();
    let conn = id(6, 1, 0);
    fx.table.insert(ProbeConnection::new(conn, &fx.log)).unwrap();
    assert!(fx.mux.is_registered(6));

    fx.table.remove(&conn, CloseReason::PeerClosed).unwrap();
    assert!(!fx.mux.is_registered(6));
    assert_eq!(fx.mux.deregistrations(), vec![6]);
    assert_eq!(fx.log.drops(), 1);
}

// ===== Registration and dispatch =====

#[test]
fn test_insert_registers_persistent_read_and_oneshot_error() {
    let mut fx = TableFixture::new();
    fx.table.insert(ProbeConnection::new(id(7, 1, 0), &fx.log)).unwrap();

    let registrations = fx.mux.registrations();
    assert!(registrations.contains(&(7, EventKind::Read, true)));
    assert!(registrations.contains(&(7, EventKind::Error, false)));
}

#[test]
fn test_dispatch_reaches_only_matching_generation() {
    let mut fx = TableFixture::new();
    let live = id(9, 2, 0);
    fx.table.insert(ProbeConnection::new(live, &fx.log)).unwrap();

    assert!(fx.table.dispatch(&live, EventKind::Read));
    assert!(!fx.table.dispatch(&id(9, 1, 0), EventKind::Read));
    assert!(!fx.table.dispatch(&id(10, 2, 0), EventKind::Error));

    assert_eq!(fx.log.events(), vec![(live, EventKind::Read)]);
    // Only the live dispatch turns the descriptor back on.
    assert_eq!(fx.mux.rearms(), vec![9]);
}

// ===== Growth =====

#[test]
fn test_growth_preserves_existing_slots() {
    let n = 16;
    let mut fx = TableFixture::with_capacity(n, 1024);
    let early: Vec<_> = (0..4).map(|fd| id(fd, 1, fd as u32)).collect();
    for conn in &early {
        fx.table.insert(ProbeConnection::new(*conn, &fx.log)).unwrap();
    }

    let far = id(n as i32 + 50, 2, 0);
    assert_eq!(fx.table.insert(ProbeConnection::new(far, &fx.log)), Ok(Insertion::Inserted));

    assert!(fx.table.capacity() >= n + 51);
    for conn in &early {
        assert_eq!(fx.table.lookup(conn).map(|c| c.id()), Some(*conn));
    }
    assert!(fx.table.lookup(&far).is_some());
    assert_eq!(fx.table.len(), 5);
    assert_eq!(fx.table.ids(), {
        let mut all = early.clone();
        all.push(far);
        all
    });
}

#[test]
fn test_growth_doubles_and_respects_bound() {
    let mut fx = TableFixture::with_capacity(10, 25);

    fx.table.insert(ProbeConnection::new(id(10, 1, 0), &fx.log)).unwrap();
    assert_eq!(fx.table.capacity(), 20);

    fx.table.insert(ProbeConnection::new(id(21, 1, 0), &fx.log)).unwrap();
    assert_eq!(fx.table.capacity(), 25);

    assert_eq!(
        fx.table.insert(ProbeConnection::new(id(25, 1, 0), &fx.log)),
        Err(TableError::GrowthBoundExceeded(25))
    );
    assert_eq!(
        fx.table.insert(ProbeConnection::new(id(-3, 1, 0), &fx.log)),
        Err(TableError::GrowthBoundExceeded(-3))
    );
    assert_eq!(fx.table.capacity(), 25);
    assert_eq!(fx.table.len(), 2);
    // Refused connections are dropped, not stored.
    assert_eq!(fx.log.drops(), 2);
}

#[test]
fn test_capacity_never_shrinks() {
    let mut fx = TableFixture::with_capacity(2, 256);
    let big = id(100, 1, 0);
    fx.table.insert(ProbeConnection::new(big, &fx.log)).unwrap();
    let grown = fx.table.capacity();

    fx.table.remove(&big, CloseReason::Normal).unwrap();
    fx.table.close_all();
    assert_eq!(fx.table.capacity(), grown);
}

// ===== Admission and bulk close =====

#[test]
fn test_insert_rejected_once_stop_requested() {
    let mut fx = TableFixture::new();
    fx.manager.stop().unwrap();

    let (result, logs) = capture_logs(|| fx.table.insert(ProbeConnection::new(id(9, 1, 0), &fx.log)));
    assert_eq!(result, Err(TableError::AdmissionRejected));
    assert!(fx.table.is_empty());
    assert!(!fx.mux.is_registered(9));
    assert_eq!(fx.log.drops(), 1);
    assert!(!logs.contains("Descriptor conflict"));
}

#[test]
fn test_close_all_tears_down_each_connection_once() {
    let mut fx = TableFixture::new();
    let ids: Vec<_> = [1, 4, 8, 300].iter().map(|&fd| id(fd, 7, 0)).collect();
    for conn in &ids {
        fx.table.insert(ProbeConnection::new(*conn, &fx.log)).unwrap();
    }

    assert_eq!(fx.table.close_all(), ids.len());
    assert!(fx.table.is_empty());
    for conn in &ids {
        assert_eq!(fx.log.drops_of(*conn), 1);
        assert!(!fx.mux.is_registered(conn.descriptor()));
    }
    assert_eq!(fx.table.close_all(), 0);
}

#[test]
fn test_close_all_leaves_heartbeat_entries_alone() {
    let capture = LogCapture::start();
    let mut fx = TableFixture::new();
    fx.manager
        .enable_heartbeat(&HeartbeatConfig::with_timeout(Duration::from_secs(30)))
        .unwrap();
    let handle = fx.manager.handle();
    let ids: Vec<_> = (20..24).map(|fd| id(fd, 3, 0)).collect();
    for conn in &ids {
        fx.table.insert(ProbeConnection::new(*conn, &fx.log)).unwrap();
    }

    assert_eq!(fx.table.close_all(), ids.len());

    // Had close_all removed them, each of these would miss.
    for conn in &ids {
        handle.heartbeat_forget(*conn);
    }
    // The tracker handles requests in order, so this miss marks the end.
    let marker = id(99, 9, 9);
    handle.heartbeat_forget(marker);
    let marker_miss = format!("{marker} not found on removal");
    assert!(wait_until(Duration::from_secs(5), || capture
        .contents()
        .contains(&marker_miss)));

    let logs = capture.contents();
    assert_eq!(logs.matches("not found on removal").count(), 1, "{logs}");
    fx.manager.stop().unwrap();
}
