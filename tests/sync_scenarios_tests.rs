//! End-to-end scenarios from the spec's testable-properties section:
//! convergence, subsumption, tombstones, blob refcounting, forget, and
//! the fresh-timestamp rule.

use cfgsync::core::clock::FixedClock;
use cfgsync::core::types::Timestamp;
use cfgsync::sync::{self, Resolve};
use cfgsync::{DatabaseHandle, ProductKey, Value};
use std::sync::Arc;

fn key() -> ProductKey {
    ProductKey::validate("Contoso.App", "1.0.0.0", "0123456789abcdef").unwrap()
}

fn handle_at(dir: &std::path::Path, ticks: i64) -> (DatabaseHandle, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(Timestamp::from_ticks(ticks)));
    let handle = DatabaseHandle::init_with_clock(dir, false, 4096, clock.clone()).unwrap();
    (handle, clock)
}

#[test]
fn s1_convergence_via_explicit_resolve() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, _clock_a) = handle_at(dir_a.path(), 100);
    let (b, _clock_b) = handle_at(dir_b.path(), 200);

    let a_app = a.set_product(&key()).unwrap();
    a.set_dword("vol", 40).unwrap();
    let b_app = b.set_product(&key()).unwrap();
    b.set_dword("vol", 70).unwrap();

    let conflicts = sync::sync_all_products(&a, &b).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0].values[0];
    assert_eq!(conflict.name, "vol");
    assert_eq!(conflict.local_history.last().unwrap().value, Value::Dword(40));
    assert_eq!(conflict.remote_history.last().unwrap().value, Value::Dword(70));

    sync::resolve(&a, &b, a_app, b_app, conflict, Resolve::Remote).unwrap();

    a.set_product(&key()).unwrap();
    b.set_product(&key()).unwrap();
    assert_eq!(a.get_value("vol").unwrap().as_dword().unwrap(), 70);
    assert_eq!(b.get_value("vol").unwrap().as_dword().unwrap(), 70);
}

#[test]
fn s2_subsumption_transfers_whole_history() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, _) = handle_at(dir_a.path(), 100);
    let (b, _) = handle_at(dir_b.path(), 100);

    a.set_product(&key()).unwrap();
    a.set_string("name", "alpha").unwrap();
    a.set_string("name", "beta").unwrap();
    b.set_product(&key()).unwrap();

    let conflicts = sync::sync_all_products(&a, &b).unwrap();
    assert!(conflicts.is_empty());

    b.set_product(&key()).unwrap();
    assert_eq!(b.get_value("name").unwrap().as_string().unwrap(), "beta");
    let history = b.enumerate_past_values("name").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value.as_string().unwrap(), "alpha");
}

#[test]
fn s3_tombstone_propagates_as_not_found() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, _) = handle_at(dir_a.path(), 100);
    let (b, _) = handle_at(dir_b.path(), 100);

    a.set_product(&key()).unwrap();
    a.set_dword("tmp", 1).unwrap();
    b.set_product(&key()).unwrap();
    sync::sync_all_products(&a, &b).unwrap();

    a.set_product(&key()).unwrap();
    a.delete_value("tmp").unwrap();
    sync::sync_all_products(&a, &b).unwrap();

    b.set_product(&key()).unwrap();
    assert!(matches!(b.get_value("tmp"), Err(cfgsync::SettingsError::NotFound(_))));
}

#[test]
fn s4_blob_refcount_tracks_sharing_and_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _) = handle_at(dir.path(), 100);
    h.set_product(&key()).unwrap();

    let bytes = vec![0u8; 1024];
    h.set_blob("a", &bytes).unwrap();
    h.set_blob("b", &bytes).unwrap();

    h.delete_value("a").unwrap();
    h.delete_value("b").unwrap();
}

#[test]
fn s5_forget_removes_product_and_values() {
    let dir = tempfile::tempdir().unwrap();
    let (h, _) = handle_at(dir.path(), 100);
    h.set_product(&key()).unwrap();
    h.register_product(true).unwrap();
    h.set_dword("vol", 1).unwrap();
    h.set_blob("blob", b"payload").unwrap();

    h.forget_product().unwrap();

    assert!(matches!(h.set_dword("vol", 2), Err(cfgsync::SettingsError::BadState(_))));
    h.set_product(&key()).unwrap();
    assert!(!h.is_product_registered().unwrap());
}

#[test]
fn s6_fresh_timestamp_rule_bumps_the_transferred_head() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, _) = handle_at(dir_a.path(), 100);
    let (b, _) = handle_at(dir_b.path(), 90);

    a.set_product(&key()).unwrap();
    a.set_dword("k", 1).unwrap();
    b.set_product(&key()).unwrap();
    b.set_dword("k", 2).unwrap();

    // B's single write subsumes nothing of A's and vice versa at first
    // glance, but since neither history contains the other's only entry,
    // this is reported as a conflict; resolving toward A exercises the
    // fresh-timestamp bump because B's current `when` (90 ticks) is
    // older than A's (100 ticks) yet the transfer still must win.
    let conflicts = sync::sync_all_products(&a, &b).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0].values[0];
    let a_app = a.set_product(&key()).unwrap();
    let b_app = b.set_product(&key()).unwrap();
    sync::resolve(&a, &b, a_app, b_app, conflict, Resolve::Local).unwrap();

    b.set_product(&key()).unwrap();
    assert_eq!(b.get_value("k").unwrap().as_dword().unwrap(), 1);
}

#[test]
fn repeated_sync_converges_to_an_empty_conflict_list() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (a, _) = handle_at(dir_a.path(), 100);
    let (b, _) = handle_at(dir_b.path(), 100);

    a.set_product(&key()).unwrap();
    a.set_dword("vol", 40).unwrap();
    b.set_product(&key()).unwrap();

    sync::sync_all_products(&a, &b).unwrap();
    let second = sync::sync_all_products(&a, &b).unwrap();
    assert!(second.is_empty());
}
