//! C6 — sync / conflict engine (§4.6): cross-database history
//! reconciliation and resolution.

use crate::core::{EndpointGuid, ProductKey, Result, SettingsError, ValueRecord};
use crate::handle::DatabaseHandle;
use crate::product::{AppId, ProductRow};
/// One value whose histories diverge between the two databases
/// (§4.6 step 3 "conflicts"), reported from the divergence point onward.
#[derive(Debug, Clone)]
pub struct ConflictValue {
    pub name: String,
    pub local_history: Vec<ValueRecord>,
    pub remote_history: Vec<ValueRecord>,
}

/// A product with one or more conflicting keys (§4.6 "Output").
#[derive(Debug, Clone)]
pub struct ConflictProduct {
    pub product: ProductKey,
    pub values: Vec<ConflictValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    Local,
    Remote,
    Skip,
}

/// Runs the full §4.6 reconciliation between `local` (usually `A`) and
/// `remote` (usually `B`), returning any conflicts for the caller to
/// resolve with [`resolve`].
pub fn sync_all_products(
    local: &DatabaseHandle,
    remote: &DatabaseHandle,
) -> Result<Vec<ConflictProduct>> {
    let mut conflicts = Vec::new();

    let mut products: Vec<ProductKey> = local
        .enumerate_products()?
        .into_iter()
        .map(|r| r.key)
        .collect();
    for row in remote.enumerate_products()? {
        if !products.contains(&row.key) {
            products.push(row.key);
        }
    }

    for key in products {
        if let Some(conflict) = sync_one_product(local, remote, &key)? {
            conflicts.push(conflict);
        }
    }

    Ok(conflicts)
}

fn sync_one_product(local: &DatabaseHandle, remote: &DatabaseHandle, key: &ProductKey) -> Result<Option<ConflictProduct>> {
    // Step 1: `product.set_current` on both sides, creating the row on
    // whichever side lacks it only when the other side's row justifies it
    // (spec.md §4.6 step 1: "creating in the non-authoritative side only
    // when the product is registered or is a legacy product with a
    // manifest").
    let local_row = find_product_row(local, key)?;
    let remote_row = find_product_row(remote, key)?;

    let local_app_id = match ensure_side(local, remote, key, &local_row, &remote_row)? {
        Some(id) => id,
        None => return Ok(None),
    };
    let remote_app_id = match ensure_side(remote, local, key, &remote_row, &local_row)? {
        Some(id) => id,
        None => return Ok(None),
    };

    let mut conflict_values = Vec::new();

    let local_names: Vec<String> = local
        .with_mutable(|txn, _products, values, _streams| {
            let snap = txn.snapshot_for_maintenance()?;
            Ok(values.enumerate_values(local_app_id, &snap).into_iter().map(|r| r.name).collect())
        })?;

    for name in local_names {
        if let Some(conflict) = sync_one_key(local, remote, local_app_id, remote_app_id, &name)? {
            conflict_values.push(conflict);
        }
    }

    // Step 4: walk remote's keys so that keys only present there are pulled in.
    let remote_names: Vec<String> = remote
        .with_mutable(|txn, _products, values, _streams| {
            let snap = txn.snapshot_for_maintenance()?;
            Ok(values.enumerate_values(remote_app_id, &snap).into_iter().map(|r| r.name).collect())
        })?;

    for name in remote_names {
        let already_handled = local
            .with_mutable(|txn, _products, values, _streams| {
                let snap = txn.snapshot_for_maintenance()?;
                Ok(values.find_row(local_app_id, &name, &snap).is_some())
            })?;
        if already_handled {
            continue;
        }
        if let Some(conflict) = sync_one_key(local, remote, local_app_id, remote_app_id, &name)? {
            conflict_values.push(conflict);
        }
    }

    if conflict_values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ConflictProduct {
            product: key.clone(),
            values: conflict_values,
        }))
    }
}

fn find_product_row(handle: &DatabaseHandle, key: &ProductKey) -> Result<Option<ProductRow>> {
    handle.with_mutable(|txn, products, _values, _streams| {
        let snap = txn.snapshot_for_maintenance()?;
        Ok(products.find_by_key(key, &snap))
    })
}

fn has_any_values(handle: &DatabaseHandle, app_id: AppId) -> Result<bool> {
    handle.with_mutable(|txn, _products, values, _streams| {
        let snap = txn.snapshot_for_maintenance()?;
        Ok(!values.enumerate_values(app_id, &snap).is_empty())
    })
}

/// Returns `dest`'s `AppId` for `key`, creating the row only if `dest`
/// lacks it and `source`'s row justifies the creation: `source` is
/// registered, or `source` is a legacy product that already has values
/// (the only "has a manifest" signal this layer can observe — manifests
/// themselves live outside the database, applied by the legacy adapter's
/// `pull`, §4.8). Returns `None` when `dest` lacks the row and creation
/// isn't justified; the caller treats that as nothing to sync yet.
fn ensure_side(
    dest: &DatabaseHandle,
    source: &DatabaseHandle,
    key: &ProductKey,
    dest_row: &Option<ProductRow>,
    source_row: &Option<ProductRow>,
) -> Result<Option<AppId>> {
    if let Some(row) = dest_row {
        return Ok(Some(row.app_id));
    }
    let Some(source_row) = source_row else {
        return Ok(None);
    };
    let qualifies = if source_row.registered {
        true
    } else if source_row.is_legacy {
        has_any_values(source, source_row.app_id)?
    } else {
        false
    };
    if !qualifies {
        return Ok(None);
    }
    Ok(Some(dest.set_product(key)?))
}

fn history_of(handle: &DatabaseHandle, app_id: AppId, name: &str) -> Result<Vec<ValueRecord>> {
    handle.with_mutable(|txn, _products, values, _streams| {
        let snap = txn.snapshot_for_maintenance()?;
        Ok(values.enumerate_history(app_id, name, &snap))
    })
}

fn current_of(handle: &DatabaseHandle, app_id: AppId, name: &str) -> Result<Option<ValueRecord>> {
    handle.with_mutable(|txn, _products, values, _streams| {
        let snap = txn.snapshot_for_maintenance()?;
        Ok(values.find_row(app_id, name, &snap).map(|r| r.record))
    })
}

/// Reconciles one `(AppId, Name)` pair (§4.6 step 3). Returns a
/// [`ConflictValue`] when neither side subsumes the other.
fn sync_one_key(
    local: &DatabaseHandle,
    remote: &DatabaseHandle,
    local_app_id: AppId,
    remote_app_id: AppId,
    name: &str,
) -> Result<Option<ConflictValue>> {
    let local_current = match current_of(local, local_app_id, name)? {
        Some(rec) => rec,
        None => return Ok(None),
    };

    let remote_history = history_with_current(remote, remote_app_id, name)?;
    if remote_history.is_empty() {
        // "If B has no history for Name: transfer all of A's history into B."
        let local_history = history_with_current(local, local_app_id, name)?;
        transfer_all(remote, remote_app_id, name, &local_history)?;
        return Ok(None);
    }

    let remote_current = remote_history.last().cloned();
    if Some(&local_current) == remote_current.as_ref() {
        return Ok(None); // same point
    }

    let local_history = history_with_current(local, local_app_id, name)?;

    if let Some(match_index) = subsumption_index(&local_history, &remote_history) {
        let fresh = &local_history[match_index + 1..];
        apply_transfer(remote, remote_app_id, name, fresh)?;
        return Ok(None);
    }

    if let Some(match_index) = subsumption_index(&remote_history, &local_history) {
        let fresh = &remote_history[match_index + 1..];
        apply_transfer(local, local_app_id, name, fresh)?;
        return Ok(None);
    }

    // Neither side subsumes the other: a genuine conflict, unless both
    // sides attribute their current value to the *same* endpoint, which
    // would mean one endpoint produced two irreconcilable histories of
    // its own — a time-skew condition, not a real two-party conflict.
    let remote_by = remote_current
        .as_ref()
        .expect("remote_history checked non-empty above")
        .by;
    check_time_skew(&local_current.by, &remote_by)?;

    Ok(Some(ConflictValue {
        name: name.to_string(),
        local_history,
        remote_history,
    }))
}

fn history_with_current(handle: &DatabaseHandle, app_id: AppId, name: &str) -> Result<Vec<ValueRecord>> {
    let mut history = history_of(handle, app_id, name)?;
    if let Some(current) = current_of(handle, app_id, name)? {
        history.push(current);
    }
    Ok(history)
}

/// Finds where `needle`'s last entry (or, retrying, its preceding entry
/// on a duplicate-write tie) appears in `haystack` (§4.6 "Compute
/// subsumption"). Returns the index into `haystack` of the match.
fn subsumption_index(haystack: &[ValueRecord], needle: &[ValueRecord]) -> Option<usize> {
    let mut probe = needle.len();
    while probe > 0 {
        let candidate = &needle[probe - 1];
        if let Some(idx) = haystack.iter().position(|r| records_match(r, candidate)) {
            return Some(idx);
        }
        if probe >= 2
            && needle[probe - 1].value == needle[probe - 2].value
            && needle[probe - 1].when == needle[probe - 2].when
        {
            probe -= 1;
            continue;
        }
        break;
    }
    None
}

fn records_match(a: &ValueRecord, b: &ValueRecord) -> bool {
    a.value == b.value && a.when == b.when && a.by == b.by
}

fn transfer_all(dest: &DatabaseHandle, app_id: AppId, name: &str, records: &[ValueRecord]) -> Result<()> {
    for record in records {
        write_record(dest, app_id, name, record.clone())?;
    }
    Ok(())
}

/// Applies the fresh-timestamp rule (§4.6): the transferred head's
/// `when` is bumped to `max(head.when, dest.current.when) + 5s` so it
/// unambiguously becomes the new head regardless of which side's clock
/// is ahead; earlier entries that still fall behind the destination's
/// current value are skipped (history-insertion is explicitly future
/// work, §9).
fn apply_transfer(dest: &DatabaseHandle, app_id: AppId, name: &str, records: &[ValueRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let dest_when = current_of(dest, app_id, name)?.map(|r| r.when);

    let (head, earlier) = records.split_last().expect("non-empty checked above");
    for record in earlier {
        if let Some(dest_when) = dest_when {
            if record.when <= dest_when {
                continue;
            }
        }
        write_record(dest, app_id, name, record.clone())?;
    }

    let mut head = head.clone();
    if let Some(dest_when) = dest_when {
        let newer = if head.when > dest_when { head.when } else { dest_when };
        head.when = newer.plus_seconds(5);
    }
    write_record(dest, app_id, name, head)
}

fn write_record(dest: &DatabaseHandle, app_id: AppId, name: &str, record: ValueRecord) -> Result<()> {
    dest.with_mutable(|txn, _products, values, streams| {
        let (guard, snap) = crate::store::TxnGuard::begin(txn)?;
        values.write(app_id, name, record, true, streams, &snap)?;
        guard.commit()?;
        Ok(())
    })?;
    dest.mark_dirty();
    Ok(())
}

/// Applies the client's choice for one conflicted key (§4.6 "Conflict
/// resolution"): replay the chosen side's history into the other side.
pub fn resolve(
    local: &DatabaseHandle,
    remote: &DatabaseHandle,
    local_app_id: AppId,
    remote_app_id: AppId,
    conflict: &ConflictValue,
    choice: Resolve,
) -> Result<()> {
    match choice {
        Resolve::Skip => Ok(()),
        Resolve::Local => apply_transfer(remote, remote_app_id, &conflict.name, &conflict.local_history),
        Resolve::Remote => apply_transfer(local, local_app_id, &conflict.name, &conflict.remote_history),
    }
}

/// Guards `sync_one_key`'s conflict path (§4.6, §7 `TimeSkew`): two
/// histories that fail subsumption both ways are a real two-party
/// conflict only if they were authored by different endpoints. The same
/// endpoint on both sides means that endpoint observed its own writes
/// out of order — aborts the sync for that key instead of reporting a
/// conflict a client could never meaningfully resolve.
pub fn check_time_skew(a: &EndpointGuid, b: &EndpointGuid) -> Result<()> {
    if a == b {
        return Err(SettingsError::TimeSkew(
            "same endpoint reported two divergent writes".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::DatabaseHandle;

    fn handle(dir: &std::path::Path) -> DatabaseHandle {
        DatabaseHandle::init(dir, false, 4096).unwrap()
    }

    fn key() -> ProductKey {
        ProductKey::validate("Contoso.App", "1.0.0.0", "0123456789abcdef").unwrap()
    }

    #[test]
    fn subsumption_transfers_full_history_when_remote_empty() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        a.set_product(&key()).unwrap();
        a.set_string("name", "alpha").unwrap();
        a.set_string("name", "beta").unwrap();
        b.set_product(&key()).unwrap();

        let conflicts = sync_all_products(&a, &b).unwrap();
        assert!(conflicts.is_empty());

        b.set_product(&key()).unwrap();
        assert_eq!(b.get_value("name").unwrap().as_string().unwrap(), "beta");
    }

    #[test]
    fn diverging_histories_produce_a_conflict() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        a.set_product(&key()).unwrap();
        a.set_dword("vol", 40).unwrap();
        b.set_product(&key()).unwrap();
        b.set_dword("vol", 70).unwrap();

        let conflicts = sync_all_products(&a, &b).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].values[0].name, "vol");
    }

    #[test]
    fn unregistered_product_is_not_created_on_the_other_side() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        a.set_product(&key()).unwrap();
        a.set_dword("vol", 40).unwrap();

        let conflicts = sync_all_products(&a, &b).unwrap();
        assert!(conflicts.is_empty());
        assert!(b.enumerate_products().unwrap().is_empty());
    }

    #[test]
    fn registered_product_is_created_on_the_other_side() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        a.set_product(&key()).unwrap();
        a.register_product(true).unwrap();
        a.set_dword("vol", 40).unwrap();

        sync_all_products(&a, &b).unwrap();
        b.set_product(&key()).unwrap();
        assert_eq!(b.get_value("vol").unwrap().as_dword().unwrap(), 40);
    }

    #[test]
    fn legacy_product_with_values_is_created_on_the_other_side() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        let legacy_key = ProductKey::validate("Acme.Legacy", "2.1.0.0", crate::core::types::LEGACY_PUBLIC_KEY).unwrap();
        a.set_product(&legacy_key).unwrap();
        a.set_dword("vol", 55).unwrap();

        sync_all_products(&a, &b).unwrap();
        b.set_product(&legacy_key).unwrap();
        assert_eq!(b.get_value("vol").unwrap().as_dword().unwrap(), 55);
    }

    #[test]
    fn legacy_product_without_values_is_not_created_on_the_other_side() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        let legacy_key = ProductKey::validate("Acme.Legacy", "2.1.0.0", crate::core::types::LEGACY_PUBLIC_KEY).unwrap();
        a.set_product(&legacy_key).unwrap();

        sync_all_products(&a, &b).unwrap();
        assert!(b.enumerate_products().unwrap().is_empty());
    }

    #[test]
    fn check_time_skew_rejects_same_endpoint_and_allows_distinct_ones() {
        let same = EndpointGuid::new();
        assert!(matches!(check_time_skew(&same, &same), Err(SettingsError::TimeSkew(_))));
        assert!(check_time_skew(&EndpointGuid::new(), &EndpointGuid::new()).is_ok());
    }

    #[test]
    fn repeated_sync_with_no_changes_is_empty() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = handle(dir_a.path());
        let b = handle(dir_b.path());
        a.set_product(&key()).unwrap();
        a.set_dword("vol", 40).unwrap();
        b.set_product(&key()).unwrap();

        sync_all_products(&a, &b).unwrap();
        let second = sync_all_products(&a, &b).unwrap();
        assert!(second.is_empty());
    }
}
