//! C4 — value store (§4.4): per-`(AppId, Name)` current value plus
//! append-only history.

use crate::core::{Result, SettingsError, Value, ValueRecord};
use crate::product::AppId;
use crate::store::{Snapshot, Table};
use crate::stream::StreamStore;
use im::OrdMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentRow {
    pub app_id: AppId,
    pub name: String,
    pub record: ValueRecord,
    pub last_history_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub app_id: AppId,
    pub name: String,
    pub record: ValueRecord,
}

/// `current` and `value_index_history` (§6) together. The `(app_id,
/// name)` unique index on `current` is kept as a small `OrdMap` next to
/// the table, per the same convention used by the stream store and
/// product registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueStore {
    current: Table<CurrentRow>,
    history: Table<HistoryRow>,
    by_key: OrdMap<(AppId, String), u64>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore {
            current: Table::new(),
            history: Table::new(),
            by_key: OrdMap::new(),
        }
    }

    pub fn read(&self, app_id: AppId, name: &str, snapshot: &Snapshot) -> Result<Value> {
        let row = self
            .find_row(app_id, name, snapshot)
            .ok_or_else(|| SettingsError::NotFound(format!("value {app_id}/{name}")))?;
        if row.record.value.is_tombstone() {
            return Err(SettingsError::NotFound(format!("value {app_id}/{name}")));
        }
        Ok(row.record.value)
    }

    pub fn find_row(&self, app_id: AppId, name: &str, snapshot: &Snapshot) -> Option<CurrentRow> {
        let row_id = self.by_key.get(&(app_id, name.to_string()))?;
        self.current.get_visible(*row_id, snapshot)
    }

    /// The pivot operation (§4.4 steps 1-5): idempotent write with
    /// history append and stream refcount bookkeeping.
    pub fn write(
        &mut self,
        app_id: AppId,
        name: &str,
        record: ValueRecord,
        update_last_history: bool,
        streams: &mut StreamStore,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let key = (app_id, name.to_string());
        let existing_row_id = self.by_key.get(&key).copied();
        let existing = existing_row_id.and_then(|id| self.current.get_visible(id, snapshot));

        // Step 2: idempotence guarantee — payload-only comparison, since
        // the caller's `when` will differ on every re-assertion.
        if let Some(ref existing) = existing {
            if existing.record.value == record.value {
                return Ok(());
            }
        }

        // Step 3 (§4.2/§4.4): the incoming blob's refcount was already
        // established by the caller when it resolved `record`'s stream id
        // (`StreamStore::write` inserts a fresh stream at refcount 1, or
        // bumps an existing hash match by 1) — this function only tracks
        // the *release* of whatever reference it is replacing, in step 5.

        // Step 4: copy the old current row into history.
        let mut new_last_history_id = existing.as_ref().and_then(|r| r.last_history_id);
        if let Some(ref existing) = existing {
            let history_id = self.history.insert(
                HistoryRow {
                    app_id,
                    name: name.to_string(),
                    record: existing.record.clone(),
                },
                snapshot,
            );
            if update_last_history {
                new_last_history_id = Some(history_id);
            }
        }

        let new_row = CurrentRow {
            app_id,
            name: name.to_string(),
            record: record.clone(),
            last_history_id: new_last_history_id,
        };

        if let Some(row_id) = existing_row_id {
            self.current.update(row_id, new_row, snapshot);
        } else {
            let row_id = self.current.insert(new_row, snapshot);
            self.by_key.insert(key, row_id);
        };

        // Step 5: release the old current value's blob reference.
        if let Some(existing) = existing {
            if let Value::Blob(ref blob) = existing.record.value {
                if let Some(stream_id) = blob.stream_id {
                    streams.decr_refcount(stream_id, snapshot)?;
                }
            }
        }

        Ok(())
    }

    pub fn enumerate_values(&self, app_id: AppId, snapshot: &Snapshot) -> Vec<CurrentRow> {
        self.current
            .scan(snapshot)
            .into_iter()
            .filter(|r| r.app_id == app_id)
            .collect()
    }

    /// History for one key, oldest first (§3 "ordering within a key is
    /// by `when`, ties broken by `by`").
    pub fn enumerate_history(&self, app_id: AppId, name: &str, snapshot: &Snapshot) -> Vec<ValueRecord> {
        let mut rows: Vec<ValueRecord> = self
            .history
            .scan(snapshot)
            .into_iter()
            .filter(|r| r.app_id == app_id && r.name == name)
            .map(|r| r.record)
            .collect();
        rows.sort_by_key(|r| r.ordering_key());
        rows
    }

    /// Drops the value's history and current row, decrementing any
    /// referenced stream's refcount. Used by `product::forget` (§4.3).
    pub fn forget(
        &mut self,
        app_id: AppId,
        name: &str,
        streams: &mut StreamStore,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let key = (app_id, name.to_string());
        if let Some(row_id) = self.by_key.get(&key).copied() {
            if let Some(current) = self.current.get_visible(row_id, snapshot) {
                if let Value::Blob(ref blob) = current.record.value {
                    if let Some(stream_id) = blob.stream_id {
                        streams.decr_refcount(stream_id, snapshot)?;
                    }
                }
            }
            self.current.delete(row_id, snapshot.tx_id);
            self.by_key.remove(&key);
        }

        for (id, row) in self.history.scan_with_ids(snapshot) {
            if row.app_id == app_id && row.name == name {
                if let Value::Blob(ref blob) = row.record.value {
                    if let Some(stream_id) = blob.stream_id {
                        streams.decr_refcount(stream_id, snapshot)?;
                    }
                }
                self.history.delete(id, snapshot.tx_id);
            }
        }
        Ok(())
    }

    /// Drops every value belonging to `app_id` (whole-product forget).
    pub fn forget_all(&mut self, app_id: AppId, streams: &mut StreamStore, snapshot: &Snapshot) -> Result<()> {
        let names: Vec<String> = self
            .enumerate_values(app_id, snapshot)
            .into_iter()
            .map(|r| r.name)
            .collect();
        for name in names {
            self.forget(app_id, &name, streams, snapshot)?;
        }
        Ok(())
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}
