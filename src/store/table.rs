// ============================================================================
// Embedded store: generic MVCC table
// ============================================================================
//
// Generalizes this codebase's SQL-engine `Table` (dynamic, user-defined
// schemas driven by a parsed `CREATE TABLE`) down to what the settings
// engine actually needs: a fixed, compile-time row type per table and no
// query planner. Secondary indexes are intentionally NOT built into this
// type — the settings schema (§6) only ever needs point lookups by one
// or two columns, which each owning module (stream store, product
// registry, value store) maintains itself as a small `im::OrdMap` next
// to its `Table<T>`, rather than this type carrying a generic
// column-indexing engine it would barely use.
// ============================================================================

use super::txn::Snapshot;
use im::OrdMap;
use serde::{Deserialize, Serialize};

pub type RowId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvccRow<T> {
    pub row: T,
    pub xmin: u64,
    pub xmax: Option<u64>,
}

/// An MVCC-versioned table of rows of type `T`, keyed by an
/// auto-incrementing `RowId`. Visibility follows snapshot-isolation
/// rules identical to this codebase's existing SQL storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table<T> {
    rows: OrdMap<RowId, Vec<MvccRow<T>>>,
    next_row_id: RowId,
}

impl<T: Clone> Table<T> {
    pub fn new() -> Self {
        Table {
            rows: OrdMap::new(),
            next_row_id: 0,
        }
    }

    pub fn insert(&mut self, row: T, snapshot: &Snapshot) -> RowId {
        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(
            id,
            vec![MvccRow {
                row,
                xmin: snapshot.tx_id,
                xmax: None,
            }],
        );
        id
    }

    pub fn delete(&mut self, id: RowId, tx_id: u64) -> bool {
        if let Some(versions) = self.rows.get(&id) {
            let mut new_versions = versions.clone();
            if let Some(latest) = new_versions.last_mut() {
                if latest.xmax.is_some() {
                    return false;
                }
                latest.xmax = Some(tx_id);
                self.rows.insert(id, new_versions);
                return true;
            }
        }
        false
    }

    pub fn update(&mut self, id: RowId, new_row: T, snapshot: &Snapshot) -> bool {
        if let Some(versions) = self.rows.get(&id) {
            let mut new_versions = versions.clone();
            if let Some(latest) = new_versions.last_mut() {
                if latest.xmax.is_some() {
                    return false;
                }
                latest.xmax = Some(snapshot.tx_id);
            } else {
                return false;
            }
            new_versions.push(MvccRow {
                row: new_row,
                xmin: snapshot.tx_id,
                xmax: None,
            });
            self.rows.insert(id, new_versions);
            true
        } else {
            false
        }
    }

    pub fn get_visible(&self, id: RowId, snapshot: &Snapshot) -> Option<T> {
        let versions = self.rows.get(&id)?;
        versions
            .iter()
            .rev()
            .find(|v| self.is_visible(v, snapshot))
            .map(|v| v.row.clone())
    }

    pub fn scan(&self, snapshot: &Snapshot) -> Vec<T> {
        self.scan_with_ids(snapshot).into_iter().map(|(_, r)| r).collect()
    }

    pub fn scan_with_ids(&self, snapshot: &Snapshot) -> Vec<(RowId, T)> {
        let mut out = Vec::new();
        for (id, versions) in &self.rows {
            if let Some(v) = versions.iter().rev().find(|v| self.is_visible(v, snapshot)) {
                out.push((*id, v.row.clone()));
            }
        }
        out
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn is_committed(&self, tx_id: u64, snapshot: &Snapshot) -> bool {
        if tx_id >= snapshot.max_tx_id {
            return false;
        }
        if snapshot.active.contains(&tx_id) || snapshot.aborted.contains(&tx_id) {
            return false;
        }
        true
    }

    fn is_visible(&self, row: &MvccRow<T>, snapshot: &Snapshot) -> bool {
        if row.xmin == snapshot.tx_id {
            return !matches!(row.xmax, Some(xmax) if xmax == snapshot.tx_id);
        }
        if !self.is_committed(row.xmin, snapshot) {
            return false;
        }
        if let Some(xmax) = row.xmax {
            if xmax == snapshot.tx_id || self.is_committed(xmax, snapshot) {
                return false;
            }
        }
        true
    }

    /// Drops row versions that can no longer be visible to any live
    /// snapshot (xmin aborted, or xmax committed below the low
    /// watermark). Returns the number of versions freed.
    pub fn vacuum(&mut self, min_active_tx_id: u64, aborted: &im::HashSet<u64>) -> usize {
        let mut freed = 0;
        let mut updates = Vec::new();

        for (id, versions) in &self.rows {
            let before = versions.len();
            let kept: Vec<MvccRow<T>> = versions
                .iter()
                .filter(|v| {
                    if aborted.contains(&v.xmin) {
                        return false;
                    }
                    if let Some(xmax) = v.xmax {
                        if !aborted.contains(&xmax) && xmax < min_active_tx_id {
                            return false;
                        }
                    }
                    true
                })
                .cloned()
                .collect();
            if kept.len() != before {
                freed += before - kept.len();
                updates.push((*id, kept));
            }
        }

        for (id, kept) in updates {
            if kept.is_empty() {
                self.rows.remove(&id);
            } else {
                self.rows.insert(id, kept);
            }
        }
        freed
    }
}

impl<T: Clone> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}
