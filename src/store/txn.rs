// ============================================================================
// Embedded store: transaction management
// ============================================================================
//
// MVCC with snapshot isolation, generalized from this codebase's original
// SQL-engine transaction manager down to the fixed schema the settings
// engine needs: no query planner, no statement-level rollback log — an
// aborted transaction's rows simply become permanently invisible, which
// the visibility check in `table.rs` already gives us for free.
// ============================================================================

use im::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Unique identifier for a transaction, monotonically increasing within
/// one embedded store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx_{}", self.0)
    }
}

/// A read-consistent view of the store: which transactions are still
/// active or aborted as of the moment this snapshot was taken, and the
/// watermark below which every non-active, non-aborted id is committed.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tx_id: u64,
    pub active: Arc<HashSet<u64>>,
    pub aborted: Arc<HashSet<u64>>,
    pub max_tx_id: u64,
}

impl Snapshot {
    /// A snapshot that sees everything ever committed; used for
    /// maintenance passes (vacuum, enumeration during sync) that are not
    /// themselves part of a caller transaction.
    pub fn everything(max_tx_id: u64) -> Self {
        Snapshot {
            tx_id: u64::MAX,
            active: Arc::new(HashSet::new()),
            aborted: Arc::new(HashSet::new()),
            max_tx_id,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    active_ids: HashSet<u64>,
    aborted_ids: HashSet<u64>,
}

/// Tracks in-flight and aborted transaction ids for one embedded store.
/// Cloning a `TransactionManager` shares the same underlying state (it
/// wraps an `Arc`), matching the "one manager per `DatabaseHandle`"
/// ownership model.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    next_id: Arc<AtomicU64>,
    inner: Arc<RwLock<Inner>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            next_id: Arc::new(AtomicU64::new(1)),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Rebuilds a manager after reopening a persisted store: every
    /// transaction id below `next_id` is treated as committed (the
    /// active/aborted sets are necessarily empty across a process
    /// restart), and new ids continue monotonically from there.
    pub fn restore(next_id: u64) -> Self {
        TransactionManager {
            next_id: Arc::new(AtomicU64::new(next_id)),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn next_tx_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn begin(&self) -> crate::core::Result<(TransactionId, Snapshot)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write()?;
        inner.active_ids.insert(id);
        let snapshot = Snapshot {
            tx_id: id,
            active: Arc::new(inner.active_ids.clone()),
            aborted: Arc::new(inner.aborted_ids.clone()),
            max_tx_id: id,
        };
        Ok((TransactionId(id), snapshot))
    }

    pub fn commit(&self, id: TransactionId) -> crate::core::Result<()> {
        let mut inner = self.inner.write()?;
        inner.active_ids.remove(&id.0);
        Ok(())
    }

    pub fn rollback(&self, id: TransactionId) -> crate::core::Result<()> {
        let mut inner = self.inner.write()?;
        inner.active_ids.remove(&id.0);
        inner.aborted_ids.insert(id.0);
        Ok(())
    }

    pub fn snapshot_for_maintenance(&self) -> crate::core::Result<Snapshot> {
        Ok(Snapshot::everything(self.next_id.load(Ordering::SeqCst)))
    }

    /// Lowest transaction id any live snapshot might still consider
    /// active; versions made dead strictly before this are safe to vacuum.
    pub fn min_active_tx_id(&self) -> crate::core::Result<u64> {
        let inner = self.inner.read()?;
        Ok(inner
            .active_ids
            .iter()
            .min()
            .copied()
            .unwrap_or_else(|| self.next_id.load(Ordering::SeqCst)))
    }

    pub fn aborted_ids(&self) -> crate::core::Result<im::HashSet<u64>> {
        Ok(self.inner.read()?.aborted_ids.clone())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII transaction guard: commits on `commit()`, rolls back on `Drop`
/// if neither `commit` nor `rollback` was called explicitly. Mirrors the
/// "guaranteed-rollback scope on error" discipline required by §5.
pub struct TxnGuard<'a> {
    manager: &'a TransactionManager,
    id: TransactionId,
    finished: bool,
}

impl<'a> TxnGuard<'a> {
    pub fn begin(manager: &'a TransactionManager) -> crate::core::Result<(Self, Snapshot)> {
        let (id, snapshot) = manager.begin()?;
        Ok((
            TxnGuard {
                manager,
                id,
                finished: false,
            },
            snapshot,
        ))
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> crate::core::Result<()> {
        self.manager.commit(self.id)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.manager.rollback(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_removes_from_active_set() {
        let mgr = TransactionManager::new();
        let (id, snap) = mgr.begin().unwrap();
        assert!(snap.active.contains(&id.0));
        mgr.commit(id).unwrap();
        let snap2 = mgr.snapshot_for_maintenance().unwrap();
        assert!(!snap2.active.contains(&id.0));
    }

    #[test]
    fn guard_rolls_back_on_drop_without_commit() {
        let mgr = TransactionManager::new();
        let id = {
            let (guard, _snap) = TxnGuard::begin(&mgr).unwrap();
            guard.id()
        };
        let aborted = mgr.aborted_ids().unwrap();
        assert!(aborted.contains(&id.0));
    }

    #[test]
    fn guard_commit_does_not_abort() {
        let mgr = TransactionManager::new();
        let (guard, _snap) = TxnGuard::begin(&mgr).unwrap();
        let id = guard.id();
        guard.commit().unwrap();
        let aborted = mgr.aborted_ids().unwrap();
        assert!(!aborted.contains(&id.0));
    }
}
