//! C5 — database handle (§4.5): schema bring-up, re-entrant lock,
//! endpoint GUID, change stamp.

pub mod changes;
pub mod lock;

use crate::core::{Clock, EndpointGuid, ProductKey, Result, SettingsError, SystemClock, Timestamp, Value, ValueRecord};
use crate::product::{AdminRegistry, AppId, ProductRegistry};
use crate::store::{SnapshotManager, TransactionManager, TxnGuard};
use crate::stream::StreamStore;
use crate::valuestore::ValueStore;
use lock::HandleLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const STORE_FILE: &str = "settings.sdf";
const STREAMS_DIR: &str = "Streams";
const CHANGES_FILE: &str = "settings.changes";
const LEGACY_MANIFEST_KEY_PREFIX: &str = "__legacy_manifest__";

/// The self-product value name a legacy product's `Forget` tombstones,
/// so peer databases drop the product from their own legacy manifest on
/// the next sync.
fn legacy_manifest_key(key: &ProductKey) -> String {
    format!("{LEGACY_MANIFEST_KEY_PREFIX}{}/{}/{}", key.name, key.version, key.public_key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandleState {
    endpoint_guid: EndpointGuid,
    next_tx_id: u64,
    self_app_id: AppId,
    products: ProductRegistry,
    values: ValueStore,
    streams: StreamStore,
}

struct Mutable {
    products: ProductRegistry,
    values: ValueStore,
    streams: StreamStore,
}

/// Local or remote settings database (§3 "DatabaseHandle"). Held behind
/// an `Arc` so that the background worker (C7) and the sync engine (C6)
/// can share one instance across threads while the re-entrant
/// [`HandleLock`] mediates access.
pub struct DatabaseHandle {
    dir: PathBuf,
    streams_dir: PathBuf,
    changes_path: PathBuf,
    snapshot: SnapshotManager,
    lock: HandleLock,
    endpoint_guid: EndpointGuid,
    is_remote: bool,
    pub sync_by_default: bool,
    codec_threshold: usize,
    txn: TransactionManager,
    mutable: Mutex<Mutable>,
    self_app_id: Mutex<AppId>,
    current_app_id: Mutex<Option<AppId>>,
    update_last_modified: AtomicBool,
    admin: Mutex<Option<AdminRegistry>>,
    clock: Arc<dyn Clock>,
}

impl DatabaseHandle {
    /// Bootstraps a handle in the order required by §4.5: resolve
    /// directories, open-or-create the embedded store, read-or-generate
    /// the endpoint GUID, ensure the self-product exists.
    pub fn init(dir: impl Into<PathBuf>, is_remote: bool, codec_threshold: usize) -> Result<Self> {
        Self::init_with_clock(dir, is_remote, codec_threshold, Arc::new(SystemClock))
    }

    pub fn init_with_clock(
        dir: impl Into<PathBuf>,
        is_remote: bool,
        codec_threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let streams_dir = dir.join(STREAMS_DIR);
        let changes_path = dir.join(CHANGES_FILE);
        let snapshot = SnapshotManager::new(dir.join(STORE_FILE));

        let (state, txn) = if snapshot.exists() {
            let state: HandleState = snapshot.load()?;
            let txn = TransactionManager::restore(state.next_tx_id);
            (state, txn)
        } else {
            let txn = TransactionManager::new();
            let (guard, snap) = TxnGuard::begin(&txn)?;
            let mut products = ProductRegistry::new();
            let (self_app_id, _) = products.ensure_created(&ProductKey::self_product(), &snap)?;
            guard.commit()?;
            let state = HandleState {
                endpoint_guid: EndpointGuid::new(),
                next_tx_id: txn.next_tx_id(),
                self_app_id,
                products,
                values: ValueStore::new(),
                streams: StreamStore::new(streams_dir.clone()),
            };
            (state, txn)
        };

        let handle = DatabaseHandle {
            dir,
            streams_dir,
            changes_path,
            snapshot,
            lock: HandleLock::new(),
            endpoint_guid: state.endpoint_guid,
            is_remote,
            sync_by_default: true,
            codec_threshold,
            txn,
            mutable: Mutex::new(Mutable {
                products: state.products,
                values: state.values,
                streams: state.streams,
            }),
            self_app_id: Mutex::new(state.self_app_id),
            current_app_id: Mutex::new(None),
            update_last_modified: AtomicBool::new(false),
            admin: Mutex::new(None),
            clock,
        };
        handle.persist()?;
        Ok(handle)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn endpoint_guid(&self) -> EndpointGuid {
        self.endpoint_guid
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn self_app_id(&self) -> Result<AppId> {
        Ok(*self.self_app_id.lock()?)
    }

    pub fn set_admin_registry(&self, admin: AdminRegistry) -> Result<()> {
        *self.admin.lock()? = Some(admin);
        Ok(())
    }

    /// Runs `f` inside the handle's re-entrant critical section,
    /// matching §4.5: acquisition/release side-effects only fire at the
    /// outermost depth transition.
    pub fn with_lock<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DatabaseHandle) -> Result<R>,
    {
        let guard = self.lock.acquire()?;
        let result = f(self);
        if guard.is_last_release() {
            self.on_release()?;
        }
        result
    }

    fn on_release(&self) -> Result<()> {
        {
            let mut mutable = self.mutable.lock()?;
            let snapshot = self.txn.snapshot_for_maintenance()?;
            mutable.streams.drain_pending_deletes(&snapshot);
        }
        self.persist()?;
        if self.update_last_modified.swap(false, Ordering::SeqCst) {
            changes::bump(&self.changes_path)?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let mutable = self.mutable.lock()?;
        let state = HandleState {
            endpoint_guid: self.endpoint_guid,
            next_tx_id: self.txn.next_tx_id(),
            self_app_id: *self.self_app_id.lock()?,
            products: mutable.products.clone(),
            values: mutable.values.clone(),
            streams: mutable.streams.clone(),
        };
        self.snapshot.save(&state)
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ---- C3: product registry passthrough ----

    pub fn set_product(&self, key: &ProductKey) -> Result<AppId> {
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let (app_id, _is_legacy) = mutable.products.ensure_created(key, &snap)?;
            guard.commit()?;
            *h.current_app_id.lock()? = Some(app_id);
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(app_id)
        })
    }

    pub fn register_product(&self, registered: bool) -> Result<()> {
        let app_id = self.require_current_app_id()?;
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            mutable.products.register(app_id, registered, &snap)?;
            guard.commit()?;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    pub fn is_product_registered(&self) -> Result<bool> {
        let app_id = self.require_current_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        let admin = self.admin.lock()?;
        Ok(mutable.products.is_registered(app_id, &snap, admin.as_ref()))
    }

    pub fn enumerate_products(&self) -> Result<Vec<crate::product::ProductRow>> {
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        Ok(mutable.products.enumerate(&snap))
    }

    /// `Forget` (§4.3): atomically drops every value for the current
    /// product, then the product row itself; if the product was legacy,
    /// also tombstones its self-product legacy-manifest entry so peers
    /// forget it on the next sync (spec.md "if legacy, write a tombstone
    /// under the self-product's legacy-manifest key").
    pub fn forget_product(&self) -> Result<()> {
        let app_id = self.require_current_app_id()?;
        let self_app_id = self.self_app_id()?;
        let by = self.endpoint_guid;
        let when = self.now();
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let mutable = &mut *mutable;
            mutable.values.forget_all(app_id, &mut mutable.streams, &snap)?;
            let removed = match mutable.products.forget(app_id, &snap) {
                Ok(row) => Some(row),
                Err(SettingsError::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            if let Some(row) = removed {
                if row.is_legacy {
                    let tombstone = ValueRecord::new(Value::Deleted, when, by);
                    mutable.values.write(
                        self_app_id,
                        &legacy_manifest_key(&row.key),
                        tombstone,
                        true,
                        &mut mutable.streams,
                        &snap,
                    )?;
                }
            }
            guard.commit()?;
            *h.current_app_id.lock()? = None;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn require_current_app_id(&self) -> Result<AppId> {
        self.current_app_id
            .lock()?
            .ok_or_else(|| SettingsError::BadState("no product selected; call set_product first".into()))
    }

    // ---- C4: value store passthrough ----

    fn write_value(&self, name: &str, value: Value) -> Result<()> {
        let app_id = self.require_current_app_id()?;
        let by = self.endpoint_guid;
        let when = self.now();
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let mutable = &mut *mutable;
            mutable
                .values
                .write(app_id, name, ValueRecord::new(value, when, by), true, &mut mutable.streams, &snap)?;
            guard.commit()?;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    pub fn set_dword(&self, name: &str, value: u32) -> Result<()> {
        self.write_value(name, Value::Dword(value))
    }

    pub fn set_qword(&self, name: &str, value: u64) -> Result<()> {
        self.write_value(name, Value::Qword(value))
    }

    pub fn set_bool(&self, name: &str, value: bool) -> Result<()> {
        self.write_value(name, Value::Bool(value))
    }

    pub fn set_string(&self, name: &str, value: impl Into<String>) -> Result<()> {
        self.write_value(name, Value::String(value.into()))
    }

    pub fn set_blob(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let app_id = self.require_current_app_id()?;
        let by = self.endpoint_guid;
        let when = self.now();
        let codec_threshold = self.codec_threshold;
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let mutable = &mut *mutable;
            let stream_id = mutable.streams.write(bytes, codec_threshold, &snap)?;
            let blob = crate::core::BlobRef {
                hash: *blake3::hash(bytes).as_bytes(),
                stream_id: Some(stream_id),
            };
            mutable.values.write(
                app_id,
                name,
                ValueRecord::new(Value::Blob(blob), when, by),
                true,
                &mut mutable.streams,
                &snap,
            )?;
            guard.commit()?;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    pub fn delete_value(&self, name: &str) -> Result<()> {
        self.write_value(name, Value::Deleted)
    }

    pub fn get_value(&self, name: &str) -> Result<Value> {
        let app_id = self.require_current_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        mutable.values.read(app_id, name, &snap)
    }

    pub fn read_blob(&self, blob: &crate::core::BlobRef) -> Result<Vec<u8>> {
        let stream_id = blob
            .stream_id
            .ok_or_else(|| SettingsError::NotFound("blob has no persisted stream".into()))?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        mutable.streams.read(stream_id, &snap)
    }

    pub fn enumerate_values(&self) -> Result<Vec<crate::valuestore::CurrentRow>> {
        let app_id = self.require_current_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        Ok(mutable.values.enumerate_values(app_id, &snap))
    }

    pub fn enumerate_past_values(&self, name: &str) -> Result<Vec<ValueRecord>> {
        let app_id = self.require_current_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        Ok(mutable.values.enumerate_history(app_id, name, &snap))
    }

    // ---- internals exposed to C6/C7 within the crate ----

    pub(crate) fn with_mutable<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TransactionManager, &mut ProductRegistry, &mut ValueStore, &mut StreamStore) -> Result<R>,
    {
        let mut mutable = self.mutable.lock()?;
        let mutable = &mut *mutable;
        f(&self.txn, &mut mutable.products, &mut mutable.values, &mut mutable.streams)
    }

    /// Writes a string value under the well-known self-product (§4.3),
    /// independent of whatever product the caller has currently selected
    /// with [`set_product`](Self::set_product). Used by the remote
    /// registry (C7) and the legacy adapter to store per-endpoint state.
    pub(crate) fn set_self_string(&self, name: &str, value: impl Into<String>) -> Result<()> {
        let app_id = self.self_app_id()?;
        let by = self.endpoint_guid;
        let when = self.now();
        let record = ValueRecord::new(Value::String(value.into()), when, by);
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let mutable = &mut *mutable;
            mutable.values.write(app_id, name, record, true, &mut mutable.streams, &snap)?;
            guard.commit()?;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    pub(crate) fn get_self_string(&self, name: &str) -> Result<Option<String>> {
        let app_id = self.self_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        match mutable.values.read(app_id, name, &snap) {
            Ok(Value::String(s)) => Ok(Some(s)),
            Ok(other) => Err(SettingsError::TypeMismatch {
                expected: "string".into(),
                found: format!("{other:?}"),
            }),
            Err(SettingsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn delete_self_value(&self, name: &str) -> Result<()> {
        let app_id = self.self_app_id()?;
        let by = self.endpoint_guid;
        let when = self.now();
        let record = ValueRecord::new(Value::Deleted, when, by);
        self.with_lock(|h| {
            let mut mutable = h.mutable.lock()?;
            let (guard, snap) = TxnGuard::begin(&h.txn)?;
            let mutable = &mut *mutable;
            mutable.values.write(app_id, name, record, true, &mut mutable.streams, &snap)?;
            guard.commit()?;
            h.update_last_modified.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Enumerates every current self-product value whose name starts with
    /// `prefix`, returning `(suffix, string value)` pairs. Non-string or
    /// tombstoned rows are skipped.
    pub(crate) fn enumerate_self_values_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let app_id = self.self_app_id()?;
        let mutable = self.mutable.lock()?;
        let snap = self.txn.snapshot_for_maintenance()?;
        let rows = mutable.values.enumerate_values(app_id, &snap);
        drop(mutable);
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let suffix = row.name.strip_prefix(prefix)?;
                match row.record.value {
                    Value::String(s) => Some((suffix.to_string(), s)),
                    _ => None,
                }
            })
            .collect())
    }

    pub(crate) fn mark_dirty(&self) {
        self.update_last_modified.store(true, Ordering::SeqCst);
    }

    pub(crate) fn streams_dir(&self) -> &Path {
        &self.streams_dir
    }

    pub(crate) fn changes_path(&self) -> &Path {
        &self.changes_path
    }
}
