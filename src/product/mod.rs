//! C3 — product registry (§4.3): `(Name,Version,PublicKey) ↔ AppId`
//! mapping, registered flag, legacy flag.

use crate::core::types::{LEGACY_PUBLIC_KEY, ProductKey};
use crate::core::{Result, SettingsError};
use crate::store::{Snapshot, Table};
use im::OrdMap;
use serde::{Deserialize, Serialize};

pub type AppId = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRow {
    pub app_id: AppId,
    pub key: ProductKey,
    pub registered: bool,
    pub is_legacy: bool,
    pub legacy_sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRegistry {
    table: Table<ProductRow>,
    by_key: OrdMap<ProductKey, AppId>,
}

impl ProductRegistry {
    pub fn new() -> Self {
        ProductRegistry {
            table: Table::new(),
            by_key: OrdMap::new(),
        }
    }

    /// Finds or creates the product row for `key`, returning its `AppId`
    /// and whether it is a legacy product (§4.3).
    pub fn ensure_created(&mut self, key: &ProductKey, snapshot: &Snapshot) -> Result<(AppId, bool)> {
        if let Some(&app_id) = self.by_key.get(key) {
            return Ok((app_id, key.is_legacy()));
        }

        let is_legacy = key.is_legacy();
        let row_id = self.table.insert(
            ProductRow {
                app_id: 0,
                key: key.clone(),
                registered: false,
                is_legacy,
                legacy_sequence: 0,
            },
            snapshot,
        );
        let app_id = row_id as AppId;
        self.table.update(
            row_id,
            ProductRow {
                app_id,
                key: key.clone(),
                registered: false,
                is_legacy,
                legacy_sequence: 0,
            },
            snapshot,
        );
        self.by_key.insert(key.clone(), app_id);
        Ok((app_id, is_legacy))
    }

    pub fn register(&mut self, app_id: AppId, registered: bool, snapshot: &Snapshot) -> Result<()> {
        let mut row = self.require_row(app_id, snapshot)?;
        if row.is_legacy {
            return Err(SettingsError::AccessDenied(
                "legacy products cannot be registered via the generic API".into(),
            ));
        }
        row.registered = registered;
        self.table.update(app_id as u64, row, snapshot);
        Ok(())
    }

    pub fn is_registered(&self, app_id: AppId, snapshot: &Snapshot, admin: Option<&AdminRegistry>) -> bool {
        match self.table.get_visible(app_id as u64, snapshot) {
            Some(row) if row.registered => true,
            Some(row) => admin.is_some_and(|a| a.contains(&row.key, snapshot)),
            None => false,
        }
    }

    pub fn find_row(&self, app_id: AppId, snapshot: &Snapshot) -> Option<ProductRow> {
        self.table.get_visible(app_id as u64, snapshot)
    }

    pub fn find_by_key(&self, key: &ProductKey, snapshot: &Snapshot) -> Option<ProductRow> {
        let app_id = self.by_key.get(key)?;
        self.table.get_visible(*app_id as u64, snapshot)
    }

    pub fn enumerate(&self, snapshot: &Snapshot) -> Vec<ProductRow> {
        self.table.scan(snapshot)
    }

    /// Drops the product row, returning it. Callers (C3's `Forget`
    /// operation, §4.3) must first call into the value store to drop
    /// history and decrement stream refcounts for this `app_id` — this
    /// method only removes the product index entry itself. The returned
    /// row lets the caller check `is_legacy` and write the self-product
    /// tombstone the spec requires for legacy products.
    pub fn forget(&mut self, app_id: AppId, snapshot: &Snapshot) -> Result<ProductRow> {
        let row = self.require_row(app_id, snapshot)?;
        self.table.delete(app_id as u64, snapshot.tx_id);
        self.by_key.remove(&row.key);
        Ok(row)
    }

    fn require_row(&self, app_id: AppId, snapshot: &Snapshot) -> Result<ProductRow> {
        self.table
            .get_visible(app_id as u64, snapshot)
            .ok_or_else(|| SettingsError::NotFound(format!("product app_id {app_id}")))
    }
}

impl Default for ProductRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduced-schema admin-context registry (§6): `admin_product_index(id,
/// name, version, public_key)` only — no registered/legacy flags. Used
/// as the fallback for `is_registered` when a product's own row says
/// unregistered but some other installer claimed it machine-wide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminRegistry {
    keys: OrdMap<ProductKey, ()>,
}

impl AdminRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: ProductKey) {
        self.keys.insert(key, ());
    }

    pub fn contains(&self, key: &ProductKey, _snapshot: &Snapshot) -> bool {
        self.keys.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snap(tx_id: u64) -> Snapshot {
        Snapshot {
            tx_id,
            active: Arc::new(im::HashSet::new()),
            aborted: Arc::new(im::HashSet::new()),
            max_tx_id: tx_id + 1,
        }
    }

    fn key(name: &str) -> ProductKey {
        ProductKey::validate(name, "1.0.0.0", "0123456789abcdef").unwrap()
    }

    #[test]
    fn ensure_created_is_idempotent() {
        let mut reg = ProductRegistry::new();
        let s = snap(1);
        let (id1, _) = reg.ensure_created(&key("Contoso.App"), &s).unwrap();
        let (id2, _) = reg.ensure_created(&key("Contoso.App"), &s).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn legacy_public_key_marks_product_legacy() {
        let mut reg = ProductRegistry::new();
        let s = snap(1);
        let legacy_key = ProductKey::validate("Legacy.App", "1.0.0.0", LEGACY_PUBLIC_KEY).unwrap();
        let (_, is_legacy) = reg.ensure_created(&legacy_key, &s).unwrap();
        assert!(is_legacy);
    }

    #[test]
    fn register_rejects_legacy_products() {
        let mut reg = ProductRegistry::new();
        let s = snap(1);
        let legacy_key = ProductKey::validate("Legacy.App", "1.0.0.0", LEGACY_PUBLIC_KEY).unwrap();
        let (id, _) = reg.ensure_created(&legacy_key, &s).unwrap();
        assert!(matches!(reg.register(id, true, &s), Err(SettingsError::AccessDenied(_))));
    }

    #[test]
    fn forget_removes_product_and_frees_key() {
        let mut reg = ProductRegistry::new();
        let s = snap(1);
        let k = key("Contoso.App");
        let (id, _) = reg.ensure_created(&k, &s).unwrap();
        reg.forget(id, &s).unwrap();
        assert!(reg.find_by_key(&k, &s).is_none());
    }

    #[test]
    fn is_registered_falls_back_to_admin() {
        let mut reg = ProductRegistry::new();
        let s = snap(1);
        let k = key("Contoso.App");
        let (id, _) = reg.ensure_created(&k, &s).unwrap();
        let mut admin = AdminRegistry::new();
        admin.add(k.clone());
        assert!(reg.is_registered(id, &s, Some(&admin)));
        assert!(!reg.is_registered(id, &s, None));
    }
}
