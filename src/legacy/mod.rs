//! Legacy-product adapter (§4.8, external collaborator, sketched).
//!
//! Projects filesystem/registry state into and out of the C4 value
//! model for products that were never registered through the generic
//! API (`PublicKey = "0000000000000000"`, §4.3). The real Windows
//! registry and MSI installed-product registry are not portable
//! collaborators for this codebase, so the adapter is built against two
//! small traits with in-memory test doubles; the manifest format is a
//! plain serde struct rather than the original's compiled XML schema,
//! since that parser is itself out of scope (§1).

use crate::core::Result;
use crate::handle::DatabaseHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Where one manifest entry's value lives outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestSource {
    RegistryDword { key_path: String, value_name: String },
    RegistryString { key_path: String, value_name: String },
    File { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The value name this entry maps to inside the engine.
    pub value_name: String,
    pub source: ManifestSource,
}

/// A legacy product's manifest: which paths/registry values map to
/// which value names (§4.8 "reads the product's manifest").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyManifest {
    pub entries: Vec<ManifestEntry>,
}

/// Backing store for `File` manifest entries.
pub trait LegacyFilesystemSource: Send + Sync {
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;
    fn write_file(&self, path: &str, data: &[u8]);
}

/// Backing store for `RegistryDword`/`RegistryString` manifest entries.
pub trait LegacyRegistrySource: Send + Sync {
    fn read_dword(&self, key_path: &str, value_name: &str) -> Option<u32>;
    fn write_dword(&self, key_path: &str, value_name: &str, value: u32);
    fn read_string(&self, key_path: &str, value_name: &str) -> Option<String>;
    fn write_string(&self, key_path: &str, value_name: &str, value: &str);
}

/// Reads every manifest entry from its source and writes the observed
/// datum into `handle` as a value (§4.8 "On pull"). `handle` must
/// already have the legacy product selected via `set_product`. Value
/// names present in a prior pull but absent from this one are
/// tombstoned, mirroring the `values_seen` bookkeeping described in the
/// spec.
pub fn pull(
    handle: &DatabaseHandle,
    manifest: &LegacyManifest,
    fs: &dyn LegacyFilesystemSource,
    registry: &dyn LegacyRegistrySource,
) -> Result<()> {
    let mut values_seen = HashSet::new();

    for entry in &manifest.entries {
        let observed = match &entry.source {
            ManifestSource::RegistryDword { key_path, value_name } => {
                match registry.read_dword(key_path, value_name) {
                    Some(v) => {
                        handle.set_dword(&entry.value_name, v)?;
                        true
                    }
                    None => false,
                }
            }
            ManifestSource::RegistryString { key_path, value_name } => {
                match registry.read_string(key_path, value_name) {
                    Some(v) => {
                        handle.set_string(&entry.value_name, v)?;
                        true
                    }
                    None => false,
                }
            }
            ManifestSource::File { path } => match fs.read_file(path) {
                Some(bytes) => {
                    handle.set_blob(&entry.value_name, &bytes)?;
                    true
                }
                None => false,
            },
        };
        if observed {
            values_seen.insert(entry.value_name.clone());
        }
    }

    let manifest_names: HashSet<&str> = manifest.entries.iter().map(|e| e.value_name.as_str()).collect();
    for row in handle.enumerate_values()? {
        if manifest_names.contains(row.name.as_str()) && !values_seen.contains(&row.name) {
            handle.delete_value(&row.name)?;
        }
    }

    Ok(())
}

/// Writes every non-tombstone current value tagged by the manifest back
/// out to its registry/filesystem source (§4.8 "On push").
pub fn push(
    handle: &DatabaseHandle,
    manifest: &LegacyManifest,
    fs: &dyn LegacyFilesystemSource,
    registry: &dyn LegacyRegistrySource,
) -> Result<()> {
    for entry in &manifest.entries {
        let value = match handle.get_value(&entry.value_name) {
            Ok(v) => v,
            Err(crate::core::SettingsError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        match (&entry.source, &value) {
            (ManifestSource::RegistryDword { key_path, value_name }, crate::core::Value::Dword(v)) => {
                registry.write_dword(key_path, value_name, *v);
            }
            (ManifestSource::RegistryString { key_path, value_name }, crate::core::Value::String(v)) => {
                registry.write_string(key_path, value_name, v);
            }
            (ManifestSource::File { path }, crate::core::Value::Blob(blob)) => {
                let bytes = handle.read_blob(blob)?;
                fs.write_file(path, &bytes);
            }
            _ => {
                return Err(crate::core::SettingsError::TypeMismatch {
                    expected: "value matching manifest entry's source kind".into(),
                    found: format!("{value:?}"),
                });
            }
        }
    }
    Ok(())
}

/// In-memory [`LegacyFilesystemSource`] test double.
#[derive(Default)]
pub struct InMemoryFilesystemSource {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryFilesystemSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), data);
    }
}

impl LegacyFilesystemSource for InMemoryFilesystemSource {
    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn write_file(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }
}

/// In-memory [`LegacyRegistrySource`] test double.
#[derive(Default)]
pub struct InMemoryRegistrySource {
    dwords: Mutex<HashMap<(String, String), u32>>,
    strings: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryRegistrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_dword(&self, key_path: &str, value_name: &str, value: u32) {
        self.dwords.lock().unwrap().insert((key_path.to_string(), value_name.to_string()), value);
    }

    pub fn seed_string(&self, key_path: &str, value_name: &str, value: impl Into<String>) {
        self.strings
            .lock()
            .unwrap()
            .insert((key_path.to_string(), value_name.to_string()), value.into());
    }
}

impl LegacyRegistrySource for InMemoryRegistrySource {
    fn read_dword(&self, key_path: &str, value_name: &str) -> Option<u32> {
        self.dwords.lock().unwrap().get(&(key_path.to_string(), value_name.to_string())).copied()
    }

    fn write_dword(&self, key_path: &str, value_name: &str, value: u32) {
        self.dwords
            .lock()
            .unwrap()
            .insert((key_path.to_string(), value_name.to_string()), value);
    }

    fn read_string(&self, key_path: &str, value_name: &str) -> Option<String> {
        self.strings.lock().unwrap().get(&(key_path.to_string(), value_name.to_string())).cloned()
    }

    fn write_string(&self, key_path: &str, value_name: &str, value: &str) {
        self.strings
            .lock()
            .unwrap()
            .insert((key_path.to_string(), value_name.to_string()), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProductKey;

    fn legacy_key() -> ProductKey {
        ProductKey::validate("Acme.Legacy", "2.1.0.0", crate::core::types::LEGACY_PUBLIC_KEY).unwrap()
    }

    fn manifest() -> LegacyManifest {
        LegacyManifest {
            entries: vec![
                ManifestEntry {
                    value_name: "Volume".to_string(),
                    source: ManifestSource::RegistryDword {
                        key_path: r"HKCU\Software\Acme".to_string(),
                        value_name: "Volume".to_string(),
                    },
                },
                ManifestEntry {
                    value_name: "UserName".to_string(),
                    source: ManifestSource::RegistryString {
                        key_path: r"HKCU\Software\Acme".to_string(),
                        value_name: "UserName".to_string(),
                    },
                },
                ManifestEntry {
                    value_name: "Profile".to_string(),
                    source: ManifestSource::File {
                        path: "C:/Acme/profile.dat".to_string(),
                    },
                },
            ],
        }
    }

    #[test]
    fn pull_projects_observed_sources_into_values() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DatabaseHandle::init(dir.path(), false, 4096).unwrap();
        handle.set_product(&legacy_key()).unwrap();

        let registry = InMemoryRegistrySource::new();
        registry.seed_dword(r"HKCU\Software\Acme", "Volume", 55);
        registry.seed_string(r"HKCU\Software\Acme", "UserName", "ana");
        let fs = InMemoryFilesystemSource::new();
        fs.seed("C:/Acme/profile.dat", vec![1, 2, 3]);

        pull(&handle, &manifest(), &fs, &registry).unwrap();

        assert_eq!(handle.get_value("Volume").unwrap().as_dword().unwrap(), 55);
        assert_eq!(handle.get_value("UserName").unwrap().as_string().unwrap(), "ana");
        let blob = handle.get_value("Profile").unwrap();
        if let crate::core::Value::Blob(b) = blob {
            assert_eq!(handle.read_blob(&b).unwrap(), vec![1, 2, 3]);
        } else {
            panic!("expected blob value");
        }
    }

    #[test]
    fn pull_tombstones_values_missing_from_a_later_pass() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DatabaseHandle::init(dir.path(), false, 4096).unwrap();
        handle.set_product(&legacy_key()).unwrap();

        let registry = InMemoryRegistrySource::new();
        registry.seed_dword(r"HKCU\Software\Acme", "Volume", 55);
        registry.seed_string(r"HKCU\Software\Acme", "UserName", "ana");
        let fs = InMemoryFilesystemSource::new();
        fs.seed("C:/Acme/profile.dat", vec![1, 2, 3]);
        pull(&handle, &manifest(), &fs, &registry).unwrap();

        // second pass: the registry value disappeared (uninstalled a feature)
        let registry2 = InMemoryRegistrySource::new();
        registry2.seed_string(r"HKCU\Software\Acme", "UserName", "ana");
        let fs2 = InMemoryFilesystemSource::new();
        fs2.seed("C:/Acme/profile.dat", vec![1, 2, 3]);
        pull(&handle, &manifest(), &fs2, &registry2).unwrap();

        assert!(handle.get_value("Volume").is_err());
    }

    #[test]
    fn push_routes_values_back_to_their_sources() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DatabaseHandle::init(dir.path(), false, 4096).unwrap();
        handle.set_product(&legacy_key()).unwrap();
        handle.set_dword("Volume", 80).unwrap();
        handle.set_string("UserName", "bea").unwrap();
        handle.set_blob("Profile", &[9, 9, 9]).unwrap();

        let registry = InMemoryRegistrySource::new();
        let fs = InMemoryFilesystemSource::new();
        push(&handle, &manifest(), &fs, &registry).unwrap();

        assert_eq!(registry.read_dword(r"HKCU\Software\Acme", "Volume"), Some(80));
        assert_eq!(registry.read_string(r"HKCU\Software\Acme", "UserName").as_deref(), Some("bea"));
        assert_eq!(fs.read_file("C:/Acme/profile.dat"), Some(vec![9, 9, 9]));
    }
}
