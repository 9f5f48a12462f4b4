// ============================================================================
// Embedded store: atomic snapshot persistence
// ============================================================================
//
// Generalizes this codebase's `SnapshotManager` (write to a `.tmp`
// sibling, `sync_all`, `fs::rename`) to an arbitrary serializable
// payload, reused here for both the whole-database snapshot
// (`settings.sdf`) and, via the stream store, individual blob files.
// ============================================================================

use crate::core::{Result, SettingsError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    path: PathBuf,
}

impl SnapshotManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotManager { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec(value)
            .map_err(|e| SettingsError::Corruption(format!("encode snapshot: {e}")))?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = fs::read(&self.path)?;
        rmp_serde::from_slice(&bytes)
            .map_err(|e| SettingsError::Corruption(format!("decode snapshot: {e}")))
    }

    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path().join("snap.bin"));
        let value = Sample {
            a: 7,
            b: "hi".into(),
        };
        mgr.save(&value).unwrap();
        assert!(mgr.exists());
        let loaded: Sample = mgr.load().unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn delete_is_idempotent_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapshotManager::new(dir.path().join("missing.bin"));
        assert!(mgr.delete().is_ok());
    }
}
