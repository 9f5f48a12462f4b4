//! Change-stamp file (§4.5 "Change stamp"): a sibling hidden, zero-byte
//! file whose mtime is rewritten on every lock release that detected a
//! schema change, so that peer monitors (C7) get a reliable
//! "there is new content" trigger even on filesystems whose mtime
//! granularity exceeds the write interval.

use crate::core::Result;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

const SPIN_SLEEP: Duration = Duration::from_millis(100);

/// Rewrites `path`'s mtime, spinning until it is observably different
/// from before the call (bounded by `max_attempts` to avoid looping
/// forever on filesystems that don't update mtime at all).
pub fn bump(path: &Path) -> Result<()> {
    let before = fs::metadata(path).ok().and_then(|m| m.modified().ok());

    const MAX_ATTEMPTS: u32 = 50;
    for attempt in 0..MAX_ATTEMPTS {
        fs::write(path, [])?;
        let after = fs::metadata(path)?.modified()?;
        if before != Some(after) {
            return Ok(());
        }
        if attempt + 1 < MAX_ATTEMPTS {
            thread::sleep(SPIN_SLEEP);
        }
    }
    tracing::warn!(path = %path.display(), "changes stamp mtime did not advance after max attempts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_creates_and_touches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.changes");
        bump(&path).unwrap();
        assert!(path.exists());
        let first = fs::metadata(&path).unwrap().modified().unwrap();
        bump(&path).unwrap();
        let second = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(second >= first);
    }
}
