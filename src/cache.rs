//! Last-known position kept across restarts.
//!
//! One record under one well-known key. Read once at cold start, overwritten
//! on every delivered fix.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::TrackerResult;
use crate::types::CachedFix;

/// Well-known key (file name) of the persisted record
pub const CACHE_KEY: &str = "last_known_location.json";

pub trait FixCache: Send + Sync {
    /// Missing or unreadable records both read as `None`.
    fn load(&self) -> Option<CachedFix>;
    fn store(&self, fix: &CachedFix) -> TrackerResult<()>;
}

/// JSON file under a directory
pub struct FileFixCache {
    path: PathBuf,
}

impl FileFixCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileFixCache {
            path: dir.as_ref().join(CACHE_KEY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FixCache for FileFixCache {
    fn load(&self) -> Option<CachedFix> {
        let data = fs::read(&self.path).ok()?;
        match serde_json::from_slice::<CachedFix>(&data) {
            Ok(fix) => Some(fix),
            Err(e) => {
                log::warn!("Ignoring corrupt fix cache {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn store(&self, fix: &CachedFix) -> TrackerResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write-then-rename so a crash mid-write never leaves a torn record
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(fix)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process cache for tests and cache-less runs
#[derive(Default)]
pub struct MemoryFixCache {
    slot: Mutex<Option<CachedFix>>,
}

impl MemoryFixCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fix(fix: CachedFix) -> Self {
        MemoryFixCache {
            slot: Mutex::new(Some(fix)),
        }
    }
}

impl FixCache for MemoryFixCache {
    fn load(&self) -> Option<CachedFix> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    fn store(&self, fix: &CachedFix) -> TrackerResult<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(fix.clone());
        }
        Ok(())
    }
}
