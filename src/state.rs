//! File-backed state store
//!
//! Every successful write rewrites the whole TOML file (temp file + rename),
//! so a run that stops halfway still leaves what it did on disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use declarative::{RemoteResourceState, ResourceId, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

// ============================================================================
// State File
// ============================================================================

/// On-disk layout of the state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// Incremented on every write
    pub serial: u64,

    /// Last time the state was written
    pub last_updated: DateTime<Utc>,

    /// Recorded resources, ordered by identity
    #[serde(default)]
    pub resources: Vec<RemoteResourceState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            serial: 0,
            last_updated: Utc::now(),
            resources: Vec::new(),
        }
    }
}

impl StateFile {
    /// Load state from disk, or return default if file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("State file {} does not exist, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!(
            "Loaded {} resource(s) from {} (serial {})",
            state.resources.len(),
            path.display(),
            state.serial
        );
        Ok(state)
    }

    /// Save state to disk atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize state to TOML")?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, &content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        log::trace!("Saved state serial {} to {}", self.serial, path.display());
        Ok(())
    }
}

// ============================================================================
// FileStateStore
// ============================================================================

/// [`StateStore`] persisted to a TOML file on every change
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    serial: u64,
    entries: BTreeMap<ResourceId, RemoteResourceState>,
}

impl FileStateStore {
    /// Open (or start) the state file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = StateFile::load(&path)?;
        let entries = file
            .resources
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                serial: file.serial,
                entries,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of writes since the file was created
    pub fn serial(&self) -> u64 {
        self.lock().serial
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        StateFile {
            serial: inner.serial,
            last_updated: Utc::now(),
            resources: inner.entries.values().cloned().collect(),
        }
        .save(&self.path)
    }
}

impl StateStore for FileStateStore {
    fn get(&self, id: &ResourceId) -> declarative::Result<Option<RemoteResourceState>> {
        Ok(self.lock().entries.get(id).cloned())
    }

    fn list(&self) -> declarative::Result<Vec<RemoteResourceState>> {
        Ok(self.lock().entries.values().cloned().collect())
    }

    fn update(
        &self,
        id: &ResourceId,
        apply: &mut dyn FnMut(Option<RemoteResourceState>) -> Option<RemoteResourceState>,
    ) -> declarative::Result<Option<RemoteResourceState>> {
        // The lock is held across the write so concurrent updates serialize
        let mut inner = self.lock();
        let current = inner.entries.get(id).cloned();
        let next = apply(current.clone());
        if next == current {
            return Ok(next);
        }

        let previous = match &next {
            Some(entry) => inner.entries.insert(id.clone(), entry.clone()),
            None => inner.entries.remove(id),
        };
        inner.serial += 1;

        if let Err(e) = self.persist(&inner) {
            // Keep memory and disk in agreement
            inner.serial -= 1;
            match previous {
                Some(entry) => inner.entries.insert(id.clone(), entry),
                None => inner.entries.remove(id),
            };
            return Err(declarative::Error::StateStore(format!("{e:#}")));
        }
        Ok(next)
    }
}

// ============================================================================
// Tests
// ============================================================================
