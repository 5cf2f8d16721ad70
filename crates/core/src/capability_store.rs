// crates/core/src/capability_store.rs

//! Durable capability library: current versions, append-only archive, and the
//! experience log.
//!
//! Layout under the base path:
//!
//! ```text
//! memory/
//!   capabilities/<name>.json         current version, one per name
//!   archive/<name>/<stamp>.json      superseded versions, never overwritten
//!   experiences.json                 bounded experience log
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{StoreError, StoreResult};
use crate::experience_log::ExperienceLog;
use crate::types::{Candidate, Capability, Experience, Provenance};

/// A superseded capability version, keyed by `(name, stamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    /// Unique within `name`; sorts chronologically.
    pub stamp: String,
    pub archived_at: DateTime<Utc>,
    pub capability: Capability,
}

pub struct CapabilityStore {
    capabilities_dir: PathBuf,
    archive_dir: PathBuf,
    current: RwLock<BTreeMap<String, Arc<Capability>>>,
    archive: RwLock<BTreeMap<String, Vec<ArchiveEntry>>>,
    /// Writers take the lock for their capability name; readers never do.
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    experiences: Mutex<ExperienceLog>,
}

impl CapabilityStore {
    /// Open (or create) the store described by `config`, loading whatever is on disk.
    pub fn open(config: &PipelineConfig) -> StoreResult<Self> {
        let capabilities_dir = config.capabilities_dir();
        let archive_dir = config.archive_dir();
        for dir in [&capabilities_dir, &archive_dir] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }

        let current = load_current(&capabilities_dir)?;
        let archive = load_archive(&archive_dir)?;
        let experiences =
            ExperienceLog::open(config.experiences_file(), config.experience_capacity)?;

        info!(
            capabilities = current.len(),
            archived = archive.values().map(Vec::len).sum::<usize>(),
            experiences = experiences.len(),
            "capability store loaded"
        );

        Ok(Self {
            capabilities_dir,
            archive_dir,
            current: RwLock::new(current),
            archive: RwLock::new(archive),
            name_locks: Mutex::new(HashMap::new()),
            experiences: Mutex::new(experiences),
        })
    }

    // ── Capabilities ────────────────────────────────────────

    /// Most recently committed version of `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Capability>> {
        self.current.read().get(name).cloned()
    }

    /// All current capabilities, ordered by name.
    pub fn list(&self) -> Vec<Arc<Capability>> {
        self.current.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Write `capability` as the current version of its name, as is.
    pub fn put(&self, capability: Capability) -> StoreResult<Arc<Capability>> {
        validate_name(&capability.name)?;
        let lock = self.name_lock(&capability.name);
        let _guard = lock.lock();
        self.put_locked(capability)
    }

    /// Replace the current version of `candidate.name`, archiving what was there.
    ///
    /// The new record gets `version = previous + 1` and keeps the original
    /// `created_at`. Concurrent commits to one name are serialized; the last one
    /// in wins and every replaced version lands in the archive.
    pub fn commit(
        &self,
        candidate: &Candidate,
        provenance: Provenance,
    ) -> StoreResult<Arc<Capability>> {
        validate_name(&candidate.name)?;
        let lock = self.name_lock(&candidate.name);
        let _guard = lock.lock();

        let mut next = Capability::from_candidate(candidate, provenance);
        if let Some(previous) = self.get(&candidate.name) {
            self.archive_locked(&previous)?;
            next.version = previous.version + 1;
            next.created_at = previous.created_at;
        }
        let committed = self.put_locked(next)?;
        info!(
            name = %committed.name,
            version = committed.version,
            provenance = ?committed.provenance,
            "capability committed"
        );
        Ok(committed)
    }

    /// Append a copy of `capability` to the archive.
    pub fn archive(&self, capability: &Capability) -> StoreResult<ArchiveEntry> {
        validate_name(&capability.name)?;
        let lock = self.name_lock(&capability.name);
        let _guard = lock.lock();
        self.archive_locked(capability)
    }

    /// Archive and remove `name`. Returns the removed version, if any.
    pub fn delete(&self, name: &str) -> StoreResult<Option<Arc<Capability>>> {
        validate_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock();

        let Some(existing) = self.get(name) else {
            self.release_name_lock(name, &lock);
            return Ok(None);
        };
        self.archive_locked(&existing)?;

        let path = self.current_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(path, e)),
        }
        self.current.write().remove(name);
        self.release_name_lock(name, &lock);
        info!(name, version = existing.version, "capability deleted");
        Ok(Some(existing))
    }

    /// Archived versions of `name`, oldest first.
    pub fn history(&self, name: &str) -> Vec<ArchiveEntry> {
        self.archive.read().get(name).cloned().unwrap_or_default()
    }

    pub fn archive_len(&self) -> usize {
        self.archive.read().values().map(Vec::len).sum()
    }

    // ── Experiences ─────────────────────────────────────────

    /// Append to the bounded experience log, evicting the oldest entries.
    pub fn record(&self, experience: Experience) -> StoreResult<()> {
        self.experiences.lock().record(experience)
    }

    /// Up to `limit` past experiences most relevant to `text`.
    pub fn query(&self, text: &str, limit: usize) -> Vec<Experience> {
        self.experiences.lock().query(text, limit)
    }

    pub fn experiences(&self) -> Vec<Experience> {
        self.experiences.lock().entries()
    }

    // ── Internal ────────────────────────────────────────────

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock for a deleted name unless another writer holds or waits on it.
    fn release_name_lock(&self, name: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.name_locks.lock();
        // Clones are only handed out under this mutex: two means the map and us.
        if Arc::strong_count(lock) == 2 {
            locks.remove(name);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.name_locks.lock().len()
    }

    fn current_path(&self, name: &str) -> PathBuf {
        self.capabilities_dir.join(format!("{}.json", name))
    }

    /// Caller holds the name lock.
    fn put_locked(&self, capability: Capability) -> StoreResult<Arc<Capability>> {
        let path = self.current_path(&capability.name);
        write_json_atomic(&path, &capability)?;
        let capability = Arc::new(capability);
        self.current
            .write()
            .insert(capability.name.clone(), capability.clone());
        debug!(name = %capability.name, path = %path.display(), "capability written");
        Ok(capability)
    }

    /// Caller holds the name lock.
    fn archive_locked(&self, capability: &Capability) -> StoreResult<ArchiveEntry> {
        let dir = self.archive_dir.join(&capability.name);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let archived_at = Utc::now();
        let base = archived_at.format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let mut entry = ArchiveEntry {
            name: capability.name.clone(),
            stamp: base.clone(),
            archived_at,
            capability: capability.clone(),
        };

        let mut suffix = 0u32;
        loop {
            let path = dir.join(format!("{}.json", entry.stamp));
            match write_json_new(&path, &entry) {
                Ok(()) => break,
                Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    entry.stamp = collision_stamp(&base, suffix);
                }
                Err(e) => return Err(e),
            }
        }

        let mut archive = self.archive.write();
        let versions = archive.entry(entry.name.clone()).or_default();
        versions.push(entry.clone());
        versions.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        drop(archive);

        info!(
            name = %entry.name,
            version = entry.capability.version,
            stamp = %entry.stamp,
            "capability archived"
        );
        Ok(entry)
    }
}

/// Zero-padded so stamps keep sorting in archive order past nine collisions.
fn collision_stamp(base: &str, suffix: u32) -> String {
    format!("{}-{:04}", base, suffix)
}

/// Names become file names, so keep them boring.
pub fn validate_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial record.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Write a file that must not already exist.
fn write_json_new<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(path, e))
}

fn load_current(dir: &Path) -> StoreResult<BTreeMap<String, Arc<Capability>>> {
    let mut current = BTreeMap::new();
    for path in json_files(dir)? {
        match read_json::<Capability>(&path) {
            Some(cap) => {
                current.insert(cap.name.clone(), Arc::new(cap));
            }
            None => continue,
        }
    }
    Ok(current)
}

fn load_archive(dir: &Path) -> StoreResult<BTreeMap<String, Vec<ArchiveEntry>>> {
    let mut archive: BTreeMap<String, Vec<ArchiveEntry>> = BTreeMap::new();
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        for file in json_files(&path)? {
            if let Some(archived) = read_json::<ArchiveEntry>(&file) {
                archive.entry(archived.name.clone()).or_default().push(archived);
            }
        }
    }
    for versions in archive.values_mut() {
        versions.sort_by(|a, b| a.stamp.cmp(&b.stamp));
    }
    Ok(archive)
}

fn json_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Unreadable records are skipped with a warning rather than failing the load.
fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read record");
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse record");
            None
        }
    }
}
