//! ============================================================================
//! CallLogStore - durable call archive over opaque key/value blobs
//! ============================================================================
//! One JSON array of CallLogEntry per chat binding, plus a small JSON map of
//! UI collapse state. The blobs live behind the BlobStorage trait: redb on
//! disk in production (default path ~/.lifeline/callsim.redb, override via
//! LIFELINE_DB_PATH), a HashMap in tests. The store owns the blobs; every
//! other component goes through it.
//!
//! The host can delete transcript turns at any time, so load() re-validates
//! every recorded range against the current transcript length and writes the
//! sanitized list back once instead of re-filtering on every read.
//! ============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use redb::{Database, TableDefinition};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::CallLogEntry;

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

const LOGS_PREFIX: &str = "call_logs:";
const COLLAPSE_PREFIX: &str = "collapse:";

/// Opaque blob persistence. Implementations must be safe to call from any
/// task; all operations are synchronous.
pub trait BlobStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    fn keys(&self) -> Result<Vec<String>>;
}

// ============================================================================
// redb-backed storage
// ============================================================================

/// Embedded database storage for call-log blobs
pub struct RedbStorage {
    db: Database,
    path: PathBuf,
}

impl RedbStorage {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses LIFELINE_DB_PATH env var or
    /// ~/.lifeline/callsim.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("LIFELINE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home =
                dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let dir = home.join(".lifeline");
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Failed to create .lifeline directory: {}", e))?;
            dir.join("callsim.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure the table exists by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to create blobs table: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self { db, path: db_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobStorage for RedbStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(BLOBS)
            .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;

        match table
            .get(key)
            .map_err(|e| anyhow!("Failed to get blob: {}", e))?
        {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn
                .open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;
            table
                .insert(key, value)
                .map_err(|e| anyhow!("Failed to insert blob: {}", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored blob: {}", key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;
            removed = table
                .remove(key)
                .map_err(|e| anyhow!("Failed to remove blob: {}", e))?
                .is_some();
        }
        write_txn
            .commit()
            .map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn
            .open_table(BLOBS)
            .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate blobs: {}", e))?;
        for entry in iter {
            let (key, _value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push(key.value().to_string());
        }
        Ok(results)
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// HashMap-backed storage for tests and ephemeral hosts
#[derive(Default)]
pub struct MemoryStorage {
    map: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.map.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl BlobStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// CallLogStore
// ============================================================================

/// Aggregate statistics for the inspection CLI
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// (binding, entry count) pairs
    pub bindings: Vec<(String, usize)>,
    pub total_entries: usize,
    pub missed_entries: usize,
}

/// Durable archive of call records, scoped to one chat binding
pub struct CallLogStore {
    storage: Arc<dyn BlobStorage>,
    binding: String,
}

impl CallLogStore {
    pub fn new(storage: Arc<dyn BlobStorage>, binding: &str) -> Self {
        Self {
            storage,
            binding: binding.to_string(),
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    fn logs_key(&self) -> String {
        format!("{}{}", LOGS_PREFIX, self.binding)
    }

    fn collapse_key(&self) -> String {
        format!("{}{}", COLLAPSE_PREFIX, self.binding)
    }

    /// Load the archive, dropping entries whose recorded range no longer fits
    /// a transcript of `transcript_len` turns. Missed/rejected entries have no
    /// range and always survive. When anything was dropped the sanitized list
    /// is written back immediately, so the correction happens once.
    pub fn load(&self, transcript_len: usize) -> Result<Vec<CallLogEntry>> {
        let entries = match self.storage.read(&self.logs_key())? {
            Some(bytes) => serde_json::from_slice::<Vec<CallLogEntry>>(&bytes)
                .map_err(|e| anyhow!("Corrupt call-log blob for '{}': {}", self.binding, e))?,
            None => return Ok(Vec::new()),
        };

        let before = entries.len();
        let sanitized: Vec<CallLogEntry> = entries
            .into_iter()
            .filter(|entry| match entry.transcript_range {
                Some(range) => range.is_valid_for(transcript_len),
                None => true,
            })
            .collect();

        if sanitized.len() != before {
            info!(
                "Pruned {} stale call-log entries for '{}'",
                before - sanitized.len(),
                self.binding
            );
            self.save(&sanitized)?;
        }

        Ok(sanitized)
    }

    /// Persist the list verbatim
    pub fn save(&self, entries: &[CallLogEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)
            .map_err(|e| anyhow!("Failed to serialize call log: {}", e))?;
        self.storage.write(&self.logs_key(), &bytes)
    }

    /// load + push + save
    pub fn append(&self, entry: CallLogEntry, transcript_len: usize) -> Result<()> {
        let mut entries = self.load(transcript_len)?;
        debug!(
            "Appending call log for '{}' (missed={})",
            entry.contact_name, entry.missed
        );
        entries.push(entry);
        self.save(&entries)
    }

    pub fn find(&self, id: Uuid, transcript_len: usize) -> Result<Option<CallLogEntry>> {
        Ok(self
            .load(transcript_len)?
            .into_iter()
            .find(|entry| entry.id == id))
    }

    /// Apply `mutate` to the entry with `id`. Returns false when no such
    /// entry exists. Only `summary` and `include_in_context` are meant to
    /// change after creation; callers enforce that.
    pub fn update<F>(&self, id: Uuid, transcript_len: usize, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut CallLogEntry),
    {
        let mut entries = self.load(transcript_len)?;
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) else {
            return Ok(false);
        };
        mutate(entry);
        self.save(&entries)?;
        Ok(true)
    }

    /// Remove the entry with `id`. Returns false when absent.
    pub fn delete(&self, id: Uuid, transcript_len: usize) -> Result<bool> {
        let mut entries = self.load(transcript_len)?;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    // ========================================================================
    // UI collapse state
    // ========================================================================

    pub fn load_collapse_state(&self) -> Result<HashMap<String, bool>> {
        match self.storage.read(&self.collapse_key())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| anyhow!("Corrupt collapse-state blob: {}", e)),
            None => Ok(HashMap::new()),
        }
    }

    pub fn save_collapse_state(&self, state: &HashMap<String, bool>) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| anyhow!("Failed to serialize collapse state: {}", e))?;
        self.storage.write(&self.collapse_key(), &bytes)
    }

    // ========================================================================
    // Inspection (CLI)
    // ========================================================================

    /// All bindings that have a call-log blob in `storage`
    pub fn bindings(storage: &dyn BlobStorage) -> Result<Vec<String>> {
        Ok(storage
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(LOGS_PREFIX).map(str::to_string))
            .collect())
    }

    /// Aggregate counts across every binding in `storage`
    pub fn stats(storage: &dyn BlobStorage) -> Result<StoreStats> {
        let mut bindings = Vec::new();
        let mut total = 0;
        let mut missed = 0;

        for binding in Self::bindings(storage)? {
            let key = format!("{}{}", LOGS_PREFIX, binding);
            let entries: Vec<CallLogEntry> = match storage.read(&key)? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| anyhow!("Corrupt call-log blob for '{}': {}", binding, e))?,
                None => Vec::new(),
            };
            total += entries.len();
            missed += entries.iter().filter(|entry| entry.missed).count();
            bindings.push((binding, entries.len()));
        }

        Ok(StoreStats {
            bindings,
            total_entries: total,
            missed_entries: missed,
        })
    }
}
