//! Persisted harvest state: fingerprint cache + record store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcd_core::ContractorRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rcd-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the full document via a temp file in the same directory, then rename.
/// A crash mid-write leaves the previous document intact.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes).map_err(|e| io_err(&temp_path, e))?;
    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(io_err(path, err))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    last_modified: String,
}

/// On-disk shape: `{"contractors": {"<id>": {"last_modified": ...}}, "last_update": {}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    contractors: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    last_update: BTreeMap<String, String>,
}

/// Change-detection cache mapping contractor ids to opaque fingerprints.
///
/// Write-through: every `update` and `clear` persists the whole document
/// immediately. Acceptable while item counts stay in the low thousands.
#[derive(Debug)]
pub struct FingerprintCache {
    path: PathBuf,
    doc: CacheDocument,
}

impl FingerprintCache {
    /// Load the cache, substituting an empty one when the file is missing or
    /// unreadable. A corrupt cache costs a full re-fetch, never a failed run.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable fingerprint cache, starting empty");
                    CacheDocument::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CacheDocument::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read fingerprint cache, starting empty");
                CacheDocument::default()
            }
        };
        Self { path, doc }
    }

    pub fn get(&self, contractor_id: &str) -> Option<&str> {
        self.doc
            .contractors
            .get(contractor_id)
            .map(|entry| entry.last_modified.as_str())
    }

    /// True when no fingerprint is cached for the id, the page exposed none,
    /// or the cached one differs from `current`. String inequality only; the
    /// fingerprint is never interpreted.
    pub fn needs_update(&self, contractor_id: &str, current: Option<&str>) -> bool {
        match (self.get(contractor_id), current) {
            (Some(cached), Some(current)) => cached != current,
            _ => true,
        }
    }

    /// Record a fingerprint and persist immediately. Call only after the
    /// detail fetch for this id succeeded; updating earlier would mask a
    /// future retry.
    pub fn update(&mut self, contractor_id: &str, fingerprint: &str) -> Result<(), StorageError> {
        self.doc.contractors.insert(
            contractor_id.to_string(),
            CacheEntry {
                last_modified: fingerprint.to_string(),
            },
        );
        self.persist()
    }

    /// Reset to an empty mapping and persist.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.doc = CacheDocument::default();
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.doc.contractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.contractors.is_empty()
    }

    fn persist(&self) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(&self.doc).map_err(|e| StorageError::Serialize {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes)
    }
}

/// Persisted collection of harvested records, a JSON array keyed by
/// contractor id and written as a complete replacement on every save.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All persisted records; a missing file is an empty collection.
    pub fn read_all(&self) -> Result<Vec<ContractorRecord>, StorageError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&text) {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable record store, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Idempotent upsert: records in `batch` overwrite or insert by id,
    /// everything else is preserved unchanged. A batch record without an
    /// insight keeps the stored record's prior insight, since the crawl never
    /// produces that field.
    pub fn merge(&self, batch: Vec<ContractorRecord>) -> Result<usize, StorageError> {
        let mut by_id: BTreeMap<String, ContractorRecord> = self
            .read_all()?
            .into_iter()
            .map(|r| (r.contractor_id.clone(), r))
            .collect();

        for mut record in batch {
            if record.ai_insight.is_none() {
                if let Some(existing) = by_id.get(&record.contractor_id) {
                    record.ai_insight = existing.ai_insight.clone();
                }
            }
            by_id.insert(record.contractor_id.clone(), record);
        }

        let merged: Vec<ContractorRecord> = by_id.into_values().collect();
        self.write_all(&merged)?;
        Ok(merged.len())
    }

    /// Replace the whole collection, used by the insight enrichment pass.
    pub fn write_all(&self, records: &[ContractorRecord]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(records).map_err(|e| StorageError::Serialize {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes)
    }
}

/// Bounded retry with exponential backoff, shared by navigation recovery.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rcd_core::DetailFields;
    use tempfile::tempdir;

    fn mk_record(id: &str, name: &str) -> ContractorRecord {
        ContractorRecord {
            contractor_id: id.to_string(),
            profile_url: format!("https://example.com/roofing-contractors/{name}-{id}"),
            name: Some(name.to_string()),
            rating: None,
            location: None,
            phone: None,
            detail: DetailFields::default(),
            last_modified: None,
            last_updated: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap(),
            ai_insight: None,
        }
    }

    #[test]
    fn empty_cache_always_needs_update() {
        let dir = tempdir().expect("tempdir");
        let cache = FingerprintCache::load_or_default(dir.path().join("cache.json"));
        assert!(cache.needs_update("123", Some("2024-01-01T00:00Z")));
        assert!(cache.needs_update("123", None));
    }

    #[test]
    fn fingerprint_gating_truth_table() {
        let dir = tempdir().expect("tempdir");
        let mut cache = FingerprintCache::load_or_default(dir.path().join("cache.json"));
        cache.update("123", "2024-01-01").expect("update");

        assert!(!cache.needs_update("123", Some("2024-01-01")));
        assert!(cache.needs_update("123", Some("2024-02-01")));
        assert!(cache.needs_update("123", None));
        assert!(cache.needs_update("456", Some("2024-01-01")));
    }

    #[test]
    fn cache_survives_reload_and_clear_forgets_everything() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");

        let mut cache = FingerprintCache::load_or_default(&path);
        cache.update("7", "fp-a").expect("update");
        cache.update("8", "fp-b").expect("update");

        let reloaded = FingerprintCache::load_or_default(&path);
        assert_eq!(reloaded.get("7"), Some("fp-a"));
        assert_eq!(reloaded.len(), 2);

        let mut cache = reloaded;
        cache.clear().expect("clear");
        assert!(cache.is_empty());
        assert!(cache.needs_update("7", Some("fp-a")));

        let after_clear = FingerprintCache::load_or_default(&path);
        assert!(after_clear.is_empty());
    }

    #[test]
    fn corrupt_cache_file_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{not json").expect("write");

        let cache = FingerprintCache::load_or_default(&path);
        assert!(cache.is_empty());
        assert!(cache.needs_update("123", Some("anything")));
    }

    #[test]
    fn cache_disk_shape_matches_contract() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        let mut cache = FingerprintCache::load_or_default(&path);
        cache.update("10432", "2024-01-01T00:00:00Z").expect("update");

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(
            value["contractors"]["10432"]["last_modified"],
            "2024-01-01T00:00:00Z"
        );
        assert!(value["last_update"].is_object());
    }

    #[test]
    fn merge_upserts_and_preserves_untouched_records() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("contractors.json"));
        store
            .write_all(&[mk_record("1", "A"), mk_record("3", "C")])
            .expect("seed");

        let untouched_before = store.read_all().expect("read")[1].clone();

        let mut updated = mk_record("1", "A2");
        updated.rating = Some("4.9".into());
        store
            .merge(vec![updated.clone(), mk_record("2", "B")])
            .expect("merge");

        let all = store.read_all().expect("read");
        assert_eq!(all.len(), 3);
        let ids: Vec<&str> = all.iter().map(|r| r.contractor_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(all[0].name.as_deref(), Some("A2"));
        assert_eq!(all[0].rating.as_deref(), Some("4.9"));
        assert_eq!(all[2], untouched_before);
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("contractors.json"));
        let batch = vec![mk_record("1", "A"), mk_record("2", "B")];

        store.merge(batch.clone()).expect("first merge");
        let first = fs::read(store.path()).expect("read bytes");
        store.merge(batch).expect("second merge");
        let second = fs::read(store.path()).expect("read bytes");

        assert_eq!(first, second);
    }

    #[test]
    fn merge_keeps_prior_insight_when_batch_has_none() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("contractors.json"));
        let mut enriched = mk_record("1", "A");
        enriched.ai_insight = Some("Established, well reviewed.".into());
        store.write_all(&[enriched]).expect("seed");

        store.merge(vec![mk_record("1", "A2")]).expect("merge");

        let all = store.read_all().expect("read");
        assert_eq!(all[0].name.as_deref(), Some("A2"));
        assert_eq!(all[0].ai_insight.as_deref(), Some("Established, well reviewed."));
    }

    #[test]
    fn missing_store_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("contractors.json"));
        assert!(store.read_all().expect("read").is_empty());
    }

    #[test]
    fn retry_delays_are_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }
}
