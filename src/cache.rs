//! On-disk response cache.
//!
//! Entries are keyed by prompt fingerprint and kept in an `index.json` file
//! next to the artifacts they reference. The in-memory index sits behind a
//! `RwLock`: lookups share the read side and only bump an atomic recency
//! tick, while inserts and evictions take the write side.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::diagram::DiagramSpec;
use crate::export::{write_atomic, Artifact, ExportError, StagedArtifacts};
use crate::layout::LayoutGraph;
use crate::prompt::Fingerprint;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize cache index: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheLimits {
    pub max_entries: usize,
    /// Total size of the artifacts referenced by live entries.
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_bytes: 256 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// One finished pipeline run. Never mutated once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub prompt: String,
    /// Digest of the settings the entry was rendered under.
    pub settings_digest: String,
    pub spec: DiagramSpec,
    pub layout: LayoutGraph,
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.bytes).sum()
    }

    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.created_at > max_age,
            Err(_) => false,
        }
    }

    fn artifacts_present(&self) -> bool {
        self.artifacts.iter().all(|a| a.path.is_file())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// A stale entry (expired or rendered under other settings) was replaced.
    Replaced,
    /// A current entry already existed; the first writer wins.
    Discarded,
    /// Larger than the byte limit on its own. The artifacts were written but
    /// the entry is not indexed.
    Uncached,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

struct Slot {
    entry: Arc<CacheEntry>,
    last_used: AtomicU64,
}

impl Slot {
    fn new(entry: Arc<CacheEntry>, tick: u64) -> Self {
        Self {
            entry,
            last_used: AtomicU64::new(tick),
        }
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

#[derive(Serialize, Deserialize)]
struct IndexRecord<E> {
    last_used: u64,
    entry: E,
}

#[derive(Serialize, Deserialize)]
struct IndexFile<E> {
    version: u32,
    entries: Vec<IndexRecord<E>>,
}

pub struct ResponseCache {
    dir: PathBuf,
    limits: CacheLimits,
    index: RwLock<HashMap<Fingerprint, Slot>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Loads the index from `dir`, creating the directory if needed. A corrupt
    /// index is replaced by an empty one; entries whose artifacts are gone or
    /// that have expired are dropped.
    #[instrument(skip(limits))]
    pub fn open(dir: &Path, limits: CacheLimits) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let index_path = dir.join(INDEX_FILE);
        let records = match std::fs::read(&index_path) {
            Ok(raw) => match serde_json::from_slice::<IndexFile<CacheEntry>>(&raw) {
                Ok(file) => file.entries,
                Err(e) => {
                    warn!("Cache index {} is corrupt ({}), starting empty", index_path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(CacheError::Io {
                    path: index_path,
                    source,
                })
            }
        };

        let now = Utc::now();
        let loaded = records.len();
        let mut index = HashMap::with_capacity(loaded);
        let mut tick = 0;
        for record in records {
            let entry = record.entry;
            if entry.is_expired(limits.max_age, now) {
                debug!(fingerprint = %entry.fingerprint.short(), "Dropping expired entry");
                continue;
            }
            if !entry.artifacts_present() {
                warn!(fingerprint = %entry.fingerprint.short(), "Dropping entry with missing artifacts");
                continue;
            }
            tick = tick.max(record.last_used);
            index.insert(entry.fingerprint.clone(), Slot::new(Arc::new(entry), record.last_used));
        }

        let kept = index.len();
        info!("Opened response cache with {} entries", kept);
        if kept != loaded {
            persist_index(dir, &index)?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            limits,
            index: RwLock::new(index),
            tick: AtomicU64::new(tick),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Live entry for `fingerprint`. Expired entries count as misses and are
    /// swept on the next `put`.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let index = self.index.read().await;
        let found = index
            .get(fingerprint)
            .filter(|slot| !slot.entry.is_expired(self.limits.max_age, Utc::now()));
        match found {
            Some(slot) => {
                slot.last_used.store(self.next_tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&slot.entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores an entry whose artifacts are already at their final paths.
    pub async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, CacheError> {
        self.put_staged(entry, StagedArtifacts::default())
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Stores `entry` and, while the write lock is held, moves `staged` onto
    /// the artifact paths it names. A discarded result never touches the
    /// files of the entry that won; its staged files are deleted instead.
    ///
    /// Returns the entry now describing the fingerprint's files: the earlier
    /// one when this result is discarded.
    #[instrument(skip_all, fields(fingerprint = %entry.fingerprint.short()))]
    pub async fn put_staged(
        &self,
        entry: CacheEntry,
        staged: StagedArtifacts,
    ) -> Result<(PutOutcome, Arc<CacheEntry>), CacheError> {
        let now = Utc::now();
        let mut index = self.index.write().await;

        let outcome = match index.get(&entry.fingerprint) {
            Some(slot)
                if slot.entry.settings_digest == entry.settings_digest
                    && !slot.entry.is_expired(self.limits.max_age, now) =>
            {
                debug!("Entry already cached, discarding the later result");
                slot.last_used.store(self.next_tick(), Ordering::Relaxed);
                return Ok((PutOutcome::Discarded, Arc::clone(&slot.entry)));
            }
            Some(_) => PutOutcome::Replaced,
            None => PutOutcome::Inserted,
        };

        let fingerprint = entry.fingerprint.clone();
        let mut removed: Vec<Arc<CacheEntry>> = index
            .remove(&fingerprint)
            .map(|old| old.entry)
            .into_iter()
            .collect();

        if let Err(e) = staged.commit() {
            // The stale entry's files may already be overwritten.
            remove_orphaned_artifacts(&index, &removed, &[]);
            persist_index(&self.dir, &index)?;
            return Err(cache_io_error(e, &self.dir));
        }

        let entry = Arc::new(entry);
        let outcome = if entry.bytes() > self.limits.max_bytes {
            warn!(
                bytes = entry.bytes(),
                limit = self.limits.max_bytes,
                "Result is larger than the whole cache, not caching it"
            );
            PutOutcome::Uncached
        } else {
            index.insert(fingerprint.clone(), Slot::new(Arc::clone(&entry), self.next_tick()));
            outcome
        };
        removed.extend(self.evict(&mut index, now, &fingerprint));
        remove_orphaned_artifacts(&index, &removed, &entry.artifacts);

        if let Err(e) = persist_index(&self.dir, &index) {
            if index.remove(&fingerprint).is_some() {
                remove_orphaned_artifacts(&index, &[Arc::clone(&entry)], &[]);
            }
            return Err(e);
        }
        debug!(?outcome, entries = index.len(), "Cached result");
        Ok((outcome, entry))
    }

    /// Drops expired entries, then least-recently-used ones until both the
    /// entry and byte limits hold. `keep` is never evicted.
    fn evict(
        &self,
        index: &mut HashMap<Fingerprint, Slot>,
        now: DateTime<Utc>,
        keep: &Fingerprint,
    ) -> Vec<Arc<CacheEntry>> {
        let mut removed = Vec::new();

        let expired: Vec<Fingerprint> = index
            .iter()
            .filter(|(fp, slot)| *fp != keep && slot.entry.is_expired(self.limits.max_age, now))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in expired {
            if let Some(slot) = index.remove(&fp) {
                debug!(fingerprint = %fp.short(), "Evicting expired entry");
                removed.push(slot.entry);
            }
        }

        let mut bytes: u64 = index.values().map(|slot| slot.entry.bytes()).sum();
        while index.len() > self.limits.max_entries || bytes > self.limits.max_bytes {
            let Some(oldest) = index
                .iter()
                .filter(|(fp, _)| *fp != keep)
                .min_by(|(a_fp, a), (b_fp, b)| a.last_used().cmp(&b.last_used()).then_with(|| a_fp.cmp(b_fp)))
                .map(|(fp, _)| fp.clone())
            else {
                break;
            };
            if let Some(slot) = index.remove(&oldest) {
                info!(fingerprint = %oldest.short(), bytes = slot.entry.bytes(), "Evicting least recently used entry");
                bytes = bytes.saturating_sub(slot.entry.bytes());
                removed.push(slot.entry);
            }
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.read().await;
        CacheStats {
            entries: index.len(),
            bytes: index.values().map(|slot| slot.entry.bytes()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Removes every entry and its artifacts. Returns how many entries went.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut index = self.index.write().await;
        let removed: Vec<Arc<CacheEntry>> = index.drain().map(|(_, slot)| slot.entry).collect();
        remove_orphaned_artifacts(&index, &removed, &[]);
        persist_index(&self.dir, &index)?;
        info!("Cleared {} cache entries", removed.len());
        Ok(removed.len())
    }
}

fn persist_index(dir: &Path, index: &HashMap<Fingerprint, Slot>) -> Result<(), CacheError> {
    let mut entries: Vec<IndexRecord<&CacheEntry>> = index
        .values()
        .map(|slot| IndexRecord {
            last_used: slot.last_used(),
            entry: slot.entry.as_ref(),
        })
        .collect();
    entries.sort_by(|a, b| a.entry.fingerprint.cmp(&b.entry.fingerprint));
    let json = serde_json::to_vec_pretty(&IndexFile { version: 1, entries })?;
    write_atomic(dir, INDEX_FILE, &json).map_err(|e| cache_io_error(e, &dir.join(INDEX_FILE)))?;
    Ok(())
}

fn cache_io_error(err: ExportError, fallback: &Path) -> CacheError {
    match err {
        ExportError::WriteFailure { path, source } => CacheError::Io { path, source },
        other => CacheError::Io {
            path: fallback.to_path_buf(),
            source: std::io::Error::other(other.to_string()),
        },
    }
}

/// Deletes artifact files of `removed` entries that neither a live entry nor
/// `also_live` references.
fn remove_orphaned_artifacts(
    index: &HashMap<Fingerprint, Slot>,
    removed: &[Arc<CacheEntry>],
    also_live: &[Artifact],
) {
    let live: HashSet<&Path> = index
        .values()
        .flat_map(|slot| slot.entry.artifacts.iter().map(|a| a.path.as_path()))
        .chain(also_live.iter().map(|a| a.path.as_path()))
        .collect();
    for artifact in removed.iter().flat_map(|entry| entry.artifacts.iter()) {
        if live.contains(artifact.path.as_path()) {
            continue;
        }
        match std::fs::remove_file(&artifact.path) {
            Ok(()) => debug!("Removed {}", artifact.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", artifact.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{Edge, Node, NodeKind};
    use crate::export::ArtifactFormat;
    use futures::future::join_all;

    fn entry(dir: &Path, key: &str, digest: &str, bytes: usize) -> CacheEntry {
        let fingerprint = Fingerprint::of(key);
        let path = dir.join(format!("{}.svg", fingerprint));
        std::fs::write(&path, vec![b'x'; bytes]).unwrap();
        let spec = DiagramSpec {
            title: None,
            nodes: vec![
                Node::new("a", "A", NodeKind::Start),
                Node::new("b", "B", NodeKind::End),
            ],
            edges: vec![Edge::new("a", "b")],
            animations: Vec::new(),
        };
        CacheEntry {
            fingerprint,
            prompt: key.to_string(),
            settings_digest: digest.to_string(),
            layout: LayoutGraph {
                spec: spec.clone(),
                nodes: Vec::new(),
                edges: Vec::new(),
                width: 0.0,
                height: 0.0,
            },
            spec,
            artifacts: vec![Artifact {
                format: ArtifactFormat::Svg,
                path,
                bytes: bytes as u64,
            }],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        let e = entry(dir.path(), "alpha", "d1", 10);
        let fp = e.fingerprint.clone();

        assert!(cache.get(&fp).await.is_none());
        assert_eq!(cache.put(e.clone()).await.unwrap(), PutOutcome::Inserted);
        let hit = cache.get(&fp).await.unwrap();
        assert_eq!(*hit, e);

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 10);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        let first = entry(dir.path(), "alpha", "d1", 10);
        let mut second = first.clone();
        second.prompt = "alpha, again".to_string();

        assert_eq!(cache.put(first.clone()).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(cache.put(second).await.unwrap(), PutOutcome::Discarded);
        assert_eq!(cache.get(&first.fingerprint).await.unwrap().prompt, "alpha");
    }

    #[tokio::test]
    async fn test_settings_change_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        let old = entry(dir.path(), "alpha", "d1", 10);
        let new = entry(dir.path(), "alpha", "d2", 12);

        cache.put(old).await.unwrap();
        assert_eq!(cache.put(new.clone()).await.unwrap(), PutOutcome::Replaced);
        let hit = cache.get(&new.fingerprint).await.unwrap();
        assert_eq!(hit.settings_digest, "d2");
        // Same file name, so the replacement must not delete it.
        assert!(new.artifacts[0].path.is_file());
    }

    #[tokio::test]
    async fn test_expired_entries_miss_and_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_age: Duration::from_secs(60),
            ..CacheLimits::default()
        };
        let cache = ResponseCache::open(dir.path(), limits).unwrap();
        let mut old = entry(dir.path(), "alpha", "d1", 10);
        old.created_at = Utc::now() - chrono::Duration::minutes(5);

        cache.put(old.clone()).await.unwrap();
        assert!(cache.get(&old.fingerprint).await.is_none());

        cache.put(entry(dir.path(), "beta", "d1", 10)).await.unwrap();
        assert!(!old.artifacts[0].path.exists());
        assert_eq!(cache.stats().await.entries, 1);

        let fresh = entry(dir.path(), "alpha", "d1", 10);
        assert_eq!(cache.put(fresh).await.unwrap(), PutOutcome::Inserted);
        assert!(cache.get(&old.fingerprint).await.is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_deletes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_entries: 2,
            ..CacheLimits::default()
        };
        let cache = ResponseCache::open(dir.path(), limits).unwrap();
        let a = entry(dir.path(), "a", "d", 1);
        let b = entry(dir.path(), "b", "d", 1);
        let c = entry(dir.path(), "c", "d", 1);

        cache.put(a.clone()).await.unwrap();
        cache.put(b.clone()).await.unwrap();
        assert!(cache.get(&a.fingerprint).await.is_some());
        cache.put(c.clone()).await.unwrap();

        assert!(cache.get(&b.fingerprint).await.is_none());
        assert!(!b.artifacts[0].path.exists());
        assert!(cache.get(&a.fingerprint).await.is_some());
        assert!(cache.get(&c.fingerprint).await.is_some());
        assert!(a.artifacts[0].path.is_file());
    }

    #[tokio::test]
    async fn test_byte_limit_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_bytes: 100,
            ..CacheLimits::default()
        };
        let cache = ResponseCache::open(dir.path(), limits).unwrap();
        let big = entry(dir.path(), "big", "d", 80);
        let other = entry(dir.path(), "other", "d", 40);

        cache.put(big.clone()).await.unwrap();
        cache.put(other.clone()).await.unwrap();
        assert!(cache.get(&big.fingerprint).await.is_none());
        assert_eq!(cache.stats().await.bytes, 40);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let kept = entry(dir.path(), "kept", "d", 5);
        let lost = entry(dir.path(), "lost", "d", 5);
        {
            let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
            cache.put(kept.clone()).await.unwrap();
            cache.put(lost.clone()).await.unwrap();
        }
        std::fs::remove_file(&lost.artifacts[0].path).unwrap();

        let reopened = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        assert_eq!(*reopened.get(&kept.fingerprint).await.unwrap(), kept);
        assert!(reopened.get(&lost.fingerprint).await.is_none());
        assert_eq!(reopened.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"{ not json").unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        assert_eq!(cache.stats().await.entries, 0);

        cache.put(entry(dir.path(), "a", "d", 1)).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    }

    #[tokio::test]
    async fn test_clear_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheLimits::default()).unwrap();
        let a = entry(dir.path(), "a", "d", 1);
        cache.put(a.clone()).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(!a.artifacts[0].path.exists());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_keep_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResponseCache::open(dir.path(), CacheLimits::default()).unwrap());
        let base = entry(dir.path(), "shared", "d", 3);

        let tasks = (0..8).map(|i| {
            let cache = Arc::clone(&cache);
            let mut e = base.clone();
            e.prompt = format!("writer {}", i);
            tokio::spawn(async move { cache.put(e).await.unwrap() })
        });
        let outcomes: Vec<PutOutcome> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let inserted = outcomes.iter().filter(|o| **o == PutOutcome::Inserted).count();
        let discarded = outcomes.iter().filter(|o| **o == PutOutcome::Discarded).count();
        assert_eq!(inserted, 1);
        assert_eq!(discarded, 7);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_not_cached_but_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_bytes: 10,
            ..CacheLimits::default()
        };
        let cache = ResponseCache::open(dir.path(), limits).unwrap();
        let small = entry(dir.path(), "small", "d", 4);
        let huge = entry(dir.path(), "huge", "d", 50);

        cache.put(small.clone()).await.unwrap();
        assert_eq!(cache.put(huge.clone()).await.unwrap(), PutOutcome::Uncached);
        assert!(huge.artifacts[0].path.is_file());
        assert!(cache.get(&huge.fingerprint).await.is_none());
        assert!(cache.get(&small.fingerprint).await.is_some());
    }

    #[tokio::test]
    async fn test_newest_entry_survives_entry_limit() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CacheLimits {
            max_entries: 1,
            ..CacheLimits::default()
        };
        let cache = ResponseCache::open(dir.path(), limits).unwrap();
        let a = entry(dir.path(), "a", "d", 1);
        let b = entry(dir.path(), "b", "d", 1);

        cache.put(a.clone()).await.unwrap();
        assert!(cache.get(&a.fingerprint).await.is_some());
        cache.put(b.clone()).await.unwrap();

        assert!(cache.get(&b.fingerprint).await.is_some());
        assert!(b.artifacts[0].path.is_file());
        assert!(!a.artifacts[0].path.exists());
    }
}
