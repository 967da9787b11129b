//! Disk-backed entry store for converted markdown and extracted images.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!     _stats.json                    usage counters
//!     .staging/gen-XXXXXX/           in-progress writes, never read
//!     <key>/
//!         meta.json                  publish point
//!         gen-XXXXXX/
//!             result.md
//!             images/fig1.png …
//! ```
//!
//! ## Atomic publish
//!
//! `put` stages markdown and images in `.staging/` (same volume as the
//! entries), renames the finished staging directory to `<key>/gen-XXXXXX`,
//! and only then replaces `<key>/meta.json` through a temp-file rename.
//! `meta.json` names the generation it describes; readers open it once and
//! read every artifact from that generation. A reader therefore sees either
//! the previous complete entry or the new complete entry, never a mix, and a
//! crash at any point leaves at most an unreferenced directory that
//! [`EntryStore::sweep`] removes later.
//!
//! Superseded generations are not deleted at publish time. `put` drops a
//! `retired` marker into the generation it replaces, and a sweep removes it
//! only once the marker is older than the grace period, so a reader that
//! opened the old `meta.json` just before a refresh can still finish.
//!
//! ## Counters
//!
//! Conversion and read counters live in memory and reach `_stats.json` only
//! through [`EntryStore::flush_stats`]; a cache hit never touches the disk
//! beyond its own entry.
//!
//! ## Eviction race
//!
//! Eviction and sweeps never coordinate with readers. A read racing an
//! eviction of the same key may fail to find `result.md`; that read reports
//! [`Lookup::Absent`] and the caller reconverts. Entries are immutable once
//! published, so the race can lose a read but never serve a torn entry.

use crate::error::UnpdfError;
use crate::key::ContentAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STAGING_DIR: &str = ".staging";
const STATS_FILE: &str = "_stats.json";
const META_FILE: &str = "meta.json";
const MARKDOWN_FILE: &str = "result.md";
const IMAGES_DIR: &str = "images";
const GENERATION_PREFIX: &str = "gen-";
const RETIRED_MARKER: &str = "retired";

/// One extracted image, as produced by the conversion adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ImageBlob {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Caller-supplied metadata for [`EntryStore::put`].
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub source_url: &'a str,
    pub page_count: usize,
    pub conversion_ms: u64,
}

/// The persisted `meta.json` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub page_count: usize,
    pub conversion_ms: u64,
    pub image_count: usize,
    /// Image names in the order the converter emitted them.
    pub images: Vec<String>,
    /// Directory (under `<key>/`) holding this entry's artifacts.
    pub generation: String,
}

impl EntryMeta {
    /// `true` once `now` has reached `created_at + ttl`.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.created_at) >= ttl,
            // A TTL too large for chrono never elapses.
            Err(_) => false,
        }
    }
}

/// A complete, published cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: ContentAddress,
    pub markdown: String,
    pub meta: EntryMeta,
}

impl CacheEntry {
    pub fn images(&self) -> &[String] {
        &self.meta.images
    }
}

/// Result of [`EntryStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Present and within its TTL.
    Hit(CacheEntry),
    /// Never written, evicted, or unreadable.
    Absent,
    /// Present but past its TTL; the caller decides whether that is a miss.
    Expired(EntryMeta),
}

/// Usage counters, persisted in `_stats.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    #[serde(default)]
    pub total_conversions: u64,
    #[serde(default)]
    pub total_reads: u64,
    /// Published entries currently on disk (computed, not persisted).
    #[serde(skip)]
    pub cached_pdfs: u64,
}

/// What a [`EntryStore::sweep`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staging_removed: usize,
    pub generations_removed: usize,
    pub empty_entries_removed: usize,
}

/// Key-addressed store of conversion results under one root directory.
#[derive(Debug)]
pub struct EntryStore {
    root: PathBuf,
    ttl: Option<Duration>,
    // Serialises the rename steps of publish/evict/delete/sweep. Readers
    // never take it, and no conversion runs while it is held.
    publish_lock: Mutex<()>,
    // Serialises `_stats.json` writes only; the counters themselves are atomic.
    stats_lock: Mutex<()>,
    conversions: AtomicU64,
    reads: AtomicU64,
    stats_dirty: AtomicBool,
}

impl EntryStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// `ttl = None` keeps entries forever.
    pub async fn open(root: impl Into<PathBuf>, ttl: Option<Duration>) -> Result<Self, UnpdfError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| UnpdfError::io(&staging, e))?;
        let persisted = read_stats(&root).await?;
        debug!(
            conversions = persisted.total_conversions,
            reads = persisted.total_reads,
            "Opened entry store at {}",
            root.display()
        );
        Ok(Self {
            root,
            ttl,
            publish_lock: Mutex::new(()),
            stats_lock: Mutex::new(()),
            conversions: AtomicU64::new(persisted.total_conversions),
            reads: AtomicU64::new(persisted.total_reads),
            stats_dirty: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Directory that holds everything stored under `key`.
    pub fn entry_dir(&self, key: &ContentAddress) -> PathBuf {
        self.root.join(key.as_str())
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Look up `key` against the current wall clock.
    pub async fn get(&self, key: &ContentAddress) -> Result<Lookup, UnpdfError> {
        self.get_at(key, Utc::now()).await
    }

    /// Look up `key` as if the current time were `now`.
    pub async fn get_at(&self, key: &ContentAddress, now: DateTime<Utc>) -> Result<Lookup, UnpdfError> {
        let Some(meta) = self.read_meta(key).await? else {
            return Ok(Lookup::Absent);
        };

        if let Some(ttl) = self.ttl {
            if meta.is_expired_at(ttl, now) {
                debug!(key = %key, created_at = %meta.created_at, "Entry expired");
                return Ok(Lookup::Expired(meta));
            }
        }

        let md_path = self
            .entry_dir(key)
            .join(&meta.generation)
            .join(MARKDOWN_FILE);
        match tokio::fs::read_to_string(&md_path).await {
            Ok(markdown) => Ok(Lookup::Hit(CacheEntry {
                key: key.clone(),
                markdown,
                meta,
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = %key, "Entry vanished mid-read, treating as miss");
                Ok(Lookup::Absent)
            }
            Err(e) => Err(UnpdfError::io(md_path, e)),
        }
    }

    /// Read one image of a published entry.
    ///
    /// Returns `Ok(None)` when the entry or the image does not exist, and
    /// [`UnpdfError::InvalidImageName`] when `filename` would resolve outside
    /// the entry's image directory.
    pub async fn serve_image(
        &self,
        key: &ContentAddress,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, UnpdfError> {
        if !is_safe_file_name(filename) {
            return Err(UnpdfError::InvalidImageName(filename.to_string()));
        }
        let Some(meta) = self.read_meta(key).await? else {
            return Ok(None);
        };
        self.read_generation_image(key, &meta.generation, filename).await
    }

    /// Read one image from the exact generation `entry` was read from.
    ///
    /// Unlike [`EntryStore::serve_image`] this never follows a newer
    /// `meta.json`, so markdown and image bytes always belong together.
    pub async fn entry_image(
        &self,
        entry: &CacheEntry,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, UnpdfError> {
        if !is_safe_file_name(filename) {
            return Err(UnpdfError::InvalidImageName(filename.to_string()));
        }
        self.read_generation_image(&entry.key, &entry.meta.generation, filename)
            .await
    }

    async fn read_generation_image(
        &self,
        key: &ContentAddress,
        generation: &str,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, UnpdfError> {
        let images_dir = self.entry_dir(key).join(generation).join(IMAGES_DIR);
        let path = images_dir.join(filename);

        // Follow symlinks before trusting the path.
        let (resolved, base) = match (
            tokio::fs::canonicalize(&path).await,
            tokio::fs::canonicalize(&images_dir).await,
        ) {
            (Ok(resolved), Ok(base)) => (resolved, base),
            _ => return Ok(None),
        };
        if resolved.parent() != Some(base.as_path()) {
            return Err(UnpdfError::InvalidImageName(filename.to_string()));
        }

        match tokio::fs::read(&resolved).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UnpdfError::io(resolved, e)),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Atomically publish a conversion result under `key`, replacing any
    /// previous entry. Returns the entry as readers will see it.
    pub async fn put(
        &self,
        key: &ContentAddress,
        markdown: &str,
        images: &[ImageBlob],
        source: NewEntry<'_>,
    ) -> Result<CacheEntry, UnpdfError> {
        let mut seen = HashSet::with_capacity(images.len());
        for image in images {
            if !is_safe_file_name(&image.name) || !seen.insert(image.name.as_str()) {
                return Err(UnpdfError::InvalidImageName(image.name.clone()));
            }
        }

        // Dropping `staging` on any early return removes the partial write.
        let staging_root = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_root)
            .await
            .map_err(|e| UnpdfError::io(&staging_root, e))?;
        let staging = tempfile::Builder::new()
            .prefix(GENERATION_PREFIX)
            .tempdir_in(&staging_root)
            .map_err(|e| UnpdfError::io(&staging_root, e))?;
        let generation = staging
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| UnpdfError::Internal("staging directory has no name".into()))?;

        write_synced(&staging.path().join(MARKDOWN_FILE), markdown.as_bytes()).await?;
        let images_dir = staging.path().join(IMAGES_DIR);
        tokio::fs::create_dir(&images_dir)
            .await
            .map_err(|e| UnpdfError::io(&images_dir, e))?;
        for image in images {
            write_synced(&images_dir.join(&image.name), &image.bytes).await?;
        }

        let meta = EntryMeta {
            source_url: source.source_url.to_string(),
            created_at: Utc::now(),
            page_count: source.page_count,
            conversion_ms: source.conversion_ms,
            image_count: images.len(),
            images: images.iter().map(|i| i.name.clone()).collect(),
            generation: generation.clone(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| UnpdfError::CorruptMetadata {
            path: PathBuf::from(META_FILE),
            source: e,
        })?;

        {
            let _guard = self.publish_lock.lock().await;
            let entry_dir = self.entry_dir(key);
            tokio::fs::create_dir_all(&entry_dir)
                .await
                .map_err(|e| UnpdfError::io(&entry_dir, e))?;
            let previous = self.read_meta(key).await?.map(|m| m.generation);
            let target = entry_dir.join(&generation);
            tokio::fs::rename(staging.path(), &target)
                .await
                .map_err(|e| UnpdfError::io(&target, e))?;
            // The publish point: from here on readers see the new entry.
            write_atomic(&entry_dir.join(META_FILE), &meta_json).await?;

            if let Some(previous) = previous.filter(|g| *g != generation) {
                let marker = entry_dir.join(&previous).join(RETIRED_MARKER);
                if let Err(e) = tokio::fs::write(&marker, Utc::now().to_rfc3339()).await {
                    warn!(key = %key, generation = %previous, "Failed to mark generation retired: {}", e);
                }
            }
        }

        info!(
            key = %key,
            source_url = %meta.source_url,
            pages = meta.page_count,
            images = meta.image_count,
            "Published cache entry"
        );
        self.conversions.fetch_add(1, Ordering::Relaxed);
        self.stats_dirty.store(true, Ordering::Release);

        Ok(CacheEntry {
            key: key.clone(),
            markdown: markdown.to_string(),
            meta,
        })
    }

    /// Remove the entry stored under `key`. Missing entries are not an error.
    pub async fn delete(&self, key: &ContentAddress) -> Result<(), UnpdfError> {
        let _guard = self.publish_lock.lock().await;
        self.remove_entry_locked(key).await
    }

    /// Remove every entry older than `max_age`. Returns how many were removed.
    pub async fn evict_expired(&self, max_age: Duration) -> Result<usize, UnpdfError> {
        self.evict_expired_at(max_age, Utc::now()).await
    }

    /// [`EntryStore::evict_expired`] with an explicit notion of "now".
    pub async fn evict_expired_at(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, UnpdfError> {
        let mut evicted = 0;
        for key in self.list_keys().await? {
            // Re-read under the lock: a refresh may have just replaced it.
            let _guard = self.publish_lock.lock().await;
            match self.read_meta(&key).await? {
                Some(meta) if meta.is_expired_at(max_age, now) => {
                    self.remove_entry_locked(&key).await?;
                    info!(key = %key, created_at = %meta.created_at, "Evicted expired entry");
                    evicted += 1;
                }
                _ => {}
            }
        }
        Ok(evicted)
    }

    /// Remove leftovers of interrupted writes: staging directories and
    /// generations no `meta.json` points at, once older than `grace`.
    pub async fn sweep(&self, grace: Duration) -> Result<SweepReport, UnpdfError> {
        let mut report = SweepReport::default();

        let staging_root = self.root.join(STAGING_DIR);
        for path in list_dir(&staging_root).await? {
            if older_than(&path, grace).await {
                remove_dir_all_quiet(&path).await?;
                report.staging_removed += 1;
            }
        }

        for key in self.list_keys().await? {
            let _guard = self.publish_lock.lock().await;
            let current = self.read_meta(&key).await?.map(|m| m.generation);
            let entry_dir = self.entry_dir(&key);
            let mut remaining = 0usize;
            for path in list_dir(&entry_dir).await? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.starts_with(GENERATION_PREFIX) {
                    remaining += 1;
                    continue;
                }
                let superseded = current.as_deref() != Some(name);
                if superseded && older_than(&retired_since(&path).await, grace).await {
                    remove_dir_all_quiet(&path).await?;
                    report.generations_removed += 1;
                } else {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                // Only succeeds on an empty directory, which is what we want.
                if tokio::fs::remove_dir(&entry_dir).await.is_ok() {
                    report.empty_entries_removed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                staging = report.staging_removed,
                generations = report.generations_removed,
                empty = report.empty_entries_removed,
                "Swept cache leftovers"
            );
        }
        Ok(report)
    }

    // ── Stats ────────────────────────────────────────────────────────────

    /// Count one successful serve (hit or fresh conversion). In-memory only.
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.stats_dirty.store(true, Ordering::Release);
    }

    /// Persist the counters to `_stats.json` if they changed since the last
    /// flush. Returns whether a write happened.
    pub async fn flush_stats(&self) -> Result<bool, UnpdfError> {
        let _guard = self.stats_lock.lock().await;
        if !self.stats_dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.counters();
        let path = self.root.join(STATS_FILE);
        let written = match serde_json::to_vec(&snapshot) {
            Ok(raw) => write_atomic(&path, &raw).await,
            Err(source) => Err(UnpdfError::CorruptMetadata {
                path: path.clone(),
                source,
            }),
        };
        if let Err(e) = written {
            self.stats_dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(
            conversions = snapshot.total_conversions,
            reads = snapshot.total_reads,
            "Flushed usage counters"
        );
        Ok(true)
    }

    /// Current usage counters plus the number of published entries.
    pub async fn stats(&self) -> Result<StoreStats, UnpdfError> {
        let mut stats = self.counters();
        let mut cached = 0u64;
        for key in self.list_keys().await? {
            if tokio::fs::try_exists(self.entry_dir(&key).join(META_FILE))
                .await
                .unwrap_or(false)
            {
                cached += 1;
            }
        }
        stats.cached_pdfs = cached;
        Ok(stats)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    async fn read_meta(&self, key: &ContentAddress) -> Result<Option<EntryMeta>, UnpdfError> {
        let path = self.entry_dir(key).join(META_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UnpdfError::io(path, e)),
        };
        match serde_json::from_slice::<EntryMeta>(&raw) {
            Ok(meta) if is_generation_name(&meta.generation) => Ok(Some(meta)),
            Ok(meta) => {
                warn!(key = %key, generation = %meta.generation, "Bad generation in metadata, treating as miss");
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, "Corrupt cache metadata, treating as miss: {}", e);
                Ok(None)
            }
        }
    }

    /// Caller must hold `publish_lock`.
    async fn remove_entry_locked(&self, key: &ContentAddress) -> Result<(), UnpdfError> {
        let entry_dir = self.entry_dir(key);
        // Unpublish first so no reader picks the entry up half-deleted.
        let meta_path = entry_dir.join(META_FILE);
        match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(UnpdfError::io(meta_path, e)),
        }
        remove_dir_all_quiet(&entry_dir).await
    }

    async fn list_keys(&self) -> Result<Vec<ContentAddress>, UnpdfError> {
        let mut keys: Vec<ContentAddress> = list_dir(&self.root)
            .await?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(ContentAddress::parse)
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn counters(&self) -> StoreStats {
        StoreStats {
            total_conversions: self.conversions.load(Ordering::Relaxed),
            total_reads: self.reads.load(Ordering::Relaxed),
            cached_pdfs: 0,
        }
    }
}

/// A name is usable as a stored file iff it is exactly one ordinary path
/// component that is not hidden.
fn is_safe_file_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 || name.starts_with('.') {
        return false;
    }
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_generation_name(name: &str) -> bool {
    name.starts_with(GENERATION_PREFIX) && is_safe_file_name(name)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), UnpdfError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| UnpdfError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| UnpdfError::io(path, e))?;
    file.sync_all().await.map_err(|e| UnpdfError::io(path, e))
}

/// Write `bytes` to `path` via a sibling temp file and a rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), UnpdfError> {
    let tmp = path.with_extension("json.tmp");
    write_synced(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| UnpdfError::io(path, e))
}

async fn read_stats(root: &Path) -> Result<StoreStats, UnpdfError> {
    let path = root.join(STATS_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!("Corrupt stats file, starting from zero: {}", e);
            StoreStats::default()
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreStats::default()),
        Err(e) => Err(UnpdfError::io(path, e)),
    }
}

/// Path whose mtime says when a superseded generation left service: its
/// `retired` marker, or the directory itself for a generation that was never
/// published.
async fn retired_since(generation_dir: &Path) -> PathBuf {
    let marker = generation_dir.join(RETIRED_MARKER);
    if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
        marker
    } else {
        generation_dir.to_path_buf()
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, UnpdfError> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(UnpdfError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UnpdfError::io(dir, e))?
    {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

async fn older_than(path: &Path, grace: Duration) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified
            .elapsed()
            .map(|age| age >= grace)
            .unwrap_or(grace.is_zero()),
        Err(_) => false,
    }
}

async fn remove_dir_all_quiet(path: &Path) -> Result<(), UnpdfError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UnpdfError::io(path, e)),
    }
}
