//! Request orchestration: cache lookup, coalescing, conversion, publish.
//!
//! ```text
//! fetch(source, refresh)
//!   │
//!   ├─ !refresh && store hit ──────────────────────────────▶ Served { cached: true }
//!   │
//!   └─ claim(key)
//!        ├─ Follower ── wait ──────────────────────────────▶ Leader's outcome
//!        └─ Leader ── spawn ─▶ convert ─▶ rewrite links ─▶ put ─▶ release
//!                       │                                            │
//!                       └──────────── own subscription ◀─────────────┘
//! ```
//!
//! The Leader's work runs in a detached task: if the HTTP client that
//! triggered it disconnects, the conversion still completes and is published
//! for everyone else waiting on the key. Failures are never cached; the next
//! request after a failed conversion starts a fresh one.

use crate::coalesce::{InflightTable, Leader, Outcome, Role};
use crate::config::ServiceConfig;
use crate::converter::{ConvertRequest, Converter};
use crate::error::{ConversionFailure, UnpdfError};
use crate::key::{ContentAddress, SourceRequest};
use crate::pipeline::postprocess::rewrite_image_links;
use crate::store::{CacheEntry, EntryStore, Lookup, NewEntry, StoreStats, SweepReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unreferenced generations younger than this survive a sweep, so readers
/// that opened the previous `meta.json` can finish.
pub const SWEEP_GRACE: Duration = Duration::from_secs(10 * 60);

/// A successfully served request.
#[derive(Debug, Clone)]
pub struct Served {
    pub entry: Arc<CacheEntry>,
    /// `true` when answered from the store without converting.
    pub cached: bool,
}

impl Served {
    pub fn key(&self) -> &ContentAddress {
        &self.entry.key
    }

    pub fn markdown(&self) -> &str {
        &self.entry.markdown
    }

    pub fn source_url(&self) -> &str {
        &self.entry.meta.source_url
    }

    pub fn page_count(&self) -> usize {
        self.entry.meta.page_count
    }

    /// Time spent converting for this response: `0` for cache hits.
    pub fn conversion_ms(&self) -> u64 {
        if self.cached {
            0
        } else {
            self.entry.meta.conversion_ms
        }
    }
}

/// The caching, coalescing front of a [`Converter`].
///
/// Cheap to clone; clones share the store, the converter and the in-flight
/// table.
#[derive(Clone)]
pub struct PdfCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    store: EntryStore,
    converter: Arc<dyn Converter>,
    inflight: InflightTable,
}

impl PdfCache {
    /// Open the store under `config.cache_dir` and front `converter` with it.
    pub async fn open(
        config: ServiceConfig,
        converter: Arc<dyn Converter>,
    ) -> Result<Self, UnpdfError> {
        let store = EntryStore::open(&config.cache_dir, config.ttl()).await?;
        info!(
            cache_dir = %config.cache_dir.display(),
            ttl_days = config.ttl_days,
            "Cache ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                converter,
                inflight: InflightTable::new(),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &EntryStore {
        &self.inner.store
    }

    /// Keys with a conversion currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Serve a raw request path (`host/path?query`, optionally with a scheme).
    pub async fn fetch_path(&self, raw: &str, refresh: bool) -> Result<Served, ConversionFailure> {
        let source = SourceRequest::parse(raw)?;
        self.fetch(&source, refresh).await
    }

    /// Serve `source` from the store, converting it first if needed.
    ///
    /// With `refresh`, any stored entry is ignored and replaced by a new
    /// conversion; a conversion already in flight for the key is joined.
    pub async fn fetch(
        &self,
        source: &SourceRequest,
        refresh: bool,
    ) -> Result<Served, ConversionFailure> {
        let key = source.address();
        let started = Instant::now();

        let result = self.fetch_inner(source, &key, refresh).await;
        match &result {
            Ok(served) => {
                self.inner.store.record_read();
                info!(
                    key = %key,
                    url = %source,
                    cached = served.cached,
                    conversion_ms = served.conversion_ms(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    outcome = "ok",
                    "Served"
                );
            }
            Err(failure) => {
                info!(
                    key = %key,
                    url = %source,
                    cached = false,
                    outcome = failure.kind.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Failed: {}",
                    failure
                );
            }
        }
        result
    }

    async fn fetch_inner(
        &self,
        source: &SourceRequest,
        key: &ContentAddress,
        refresh: bool,
    ) -> Result<Served, ConversionFailure> {
        if !refresh {
            if let Some(entry) = self.lookup(key).await? {
                return Ok(Served {
                    entry,
                    cached: true,
                });
            }
        }

        match self.inner.inflight.claim(key) {
            Role::Follower(follower) => {
                debug!(key = %key, "Waiting on in-flight conversion");
                follower.wait().await
            }
            Role::Leader(leader) => self.lead(leader, source, refresh).await,
        }
    }

    async fn lead(&self, leader: Leader, source: &SourceRequest, refresh: bool) -> Outcome {
        // Another Leader may have published between our miss and our claim;
        // don't convert twice.
        if !refresh {
            let found = match self.lookup(leader.key()).await {
                Ok(found) => found,
                Err(failure) => {
                    leader.release(Err(failure.clone()));
                    return Err(failure);
                }
            };
            if let Some(entry) = found {
                let served = Served {
                    entry,
                    cached: true,
                };
                leader.release(Ok(served.clone()));
                return Ok(served);
            }
        }
        let own = leader.subscribe();
        self.spawn_conversion(leader, source.url().to_string());
        own.wait().await
    }

    async fn lookup(&self, key: &ContentAddress) -> Result<Option<Arc<CacheEntry>>, ConversionFailure> {
        match self.inner.store.get(key).await? {
            Lookup::Hit(entry) => Ok(Some(Arc::new(entry))),
            Lookup::Expired(meta) => {
                debug!(key = %key, created_at = %meta.created_at, "Expired, reconverting");
                Ok(None)
            }
            Lookup::Absent => Ok(None),
        }
    }

    fn spawn_conversion(&self, leader: Leader, source_url: String) {
        let cache = self.clone();
        tokio::spawn(async move {
            let outcome = cache.convert_and_publish(leader.key(), source_url).await;
            leader.release(outcome);
        });
    }

    async fn convert_and_publish(&self, key: &ContentAddress, source_url: String) -> Outcome {
        let request = ConvertRequest::new(source_url, &self.inner.config);
        let budget = request.total_budget();
        let started = Instant::now();

        let conversion = tokio::time::timeout(budget, self.inner.converter.convert(&request))
            .await
            .map_err(|_| ConversionFailure::timeout("Conversion", budget.as_secs()))??;
        let conversion_ms = started.elapsed().as_millis() as u64;

        let names: Vec<&str> = conversion.images.iter().map(|i| i.name.as_str()).collect();
        let images_base = format!("{}/images/{}", self.inner.config.public_base_url(), key);
        let markdown = rewrite_image_links(&conversion.markdown, &images_base, &names);

        let entry = self
            .inner
            .store
            .put(
                key,
                &markdown,
                &conversion.images,
                NewEntry {
                    source_url: &request.source_url,
                    page_count: conversion.page_count,
                    conversion_ms,
                },
            )
            .await?;
        Ok(Served {
            entry: Arc::new(entry),
            cached: false,
        })
    }

    /// One image of a published entry. `Ok(None)` when it does not exist.
    pub async fn image(
        &self,
        key: &ContentAddress,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, UnpdfError> {
        self.inner.store.serve_image(key, filename).await
    }

    /// Delete every entry past the configured TTL. A no-op when entries
    /// never expire.
    pub async fn evict_expired(&self) -> Result<usize, UnpdfError> {
        match self.inner.config.ttl() {
            Some(ttl) => self.inner.store.evict_expired(ttl).await,
            None => Ok(0),
        }
    }

    /// Remove leftovers of interrupted or superseded writes.
    pub async fn sweep(&self) -> Result<SweepReport, UnpdfError> {
        self.inner.store.sweep(SWEEP_GRACE).await
    }

    /// One maintenance pass: evict, sweep, then persist the usage counters.
    pub async fn maintain(&self) -> Result<(usize, SweepReport), UnpdfError> {
        let evicted = self.evict_expired().await?;
        let swept = self.sweep().await?;
        self.flush_stats().await?;
        Ok((evicted, swept))
    }

    /// Write the in-memory usage counters to disk if they changed.
    pub async fn flush_stats(&self) -> Result<bool, UnpdfError> {
        self.inner.store.flush_stats().await
    }

    pub async fn stats(&self) -> Result<StoreStats, UnpdfError> {
        self.inner.store.stats().await
    }
}

impl std::fmt::Debug for PdfCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfCache")
            .field("cache_dir", &self.inner.config.cache_dir)
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

/// Run [`PdfCache::maintain`] every `config.eviction_interval` until the
/// task is aborted.
pub async fn run_maintenance(cache: PdfCache) {
    let mut ticker = tokio::time::interval(cache.config().eviction_interval());
    loop {
        ticker.tick().await;
        match cache.maintain().await {
            Ok((evicted, swept)) => debug!(
                evicted,
                staging = swept.staging_removed,
                generations = swept.generations_removed,
                "Maintenance pass done"
            ),
            Err(e) => warn!("Maintenance pass failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::Conversion;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl Converter for Echo {
        async fn convert(&self, req: &ConvertRequest) -> Result<Conversion, ConversionFailure> {
            Ok(Conversion {
                markdown: format!("# {}\n", req.source_url),
                images: vec![],
                page_count: 1,
            })
        }
    }

    async fn cache(dir: &TempDir) -> PdfCache {
        let config = ServiceConfig::builder()
            .cache_dir(dir.path().join("cache"))
            .build()
            .unwrap();
        PdfCache::open(config, Arc::new(Echo)).await.unwrap()
    }

    #[tokio::test]
    async fn conversion_ms_is_zero_on_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir).await;
        let first = cache.fetch_path("example.com/a.pdf", false).await.unwrap();
        assert!(!first.cached);
        let second = cache.fetch_path("example.com/a.pdf", false).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.conversion_ms(), 0);
        assert_eq!(second.markdown(), "# https://example.com/a.pdf\n");
        assert_eq!(second.source_url(), "https://example.com/a.pdf");
    }

    #[tokio::test]
    async fn invalid_path_never_reaches_converter() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir).await;
        let err = cache.fetch_path("no-slash-here", false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(cache.stats().await.unwrap().total_conversions, 0);
    }

    #[tokio::test]
    async fn leader_finding_published_entry_reports_cached_to_followers() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir).await;
        let source = SourceRequest::parse("example.com/raced.pdf").unwrap();
        let key = source.address();

        let Role::Leader(leader) = cache.inner.inflight.claim(&key) else {
            panic!("expected leader");
        };
        let Role::Follower(follower) = cache.inner.inflight.claim(&key) else {
            panic!("expected follower");
        };
        // Someone else published between this Leader's miss and its claim.
        let published = NewEntry {
            source_url: source.url(),
            page_count: 1,
            conversion_ms: 900,
        };
        cache.store().put(&key, "# raced\n", &[], published).await.unwrap();

        let led = cache.lead(leader, &source, false).await.unwrap();
        let followed = follower.wait().await.unwrap();
        for served in [&led, &followed] {
            assert!(served.cached);
            assert_eq!(served.conversion_ms(), 0);
            assert_eq!(served.markdown(), "# raced\n");
        }
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.stats().await.unwrap().total_conversions, 1);
    }

    #[tokio::test]
    async fn maintenance_flushes_counters() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir).await;
        cache.fetch_path("example.com/a.pdf", false).await.unwrap();
        let stats_file = cache.store().root().join("_stats.json");
        assert!(!stats_file.exists());

        cache.maintain().await.unwrap();
        let persisted: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&stats_file).unwrap()).unwrap();
        assert_eq!(persisted["total_conversions"], 1);
        assert_eq!(persisted["total_reads"], 1);
    }

    #[tokio::test]
    async fn evict_is_noop_without_ttl() {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig::builder()
            .cache_dir(dir.path().join("cache"))
            .ttl_days(0)
            .build()
            .unwrap();
        let cache = PdfCache::open(config, Arc::new(Echo)).await.unwrap();
        cache.fetch_path("example.com/a.pdf", false).await.unwrap();
        assert_eq!(cache.evict_expired().await.unwrap(), 0);
    }
}
