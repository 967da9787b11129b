//! Integration tests for the caching orchestrator.
//!
//! A scripted [`Converter`] stands in for download + pdfium so every test
//! runs offline and can count exactly how many conversions happened.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;
use unpdf::{
    derive_key, Conversion, ConversionFailure, ConvertRequest, Converter, FailureKind, ImageBlob,
    Lookup, PdfCache, ServiceConfig,
};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Converter that replays queued outcomes, then falls back to a numbered
/// markdown body (`version N`) so successive conversions are distinguishable.
#[derive(Default)]
struct Scripted {
    calls: AtomicUsize,
    delay: Duration,
    seen: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<Result<Conversion, ConversionFailure>>>,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    fn then(self: &Arc<Self>, outcome: Result<Conversion, ConversionFailure>) -> Arc<Self> {
        self.queue.lock().unwrap().push_back(outcome);
        Arc::clone(self)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Converter for Scripted {
    async fn convert(&self, req: &ConvertRequest) -> Result<Conversion, ConversionFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(req.source_url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.queue.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Conversion {
                markdown: format!("# {}\n\nversion {n}\n", req.source_url),
                images: vec![],
                page_count: 2,
            })
        })
    }
}

fn config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig::builder()
        .cache_dir(dir.path().join("cache"))
        .domain("unpdf.test")
        .build()
        .unwrap()
}

async fn open(dir: &TempDir, converter: Arc<Scripted>) -> PdfCache {
    init_tracing();
    PdfCache::open(config(dir), converter).await.unwrap()
}

/// Route library logs through the test harness; `RUST_LOG=unpdf=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Hits and misses ──────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_fetch_converts_once_then_hits() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    let first = assert_ok!(cache.fetch_path("example.com/paper.pdf", false).await);
    assert!(!first.cached);
    assert_eq!(first.page_count(), 2);
    assert_eq!(first.source_url(), "https://example.com/paper.pdf");

    let key = derive_key("example.com/paper.pdf").unwrap();
    assert!(matches!(cache.store().get(&key).await.unwrap(), Lookup::Hit(_)));

    let second = assert_ok!(cache.fetch_path("example.com/paper.pdf", false).await);
    assert!(second.cached);
    assert_eq!(second.conversion_ms(), 0);
    assert_eq!(second.markdown(), first.markdown());
    assert_eq!(converter.calls(), 1);
}

#[tokio::test]
async fn scheme_variants_share_one_entry() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    cache.fetch_path("http://example.com/a.pdf", false).await.unwrap();
    let again = cache.fetch_path("example.com/a.pdf", false).await.unwrap();
    assert!(again.cached);
    assert_eq!(converter.seen(), vec!["https://example.com/a.pdf".to_string()]);
}

#[tokio::test]
async fn query_strings_are_distinct_sources() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    let v2 = cache.fetch_path("example.com/file.pdf?v=2", false).await.unwrap();
    let v3 = cache.fetch_path("example.com/file.pdf?v=3", false).await.unwrap();
    assert_ne!(v2.key(), v3.key());
    assert!(!v3.cached);
    assert_eq!(converter.calls(), 2);
    assert_eq!(
        converter.seen(),
        vec![
            "https://example.com/file.pdf?v=2".to_string(),
            "https://example.com/file.pdf?v=3".to_string(),
        ]
    );
}

// ── Coalescing ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_conversion() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::slow(Duration::from_millis(300));
    let cache = open(&dir, converter.clone()).await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_path("example.com/hot.pdf", false).await })
        })
        .collect();

    let mut bodies = Vec::new();
    for h in handles {
        let served = h.await.unwrap().unwrap();
        bodies.push(served.markdown().to_string());
    }

    assert_eq!(converter.calls(), 1);
    assert!(bodies.iter().all(|b| b == &bodies[0]));
    assert!(bodies[0].contains("version 1"));
    assert_eq!(cache.in_flight(), 0);
}

/// Completes only once two conversions are inside `convert` at the same time.
struct Rendezvous {
    barrier: tokio::sync::Barrier,
}

#[async_trait]
impl Converter for Rendezvous {
    async fn convert(&self, req: &ConvertRequest) -> Result<Conversion, ConversionFailure> {
        self.barrier.wait().await;
        Ok(Conversion {
            markdown: format!("# {}\n", req.source_url),
            images: vec![],
            page_count: 1,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_convert_in_parallel() {
    let dir = TempDir::new().unwrap();
    let converter = Arc::new(Rendezvous {
        barrier: tokio::sync::Barrier::new(2),
    });
    let cache = PdfCache::open(config(&dir), converter).await.unwrap();

    // If one key's conversion blocked the other, neither would pass the barrier.
    let a = cache.fetch_path("example.com/a.pdf", false);
    let b = cache.fetch_path("example.com/b.pdf", false);
    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
        .await
        .expect("conversions for different keys must not serialise");
    assert_ok!(a);
    assert_ok!(b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failure_reaches_every_follower() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::slow(Duration::from_millis(200)).then(Err(ConversionFailure::not_found()));
    let cache = open(&dir, converter.clone()).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_path("example.com/gone.pdf", false).await })
        })
        .collect();

    for h in handles {
        let err = assert_err!(h.await.unwrap());
        assert_eq!(err.kind, FailureKind::NotFound);
        assert_eq!(err.status_code(), 404);
    }
    assert_eq!(converter.calls(), 1);
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failures_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new().then(Err(ConversionFailure::download_failed("boom")));
    let cache = open(&dir, converter.clone()).await;

    let err = cache.fetch_path("example.com/flaky.pdf", false).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::DownloadFailed);

    let ok = cache.fetch_path("example.com/flaky.pdf", false).await.unwrap();
    assert!(!ok.cached);
    assert_eq!(converter.calls(), 2);
}

#[tokio::test]
async fn oversize_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new().then(Err(ConversionFailure::too_large(50 * 1024 * 1024)));
    let cache = open(&dir, converter).await;

    let err = cache.fetch_path("example.com/huge.pdf", false).await.unwrap_err();
    assert_eq!(err.status_code(), 413);
    let key = derive_key("example.com/huge.pdf").unwrap();
    assert_eq!(cache.store().get(&key).await.unwrap(), Lookup::Absent);
}

#[tokio::test]
async fn slow_conversion_times_out() {
    let dir = TempDir::new().unwrap();
    let config = ServiceConfig::builder()
        .cache_dir(dir.path().join("cache"))
        .download_timeout_secs(1)
        .conversion_timeout_secs(1)
        .build()
        .unwrap();
    let converter = Scripted::slow(Duration::from_secs(10));
    let cache = PdfCache::open(config, converter).await.unwrap();

    let err = cache.fetch_path("example.com/slow.pdf", false).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Timeout);
    assert_eq!(err.status_code(), 504);
}

#[tokio::test]
async fn invalid_path_is_rejected_before_conversion() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    let err = cache.fetch_path("just-a-host", false).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::InvalidUrl);
    assert_eq!(converter.calls(), 0);
}

// ── Refresh and expiry ───────────────────────────────────────────────────────

#[tokio::test]
async fn refresh_reconverts_and_replaces() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    let v1 = cache.fetch_path("example.com/doc.pdf", false).await.unwrap();
    assert!(v1.markdown().contains("version 1"));

    let v2 = cache.fetch_path("example.com/doc.pdf", true).await.unwrap();
    assert!(!v2.cached);
    assert!(v2.markdown().contains("version 2"));

    let after = cache.fetch_path("example.com/doc.pdf", false).await.unwrap();
    assert!(after.cached);
    assert!(after.markdown().contains("version 2"));
    assert_eq!(converter.calls(), 2);
}

#[tokio::test]
async fn expired_entry_is_reconverted() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    let first = cache.fetch_path("example.com/old.pdf", false).await.unwrap();

    // Backdate the entry past the 30-day TTL.
    let meta_path = cache.store().entry_dir(first.key()).join("meta.json");
    let mut meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
    let old = chrono::Utc::now() - chrono::Duration::days(31);
    meta["created_at"] = serde_json::Value::String(old.to_rfc3339());
    std::fs::write(&meta_path, serde_json::to_vec(&meta).unwrap()).unwrap();

    assert!(matches!(
        cache.store().get(first.key()).await.unwrap(),
        Lookup::Expired(_)
    ));

    let second = cache.fetch_path("example.com/old.pdf", false).await.unwrap();
    assert!(!second.cached);
    assert!(second.markdown().contains("version 2"));

    assert_eq!(cache.evict_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn crash_leftovers_are_never_served() {
    let dir = TempDir::new().unwrap();
    let converter = Scripted::new();
    let cache = open(&dir, converter.clone()).await;

    // A generation directory without meta.json is what a crash mid-publish leaves.
    let key = derive_key("example.com/crash.pdf").unwrap();
    let partial = cache.store().entry_dir(&key).join("gen-partial");
    std::fs::create_dir_all(&partial).unwrap();
    std::fs::write(partial.join("result.md"), "half a docu").unwrap();

    let served = cache.fetch_path("example.com/crash.pdf", false).await.unwrap();
    assert!(!served.cached);
    assert!(!served.markdown().contains("half a docu"));
    assert_eq!(converter.calls(), 1);
}

// ── Images and stats ─────────────────────────────────────────────────────────

#[tokio::test]
async fn images_are_linked_and_served() {
    let dir = TempDir::new().unwrap();
    let png = b"\x89PNG\r\n\x1a\nfake".to_vec();
    let converter = Scripted::new().then(Ok(Conversion {
        markdown: "# Figures\n\n![](page-1-img-0.png)\n".into(),
        images: vec![ImageBlob::new("page-1-img-0.png", png.clone())],
        page_count: 1,
    }));
    let cache = open(&dir, converter).await;

    let served = cache.fetch_path("example.com/figs.pdf", false).await.unwrap();
    let expected = format!("https://unpdf.test/images/{}/page-1-img-0.png", served.key());
    assert!(served.markdown().contains(&expected), "got: {}", served.markdown());
    assert_eq!(served.entry.images(), ["page-1-img-0.png".to_string()]);

    let bytes = cache.image(served.key(), "page-1-img-0.png").await.unwrap();
    assert_eq!(bytes, Some(png));
    assert!(cache.image(served.key(), "../meta.json").await.is_err());
}

#[tokio::test]
async fn stats_track_conversions_and_reads() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, Scripted::new()).await;

    cache.fetch_path("example.com/a.pdf", false).await.unwrap();
    cache.fetch_path("example.com/a.pdf", false).await.unwrap();
    cache.fetch_path("example.com/b.pdf", false).await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_conversions, 2);
    assert_eq!(stats.total_reads, 3);
    assert_eq!(stats.cached_pdfs, 2);
}

#[tokio::test]
async fn hits_stay_in_memory_until_flushed() {
    let dir = TempDir::new().unwrap();
    let cache = open(&dir, Scripted::new()).await;
    let stats_file = cache.store().root().join("_stats.json");

    for _ in 0..5 {
        cache.fetch_path("example.com/a.pdf", false).await.unwrap();
    }
    assert!(!stats_file.exists());
    assert!(cache.flush_stats().await.unwrap());
    assert!(!cache.flush_stats().await.unwrap());
    drop(cache);

    let reopened = open(&dir, Scripted::new()).await;
    let stats = reopened.stats().await.unwrap();
    assert_eq!(stats.total_conversions, 1);
    assert_eq!(stats.total_reads, 5);
}
