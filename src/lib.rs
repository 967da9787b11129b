//! # unpdf
//!
//! Serve any public PDF as Markdown by URL rewrite, backed by a
//! request-coalescing disk cache.
//!
//! `GET https://<domain>/arxiv.org/pdf/2301.00001v1.pdf` downloads
//! `https://arxiv.org/pdf/2301.00001v1.pdf`, converts it once, stores the
//! result on disk, and answers every later request for the same URL from the
//! store.
//!
//! ## Request Flow
//!
//! ```text
//! request path
//!  │
//!  ├─ 1. Key       normalise to https://host/path?query, SHA-256 → key
//!  ├─ 2. Lookup    entry store hit? serve it (X-Cached: true)
//!  ├─ 3. Coalesce  first request per key leads, the rest wait on it
//!  ├─ 4. Convert   download + pdfium extraction (Leader only)
//!  ├─ 5. Publish   stage → rename → swap meta.json (atomic)
//!  └─ 6. Release   Leader's outcome handed to every waiter
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unpdf::{PdfCache, PdfiumConverter, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder().cache_dir("./cache").build()?;
//!     let converter = Arc::new(PdfiumConverter::new(&config)?);
//!     let cache = PdfCache::open(config, converter).await?;
//!
//!     let served = cache.fetch_path("arxiv.org/pdf/2301.00001v1.pdf", false).await?;
//!     println!("{}", served.markdown());
//!     eprintln!("cached: {}, pages: {}", served.cached, served.page_count());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `server` | on | axum router and `serve()` for the HTTP surface |
//! | `cli`    | on | Enables the `unpdf` binary (clap + anyhow + tracing-subscriber) |
//! | `bundled` | off | Embed the pdfium shared library in the binary at build time |
//!
//! Library-only use:
//! ```toml
//! unpdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod converter;
pub mod error;
pub mod key;
pub mod pipeline;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod usage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{run_maintenance, PdfCache, Served};
pub use coalesce::{Follower, InflightTable, Leader, Outcome, Role};
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use converter::{Conversion, ConvertRequest, Converter, PdfiumConverter};
pub use error::{ConversionFailure, FailureKind, UnpdfError};
pub use key::{derive_key, split_refresh_flag, ContentAddress, SourceRequest};
pub use store::{
    CacheEntry, EntryMeta, EntryStore, ImageBlob, Lookup, NewEntry, StoreStats, SweepReport,
};
