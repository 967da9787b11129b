//! Pipeline stages behind the default [`PdfiumConverter`](crate::converter::PdfiumConverter).
//!
//! Each submodule implements exactly one transformation step and is
//! testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! download ──▶ extract ──▶ encode ──▶ postprocess
//!  (https)     (pdfium)     (PNG)      (cleanup)
//! ```
//!
//! 1. [`download`]: stream the source into a temp file under the size and
//!    time limits, checking the `%PDF` magic bytes
//! 2. [`extract`]: pull page text and embedded images; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`encode`]: re-encode each embedded image as PNG
//! 4. [`postprocess`]: deterministic text cleanup, plus the image-link
//!    rewrite the cache applies once it knows the entry's key

pub mod download;
pub mod encode;
pub mod extract;
pub mod postprocess;
