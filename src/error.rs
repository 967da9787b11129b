//! Error types for the unpdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConversionFailure`] (**per request**): one source URL could not be
//!   served (malformed path, upstream 404, oversize PDF, timeout). It is
//!   `Clone` because the Leader of a coalesced conversion hands the very same
//!   failure to every Follower waiting on that key. Each kind maps to one
//!   HTTP status via [`FailureKind::status_code`].
//!
//! * [`UnpdfError`] (**fatal**): the service itself cannot run (bad
//!   configuration, unusable cache root, bind failure). Returned from
//!   constructors and maintenance passes, never shown to an HTTP client.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The failure taxonomy every request-level error falls into.
///
/// None of these are retried inside the request that observed them; a later
/// request for the same source starts from scratch (no negative caching).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The request path is not `host[:port]/path[?query]`.
    InvalidUrl,
    /// The downloaded bytes are not a parseable PDF.
    InvalidPdf,
    /// The upstream server answered 404.
    NotFound,
    /// Network or upstream fault while downloading.
    DownloadFailed,
    /// The source exceeds the configured size ceiling.
    TooLarge,
    /// Download or conversion exceeded its time budget.
    Timeout,
    /// Store I/O fault or an abandoned conversion.
    Internal,
}

impl FailureKind {
    /// HTTP status used when this failure is rendered as a response.
    pub fn status_code(self) -> u16 {
        match self {
            FailureKind::InvalidUrl | FailureKind::InvalidPdf => 400,
            FailureKind::NotFound => 404,
            FailureKind::TooLarge => 413,
            FailureKind::DownloadFailed => 502,
            FailureKind::Timeout => 504,
            FailureKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidUrl => "invalid_url",
            FailureKind::InvalidPdf => "invalid_pdf",
            FailureKind::NotFound => "not_found",
            FailureKind::DownloadFailed => "download_failed",
            FailureKind::TooLarge => "too_large",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request-level failure: a [`FailureKind`] plus a human-readable message.
///
/// The message is what ends up under the `# Error` heading of the markdown
/// response body, so it is phrased for the person who sent the URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConversionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ConversionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_url() -> Self {
        Self::new(FailureKind::InvalidUrl, "URL does not point to a valid PDF.")
    }

    pub fn invalid_pdf() -> Self {
        Self::new(FailureKind::InvalidPdf, "Could not parse PDF.")
    }

    pub fn not_found() -> Self {
        Self::new(FailureKind::NotFound, "PDF not found at source URL.")
    }

    pub fn download_failed(reason: impl fmt::Display) -> Self {
        Self::new(
            FailureKind::DownloadFailed,
            format!("Could not download PDF. {reason}"),
        )
    }

    pub fn too_large(max_bytes: u64) -> Self {
        Self::new(
            FailureKind::TooLarge,
            format!("PDF exceeds maximum size of {}MB.", max_bytes / (1024 * 1024)),
        )
    }

    pub fn timeout(what: &str, secs: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("{what} timed out after {secs}s."),
        )
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(FailureKind::Internal, format!("Internal error: {detail}"))
    }

    /// HTTP status for this failure.
    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Markdown body returned to the client for this failure.
    pub fn to_markdown(&self) -> String {
        format!("# Error\n\n{}\n", self.message)
    }
}

impl From<UnpdfError> for ConversionFailure {
    fn from(e: UnpdfError) -> Self {
        ConversionFailure::internal(e)
    }
}

/// All fatal errors returned by the unpdf library.
///
/// Request-level failures use [`ConversionFailure`] instead.
#[derive(Debug, Error)]
pub enum UnpdfError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Store errors ──────────────────────────────────────────────────────
    /// A filesystem operation inside the cache root failed.
    #[error("Cache I/O failed on '{path}': {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `meta.json` or `_stats.json` could not be (de)serialised.
    #[error("Corrupt cache metadata '{path}': {source}")]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Image filename escapes the entry directory or is otherwise unusable.
    #[error("Invalid image name '{0}'")]
    InvalidImageName(String),

    // ── Server errors ─────────────────────────────────────────────────────
    /// Could not bind the listening socket.
    #[error("Failed to bind '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UnpdfError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UnpdfError::CacheIo {
            path: path.into(),
            source,
        }
    }
}
