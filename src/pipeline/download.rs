//! Source download: fetch a PDF over https into a temp file.
//!
//! pdfium needs a file-system path, so the body is streamed into a file
//! inside a [`TempDir`] that is removed when the returned [`Downloaded`] is
//! dropped. The size ceiling is enforced twice: against `Content-Length`
//! before reading any body, and against the running byte count while
//! streaming, so a missing or lying header cannot push a download past it.

use crate::error::ConversionFailure;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";
const NOT_PUBLIC: &str = "It may not be publicly accessible.";

/// A downloaded PDF on local disk. The file lives as long as this value.
#[derive(Debug)]
pub struct Downloaded {
    path: PathBuf,
    bytes: u64,
    _dir: TempDir,
}

impl Downloaded {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// Build the HTTP client used for source downloads.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ConversionFailure> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConversionFailure::internal(format!("HTTP client: {e}")))
}

/// Download `url`, rejecting non-PDFs and anything over `max_bytes`.
pub async fn download_pdf(
    client: &reqwest::Client,
    url: &str,
    max_bytes: u64,
    timeout: Duration,
) -> Result<Downloaded, ConversionFailure> {
    info!("Downloading PDF from: {}", url);
    let on_error = |e: reqwest::Error| request_failure(e, timeout);

    let response = client.get(url).send().await.map_err(on_error)?;
    check_status(response.status())?;

    if response.content_length().is_some_and(|len| len > max_bytes) {
        return Err(ConversionFailure::too_large(max_bytes));
    }

    let dir = TempDir::new().map_err(|e| ConversionFailure::internal(format!("temp dir: {e}")))?;
    let path = dir.path().join("source.pdf");
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| ConversionFailure::internal(format!("temp file: {e}")))?;

    let mut magic = Vec::with_capacity(PDF_MAGIC.len());
    let mut written: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(on_error)?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(ConversionFailure::too_large(max_bytes));
        }
        if magic.len() < PDF_MAGIC.len() {
            let take = (PDF_MAGIC.len() - magic.len()).min(chunk.len());
            magic.extend_from_slice(&chunk[..take]);
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ConversionFailure::internal(format!("temp file: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| ConversionFailure::internal(format!("temp file: {e}")))?;

    if !looks_like_pdf(&magic) {
        debug!("Rejected non-PDF body from {} ({} bytes)", url, written);
        return Err(ConversionFailure::invalid_url());
    }

    info!("Downloaded {} bytes from {}", written, url);
    Ok(Downloaded {
        path,
        bytes: written,
        _dir: dir,
    })
}

/// Map an upstream status to the failure taxonomy. Redirects are followed
/// by the client, so only the final status is seen here.
fn check_status(status: StatusCode) -> Result<(), ConversionFailure> {
    match status {
        StatusCode::NOT_FOUND => Err(ConversionFailure::not_found()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ConversionFailure::download_failed(NOT_PUBLIC))
        }
        s if s.is_client_error() || s.is_server_error() => Err(
            ConversionFailure::download_failed(format!("Upstream returned HTTP {}.", s.as_u16())),
        ),
        _ => Ok(()),
    }
}

fn request_failure(e: reqwest::Error, timeout: Duration) -> ConversionFailure {
    if e.is_timeout() {
        ConversionFailure::timeout("Download", timeout.as_secs())
    } else {
        debug!("Download error: {}", e);
        ConversionFailure::download_failed(NOT_PUBLIC)
    }
}

fn looks_like_pdf(head: &[u8]) -> bool {
    head.starts_with(PDF_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert_eq!(
            check_status(StatusCode::NOT_FOUND).unwrap_err().kind,
            FailureKind::NotFound
        );
        let forbidden = check_status(StatusCode::FORBIDDEN).unwrap_err();
        assert_eq!(forbidden.kind, FailureKind::DownloadFailed);
        assert!(forbidden.message.contains("publicly accessible"));
        let upstream = check_status(StatusCode::BAD_GATEWAY).unwrap_err();
        assert_eq!(upstream.kind, FailureKind::DownloadFailed);
        assert!(upstream.message.contains("502"), "got: {}", upstream.message);
    }

    #[test]
    fn magic_bytes() {
        assert!(looks_like_pdf(b"%PDF-1.7\n"));
        assert!(looks_like_pdf(b"%PDF"));
        assert!(!looks_like_pdf(b"<html>"));
        assert!(!looks_like_pdf(b"%PD"));
        assert!(!looks_like_pdf(b""));
    }
}
