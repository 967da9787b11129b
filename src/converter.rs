//! The conversion seam: source URL in, markdown and images out.
//!
//! The cache only ever talks to the [`Converter`] trait. [`PdfiumConverter`]
//! is the production implementation (download, then pdfium text and image
//! extraction); tests substitute scripted converters to drive the cache's
//! coalescing and failure paths without a network.

use crate::config::ServiceConfig;
use crate::error::ConversionFailure;
use crate::pipeline::{download, extract, postprocess};
use crate::store::ImageBlob;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// Everything a converter needs to know about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    /// Canonical `https://` source URL.
    pub source_url: String,
    pub max_size_bytes: u64,
    pub download_timeout: Duration,
    pub conversion_timeout: Duration,
}

impl ConvertRequest {
    pub fn new(source_url: impl Into<String>, config: &ServiceConfig) -> Self {
        Self {
            source_url: source_url.into(),
            max_size_bytes: config.max_pdf_size_bytes(),
            download_timeout: config.download_timeout(),
            conversion_timeout: config.conversion_timeout(),
        }
    }

    /// Upper bound on the whole job: download plus conversion.
    pub fn total_budget(&self) -> Duration {
        self.download_timeout + self.conversion_timeout
    }
}

/// A successful conversion. Image links in `markdown` refer to entries of
/// `images` by bare name (`![](fig1.png)`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversion {
    pub markdown: String,
    pub images: Vec<ImageBlob>,
    pub page_count: usize,
}

/// Turns a source URL into markdown.
///
/// Implementations must be safe to call concurrently for different URLs;
/// the cache guarantees at most one call per key at a time.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, request: &ConvertRequest) -> Result<Conversion, ConversionFailure>;
}

/// Default converter: https download + pdfium extraction.
#[derive(Debug, Clone)]
pub struct PdfiumConverter {
    client: reqwest::Client,
}

impl PdfiumConverter {
    pub fn new(config: &ServiceConfig) -> Result<Self, ConversionFailure> {
        Ok(Self {
            client: download::http_client(config.download_timeout())?,
        })
    }
}

#[async_trait]
impl Converter for PdfiumConverter {
    #[instrument(skip_all, fields(url = %request.source_url))]
    async fn convert(&self, request: &ConvertRequest) -> Result<Conversion, ConversionFailure> {
        let pdf = download::download_pdf(
            &self.client,
            &request.source_url,
            request.max_size_bytes,
            request.download_timeout,
        )
        .await?;

        let started = Instant::now();
        let extracted = tokio::time::timeout(request.conversion_timeout, extract::extract(pdf))
            .await
            .map_err(|_| {
                ConversionFailure::timeout("Conversion", request.conversion_timeout.as_secs())
            })??;

        let markdown = postprocess::clean_markdown(&extracted.markdown);
        info!(
            pages = extracted.page_count,
            images = extracted.images.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extraction complete"
        );

        Ok(Conversion {
            markdown,
            images: extracted.images,
            page_count: extracted.page_count,
        })
    }
}
