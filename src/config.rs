//! Service configuration.
//!
//! Every knob the cache and the conversion adapter consume lives in
//! [`ServiceConfig`], built via [`ServiceConfigBuilder`]. The binary maps its
//! CLI flags (each with a `PDF2MD_*` environment fallback) onto the builder;
//! the library never reads the environment itself.

use crate::error::UnpdfError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for the caching conversion service.
///
/// # Example
/// ```rust
/// use unpdf::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .cache_dir("/var/cache/unpdf")
///     .ttl_days(7)
///     .domain("unpdf.it")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pdf_size_bytes(), 50 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory of the on-disk entry store. Default: `./cache`.
    pub cache_dir: PathBuf,

    /// Days before a cached conversion expires. `0` keeps entries forever. Default: 30.
    pub ttl_days: u32,

    /// Reject sources larger than this many megabytes. Default: 50.
    pub max_pdf_size_mb: u64,

    /// Budget for downloading a source PDF, in seconds. Default: 30.
    pub download_timeout_secs: u64,

    /// Budget for turning a downloaded PDF into markdown, in seconds. Default: 120.
    pub conversion_timeout_secs: u64,

    /// Public domain used in usage text and in image URLs inside generated
    /// markdown. A value with an explicit `http://` or `https://` prefix is
    /// used verbatim; otherwise `https://` is assumed. Default: `localhost:8000`.
    pub domain: String,

    /// Socket address the HTTP server listens on. Default: `0.0.0.0:8000`.
    pub bind: String,

    /// Interval between background eviction passes, in seconds. Default: 3600.
    pub eviction_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            ttl_days: 30,
            max_pdf_size_mb: 50,
            download_timeout_secs: 30,
            conversion_timeout_secs: 120,
            domain: "localhost:8000".to_string(),
            bind: "0.0.0.0:8000".to_string(),
            eviction_interval_secs: 3600,
        }
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Size ceiling in bytes, compared against `Content-Length` and the
    /// running byte count of a streaming download.
    pub fn max_pdf_size_bytes(&self) -> u64 {
        self.max_pdf_size_mb * MIB
    }

    /// Entry lifetime, or `None` when entries never expire.
    pub fn ttl(&self) -> Option<Duration> {
        if self.ttl_days == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.ttl_days) * 86_400))
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    /// Scheme + host prefix for absolute links into this service.
    pub fn public_base_url(&self) -> String {
        let domain = self.domain.trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn ttl_days(mut self, days: u32) -> Self {
        self.config.ttl_days = days;
        self
    }

    pub fn max_pdf_size_mb(mut self, mb: u64) -> Self {
        self.config.max_pdf_size_mb = mb;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind = addr.into();
        self
    }

    pub fn eviction_interval_secs(mut self, secs: u64) -> Self {
        self.config.eviction_interval_secs = secs.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, UnpdfError> {
        let c = &self.config;
        if c.max_pdf_size_mb == 0 {
            return Err(UnpdfError::InvalidConfig(
                "max PDF size must be ≥ 1 MB".into(),
            ));
        }
        if c.download_timeout_secs == 0 || c.conversion_timeout_secs == 0 {
            return Err(UnpdfError::InvalidConfig(
                "download and conversion timeouts must be ≥ 1s".into(),
            ));
        }
        if c.domain.trim().is_empty() {
            return Err(UnpdfError::InvalidConfig("domain must not be empty".into()));
        }
        if c.cache_dir.as_os_str().is_empty() {
            return Err(UnpdfError::InvalidConfig(
                "cache directory must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
