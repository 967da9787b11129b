//! Key derivation: inbound request path → normalized source URL → content address.
//!
//! The service is addressed by URL rewrite: `https://<domain>/<host>/<path>?<query>`
//! stands for `https://<host>/<path>?<query>`. [`SourceRequest::parse`] turns
//! the part after the service's own host into the canonical source URL, and
//! [`ContentAddress`] is the SHA-256 of that canonical string.
//!
//! Normalization steps:
//! 1. Strip a leading `/` and any `http://`, `https://` (or slash-collapsed
//!    `http:/`, `https:/`) prefix. Every source is fetched over https, so the
//!    insecure and secure spellings of one resource share one address.
//! 2. Split `host[:port]` from the path at the first `/`; no `/` is an error.
//! 3. Lowercase the host. The port stays part of the host identity.
//! 4. Drop a fragment. Keep path and query byte-for-byte (no reordering,
//!    no re-encoding).

use crate::error::ConversionFailure;
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a hex-encoded SHA-256 digest.
pub const ADDRESS_LEN: usize = 64;

/// Normalized identity of "the PDF at this URL, fetched over https".
///
/// Immutable once constructed. Two requests are the same source iff their
/// [`SourceRequest::url`] strings are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRequest {
    host: String,
    path: String,
    query: Option<String>,
    url: String,
}

impl SourceRequest {
    /// Parse `host[:port]/path[?query]`, optionally prefixed with a scheme.
    pub fn parse(raw: &str) -> Result<Self, ConversionFailure> {
        let rest = strip_scheme(raw.trim().trim_start_matches('/'));
        let rest = rest.split('#').next().unwrap_or_default();

        let (location, query) = match rest.split_once('?') {
            Some((loc, q)) => (loc, Some(q)),
            None => (rest, None),
        };

        let (host, path) = location
            .split_once('/')
            .ok_or_else(ConversionFailure::invalid_url)?;

        let host = host.to_ascii_lowercase();
        validate_host(&host)?;

        let query = query.filter(|q| !q.is_empty()).map(str::to_string);
        let url = match &query {
            Some(q) => format!("https://{host}/{path}?{q}"),
            None => format!("https://{host}/{path}"),
        };

        Ok(Self {
            host,
            path: path.to_string(),
            query,
            url,
        })
    }

    /// Parse a path and a separately delivered query string, as an HTTP
    /// router hands them over.
    pub fn from_parts(path: &str, query: Option<&str>) -> Result<Self, ConversionFailure> {
        match query.filter(|q| !q.is_empty()) {
            Some(q) => Self::parse(&format!("{path}?{q}")),
            None => Self::parse(path),
        }
    }

    /// `host` or `host:port`, lowercased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path without the leading slash, verbatim.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Canonical `https://` URL; both the fetch target and the hash input.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn address(&self) -> ContentAddress {
        ContentAddress::of(&self.url)
    }
}

impl fmt::Display for SourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Fixed-width lowercase hex SHA-256 of a canonical source URL.
///
/// Doubles as the cache key and as the entry's directory name, so any value
/// of this type is a safe single path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Hash a canonical source URL.
    pub fn of(canonical_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept an externally supplied address (e.g. from `/images/<hash>/…`)
    /// only if it has exactly the shape [`ContentAddress::of`] produces.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == ADDRESS_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the content address for a raw request path (everything after the
/// service's own host). Pure: no I/O, no shared state.
pub fn derive_key(raw_path: &str) -> Result<ContentAddress, ConversionFailure> {
    SourceRequest::parse(raw_path).map(|r| r.address())
}

/// Remove the service-owned `refresh` parameter from a query string.
///
/// Returns the query to forward upstream and whether `refresh=true` was
/// present. Only `refresh` pairs are cut; every other byte of the query,
/// empty segments included, is kept as received. `None` if nothing remains.
pub fn split_refresh_flag(query: &str) -> (Option<String>, bool) {
    let mut refresh = false;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            if name == "refresh" {
                refresh |= value == "true";
                false
            } else {
                true
            }
        })
        .collect();

    let forwarded = kept.join("&");
    ((!forwarded.is_empty()).then_some(forwarded), refresh)
}

fn strip_scheme(s: &str) -> &str {
    for prefix in ["https://", "http://", "https:/", "http:/"] {
        if s.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        {
            return &s[prefix.len()..];
        }
    }
    s
}

fn validate_host(host: &str) -> Result<(), ConversionFailure> {
    let suspicious = |c: char| c.is_whitespace() || matches!(c, '@' | '\\' | '%');
    if host.is_empty() || host.contains(suspicious) {
        return Err(ConversionFailure::invalid_url());
    }
    // Let the URL parser judge the authority: hostname/IP syntax and port range.
    let parsed = url::Url::parse(&format!("https://{host}/"))
        .map_err(|_| ConversionFailure::invalid_url())?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConversionFailure::invalid_url());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn parse_builds_https_url() {
        let r = SourceRequest::parse("example.com/paper.pdf").unwrap();
        assert_eq!(r.url(), "https://example.com/paper.pdf");
        assert_eq!(r.host(), "example.com");
        assert_eq!(r.path(), "paper.pdf");
        assert_eq!(r.query(), None);
    }

    #[test]
    fn leading_slash_is_ignored() {
        let a = derive_key("/example.com/paper.pdf").unwrap();
        let b = derive_key("example.com/paper.pdf").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key("example.com/paper.pdf").unwrap();
        let b = derive_key("example.com/paper.pdf").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ADDRESS_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn insecure_and_secure_schemes_collapse() {
        let plain = derive_key("example.com/a.pdf").unwrap();
        assert_eq!(derive_key("http://example.com/a.pdf").unwrap(), plain);
        assert_eq!(derive_key("https://example.com/a.pdf").unwrap(), plain);
        assert_eq!(derive_key("http:/example.com/a.pdf").unwrap(), plain);
        assert_eq!(derive_key("HTTP://example.com/a.pdf").unwrap(), plain);
    }

    #[test]
    fn query_is_part_of_identity() {
        let v2 = SourceRequest::parse("example.com/file.pdf?v=2").unwrap();
        let v3 = SourceRequest::parse("example.com/file.pdf?v=3").unwrap();
        assert_eq!(v2.url(), "https://example.com/file.pdf?v=2");
        assert_ne!(v2.address(), v3.address());
    }

    #[test]
    fn query_is_forwarded_verbatim() {
        let r = SourceRequest::parse("example.com/f.pdf?b=2&a=%20x").unwrap();
        assert_eq!(r.query(), Some("b=2&a=%20x"));
        assert_eq!(r.url(), "https://example.com/f.pdf?b=2&a=%20x");
    }

    #[test]
    fn empty_query_is_dropped() {
        let a = SourceRequest::parse("example.com/f.pdf?").unwrap();
        assert_eq!(a.url(), "https://example.com/f.pdf");
    }

    #[test]
    fn port_is_part_of_host_identity() {
        let a = SourceRequest::parse("example.com:8443/f.pdf").unwrap();
        assert_eq!(a.host(), "example.com:8443");
        assert_eq!(a.url(), "https://example.com:8443/f.pdf");
        assert_ne!(a.address(), derive_key("example.com/f.pdf").unwrap());
    }

    #[test]
    fn host_is_lowercased_path_is_not() {
        let r = SourceRequest::parse("Example.COM/Paper.PDF").unwrap();
        assert_eq!(r.url(), "https://example.com/Paper.PDF");
    }

    #[test]
    fn fragment_is_dropped() {
        let r = SourceRequest::parse("example.com/f.pdf#page=2").unwrap();
        assert_eq!(r.url(), "https://example.com/f.pdf");
    }

    #[test]
    fn from_parts_matches_parse() {
        let a = SourceRequest::from_parts("example.com/f.pdf", Some("v=1")).unwrap();
        let b = SourceRequest::parse("example.com/f.pdf?v=1").unwrap();
        assert_eq!(a, b);
        let c = SourceRequest::from_parts("example.com/f.pdf", Some("")).unwrap();
        assert_eq!(c.query(), None);
    }

    #[test]
    fn host_without_path_is_invalid() {
        let err = derive_key("example.com").unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidUrl);
    }

    #[test]
    fn malformed_hosts_are_invalid() {
        for raw in ["/a.pdf", "user@example.com/a.pdf", "exa mple.com/a.pdf", "example.com:99999/a.pdf", ""] {
            assert!(derive_key(raw).is_err(), "expected InvalidUrl for {raw:?}");
        }
    }

    #[test]
    fn content_address_parse_accepts_only_digests() {
        let key = derive_key("example.com/a.pdf").unwrap();
        assert_eq!(ContentAddress::parse(key.as_str()), Some(key.clone()));
        assert_eq!(ContentAddress::parse("../etc"), None);
        assert_eq!(ContentAddress::parse(&key.as_str().to_uppercase()), None);
        assert_eq!(ContentAddress::parse(&key.as_str()[..63]), None);
    }

    #[test]
    fn split_refresh_flag_strips_only_refresh() {
        assert_eq!(
            split_refresh_flag("v=2&refresh=true&x=1"),
            (Some("v=2&x=1".to_string()), true)
        );
        assert_eq!(split_refresh_flag("refresh=true"), (None, true));
        assert_eq!(split_refresh_flag("refresh=false&v=1"), (Some("v=1".to_string()), false));
        assert_eq!(split_refresh_flag("v=1"), (Some("v=1".to_string()), false));
        assert_eq!(split_refresh_flag(""), (None, false));
    }

    #[test]
    fn split_refresh_flag_keeps_empty_segments() {
        assert_eq!(
            split_refresh_flag("a=1&&b=2&"),
            (Some("a=1&&b=2&".to_string()), false)
        );
        assert_eq!(
            split_refresh_flag("a=1&&refresh=true&b=2&"),
            (Some("a=1&&b=2&".to_string()), true)
        );

        let (query, _) = split_refresh_flag("a=1&&b=2&");
        let sparse = SourceRequest::from_parts("example.com/f.pdf", query.as_deref()).unwrap();
        assert_eq!(sparse.url(), "https://example.com/f.pdf?a=1&&b=2&");
        let dense = SourceRequest::from_parts("example.com/f.pdf", Some("a=1&b=2")).unwrap();
        assert_ne!(sparse.address(), dense.address());
    }

    #[test]
    fn refresh_value_must_be_exactly_true() {
        assert_eq!(split_refresh_flag("refresh=TRUE"), (None, false));
        assert_eq!(split_refresh_flag("refresh=1&v=1"), (Some("v=1".to_string()), false));
        assert_eq!(split_refresh_flag("refresh"), (None, false));
    }
}
