//! HTTP surface: an axum router over a [`PdfCache`].
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /` | usage text |
//! | `GET /health` | `ok` |
//! | `GET /stats` | JSON counters |
//! | `GET /llms.txt`, `/llms-full.txt` | agent-facing docs |
//! | `GET /skill` | installable agent skill |
//! | `GET /images/{key}/{*filename}` | one extracted image |
//! | anything else | `/<host>/<path>[?query]` conversion |
//!
//! Every response except images and `/stats` is `text/markdown`, errors
//! included.

use crate::cache::{run_maintenance, PdfCache, Served};
use crate::error::{ConversionFailure, UnpdfError};
use crate::key::{split_refresh_flag, ContentAddress, SourceRequest};
use crate::usage;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{info, warn};

pub const MARKDOWN: &str = "text/markdown; charset=utf-8";
pub const IMAGE_CACHE_CONTROL: &str = "public, max-age=31536000";

pub const X_SOURCE_URL: &str = "x-source-url";
pub const X_CACHED: &str = "x-cached";
pub const X_CONVERSION_TIME_MS: &str = "x-conversion-time-ms";
pub const X_PAGE_COUNT: &str = "x-page-count";

/// Build the service router.
pub fn router(cache: PdfCache) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/llms.txt", get(llms_txt))
        .route("/llms-full.txt", get(llms_full_txt))
        .route("/skill", get(skill))
        .route("/images/{key}/{*filename}", get(image))
        .fallback(convert)
        .with_state(cache)
}

/// Bind `config.bind`, start the maintenance task, and serve until Ctrl-C.
pub async fn serve(cache: PdfCache) -> Result<(), UnpdfError> {
    let addr = cache.config().bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| UnpdfError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("Listening on http://{}", addr);

    let maintenance = tokio::spawn(run_maintenance(cache.clone()));
    let result = axum::serve(listener, router(cache.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| UnpdfError::Internal(format!("server: {e}")));
    maintenance.abort();
    if let Err(e) = cache.flush_stats().await {
        warn!("Failed to persist usage counters: {}", e);
    }
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn markdown(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, MARKDOWN)], body).into_response()
}

fn failure_response(failure: &ConversionFailure) -> Response {
    let status =
        StatusCode::from_u16(failure.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    markdown(status, failure.to_markdown())
}

async fn index(State(cache): State<PdfCache>) -> Response {
    markdown(StatusCode::OK, usage::usage_markdown(cache.config()))
}

async fn health() -> &'static str {
    "ok"
}

async fn llms_txt(State(cache): State<PdfCache>) -> Response {
    markdown(StatusCode::OK, usage::llms_txt(cache.config()))
}

async fn llms_full_txt(State(cache): State<PdfCache>) -> Response {
    markdown(StatusCode::OK, usage::llms_full_txt(cache.config()))
}

async fn skill(State(cache): State<PdfCache>) -> Response {
    markdown(StatusCode::OK, usage::skill_md(cache.config()))
}

async fn stats(State(cache): State<PdfCache>) -> Response {
    match cache.stats().await {
        Ok(s) => Json(serde_json::json!({
            "total_conversions": s.total_conversions,
            "total_reads": s.total_reads,
            "cached_pdfs": s.cached_pdfs,
        }))
        .into_response(),
        Err(e) => failure_response(&ConversionFailure::from(e)),
    }
}

async fn image(
    State(cache): State<PdfCache>,
    Path((key, filename)): Path<(String, String)>,
) -> Response {
    let not_found = || markdown(StatusCode::NOT_FOUND, "# Error\n\nImage not found.\n".into());
    let Some(key) = ContentAddress::parse(&key) else {
        return not_found();
    };
    match cache.image(&key, &filename).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, image_content_type(&filename)),
                (header::CACHE_CONTROL, IMAGE_CACHE_CONTROL),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) | Err(UnpdfError::InvalidImageName(_)) => not_found(),
        Err(e) => {
            warn!(key = %key, "Image read failed: {}", e);
            failure_response(&ConversionFailure::from(e))
        }
    }
}

async fn convert(State(cache): State<PdfCache>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return markdown(
            StatusCode::METHOD_NOT_ALLOWED,
            "# Error\n\nOnly GET is supported.\n".into(),
        );
    }

    let (query, refresh) = match uri.query() {
        Some(q) => split_refresh_flag(q),
        None => (None, false),
    };
    let source = match SourceRequest::from_parts(uri.path(), query.as_deref()) {
        Ok(source) => source,
        Err(failure) => return failure_response(&failure),
    };

    match cache.fetch(&source, refresh).await {
        Ok(served) => served_response(&served),
        Err(failure) => failure_response(&failure),
    }
}

fn served_response(served: &Served) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MARKDOWN));
    let fields = [
        (X_SOURCE_URL, served.source_url().to_string()),
        (X_CACHED, served.cached.to_string()),
        (X_CONVERSION_TIME_MS, served.conversion_ms().to_string()),
        (X_PAGE_COUNT, served.page_count().to_string()),
    ];
    for (name, value) in fields {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    (StatusCode::OK, headers, served.markdown().to_string()).into_response()
}

fn image_content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(image_content_type("page-1-img-0.png"), "image/png");
        assert_eq!(image_content_type("photo.JPG"), "image/jpeg");
        assert_eq!(image_content_type("noext"), "application/octet-stream");
    }

    #[test]
    fn failures_render_with_their_status() {
        let resp = failure_response(&ConversionFailure::too_large(50 * 1024 * 1024));
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], MARKDOWN);
    }
}
