//! Error types and plain-text error responses for the mirror

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response body type shared by the mirror and admin servers
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header carrying the machine-readable error code
pub const X_MIRROR_ERROR: &str = "X-Mirror-Error";

/// Error codes for client-visible mirror failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// No site registered for the host or any of its parents
    UnknownHost,
    /// Crawler matched the spider list but not the good-spider list
    CrawlerBlocked,
    /// Upstream failed and nothing usable was cached
    UpstreamUnavailable,
    /// Request could not be read
    BadRequest,
}

impl MirrorErrorCode {
    /// Get the HTTP status code for this error
    ///
    /// Everything a visitor of a known domain can see is a 404.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MirrorErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            MirrorErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            MirrorErrorCode::CrawlerBlocked => StatusCode::NOT_FOUND,
            MirrorErrorCode::UpstreamUnavailable => StatusCode::NOT_FOUND,
            MirrorErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Mirror-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            MirrorErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            MirrorErrorCode::UnknownHost => "UNKNOWN_HOST",
            MirrorErrorCode::CrawlerBlocked => "CRAWLER_BLOCKED",
            MirrorErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            MirrorErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// Errors raised while compiling or locating a site
#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("invalid upstream url '{url}': {source}")]
    InvalidUpstreamUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("upstream url '{0}' has no host")]
    MissingUpstreamHost(String),
    #[error("site domain must not be empty")]
    EmptyDomain,
    #[error("no site registered for host '{0}'")]
    SiteNotFound(String),
}

/// Wrap bytes into the boxed response body type
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a plain-text error response with the X-Mirror-Error header
pub fn error_response(code: MirrorErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_MIRROR_ERROR, code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            MirrorErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(MirrorErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(MirrorErrorCode::CrawlerBlocked.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            MirrorErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_response_is_plain_text() {
        let response = error_response(MirrorErrorCode::UpstreamUnavailable, "check upstream");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get(X_MIRROR_ERROR).unwrap(),
            "UPSTREAM_UNAVAILABLE"
        );
    }

    #[test]
    fn test_site_error_messages() {
        let err = SiteError::SiteNotFound("localhost".to_string());
        assert_eq!(err.to_string(), "no site registered for host 'localhost'");

        let err = SiteError::MissingUpstreamHost("data:text/plain".to_string());
        assert!(err.to_string().contains("has no host"));
    }
}
