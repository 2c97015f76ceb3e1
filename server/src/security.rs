//! Standard security middleware.
//!
//! - [`cors_layer`] allows the configured client origin with credentials
//! - [`security_headers`] adds conservative browser security headers
//! - [`parameter_pollution_guard`] collapses repeated query parameters

use std::borrow::Cow;

use axum::extract::{OriginalUri, Request};
use axum::http::header::{self, HeaderName};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderValue, Method, Uri};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{AllowOrigin, CorsLayer};
use url::form_urlencoded;

use crate::config::{Config, ConfigError};

/// Headers added to every response that does not already set them.
const SECURITY_HEADERS: [(&str, &str); 12] = [
    (
        "content-security-policy",
        "default-src 'self';base-uri 'self';font-src 'self' https: data:;\
         form-action 'self';frame-ancestors 'self';img-src 'self' data:;\
         object-src 'none';script-src 'self';script-src-attr 'none';\
         style-src 'self' https: 'unsafe-inline';upgrade-insecure-requests",
    ),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("origin-agent-cluster", "?1"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

/// Build the CORS layer for the web client.
///
/// # Errors
///
/// Returns `ConfigError::InvalidFormat` if the client origin is not a valid
/// header value.
pub fn cors_layer(config: &Config) -> Result<CorsLayer, ConfigError> {
    let origin =
        HeaderValue::from_str(config.client_origin()).map_err(|e| ConfigError::InvalidFormat {
            var: "CLIENT_BASE_URL".to_string(),
            message: e.to_string(),
        })?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]))
}

/// Adds [`SECURITY_HEADERS`] to the response, keeping any value a handler set.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    for (name, value) in SECURITY_HEADERS {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert(HeaderValue::from_static(value));
    }

    response
}

/// Keeps only the last value of each repeated query parameter.
///
/// The untouched request URI stays available through [`OriginalUri`].
pub async fn parameter_pollution_guard(mut request: Request, next: Next) -> Response {
    if let Some(uri) = collapse_query(request.uri()) {
        if request.extensions().get::<OriginalUri>().is_none() {
            let original = OriginalUri(request.uri().clone());
            request.extensions_mut().insert(original);
        }
        *request.uri_mut() = uri;
    }

    next.run(request).await
}

/// Returns the URI with duplicate query keys collapsed, or `None` if the
/// query has no duplicates.
fn collapse_query(uri: &Uri) -> Option<Uri> {
    let query = uri.query()?;
    let collapsed = collapse_duplicate_params(query)?;

    let path_and_query = if collapsed.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{collapsed}", uri.path())
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

fn collapse_duplicate_params(query: &str) -> Option<String> {
    let mut total = 0;
    let mut kept: Vec<(Cow<'_, str>, Cow<'_, str>)> = Vec::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        total += 1;
        match kept.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => kept.push((key, value)),
        }
    }

    if kept.len() == total {
        return None;
    }

    Some(
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish(),
    )
}
