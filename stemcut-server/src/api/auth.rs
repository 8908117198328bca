//! API key authentication
//!
//! Protected routes go through [`require_api_key`]. Handlers that read the
//! key from their own body (`/confirm_download`) call [`authorize`] directly.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use stemcut_common::api::auth::{bearer_token, check_api_key, ApiKeyCheck, KeySource};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::AppState;

/// Largest body buffered while looking for an `api_key` field
const MAX_AUTH_BODY: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
struct KeyFields {
    api_key: Option<String>,
}

/// Check the key presented in headers, query string or body
///
/// Order: `Authorization: Bearer`, `X-API-Key`, query `api_key`, body `api_key`.
pub fn check_request(
    expected: &str,
    headers: &HeaderMap,
    query_key: Option<&str>,
    body_key: Option<&str>,
) -> ApiKeyCheck {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let api_key_header = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    check_api_key(
        expected,
        [
            (KeySource::BearerHeader, bearer),
            (KeySource::ApiKeyHeader, api_key_header),
            (KeySource::Query, query_key),
            (KeySource::Body, body_key),
        ],
    )
}

/// Turn a failed check into a 401
pub fn authorize(
    expected: &str,
    headers: &HeaderMap,
    query_key: Option<&str>,
    body_key: Option<&str>,
) -> Result<ApiKeyCheck, ApiError> {
    let check = check_request(expected, headers, query_key, body_key);
    match &check {
        ApiKeyCheck::Disabled | ApiKeyCheck::Accepted(_) => Ok(check),
        ApiKeyCheck::Missing => Err(ApiError::Unauthorized(
            "API key required (Authorization: Bearer, X-API-Key, or api_key)".to_string(),
        )),
        ApiKeyCheck::Rejected(source) => {
            warn!(?source, "Invalid API key presented");
            Err(ApiError::Unauthorized("Invalid API key".to_string()))
        }
    }
}

/// `api_key` from a raw query string
pub fn query_api_key(query: Option<&str>) -> Option<String> {
    form_field(query?, "api_key")
}

/// `api_key` from a JSON or urlencoded body
pub fn body_api_key(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if is_form(headers) {
        return std::str::from_utf8(body).ok().and_then(|s| form_field(s, "api_key"));
    }
    serde_json::from_slice::<KeyFields>(body).ok()?.api_key
}

pub fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Decoded value of `name` in an `a=b&c=d` string
pub fn form_field(encoded: &str, name: &str) -> Option<String> {
    encoded.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != name {
            return None;
        }
        let value = value.replace('+', " ");
        Some(
            urlencoding::decode(&value)
                .map(|v| v.into_owned())
                .unwrap_or(value),
        )
    })
}

/// Middleware for administrative routes
///
/// Buffers the body to look for an `api_key` field, then hands the request on
/// unchanged.
pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.settings.auth_enabled() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let query_key = query_api_key(parts.uri.query());

    let bytes = match to_bytes(body, MAX_AUTH_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to buffer body for auth: {}", e);
            return ApiError::BadRequest("Failed to read request body".to_string()).into_response();
        }
    };
    let body_key = body_api_key(&parts.headers, &bytes);

    if let Err(e) = authorize(
        &state.settings.api_key,
        &parts.headers,
        query_key.as_deref(),
        body_key.as_deref(),
    ) {
        return e.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_form_field_decodes() {
        assert_eq!(form_field("a=1&track_name=My%20Song+Mix", "track_name").as_deref(), Some("My Song Mix"));
        assert_eq!(form_field("a=1", "b"), None);
        assert_eq!(form_field("flag", "flag").as_deref(), Some(""));
    }

    #[test]
    fn test_header_key_beats_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        let check = check_request("secret", &headers, Some("wrong"), None);
        assert_eq!(check, ApiKeyCheck::Accepted(KeySource::ApiKeyHeader));
    }

    #[test]
    fn test_body_key_json_and_form() {
        let mut headers = HeaderMap::new();
        assert_eq!(body_api_key(&headers, br#"{"api_key":"k"}"#).as_deref(), Some("k"));
        assert_eq!(body_api_key(&headers, b"not json"), None);

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        assert_eq!(body_api_key(&headers, b"track_name=x&api_key=k2").as_deref(), Some("k2"));
    }

    #[test]
    fn test_authorize_errors() {
        let headers = HeaderMap::new();
        assert!(matches!(
            authorize("secret", &headers, None, None),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            authorize("secret", &headers, None, Some("nope")),
            Err(ApiError::Unauthorized(_))
        ));
        assert_eq!(authorize("", &headers, None, None).unwrap(), ApiKeyCheck::Disabled);
    }
}
