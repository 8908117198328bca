//! API key validation
//!
//! Clients present the configured `API_KEY` in one of:
//! - `Authorization: Bearer <key>` header
//! - `X-API-Key: <key>` header
//! - `api_key` query parameter
//! - `api_key` field of a JSON or form body
//!
//! An empty configured key disables checking. This module holds only pure
//! functions; the axum middleware lives in the server crate.

use sha2::{Digest, Sha256};

/// Where a presented key was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    BearerHeader,
    ApiKeyHeader,
    Query,
    Body,
}

/// Authentication outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyCheck {
    /// No key configured, everything passes
    Disabled,
    Accepted(KeySource),
    Missing,
    Rejected(KeySource),
}

impl ApiKeyCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ApiKeyCheck::Disabled | ApiKeyCheck::Accepted(_))
    }
}

/// Extract the key from an `Authorization` header value
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Compare two keys through their SHA-256 digests so that the comparison
/// does not short-circuit on the first differing byte
pub fn keys_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the first presented candidate against the configured key
///
/// Candidates are tried in the order given; the first present one decides.
pub fn check_api_key<'a>(
    expected: &str,
    candidates: impl IntoIterator<Item = (KeySource, Option<&'a str>)>,
) -> ApiKeyCheck {
    if expected.is_empty() {
        return ApiKeyCheck::Disabled;
    }

    for (source, value) in candidates {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            return if keys_match(value, expected) {
                ApiKeyCheck::Accepted(source)
            } else {
                ApiKeyCheck::Rejected(source)
            };
        }
    }

    ApiKeyCheck::Missing
}
