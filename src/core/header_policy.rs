//! Header hygiene for transparent forwarding.
//!
//! Three concerns live here: the hop-by-hop scrub set applied to both
//! directions, stripping of inbound credential headers before substitution,
//! and detection of the caller's auth scheme so the upstream credential is
//! injected the same way the caller presented theirs.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

/// Hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Credential headers stripped from the inbound request before the upstream
/// credential is injected.
const AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

/// How the caller presented their credential; the upstream credential is
/// injected using the same scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `x-goog-api-key: <key>` (Gemini style).
    GoogApiKey,
    /// `x-api-key: <key>` (Anthropic style).
    XApiKey,
    /// `Authorization: <prefix><key>`, where prefix is e.g. `"Bearer "`.
    Authorization(String),
}

impl AuthScheme {
    /// Header name and value carrying `api_key` in this scheme.
    pub fn apply(&self, api_key: &str) -> Option<(HeaderName, HeaderValue)> {
        match self {
            AuthScheme::GoogApiKey => Some((
                HeaderName::from_static("x-goog-api-key"),
                HeaderValue::from_str(api_key).ok()?,
            )),
            AuthScheme::XApiKey => Some((
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_str(api_key).ok()?,
            )),
            AuthScheme::Authorization(prefix) => Some((
                axum::http::header::AUTHORIZATION,
                HeaderValue::from_str(format!("{prefix}{api_key}").trim()).ok()?,
            )),
        }
    }
}

/// Detect the caller's credential scheme. Explicit API-key headers win over
/// the Authorization header; a caller with no credential header at all gets
/// the standard Bearer scheme.
pub fn detect_auth_scheme(headers: &HeaderMap) -> AuthScheme {
    if headers.contains_key("x-goog-api-key") {
        return AuthScheme::GoogApiKey;
    }
    if headers.contains_key("x-api-key") {
        return AuthScheme::XApiKey;
    }
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        return match value.split_once(' ') {
            Some((scheme, _)) => AuthScheme::Authorization(format!("{scheme} ")),
            None => AuthScheme::Authorization(String::new()),
        };
    }
    AuthScheme::Authorization("Bearer ".to_string())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn is_auth_header(name: &HeaderName) -> bool {
    AUTH_HEADERS.contains(&name.as_str())
}

/// Copy inbound request headers for forwarding: hop-by-hop headers, `Host`,
/// `Content-Length` and all credential headers are removed. `Host` is set by
/// the client from the target URL; `Content-Length` is recomputed after any
/// body rewrite.
pub fn outbound_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || is_auth_header(name)
            || name == axum::http::header::HOST
            || name == axum::http::header::CONTENT_LENGTH
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Copy upstream response headers for the caller: hop-by-hop headers and
/// `Content-Length` are dropped (the local server re-emits framing based on
/// how the body is re-sent).
pub fn inbound_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_detect_scheme_bearer() {
        let h = headers(&[("authorization", "Bearer sk-local")]);
        assert_eq!(
            detect_auth_scheme(&h),
            AuthScheme::Authorization("Bearer ".to_string())
        );
    }

    #[test]
    fn test_detect_scheme_bare_authorization() {
        let h = headers(&[("authorization", "sk-local")]);
        assert_eq!(
            detect_auth_scheme(&h),
            AuthScheme::Authorization(String::new())
        );
    }

    #[test]
    fn test_detect_scheme_x_api_key() {
        let h = headers(&[
            ("x-api-key", "sk-local"),
            ("authorization", "Bearer other"),
        ]);
        assert_eq!(detect_auth_scheme(&h), AuthScheme::XApiKey);
    }

    #[test]
    fn test_detect_scheme_goog_wins() {
        let h = headers(&[("x-goog-api-key", "sk-local"), ("x-api-key", "sk-other")]);
        assert_eq!(detect_auth_scheme(&h), AuthScheme::GoogApiKey);
    }

    #[test]
    fn test_detect_scheme_defaults_to_bearer() {
        assert_eq!(
            detect_auth_scheme(&HeaderMap::new()),
            AuthScheme::Authorization("Bearer ".to_string())
        );
    }

    #[test]
    fn test_apply_scheme() {
        let (name, value) = AuthScheme::Authorization("Bearer ".to_string())
            .apply("sk-upstream")
            .unwrap();
        assert_eq!(name.as_str(), "authorization");
        assert_eq!(value.to_str().unwrap(), "Bearer sk-upstream");

        let (name, value) = AuthScheme::XApiKey.apply("sk-upstream").unwrap();
        assert_eq!(name.as_str(), "x-api-key");
        assert_eq!(value.to_str().unwrap(), "sk-upstream");
    }

    #[test]
    fn test_outbound_scrubs_hop_by_hop_and_credentials() {
        let h = headers(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("host", "gateway.local"),
            ("content-length", "42"),
            ("authorization", "Bearer sk-local"),
            ("x-api-key", "sk-local"),
            ("x-goog-api-key", "sk-local"),
            ("content-type", "application/json"),
            ("x-custom", "preserved"),
        ]);
        let out = outbound_request_headers(&h);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-custom").unwrap(), "preserved");
    }

    #[test]
    fn test_response_headers_keep_content_type() {
        let h = headers(&[
            ("content-type", "text/event-stream"),
            ("content-length", "100"),
            ("transfer-encoding", "chunked"),
            ("x-ratelimit-remaining", "99"),
        ]);
        let out = inbound_response_headers(&h);
        assert_eq!(out.get("content-type").unwrap(), "text/event-stream");
        assert_eq!(out.get("x-ratelimit-remaining").unwrap(), "99");
        assert!(out.get("content-length").is_none());
        assert!(out.get("transfer-encoding").is_none());
    }
}
