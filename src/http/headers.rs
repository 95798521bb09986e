//! Hop-by-hop header handling.
//!
//! # Responsibilities
//! - Strip connection-scoped headers before a message crosses a hop
//! - Honour headers nominated by the `Connection` header
//!
//! # Design Decisions
//! - `Proxy-*` headers are treated as hop-by-hop as a family
//! - End-to-end headers are left untouched, including their order

use hyper::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers that only describe the current connection.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "http2-settings",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || name.starts_with("proxy-")
}

/// Remove hop-by-hop headers and any header listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(&name);
    }

    let hop: Vec<HeaderName> = headers.keys().filter(|n| is_hop_by_hop(n)).cloned().collect();
    for name in hop {
        headers.remove(&name);
    }
}

/// True if a comma-separated header contains `token` (case-insensitive).
pub fn has_token(headers: &HeaderMap, name: impl AsRef<str>, token: &str) -> bool {
    headers
        .get_all(name.as_ref())
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn strips_standard_and_nominated_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("content-type"));
        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn token_matching_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade, HTTP2-Settings"));
        assert!(has_token(&headers, "connection", "upgrade"));
        assert!(has_token(&headers, "connection", "http2-settings"));
        assert!(!has_token(&headers, "connection", "close"));
    }
}
