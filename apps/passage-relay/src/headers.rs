//! Response-header policy: what gets stripped, what gets rewritten, and the
//! CORS surface the relay always advertises.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

/// Security policies that would stop rewritten content from loading. The
/// rewrite itself invalidates them, so they are dropped wholesale.
pub const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-security-policy",
    "x-frame-options",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
    "permissions-policy",
    "x-xss-protection",
];

/// Hop-by-hop headers that never survive a proxy hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
];

/// Upstream anti-bot challenge markers. Relayed verbatim and exposed via
/// CORS; the client shim refuses to auto-retry responses carrying them.
pub const CHALLENGE_HEADERS: &[&str] = &["x-challenge-id", "x-challenge-type"];

pub const EXPOSED_HEADERS: &str =
    "x-csrf-token, set-cookie, x-challenge-id, x-challenge-type";

pub const ALLOWED_METHODS: &str = "GET,POST,PUT,DELETE,PATCH,OPTIONS";
pub const ALLOWED_HEADERS: &str =
    "Content-Type, Accept, x-csrf-token, Cookie, Authorization, X-Requested-With";

/// Build the relayed response headers from an upstream response.
///
/// `body_mutated` is true when the body was decompressed or rewritten, which
/// invalidates `Content-Length` and `Content-Encoding`. `public_is_https`
/// decides whether relayed cookies may keep their `Secure` attribute.
pub fn relay_response_headers(
    upstream: &HeaderMap,
    body_mutated: bool,
    public_is_https: bool,
) -> HeaderMap {
    let mut relayed = HeaderMap::new();

    for (name, value) in upstream {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str())
            || HOP_BY_HOP_HEADERS.contains(&lower.as_str())
        {
            continue;
        }
        if body_mutated && (lower == "content-length" || lower == "content-encoding") {
            continue;
        }
        if lower == "set-cookie" {
            if let Ok(raw) = value.to_str() {
                let rewritten = rewrite_set_cookie(raw, public_is_https);
                if let Ok(v) = HeaderValue::from_str(&rewritten) {
                    relayed.append(name.clone(), v);
                }
            }
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }

    apply_cors(&mut relayed);
    relayed
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-credentials"),
        HeaderValue::from_static("true"),
    );
    headers.insert(
        HeaderName::from_static("access-control-expose-headers"),
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
}

/// Rewrite one `Set-Cookie` line so the cookie binds to the public origin:
/// `Domain=` dropped, `Secure` dropped on plain-HTTP deployments, and
/// `SameSite` forced to `Lax` so top-level navigations keep the session.
pub fn rewrite_set_cookie(raw: &str, public_is_https: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (idx, piece) in raw.split(';').enumerate() {
        let trimmed = piece.trim();
        if idx == 0 {
            parts.push(trimmed.to_string());
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("domain=") || lower.starts_with("samesite") {
            continue;
        }
        if lower == "secure" && !public_is_https {
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    parts.push("SameSite=Lax".to_string());
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_policies_are_stripped() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("text/html"));
        upstream.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'"),
        );
        upstream.insert("x-frame-options", HeaderValue::from_static("DENY"));
        upstream.insert(
            "cross-origin-opener-policy",
            HeaderValue::from_static("same-origin"),
        );

        let relayed = relay_response_headers(&upstream, false, true);
        for stripped in STRIPPED_RESPONSE_HEADERS {
            assert!(!relayed.contains_key(*stripped), "{stripped} must be gone");
        }
        assert_eq!(relayed.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn length_and_encoding_dropped_when_body_changed() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-length", HeaderValue::from_static("1234"));
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));

        let relayed = relay_response_headers(&upstream, true, true);
        assert!(!relayed.contains_key("content-length"));
        assert!(!relayed.contains_key("content-encoding"));

        let untouched = relay_response_headers(&upstream, false, true);
        assert!(untouched.contains_key("content-length"));
    }

    #[test]
    fn set_cookie_loses_domain_and_forces_samesite() {
        let rewritten = rewrite_set_cookie(
            "sid=abc; Domain=.example.com; Path=/; Secure; SameSite=None; HttpOnly",
            false,
        );
        assert_eq!(rewritten, "sid=abc; Path=/; HttpOnly; SameSite=Lax");
    }

    #[test]
    fn set_cookie_keeps_secure_on_https_public_origin() {
        let rewritten = rewrite_set_cookie("sid=abc; Secure", true);
        assert_eq!(rewritten, "sid=abc; Secure; SameSite=Lax");
    }

    #[test]
    fn csrf_and_challenge_tokens_are_relayed_and_exposed() {
        let mut upstream = HeaderMap::new();
        upstream.insert("x-csrf-token", HeaderValue::from_static("tok"));
        upstream.insert("x-challenge-id", HeaderValue::from_static("c1"));

        let relayed = relay_response_headers(&upstream, false, true);
        assert_eq!(relayed.get("x-csrf-token").unwrap(), "tok");
        assert_eq!(relayed.get("x-challenge-id").unwrap(), "c1");
        let exposed = relayed
            .get("access-control-expose-headers")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(exposed.contains("x-csrf-token"));
        assert!(exposed.contains("x-challenge-id"));
    }
}
