use url::Url;

use crate::fingerprint::{self, FINGERPRINT_PARAM};

/// Returns false for references the rewriters must leave untouched.
pub fn should_rewrite(reference: &str) -> bool {
    let r = reference.trim();
    if r.is_empty() || r.starts_with('#') {
        return false;
    }
    for skip in ["data:", "blob:", "javascript:", "about:", "mailto:"] {
        if r.len() >= skip.len() && r[..skip.len()].eq_ignore_ascii_case(skip) {
            return false;
        }
    }
    // Already routed through the proxy.
    if r.contains("__cpo=") {
        return false;
    }
    true
}

/// Resolve a URL reference against its base document URL.
///
/// `//host/x` keeps the base scheme, `/x` keeps the base origin, schemeless
/// references resolve against the directory portion of the base path, and
/// anything carrying its own scheme passes through unchanged.
pub fn absolutize(reference: &str, base_url: &Url) -> Option<Url> {
    let r = reference.trim();
    if r.starts_with("//") {
        return Url::parse(&format!("{}:{}", base_url.scheme(), r)).ok();
    }
    if r.starts_with('/') {
        return Url::parse(&format!("{}{}", origin_of(base_url), r)).ok();
    }
    if has_scheme(r) {
        return Url::parse(r).ok();
    }
    base_url.join(r).ok()
}

/// Build the proxy URL for an absolute target:
/// `<public_origin><path><query><'&'|'?'>__cpo=<fingerprint>`.
///
/// Path and query are preserved verbatim so origin-side routers keep seeing
/// their native paths. The fingerprint encodes the target's origin, so one
/// token stays stable across a whole site.
pub fn proxy_url(abs: &Url, public_origin: &str) -> String {
    let path = abs.path();
    let (query_part, separator) = match abs.query() {
        Some(q) if !q.is_empty() => (format!("?{q}"), '&'),
        _ => (String::new(), '?'),
    };
    format!(
        "{}{}{}{}{}={}",
        public_origin.trim_end_matches('/'),
        path,
        query_part,
        separator,
        FINGERPRINT_PARAM,
        fingerprint::encode(&origin_of(abs)),
    )
}

/// Absolutise `reference` and, when it names a proxyable target, return the
/// rewritten proxy URL. References that must not be touched come back `None`.
pub fn rewrite_reference(reference: &str, base_url: &Url, public_origin: &str) -> Option<String> {
    if !should_rewrite(reference) {
        return None;
    }
    let abs = absolutize(reference, base_url)?;
    match abs.scheme() {
        "http" | "https" => Some(proxy_url(&abs, public_origin)),
        _ => None,
    }
}

pub fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

fn has_scheme(reference: &str) -> bool {
    let Some(colon) = reference.find(':') else {
        return false;
    };
    let scheme = &reference[..colon];
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.example.com/watch/video?id=1").unwrap()
    }

    #[test]
    fn skips_inert_references() {
        for r in ["#top", "data:image/png;base64,AAA", "blob:abc", "javascript:void(0)", ""] {
            assert!(!should_rewrite(r), "{r} should be skipped");
        }
    }

    #[test]
    fn skips_already_proxied_references() {
        assert!(!should_rewrite("https://proxy.local/a?__cpo=aGk"));
    }

    #[test]
    fn protocol_relative_keeps_base_scheme() {
        let abs = absolutize("//cdn.example.com/app.js", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://cdn.example.com/app.js");
    }

    #[test]
    fn root_relative_keeps_base_origin() {
        let abs = absolutize("/foryou", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://www.example.com/foryou");
    }

    #[test]
    fn schemeless_resolves_against_directory() {
        let abs = absolutize("poster.jpg", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://www.example.com/watch/poster.jpg");
        let abs = absolutize("../other.css", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://www.example.com/other.css");
    }

    #[test]
    fn absolute_passes_through() {
        let abs = absolutize("https://other.net/x", &base()).unwrap();
        assert_eq!(abs.as_str(), "https://other.net/x");
    }

    #[test]
    fn proxy_url_preserves_path_and_query() {
        let abs = Url::parse("https://www.example.com/foryou?tab=hot").unwrap();
        let rewritten = proxy_url(&abs, "http://127.0.0.1:3003");
        assert!(rewritten.starts_with("http://127.0.0.1:3003/foryou?tab=hot&__cpo="));
        let fp = rewritten.split("__cpo=").nth(1).unwrap();
        assert_eq!(
            fingerprint::decode(fp).unwrap().as_str(),
            "https://www.example.com/"
        );
    }

    #[test]
    fn proxy_url_without_query_uses_question_mark() {
        let abs = Url::parse("https://www.example.com/foryou").unwrap();
        let rewritten = proxy_url(&abs, "http://127.0.0.1:3003");
        assert!(rewritten.starts_with("http://127.0.0.1:3003/foryou?__cpo="));
    }

    #[test]
    fn fingerprint_is_stable_across_one_site() {
        let a = Url::parse("https://www.example.com/foryou").unwrap();
        let b = Url::parse("https://www.example.com/explore?x=1").unwrap();
        let fp_a = proxy_url(&a, "http://p").split("__cpo=").nth(1).unwrap().to_string();
        let fp_b = proxy_url(&b, "http://p").split("__cpo=").nth(1).unwrap().to_string();
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn rewrite_reference_round_trips() {
        let rewritten = rewrite_reference("/api/feed", &base(), "http://127.0.0.1:3003").unwrap();
        assert!(rewritten.starts_with("http://127.0.0.1:3003/api/feed?__cpo="));
        let fp = rewritten.split("__cpo=").nth(1).unwrap();
        assert_eq!(
            fingerprint::decode(fp).unwrap().host_str(),
            Some("www.example.com")
        );
    }
}
