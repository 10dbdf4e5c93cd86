//! Body rewriting: every embedded URL in HTML, CSS, and JavaScript bodies is
//! routed back through the public origin with a `__cpo` fingerprint.
//!
//! The rewriters are string-level scanners, not parsers. They must preserve
//! byte-for-byte everything outside the matched patterns, stay robust
//! against malformed documents, and be idempotent: a body that already
//! carries `__cpo=` references comes back unchanged.

pub mod css;
pub mod html;
pub mod js;

use url::Url;

#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// URL of the document (or resource) being rewritten; relative
    /// references resolve against it.
    pub base_url: Url,
    /// Public origin of this deployment, e.g. `https://pass.example.org`.
    pub public_origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    Js,
    Other,
}

impl ContentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/html" | "application/xhtml+xml" => ContentKind::Html,
            "text/css" => ContentKind::Css,
            "text/javascript" | "application/javascript" | "application/x-javascript"
            | "application/ecmascript" => ContentKind::Js,
            _ => ContentKind::Other,
        }
    }
}

/// Rewrite a response body for its content kind.
///
/// Returns `None` when the body is untouched (binary kinds, or text that is
/// not valid UTF-8 — a failed rewrite must degrade to relaying the original
/// bytes, never to failing the request).
pub fn rewrite_body(body: &[u8], kind: ContentKind, ctx: &RewriteContext) -> Option<Vec<u8>> {
    if kind == ContentKind::Other {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;
    let rewritten = match kind {
        ContentKind::Html => html::rewrite_html(text, ctx),
        ContentKind::Css => css::rewrite_css(text, ctx),
        ContentKind::Js => js::rewrite_js(text, ctx),
        ContentKind::Other => unreachable!(),
    };
    Some(rewritten.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kinds_classify_with_parameters() {
        assert_eq!(
            ContentKind::from_content_type("text/html; charset=utf-8"),
            ContentKind::Html
        );
        assert_eq!(ContentKind::from_content_type("text/css"), ContentKind::Css);
        assert_eq!(
            ContentKind::from_content_type("application/javascript"),
            ContentKind::Js
        );
        assert_eq!(
            ContentKind::from_content_type("application/json"),
            ContentKind::Other
        );
    }

    #[test]
    fn binary_bodies_pass_through() {
        let ctx = RewriteContext {
            base_url: Url::parse("https://example.com/").unwrap(),
            public_origin: "http://127.0.0.1:3003".into(),
        };
        assert!(rewrite_body(&[0xff, 0xfe, 0x00], ContentKind::Html, &ctx).is_none());
        assert!(rewrite_body(b"{\"a\":1}", ContentKind::Other, &ctx).is_none());
    }
}
