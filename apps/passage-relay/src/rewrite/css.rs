//! CSS rewriting: `url(...)` references and `@import` targets.

use passage_core::rewrite_reference;

use super::RewriteContext;

pub fn rewrite_css(css: &str, ctx: &RewriteContext) -> String {
    rewrite_imports(&rewrite_css_urls(css, ctx), ctx)
}

/// Rewrite every `url(...)` reference, preserving the original quoting.
/// `data:` URIs and already-proxied references stay untouched.
pub fn rewrite_css_urls(css: &str, ctx: &RewriteContext) -> String {
    let lower = css.to_ascii_lowercase();
    let mut out = String::with_capacity(css.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find("url(") {
        let start = pos + rel;
        // `url` must not be the tail of a longer identifier.
        let boundary_ok = start == 0
            || !matches!(css.as_bytes()[start - 1], b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_');
        let inner_start = start + 4;
        if !boundary_ok {
            out.push_str(&css[pos..inner_start]);
            pos = inner_start;
            continue;
        }
        let Some(close_rel) = css[inner_start..].find(')') else {
            break;
        };
        let inner_end = inner_start + close_rel;
        let raw_inner = &css[inner_start..inner_end];
        let trimmed = raw_inner.trim();
        let (quote, value) = match trimmed.as_bytes().first() {
            Some(b'"') => ("\"", trimmed.trim_matches('"')),
            Some(b'\'') => ("'", trimmed.trim_matches('\'')),
            _ => ("", trimmed),
        };

        out.push_str(&css[pos..inner_start]);
        match rewrite_reference(value, &ctx.base_url, &ctx.public_origin) {
            Some(rewritten) => {
                out.push_str(quote);
                out.push_str(&rewritten);
                out.push_str(quote);
            }
            None => out.push_str(raw_inner),
        }
        out.push(')');
        pos = inner_end + 1;
    }

    out.push_str(&css[pos..]);
    out
}

/// Rewrite quoted `@import "..."` targets (`@import url(...)` is already
/// covered by the `url(...)` pass).
fn rewrite_imports(css: &str, ctx: &RewriteContext) -> String {
    let lower = css.to_ascii_lowercase();
    let mut out = String::with_capacity(css.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find("@import") {
        let at = pos + rel;
        let mut cursor = at + "@import".len();
        while css[cursor..].starts_with(char::is_whitespace) {
            cursor += 1;
        }
        let Some(quote) = css[cursor..]
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
        else {
            out.push_str(&css[pos..cursor]);
            pos = cursor;
            continue;
        };
        let vstart = cursor + 1;
        let Some(end_rel) = css[vstart..].find(quote) else {
            break;
        };
        let vend = vstart + end_rel;
        let value = &css[vstart..vend];

        out.push_str(&css[pos..vstart]);
        match rewrite_reference(value, &ctx.base_url, &ctx.public_origin) {
            Some(rewritten) => out.push_str(&rewritten),
            None => out.push_str(value),
        }
        pos = vend;
    }

    out.push_str(&css[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::fingerprint;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://cdn.example.com/styles/app.css").unwrap(),
            public_origin: "http://127.0.0.1:3003".into(),
        }
    }

    #[test]
    fn url_references_are_rewritten_with_quoting_preserved() {
        let css = r#"body { background: url("/bg.png"); } .a { mask: url(icons.svg) }"#;
        let out = rewrite_css(css, &ctx());
        assert!(out.contains(r#"url("http://127.0.0.1:3003/bg.png?__cpo="#));
        assert!(out.contains("url(http://127.0.0.1:3003/styles/icons.svg?__cpo="));
    }

    #[test]
    fn data_uris_are_untouched() {
        let css = "a { background: url(data:image/png;base64,AAAA) }";
        assert_eq!(rewrite_css(css, &ctx()), css);
    }

    #[test]
    fn imports_are_rewritten() {
        let css = r#"@import "theme.css"; @import url('/reset.css');"#;
        let out = rewrite_css(css, &ctx());
        assert!(out.contains(r#"@import "http://127.0.0.1:3003/styles/theme.css?__cpo="#));
        assert!(out.contains("url('http://127.0.0.1:3003/reset.css?__cpo="));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let css = r#"body { background: url("/bg.png"); }"#;
        let once = rewrite_css(css, &ctx());
        let twice = rewrite_css(&once, &ctx());
        assert_eq!(once, twice);
    }

    #[test]
    fn rewritten_fingerprints_decode_to_the_target_origin() {
        let css = "a { background: url(/bg.png) }";
        let out = rewrite_css(css, &ctx());
        assert!(out.contains("url(http://127.0.0.1:3003/bg.png?__cpo="));
        let fp = out.split("__cpo=").nth(1).unwrap().trim_end_matches([')', ' ', '}']);
        assert_eq!(
            fingerprint::decode(fp).unwrap().as_str(),
            "https://cdn.example.com/"
        );
    }
}
