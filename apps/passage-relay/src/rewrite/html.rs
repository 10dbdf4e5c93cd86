//! HTML rewriting: URL-bearing attributes, srcset candidates, inline style
//! references, meta refreshes, and the two shim injection points.
//!
//! Textual pattern matching only, case-insensitive on names; content inside
//! `<script>` and `<style>` bodies is never modified here (scripts and
//! stylesheets get their own passes when fetched as resources).

use passage_core::rewrite_reference;

use super::{css, RewriteContext};
use crate::shim;

/// Attributes rewritten wherever they appear: `href` (`a`, `link`), `src`
/// (`script`, `img`, `iframe`, `video`, `audio`, `source`), `action`
/// (`form`).
const URL_ATTRIBUTES: &[&str] = &["href", "src", "action"];

pub fn rewrite_html(html: &str, ctx: &RewriteContext) -> String {
    let mut out = rewrite_outside_raw_text(html, ctx);
    if !out.contains(shim::SHIM_MARKER) {
        out = inject_shims(&out, ctx);
    }
    out
}

/// Apply the markup rewrites to everything except `<script>`/`<style>` body
/// text. Opening tags (and their attributes) still get rewritten.
fn rewrite_outside_raw_text(html: &str, ctx: &RewriteContext) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len() + 1024);
    let mut pos = 0;

    loop {
        let next_script = find_tag_open(&lower, pos, "script");
        let next_style = find_tag_open(&lower, pos, "style");
        let (tag_start, close_tag) = match (next_script, next_style) {
            (Some(s), Some(t)) if s <= t => (s, "</script>"),
            (Some(s), None) => (s, "</script>"),
            (_, Some(t)) => (t, "</style>"),
            (None, None) => break,
        };
        let Some(open_end_rel) = html[tag_start..].find('>') else {
            break;
        };
        let open_end = tag_start + open_end_rel + 1;

        out.push_str(&rewrite_markup_chunk(&html[pos..open_end], ctx));

        if html[..open_end].ends_with("/>") {
            pos = open_end;
            continue;
        }
        match lower[open_end..].find(close_tag) {
            Some(body_len) => {
                let body_end = open_end + body_len;
                out.push_str(&html[open_end..body_end]);
                pos = body_end;
            }
            None => {
                out.push_str(&html[open_end..]);
                return out;
            }
        }
    }

    out.push_str(&rewrite_markup_chunk(&html[pos..], ctx));
    out
}

/// Byte offset of the next `<name` tag open at or after `from`, requiring a
/// real tag boundary so `<style` does not match inside `<styleguide`.
fn find_tag_open(lower: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("<{name}");
    let mut search = from;
    while let Some(rel) = lower[search..].find(&needle) {
        let at = search + rel;
        let after = lower.as_bytes().get(at + needle.len());
        match after {
            Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => return Some(at),
            None => return None,
            _ => search = at + needle.len(),
        }
    }
    None
}

fn rewrite_markup_chunk(chunk: &str, ctx: &RewriteContext) -> String {
    let mut out = chunk.to_string();
    for attr in URL_ATTRIBUTES {
        out = rewrite_attr(&out, attr, ctx);
    }
    out = rewrite_srcset(&out, ctx);
    out = rewrite_style_attrs(&out, ctx);
    out = rewrite_meta_refresh(&out, ctx);
    out = strip_integrity(&out);
    out = downgrade_crossorigin(&out);
    out
}

/// Rewrite `attr="value"` and `attr='value'` occurrences, preserving the
/// quote style. The attribute name must stand alone (`src` never matches
/// `data-src`).
fn rewrite_attr(html: &str, attr: &str, ctx: &RewriteContext) -> String {
    transform_attr_values(html, attr, |value| {
        rewrite_reference(value, &ctx.base_url, &ctx.public_origin)
    })
}

fn rewrite_srcset(html: &str, ctx: &RewriteContext) -> String {
    transform_attr_values(html, "srcset", |value| {
        let mut changed = false;
        let rewritten: Vec<String> = value
            .split(',')
            .map(|candidate| {
                let candidate = candidate.trim();
                let mut parts = candidate.splitn(2, char::is_whitespace);
                let url_part = parts.next().unwrap_or_default();
                let descriptor = parts.next();
                match rewrite_reference(url_part, &ctx.base_url, &ctx.public_origin) {
                    Some(new_url) => {
                        changed = true;
                        match descriptor {
                            Some(d) => format!("{new_url} {}", d.trim()),
                            None => new_url,
                        }
                    }
                    None => candidate.to_string(),
                }
            })
            .collect();
        changed.then(|| rewritten.join(", "))
    })
}

fn rewrite_style_attrs(html: &str, ctx: &RewriteContext) -> String {
    transform_attr_values(html, "style", |value| {
        let rewritten = css::rewrite_css_urls(value, ctx);
        (rewritten != value).then_some(rewritten)
    })
}

/// `<meta http-equiv="refresh" content="5; url=/next">` — rewrite the URL
/// part of any `content` value that carries the refresh shape.
fn rewrite_meta_refresh(html: &str, ctx: &RewriteContext) -> String {
    transform_attr_values(html, "content", |value| {
        let (delay, rest) = value.split_once(';')?;
        if delay.trim().parse::<u32>().is_err() {
            return None;
        }
        let rest = rest.trim_start();
        if !rest[..rest.len().min(4)].eq_ignore_ascii_case("url=") {
            return None;
        }
        let target = rest[4..].trim();
        let rewritten = rewrite_reference(target, &ctx.base_url, &ctx.public_origin)?;
        Some(format!("{}; url={rewritten}", delay.trim()))
    })
}

/// Remove `integrity="..."` attributes: rewritten subresources can no longer
/// match their original digests.
fn strip_integrity(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find("integrity=") {
        let at = pos + rel;
        let boundary_ok = at > 0 && lower.as_bytes()[at - 1].is_ascii_whitespace();
        let vstart = at + "integrity=".len();
        let q = match html.as_bytes().get(vstart) {
            Some(&b) if boundary_ok && (b == b'"' || b == b'\'') => b as char,
            _ => {
                out.push_str(&html[pos..vstart]);
                pos = vstart;
                continue;
            }
        };
        match html[vstart + 1..].find(q) {
            Some(end_rel) => {
                // Drop the preceding whitespace along with the attribute.
                out.push_str(html[pos..at].trim_end_matches(|c: char| c.is_ascii_whitespace()));
                pos = vstart + 1 + end_rel + 1;
            }
            None => {
                out.push_str(&html[pos..vstart]);
                pos = vstart;
            }
        }
    }

    out.push_str(&html[pos..]);
    out
}

/// `crossorigin="use-credentials"` would make the browser demand CORS
/// approval the rewritten origin cannot give; downgrade to `anonymous`.
fn downgrade_crossorigin(html: &str) -> String {
    transform_attr_values(html, "crossorigin", |value| {
        (!value.eq_ignore_ascii_case("anonymous")).then(|| "anonymous".to_string())
    })
}

/// Shared scanner: find `name="..."`/`name='...'` attribute values and let
/// `transform` decide the replacement. Returning `None` keeps the original.
fn transform_attr_values<F>(html: &str, name: &str, transform: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let lower = html.to_ascii_lowercase();
    let needle = format!("{name}=");
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel) = lower[pos..].find(&needle) {
        let at = pos + rel;
        let boundary_ok = at > 0 && lower.as_bytes()[at - 1].is_ascii_whitespace();
        let vstart = at + needle.len();
        let q = match html.as_bytes().get(vstart) {
            Some(&b) if boundary_ok && (b == b'"' || b == b'\'') => b as char,
            _ => {
                out.push_str(&html[pos..vstart]);
                pos = vstart;
                continue;
            }
        };
        match html[vstart + 1..].find(q) {
            Some(end_rel) => {
                let vend = vstart + 1 + end_rel;
                let value = &html[vstart + 1..vend];
                out.push_str(&html[pos..=vstart]);
                match transform(value) {
                    Some(replacement) => out.push_str(&replacement),
                    None => out.push_str(value),
                }
                out.push(q);
                pos = vend + 1;
            }
            None => {
                out.push_str(&html[pos..vstart]);
                pos = vstart;
            }
        }
    }

    out.push_str(&html[pos..]);
    out
}

/// Inject the early shim as the first child of `<head>` (it must patch
/// `fetch`/`XMLHttpRequest` before any origin script captures them) and the
/// main shim just before `</head>`, falling back to the start of `<body>`,
/// then to appending.
fn inject_shims(html: &str, ctx: &RewriteContext) -> String {
    let early = shim::early_shim(ctx);
    let main = shim::main_shim(ctx);
    let lower = html.to_ascii_lowercase();

    let mut out = String::with_capacity(html.len() + early.len() + main.len());
    let early_at = find_tag_open(&lower, 0, "head")
        .or_else(|| find_tag_open(&lower, 0, "html"))
        .and_then(|tag_start| html[tag_start..].find('>').map(|rel| tag_start + rel + 1));
    match early_at {
        Some(insert) => {
            out.push_str(&html[..insert]);
            out.push_str(&early);
            out.push_str(&html[insert..]);
        }
        None => {
            out.push_str(&early);
            out.push_str(html);
        }
    }

    let lower = out.to_ascii_lowercase();
    if let Some(head_close) = lower.find("</head>") {
        out.insert_str(head_close, &main);
    } else if let Some(body_insert) = find_tag_open(&lower, 0, "body")
        .and_then(|tag_start| out[tag_start..].find('>').map(|rel| tag_start + rel + 1))
    {
        out.insert_str(body_insert, &main);
    } else {
        out.push_str(&main);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::fingerprint;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://www.example.com/explore").unwrap(),
            public_origin: "http://127.0.0.1:3003".into(),
        }
    }

    fn decoded_target(rewritten: &str) -> String {
        let fp: String = rewritten
            .split("__cpo=")
            .nth(1)
            .unwrap()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        fingerprint::decode(&fp).unwrap().to_string()
    }

    #[test]
    fn anchors_and_links_are_rewritten() {
        let html = r#"<a href="/foryou">For You</a><link rel="stylesheet" href="app.css">"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"<a href="http://127.0.0.1:3003/foryou?__cpo="#));
        assert!(out.contains(r#"href="http://127.0.0.1:3003/app.css?__cpo="#));
    }

    #[test]
    fn src_attributes_are_rewritten_but_data_src_is_not() {
        let html = r#"<img src="//cdn.example.com/a.png" data-src="/lazy.png">"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"src="http://127.0.0.1:3003/a.png?__cpo="#));
        assert!(out.contains(r#"data-src="/lazy.png""#));
    }

    #[test]
    fn form_actions_are_rewritten() {
        let html = r#"<form method="post" action="/login"><input></form>"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"action="http://127.0.0.1:3003/login?__cpo="#));
        assert_eq!(decoded_target(&out), "https://www.example.com/");
    }

    #[test]
    fn srcset_candidates_keep_descriptors() {
        let html = r#"<img srcset="/a.png 1x, /b.png 2x">"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains("/a.png?__cpo="));
        assert!(out.contains(" 1x, "));
        assert!(out.contains(" 2x"));
    }

    #[test]
    fn inline_style_urls_are_rewritten() {
        let html = r#"<div style="background: url(/bg.jpg)">x</div>"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains("url(http://127.0.0.1:3003/bg.jpg?__cpo="));
    }

    #[test]
    fn meta_refresh_targets_are_rewritten() {
        let html = r#"<meta http-equiv="refresh" content="3; url=/next">"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"content="3; url=http://127.0.0.1:3003/next?__cpo="#));
    }

    #[test]
    fn plain_meta_content_is_untouched() {
        let html = r#"<meta name="description" content="about things">"#;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"content="about things""#));
    }

    #[test]
    fn script_and_style_bodies_are_untouched() {
        let html = concat!(
            r#"<script>var u = "/api/feed";</script>"#,
            r#"<style>body { background: url(/inline.png) }</style>"#,
            r#"<script src="/app.js"></script>"#,
        );
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r#"var u = "/api/feed";"#));
        assert!(out.contains("url(/inline.png)"));
        assert!(out.contains(r#"src="http://127.0.0.1:3003/app.js?__cpo="#));
    }

    #[test]
    fn integrity_stripped_and_crossorigin_downgraded() {
        let html = r#"<script src="/a.js" integrity="sha384-abc" crossorigin="use-credentials"></script>"#;
        let out = rewrite_html(html, &ctx());
        assert!(!out.contains("integrity="));
        assert!(out.contains(r#"crossorigin="anonymous""#));
    }

    #[test]
    fn inert_references_stay() {
        let html = r##"<a href="#top">top</a><img src="data:image/gif;base64,AA">"##;
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(r##"href="#top""##));
        assert!(out.contains(r#"src="data:image/gif;base64,AA""#));
    }

    #[test]
    fn early_shim_is_first_child_of_head() {
        let html = "<html><head><script src=\"/first.js\"></script></head><body></body></html>";
        let out = rewrite_html(html, &ctx());
        let head_at = out.find("<head>").unwrap();
        let shim_at = out[head_at..].find(crate::shim::SHIM_MARKER).unwrap();
        let first_script_at = out[head_at..].find("first.js").unwrap();
        assert!(shim_at < first_script_at, "early shim must precede origin scripts");
    }

    #[test]
    fn main_shim_lands_before_head_close() {
        let html = "<html><head></head><body></body></html>";
        let out = rewrite_html(html, &ctx());
        let head_close = out.find("</head>").unwrap();
        let main_at = out.find(crate::shim::MAIN_MARKER).unwrap();
        assert!(main_at < head_close);
    }

    #[test]
    fn headless_documents_still_get_both_shims() {
        let html = "<p>bare fragment</p>";
        let out = rewrite_html(html, &ctx());
        assert!(out.contains(crate::shim::SHIM_MARKER));
        assert!(out.contains(crate::shim::MAIN_MARKER));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let html = r#"<html><head></head><body><a href="/x">x</a><img srcset="/a.png 1x"></body></html>"#;
        let once = rewrite_html(html, &ctx());
        let twice = rewrite_html(&once, &ctx());
        assert_eq!(once, twice);
    }
}
