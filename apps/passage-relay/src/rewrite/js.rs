//! JavaScript rewriting: only unambiguous URL string literals are touched.
//!
//! A light tokenizing pass tracks strings, comments, regexes, and the
//! enclosing call expression, so literals inside other literals are never
//! altered. Dynamic and concatenated URLs are left for the client shim to
//! catch at runtime.

use passage_core::{proxy_url, should_rewrite};
use url::Url;

use super::RewriteContext;

/// Full-URL literals are only rewritten when their host lands on this
/// captcha/embed allowlist, keeping the static rewriter's reach scoped.
const EMBED_HOST_ALLOWLIST: &[&str] = &[
    "arkoselabs.com",
    "funcaptcha.com",
    "hcaptcha.com",
    "recaptcha.net",
    "gstatic.com",
];

#[derive(Debug)]
struct CallFrame {
    name: String,
    arg_index: usize,
    brace_depth: usize,
    bracket_depth: usize,
}

pub fn rewrite_js(src: &str, ctx: &RewriteContext) -> String {
    let bytes = src.as_bytes();
    let mut out = String::with_capacity(src.len() + 256);
    let mut frames: Vec<CallFrame> = Vec::new();
    let mut last_significant: Option<char> = None;
    let mut last_word = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = src[i..].find('\n').map_or(src.len(), |r| i + r);
                out.push_str(&src[i..end]);
                i = end;
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = src[i + 2..].find("*/").map_or(src.len(), |r| i + 2 + r + 2);
                out.push_str(&src[i..end]);
                i = end;
            }
            '/' if regex_can_start(last_significant, &last_word) => {
                let end = scan_regex(bytes, i);
                out.push_str(&src[i..end]);
                last_significant = Some('/');
                last_word.clear();
                i = end;
            }
            '\'' | '"' => {
                let (end, value) = scan_string(src, i, c);
                match rewrite_literal(&value, frames.last(), ctx) {
                    Some(rewritten) => {
                        out.push(c);
                        out.push_str(&rewritten);
                        out.push(c);
                    }
                    None => out.push_str(&src[i..end]),
                }
                last_significant = Some(c);
                last_word.clear();
                i = end;
            }
            '`' => {
                let end = scan_template(bytes, i);
                out.push_str(&src[i..end]);
                last_significant = Some('`');
                last_word.clear();
                i = end;
            }
            '(' => {
                frames.push(CallFrame {
                    name: callee_name(&out),
                    arg_index: 0,
                    brace_depth: 0,
                    bracket_depth: 0,
                });
                out.push(c);
                last_significant = Some(c);
                last_word.clear();
                i += 1;
            }
            ')' => {
                frames.pop();
                out.push(c);
                last_significant = Some(c);
                last_word.clear();
                i += 1;
            }
            ',' => {
                if let Some(top) = frames.last_mut() {
                    if top.brace_depth == 0 && top.bracket_depth == 0 {
                        top.arg_index += 1;
                    }
                }
                out.push(c);
                last_significant = Some(c);
                last_word.clear();
                i += 1;
            }
            '{' | '}' | '[' | ']' => {
                if let Some(top) = frames.last_mut() {
                    match c {
                        '{' => top.brace_depth += 1,
                        '}' => top.brace_depth = top.brace_depth.saturating_sub(1),
                        '[' => top.bracket_depth += 1,
                        ']' => top.bracket_depth = top.bracket_depth.saturating_sub(1),
                        _ => unreachable!(),
                    }
                }
                out.push(c);
                last_significant = Some(c);
                last_word.clear();
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c => {
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    last_word.push(c);
                } else {
                    last_word.clear();
                }
                last_significant = Some(c);
                // Copy the full (possibly multi-byte) character.
                let char_len = src[i..].chars().next().map_or(1, |ch| ch.len_utf8());
                out.push_str(&src[i..i + char_len]);
                i += char_len;
            }
        }
    }

    out
}

/// Decide whether one string literal is an unambiguous URL in a rewritable
/// position.
fn rewrite_literal(value: &str, frame: Option<&CallFrame>, ctx: &RewriteContext) -> Option<String> {
    if !should_rewrite(value) {
        return None;
    }

    // Script-relative references always resolve against the script's own
    // URL, not the document.
    if value.starts_with("./") || value.starts_with("../") {
        return proxied(value, ctx);
    }

    let call = frame.map(|f| (f.name.as_str(), f.arg_index));
    match call {
        Some(("importScripts", _)) => return proxied(value, ctx),
        Some(("Worker" | "SharedWorker", 0)) => return proxied(value, ctx),
        Some(("fetch", 0)) if is_root_relative(value) => return proxied(value, ctx),
        Some(("open", 1)) if is_root_relative(value) => return proxied(value, ctx),
        _ => {}
    }

    if value.starts_with("http://") || value.starts_with("https://") {
        let url = Url::parse(value).ok()?;
        if host_allowlisted(url.host_str()?) {
            return Some(proxy_url(&url, &ctx.public_origin));
        }
    }

    None
}

fn proxied(value: &str, ctx: &RewriteContext) -> Option<String> {
    passage_core::rewrite_reference(value, &ctx.base_url, &ctx.public_origin)
}

fn is_root_relative(value: &str) -> bool {
    value.starts_with('/') && !value.starts_with("//")
}

fn host_allowlisted(host: &str) -> bool {
    EMBED_HOST_ALLOWLIST
        .iter()
        .any(|entry| host == *entry || host.ends_with(&format!(".{entry}")))
}

/// Identifier (or `.member`) immediately preceding an opening paren, read
/// back from the already-emitted output.
fn callee_name(out: &str) -> String {
    // `new Worker(` and `xhr.open(` both resolve to the trailing segment.
    out.trim_end()
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

fn scan_string(src: &str, start: usize, quote: char) -> (usize, String) {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return (i + 1, src[start + 1..i].to_string());
        } else if c == '\n' {
            // Unterminated literal; stop scanning at the line break.
            return (i, src[start + 1..i].to_string());
        }
        i += 1;
    }
    (bytes.len(), src[start + 1..].to_string())
}

fn scan_template(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut escaped = false;
    let mut expr_depth = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if expr_depth > 0 {
            match c {
                '{' => expr_depth += 1,
                '}' => expr_depth -= 1,
                _ => {}
            }
        } else if c == '$' && bytes.get(i + 1) == Some(&b'{') {
            expr_depth = 1;
            i += 1;
        } else if c == '`' {
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn scan_regex(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut escaped = false;
    let mut in_class = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '[' {
            in_class = true;
        } else if c == ']' {
            in_class = false;
        } else if c == '/' && !in_class {
            return i + 1;
        } else if c == '\n' {
            // Not a regex after all; treat the slash as division.
            return start + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Heuristic: a `/` starts a regex literal when it cannot be a division.
fn regex_can_start(last_significant: Option<char>, last_word: &str) -> bool {
    if matches!(
        last_word,
        "return" | "typeof" | "case" | "in" | "of" | "new" | "delete" | "void" | "do" | "else"
    ) {
        return true;
    }
    match last_significant {
        None => true,
        Some(c) => matches!(
            c,
            '=' | '(' | '[' | '{' | ',' | ';' | ':' | '!' | '&' | '|' | '?' | '+' | '-' | '*'
                | '%' | '<' | '>' | '^' | '~'
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::fingerprint;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext {
            base_url: Url::parse("https://static.example.com/js/app.js").unwrap(),
            public_origin: "http://127.0.0.1:3003".into(),
        }
    }

    fn first_fingerprint(src: &str) -> String {
        let fp: String = src
            .split("__cpo=")
            .nth(1)
            .unwrap()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        fingerprint::decode(&fp).unwrap().to_string()
    }

    #[test]
    fn import_scripts_arguments_are_rewritten() {
        let src = r#"importScripts('helper.js', '/vendor/lib.js');"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains("/js/helper.js?__cpo="));
        assert!(out.contains("/vendor/lib.js?__cpo="));
    }

    #[test]
    fn worker_constructor_urls_are_rewritten() {
        let src = r#"var w = new Worker("/workers/crunch.js", { type: 'module' });"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains("/workers/crunch.js?__cpo="));
        assert_eq!(first_fingerprint(&out), "https://static.example.com/");
        // The option object is the rewriter's business only for the URL arg.
        assert!(out.contains("{ type: 'module' }"));
    }

    #[test]
    fn fetch_root_relative_literals_are_rewritten() {
        let src = r#"fetch("/api/items").then(r => r.json());"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains("/api/items?__cpo="));
        assert_eq!(first_fingerprint(&out), "https://static.example.com/");
    }

    #[test]
    fn fetch_second_argument_is_untouched() {
        let src = r#"fetch(u, { body: "/not/a/url" });"#;
        let out = rewrite_js(src, &ctx());
        assert_eq!(out, src);
    }

    #[test]
    fn xhr_open_url_argument_is_rewritten() {
        let src = r#"xhr.open("POST", "/api/like", true);"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains(r#""POST""#));
        assert!(out.contains("/api/like?__cpo="));
    }

    #[test]
    fn script_relative_literals_resolve_against_the_script_url() {
        let src = r#"var chunk = "./chunks/42.js";"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains("/js/chunks/42.js?__cpo="));
        assert_eq!(first_fingerprint(&out), "https://static.example.com/");
    }

    #[test]
    fn allowlisted_hosts_are_rewritten_but_others_are_not() {
        let src = r#"load("https://client-api.arkoselabs.com/v2/api.js"); ping("https://tracker.example.net/px");"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains("__cpo="));
        assert!(out.contains(r#""https://tracker.example.net/px""#));
    }

    #[test]
    fn literals_inside_strings_and_comments_are_untouched() {
        let src = concat!(
            "// fetch(\"/commented\")\n",
            "var s = \"importScripts('/inner.js')\";\n",
            "/* new Worker('/blocked.js') */\n",
        );
        let out = rewrite_js(src, &ctx());
        assert_eq!(out, src);
    }

    #[test]
    fn template_literals_are_untouched() {
        let src = "var u = `/api/${id}/feed`; fetch(u);";
        let out = rewrite_js(src, &ctx());
        assert_eq!(out, src);
    }

    #[test]
    fn regex_literals_do_not_confuse_the_scanner() {
        let src = r#"var re = /"\/api\/"/; fetch("/real");"#;
        let out = rewrite_js(src, &ctx());
        assert!(out.contains(r#"/"\/api\/"/"#));
        assert!(out.contains("/real?__cpo="));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let src = r#"fetch("/api/items");"#;
        let once = rewrite_js(src, &ctx());
        let twice = rewrite_js(&once, &ctx());
        assert_eq!(once, twice);
    }
}
