//! The browser proxy: per-request access control, prefix stripping, and the
//! HTTP leg of the reverse proxy into the assigned container.
//!
//! Paths look like `/browser/<slot_id>/<rest>`. Requests that lack the
//! prefix but carry the `browser` companion cookie (container pages often
//! reference absolute paths) are routed to that slot with the full path.

use std::io::{Cursor, Read};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::{debug, warn};

use crate::config::SlotConfig;
use crate::pages;
use crate::{audio, ws, AppState};

const MAX_PROXY_BODY: usize = 64 * 1024 * 1024;

/// Headers that never cross the proxy hop in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "host",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

pub struct BrowserRequest {
    pub slot_id: usize,
    pub upstream: SlotConfig,
    /// Path inside the container, always starting with `/`.
    pub rest: String,
    /// Query string with the one-shot `token` parameter removed.
    pub query: Option<String>,
    /// Set when a URL token was consumed on this request.
    pub fresh_cookie: Option<String>,
}

pub async fn browser_entry(
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().map(str::to_string);

    let (slot_id, rest) = match parse_slot_path(&path, req.headers()) {
        Some(parts) => parts,
        None => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };
    let Some(upstream) = state.fleet.upstream_of(slot_id) else {
        return (StatusCode::NOT_FOUND, "no such browser").into_response();
    };

    let (token, query) = split_token(raw_query.as_deref());

    // Access-control state machine: session cookie, then one-shot URL token,
    // then denial. The denial page never reveals whether a session exists.
    let mut fresh_cookie = None;
    let cookie = cookie_value(req.headers(), "session");
    let granted = match cookie {
        Some(value) if state.fleet.grant_for_cookie(&value, slot_id) => true,
        _ => match token {
            Some(token) => {
                match state.fleet.consume_url_token(&token, slot_id, Instant::now()) {
                    Some(cookie_token) => {
                        debug!(slot = slot_id, "url token consumed, issuing cookie");
                        fresh_cookie = Some(cookie_token);
                        true
                    }
                    None => false,
                }
            }
            None => false,
        },
    };
    if !granted {
        return (StatusCode::FORBIDDEN, Html(pages::ACCESS_DENIED_PAGE)).into_response();
    }

    let browser_req = BrowserRequest {
        slot_id,
        upstream,
        rest,
        query,
        fresh_cookie,
    };

    if let Some(ws) = ws {
        let fresh_cookie = browser_req.fresh_cookie.clone();
        let slot_id = browser_req.slot_id;
        let mut response = if browser_req.rest == "/audio" {
            audio::handle(ws, state, slot_id)
        } else {
            ws::tunnel(ws, state, browser_req)
        };
        append_cookies(&mut response, fresh_cookie.as_deref(), slot_id);
        return response;
    }

    forward_http(state, browser_req, req).await
}

async fn forward_http(state: AppState, browser_req: BrowserRequest, req: Request<Body>) -> Response {
    let url = format!(
        "http://{}:{}{}{}",
        browser_req.upstream.host,
        browser_req.upstream.http_port,
        browser_req.rest,
        browser_req
            .query
            .as_deref()
            .map(|q| format!("?{q}"))
            .unwrap_or_default(),
    );

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return (StatusCode::METHOD_NOT_ALLOWED, "bad method").into_response(),
    };
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    if let Some(auth) = &state.auth_header {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(auth) {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("unreadable body: {err}")).into_response()
        }
    };

    let upstream_response = state
        .http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let response = match upstream_response {
        Ok(response) => response,
        Err(err) => {
            warn!(slot = browser_req.slot_id, %url, %err, "container unreachable");
            let mut response =
                (StatusCode::BAD_GATEWAY, Html(pages::STARTING_UP_PAGE)).into_response();
            append_cookies(&mut response, browser_req.fresh_cookie.as_deref(), browser_req.slot_id);
            return response;
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let upstream_headers = response.headers().clone();
    let is_html = upstream_headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));

    let mut relayed = HeaderMap::new();
    for (name, value) in &upstream_headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) {
            continue;
        }
        if is_html && (lower == "content-length" || lower == "content-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            relayed.append(name, value);
        }
    }

    let mut out = if is_html {
        // Buffer and inject the enhancement script; everything else streams.
        let raw = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(slot = browser_req.slot_id, %err, "container body read failed");
                let mut response =
                    (StatusCode::BAD_GATEWAY, Html(pages::STARTING_UP_PAGE)).into_response();
                append_cookies(&mut response, browser_req.fresh_cookie.as_deref(), browser_req.slot_id);
                return response;
            }
        };
        let decoded = decode_content(&upstream_headers, &raw);
        let injected = match std::str::from_utf8(&decoded) {
            Ok(text) => pages::inject_enhancement(text).into_bytes(),
            Err(_) => decoded,
        };
        let mut response = Response::builder().status(status);
        if let Some(headers_mut) = response.headers_mut() {
            *headers_mut = relayed;
        }
        response
            .body(Body::from(injected))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        let stream = response.bytes_stream();
        let mut response = Response::builder().status(status);
        if let Some(headers_mut) = response.headers_mut() {
            *headers_mut = relayed;
        }
        response
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    };

    append_cookies(&mut out, browser_req.fresh_cookie.as_deref(), browser_req.slot_id);
    out
}

/// Resolve `/browser/<slot_id>/<rest>`, or fall back to the `browser`
/// companion cookie for absolute container paths.
fn parse_slot_path(path: &str, headers: &HeaderMap) -> Option<(usize, String)> {
    if let Some(after) = path.strip_prefix("/browser/") {
        let (id_part, rest) = match after.split_once('/') {
            Some((id, rest)) => (id, format!("/{rest}")),
            None => (after, "/".to_string()),
        };
        let slot_id: usize = id_part.parse().ok()?;
        return Some((slot_id, rest));
    }
    let slot_id: usize = cookie_value(headers, "browser")?.parse().ok()?;
    Some((slot_id, path.to_string()))
}

fn split_token(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };
    let mut token = None;
    let mut rest: Vec<&str> = Vec::new();
    for pair in query.split('&') {
        match pair.strip_prefix("token=") {
            Some(value) => token = Some(value.to_string()),
            None if !pair.is_empty() => rest.push(pair),
            None => {}
        }
    }
    (token, (!rest.is_empty()).then(|| rest.join("&")))
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// When a URL token was consumed, upgrade it into the long-lived cookie pair.
fn append_cookies(response: &mut Response, fresh_cookie: Option<&str>, slot_id: usize) {
    let Some(cookie_token) = fresh_cookie else {
        return;
    };
    let session = format!(
        "session={cookie_token}; HttpOnly; SameSite=Lax; Max-Age=86400; Path=/"
    );
    let browser = format!("browser={slot_id}; HttpOnly; SameSite=Lax; Max-Age=86400; Path=/");
    for value in [session, browser] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

fn decode_content(headers: &reqwest::header::HeaderMap, body: &[u8]) -> Vec<u8> {
    let encoding = headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let result = match encoding.as_str() {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(Cursor::new(body)).read_to_end(&mut out).map(|_| out)
        }
        "deflate" => {
            let mut out = Vec::new();
            ZlibDecoder::new(Cursor::new(body)).read_to_end(&mut out).map(|_| out)
        }
        "br" => {
            let mut out = Vec::new();
            Decompressor::new(Cursor::new(body), 4096)
                .read_to_end(&mut out)
                .map(|_| out)
        }
        _ => return body.to_vec(),
    };
    match result {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%encoding, %err, "container body decompression failed");
            body.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_paths_parse() {
        let headers = HeaderMap::new();
        assert_eq!(
            parse_slot_path("/browser/3/", &headers),
            Some((3, "/".to_string()))
        );
        assert_eq!(
            parse_slot_path("/browser/3/vnc/app.js", &headers),
            Some((3, "/vnc/app.js".to_string()))
        );
        assert_eq!(parse_slot_path("/browser/x/", &headers), None);
        assert_eq!(parse_slot_path("/elsewhere", &headers), None);
    }

    #[test]
    fn prefixless_paths_route_via_browser_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; browser=2"),
        );
        assert_eq!(
            parse_slot_path("/websockify", &headers),
            Some((2, "/websockify".to_string()))
        );
    }

    #[test]
    fn token_is_stripped_from_the_query() {
        let (token, rest) = split_token(Some("token=abc123&scale=2"));
        assert_eq!(token.as_deref(), Some("abc123"));
        assert_eq!(rest.as_deref(), Some("scale=2"));

        let (token, rest) = split_token(Some("token=abc123"));
        assert_eq!(token.as_deref(), Some("abc123"));
        assert!(rest.is_none());
    }

    #[test]
    fn cookie_values_parse() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("a=1; session=tok; browser=4"),
        );
        assert_eq!(cookie_value(&headers, "session").as_deref(), Some("tok"));
        assert_eq!(cookie_value(&headers, "browser").as_deref(), Some("4"));
        assert!(cookie_value(&headers, "missing").is_none());
    }
}
