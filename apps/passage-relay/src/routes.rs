//! Request classification and the proxy round trip.
//!
//! Every incoming request is one of: the landing page, a proxied request
//! addressed by a `__cpo` fingerprint, a relative fall-through resolved via
//! the referer or the caller's last known base, or a 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};
use url::Url;

use passage_core::{fingerprint, forwarded, identity};

use crate::config::Config;
use crate::fetch::{FetchContext, FetchError, FetchedResponse, UpstreamClient, CSRF_HEADER};
use crate::headers::{apply_cors, relay_response_headers};
use crate::pages;
use crate::rewrite::{self, ContentKind, RewriteContext};

/// Bases older than this are swept from the per-client map.
pub const CLIENT_BASE_TTL: Duration = Duration::from_secs(600);

const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Request headers that never travel to the upstream: connection plumbing,
/// forwarding metadata, and the fields the fetcher rebuilds itself.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "accept-encoding",
    "cookie",
    "referer",
    "origin",
    "upgrade",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-for",
    "x-csrf-token",
];

#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    /// Last known target base per client identity, for relative fall-through.
    pub client_bases: Arc<DashMap<String, (Url, Instant)>>,
}

impl RelayState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            upstream: Arc::new(upstream),
            client_bases: Arc::new(DashMap::new()),
        })
    }

    pub fn sweep_client_bases(&self) {
        let now = Instant::now();
        self.client_bases
            .retain(|_, entry| now.duration_since(entry.1) < CLIENT_BASE_TTL);
    }

    fn known_base(&self, client_id: &str) -> Option<Url> {
        self.client_bases.get(client_id).map(|e| e.value().0.clone())
    }
}

pub async fn handle(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    if req.method() == Method::OPTIONS {
        return preflight();
    }

    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let (fingerprint_param, stripped_query) = split_fingerprint(query.as_deref());

    let public_origin = resolve_public_origin(&state, req.headers());
    let client_id = client_identity(&addr, req.headers());

    // Landing page: bare root with no fingerprint.
    if path == "/" && fingerprint_param.is_none() && stripped_query.is_none() {
        return Html(pages::LANDING_PAGE).into_response();
    }

    if let Some(fp) = fingerprint_param {
        let base = match fingerprint::decode(&fp) {
            Ok(url) => url,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("invalid __cpo token: {err}"))
                    .into_response()
            }
        };

        // Origin scripts sometimes mint URLs from location.origin before the
        // shim loads; those decode to the proxy's own host. Fall back to a
        // known base instead of looping into ourselves.
        let base = if points_at_self(&base, &public_origin) {
            match referer_base(req.headers()).or_else(|| state.known_base(&client_id)) {
                Some(fallback) => fallback,
                None => {
                    return (StatusCode::NOT_FOUND, "no known origin for this client")
                        .into_response()
                }
            }
        } else {
            base
        };

        let target = resolve_target(&base, &path, stripped_query.as_deref());
        state
            .client_bases
            .insert(client_id, (base, Instant::now()));
        return proxy_round_trip(&state, req, target, &public_origin).await;
    }

    // Relative fall-through: no fingerprint, but the referer or a prior
    // request tells us which origin this client is browsing.
    let base = referer_base(req.headers()).or_else(|| state.known_base(&client_id));
    if let Some(base) = base {
        if points_at_self(&base, &public_origin) {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        let target = resolve_target(&base, &path, query.as_deref());
        debug!(%target, "relative fall-through");
        return proxy_round_trip(&state, req, target, &public_origin).await;
    }

    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn proxy_round_trip(
    state: &RelayState,
    req: Request<Body>,
    target: Url,
    public_origin: &str,
) -> Response {
    let method = req.method().clone();
    let caller_headers = forwardable_headers(req.headers());
    let ctx = FetchContext {
        cookies: header_string(req.headers(), header::COOKIE),
        csrf_token: req
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        referer: None,
    };

    let body = if matches!(
        method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) {
        match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("unreadable request body: {err}"))
                    .into_response()
            }
        }
    } else {
        None
    };

    let fetched = match state
        .upstream
        .fetch(target.clone(), method, &caller_headers, body, &ctx)
        .await
    {
        Ok(fetched) => fetched,
        Err(err) => return upstream_failure(&target, err),
    };

    relay_response(fetched, public_origin)
}

fn relay_response(fetched: FetchedResponse, public_origin: &str) -> Response {
    let kind = fetched
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ContentKind::from_content_type)
        .unwrap_or(ContentKind::Other);

    let rewrite_ctx = RewriteContext {
        base_url: fetched.final_url.clone(),
        public_origin: public_origin.to_string(),
    };
    let rewritten = rewrite::rewrite_body(&fetched.body, kind, &rewrite_ctx);
    let body_mutated = rewritten.is_some() || fetched.decompressed;

    let headers = relay_response_headers(
        &fetched.headers,
        body_mutated,
        public_origin.starts_with("https://"),
    );

    let body = match rewritten {
        Some(bytes) => Bytes::from(bytes),
        None => fetched.body,
    };

    let mut response = Response::builder().status(fetched.status);
    if let Some(headers_mut) = response.headers_mut() {
        *headers_mut = headers;
    }
    response
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn upstream_failure(target: &Url, err: FetchError) -> Response {
    warn!(%target, %err, "upstream fetch failed");
    let page = pages::retry_page(&err.to_string());
    let mut response = (StatusCode::BAD_GATEWAY, Html(page)).into_response();
    apply_cors(response.headers_mut());
    response
}

fn preflight() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut());
    response.headers_mut().insert(
        header::HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("86400"),
    );
    response
}

/// Split the raw query into the `__cpo` value and the remaining parameters.
fn split_fingerprint(query: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(query) = query else {
        return (None, None);
    };
    let mut fp = None;
    let mut rest: Vec<&str> = Vec::new();
    for pair in query.split('&') {
        match pair.strip_prefix("__cpo=") {
            Some(value) => fp = Some(value.to_string()),
            None if !pair.is_empty() => rest.push(pair),
            None => {}
        }
    }
    let rest = (!rest.is_empty()).then(|| rest.join("&"));
    (fp, rest)
}

/// Rebuild the absolute target from a decoded base plus the request's own
/// path and query. A fingerprint that already carries a deep path (minted
/// from the landing page) wins only for bare-root requests.
fn resolve_target(base: &Url, req_path: &str, req_query: Option<&str>) -> Url {
    if req_path == "/" && req_query.is_none() && base.path() != "/" {
        return base.clone();
    }
    let mut target = base.clone();
    target.set_path(req_path);
    target.set_query(req_query);
    target.set_fragment(None);
    target
}

fn points_at_self(base: &Url, public_origin: &str) -> bool {
    if let Some(host) = base.host_str() {
        if forwarded::is_local_host(host) {
            return true;
        }
    }
    public_origin
        .strip_prefix("http://")
        .or_else(|| public_origin.strip_prefix("https://"))
        .is_some_and(|public_host| base.host_str() == Some(public_host.split(':').next().unwrap_or(public_host)))
}

fn referer_base(headers: &HeaderMap) -> Option<Url> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    let fp = referer
        .split_once("__cpo=")?
        .1
        .split('&')
        .next()
        .unwrap_or_default();
    let base = fingerprint::decode(fp).ok()?;
    if base.host_str().is_some_and(forwarded::is_local_host) {
        return None;
    }
    Some(base)
}

fn resolve_public_origin(state: &RelayState, headers: &HeaderMap) -> String {
    if let Some(configured) = &state.config.public_origin {
        return configured.clone();
    }
    forwarded::public_origin(
        header_str(headers, "x-forwarded-proto").as_deref(),
        header_str(headers, "x-forwarded-host").as_deref(),
        header_string(headers, header::HOST).as_deref(),
    )
}

fn client_identity(addr: &SocketAddr, headers: &HeaderMap) -> String {
    let forwarded_for = header_str(headers, "x-forwarded-for");
    let remote = forwarded_for
        .as_deref()
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .map(str::to_string)
        .unwrap_or_else(|| addr.to_string());
    let user_agent = header_string(headers, header::USER_AGENT).unwrap_or_default();
    identity::derive_client_id(&remote, &user_agent)
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if DROPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_split_out_of_the_query() {
        let (fp, rest) = split_fingerprint(Some("tab=hot&__cpo=aGk&x=1"));
        assert_eq!(fp.as_deref(), Some("aGk"));
        assert_eq!(rest.as_deref(), Some("tab=hot&x=1"));

        let (fp, rest) = split_fingerprint(Some("__cpo=aGk"));
        assert_eq!(fp.as_deref(), Some("aGk"));
        assert!(rest.is_none());

        let (fp, rest) = split_fingerprint(None);
        assert!(fp.is_none() && rest.is_none());
    }

    #[test]
    fn target_combines_base_origin_with_request_path() {
        let base = Url::parse("https://www.example.com/").unwrap();
        let target = resolve_target(&base, "/explore", Some("tab=hot"));
        assert_eq!(target.as_str(), "https://www.example.com/explore?tab=hot");
    }

    #[test]
    fn deep_fingerprints_win_for_bare_root_requests() {
        let base = Url::parse("https://www.example.com/deep/page?x=1").unwrap();
        let target = resolve_target(&base, "/", None);
        assert_eq!(target.as_str(), "https://www.example.com/deep/page?x=1");

        let target = resolve_target(&base, "/other", None);
        assert_eq!(target.as_str(), "https://www.example.com/other");
    }

    #[test]
    fn referer_fingerprints_resolve_to_a_base() {
        let mut headers = HeaderMap::new();
        let fp = passage_core::encode("https://www.example.com");
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("http://127.0.0.1:3003/explore?__cpo={fp}")).unwrap(),
        );
        let base = referer_base(&headers).unwrap();
        assert_eq!(base.host_str(), Some("www.example.com"));
    }

    #[test]
    fn localhost_referers_are_rejected() {
        let mut headers = HeaderMap::new();
        let fp = passage_core::encode("http://localhost:3003");
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("http://127.0.0.1:3003/x?__cpo={fp}")).unwrap(),
        );
        assert!(referer_base(&headers).is_none());
    }

    #[test]
    fn self_loops_are_detected() {
        let public = "http://pass.example.org";
        assert!(points_at_self(
            &Url::parse("http://localhost:3003/x").unwrap(),
            public
        ));
        assert!(points_at_self(
            &Url::parse("http://pass.example.org/x").unwrap(),
            public
        ));
        assert!(!points_at_self(
            &Url::parse("https://www.example.com/").unwrap(),
            public
        ));
    }
}
