//! Upstream fetcher: one browser-shaped request to an origin, redirects
//! followed by hand so RFC method semantics stay exact, bodies decompressed
//! explicitly so the rewriters always see plain text.

use std::io::{Cursor, Read};
use std::time::Duration;

use brotli::Decompressor;
use bytes::Bytes;
use dashmap::DashMap;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;

const MAX_REDIRECTS: usize = 5;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br";

pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream did not respond within the fetch timeout")]
    Timeout,
    #[error("could not connect to upstream: {0}")]
    Connect(String),
    #[error("upstream TLS failure: {0}")]
    Tls(String),
    #[error("upstream redirect chain exceeded {MAX_REDIRECTS} hops")]
    TooManyRedirects,
    #[error("upstream request failed: {0}")]
    Request(reqwest::Error),
}

/// Per-request caller context: the client's cookie jar contents, an explicit
/// CSRF token, and the effective referer.
#[derive(Debug, Default)]
pub struct FetchContext {
    pub cookies: Option<String>,
    pub csrf_token: Option<String>,
    pub referer: Option<String>,
}

pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub final_url: Url,
    /// True when the body was transparently decompressed; the relayed
    /// response must then drop `Content-Encoding`/`Content-Length`.
    pub decompressed: bool,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    /// Last-writer-wins CSRF token per origin, refreshed from responses.
    csrf_cache: DashMap<String, String>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            csrf_cache: DashMap::new(),
            timeout,
        })
    }

    pub fn cached_csrf(&self, origin: &str) -> Option<String> {
        self.csrf_cache.get(origin).map(|v| v.clone())
    }

    /// Fetch `target`, following redirects up to [`MAX_REDIRECTS`] hops.
    ///
    /// 307/308 preserve the method and body; 301/302/303 downgrade non-GET
    /// to GET per RFC semantics. The whole chain shares one timeout.
    pub async fn fetch(
        &self,
        target: Url,
        method: Method,
        caller_headers: &HeaderMap,
        body: Option<Bytes>,
        ctx: &FetchContext,
    ) -> Result<FetchedResponse, FetchError> {
        tokio::time::timeout(self.timeout, self.fetch_inner(target, method, caller_headers, body, ctx))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_inner(
        &self,
        mut target: Url,
        mut method: Method,
        caller_headers: &HeaderMap,
        mut body: Option<Bytes>,
        ctx: &FetchContext,
    ) -> Result<FetchedResponse, FetchError> {
        for _hop in 0..=MAX_REDIRECTS {
            let headers = self.request_headers(&target, caller_headers, ctx);
            let mut request = self.client.request(method.clone(), target.clone()).headers(headers);
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }

            let response = request.send().await.map_err(classify_error)?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = target.join(location).map_err(|_| {
                        FetchError::Connect(format!("unresolvable redirect target {location}"))
                    })?;
                    debug!(from = %target, to = %next, status = status.as_u16(), "following redirect");
                    match status.as_u16() {
                        301 | 302 | 303 => {
                            if method != Method::GET && method != Method::HEAD {
                                method = Method::GET;
                                body = None;
                            }
                        }
                        // 307/308 keep method and body.
                        _ => {}
                    }
                    target = next;
                    continue;
                }
            }

            let headers = response.headers().clone();
            if let Some(token) = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
                self.csrf_cache
                    .insert(origin_key(&target), token.to_string());
            }

            let raw = response.bytes().await.map_err(classify_error)?;
            let (decoded, decompressed) = decompress_body(&headers, raw);

            return Ok(FetchedResponse {
                status,
                headers,
                body: decoded,
                final_url: target,
                decompressed,
            });
        }
        Err(FetchError::TooManyRedirects)
    }

    fn request_headers(&self, target: &Url, caller: &HeaderMap, ctx: &FetchContext) -> HeaderMap {
        let origin = origin_key(target);
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, hv(DEFAULT_USER_AGENT));
        headers.insert(reqwest::header::ACCEPT, hv(DEFAULT_ACCEPT));
        headers.insert(reqwest::header::ACCEPT_LANGUAGE, hv(DEFAULT_ACCEPT_LANGUAGE));
        headers.insert(reqwest::header::ACCEPT_ENCODING, hv(DEFAULT_ACCEPT_ENCODING));
        headers.insert(reqwest::header::CONNECTION, hv("keep-alive"));

        // Caller headers override the defaults.
        for (name, value) in caller {
            headers.insert(name.clone(), value.clone());
        }

        if !headers.contains_key(reqwest::header::ORIGIN) {
            if let Ok(v) = HeaderValue::from_str(&origin) {
                headers.insert(reqwest::header::ORIGIN, v);
            }
        }
        if !headers.contains_key(reqwest::header::REFERER) {
            let referer = ctx.referer.clone().unwrap_or_else(|| format!("{origin}/"));
            if let Ok(v) = HeaderValue::from_str(&referer) {
                headers.insert(reqwest::header::REFERER, v);
            }
        }
        if let Some(cookies) = &ctx.cookies {
            if let Ok(v) = HeaderValue::from_str(cookies) {
                headers.insert(reqwest::header::COOKIE, v);
            }
        }

        let csrf = ctx
            .csrf_token
            .clone()
            .or_else(|| self.cached_csrf(&origin));
        if let Some(token) = csrf {
            if let Ok(v) = HeaderValue::from_str(&token) {
                if let Ok(name) = HeaderName::from_bytes(CSRF_HEADER.as_bytes()) {
                    headers.insert(name, v);
                }
            }
        }

        headers
    }
}

fn hv(value: &'static str) -> HeaderValue {
    HeaderValue::from_static(value)
}

fn origin_key(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

fn classify_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    let detail = err.to_string();
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&err);
    let mut chain = detail.clone();
    while let Some(inner) = source {
        chain.push_str(&inner.to_string());
        source = inner.source();
    }
    let lowered = chain.to_ascii_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        return FetchError::Tls(detail);
    }
    if err.is_connect() {
        return FetchError::Connect(detail);
    }
    FetchError::Request(err)
}

/// Decompress the body according to `Content-Encoding`. Failures degrade to
/// passing the compressed buffer through rather than failing the request.
fn decompress_body(headers: &HeaderMap, body: Bytes) -> (Bytes, bool) {
    let Some(encoding) = headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
    else {
        return (body, false);
    };
    if encoding.is_empty() || encoding == "identity" {
        return (body, false);
    }

    match decode(&encoding, &body) {
        Ok(decoded) => (Bytes::from(decoded), true),
        Err(err) => {
            warn!(%encoding, %err, "upstream body decompression failed, passing through");
            (body, false)
        }
    }
}

fn decode(encoding: &str, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        "gzip" | "x-gzip" => {
            let mut decoded = Vec::new();
            GzDecoder::new(Cursor::new(body)).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        "deflate" => {
            let mut decoded = Vec::new();
            if ZlibDecoder::new(Cursor::new(body))
                .read_to_end(&mut decoded)
                .is_ok()
            {
                return Ok(decoded);
            }
            // Some origins send raw deflate streams without the zlib header.
            let mut raw = Vec::new();
            DeflateDecoder::new(Cursor::new(body)).read_to_end(&mut raw)?;
            Ok(raw)
        }
        "br" => {
            let mut decoded = Vec::new();
            Decompressor::new(Cursor::new(body), 4096).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported content encoding `{other}`"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn headers_with_encoding(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_ENCODING,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn gzip_bodies_decompress() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<html>hi</html>").unwrap();
        let compressed = encoder.finish().unwrap();

        let (body, decompressed) =
            decompress_body(&headers_with_encoding("gzip"), Bytes::from(compressed));
        assert!(decompressed);
        assert_eq!(&body[..], b"<html>hi</html>");
    }

    #[test]
    fn zlib_deflate_bodies_decompress() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"body { color: red }").unwrap();
        let compressed = encoder.finish().unwrap();

        let (body, decompressed) =
            decompress_body(&headers_with_encoding("deflate"), Bytes::from(compressed));
        assert!(decompressed);
        assert_eq!(&body[..], b"body { color: red }");
    }

    #[test]
    fn raw_deflate_bodies_fall_back() {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"raw stream").unwrap();
        let compressed = encoder.finish().unwrap();

        let (body, decompressed) =
            decompress_body(&headers_with_encoding("deflate"), Bytes::from(compressed));
        assert!(decompressed);
        assert_eq!(&body[..], b"raw stream");
    }

    #[test]
    fn broken_streams_pass_through_unchanged() {
        let garbage = Bytes::from_static(b"\x00\x01\x02 not gzip");
        let (body, decompressed) =
            decompress_body(&headers_with_encoding("gzip"), garbage.clone());
        assert!(!decompressed);
        assert_eq!(body, garbage);
    }

    #[test]
    fn identity_is_untouched() {
        let plain = Bytes::from_static(b"plain");
        let (body, decompressed) =
            decompress_body(&headers_with_encoding("identity"), plain.clone());
        assert!(!decompressed);
        assert_eq!(body, plain);
    }
}
