use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use url::Url;

/// Query parameter carrying the encoded target URL on every proxied request.
pub const FINGERPRINT_PARAM: &str = "__cpo";

/// Errors returned while decoding a fingerprint back into a target URL.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint is not valid base64")]
    InvalidEncoding,
    #[error("fingerprint payload is not UTF-8")]
    InvalidUtf8,
    #[error("fingerprint does not decode to an absolute http(s) URL")]
    MalformedToken,
}

/// Encode an absolute URL into a URL-safe fingerprint.
///
/// The output alphabet is `[A-Za-z0-9_-]` only, so the token survives path,
/// query, CSS `url(...)`, and HTML-attribute contexts without re-escaping.
pub fn encode(abs_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(abs_url.as_bytes())
}

/// Decode a fingerprint into its absolute URL.
///
/// Tokens may arrive percent-encoded once (browsers re-escape query strings
/// they did not mint); one unescape pass is attempted before giving up.
pub fn decode(fingerprint: &str) -> Result<Url, FingerprintError> {
    match decode_once(fingerprint) {
        Ok(url) => Ok(url),
        Err(first_err) => {
            let unescaped = percent_unescape(fingerprint);
            if unescaped == fingerprint {
                return Err(first_err);
            }
            decode_once(&unescaped)
        }
    }
}

fn decode_once(fingerprint: &str) -> Result<Url, FingerprintError> {
    // Tolerate callers that re-added padding or used the standard alphabet.
    let normalized: String = fingerprint
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|_| FingerprintError::InvalidEncoding)?;
    let text = String::from_utf8(bytes).map_err(|_| FingerprintError::InvalidUtf8)?;

    let url = Url::parse(&text).map_err(|_| FingerprintError::MalformedToken)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(FingerprintError::MalformedToken),
    }
}

fn percent_unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push((hi << 4 | lo) as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
