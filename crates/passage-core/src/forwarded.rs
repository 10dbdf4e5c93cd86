/// Resolve the public-facing origin of the deployment from forwarding
/// headers, falling back to the transport-level Host.
///
/// `X-Forwarded-Proto` and `X-Forwarded-Host` win when an upstream edge set
/// them; both may carry comma-joined hop lists, of which the first entry is
/// the client-facing one.
pub fn public_origin(
    forwarded_proto: Option<&str>,
    forwarded_host: Option<&str>,
    host: Option<&str>,
) -> String {
    let scheme = forwarded_proto
        .map(first_value)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = forwarded_host
        .map(first_value)
        .filter(|v| !v.is_empty())
        .or_else(|| host.map(first_value).filter(|v| !v.is_empty()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

fn first_value(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

/// True when the host names the local machine; proxy URLs must never point
/// the proxy back at itself.
pub fn is_local_host(host: &str) -> bool {
    let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
    matches!(bare, "localhost" | "127.0.0.1" | "::1" | "[::1]" | "0.0.0.0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_headers_win() {
        let origin = public_origin(Some("https"), Some("pass.example.org"), Some("10.0.0.5:3600"));
        assert_eq!(origin, "https://pass.example.org");
    }

    #[test]
    fn host_is_the_fallback() {
        let origin = public_origin(None, None, Some("10.0.0.5:3600"));
        assert_eq!(origin, "http://10.0.0.5:3600");
    }

    #[test]
    fn comma_lists_use_first_hop() {
        let origin = public_origin(Some("https, http"), Some("edge.example.org, inner"), None);
        assert_eq!(origin, "https://edge.example.org");
    }

    #[test]
    fn local_hosts_are_detected() {
        assert!(is_local_host("localhost:3003"));
        assert!(is_local_host("127.0.0.1"));
        assert!(!is_local_host("www.example.com"));
    }
}
