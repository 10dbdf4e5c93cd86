use sha2::{Digest, Sha256};

/// How much of the User-Agent participates in identity derivation. Enough
/// to split browsers sharing one NAT, short enough to ignore the noisy tail.
const UA_PREFIX_LEN: usize = 48;

/// Derive a stable client identity for requests that carry none.
///
/// Behind a CDN many users share one source address, so the User-Agent
/// prefix is folded in; the result still gives single-session semantics for
/// the common case of one browser per household address.
pub fn derive_client_id(remote_addr: &str, user_agent: &str) -> String {
    let ip = remote_addr.rsplit_once(':').map_or(remote_addr, |(ip, _)| ip);
    let ua: String = user_agent.chars().take(UA_PREFIX_LEN).collect();

    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(ua.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::from("anon-");
    for b in &digest[..8] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_identity() {
        let a = derive_client_id("203.0.113.7:51022", "Mozilla/5.0 (X11; Linux x86_64)");
        let b = derive_client_id("203.0.113.7:40400", "Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(a, b, "ephemeral port must not affect identity");
    }

    #[test]
    fn different_agents_differ() {
        let a = derive_client_id("203.0.113.7:1", "Mozilla/5.0 (X11; Linux x86_64)");
        let b = derive_client_id("203.0.113.7:1", "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)");
        assert_ne!(a, b);
    }

    #[test]
    fn identity_is_prefixed_and_short() {
        let id = derive_client_id("198.51.100.1:2", "curl/8.0");
        assert!(id.starts_with("anon-"));
        assert_eq!(id.len(), 5 + 16);
    }
}
