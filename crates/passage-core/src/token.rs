use rand::RngCore;

/// Mint a 32-byte random bearer token, hex encoded (64 chars).
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// The two-credential access scheme for one slot assignment.
///
/// `url_token` is a one-shot carried in the query string; consuming it sets
/// the long-lived HttpOnly `cookie_token`. Sharing the URL after first use
/// fails.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub cookie_token: String,
    pub url_token: String,
}

impl TokenPair {
    pub fn mint() -> Self {
        Self {
            cookie_token: mint_token(),
            url_token: mint_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_64_hex_chars() {
        let t = mint_token();
        assert_eq!(t.len(), 64);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let pair = TokenPair::mint();
        assert_ne!(pair.cookie_token, pair.url_token);
        assert_ne!(mint_token(), mint_token());
    }
}
