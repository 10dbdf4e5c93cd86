use anyhow::{Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "passage-relay",
    author,
    version,
    about = "URL-rewriting proxy that routes third-party pages through itself"
)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PASSAGE_RELAY_PORT", default_value_t = 3003)]
    pub port: u16,

    /// Public origin advertised in rewritten URLs. When unset, derived per
    /// request from X-Forwarded-Proto / X-Forwarded-Host / Host.
    #[arg(long, env = "PASSAGE_PUBLIC_ORIGIN")]
    pub public_origin: Option<String>,

    /// Accept invalid upstream TLS certificates. Origins behind misconfigured
    /// edges present broken chains; refusing them breaks the product, so the
    /// unsafe default is retained.
    #[arg(long, env = "PASSAGE_ACCEPT_INVALID_CERTS", default_value_t = true)]
    pub accept_invalid_certs: bool,

    /// Upstream fetch timeout in seconds.
    #[arg(long, env = "PASSAGE_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub public_origin: Option<String>,
    pub accept_invalid_certs: bool,
    pub fetch_timeout_secs: u64,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if let Some(origin) = &cli.public_origin {
            url::Url::parse(origin)
                .with_context(|| format!("invalid public origin: {origin}"))?;
        }
        Ok(Config {
            port: cli.port,
            public_origin: cli.public_origin.map(|o| o.trim_end_matches('/').to_string()),
            accept_invalid_certs: cli.accept_invalid_certs,
            fetch_timeout_secs: cli.fetch_timeout_secs,
        })
    }
}
