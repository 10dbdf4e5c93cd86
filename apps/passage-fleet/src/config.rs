use anyhow::{bail, Context, Result};
use clap::Parser;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "passage-fleet",
    author,
    version,
    about = "Browser-session broker and reverse proxy for a containerized browser fleet"
)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, env = "PASSAGE_FLEET_PORT", default_value_t = 3600)]
    pub port: u16,

    /// Comma-separated fleet slots: `host[:http_port[:ws_port[:audio_port]]]`.
    /// Unspecified ports default to 6901 (http/ws) and 4901 (audio).
    #[arg(long, env = "PASSAGE_SLOTS", default_value = "127.0.0.1:6901")]
    pub slots: String,

    /// Pre-shared `user:pass` injected as basic auth towards the containers.
    #[arg(long, env = "PASSAGE_UPSTREAM_BASIC_AUTH")]
    pub upstream_basic_auth: Option<String>,

    /// Redis URL for the state mirror. Without it the broker runs in-memory
    /// only and sessions do not survive restarts.
    #[arg(long, env = "PASSAGE_MIRROR_URL")]
    pub mirror_url: Option<String>,

    /// Container name prefix for the per-slot audio source.
    #[arg(long, env = "PASSAGE_CONTAINER_PREFIX", default_value = "passage-browser-")]
    pub container_prefix: String,

    /// Seconds without a heartbeat before a session is reaped.
    #[arg(long, env = "PASSAGE_SESSION_TIMEOUT_SECS", default_value_t = 300)]
    pub session_timeout_secs: u64,

    /// Seconds without any active WebSocket before a session is reaped.
    #[arg(long, env = "PASSAGE_WS_PRESENCE_TIMEOUT_SECS", default_value_t = 120)]
    pub ws_presence_timeout_secs: u64,

    /// Grace after assignment before WebSocket presence is enforced.
    #[arg(long, env = "PASSAGE_ASSIGNMENT_GRACE_SECS", default_value_t = 60)]
    pub assignment_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
    pub audio_port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub slots: Vec<SlotConfig>,
    pub upstream_basic_auth: Option<String>,
    pub mirror_url: Option<String>,
    pub container_prefix: String,
    pub session_timeout: Duration,
    pub ws_presence_timeout: Duration,
    pub assignment_grace: Duration,
}

impl Config {
    pub fn container_name(&self, slot_id: usize) -> String {
        format!("{}{}", self.container_prefix, slot_id)
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let slots = parse_slots(&cli.slots)?;
        if slots.is_empty() {
            bail!("at least one fleet slot is required");
        }
        Ok(Config {
            port: cli.port,
            slots,
            upstream_basic_auth: cli.upstream_basic_auth,
            mirror_url: cli.mirror_url,
            container_prefix: cli.container_prefix,
            session_timeout: Duration::from_secs(cli.session_timeout_secs),
            ws_presence_timeout: Duration::from_secs(cli.ws_presence_timeout_secs),
            assignment_grace: Duration::from_secs(cli.assignment_grace_secs),
        })
    }
}

fn parse_slots(raw: &str) -> Result<Vec<SlotConfig>> {
    let mut slots = Vec::new();
    for spec in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = spec.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .with_context(|| format!("slot spec `{spec}` is missing a host"))?
            .to_string();
        let http_port = parse_port(parts.next(), 6901, spec)?;
        let ws_port = parse_port(parts.next(), http_port, spec)?;
        let audio_port = parse_port(parts.next(), 4901, spec)?;
        slots.push(SlotConfig {
            host,
            http_port,
            ws_port,
            audio_port,
        });
    }
    Ok(slots)
}

fn parse_port(part: Option<&str>, default: u16, spec: &str) -> Result<u16> {
    match part {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid port `{value}` in slot spec `{spec}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_specs_parse_with_defaults() {
        let slots = parse_slots("10.0.0.1,10.0.0.2:7001,10.0.0.3:7001:7002:4903").unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].http_port, 6901);
        assert_eq!(slots[0].ws_port, 6901);
        assert_eq!(slots[0].audio_port, 4901);
        assert_eq!(slots[1].http_port, 7001);
        assert_eq!(slots[1].ws_port, 7001);
        assert_eq!(slots[2].ws_port, 7002);
        assert_eq!(slots[2].audio_port, 4903);
    }

    #[test]
    fn empty_and_invalid_specs_fail() {
        assert!(parse_slots(":6901").is_err());
        assert!(parse_slots("host:not-a-port").is_err());
        assert!(parse_slots("").unwrap().is_empty());
    }
}
