mod api;
mod audio;
mod config;
mod fleet;
mod mirror;
mod pages;
mod proxy;
mod reaper;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{Html, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::AudioRegistry;
use crate::config::{Cli, Config};
use crate::fleet::{unix_now, FleetStore};
use crate::mirror::StateMirror;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetStore>,
    pub mirror: Option<StateMirror>,
    pub config: Arc<Config>,
    pub audio: Arc<AudioRegistry>,
    pub http: reqwest::Client,
    /// Pre-rendered `Basic …` header for the upstream containers.
    pub auth_header: Option<String>,
}

impl AppState {
    pub async fn mirror_slot(&self, slot_id: usize) {
        if let (Some(mirror), Some(snapshot)) = (&self.mirror, self.fleet.slot_snapshot(slot_id)) {
            mirror.write_slot(&snapshot).await;
        }
    }

    pub async fn mirror_summary(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.write_summary(&self.fleet.status(), unix_now()).await;
        }
    }
}

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match Config::try_from(cli) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    info!(
        "starting passage fleet on port {} with {} slot(s)",
        config.port,
        config.slots.len()
    );
    info!(
        "session timeout {}s, ws presence timeout {}s, assignment grace {}s",
        config.session_timeout.as_secs(),
        config.ws_presence_timeout.as_secs(),
        config.assignment_grace.as_secs()
    );

    let fleet = Arc::new(FleetStore::new(&config));

    let mirror = match &config.mirror_url {
        Some(url) => match StateMirror::connect(url).await {
            Ok(mirror) => {
                info!("state mirror connected");
                Some(mirror)
            }
            Err(err) => {
                // The mirror is best-effort durability; the broker still runs.
                warn!("state mirror unavailable, continuing in-memory: {err:#}");
                None
            }
        },
        None => {
            info!("no state mirror configured; sessions will not survive restarts");
            None
        }
    };

    if let Some(mirror) = &mirror {
        restore_from_mirror(&fleet, mirror, &config).await;
    }

    let http = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!("failed to build proxy http client: {err}");
            std::process::exit(1);
        }
    };

    let auth_header = config.upstream_basic_auth.as_ref().map(|credentials| {
        format!("Basic {}", BASE64_STANDARD.encode(credentials.as_bytes()))
    });

    let port = config.port;
    let state = AppState {
        fleet,
        mirror,
        config: Arc::new(config),
        audio: Arc::new(AudioRegistry::default()),
        http,
        auth_header,
    };

    reaper::spawn(state.clone());

    let api_routes = Router::new()
        .route("/api/status", get(api::status))
        .route("/api/check-session", get(api::check_session))
        .route("/api/request-browser", post(api::request_browser))
        .route("/api/heartbeat", post(api::heartbeat))
        .route("/api/release", post(api::release))
        .layer(axum::middleware::from_fn(no_store));

    let app = Router::new()
        .route("/", get(landing))
        .merge(api_routes)
        .fallback(proxy::browser_entry)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("passage fleet listening on {addr}");

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(err) = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
        std::process::exit(1);
    }
}

async fn landing() -> Html<&'static str> {
    Html(pages::LANDING_PAGE)
}

/// Control-plane responses must never be cached.
async fn no_store(req: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Resume slots whose mirrored heartbeat is still inside the session window;
/// stale entries are tombstoned back to free.
async fn restore_from_mirror(fleet: &Arc<FleetStore>, mirror: &StateMirror, config: &Config) {
    let entries = mirror.read_all(fleet.total_slots()).await;
    let window = config.session_timeout.as_secs();
    let now = Instant::now();
    let mut restored = 0usize;

    for (slot_id, entry) in entries {
        if !entry.in_use {
            continue;
        }
        let age = unix_now().saturating_sub(entry.last_heartbeat);
        if age <= window {
            let client_id = entry
                .client_id
                .clone()
                .unwrap_or_else(|| format!("restored-{slot_id}"));
            let session_id = entry
                .session_id
                .as_deref()
                .and_then(|raw| Uuid::parse_str(raw).ok());
            if fleet.restore(slot_id, client_id, session_id, entry.last_heartbeat, now) {
                info!(slot = slot_id, age, "restored session from mirror");
                restored += 1;
            }
        } else {
            info!(slot = slot_id, age, "mirrored session is stale, tombstoning");
            if let Some(snapshot) = fleet.slot_snapshot(slot_id) {
                mirror.write_slot(&snapshot).await;
            }
        }
    }

    if restored > 0 {
        info!(restored, "mirror restore complete");
    }
    mirror.write_summary(&fleet.status(), unix_now()).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
