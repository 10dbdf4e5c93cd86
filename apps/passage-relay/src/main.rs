mod config;
mod fetch;
mod headers;
mod pages;
mod rewrite;
mod routes;
mod shim;

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Cli, Config};
use crate::routes::RelayState;

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

    info!("starting passage relay on port {}", config.port);
    match &config.public_origin {
        Some(origin) => info!("public origin pinned to {origin}"),
        None => info!("public origin derived per request from forwarding headers"),
    }
    if config.accept_invalid_certs {
        info!("upstream TLS verification disabled (accept-invalid-certs)");
    }

    let port = config.port;
    let state = match RelayState::new(config) {
        Ok(state) => state,
        Err(err) => {
            error!("failed to build upstream client: {err:#}");
            std::process::exit(1);
        }
    };

    // Periodic sweep of the per-client base map.
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            sweeper.sweep_client_bases();
        }
    });

    let app = Router::new()
        .fallback(routes::handle)
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
    info!("passage relay listening on {addr}");

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(err) = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
        std::process::exit(1);
    }
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
