//! WebSocket leg of the browser proxy: a validated client upgrade is piped
//! onto a fresh TCP connection to the slot's container, with the upgrade
//! handshake synthesized on the upstream side.

use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;
use tracing::{debug, warn};

use crate::proxy::BrowserRequest;
use crate::AppState;

pub fn tunnel(ws: WebSocketUpgrade, state: AppState, browser_req: BrowserRequest) -> Response {
    ws.on_upgrade(move |client| run_tunnel(client, state, browser_req))
}

async fn run_tunnel(mut client: WebSocket, state: AppState, browser_req: BrowserRequest) {
    let addr = format!(
        "{}:{}",
        browser_req.upstream.host, browser_req.upstream.ws_port
    );
    let path_and_query = format!(
        "{}{}",
        browser_req.rest,
        browser_req
            .query
            .as_deref()
            .map(|q| format!("?{q}"))
            .unwrap_or_default(),
    );

    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(slot = browser_req.slot_id, %addr, %err, "websocket upstream connect failed");
            let _ = client.send(ClientMessage::Close(None)).await;
            return;
        }
    };
    // Interactive traffic; coalescing frames costs latency on both legs.
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%err, "could not disable nagle on upstream socket");
    }

    let uri = format!("ws://{addr}{path_and_query}");
    let mut request = match uri.clone().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            warn!(%uri, %err, "invalid upstream websocket request");
            let _ = client.send(ClientMessage::Close(None)).await;
            return;
        }
    };
    if let Some(auth) = &state.auth_header {
        if let Ok(value) = auth.parse() {
            request
                .headers_mut()
                .insert(tokio_tungstenite::tungstenite::http::header::AUTHORIZATION, value);
        }
    }

    let (upstream, _response) = match tokio_tungstenite::client_async(request, stream).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(slot = browser_req.slot_id, %uri, %err, "upstream websocket handshake failed");
            let _ = client.send(ClientMessage::Close(None)).await;
            return;
        }
    };

    state.fleet.ws_connected(browser_req.slot_id);
    debug!(slot = browser_req.slot_id, %uri, "websocket tunnel established");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(converted) = client_to_upstream_message(message) else {
                continue;
            };
            if upstream_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(converted) = upstream_to_client_message(message) else {
                continue;
            };
            if client_tx.send(converted).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    // Either direction finishing tears the whole tunnel down.
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    state
        .fleet
        .ws_disconnected(browser_req.slot_id, Instant::now());
    debug!(slot = browser_req.slot_id, "websocket tunnel closed");
}

/// `None` means "nothing to forward" (raw frames); close frames are relayed
/// so each side sees the other's close reason before the streams end.
fn client_to_upstream_message(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text)),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data)),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data)),
        ClientMessage::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| {
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason,
            }
        }))),
    }
}

fn upstream_to_client_message(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text)),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        UpstreamMessage::Frame(_) => None,
    }
}
