//! JSON control plane: status, session lookup, assignment, heartbeat,
//! release. `browserUrl` values are absolute and respect the forwarding
//! headers an upstream edge sets.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use passage_core::{forwarded, identity};

use crate::fleet::{unix_now, Assignment, FleetError};
use crate::AppState;

pub const RETRY_AFTER_SECONDS: u64 = 30;

#[derive(Debug, Serialize)]
pub struct StatusBrowser {
    pub id: usize,
    pub available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub browsers: Vec<StatusBrowser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSessionQuery {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSessionResponse {
    pub has_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_age: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBrowserRequest {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBrowserResponse {
    pub success: bool,
    pub session_id: Uuid,
    pub browser_url: String,
    pub browser_id: usize,
    pub existing: bool,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub browser_id: Option<usize>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub browser_id: Option<usize>,
}

/// GET /api/status - fleet occupancy overview.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.fleet.status();
    Json(StatusResponse {
        total: status.total,
        available: status.available,
        in_use: status.in_use,
        browsers: status
            .browsers
            .into_iter()
            .map(|(id, available)| StatusBrowser { id, available })
            .collect(),
    })
}

/// GET /api/check-session - does this client already hold a slot?
pub async fn check_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<CheckSessionQuery>,
) -> Json<CheckSessionResponse> {
    let client_id = effective_client_id(query.client_id, &addr, &headers);
    match state.fleet.check(&client_id, Instant::now()) {
        Some(assignment) => Json(CheckSessionResponse {
            has_session: true,
            browser_id: Some(assignment.slot_id),
            browser_url: Some(browser_url(&headers, &assignment)),
            session_age: Some(assignment.session_age.as_secs()),
        }),
        None => Json(CheckSessionResponse {
            has_session: false,
            browser_id: None,
            browser_url: None,
            session_age: None,
        }),
    }
}

/// POST /api/request-browser - claim a slot (or rotate the URL token of an
/// existing one).
pub async fn request_browser(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Option<Json<RequestBrowserRequest>>,
) -> Response {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let client_id = effective_client_id(payload.client_id, &addr, &headers);

    let assignment = match state.fleet.request(&client_id, Instant::now()) {
        Ok(assignment) => assignment,
        Err(FleetError::AllSlotsBusy { in_use, total }) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "success": false,
                    "error": "all_browsers_in_use",
                    "inUse": in_use,
                    "total": total,
                    "retryAfterSeconds": RETRY_AFTER_SECONDS,
                })),
            )
                .into_response();
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": err.to_string() })),
            )
                .into_response();
        }
    };

    if !assignment.existing {
        state.mirror_slot(assignment.slot_id).await;
        state.mirror_summary().await;
    }

    debug!(client = %client_id, slot = assignment.slot_id, existing = assignment.existing, "browser requested");
    Json(RequestBrowserResponse {
        success: true,
        session_id: assignment.session_id,
        browser_url: browser_url(&headers, &assignment),
        browser_id: assignment.slot_id,
        existing: assignment.existing,
        message: if assignment.existing {
            "existing session".to_string()
        } else {
            "browser assigned".to_string()
        },
    })
    .into_response()
}

/// POST /api/heartbeat - keep a session alive.
pub async fn heartbeat(
    State(state): State<AppState>,
    payload: Option<Json<HeartbeatRequest>>,
) -> Response {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let now = Instant::now();

    let result = if let Some(slot_id) = payload.browser_id {
        state.fleet.heartbeat_slot(slot_id, now).map(|due| (slot_id, due))
    } else if let Some(session_id) = payload.session_id {
        state.fleet.heartbeat_session(session_id, now)
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "browserId or sessionId required" })),
        )
            .into_response();
    };

    match result {
        Ok((slot_id, mirror_due)) => {
            if mirror_due && slot_id > 0 {
                state.mirror_slot(slot_id).await;
            }
            Json(json!({ "success": true })).into_response()
        }
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "no such session" })),
        )
            .into_response(),
    }
}

/// POST /api/release - tear down a session by client or slot.
pub async fn release(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Option<Json<ReleaseRequest>>,
) -> Response {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();

    let snapshot = if let Some(slot_id) = payload.browser_id {
        state.fleet.release_slot(slot_id)
    } else {
        let client_id = effective_client_id(payload.client_id, &addr, &headers);
        state.fleet.release_client(&client_id)
    };

    match snapshot {
        Some(snapshot) => {
            if let Some(mirror) = &state.mirror {
                mirror.write_slot(&snapshot).await;
                mirror.write_summary(&state.fleet.status(), unix_now()).await;
            }
            Json(json!({ "success": true })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "no such session" })),
        )
            .into_response(),
    }
}

/// Clients that do not name themselves are identified by source address and
/// User-Agent prefix, so single-session discipline holds behind CDNs too.
pub fn effective_client_id(
    supplied: Option<String>,
    addr: &SocketAddr,
    headers: &HeaderMap,
) -> String {
    if let Some(client_id) = supplied.filter(|c| !c.trim().is_empty()) {
        return client_id;
    }
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let remote = forwarded_for.unwrap_or_else(|| addr.to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    identity::derive_client_id(&remote, user_agent)
}

fn browser_url(headers: &HeaderMap, assignment: &Assignment) -> String {
    let origin = forwarded::public_origin(
        headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()),
        headers.get("x-forwarded-host").and_then(|v| v.to_str().ok()),
        headers.get(header::HOST).and_then(|v| v.to_str().ok()),
    );
    format!(
        "{origin}/browser/{}/?token={}",
        assignment.slot_id, assignment.url_token
    )
}
