//! The loopback control surface (C8): an axum HTTP + WebSocket server a
//! UI attaches to for live events, approvals, and history browsing.
//! Grounded on `original_source/proxy/controlserver.go`'s route table.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::ca::CertificateAuthority;
use crate::config::{Config, SharedConfig};
use crate::events::{parse_client_message, EventBus};
use crate::live_body::LiveBodies;
use crate::store::{BodyStore, Filter, FilterValue, MetadataStore};

#[derive(Clone)]
pub struct ControlState {
    pub config: SharedConfig,
    pub bus: EventBus,
    pub bodies: BodyStore,
    pub metadata: MetadataStore,
    pub live_bodies: LiveBodies,
    pub ca: Option<Arc<CertificateAuthority>>,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/config", get(get_config).post(post_config))
        .route("/requestsWS", get(requests_ws))
        .route("/request/:id", get(get_request))
        .route("/reqbody/:id", get(get_request_body))
        .route("/respbody/:id", get(get_response_body))
        .route("/setRequestStarred/:id", post(set_request_starred))
        .route("/filter", get(get_filter))
        .route("/requestsMatchingFilter", get(requests_matching_filter))
        .route("/", axum::routing::options(options_preflight))
        .with_state(Arc::new(state))
}

type AppState = State<Arc<ControlState>>;

async fn get_config(State(state): AppState) -> Json<Config> {
    Json(state.config.snapshot().await)
}

async fn post_config(State(state): AppState, Json(new_config): Json<Config>) -> StatusCode {
    let lifetime = new_config.certificate_lifetime;
    state.config.replace(new_config).await;
    if let Some(ca) = &state.ca {
        ca.set_lifetime_hours(lifetime).await;
    }
    StatusCode::OK
}

async fn requests_ws(
    State(state): AppState,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ControlState>) {
    let (mut sink, mut stream) = futures::StreamExt::split(socket);
    let mut subscription = state.bus.subscribe().await;

    let forward = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(event) = subscription.recv().await {
            if sink.send(Message::Text(event)).await.is_err() {
                break;
            }
        }
    });

    let bus = state.bus.clone();
    let receive = tokio::spawn(async move {
        use futures::StreamExt;
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                match parse_client_message(&text) {
                    Ok(parsed) => bus.dispatch(parsed).await,
                    Err(err) => tracing::warn!(error = %err, "malformed control-socket message"),
                }
            }
        }
    });

    let _ = tokio::join!(forward, receive);
}

async fn get_request(State(state): AppState, Path(id): Path<String>) -> Response {
    match state.metadata.get_by_id(&id).await {
        Ok(record) => Json(record).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Both body endpoints share a shape: look the body up by its
/// `{id}-req-body` / `{id}-resp-body` key and reply with a real
/// `Content-Length` header rather than the store's wire-format prefix.
async fn stream_stored_body(bodies: &BodyStore, key: &str) -> Response {
    let mut prefixed = Vec::new();
    match bodies.write_to(key, &mut prefixed).await {
        Ok(()) => {}
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    }
    let split_at = prefixed
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(0);
    let body = prefixed.split_off(split_at);
    let content_length = body.len();
    let mut response = body.into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    response
}

async fn get_request_body(State(state): AppState, Path(id): Path<String>) -> Response {
    if let Some(bytes) = state.live_bodies.get(&id).await {
        return body_response(bytes);
    }
    stream_stored_body(&state.bodies, &format!("{id}-req-body")).await
}

/// Serves a body already held in memory for a request still paused in
/// an approval wait, with the same real `Content-Length` header
/// `stream_stored_body` attaches for persisted bodies.
fn body_response(body: Vec<u8>) -> Response {
    let content_length = body.len();
    let mut response = body.into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    response
}

async fn get_response_body(State(state): AppState, Path(id): Path<String>) -> Response {
    stream_stored_body(&state.bodies, &format!("{id}-resp-body")).await
}

#[derive(serde::Deserialize)]
struct StarredQuery {
    starred: bool,
}

async fn set_request_starred(
    State(state): AppState,
    Path(id): Path<String>,
    Query(query): Query<StarredQuery>,
) -> StatusCode {
    match state.metadata.set_starred(&id, query.starred).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[derive(Serialize)]
struct FilterField {
    field: &'static str,
    values: Vec<(String, i64)>,
}

async fn get_filter(State(state): AppState) -> Json<Vec<FilterField>> {
    let mut out = Vec::new();
    for field in crate::store::fields_with_unique_values() {
        if let Ok(values) = state.metadata.unique_values(field).await {
            out.push(FilterField { field, values });
        }
    }
    Json(out)
}

async fn requests_matching_filter(
    State(state): AppState,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);

    let mut filter = Filter::new();
    for field in crate::store::filterable_fields() {
        if let Some(value) = params.get(*field) {
            filter.push(field, coerce_filter_value(value));
        }
    }

    match state.metadata.find(filter, offset, limit).await {
        Ok((requests, total)) => Json(json!({ "requests": requests, "total": total })).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn coerce_filter_value(raw: &str) -> FilterValue {
    if let Ok(b) = raw.parse::<bool>() {
        FilterValue::Boolean(b)
    } else if let Ok(n) = raw.parse::<i64>() {
        FilterValue::Number(n)
    } else {
        FilterValue::Text(raw.to_string())
    }
}

async fn options_preflight(State(state): AppState) -> Response {
    let config = state.config.snapshot().await;
    let mut response = StatusCode::NO_CONTENT.into_response();
    if config.debug {
        let headers = response.headers_mut();
        headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        );
    }
    response
}
