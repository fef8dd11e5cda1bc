use crate::AppState;
use crate::precache::{FetchRequest, FetchResponse, PrecacheError, RequestMode, ResponseSource};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Largest request body forwarded to the network
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024; // 10MB limit

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/__precache/message", post(handle_message))
        .route("/__precache/update", post(handle_update))
        .route("/__precache/status", get(handle_status))
        // Control endpoints only; proxied responses go out untouched
        .route_layer(CorsLayer::permissive())
        .fallback(handle_fetch)
        .with_state(state)
}

async fn handle_message(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    // Malformed messages are ignored like unknown ones
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Ignoring malformed control message: {}", e);
            return StatusCode::ACCEPTED.into_response();
        }
    };

    match state.registry.post_message(&payload).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!("❌ Control message failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Control message failed: {}", e)).into_response()
        }
    }
}

async fn handle_update(State(state): State<AppState>) -> impl IntoResponse {
    info!("📡 Received POST /__precache/update");

    let worker = match state.load_worker().await {
        Ok(worker) => worker,
        Err(e) => {
            error!("❌ Failed to load manifest: {}", e);
            return (StatusCode::UNPROCESSABLE_ENTITY, format!("Failed to load manifest: {}", e)).into_response();
        }
    };

    match state.registry.register(worker).await {
        Ok(report) => json_response(StatusCode::OK, &report),
        Err(e) => {
            error!("❌ Update failed: {}", e);
            (StatusCode::BAD_GATEWAY, format!("Install failed: {}", e)).into_response()
        }
    }
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    json_response(StatusCode::OK, &state.registry.status())
}

async fn handle_fetch(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    // Only path and query come from the client; scheme and host are always the origin's
    let mut url = state.config.origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body.to_vec(),
        Err(e) => {
            warn!("Failed to read request body for {}: {}", url, e);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let fetch_request = FetchRequest {
        mode: RequestMode::from_headers(&parts.method, &parts.headers),
        method: parts.method,
        url,
        headers: parts.headers,
        body,
    };

    match state.registry.fetch(&fetch_request).await {
        Ok(response) => into_response(response),
        Err(PrecacheError::Fetch { url, reason }) => {
            warn!("Network request for {} failed: {}", url, reason);
            (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
        }
        Err(e) => {
            error!("❌ Failed to handle {}: {}", fetch_request.url, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to handle request").into_response()
        }
    }
}

fn into_response(response: FetchResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
        if response.source == ResponseSource::Precache {
            headers.insert("x-precache", HeaderValue::from_static("hit"));
        }
    }

    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(json) => (status, [(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(e) => {
            error!("Failed to encode JSON response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
