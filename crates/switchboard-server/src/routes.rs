// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::{FutureExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::error;

use switchboard_core::{error_body, ErrorKind, InboundRequest, Outbound};
use switchboard_wire::Dialect;

use crate::{admin, AppState};

/// Request bodies above this are refused outright.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Minimal path → dialect mapping used only to shape errors when the
/// dispatcher itself is unreachable (panic recovery, oversize bodies).
fn dialect_for_path(path: &str) -> Dialect {
    if path.ends_with("/messages") || path.ends_with("/count_tokens") {
        Dialect::Anthropic
    } else if path.ends_with("/responses") {
        Dialect::OpenaiResponses
    } else if path.contains("/v1beta/models/") {
        Dialect::Gemini
    } else {
        Dialect::OpenaiChat
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Anthropic surface
        .route("/v1/messages", post(proxy))
        .route("/v1/messages/count_tokens", post(proxy))
        // OpenAI surface
        .route("/v1/chat/completions", post(proxy))
        .route("/v1/responses", post(proxy))
        .route("/v1/completions", post(proxy))
        // Gemini surface: the last segment carries model:action.
        .route("/v1beta/models/:model_action", post(proxy))
        // Admin hooks (read-only; the UI is an external collaborator)
        .route("/admin/endpoints", get(admin::list_endpoints))
        .route("/admin/resort", post(admin::force_resort))
        .route("/admin/endpoints/:id/persist", post(admin::persist_endpoint))
        .route("/admin/conversion", get(admin::conversion_stats))
        // Deprecated management stubs kept for old admin UI builds.
        .route("/admin/endpoints/:id/enable", post(admin::deprecated_stub))
        .route("/admin/endpoints/:id/disable", post(admin::deprecated_stub))
        // Request ids propagate to upstream logs; CORS is permissive — the
        // proxy runs behind a trusted boundary.
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or("").to_string();

    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(b) => b,
        Err(_) => {
            let shape = error_body(
                dialect_for_path(&path),
                413,
                ErrorKind::Business,
                "request body too large",
            );
            return (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(shape)).into_response();
        }
    };

    let inbound = InboundRequest {
        method: method.to_string(),
        path: path.clone(),
        query,
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        body: bytes.to_vec(),
    };

    // Panics anywhere below the dispatcher boundary become a plain 500 in
    // the client's dialect; the endpoint is never blacklisted for them.
    let dispatcher = state.dispatcher.clone();
    let outcome = std::panic::AssertUnwindSafe(async move { dispatcher.handle(inbound).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Outbound::Json { status, body }) => {
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, axum::Json(body)).into_response()
        }
        Ok(Outbound::Stream(frames)) => {
            let body = Body::from_stream(frames.map(Ok::<_, Infallible>));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(panic) => {
            error!(path = %path, "dispatcher panicked: {panic:?}");
            let shape = error_body(
                dialect_for_path(&path),
                500,
                ErrorKind::Internal,
                "internal server error",
            );
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(shape)).into_response()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::dialect_for_path;
    use switchboard_wire::Dialect;

    #[test]
    fn error_shape_dialect_follows_path() {
        assert_eq!(dialect_for_path("/v1/messages"), Dialect::Anthropic);
        assert_eq!(dialect_for_path("/v1/messages/count_tokens"), Dialect::Anthropic);
        assert_eq!(dialect_for_path("/v1/responses"), Dialect::OpenaiResponses);
        assert_eq!(dialect_for_path("/v1/chat/completions"), Dialect::OpenaiChat);
        assert_eq!(
            dialect_for_path("/v1beta/models/gemini-2.0-flash:generateContent"),
            Dialect::Gemini
        );
    }
}
