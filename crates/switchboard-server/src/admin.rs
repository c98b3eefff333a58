// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Admin hooks mounted under `/admin/*`.
//!
//! Read-only views plus the two durable operations the external admin UI
//! needs: force-resort and persist-endpoint-learning.  Durable admin
//! operations flush the config immediately rather than relying on the
//! write-behind throttle.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use switchboard_endpoint::resort;

use crate::AppState;

pub async fn list_endpoints(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let endpoints: Vec<serde_json::Value> = state
        .registry
        .get_all()
        .iter()
        .map(|ep| {
            let (total, success) = ep.counters();
            json!({
                "id": ep.id,
                "name": ep.name,
                "status": ep.status(),
                "enabled": ep.enabled(),
                "priority": ep.current_priority(),
                "original_priority": ep.config.priority,
                "tags": ep.tags(),
                "client_type": ep.config.client_type,
                "total_requests": total,
                "success_requests": success,
                "success_rate": ep.success_rate(),
                "last_response_time_ms": ep.last_response_time().as_millis() as u64,
                "blacklist_reason": ep.blacklist_reason(),
                "learned": ep.learned_snapshot(),
            })
        })
        .collect();
    Json(json!({ "endpoints": endpoints }))
}

pub async fn force_resort(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    resort(&state.registry);
    state.persister.mark_dirty();
    Json(json!({ "ok": true }))
}

pub async fn persist_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(ep) = state.registry.get(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": "unknown endpoint id" })),
        )
            .into_response();
    };
    state.registry.persist_endpoint(&ep);
    state.persister.flush_now();
    Json(json!({ "ok": true, "id": id })).into_response()
}

pub async fn conversion_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.dispatcher.adapters().stats();
    Json(serde_json::to_value(stats).unwrap_or(json!({})))
}

/// Deprecated: endpoint enable/disable moved into the config file.
pub async fn deprecated_stub(Path(id): Path<String>) -> Response {
    (
        StatusCode::GONE,
        Json(json!({
            "ok": false,
            "error": "deprecated endpoint; edit the config file instead",
            "id": id,
        })),
    )
        .into_response()
}
