// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP ingress: the client-facing surface of the proxy.
//!
//! Every LLM route funnels into one handler that buffers the body, hands
//! it to the dispatcher, and maps the outcome back to an axum response.
//! Streaming responses are served as `text/event-stream; charset=utf-8`
//! with frames forwarded as the dispatcher yields them.
//!
//! Admin routes under `/admin/*` expose the read-only hooks; the admin UI
//! itself lives elsewhere.

mod admin;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use switchboard_config::Persister;
use switchboard_core::Dispatcher;
use switchboard_endpoint::EndpointRegistry;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<EndpointRegistry>,
    pub persister: Arc<Persister>,
}

/// Serve until ctrl-c / SIGTERM.  The caller runs the final persister
/// flush after this returns.
pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = routes::router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(bind = %bind, "proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    Ok(())
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
